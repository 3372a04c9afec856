//! Operations that add entries: mkdir, copy-in and links.

use crate::path::{self, EntryFilter, Resolved};
use crate::{Ext2Fs, ensure_operable};
use e2_alloc::{block_refs, blocks_needed, count_free, create_inode};
use e2_dir::{dir_blocks, insert, needs_new_block, validate_name};
use e2_error::{E2Error, Result};
use e2_image::Image;
use e2_ondisk::Ext2FileType;
use e2_types::{BitmapKind, EXT2_NDIR_BLOCKS, InodeNumber, blocks_for_bytes};
use tracing::info;

/// Resolve the directory a new entry for `path` goes into.
///
/// Fails if the name is "." or "..", too long, already present, or if the
/// parent cannot be reached. `/` always exists.
fn new_entry_slot<'p>(image: &Image, path: &'p str) -> Result<(InodeNumber, &'p [u8])> {
    let Some(name) = path::file_name(path)? else {
        return Err(E2Error::Exists);
    };
    ensure_operable(name)?;
    validate_name(name)?;
    match path::resolve(image, path, EntryFilter::Any)?.require_parent(path)? {
        Resolved::Found { .. } => Err(E2Error::Exists),
        Resolved::ParentOnly { parent } => Ok((parent, name)),
        Resolved::Missing(_) => Err(E2Error::NotFound(path.to_owned())),
    }
}

/// Blocks (data plus indirect) a `len`-byte file needs, or `FileTooLarge`.
fn file_blocks(image: &Image, len: usize) -> Result<(u32, u32)> {
    let too_large = || E2Error::FileTooLarge(u64::try_from(len).unwrap_or(u64::MAX));
    let size = u32::try_from(len).map_err(|_| too_large())?;
    let geometry = image.geometry();
    if blocks_for_bytes(size, geometry.block_size) > geometry.max_file_blocks() {
        return Err(too_large());
    }
    Ok((size, blocks_needed(size, geometry.block_size)))
}

/// Fail with `NoSpace` unless `inodes` inodes and `blocks` blocks are free,
/// counting the block `parent` may need to hold a `name_len`-byte entry.
fn ensure_room(
    image: &Image,
    parent: InodeNumber,
    name_len: usize,
    inodes: u32,
    blocks: u32,
) -> Result<()> {
    let grows = needs_new_block(image, parent, name_len)?;
    if grows && dir_blocks(image, parent)?.len() >= EXT2_NDIR_BLOCKS {
        return Err(E2Error::NoSpace);
    }
    let blocks = blocks + u32::from(grows);
    if count_free(image, BitmapKind::Inode)? < inodes
        || count_free(image, BitmapKind::Block)? < blocks
    {
        return Err(E2Error::NoSpace);
    }
    Ok(())
}

/// Copy `data` into the freshly allocated blocks of `ino`, in file order.
fn write_data(image: &mut Image, ino: InodeNumber, data: &[u8]) -> Result<()> {
    let inode = image.inode(ino)?;
    let refs = block_refs(image, &inode)?;
    let block_size = image.geometry().block_size as usize;
    for (chunk, block) in data.chunks(block_size).zip(refs.data_blocks()) {
        image.block_mut(block)?[..chunk.len()].copy_from_slice(chunk);
    }
    Ok(())
}

impl Ext2Fs {
    /// Create an empty directory at `path`.
    pub fn mkdir(&mut self, path: &str) -> Result<InodeNumber> {
        let (parent, name) = new_entry_slot(&self.image, path)?;
        ensure_room(&self.image, parent, name.len(), 1, 1)?;

        let now = self.now();
        let image = &mut self.image;
        let ino = create_inode(image, Ext2FileType::Dir, 0, now)?;
        insert(image, parent, ino, name, Ext2FileType::Dir)?;
        insert(image, ino, ino, b".", Ext2FileType::Dir)?;
        insert(image, ino, parent, b"..", Ext2FileType::Dir)?;
        info!(target: "e2::core", path, ino = ino.0, "created directory");
        Ok(ino)
    }

    /// Create a regular file at `path` holding `data`.
    pub fn copy_in(&mut self, path: &str, data: &[u8]) -> Result<InodeNumber> {
        let (parent, name) = new_entry_slot(&self.image, path)?;
        let (size, blocks) = file_blocks(&self.image, data.len())?;
        ensure_room(&self.image, parent, name.len(), 1, blocks)?;

        let now = self.now();
        let image = &mut self.image;
        let ino = create_inode(image, Ext2FileType::RegFile, size, now)?;
        write_data(image, ino, data)?;
        insert(image, parent, ino, name, Ext2FileType::RegFile)?;
        info!(target: "e2::core", path, ino = ino.0, size, "copied file in");
        Ok(ino)
    }

    /// Link `link_path` to the existing `target`.
    ///
    /// A hard link shares the target's inode and carries its type;
    /// directories cannot be hard linked. A symbolic link is a new inode
    /// whose data is `target` itself.
    pub fn link(&mut self, target: &str, link_path: &str, symbolic: bool) -> Result<InodeNumber> {
        let Resolved::Found {
            target: target_ino, ..
        } = self.resolve(target, EntryFilter::Any)?.require_parent(target)?
        else {
            return Err(E2Error::NotFound(target.to_owned()));
        };
        let (parent, name) = new_entry_slot(&self.image, link_path)?;
        let now = self.now();

        if symbolic {
            let (size, blocks) = file_blocks(&self.image, target.len())?;
            ensure_room(&self.image, parent, name.len(), 1, blocks)?;
            let image = &mut self.image;
            let ino = create_inode(image, Ext2FileType::Symlink, size, now)?;
            write_data(image, ino, target.as_bytes())?;
            insert(image, parent, ino, name, Ext2FileType::Symlink)?;
            info!(
                target: "e2::core",
                source = target,
                link = link_path,
                ino = ino.0,
                "created symlink"
            );
            return Ok(ino);
        }

        let inode = self.image.inode(target_ino)?;
        if inode.is_dir() {
            return Err(E2Error::IsDirectory);
        }
        ensure_room(&self.image, parent, name.len(), 0, 0)?;
        let image = &mut self.image;
        insert(image, parent, target_ino, name, inode.file_type())?;
        let mut inode = image.inode(target_ino)?;
        inode.links_count = inode.links_count.saturating_add(1);
        inode.ctime = now;
        image.write_inode(target_ino, &inode)?;
        info!(
            target: "e2::core",
            source = target,
            link = link_path,
            ino = target_ino.0,
            links = inode.links_count,
            "created hard link"
        );
        Ok(target_ino)
    }
}
