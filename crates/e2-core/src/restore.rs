//! Best-effort undelete.
//!
//! A deleted entry can only come back while its record still sits, intact,
//! directly after a live record that absorbed it, and while neither its
//! inode nor any of its blocks has been handed out again. Restoring a
//! directory brings back the directory itself, not its former children.

use crate::path::{self, EntryFilter, Resolved};
use crate::{Ext2Fs, ensure_operable};
use e2_alloc::{BlockRefs, bit_at, block_refs, mark_blocks, set_bit};
use e2_dir::{HiddenSlot, conceal_hidden, expose_hidden, find_hidden};
use e2_error::{E2Error, Result};
use e2_image::Image;
use e2_ondisk::Ext2Inode;
use e2_types::{BitmapKind, BlockNumber, InodeNumber};
use tracing::{debug, info};

impl Ext2Fs {
    /// Bring back the deleted entry at `path`; directories need `recursive`.
    pub fn restore(&mut self, path: &str, recursive: bool) -> Result<InodeNumber> {
        let Some(name) = path::file_name(path)? else {
            return Err(E2Error::Exists);
        };
        ensure_operable(name)?;
        let parent = match self.resolve(path, EntryFilter::Any)?.require_parent(path)? {
            Resolved::ParentOnly { parent } => parent,
            Resolved::Found { .. } => return Err(E2Error::Exists),
            Resolved::Missing(_) => return Err(E2Error::NotFound(path.to_owned())),
        };

        let image = &mut self.image;
        let Some(slot) = find_hidden(image, parent, name)? else {
            return Err(E2Error::NotFound(path.to_owned()));
        };

        expose_hidden(image, &slot)?;
        let (ino, mut inode, refs) = match check_candidate(image, &slot, recursive) {
            Ok(candidate) => candidate,
            Err(e) => {
                conceal_hidden(image, &slot)?;
                debug!(target: "e2::core", path, error = %e, "restore rolled back");
                return Err(e);
            }
        };

        set_bit(image, BitmapKind::Inode, ino.0, true)?;
        inode.dtime = 0;
        inode.links_count = inode.links_count.saturating_add(1);
        image.write_inode(ino, &inode)?;
        let blocks = mark_blocks(image, &refs, true)?;

        if inode.is_dir() {
            let mut gd = image.group_desc()?;
            gd.used_dirs_count = gd.used_dirs_count.saturating_add(1);
            image.write_group_desc(&gd)?;
            let mut parent_inode = image.inode(parent)?;
            parent_inode.links_count = parent_inode.links_count.saturating_add(1);
            image.write_inode(parent, &parent_inode)?;
        }

        info!(target: "e2::core", path, ino = ino.0, blocks, "restored");
        Ok(ino)
    }
}

/// Decide whether the exposed record can be brought back.
fn check_candidate(
    image: &Image,
    slot: &HiddenSlot,
    recursive: bool,
) -> Result<(InodeNumber, Ext2Inode, BlockRefs)> {
    let geometry = image.geometry();
    let ino = InodeNumber(slot.record.inode);
    if ino.0 < geometry.first_ino || !geometry.contains_inode(ino) {
        return Err(E2Error::NotFound(format!("inode {ino}")));
    }
    if bit_at(image, BitmapKind::Inode, ino.0)? {
        return Err(E2Error::NotRecoverable(format!("inode {ino} has been reused")));
    }

    let inode = image.inode(ino)?;
    let pointers = inode
        .direct_blocks()
        .chain(inode.indirect_block())
        .collect::<Vec<_>>();
    ensure_blocks_free(image, ino, &pointers)?;
    // The indirect block is free, so its entries are the ones written at
    // allocation time.
    let refs = block_refs(image, &inode)
        .map_err(|e| E2Error::NotRecoverable(format!("inode {ino}: {e}")))?;
    ensure_blocks_free(image, ino, &refs.indirect_entries)?;

    if inode.is_dir() && !recursive {
        return Err(E2Error::IsDirectory);
    }
    Ok((ino, inode, refs))
}

fn ensure_blocks_free(image: &Image, ino: InodeNumber, blocks: &[BlockNumber]) -> Result<()> {
    for block in blocks {
        if !image.geometry().contains_block(*block) {
            return Err(E2Error::NotRecoverable(format!(
                "inode {ino} points at block {block} outside the image"
            )));
        }
        if bit_at(image, BitmapKind::Block, block.0)? {
            return Err(E2Error::NotRecoverable(format!(
                "block {block} of inode {ino} has been reused"
            )));
        }
    }
    Ok(())
}
