#![forbid(unsafe_code)]
//! Directory operations.
//!
//! Linear record scans over a directory's direct blocks, record insertion
//! with block growth, removal by absorption into the preceding record, and
//! the hidden-record lookup used by undelete. Directories never use the
//! indirect block.

pub mod block;

pub use block::{HiddenRecord, RecordCursor, check_chain};

use e2_alloc::{allocate, init_empty_dir_block};
use e2_error::{E2Error, Result};
use e2_image::{Image, corruption_at};
use e2_ondisk::{Ext2DirEntry, Ext2FileType, Ext2Inode};
use e2_types::{
    BitmapKind, BlockNumber, EXT2_NAME_LEN, EXT2_NDIR_BLOCKS, InodeNumber, SECTOR_SIZE,
};
use tracing::{debug, trace};

/// A live record together with where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub block: BlockNumber,
    pub offset: usize,
    pub entry: Ext2DirEntry,
}

/// A hidden record located inside one of a directory's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiddenSlot {
    pub block: BlockNumber,
    pub record: HiddenRecord,
}

/// Reject names that cannot be stored as a single record.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(E2Error::Format(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.len() > EXT2_NAME_LEN {
        return Err(E2Error::NameTooLong);
    }
    if name.iter().any(|b| *b == b'/' || *b == 0) {
        return Err(E2Error::Format(
            "directory entry name contains '/' or NUL".to_owned(),
        ));
    }
    Ok(())
}

fn dir_inode(image: &Image, dir: InodeNumber) -> Result<Ext2Inode> {
    let inode = image.inode(dir)?;
    if !inode.is_dir() {
        return Err(E2Error::NotDirectory);
    }
    Ok(inode)
}

/// The directory's data blocks, in pointer order.
pub fn dir_blocks(image: &Image, dir: InodeNumber) -> Result<Vec<BlockNumber>> {
    let inode = dir_inode(image, dir)?;
    let geometry = image.geometry();
    inode
        .direct_blocks()
        .map(|block| {
            if geometry.contains_block(block) {
                Ok(block)
            } else {
                Err(E2Error::corruption(
                    block.0,
                    format!("directory {dir} points outside the image"),
                ))
            }
        })
        .collect()
}

/// Every live record of `dir`, "." and ".." included.
pub fn records(image: &Image, dir: InodeNumber) -> Result<Vec<DirRecord>> {
    let mut out = Vec::new();
    for block in dir_blocks(image, dir)? {
        let data = image.block(block)?;
        for item in RecordCursor::new(data) {
            let (offset, record) = item.map_err(|e| corruption_at(block, &e))?;
            if record.is_empty() {
                continue;
            }
            out.push(DirRecord {
                block,
                offset,
                entry: record.to_owned(),
            });
        }
    }
    Ok(out)
}

/// Live entries of `dir`.
pub fn list(image: &Image, dir: InodeNumber) -> Result<Vec<Ext2DirEntry>> {
    Ok(records(image, dir)?
        .into_iter()
        .map(|record| record.entry)
        .collect())
}

/// Find the live record named `name` in `dir`.
pub fn lookup(image: &Image, dir: InodeNumber, name: &[u8]) -> Result<Option<DirRecord>> {
    for block in dir_blocks(image, dir)? {
        let data = image.block(block)?;
        if let Some((offset, record)) =
            block::find(data, name).map_err(|e| corruption_at(block, &e))?
        {
            return Ok(Some(DirRecord {
                block,
                offset,
                entry: record.to_owned(),
            }));
        }
    }
    Ok(None)
}

/// Whether inserting a `name_len`-byte name into `dir` would need a new block.
pub fn needs_new_block(image: &Image, dir: InodeNumber, name_len: usize) -> Result<bool> {
    let Some(last) = dir_blocks(image, dir)?.last().copied() else {
        return Ok(true);
    };
    let data = image.block(last)?;
    Ok(!block::has_room(data, name_len).map_err(|e| corruption_at(last, &e))?)
}

/// Add an entry `name -> child` of type `file_type` to `parent`.
///
/// Only the final record of the last block is considered; when its slack is
/// too small a new block is appended to the directory. A directory entry
/// raises `parent`'s link count. The caller is responsible for rejecting
/// duplicates.
pub fn insert(
    image: &mut Image,
    parent: InodeNumber,
    child: InodeNumber,
    name: &[u8],
    file_type: Ext2FileType,
) -> Result<()> {
    validate_name(name)?;
    let mut inode = dir_inode(image, parent)?;
    let blocks = dir_blocks(image, parent)?;

    let mut target = None;
    if let Some(last) = blocks.last().copied() {
        let data = image.block_mut(last)?;
        if let Some(offset) =
            block::append(data, child.0, name, file_type).map_err(|e| corruption_at(last, &e))?
        {
            target = Some((last, offset));
        }
    }

    let (block, offset) = match target {
        Some(found) => found,
        None => {
            let grown = grow(image, parent, &mut inode, blocks.len())?;
            let data = image.block_mut(grown)?;
            let offset = block::append(data, child.0, name, file_type)
                .map_err(|e| corruption_at(grown, &e))?
                .ok_or_else(|| E2Error::corruption(grown.0, "fresh directory block is full"))?;
            (grown, offset)
        }
    };

    if file_type == Ext2FileType::Dir {
        inode.links_count = inode.links_count.saturating_add(1);
    }
    image.write_inode(parent, &inode)?;
    debug!(
        target: "e2::dir",
        parent = parent.0,
        child = child.0,
        name = %String::from_utf8_lossy(name),
        block = block.0,
        offset,
        "inserted entry"
    );
    Ok(())
}

/// Append one empty block to `parent`, updating its size and sector count.
fn grow(
    image: &mut Image,
    parent: InodeNumber,
    inode: &mut Ext2Inode,
    used: usize,
) -> Result<BlockNumber> {
    if used >= EXT2_NDIR_BLOCKS {
        return Err(E2Error::NoSpace);
    }
    let block_size = image.geometry().block_size;
    let block = BlockNumber(allocate(image, BitmapKind::Block)?);
    init_empty_dir_block(image, block)?;
    inode.block[used] = block.0;
    inode.size = inode.size.saturating_add(block_size);
    inode.blocks = inode.blocks.saturating_add(block_size / SECTOR_SIZE);
    debug!(target: "e2::dir", dir = parent.0, block = block.0, "directory grew");
    Ok(block)
}

/// Detach the entry `name` from `parent` and return what it pointed at.
///
/// The record is absorbed into its predecessor; link counts are the
/// caller's business.
pub fn remove(image: &mut Image, parent: InodeNumber, name: &[u8]) -> Result<Ext2DirEntry> {
    for block in dir_blocks(image, parent)? {
        let data = image.block_mut(block)?;
        let Some(absorbed) = block::absorb(data, name).map_err(|e| corruption_at(block, &e))?
        else {
            continue;
        };
        debug!(
            target: "e2::dir",
            parent = parent.0,
            child = absorbed.inode,
            name = %String::from_utf8_lossy(name),
            block = block.0,
            offset = absorbed.offset,
            "removed entry"
        );
        let name_len = u8::try_from(name.len()).map_err(|_| E2Error::NameTooLong)?;
        return Ok(Ext2DirEntry {
            inode: absorbed.inode,
            rec_len: 0,
            name_len,
            file_type: absorbed.file_type,
            name: name.to_vec(),
        });
    }
    Err(E2Error::NotFound(String::from_utf8_lossy(name).into_owned()))
}

/// Find a deleted record named `name` still hidden in `parent`'s blocks.
pub fn find_hidden(image: &Image, parent: InodeNumber, name: &[u8]) -> Result<Option<HiddenSlot>> {
    for block in dir_blocks(image, parent)? {
        let data = image.block(block)?;
        if let Some(record) =
            block::find_hidden(data, name).map_err(|e| corruption_at(block, &e))?
        {
            trace!(
                target: "e2::dir",
                parent = parent.0,
                block = block.0,
                offset = record.offset,
                ino = record.inode,
                "hidden record"
            );
            return Ok(Some(HiddenSlot { block, record }));
        }
    }
    Ok(None)
}

/// Put a hidden record back into the chain.
pub fn expose_hidden(image: &mut Image, slot: &HiddenSlot) -> Result<()> {
    let data = image.block_mut(slot.block)?;
    block::expose(data, &slot.record).map_err(|e| corruption_at(slot.block, &e))
}

/// Undo [`expose_hidden`].
pub fn conceal_hidden(image: &mut Image, slot: &HiddenSlot) -> Result<()> {
    let data = image.block_mut(slot.block)?;
    block::conceal(data, &slot.record).map_err(|e| corruption_at(slot.block, &e))
}

/// Overwrite the type tag of the record at (`block`, `offset`).
pub fn set_entry_type(
    image: &mut Image,
    block: BlockNumber,
    offset: usize,
    file_type: Ext2FileType,
) -> Result<()> {
    let data = image.block_mut(block)?;
    block::set_file_type(data, offset, file_type).map_err(|e| corruption_at(block, &e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2_image::{FormatOptions, format};
    use proptest::prelude::*;

    fn reference() -> Image {
        format(&FormatOptions::default()).expect("format")
    }

    fn names(image: &Image, dir: InodeNumber) -> Vec<String> {
        list(image, dir)
            .expect("list")
            .iter()
            .map(Ext2DirEntry::name_str)
            .collect()
    }

    fn assert_chains(image: &Image, dir: InodeNumber) {
        for block in dir_blocks(image, dir).expect("blocks") {
            check_chain(image.block(block).expect("block")).expect("chain");
        }
    }

    #[test]
    fn validate_name_rules() {
        assert!(matches!(validate_name(b""), Err(E2Error::Format(_))));
        assert!(matches!(
            validate_name(&[b'a'; 256]),
            Err(E2Error::NameTooLong)
        ));
        assert!(validate_name(&[b'a'; 255]).is_ok());
        assert!(validate_name(b"a/b").is_err());
    }

    #[test]
    fn formatted_root_lists_dot_entries() {
        let image = reference();
        assert_eq!(names(&image, InodeNumber::ROOT), vec![".", "..", "lost+found"]);
        let found = lookup(&image, InodeNumber::ROOT, b"lost+found")
            .expect("lookup")
            .expect("present");
        assert_eq!(found.entry.inode, 11);
        assert_eq!(found.offset, 24);
        assert_eq!(found.entry.file_type, Ext2FileType::Dir);
    }

    #[test]
    fn insert_file_keeps_links() {
        let mut image = reference();
        let links = image.inode(InodeNumber::ROOT).expect("root").links_count;
        insert(&mut image, InodeNumber::ROOT, InodeNumber(12), b"a.txt", Ext2FileType::RegFile)
            .expect("insert");
        assert_eq!(image.inode(InodeNumber::ROOT).expect("root").links_count, links);
        let found = lookup(&image, InodeNumber::ROOT, b"a.txt")
            .expect("lookup")
            .expect("present");
        assert_eq!(found.entry.inode, 12);
        assert_chains(&image, InodeNumber::ROOT);
    }

    #[test]
    fn insert_directory_bumps_parent_links() {
        let mut image = reference();
        let links = image.inode(InodeNumber::ROOT).expect("root").links_count;
        insert(&mut image, InodeNumber::ROOT, InodeNumber(12), b"sub", Ext2FileType::Dir)
            .expect("insert");
        assert_eq!(
            image.inode(InodeNumber::ROOT).expect("root").links_count,
            links + 1
        );
    }

    #[test]
    fn insert_into_non_directory_fails() {
        let mut image = reference();
        assert!(matches!(
            insert(&mut image, InodeNumber(12), InodeNumber(13), b"x", Ext2FileType::RegFile),
            Err(E2Error::NotDirectory)
        ));
    }

    #[test]
    fn full_block_grows_directory() {
        let mut image = reference();
        let before = image.inode(InodeNumber::ROOT).expect("root");
        // 250-byte names need 260-byte records: three fit after lost+found.
        let mut inserted = 0_u32;
        while !needs_new_block(&image, InodeNumber::ROOT, 250).expect("room") {
            let name = vec![b'a' + u8::try_from(inserted).expect("small"); 250];
            insert(&mut image, InodeNumber::ROOT, InodeNumber(12), &name, Ext2FileType::RegFile)
                .expect("insert");
            inserted += 1;
        }
        assert_eq!(inserted, 3);
        let free = image.free_counts().expect("counts").sb_free_blocks;

        insert(&mut image, InodeNumber::ROOT, InodeNumber(12), &[b'z'; 250], Ext2FileType::RegFile)
            .expect("grow");
        let after = image.inode(InodeNumber::ROOT).expect("root");
        assert_eq!(after.size, before.size + 1024);
        assert_eq!(after.blocks, before.blocks + 2);
        assert_eq!(after.direct_blocks().count(), 2);
        assert_eq!(image.free_counts().expect("counts").sb_free_blocks, free - 1);

        let found = lookup(&image, InodeNumber::ROOT, &[b'z'; 250])
            .expect("lookup")
            .expect("present");
        assert_eq!(found.block, BlockNumber(after.block[1]));
        assert_eq!(found.offset, 0);
        assert_eq!(usize::from(found.entry.rec_len), 1024);
        assert_chains(&image, InodeNumber::ROOT);
    }

    #[test]
    fn remove_absorbs_and_reports_target() {
        let mut image = reference();
        insert(&mut image, InodeNumber::ROOT, InodeNumber(12), b"a", Ext2FileType::RegFile)
            .expect("insert a");
        insert(&mut image, InodeNumber::ROOT, InodeNumber(13), b"b", Ext2FileType::RegFile)
            .expect("insert b");

        let removed = remove(&mut image, InodeNumber::ROOT, b"a").expect("remove");
        assert_eq!(removed.inode, 12);
        assert_eq!(removed.file_type, Ext2FileType::RegFile);
        assert_eq!(names(&image, InodeNumber::ROOT), vec![".", "..", "lost+found", "b"]);
        assert_chains(&image, InodeNumber::ROOT);

        assert!(matches!(
            remove(&mut image, InodeNumber::ROOT, b"a"),
            Err(E2Error::NotFound(_))
        ));
    }

    #[test]
    fn hidden_slot_expose_and_conceal() {
        let mut image = reference();
        insert(&mut image, InodeNumber::ROOT, InodeNumber(12), b"gone", Ext2FileType::RegFile)
            .expect("insert");
        remove(&mut image, InodeNumber::ROOT, b"gone").expect("remove");
        let root_block = dir_blocks(&image, InodeNumber::ROOT).expect("blocks")[0];
        let snapshot = image.block(root_block).expect("block").to_vec();

        let slot = find_hidden(&image, InodeNumber::ROOT, b"gone")
            .expect("scan")
            .expect("hidden");
        assert_eq!(slot.record.inode, 12);

        expose_hidden(&mut image, &slot).expect("expose");
        assert!(lookup(&image, InodeNumber::ROOT, b"gone").expect("lookup").is_some());
        conceal_hidden(&mut image, &slot).expect("conceal");
        assert_eq!(image.block(root_block).expect("block"), snapshot.as_slice());
    }

    #[test]
    fn entry_type_can_be_rewritten() {
        let mut image = reference();
        let found = lookup(&image, InodeNumber::ROOT, b"lost+found")
            .expect("lookup")
            .expect("present");
        set_entry_type(&mut image, found.block, found.offset, Ext2FileType::RegFile)
            .expect("set");
        let again = lookup(&image, InodeNumber::ROOT, b"lost+found")
            .expect("lookup")
            .expect("present");
        assert_eq!(again.entry.file_type, Ext2FileType::RegFile);
    }

    proptest! {
        #[test]
        fn record_lengths_always_sum_to_block_size(
            ops in proptest::collection::vec((any::<bool>(), 0_u8..24, 1_usize..60), 1..80)
        ) {
            let mut image = reference();
            let mut present: Vec<Vec<u8>> = Vec::new();
            for (add, tag, len) in ops {
                let name: Vec<u8> = std::iter::once(b'a' + tag % 26)
                    .chain(std::iter::repeat_n(b'x', len - 1))
                    .collect();
                if add && !present.contains(&name) {
                    match insert(&mut image, InodeNumber::ROOT, InodeNumber(12), &name, Ext2FileType::RegFile) {
                        Ok(()) => present.push(name),
                        Err(E2Error::NoSpace) => {}
                        Err(e) => panic!("insert failed: {e}"),
                    }
                } else if let Some(pos) = present.iter().position(|n| *n == name) {
                    remove(&mut image, InodeNumber::ROOT, &name).expect("remove");
                    present.remove(pos);
                }
                for block in dir_blocks(&image, InodeNumber::ROOT).expect("blocks") {
                    prop_assert!(check_chain(image.block(block).expect("block")).is_ok());
                }
            }
            let mut listed: Vec<Vec<u8>> = list(&image, InodeNumber::ROOT)
                .expect("list")
                .into_iter()
                .map(|e| e.name)
                .filter(|n| n != b"." && n != b".." && n != b"lost+found")
                .collect();
            listed.sort();
            present.sort();
            prop_assert_eq!(listed, present);
        }
    }
}
