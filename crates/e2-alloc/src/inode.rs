//! Inode & block allocator.
//!
//! New inodes get direct blocks in slots 0..12; larger files add one
//! single-indirect block in slot 12 whose contents are a zero-terminated
//! array of little-endian block numbers. Slots 13 and 14 are never used.

use crate::{allocate, count_free, set_bit};
use e2_error::{E2Error, Result};
use e2_image::Image;
use e2_ondisk::{Ext2FileType, Ext2Inode, write_dir_record};
use e2_types::{
    BitmapKind, BlockNumber, DEFAULT_DIR_PERM, DEFAULT_FILE_PERM, DEFAULT_SYMLINK_PERM,
    EXT2_IND_BLOCK, EXT2_NDIR_BLOCKS, InodeNumber, SECTOR_SIZE, blocks_for_bytes, read_le_u32,
    write_le_u32,
};
use tracing::{debug, trace};

/// Every block an inode references, in logical order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRefs {
    /// Non-zero pointers among slots 0..12.
    pub direct: Vec<BlockNumber>,
    /// The single-indirect block (slot 12).
    pub indirect: Option<BlockNumber>,
    /// Entries of the indirect block up to its zero terminator.
    pub indirect_entries: Vec<BlockNumber>,
}

impl BlockRefs {
    /// Data blocks in file order (direct, then indirect entries).
    pub fn data_blocks(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.direct
            .iter()
            .chain(self.indirect_entries.iter())
            .copied()
    }

    /// Data blocks plus the indirect block itself.
    pub fn all(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.data_blocks().chain(self.indirect)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.direct.len() + self.indirect_entries.len() + usize::from(self.indirect.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collect the block pointers of `inode`.
///
/// Pointers outside the image are reported as corruption rather than
/// silently dropped.
pub fn block_refs(image: &Image, inode: &Ext2Inode) -> Result<BlockRefs> {
    let geometry = image.geometry();
    let check = |raw: u32, what: &str| -> Result<BlockNumber> {
        let block = BlockNumber(raw);
        if geometry.contains_block(block) {
            Ok(block)
        } else {
            Err(E2Error::corruption(
                raw,
                format!("{what} pointer {raw} outside the image"),
            ))
        }
    };

    let mut refs = BlockRefs::default();
    for raw in inode.block[..EXT2_NDIR_BLOCKS].iter().copied() {
        if raw != 0 {
            refs.direct.push(check(raw, "direct")?);
        }
    }

    if let Some(indirect) = inode.indirect_block() {
        let indirect = check(indirect.0, "indirect")?;
        refs.indirect = Some(indirect);
        let data = image.block(indirect)?;
        for offset in (0..data.len()).step_by(4) {
            let raw = read_le_u32(data, offset)
                .map_err(|e| E2Error::corruption(indirect.0, e.to_string()))?;
            if raw == 0 {
                break;
            }
            refs.indirect_entries.push(check(raw, "indirect entry")?);
        }
    }
    Ok(refs)
}

/// Total blocks (data plus the indirect block, if any) a file of
/// `byte_size` bytes occupies.
#[must_use]
pub fn blocks_needed(byte_size: u32, block_size: u32) -> u32 {
    let data = blocks_for_bytes(byte_size, block_size);
    if data as usize > EXT2_NDIR_BLOCKS {
        data + 1
    } else {
        data
    }
}

/// Allocate and initialise a new inode of `kind` able to hold `byte_size`
/// bytes.
///
/// Directories get exactly one block holding a single empty record; the
/// caller inserts "." and "..". Regular files and symlinks get zeroed data
/// blocks and a link count of 1 (the entry the caller is about to add).
/// Free inodes and blocks are checked before anything is allocated.
pub fn create_inode(
    image: &mut Image,
    kind: Ext2FileType,
    byte_size: u32,
    now: u32,
) -> Result<InodeNumber> {
    let (type_bits, perm) = match kind {
        Ext2FileType::Dir => (kind.mode_bits(), DEFAULT_DIR_PERM),
        Ext2FileType::RegFile => (kind.mode_bits(), DEFAULT_FILE_PERM),
        Ext2FileType::Symlink => (kind.mode_bits(), DEFAULT_SYMLINK_PERM),
        _ => (None, 0),
    };
    let Some(type_bits) = type_bits else {
        return Err(E2Error::Format(format!(
            "cannot create an inode of type {}",
            kind.as_str()
        )));
    };

    let geometry = image.geometry().clone();
    let block_size = geometry.block_size;
    let is_dir = kind == Ext2FileType::Dir;
    let data_blocks = if is_dir {
        1
    } else {
        blocks_for_bytes(byte_size, block_size)
    };
    if data_blocks > geometry.max_file_blocks() {
        return Err(E2Error::FileTooLarge(u64::from(byte_size)));
    }
    let total_blocks = if is_dir {
        1
    } else {
        blocks_needed(byte_size, block_size)
    };

    if count_free(image, BitmapKind::Inode)? == 0
        || count_free(image, BitmapKind::Block)? < total_blocks
    {
        return Err(E2Error::NoSpace);
    }

    let ino = InodeNumber(allocate(image, BitmapKind::Inode)?);
    let previous = image.inode(ino)?;
    let mut inode = Ext2Inode {
        mode: type_bits | perm,
        size: if is_dir { block_size } else { byte_size },
        atime: now,
        ctime: now,
        mtime: now,
        links_count: if is_dir { 0 } else { 1 },
        blocks: total_blocks * (block_size / SECTOR_SIZE),
        generation: previous.generation.wrapping_add(1),
        ..Ext2Inode::default()
    };

    if is_dir {
        let block = BlockNumber(allocate(image, BitmapKind::Block)?);
        init_empty_dir_block(image, block)?;
        inode.block[0] = block.0;
        let mut gd = image.group_desc()?;
        gd.used_dirs_count = gd.used_dirs_count.saturating_add(1);
        image.write_group_desc(&gd)?;
    } else {
        let direct = (data_blocks as usize).min(EXT2_NDIR_BLOCKS);
        for slot in inode.block.iter_mut().take(direct) {
            let block = BlockNumber(allocate(image, BitmapKind::Block)?);
            image.zero_block(block)?;
            *slot = block.0;
        }
        if data_blocks as usize > EXT2_NDIR_BLOCKS {
            let indirect = BlockNumber(allocate(image, BitmapKind::Block)?);
            image.zero_block(indirect)?;
            inode.block[EXT2_IND_BLOCK] = indirect.0;
            let remaining = data_blocks as usize - EXT2_NDIR_BLOCKS;
            for entry in 0..remaining {
                let block = BlockNumber(allocate(image, BitmapKind::Block)?);
                image.zero_block(block)?;
                write_le_u32(image.block_mut(indirect)?, entry * 4, block.0)
                    .map_err(|e| E2Error::corruption(indirect.0, e.to_string()))?;
            }
        }
    }

    image.write_inode(ino, &inode)?;
    debug!(
        target: "e2::alloc",
        ino = ino.0,
        kind = kind.as_str(),
        size = inode.size,
        blocks = total_blocks,
        "created inode"
    );
    Ok(ino)
}

/// Overwrite `block` with one empty record spanning the whole block.
pub fn init_empty_dir_block(image: &mut Image, block: BlockNumber) -> Result<()> {
    let block_size = image.geometry().block_size;
    let rec_len = u16::try_from(block_size)
        .map_err(|_| E2Error::InvalidGeometry(format!("block size {block_size}")))?;
    let data = image.block_mut(block)?;
    data.fill(0);
    write_dir_record(data, 0, 0, rec_len, Ext2FileType::Unknown, b"")
        .map_err(|e| E2Error::corruption(block.0, e.to_string()))
}

/// Clear the bitmap bit of every block `inode` references: the indirect
/// entries, the indirect block itself, then the direct blocks.
///
/// Block contents and the inode's pointers are left as they are. Returns the
/// number of bits that were actually cleared.
pub fn release_blocks(image: &mut Image, inode: &Ext2Inode) -> Result<u32> {
    let refs = block_refs(image, inode)?;
    let mut cleared = 0;
    let order = refs
        .indirect_entries
        .iter()
        .chain(refs.indirect.iter())
        .chain(refs.direct.iter());
    for block in order {
        if set_bit(image, BitmapKind::Block, block.0, false)? {
            cleared += 1;
        }
    }
    trace!(target: "e2::alloc", cleared, "released blocks");
    Ok(cleared)
}

/// Set (or clear) the bitmap bit of every block in `refs`, with counters.
pub fn mark_blocks(image: &mut Image, refs: &BlockRefs, value: bool) -> Result<u32> {
    let mut changed = 0;
    for block in refs.all() {
        if set_bit(image, BitmapKind::Block, block.0, value)? {
            changed += 1;
        }
    }
    Ok(changed)
}
