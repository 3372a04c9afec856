//! Build a fresh single-group ext2 image in memory.
//!
//! Layout for the default 128-block / 32-inode volume:
//!
//! | Block | Content |
//! |-------|---------|
//! | 0 | boot block (zero) |
//! | 1 | superblock |
//! | 2 | group descriptor |
//! | 3 | block bitmap |
//! | 4 | inode bitmap |
//! | 5..=8 | inode table |
//! | 9 | root directory |
//! | 10 | `lost+found` |

use crate::{GROUP_DESC_BLOCK, Image, SUPERBLOCK_BLOCK};
use e2_error::{E2Error, Result};
use e2_ondisk::{
    EXT2_FEATURE_INCOMPAT_FILETYPE, Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock,
    write_dir_record,
};
use e2_types::{
    DEFAULT_DIR_PERM, EXT2_BLOCK_SIZE, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_SUPER_MAGIC, InodeNumber, S_IFDIR, u32_to_u16,
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Name of the directory `e2fsck` reconnects orphans into.
pub const LOST_AND_FOUND: &str = "lost+found";

/// Parameters for [`format`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub blocks_count: u32,
    pub inodes_count: u32,
    /// Create `lost+found` as inode 11.
    pub lost_and_found: bool,
    pub volume_name: String,
    /// Timestamp written into new metadata; `None` means "now".
    pub timestamp: Option<u32>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            blocks_count: 128,
            inodes_count: 32,
            lost_and_found: true,
            volume_name: String::new(),
            timestamp: None,
        }
    }
}

impl FormatOptions {
    fn validate(&self) -> Result<()> {
        let max_bits = u32::try_from(EXT2_BLOCK_SIZE * 8).unwrap_or(u32::MAX);
        if self.inodes_count < EXT2_GOOD_OLD_FIRST_INO + 1 || self.inodes_count > max_bits {
            return Err(E2Error::InvalidGeometry(format!(
                "inodes_count {} outside {}..={max_bits}",
                self.inodes_count,
                EXT2_GOOD_OLD_FIRST_INO + 1
            )));
        }
        if self.blocks_count > max_bits + 1 {
            return Err(E2Error::InvalidGeometry(format!(
                "blocks_count {} exceeds one block group",
                self.blocks_count
            )));
        }
        if self.blocks_count < self.first_data_block_after_metadata() + 4 {
            return Err(E2Error::InvalidGeometry(format!(
                "blocks_count {} leaves no room for data",
                self.blocks_count
            )));
        }
        if u32_to_u16(self.blocks_count, "blocks_count").is_err() {
            return Err(E2Error::InvalidGeometry(
                "group descriptor counters are 16-bit".into(),
            ));
        }
        Ok(())
    }

    fn inode_table_blocks(&self) -> u32 {
        (self.inodes_count * u32::from(EXT2_GOOD_OLD_INODE_SIZE))
            .div_ceil(u32::try_from(EXT2_BLOCK_SIZE).unwrap_or(1024))
    }

    fn first_data_block_after_metadata(&self) -> u32 {
        5 + self.inode_table_blocks()
    }
}

/// Lay out a new image according to `options`.
pub fn format(options: &FormatOptions) -> Result<Image> {
    options.validate()?;
    let now = options.timestamp.unwrap_or_else(unix_now);

    let block_bitmap = 3_u32;
    let inode_bitmap = 4_u32;
    let inode_table = 5_u32;
    let root_block = options.first_data_block_after_metadata();
    let lost_block = root_block + 1;

    let mut bytes = vec![0_u8; options.blocks_count as usize * EXT2_BLOCK_SIZE];

    // Block bitmap: metadata and directory blocks, plus the padding bits
    // past the end of the volume, are in use.
    let last_used_block = if options.lost_and_found {
        lost_block
    } else {
        root_block
    };
    let tracked_blocks = options.blocks_count - 1;
    {
        let bitmap = block_slice(&mut bytes, block_bitmap);
        for block in 1..=last_used_block {
            mark(bitmap, block - 1);
        }
        for bit in tracked_blocks..(EXT2_BLOCK_SIZE as u32 * 8) {
            mark(bitmap, bit);
        }
    }

    // Inode bitmap: reserved inodes 1..=10, lost+found, padding.
    let mut used_inodes = EXT2_GOOD_OLD_FIRST_INO - 1;
    if options.lost_and_found {
        used_inodes += 1;
    }
    {
        let bitmap = block_slice(&mut bytes, inode_bitmap);
        for bit in 0..used_inodes {
            mark(bitmap, bit);
        }
        for bit in options.inodes_count..(EXT2_BLOCK_SIZE as u32 * 8) {
            mark(bitmap, bit);
        }
    }

    let free_blocks = tracked_blocks - last_used_block;
    let free_inodes = options.inodes_count - used_inodes;
    let used_dirs: u16 = if options.lost_and_found { 2 } else { 1 };

    let sb = Ext2Superblock {
        inodes_count: options.inodes_count,
        blocks_count: options.blocks_count,
        reserved_blocks_count: options.blocks_count / 20,
        free_blocks_count: free_blocks,
        free_inodes_count: free_inodes,
        first_data_block: 1,
        log_block_size: 0,
        block_size: 1024,
        blocks_per_group: 8192,
        frags_per_group: 8192,
        inodes_per_group: options.inodes_count,
        inode_size: EXT2_GOOD_OLD_INODE_SIZE,
        first_ino: EXT2_GOOD_OLD_FIRST_INO,
        magic: EXT2_SUPER_MAGIC,
        uuid: [0; 16],
        volume_name: options.volume_name.clone(),
        rev_level: 1,
        minor_rev_level: 0,
        creator_os: 0,
        feature_compat: 0,
        feature_incompat: EXT2_FEATURE_INCOMPAT_FILETYPE,
        feature_ro_compat: 0,
        state: 1,
        errors: 1,
        mnt_count: 0,
        max_mnt_count: u16::MAX,
        mtime: 0,
        wtime: now,
        lastcheck: now,
    };
    sb.write_to_region(block_slice(&mut bytes, SUPERBLOCK_BLOCK.0))
        .map_err(|e| E2Error::Format(e.to_string()))?;

    let gd = Ext2GroupDesc {
        block_bitmap,
        inode_bitmap,
        inode_table,
        free_blocks_count: u32_to_u16(free_blocks, "free_blocks")
            .map_err(|e| E2Error::InvalidGeometry(e.to_string()))?,
        free_inodes_count: u32_to_u16(free_inodes, "free_inodes")
            .map_err(|e| E2Error::InvalidGeometry(e.to_string()))?,
        used_dirs_count: used_dirs,
    };
    gd.write_to_bytes(block_slice(&mut bytes, GROUP_DESC_BLOCK.0))
        .map_err(|e| E2Error::Format(e.to_string()))?;

    // Root directory.
    let root_links = if options.lost_and_found { 3 } else { 2 };
    write_dir_inode(
        &mut bytes,
        inode_table,
        InodeNumber::ROOT,
        root_block,
        root_links,
        now,
    )?;
    {
        let block = block_slice(&mut bytes, root_block);
        let root = InodeNumber::ROOT.0;
        record(block, 0, root, 12, b".")?;
        if options.lost_and_found {
            record(block, 12, root, 12, b"..")?;
            record(block, 24, EXT2_GOOD_OLD_FIRST_INO, 1000, LOST_AND_FOUND.as_bytes())?;
        } else {
            record(block, 12, root, 1012, b"..")?;
        }
    }

    if options.lost_and_found {
        let lost = InodeNumber(EXT2_GOOD_OLD_FIRST_INO);
        write_dir_inode(&mut bytes, inode_table, lost, lost_block, 2, now)?;
        let block = block_slice(&mut bytes, lost_block);
        record(block, 0, lost.0, 12, b".")?;
        record(block, 12, InodeNumber::ROOT.0, 1012, b"..")?;
    }

    info!(
        target: "e2::format",
        blocks = options.blocks_count,
        inodes = options.inodes_count,
        free_blocks,
        free_inodes,
        "formatted image"
    );
    Image::from_bytes(bytes)
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u32::try_from(d.as_secs()).ok())
        .unwrap_or(0)
}

fn block_slice(bytes: &mut [u8], block: u32) -> &mut [u8] {
    let start = block as usize * EXT2_BLOCK_SIZE;
    &mut bytes[start..start + EXT2_BLOCK_SIZE]
}

fn mark(bitmap: &mut [u8], bit: u32) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

fn record(block: &mut [u8], offset: usize, inode: u32, rec_len: u16, name: &[u8]) -> Result<()> {
    write_dir_record(block, offset, inode, rec_len, Ext2FileType::Dir, name)
        .map_err(|e| E2Error::Format(e.to_string()))
}

fn write_dir_inode(
    bytes: &mut [u8],
    inode_table: u32,
    ino: InodeNumber,
    data_block: u32,
    links: u16,
    now: u32,
) -> Result<()> {
    let mut block = [0_u32; 15];
    block[0] = data_block;
    let inode = Ext2Inode {
        mode: S_IFDIR | DEFAULT_DIR_PERM,
        size: 1024,
        atime: now,
        ctime: now,
        mtime: now,
        links_count: links,
        blocks: 2,
        block,
        ..Ext2Inode::default()
    };
    let size = usize::from(EXT2_GOOD_OLD_INODE_SIZE);
    let start = inode_table as usize * EXT2_BLOCK_SIZE + (ino.0 as usize - 1) * size;
    inode
        .write_to_bytes(&mut bytes[start..start + size])
        .map_err(|e| E2Error::Format(e.to_string()))
}
