#![forbid(unsafe_code)]
//! Owned ext2 image buffer.
//!
//! [`Image`] loads the whole image into memory, validates the single-group
//! geometry once, and hands out bounds-checked views addressed by block or
//! inode number. Nothing reaches the backing file until [`Image::flush`].

pub mod format;

pub use format::{FormatOptions, format};

use e2_error::{E2Error, Result};
use e2_ondisk::{EXT2_GROUP_DESC_SIZE, Ext2GroupDesc, Ext2Inode, Ext2Superblock};
use e2_types::{
    BitmapKind, BlockNumber, EXT2_BLOCK_SIZE, EXT2_SUPERBLOCK_SIZE, InodeNumber, ParseError,
    ensure_slice,
};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions as FsOpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Block holding the superblock for 1 KiB-block images.
pub const SUPERBLOCK_BLOCK: BlockNumber = BlockNumber(1);
/// Block holding the (single) group descriptor.
pub const GROUP_DESC_BLOCK: BlockNumber = BlockNumber(2);

/// Options controlling how an image is opened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Refuse `flush` (inspection paths).
    pub read_only: bool,
}

/// Layout derived from the superblock and group descriptor at open time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Geometry {
    pub block_size: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub first_data_block: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_bitmap: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub inode_table: BlockNumber,
    pub inode_table_blocks: u32,
}

impl Ext2Geometry {
    #[must_use]
    pub fn contains_inode(&self, ino: InodeNumber) -> bool {
        ino.0 >= 1 && ino.0 <= self.inodes_count
    }

    /// Whether `block` is a block the block bitmap tracks.
    #[must_use]
    pub fn contains_block(&self, block: BlockNumber) -> bool {
        block.0 >= self.first_data_block && block.0 < self.blocks_count
    }

    /// Number of meaningful bits in the given bitmap.
    #[must_use]
    pub fn bitmap_bits(&self, kind: BitmapKind) -> u32 {
        match kind {
            BitmapKind::Inode => self.inodes_count,
            BitmapKind::Block => self.blocks_count - self.first_data_block,
        }
    }

    /// 0-based bit position of a 1-based inode or block index.
    #[must_use]
    pub fn bit_of(&self, kind: BitmapKind, index: u32) -> Option<u32> {
        let base = match kind {
            BitmapKind::Inode => 1,
            BitmapKind::Block => self.first_data_block,
        };
        let bit = index.checked_sub(base)?;
        (bit < self.bitmap_bits(kind)).then_some(bit)
    }

    /// Inverse of [`Self::bit_of`].
    #[must_use]
    pub fn index_of(&self, kind: BitmapKind, bit: u32) -> u32 {
        match kind {
            BitmapKind::Inode => bit + 1,
            BitmapKind::Block => bit + self.first_data_block,
        }
    }

    /// Largest byte size a regular file can have: 12 direct blocks plus one
    /// indirect block full of pointers.
    #[must_use]
    pub fn max_file_blocks(&self) -> u32 {
        12 + self.block_size / 4
    }

    fn validate_layout(&self) -> std::result::Result<(), ParseError> {
        let metadata = [
            ("bg_block_bitmap", self.block_bitmap),
            ("bg_inode_bitmap", self.inode_bitmap),
            ("bg_inode_table", self.inode_table),
        ];
        for (field, block) in metadata {
            if block.0 <= GROUP_DESC_BLOCK.0 || block.0 >= self.blocks_count {
                return Err(ParseError::InvalidField {
                    field,
                    reason: "outside the data area",
                });
            }
        }
        let table_end = u64::from(self.inode_table.0) + u64::from(self.inode_table_blocks);
        if table_end > u64::from(self.blocks_count) {
            return Err(ParseError::InvalidField {
                field: "bg_inode_table",
                reason: "inode table extends past the last block",
            });
        }
        Ok(())
    }
}

/// Snapshot of the four free counters (superblock and group descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeCounts {
    pub sb_free_blocks: u32,
    pub sb_free_inodes: u32,
    pub gd_free_blocks: u16,
    pub gd_free_inodes: u16,
}

/// An ext2 image held entirely in memory.
#[derive(Debug, Clone)]
pub struct Image {
    bytes: Vec<u8>,
    geometry: Ext2Geometry,
    backing: Option<PathBuf>,
    options: OpenOptions,
}

impl Image {
    /// Load and validate the image at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |err: std::io::Error| {
            E2Error::ImageUnavailable(format!("{}: {err}", path.display()))
        };
        let file = FsOpenOptions::new()
            .read(true)
            .open(path)
            .map_err(unavailable)?;
        let len = file.metadata().map_err(unavailable)?.len();
        let len = usize::try_from(len)
            .map_err(|_| E2Error::ImageUnavailable(format!("{}: too large", path.display())))?;
        let mut bytes = vec![0_u8; len];
        file.read_exact_at(&mut bytes, 0).map_err(unavailable)?;
        debug!(target: "e2::image", path = %path.display(), len, "loaded image");

        let mut image = Self::from_bytes(bytes)?;
        image.backing = Some(path.to_path_buf());
        image.options = options.clone();
        Ok(image)
    }

    /// Wrap an in-memory image (no backing file).
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let sb = Ext2Superblock::parse_from_image(&bytes).map_err(|e| parse_error_to_e2(&e))?;
        sb.validate_geometry().map_err(|e| parse_error_to_e2(&e))?;

        let image_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let needed = u64::from(sb.blocks_count) * u64::from(sb.block_size);
        if image_len < needed {
            return Err(E2Error::InvalidGeometry(format!(
                "image is {image_len} bytes but the superblock describes {needed}"
            )));
        }

        let gd_offset = GROUP_DESC_BLOCK.0 as usize * EXT2_BLOCK_SIZE;
        let gd = ensure_slice(&bytes, gd_offset, EXT2_GROUP_DESC_SIZE)
            .and_then(Ext2GroupDesc::parse_from_bytes)
            .map_err(|e| parse_error_to_e2(&e))?;

        let table_bytes = u64::from(sb.inodes_count) * u64::from(sb.inode_size);
        let inode_table_blocks = u32::try_from(table_bytes.div_ceil(u64::from(sb.block_size)))
            .map_err(|_| E2Error::InvalidGeometry("inode table size overflows".into()))?;

        let geometry = Ext2Geometry {
            block_size: sb.block_size,
            blocks_count: sb.blocks_count,
            inodes_count: sb.inodes_count,
            first_data_block: sb.first_data_block,
            first_ino: sb.first_ino,
            inode_size: sb.inode_size,
            block_bitmap: BlockNumber(gd.block_bitmap),
            inode_bitmap: BlockNumber(gd.inode_bitmap),
            inode_table: BlockNumber(gd.inode_table),
            inode_table_blocks,
        };
        geometry
            .validate_layout()
            .map_err(|e| parse_error_to_e2(&e))?;

        Ok(Self {
            bytes,
            geometry,
            backing: None,
            options: OpenOptions::default(),
        })
    }

    /// Write the whole buffer back to the backing file.
    ///
    /// A no-op for in-memory images.
    pub fn flush(&self) -> Result<()> {
        if self.options.read_only {
            return Err(E2Error::ReadOnly);
        }
        let Some(path) = &self.backing else {
            return Ok(());
        };
        let file = FsOpenOptions::new().write(true).open(path)?;
        file.write_all_at(&self.bytes, 0)?;
        file.sync_all()?;
        debug!(target: "e2::image", path = %path.display(), len = self.bytes.len(), "flushed image");
        Ok(())
    }

    #[must_use]
    pub fn geometry(&self) -> &Ext2Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[must_use]
    pub fn backing_path(&self) -> Option<&Path> {
        self.backing.as_deref()
    }

    // ── Blocks ──────────────────────────────────────────────────────────────

    fn block_range(&self, block: BlockNumber) -> Result<std::ops::Range<usize>> {
        if block.0 == 0 || block.0 >= self.geometry.blocks_count {
            return Err(E2Error::corruption(
                block.0,
                format!(
                    "block {block} outside 1..{}",
                    self.geometry.blocks_count
                ),
            ));
        }
        let bs = self.geometry.block_size as usize;
        let start = block.0 as usize * bs;
        Ok(start..start + bs)
    }

    pub fn block(&self, block: BlockNumber) -> Result<&[u8]> {
        let range = self.block_range(block)?;
        Ok(&self.bytes[range])
    }

    pub fn block_mut(&mut self, block: BlockNumber) -> Result<&mut [u8]> {
        let range = self.block_range(block)?;
        trace!(target: "e2::image", block = block.0, "block_mut");
        Ok(&mut self.bytes[range])
    }

    /// Fill a block with zeroes.
    pub fn zero_block(&mut self, block: BlockNumber) -> Result<()> {
        self.block_mut(block)?.fill(0);
        Ok(())
    }

    // ── Superblock & group descriptor ───────────────────────────────────────

    fn superblock_region(&self) -> &[u8] {
        let start = SUPERBLOCK_BLOCK.0 as usize * EXT2_BLOCK_SIZE;
        &self.bytes[start..start + EXT2_SUPERBLOCK_SIZE]
    }

    fn superblock_region_mut(&mut self) -> &mut [u8] {
        let start = SUPERBLOCK_BLOCK.0 as usize * EXT2_BLOCK_SIZE;
        &mut self.bytes[start..start + EXT2_SUPERBLOCK_SIZE]
    }

    fn group_desc_bytes(&self) -> &[u8] {
        let start = GROUP_DESC_BLOCK.0 as usize * EXT2_BLOCK_SIZE;
        &self.bytes[start..start + EXT2_GROUP_DESC_SIZE]
    }

    fn group_desc_bytes_mut(&mut self) -> &mut [u8] {
        let start = GROUP_DESC_BLOCK.0 as usize * EXT2_BLOCK_SIZE;
        &mut self.bytes[start..start + EXT2_GROUP_DESC_SIZE]
    }

    pub fn superblock(&self) -> Result<Ext2Superblock> {
        Ext2Superblock::parse_superblock_region(self.superblock_region())
            .map_err(|e| corruption_at(SUPERBLOCK_BLOCK, &e))
    }

    pub fn group_desc(&self) -> Result<Ext2GroupDesc> {
        Ext2GroupDesc::parse_from_bytes(self.group_desc_bytes())
            .map_err(|e| corruption_at(GROUP_DESC_BLOCK, &e))
    }

    pub fn write_group_desc(&mut self, gd: &Ext2GroupDesc) -> Result<()> {
        gd.write_to_bytes(self.group_desc_bytes_mut())
            .map_err(|e| corruption_at(GROUP_DESC_BLOCK, &e))
    }

    pub fn free_counts(&self) -> Result<FreeCounts> {
        let sb = self.superblock()?;
        let gd = self.group_desc()?;
        Ok(FreeCounts {
            sb_free_blocks: sb.free_blocks_count,
            sb_free_inodes: sb.free_inodes_count,
            gd_free_blocks: gd.free_blocks_count,
            gd_free_inodes: gd.free_inodes_count,
        })
    }

    /// Overwrite all four free counters at once.
    pub fn set_free_counts(&mut self, counts: &FreeCounts) -> Result<()> {
        Ext2Superblock::write_free_counts(
            self.superblock_region_mut(),
            counts.sb_free_blocks,
            counts.sb_free_inodes,
        )
        .map_err(|e| corruption_at(SUPERBLOCK_BLOCK, &e))?;
        let mut gd = self.group_desc()?;
        gd.free_blocks_count = counts.gd_free_blocks;
        gd.free_inodes_count = counts.gd_free_inodes;
        self.write_group_desc(&gd)
    }

    // ── Inodes ──────────────────────────────────────────────────────────────

    fn inode_range(&self, ino: InodeNumber) -> Result<std::ops::Range<usize>> {
        if !self.geometry.contains_inode(ino) {
            return Err(E2Error::corruption(
                self.geometry.inode_table.0,
                format!("inode {ino} outside 1..={}", self.geometry.inodes_count),
            ));
        }
        let size = usize::from(self.geometry.inode_size);
        let start = self.geometry.inode_table.0 as usize * self.geometry.block_size as usize
            + (ino.0 as usize - 1) * size;
        Ok(start..start + size)
    }

    /// Block of the inode table that holds `ino` (for error reports).
    fn inode_block(&self, ino: InodeNumber) -> BlockNumber {
        let per_block = self.geometry.block_size / u32::from(self.geometry.inode_size);
        BlockNumber(self.geometry.inode_table.0 + ino.0.saturating_sub(1) / per_block.max(1))
    }

    pub fn inode(&self, ino: InodeNumber) -> Result<Ext2Inode> {
        let range = self.inode_range(ino)?;
        Ext2Inode::parse_from_bytes(&self.bytes[range])
            .map_err(|e| corruption_at(self.inode_block(ino), &e))
    }

    pub fn write_inode(&mut self, ino: InodeNumber, inode: &Ext2Inode) -> Result<()> {
        let range = self.inode_range(ino)?;
        let block = self.inode_block(ino);
        trace!(target: "e2::image", ino = ino.0, "write_inode");
        inode
            .write_to_bytes(&mut self.bytes[range])
            .map_err(|e| corruption_at(block, &e))
    }

    // ── Bitmaps ─────────────────────────────────────────────────────────────

    fn bitmap_block(&self, kind: BitmapKind) -> BlockNumber {
        match kind {
            BitmapKind::Inode => self.geometry.inode_bitmap,
            BitmapKind::Block => self.geometry.block_bitmap,
        }
    }

    /// The whole bitmap block (including padding past the last valid bit).
    pub fn bitmap(&self, kind: BitmapKind) -> Result<&[u8]> {
        self.block(self.bitmap_block(kind))
    }

    pub fn bitmap_mut(&mut self, kind: BitmapKind) -> Result<&mut [u8]> {
        self.block_mut(self.bitmap_block(kind))
    }
}

/// Convert a `ParseError` raised while opening an image.
#[must_use]
pub fn parse_error_to_e2(e: &ParseError) -> E2Error {
    match e {
        ParseError::InvalidField { field, reason } => {
            if field.contains("block_size")
                || field.contains("blocks_per_group")
                || field.contains("inodes_per_group")
                || field.contains("inode_size")
                || field.contains("first_data_block")
                || field.contains("blocks_count")
                || field.contains("inodes_count")
                || field.starts_with("bg_")
            {
                E2Error::InvalidGeometry(format!("{field}: {reason}"))
            } else {
                E2Error::Format(e.to_string())
            }
        }
        ParseError::InvalidMagic { .. } => E2Error::Format(e.to_string()),
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            E2Error::corruption(0, e.to_string())
        }
    }
}

/// Convert a `ParseError` raised while reading live metadata at `block`.
#[must_use]
pub fn corruption_at(block: BlockNumber, e: &ParseError) -> E2Error {
    E2Error::corruption(block.0, e.to_string())
}
