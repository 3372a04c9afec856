#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EXT2_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT2_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// The only block size this engine handles (`s_log_block_size == 0`).
pub const EXT2_BLOCK_SIZE: usize = 1024;

/// Inode record size for revision-0 images (and the default for rev 1).
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
/// First non-reserved inode for revision-0 images.
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;

/// Number of direct block pointers in `i_block`.
pub const EXT2_NDIR_BLOCKS: usize = 12;
/// Slot of the single-indirect pointer in `i_block`.
pub const EXT2_IND_BLOCK: usize = 12;
/// Total number of `i_block` slots (direct + single/double/triple indirect).
pub const EXT2_N_BLOCKS: usize = 15;

/// Longest name a directory record can carry (`name_len` is a `u8`).
pub const EXT2_NAME_LEN: usize = 255;

/// `i_blocks` counts 512-byte sectors regardless of the filesystem block size.
pub const SECTOR_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

impl BlockNumber {
    /// Block 0 doubles as the "no block" marker in `i_block` slots.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(2);
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which of the two allocation bitmaps an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitmapKind {
    Inode,
    Block,
}

impl fmt::Display for BitmapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inode => f.write_str("inode"),
            Self::Block => f.write_str("block"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    let actual = data.len();
    if end > actual {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: actual.saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

#[must_use]
pub fn ext2_block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

/// Round `value` up to the next multiple of 4 (directory record alignment).
#[must_use]
pub fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// Number of blocks needed to hold `byte_size` bytes.
#[must_use]
pub fn blocks_for_bytes(byte_size: u32, block_size: u32) -> u32 {
    byte_size.div_ceil(block_size)
}

/// Narrow a `u32` to `u16` with an explicit error path.
pub fn u32_to_u16(value: u32, field: &'static str) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;

/// Permission bits given to newly created inodes.
pub const DEFAULT_DIR_PERM: u16 = 0o755;
pub const DEFAULT_FILE_PERM: u16 = 0o644;
pub const DEFAULT_SYMLINK_PERM: u16 = 0o777;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_u8(&bytes, 7).expect("u8"), 0x90);
    }

    #[test]
    fn test_write_helpers_round_trip_in_place() {
        let mut bytes = [0_u8; 8];
        write_le_u16(&mut bytes, 0, 0xEF53).expect("u16");
        write_le_u32(&mut bytes, 2, 0xDEAD_BEEF).expect("u32");
        write_u8(&mut bytes, 7, 7).expect("u8");
        assert_eq!(bytes, [0x53, 0xEF, 0xEF, 0xBE, 0xAD, 0xDE, 0, 7]);
    }

    #[test]
    fn test_out_of_range_access_is_reported() {
        let mut bytes = [0_u8; 3];
        assert_eq!(
            read_le_u32(&bytes, 0),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 0,
                actual: 3
            })
        );
        assert!(write_le_u16(&mut bytes, 2, 1).is_err());
        assert!(ensure_slice(&bytes, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_trim_nul_padded() {
        let raw = b"e2img\0\0\0";
        assert_eq!(trim_nul_padded(raw), "e2img");
    }

    #[test]
    fn test_ext2_block_size_from_log() {
        assert_eq!(ext2_block_size_from_log(0), Some(1024));
        assert_eq!(ext2_block_size_from_log(2), Some(4096));
        assert_eq!(ext2_block_size_from_log(40), None);
    }

    #[test]
    fn test_align4_and_block_math() {
        assert_eq!(align4(8), 8);
        assert_eq!(align4(9), 12);
        assert_eq!(align4(12), 12);
        assert_eq!(blocks_for_bytes(0, 1024), 0);
        assert_eq!(blocks_for_bytes(1, 1024), 1);
        assert_eq!(blocks_for_bytes(1024, 1024), 1);
        assert_eq!(blocks_for_bytes(13 * 1024, 1024), 13);
    }

    #[test]
    fn test_narrowing_helpers() {
        assert_eq!(u32_to_u16(70_000, "free"), Err(ParseError::IntegerConversion { field: "free" }));
    }

    #[test]
    fn test_block_number_none_marker() {
        assert!(BlockNumber::NONE.is_none());
        assert!(!BlockNumber(9).is_none());
        assert_eq!(BlockNumber(u32::MAX).checked_add(1), None);
        assert_eq!(InodeNumber::ROOT.to_string(), "2");
    }
}
