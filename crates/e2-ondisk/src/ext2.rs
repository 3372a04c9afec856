use e2_types::{
    EXT2_BLOCK_SIZE, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE, EXT2_IND_BLOCK,
    EXT2_N_BLOCKS, EXT2_NAME_LEN, EXT2_NDIR_BLOCKS, EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_SIZE,
    BlockNumber, ParseError, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, align4, ensure_slice,
    ensure_slice_mut, ext2_block_size_from_log, read_fixed, read_le_u16, read_le_u32, read_u8,
    trim_nul_padded, write_le_u16, write_le_u32, write_u8,
};
use serde::{Deserialize, Serialize};

/// The directory-entry `file_type` byte is valid.
pub const EXT2_FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;

/// Size of one classic (32-bit) group descriptor.
pub const EXT2_GROUP_DESC_SIZE: usize = 32;

/// Directory record header: inode (4) + rec_len (2) + name_len (1) + file_type (1).
pub const DIR_ENTRY_HEADER_LEN: usize = 8;

/// Inode record prefix covered by [`Ext2Inode`].
const EXT2_INODE_CORE_SIZE: usize = 128;

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,

    // ── Revision & features ──────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,

    // ── State ────────────────────────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
}

impl Ext2Superblock {
    /// Parse an ext2 superblock from a 1024-byte superblock region.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let block_size =
            ext2_block_size_from_log(log_block_size).ok_or(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "shift overflow",
            })?;

        let rev_level = read_le_u32(region, 0x4C)?;
        // Revision 0 images predate the dynamic inode size and first_ino fields.
        let (first_ino, inode_size) = if rev_level == 0 {
            (EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE)
        } else {
            let raw_size = read_le_u16(region, 0x58)?;
            let size = if raw_size == 0 {
                EXT2_GOOD_OLD_INODE_SIZE
            } else {
                raw_size
            };
            (read_le_u32(region, 0x54)?, size)
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            frags_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size,
            first_ino,
            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            rev_level,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,
            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat: read_le_u32(region, 0x60)?,
            feature_ro_compat: read_le_u32(region, 0x64)?,
            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
        })
    }

    /// Parse the superblock from a full image (superblock at byte 1024).
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(image, EXT2_BLOCK_SIZE, EXT2_SUPERBLOCK_SIZE)?;
        Self::parse_superblock_region(region)
    }

    /// Patch every modelled field back into a superblock region.
    ///
    /// Fields the model does not cover keep their existing bytes.
    pub fn write_to_region(&self, region: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice_mut(region, 0, EXT2_SUPERBLOCK_SIZE)?;
        write_le_u32(region, 0x00, self.inodes_count)?;
        write_le_u32(region, 0x04, self.blocks_count)?;
        write_le_u32(region, 0x08, self.reserved_blocks_count)?;
        write_le_u32(region, 0x0C, self.free_blocks_count)?;
        write_le_u32(region, 0x10, self.free_inodes_count)?;
        write_le_u32(region, 0x14, self.first_data_block)?;
        write_le_u32(region, 0x18, self.log_block_size)?;
        write_le_u32(region, 0x20, self.blocks_per_group)?;
        write_le_u32(region, 0x24, self.frags_per_group)?;
        write_le_u32(region, 0x28, self.inodes_per_group)?;
        write_le_u32(region, 0x2C, self.mtime)?;
        write_le_u32(region, 0x30, self.wtime)?;
        write_le_u16(region, 0x34, self.mnt_count)?;
        write_le_u16(region, 0x36, self.max_mnt_count)?;
        write_le_u16(region, 0x38, self.magic)?;
        write_le_u16(region, 0x3A, self.state)?;
        write_le_u16(region, 0x3C, self.errors)?;
        write_le_u16(region, 0x3E, self.minor_rev_level)?;
        write_le_u32(region, 0x40, self.lastcheck)?;
        write_le_u32(region, 0x48, self.creator_os)?;
        write_le_u32(region, 0x4C, self.rev_level)?;
        if self.rev_level > 0 {
            write_le_u32(region, 0x54, self.first_ino)?;
            write_le_u16(region, 0x58, self.inode_size)?;
            write_le_u32(region, 0x5C, self.feature_compat)?;
            write_le_u32(region, 0x60, self.feature_incompat)?;
            write_le_u32(region, 0x64, self.feature_ro_compat)?;
        }
        ensure_slice_mut(region, 0x68, 16)?.copy_from_slice(&self.uuid);
        let label = ensure_slice_mut(region, 0x78, 16)?;
        label.fill(0);
        let name = self.volume_name.as_bytes();
        let len = name.len().min(16);
        label[..len].copy_from_slice(&name[..len]);
        Ok(())
    }

    /// Overwrite only the two free counters inside a superblock region.
    pub fn write_free_counts(
        region: &mut [u8],
        free_blocks: u32,
        free_inodes: u32,
    ) -> Result<(), ParseError> {
        write_le_u32(region, 0x0C, free_blocks)?;
        write_le_u32(region, 0x10, free_inodes)
    }

    /// Number of bits the block bitmap tracks (data blocks after `first_data_block`).
    #[must_use]
    pub fn block_bitmap_bits(&self) -> u32 {
        self.blocks_count.saturating_sub(self.first_data_block)
    }

    /// Check that this image fits the single-group, 1 KiB-block envelope.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if usize::try_from(self.block_size).ok() != Some(EXT2_BLOCK_SIZE) {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "only 1024-byte blocks are supported",
            });
        }
        if self.first_data_block != 1 {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1024-byte blocks",
            });
        }
        if self.blocks_count <= self.first_data_block {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "no data blocks",
            });
        }
        if self.blocks_per_group == 0 || self.block_bitmap_bits() > self.blocks_per_group {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "image spans more than one block group",
            });
        }
        if self.block_bitmap_bits() > self.block_size.saturating_mul(8) {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "exceeds block bitmap capacity",
            });
        }
        if self.inodes_count == 0 || self.inodes_per_group != self.inodes_count {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "image spans more than one block group",
            });
        }
        if self.inodes_count > self.block_size.saturating_mul(8) {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "exceeds inode bitmap capacity",
            });
        }
        if usize::from(self.inode_size) < EXT2_INODE_CORE_SIZE
            || !self.inode_size.is_power_of_two()
            || u32::from(self.inode_size) > self.block_size
        {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two in 128..=block_size",
            });
        }
        if self.feature_incompat & !EXT2_FEATURE_INCOMPAT_FILETYPE != 0 {
            return Err(ParseError::InvalidField {
                field: "s_feature_incompat",
                reason: "incompatible features beyond FILETYPE",
            });
        }
        Ok(())
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, EXT2_GROUP_DESC_SIZE)?;
        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }

    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice_mut(bytes, 0, EXT2_GROUP_DESC_SIZE)?;
        write_le_u32(bytes, 0x00, self.block_bitmap)?;
        write_le_u32(bytes, 0x04, self.inode_bitmap)?;
        write_le_u32(bytes, 0x08, self.inode_table)?;
        write_le_u16(bytes, 0x0C, self.free_blocks_count)?;
        write_le_u16(bytes, 0x0E, self.free_inodes_count)?;
        write_le_u16(bytes, 0x10, self.used_dirs_count)
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// 512-byte sectors, not filesystem blocks.
    pub blocks: u32,
    pub flags: u32,
    pub block: [u32; EXT2_N_BLOCKS],
    pub generation: u32,
}

impl Ext2Inode {
    /// Parse the 128-byte core of an inode record.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, EXT2_INODE_CORE_SIZE)?;
        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, 0x28 + i * 4)?;
        }
        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: read_le_u16(bytes, 0x02)?,
            size: read_le_u32(bytes, 0x04)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            gid: read_le_u16(bytes, 0x18)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            block,
            generation: read_le_u32(bytes, 0x64)?,
        })
    }

    /// Patch the modelled fields into an inode record in place.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice_mut(bytes, 0, EXT2_INODE_CORE_SIZE)?;
        write_le_u16(bytes, 0x00, self.mode)?;
        write_le_u16(bytes, 0x02, self.uid)?;
        write_le_u32(bytes, 0x04, self.size)?;
        write_le_u32(bytes, 0x08, self.atime)?;
        write_le_u32(bytes, 0x0C, self.ctime)?;
        write_le_u32(bytes, 0x10, self.mtime)?;
        write_le_u32(bytes, 0x14, self.dtime)?;
        write_le_u16(bytes, 0x18, self.gid)?;
        write_le_u16(bytes, 0x1A, self.links_count)?;
        write_le_u32(bytes, 0x1C, self.blocks)?;
        write_le_u32(bytes, 0x20, self.flags)?;
        for (i, slot) in self.block.iter().enumerate() {
            write_le_u32(bytes, 0x28 + i * 4, *slot)?;
        }
        write_le_u32(bytes, 0x64, self.generation)
    }

    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & !S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    /// Directory-entry tag matching this inode's mode.
    #[must_use]
    pub fn file_type(&self) -> Ext2FileType {
        Ext2FileType::from_mode(self.mode)
    }

    /// Non-zero `dtime` marks a logically deleted inode.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.dtime != 0
    }

    /// Set direct pointers in order, stopping at the first zero slot.
    pub fn direct_blocks(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.block[..EXT2_NDIR_BLOCKS]
            .iter()
            .take_while(|raw| **raw != 0)
            .map(|raw| BlockNumber(*raw))
    }

    /// The single-indirect block, if one is assigned.
    #[must_use]
    pub fn indirect_block(&self) -> Option<BlockNumber> {
        match self.block[EXT2_IND_BLOCK] {
            0 => None,
            raw => Some(BlockNumber(raw)),
        }
    }
}

// ── Directory entry parsing ─────────────────────────────────────────────────

/// ext2 file type constants from directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            0o010_000 => Self::Fifo,
            0o020_000 => Self::Chrdev,
            S_IFDIR => Self::Dir,
            0o060_000 => Self::Blkdev,
            S_IFREG => Self::RegFile,
            S_IFLNK => Self::Symlink,
            0o140_000 => Self::Sock,
            _ => Self::Unknown,
        }
    }

    /// The `S_IF*` bits for the three kinds this engine creates.
    #[must_use]
    pub fn mode_bits(self) -> Option<u16> {
        match self {
            Self::RegFile => Some(S_IFREG),
            Self::Dir => Some(S_IFDIR),
            Self::Symlink => Some(S_IFLNK),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::RegFile => "file",
            Self::Dir => "dir",
            Self::Chrdev => "chrdev",
            Self::Blkdev => "blkdev",
            Self::Fifo => "fifo",
            Self::Sock => "sock",
            Self::Symlink => "symlink",
        }
    }
}

/// Minimal record length for a name of `name_len` bytes (header + name, 4-aligned).
#[must_use]
pub fn required_rec_len(name_len: usize) -> usize {
    align4(DIR_ENTRY_HEADER_LEN + name_len)
}

/// A parsed ext2 directory entry (`ext2_dir_entry_2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

impl Ext2DirEntry {
    /// The on-disk size this entry needs (padded to 4 bytes).
    #[must_use]
    pub fn actual_size(&self) -> usize {
        required_rec_len(usize::from(self.name_len))
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// A directory record borrowed from its block buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2DirEntryRef<'a> {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    /// Raw tag byte, kept so callers can detect unknown values.
    pub file_type_raw: u8,
    pub name: &'a [u8],
}

impl Ext2DirEntryRef<'_> {
    #[must_use]
    pub fn to_owned(&self) -> Ext2DirEntry {
        Ext2DirEntry {
            inode: self.inode,
            rec_len: self.rec_len,
            name_len: self.name_len,
            file_type: self.file_type,
            name: self.name.to_vec(),
        }
    }

    #[must_use]
    pub fn actual_size(&self) -> usize {
        required_rec_len(usize::from(self.name_len))
    }

    /// A placeholder record: no inode or no name.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inode == 0 || self.name_len == 0
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// Parse and bounds-check the record starting at `offset`.
///
/// `rec_len` must be at least the header, 4-aligned and inside the block,
/// and the name must fit inside `rec_len`.
pub fn parse_dir_record(block: &[u8], offset: usize) -> Result<Ext2DirEntryRef<'_>, ParseError> {
    let inode = read_le_u32(block, offset)?;
    let rec_len = read_le_u16(block, offset + 4)?;
    let name_len = read_u8(block, offset + 6)?;
    let file_type_raw = read_u8(block, offset + 7)?;

    let rec = usize::from(rec_len);
    if rec < DIR_ENTRY_HEADER_LEN {
        return Err(ParseError::InvalidField {
            field: "rec_len",
            reason: "directory entry rec_len < 8",
        });
    }
    if rec % 4 != 0 {
        return Err(ParseError::InvalidField {
            field: "rec_len",
            reason: "directory entry rec_len not 4-aligned",
        });
    }
    match offset.checked_add(rec) {
        Some(end) if end <= block.len() => {}
        _ => {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "directory entry extends past block boundary",
            });
        }
    }
    if DIR_ENTRY_HEADER_LEN + usize::from(name_len) > rec {
        return Err(ParseError::InvalidField {
            field: "name_len",
            reason: "name extends past rec_len",
        });
    }

    let name = ensure_slice(block, offset + DIR_ENTRY_HEADER_LEN, usize::from(name_len))?;
    Ok(Ext2DirEntryRef {
        inode,
        rec_len,
        name_len,
        file_type: Ext2FileType::from_raw(file_type_raw),
        file_type_raw,
        name,
    })
}

/// Write a complete record (header + name) at `offset`.
pub fn write_dir_record(
    block: &mut [u8],
    offset: usize,
    inode: u32,
    rec_len: u16,
    file_type: Ext2FileType,
    name: &[u8],
) -> Result<(), ParseError> {
    let name_len = u8::try_from(name.len())
        .ok()
        .filter(|len| usize::from(*len) <= EXT2_NAME_LEN)
        .ok_or(ParseError::InvalidField {
            field: "name_len",
            reason: "name longer than 255 bytes",
        })?;
    if usize::from(rec_len) < required_rec_len(name.len()) {
        return Err(ParseError::InvalidField {
            field: "rec_len",
            reason: "rec_len too small for name",
        });
    }
    ensure_slice_mut(block, offset, usize::from(rec_len))?;
    write_le_u32(block, offset, inode)?;
    write_le_u16(block, offset + 4, rec_len)?;
    write_u8(block, offset + 6, name_len)?;
    write_u8(block, offset + 7, file_type as u8)?;
    ensure_slice_mut(block, offset + DIR_ENTRY_HEADER_LEN, name.len())?.copy_from_slice(name);
    Ok(())
}

/// Overwrite only the `rec_len` field of the record at `offset`.
pub fn write_rec_len(block: &mut [u8], offset: usize, rec_len: u16) -> Result<(), ParseError> {
    write_le_u16(block, offset + 4, rec_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_superblock_region() -> Vec<u8> {
        let mut region = vec![0_u8; EXT2_SUPERBLOCK_SIZE];
        region[0x00..0x04].copy_from_slice(&32_u32.to_le_bytes());
        region[0x04..0x08].copy_from_slice(&128_u32.to_le_bytes());
        region[0x0C..0x10].copy_from_slice(&103_u32.to_le_bytes());
        region[0x10..0x14].copy_from_slice(&21_u32.to_le_bytes());
        region[0x14..0x18].copy_from_slice(&1_u32.to_le_bytes());
        region[0x20..0x24].copy_from_slice(&8192_u32.to_le_bytes());
        region[0x24..0x28].copy_from_slice(&8192_u32.to_le_bytes());
        region[0x28..0x2C].copy_from_slice(&32_u32.to_le_bytes());
        region[0x38..0x3A].copy_from_slice(&EXT2_SUPER_MAGIC.to_le_bytes());
        region[0x4C..0x50].copy_from_slice(&1_u32.to_le_bytes());
        region[0x54..0x58].copy_from_slice(&11_u32.to_le_bytes());
        region[0x58..0x5A].copy_from_slice(&128_u16.to_le_bytes());
        region[0x60..0x64].copy_from_slice(&EXT2_FEATURE_INCOMPAT_FILETYPE.to_le_bytes());
        region[0x78..0x7C].copy_from_slice(b"disk");
        region
    }

    #[test]
    fn parse_reference_superblock() {
        let sb = Ext2Superblock::parse_superblock_region(&reference_superblock_region())
            .expect("parse");
        assert_eq!(sb.inodes_count, 32);
        assert_eq!(sb.blocks_count, 128);
        assert_eq!(sb.free_blocks_count, 103);
        assert_eq!(sb.free_inodes_count, 21);
        assert_eq!(sb.block_size, 1024);
        assert_eq!(sb.first_ino, 11);
        assert_eq!(sb.inode_size, 128);
        assert_eq!(sb.volume_name, "disk");
        assert_eq!(sb.block_bitmap_bits(), 127);
        sb.validate_geometry().expect("reference geometry is valid");
    }

    #[test]
    fn superblock_bad_magic_is_rejected() {
        let mut region = reference_superblock_region();
        region[0x38] = 0;
        assert!(matches!(
            Ext2Superblock::parse_superblock_region(&region),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn rev0_superblock_uses_good_old_defaults() {
        let mut region = reference_superblock_region();
        region[0x4C..0x50].copy_from_slice(&0_u32.to_le_bytes());
        region[0x58..0x5A].copy_from_slice(&0_u16.to_le_bytes());
        let sb = Ext2Superblock::parse_superblock_region(&region).expect("parse");
        assert_eq!(sb.inode_size, EXT2_GOOD_OLD_INODE_SIZE);
        assert_eq!(sb.first_ino, EXT2_GOOD_OLD_FIRST_INO);
    }

    #[test]
    fn multi_group_geometry_is_rejected() {
        let mut sb = Ext2Superblock::parse_superblock_region(&reference_superblock_region())
            .expect("parse");
        sb.blocks_per_group = 64;
        assert!(sb.validate_geometry().is_err());

        let mut sb = Ext2Superblock::parse_superblock_region(&reference_superblock_region())
            .expect("parse");
        sb.inodes_per_group = 16;
        assert!(sb.validate_geometry().is_err());
    }

    #[test]
    fn superblock_write_then_parse_preserves_fields() {
        let mut region = reference_superblock_region();
        let mut sb = Ext2Superblock::parse_superblock_region(&region).expect("parse");
        sb.free_blocks_count = 77;
        sb.volume_name = "scratch".to_owned();
        sb.write_to_region(&mut region).expect("write");
        let reparsed = Ext2Superblock::parse_superblock_region(&region).expect("reparse");
        assert_eq!(reparsed, sb);

        Ext2Superblock::write_free_counts(&mut region, 5, 6).expect("counts");
        let reparsed = Ext2Superblock::parse_superblock_region(&region).expect("reparse");
        assert_eq!((reparsed.free_blocks_count, reparsed.free_inodes_count), (5, 6));
    }

    #[test]
    fn group_desc_patches_only_its_fields() {
        let mut bytes = vec![0xAA_u8; 32];
        let gd = Ext2GroupDesc {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 5,
            free_blocks_count: 100,
            free_inodes_count: 20,
            used_dirs_count: 2,
        };
        gd.write_to_bytes(&mut bytes).expect("write");
        assert_eq!(Ext2GroupDesc::parse_from_bytes(&bytes).expect("parse"), gd);
        assert_eq!(bytes[0x12], 0xAA, "pad bytes untouched");
    }

    #[test]
    fn inode_parse_and_type_helpers() {
        let mut bytes = vec![0_u8; 128];
        bytes[0..2].copy_from_slice(&(S_IFDIR | 0o755).to_le_bytes());
        bytes[4..8].copy_from_slice(&1024_u32.to_le_bytes());
        bytes[0x1A..0x1C].copy_from_slice(&2_u16.to_le_bytes());
        bytes[0x1C..0x20].copy_from_slice(&2_u32.to_le_bytes());
        bytes[0x28..0x2C].copy_from_slice(&9_u32.to_le_bytes());
        let inode = Ext2Inode::parse_from_bytes(&bytes).expect("parse");
        assert!(inode.is_dir());
        assert!(!inode.is_regular());
        assert_eq!(inode.permission_bits(), 0o755);
        assert_eq!(inode.file_type(), Ext2FileType::Dir);
        assert_eq!(inode.direct_blocks().next(), Some(BlockNumber(9)));
        assert_eq!(inode.direct_blocks().count(), 1);
        assert_eq!(inode.indirect_block(), None);
        assert!(!inode.is_deleted());
    }

    #[test]
    fn inode_write_preserves_trailing_bytes() {
        let mut bytes = vec![0x5A_u8; 256];
        let inode = Ext2Inode {
            mode: S_IFREG | 0o644,
            size: 13 * 1024,
            links_count: 1,
            blocks: 28,
            block: [10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 0, 0],
            ..Ext2Inode::default()
        };
        inode.write_to_bytes(&mut bytes).expect("write");
        assert_eq!(Ext2Inode::parse_from_bytes(&bytes).expect("parse"), inode);
        assert!(bytes[128..].iter().all(|b| *b == 0x5A));
        assert_eq!(inode.indirect_block(), Some(BlockNumber(22)));
    }

    #[test]
    fn file_type_mode_mapping() {
        assert_eq!(Ext2FileType::from_mode(S_IFREG | 0o600), Ext2FileType::RegFile);
        assert_eq!(Ext2FileType::from_mode(S_IFLNK | 0o777), Ext2FileType::Symlink);
        assert_eq!(Ext2FileType::from_mode(0), Ext2FileType::Unknown);
        assert_eq!(Ext2FileType::Dir.mode_bits(), Some(S_IFDIR));
        assert_eq!(Ext2FileType::Fifo.mode_bits(), None);
        assert_eq!(Ext2FileType::from_raw(7), Ext2FileType::Symlink);
        assert_eq!(Ext2FileType::from_raw(200), Ext2FileType::Unknown);
    }

    #[test]
    fn dir_record_write_and_parse() {
        let mut block = vec![0_u8; 1024];
        write_dir_record(&mut block, 0, 2, 12, Ext2FileType::Dir, b".").expect("dot");
        write_dir_record(&mut block, 12, 2, 1012, Ext2FileType::Dir, b"..").expect("dotdot");

        let dot = parse_dir_record(&block, 0).expect("parse dot");
        assert!(dot.is_dot());
        assert_eq!(dot.rec_len, 12);
        assert_eq!(dot.actual_size(), 12);

        let dotdot = parse_dir_record(&block, 12).expect("parse dotdot");
        assert!(dotdot.is_dotdot());
        assert_eq!(usize::from(dotdot.rec_len) + 12, 1024);
        assert_eq!(dotdot.to_owned().name_str(), "..");
    }

    #[test]
    fn dir_record_rejects_bad_rec_len() {
        let mut block = vec![0_u8; 64];
        block[4..6].copy_from_slice(&4_u16.to_le_bytes());
        assert!(parse_dir_record(&block, 0).is_err());
        block[4..6].copy_from_slice(&14_u16.to_le_bytes());
        assert!(parse_dir_record(&block, 0).is_err());
        block[4..6].copy_from_slice(&128_u16.to_le_bytes());
        assert!(parse_dir_record(&block, 0).is_err());
        block[4..6].copy_from_slice(&12_u16.to_le_bytes());
        block[6] = 9;
        assert!(parse_dir_record(&block, 0).is_err());
    }

    #[test]
    fn write_dir_record_rejects_short_rec_len() {
        let mut block = vec![0_u8; 64];
        assert!(write_dir_record(&mut block, 0, 12, 12, Ext2FileType::RegFile, b"hello").is_err());
        write_dir_record(&mut block, 0, 12, 16, Ext2FileType::RegFile, b"hello").expect("fits");
        write_rec_len(&mut block, 0, 64).expect("rec_len");
        assert_eq!(parse_dir_record(&block, 0).expect("parse").rec_len, 64);
    }

    #[test]
    fn required_rec_len_matches_alignment() {
        assert_eq!(required_rec_len(1), 12);
        assert_eq!(required_rec_len(4), 12);
        assert_eq!(required_rec_len(5), 16);
        assert_eq!(required_rec_len(255), 264);
    }

    proptest::proptest! {
        #[test]
        fn parse_dir_record_never_panics(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..64), offset in 0_usize..64) {
            let _ = parse_dir_record(&bytes, offset);
        }
    }
}
