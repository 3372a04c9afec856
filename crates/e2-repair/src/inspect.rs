//! Read-only summary of an image: counters, bitmaps, live inodes and the
//! records of every live directory.

use e2_alloc::bit_at;
use e2_dir::records;
use e2_error::Result;
use e2_image::Image;
use e2_ondisk::Ext2FileType;
use e2_types::{BitmapKind, InodeNumber};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    pub volume_name: String,
    pub block_size: u32,
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_inodes: u32,
    pub free_blocks: u32,
    pub group: GroupSummary,
    /// One character per bit, a space after every byte.
    pub block_bitmap: String,
    pub inode_bitmap: String,
    pub inodes: Vec<InodeSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks: u16,
    pub free_inodes: u16,
    pub used_dirs: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeSummary {
    pub ino: InodeNumber,
    pub file_type: Ext2FileType,
    pub size: u32,
    pub links: u16,
    pub sectors: u32,
    pub block: Vec<u32>,
    /// Records of a directory inode, empty for anything else.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<EntrySummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub ino: u32,
    pub rec_len: u16,
    pub file_type: Ext2FileType,
    pub name: String,
}

/// Summarise `image`. Live inodes are the root and every in-use inode from
/// the first user inode on.
pub fn inspect(image: &Image) -> Result<ImageSummary> {
    let sb = image.superblock()?;
    let gd = image.group_desc()?;
    let geometry = image.geometry();

    let mut inodes = Vec::new();
    let candidates =
        std::iter::once(InodeNumber::ROOT.0).chain(geometry.first_ino..=geometry.inodes_count);
    for raw in candidates {
        if !bit_at(image, BitmapKind::Inode, raw)? {
            continue;
        }
        let ino = InodeNumber(raw);
        let inode = image.inode(ino)?;
        let entries = if inode.is_dir() {
            records(image, ino)?
                .into_iter()
                .map(|record| EntrySummary {
                    ino: record.entry.inode,
                    rec_len: record.entry.rec_len,
                    file_type: record.entry.file_type,
                    name: record.entry.name_str(),
                })
                .collect()
        } else {
            Vec::new()
        };
        inodes.push(InodeSummary {
            ino,
            file_type: inode.file_type(),
            size: inode.size,
            links: inode.links_count,
            sectors: inode.blocks,
            block: inode.block.to_vec(),
            entries,
        });
    }

    Ok(ImageSummary {
        volume_name: sb.volume_name,
        block_size: sb.block_size,
        inodes_count: sb.inodes_count,
        blocks_count: sb.blocks_count,
        free_inodes: sb.free_inodes_count,
        free_blocks: sb.free_blocks_count,
        group: GroupSummary {
            block_bitmap: gd.block_bitmap,
            inode_bitmap: gd.inode_bitmap,
            inode_table: gd.inode_table,
            free_blocks: gd.free_blocks_count,
            free_inodes: gd.free_inodes_count,
            used_dirs: gd.used_dirs_count,
        },
        block_bitmap: bitmap_string(
            image.bitmap(BitmapKind::Block)?,
            geometry.bitmap_bits(BitmapKind::Block),
        ),
        inode_bitmap: bitmap_string(
            image.bitmap(BitmapKind::Inode)?,
            geometry.bitmap_bits(BitmapKind::Inode),
        ),
        inodes,
    })
}

fn bitmap_string(bitmap: &[u8], bits: u32) -> String {
    let bytes = (bits as usize).div_ceil(8).min(bitmap.len());
    let mut out = String::with_capacity(bytes * 9);
    for byte in &bitmap[..bytes] {
        for bit in 0..8 {
            out.push(if byte & (1 << bit) == 0 { '0' } else { '1' });
        }
        out.push(' ');
    }
    out.truncate(out.trim_end().len());
    out
}

fn type_char(file_type: Ext2FileType) -> char {
    match file_type {
        Ext2FileType::Dir => 'd',
        Ext2FileType::RegFile => 'f',
        Ext2FileType::Symlink => 'l',
        _ => '?',
    }
}

impl fmt::Display for ImageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.volume_name.is_empty() {
            writeln!(f, "Volume: {}", self.volume_name)?;
        }
        writeln!(f, "Inodes: {}", self.inodes_count)?;
        writeln!(f, "Blocks: {}", self.blocks_count)?;
        writeln!(f, "Block group:")?;
        writeln!(f, "    Blocks bitmap block: {}", self.group.block_bitmap)?;
        writeln!(f, "    Inodes bitmap block: {}", self.group.inode_bitmap)?;
        writeln!(f, "    Inodes table block: {}", self.group.inode_table)?;
        writeln!(f, "    Free blocks count: {}", self.group.free_blocks)?;
        writeln!(f, "    Free inodes count: {}", self.group.free_inodes)?;
        writeln!(f, "    Directories count: {}", self.group.used_dirs)?;
        writeln!(f, "Block bitmap: {}", self.block_bitmap)?;
        writeln!(f, "Inode bitmap: {}", self.inode_bitmap)?;
        writeln!(f)?;
        writeln!(f, "Inodes:")?;
        for inode in &self.inodes {
            writeln!(
                f,
                "[{}] type: {} size: {} links: {} i_blocks: {}",
                inode.ino,
                type_char(inode.file_type),
                inode.size,
                inode.links,
                inode.sectors
            )?;
            write!(f, "[{}] Blocks:", inode.ino)?;
            for block in inode.block.iter().filter(|b| **b != 0) {
                write!(f, " {block}")?;
            }
            writeln!(f)?;
        }
        writeln!(f)?;
        write!(f, "Directory Blocks:")?;
        for inode in self.inodes.iter().filter(|i| !i.entries.is_empty()) {
            writeln!(f)?;
            write!(f, "   DIR INODE NUMBER: {}", inode.ino)?;
            for entry in &inode.entries {
                writeln!(f)?;
                write!(
                    f,
                    "Inode: {} rec_len: {} name_len: {} type= {} name={}",
                    entry.ino,
                    entry.rec_len,
                    entry.name.len(),
                    type_char(entry.file_type),
                    entry.name
                )?;
            }
        }
        writeln!(f)
    }
}
