//! Reachability-driven consistency check and repair.
//!
//! The pass walks the tree from the root. For every reachable inode it
//! makes the entry's type tag agree with the inode, marks the inode in use,
//! clears a stale deletion time and marks every referenced block. Bits are
//! written without moving the free counters; once the walk is done both
//! counters are recomputed from the bitmaps and overwritten where they
//! disagree.
//!
//! Every repair is recorded as a [`Finding`] whose `Display` is the line
//! printed for it.

use e2_alloc::{assign_bit, bit_at, block_refs, count_free};
use e2_dir::{dir_blocks, lookup, records, set_entry_type};
use e2_error::{E2Error, Result};
use e2_image::Image;
use e2_ondisk::Ext2FileType;
use e2_types::{BitmapKind, BlockNumber, InodeNumber};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

/// Which free counter a counter finding is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    FreeInodes,
    FreeBlocks,
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FreeInodes => f.write_str("free inodes"),
            Self::FreeBlocks => f.write_str("free blocks"),
        }
    }
}

/// One repair made by [`check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    /// The entry naming `ino` carried a different type than the inode.
    EntryType { ino: InodeNumber },
    /// A reachable inode was free in the inode bitmap.
    InodeBit { ino: InodeNumber },
    /// A reachable inode had a deletion time.
    Dtime { ino: InodeNumber },
    /// `count` blocks of `ino` were free in the block bitmap.
    BlockBits { ino: InodeNumber, count: u32 },
    SuperblockCounter { what: CounterKind, off_by: u32 },
    GroupCounter { what: CounterKind, off_by: u32 },
}

impl Finding {
    /// How many inconsistencies this finding accounts for.
    #[must_use]
    pub fn repairs(&self) -> u32 {
        match self {
            Self::BlockBits { count, .. } => *count,
            _ => 1,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryType { ino } => {
                write!(f, "Fixed: Entry type vs inode mismatch: inode [{ino}]")
            }
            Self::InodeBit { ino } => write!(f, "Fixed: inode [{ino}] not marked as in-use"),
            Self::Dtime { ino } => write!(f, "Fixed: valid inode marked for deletion: [{ino}]"),
            Self::BlockBits { ino, count } => write!(
                f,
                "Fixed: {count} in-use data blocks not marked in data bitmap for inode: [{ino}]"
            ),
            Self::SuperblockCounter { what, off_by } => write!(
                f,
                "Fixed: superblock's {what} counter was off by {off_by} compared to the bitmap"
            ),
            Self::GroupCounter { what, off_by } => write!(
                f,
                "Fixed: block group's {what} counter was off by {off_by} compared to the bitmap"
            ),
        }
    }
}

/// Everything one [`check`] pass repaired, in the order it was found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub findings: Vec<Finding>,
}

impl CheckReport {
    /// Total inconsistencies repaired; zero means the image was consistent.
    #[must_use]
    pub fn repairs(&self) -> u32 {
        self.findings.iter().map(Finding::repairs).sum()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// The closing line of a report.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.repairs() {
            0 => "No file system inconsistencies detected!".to_owned(),
            n => format!("{n} file system inconsistencies repaired!"),
        }
    }

    fn push(&mut self, finding: Finding) {
        debug!(target: "e2::repair", %finding, "repaired");
        self.findings.push(finding);
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for finding in &self.findings {
            writeln!(f, "{finding}")?;
        }
        write!(f, "{}", self.summary())
    }
}

enum Step {
    /// Check the inode itself against the record (`block`, `offset`) naming it.
    Visit {
        ino: InodeNumber,
        block: BlockNumber,
        offset: usize,
        recorded: Ext2FileType,
    },
    /// Mark the inode's blocks, after everything below it.
    Blocks { ino: InodeNumber },
}

/// Check the image from the root down and repair what is found.
pub fn check(image: &mut Image) -> Result<CheckReport> {
    let mut report = CheckReport::default();

    // The root is named by its own "." record.
    let Some(dot) = lookup(image, InodeNumber::ROOT, b".")? else {
        let block = dir_blocks(image, InodeNumber::ROOT)?
            .first()
            .map_or(0, |b| b.0);
        return Err(E2Error::corruption(block, "root directory has no \".\" entry"));
    };
    let mut stack = vec![Step::Visit {
        ino: InodeNumber::ROOT,
        block: dot.block,
        offset: dot.offset,
        recorded: dot.entry.file_type,
    }];
    let mut seen_dirs = HashSet::new();

    while let Some(step) = stack.pop() {
        match step {
            Step::Visit {
                ino,
                block,
                offset,
                recorded,
            } => {
                if !image.geometry().contains_inode(ino) {
                    warn!(target: "e2::repair", ino = ino.0, "entry names an inode outside the table");
                    continue;
                }
                let is_dir = check_inode(image, &mut report, ino, block, offset, recorded)?;
                stack.push(Step::Blocks { ino });
                if !is_dir || !seen_dirs.insert(ino) {
                    continue;
                }
                for record in records(image, ino)?.into_iter().rev() {
                    if record.entry.is_dot() || record.entry.is_dotdot() {
                        continue;
                    }
                    stack.push(Step::Visit {
                        ino: InodeNumber(record.entry.inode),
                        block: record.block,
                        offset: record.offset,
                        recorded: record.entry.file_type,
                    });
                }
            }
            Step::Blocks { ino } => {
                let count = mark_blocks(image, ino)?;
                if count > 0 {
                    report.push(Finding::BlockBits { ino, count });
                }
            }
        }
    }

    fix_counters(image, &mut report)?;
    if report.is_clean() {
        info!(target: "e2::repair", "image is consistent");
    } else {
        warn!(
            target: "e2::repair",
            findings = report.findings.len(),
            repairs = report.repairs(),
            "image repaired"
        );
    }
    Ok(report)
}

/// Entry type, inode bit and dtime of one reachable inode. Returns whether
/// the inode is a directory.
fn check_inode(
    image: &mut Image,
    report: &mut CheckReport,
    ino: InodeNumber,
    block: BlockNumber,
    offset: usize,
    recorded: Ext2FileType,
) -> Result<bool> {
    let mut inode = image.inode(ino)?;
    let actual = inode.file_type();
    if recorded != actual {
        set_entry_type(image, block, offset, actual)?;
        report.push(Finding::EntryType { ino });
    }
    if !bit_at(image, BitmapKind::Inode, ino.0)? {
        assign_bit(image, BitmapKind::Inode, ino.0, true)?;
        report.push(Finding::InodeBit { ino });
    }
    if inode.is_deleted() {
        inode.dtime = 0;
        image.write_inode(ino, &inode)?;
        report.push(Finding::Dtime { ino });
    }
    Ok(inode.is_dir())
}

/// Set the bit of every block `ino` references; returns how many were unset.
fn mark_blocks(image: &mut Image, ino: InodeNumber) -> Result<u32> {
    let inode = image.inode(ino)?;
    let refs = block_refs(image, &inode)?;
    let mut count = 0;
    for block in refs.all() {
        if assign_bit(image, BitmapKind::Block, block.0, true)? {
            count += 1;
        }
    }
    if count > 0 {
        debug!(target: "e2::repair", ino = ino.0, count, "marked blocks");
    }
    Ok(count)
}

/// Overwrite free counters that disagree with the bitmaps.
fn fix_counters(image: &mut Image, report: &mut CheckReport) -> Result<()> {
    let free_inodes = count_free(image, BitmapKind::Inode)?;
    let free_blocks = count_free(image, BitmapKind::Block)?;
    let narrow = |value: u32| {
        u16::try_from(value).map_err(|_| {
            E2Error::corruption(
                image.geometry().inode_bitmap.0,
                format!("free count {value} does not fit the group descriptor"),
            )
        })
    };
    let gd_inodes = narrow(free_inodes)?;
    let gd_blocks = narrow(free_blocks)?;

    let mut counts = image.free_counts()?;
    let before = counts;
    if counts.sb_free_inodes != free_inodes {
        report.push(Finding::SuperblockCounter {
            what: CounterKind::FreeInodes,
            off_by: counts.sb_free_inodes.abs_diff(free_inodes),
        });
        counts.sb_free_inodes = free_inodes;
    }
    if counts.sb_free_blocks != free_blocks {
        report.push(Finding::SuperblockCounter {
            what: CounterKind::FreeBlocks,
            off_by: counts.sb_free_blocks.abs_diff(free_blocks),
        });
        counts.sb_free_blocks = free_blocks;
    }
    if counts.gd_free_inodes != gd_inodes {
        report.push(Finding::GroupCounter {
            what: CounterKind::FreeInodes,
            off_by: u32::from(counts.gd_free_inodes.abs_diff(gd_inodes)),
        });
        counts.gd_free_inodes = gd_inodes;
    }
    if counts.gd_free_blocks != gd_blocks {
        report.push(Finding::GroupCounter {
            what: CounterKind::FreeBlocks,
            off_by: u32::from(counts.gd_free_blocks.abs_diff(gd_blocks)),
        });
        counts.gd_free_blocks = gd_blocks;
    }
    if counts != before {
        image.set_free_counts(&counts)?;
    }
    Ok(())
}
