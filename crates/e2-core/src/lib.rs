#![forbid(unsafe_code)]
//! Path-level operations on a single-group ext2 image.
//!
//! [`Ext2Fs`] owns the [`Image`] and threads it through every operation.
//! Each mutating operation resolves its paths and checks every precondition
//! (names, existence, free inodes and blocks) before the first byte of the
//! image changes, so a returned error leaves the image untouched. The one
//! exception is [`Ext2Fs::restore`], which edits a record length
//! provisionally and rolls it back on failure.
//!
//! # Opening an image
//!
//! ```ignore
//! let mut fs = Ext2Fs::open("disk.img")?;
//! fs.mkdir("/docs")?;
//! fs.copy_in("/docs/readme", b"hello")?;
//! fs.flush()?;
//! ```

mod create;
mod delete;
pub mod path;
mod restore;

pub use path::{EntryFilter, MissingReason, Resolved};

use e2_alloc::block_refs;
use e2_error::{E2Error, Result};
use e2_image::{FormatOptions, Image, OpenOptions, format};
use e2_ondisk::{Ext2FileType, Ext2Inode};
use e2_types::InodeNumber;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// An open filesystem image.
#[derive(Debug)]
pub struct Ext2Fs {
    image: Image,
    fixed_time: Option<u32>,
}

impl Ext2Fs {
    /// Open the image at `path` for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        Ok(Self::from_image(Image::open_with_options(path, options)?))
    }

    /// Format a fresh in-memory image.
    pub fn format(options: &FormatOptions) -> Result<Self> {
        Ok(Self::from_image(format(options)?))
    }

    #[must_use]
    pub fn from_image(image: Image) -> Self {
        Self {
            image,
            fixed_time: None,
        }
    }

    /// Stamp every timestamp with `time` instead of the wall clock.
    #[must_use]
    pub fn with_fixed_time(mut self, time: u32) -> Self {
        self.fixed_time = Some(time);
        self
    }

    /// Seconds since the epoch, as stored in inode timestamps.
    #[must_use]
    pub fn now(&self) -> u32 {
        self.fixed_time.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        })
    }

    #[must_use]
    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Image {
        &mut self.image
    }

    #[must_use]
    pub fn into_image(self) -> Image {
        self.image
    }

    /// Write the image back to its file.
    pub fn flush(&self) -> Result<()> {
        self.image.flush()
    }

    pub fn resolve(&self, path: &str, filter: EntryFilter) -> Result<Resolved> {
        path::resolve(&self.image, path, filter)
    }

    /// Resolve `path` to an existing inode.
    pub fn lookup(&self, path: &str) -> Result<InodeNumber> {
        match self.resolve(path, EntryFilter::Any)?.require_parent(path)? {
            Resolved::Found { target, .. } => Ok(target),
            _ => Err(E2Error::NotFound(path.to_owned())),
        }
    }

    // ── Read side ─────────────────────────────────────────────────────

    pub fn stat(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let inode = self.image.inode(ino)?;
        Ok(InodeAttr::from_inode(ino, &inode))
    }

    /// Live entries of the directory at `path`, "." and ".." included.
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let ino = self.lookup(path)?;
        Ok(e2_dir::list(&self.image, ino)?
            .into_iter()
            .map(|entry| DirEntry {
                ino: InodeNumber(entry.inode),
                file_type: entry.file_type,
                name: entry.name,
            })
            .collect())
    }

    /// Contents of the regular file or symlink at `path`.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let ino = self.lookup(path)?;
        let inode = self.image.inode(ino)?;
        if inode.is_dir() {
            return Err(E2Error::IsDirectory);
        }
        let size = inode.size as usize;
        let refs = block_refs(&self.image, &inode)?;
        let mut out = Vec::with_capacity(size);
        for block in refs.data_blocks() {
            if out.len() >= size {
                break;
            }
            let data = self.image.block(block)?;
            let take = (size - out.len()).min(data.len());
            out.extend_from_slice(&data[..take]);
        }
        Ok(out)
    }
}

/// Inode attributes for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub file_type: Ext2FileType,
    pub perm: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub links_count: u16,
    /// 512-byte sectors.
    pub sectors: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub generation: u32,
}

impl InodeAttr {
    #[must_use]
    pub fn from_inode(ino: InodeNumber, inode: &Ext2Inode) -> Self {
        Self {
            ino,
            file_type: inode.file_type(),
            perm: inode.permission_bits(),
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            links_count: inode.links_count,
            sectors: inode.blocks,
            atime: inode.atime,
            ctime: inode.ctime,
            mtime: inode.mtime,
            dtime: inode.dtime,
            generation: inode.generation,
        }
    }
}

/// A live directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot_or_dotdot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

/// Refuse to operate on "." or "..".
fn ensure_operable(name: &[u8]) -> Result<()> {
    if name == b"." || name == b".." {
        return Err(E2Error::NotPermittedName(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    Ok(())
}
