//! Unlinking and recursive delete.
//!
//! Deletion is logical: entries are absorbed, bitmap bits cleared and dtime
//! stamped, while inode contents and block data stay put for undelete.

use crate::path::{self, EntryFilter, Resolved};
use crate::{Ext2Fs, ensure_operable};
use e2_alloc::{release_blocks, set_bit};
use e2_error::{E2Error, Result};
use e2_image::Image;
use e2_types::{BitmapKind, InodeNumber};
use std::collections::HashSet;
use tracing::{debug, info, warn};

enum Step {
    /// First visit: directories schedule their children, files are unlinked.
    Visit {
        parent: InodeNumber,
        ino: InodeNumber,
        name: Vec<u8>,
    },
    /// A directory whose children are gone.
    Unlink {
        parent: InodeNumber,
        ino: InodeNumber,
        name: Vec<u8>,
    },
}

impl Ext2Fs {
    /// Remove the entry at `path`; directories need `recursive`.
    ///
    /// Returns how many inodes were released.
    pub fn remove(&mut self, path: &str, recursive: bool) -> Result<u32> {
        let Some(name) = path::file_name(path)? else {
            return Err(E2Error::NotPermittedName("/".to_owned()));
        };
        ensure_operable(name)?;
        let Resolved::Found { parent, target, .. } =
            self.resolve(path, EntryFilter::Any)?.require_parent(path)?
        else {
            return Err(E2Error::NotFound(path.to_owned()));
        };
        if self.image.inode(target)?.is_dir() && !recursive {
            return Err(E2Error::IsDirectory);
        }

        let now = self.now();
        let released = delete_tree(&mut self.image, parent, target, name, now)?;
        info!(target: "e2::core", path, ino = target.0, released, "removed");
        Ok(released)
    }
}

/// Post-order delete of `ino` (entry `name` in `parent`) and everything
/// below it, driven by an explicit stack.
fn delete_tree(
    image: &mut Image,
    parent: InodeNumber,
    ino: InodeNumber,
    name: &[u8],
    now: u32,
) -> Result<u32> {
    let mut stack = vec![Step::Visit {
        parent,
        ino,
        name: name.to_vec(),
    }];
    let mut seen = HashSet::new();
    let mut released = 0;

    while let Some(step) = stack.pop() {
        match step {
            Step::Visit { parent, ino, name } => {
                let inode = image.inode(ino)?;
                if !inode.is_dir() {
                    released += u32::from(unlink(image, parent, ino, &name, now)?);
                    continue;
                }
                if !seen.insert(ino) {
                    warn!(target: "e2::core", ino = ino.0, "directory reached twice, skipping");
                    continue;
                }

                let mut gd = image.group_desc()?;
                gd.used_dirs_count = gd.used_dirs_count.saturating_sub(1);
                image.write_group_desc(&gd)?;
                let mut parent_inode = image.inode(parent)?;
                parent_inode.links_count = parent_inode.links_count.saturating_sub(1);
                image.write_inode(parent, &parent_inode)?;

                let children = e2_dir::list(image, ino)?;
                stack.push(Step::Unlink { parent, ino, name });
                for child in children.into_iter().rev() {
                    if child.is_dot() || child.is_dotdot() {
                        continue;
                    }
                    stack.push(Step::Visit {
                        parent: ino,
                        ino: InodeNumber(child.inode),
                        name: child.name,
                    });
                }
            }
            Step::Unlink { parent, ino, name } => {
                released += u32::from(unlink(image, parent, ino, &name, now)?);
            }
        }
    }
    Ok(released)
}

/// Detach `name` from `parent` and drop one link from `ino`.
///
/// A file that still has other links keeps its inode and blocks. Otherwise
/// the blocks are released, dtime is stamped and the inode bit cleared.
/// Returns whether the inode was released.
fn unlink(
    image: &mut Image,
    parent: InodeNumber,
    ino: InodeNumber,
    name: &[u8],
    now: u32,
) -> Result<bool> {
    e2_dir::remove(image, parent, name)?;
    let mut inode = image.inode(ino)?;
    inode.links_count = inode.links_count.saturating_sub(1);

    if !inode.is_dir() && inode.links_count > 0 {
        inode.ctime = now;
        image.write_inode(ino, &inode)?;
        debug!(target: "e2::core", ino = ino.0, links = inode.links_count, "dropped link");
        return Ok(false);
    }

    let blocks = release_blocks(image, &inode)?;
    inode.dtime = now;
    image.write_inode(ino, &inode)?;
    set_bit(image, BitmapKind::Inode, ino.0, false)?;
    debug!(target: "e2::core", ino = ino.0, blocks, "released inode");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2_alloc::bit_at;
    use e2_image::FormatOptions;

    fn fresh() -> Ext2Fs {
        Ext2Fs::format(&FormatOptions::default())
            .unwrap()
            .with_fixed_time(4_242)
    }

    #[test]
    fn remove_file_releases_everything() {
        let mut fs = fresh();
        let before = fs.image().free_counts().unwrap();
        let ino = fs.copy_in("/f", &[7_u8; 3000]).unwrap();
        let pointers = fs.image().inode(ino).unwrap().block;

        assert_eq!(fs.remove("/f", false).unwrap(), 1);
        assert_eq!(fs.image().free_counts().unwrap(), before);
        assert!(!bit_at(fs.image(), BitmapKind::Inode, ino.0).unwrap());

        let inode = fs.image().inode(ino).unwrap();
        assert_eq!(inode.dtime, 4_242);
        assert_eq!(inode.links_count, 0);
        assert_eq!(inode.size, 3000);
        assert_eq!(inode.block, pointers);
        assert!(matches!(fs.lookup("/f"), Err(E2Error::NotFound(_))));
    }

    #[test]
    fn remove_directory_needs_recursive() {
        let mut fs = fresh();
        fs.mkdir("/d").unwrap();
        let before = fs.image().as_bytes().to_vec();
        assert!(matches!(fs.remove("/d", false), Err(E2Error::IsDirectory)));
        assert_eq!(fs.image().as_bytes(), before.as_slice());
    }

    #[test]
    fn remove_refuses_dot_names_and_root() {
        let mut fs = fresh();
        assert!(matches!(fs.remove("/", true), Err(E2Error::NotPermittedName(_))));
        assert!(matches!(
            fs.remove("/lost+found/..", true),
            Err(E2Error::NotPermittedName(_))
        ));
        assert!(matches!(fs.remove("/nothing", true), Err(E2Error::NotFound(_))));
    }

    #[test]
    fn recursive_remove_restores_counters() {
        let mut fs = fresh();
        let before = fs.image().free_counts().unwrap();
        let root_links = fs.stat(InodeNumber::ROOT).unwrap().links_count;
        let dirs = fs.image().group_desc().unwrap().used_dirs_count;

        fs.mkdir("/d").unwrap();
        fs.mkdir("/d/e").unwrap();
        fs.copy_in("/d/e/f", &[1_u8; 14 * 1024]).unwrap();
        fs.copy_in("/d/g", b"g").unwrap();

        assert_eq!(fs.remove("/d", true).unwrap(), 4);
        assert_eq!(fs.image().free_counts().unwrap(), before);
        assert_eq!(fs.image().group_desc().unwrap().used_dirs_count, dirs);
        assert_eq!(fs.stat(InodeNumber::ROOT).unwrap().links_count, root_links);
        let names: Vec<_> = fs.list_dir("/").unwrap().into_iter().map(|e| e.name_str()).collect();
        assert_eq!(names, vec![".", "..", "lost+found"]);
    }

    #[test]
    fn hard_linked_file_survives_one_unlink() {
        let mut fs = fresh();
        let ino = fs.copy_in("/a", b"shared").unwrap();
        fs.link("/a", "/b", false).unwrap();

        assert_eq!(fs.remove("/a", false).unwrap(), 0);
        assert!(bit_at(fs.image(), BitmapKind::Inode, ino.0).unwrap());
        assert_eq!(fs.stat(ino).unwrap().links_count, 1);
        assert_eq!(fs.read_file("/b").unwrap(), b"shared");

        assert_eq!(fs.remove("/b", false).unwrap(), 1);
        assert!(!bit_at(fs.image(), BitmapKind::Inode, ino.0).unwrap());
    }
}
