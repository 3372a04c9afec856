//! Absolute path resolution.
//!
//! A path is split on `/` with empty components dropped, so `//a/` and `/a`
//! name the same entry. Every component but the last must be a directory
//! entry; the last one is additionally filtered by an [`EntryFilter`].

use e2_dir::lookup;
use e2_error::{E2Error, Result};
use e2_image::Image;
use e2_ondisk::Ext2FileType;
use e2_types::InodeNumber;
use tracing::trace;

/// Which entry types the final component may resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFilter {
    Any,
    Kind(Ext2FileType),
}

impl EntryFilter {
    #[must_use]
    pub fn accepts(self, file_type: Ext2FileType) -> bool {
        match self {
            Self::Any => true,
            Self::Kind(kind) => kind == file_type,
        }
    }
}

/// Why a path stopped resolving before its parent directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingReason {
    /// An intermediate component does not exist.
    Absent,
    /// An intermediate component exists but is not a directory.
    NotADirectory,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// The parent directory itself could not be reached.
    Missing(MissingReason),
    /// The parent exists; the final component is absent or filtered out.
    ParentOnly { parent: InodeNumber },
    /// Both exist. For `/` parent and target are the root.
    Found {
        parent: InodeNumber,
        target: InodeNumber,
        file_type: Ext2FileType,
    },
}

impl Resolved {
    /// The parent directory, if it was reached.
    #[must_use]
    pub fn parent(&self) -> Option<InodeNumber> {
        match *self {
            Self::Missing(_) => None,
            Self::ParentOnly { parent } | Self::Found { parent, .. } => Some(parent),
        }
    }

    #[must_use]
    pub fn target(&self) -> Option<InodeNumber> {
        match *self {
            Self::Found { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Turn a missing parent into the matching error.
    pub fn require_parent(self, path: &str) -> Result<Self> {
        match self {
            Self::Missing(MissingReason::Absent) => Err(E2Error::NotFound(path.to_owned())),
            Self::Missing(MissingReason::NotADirectory) => Err(E2Error::NotDirectory),
            other => Ok(other),
        }
    }
}

/// Split an absolute path into its non-empty components.
pub fn components(path: &str) -> Result<Vec<&[u8]>> {
    if !path.starts_with('/') {
        return Err(E2Error::InvalidPath(format!(
            "'{path}' is not an absolute path"
        )));
    }
    Ok(path
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::as_bytes)
        .collect())
}

/// The final component of `path`, or `None` for `/`.
pub fn file_name(path: &str) -> Result<Option<&[u8]>> {
    Ok(components(path)?.last().copied())
}

/// Walk `path` from the root directory.
pub fn resolve(image: &Image, path: &str, filter: EntryFilter) -> Result<Resolved> {
    let parts = components(path)?;
    let Some((last, intermediate)) = parts.split_last() else {
        return Ok(Resolved::Found {
            parent: InodeNumber::ROOT,
            target: InodeNumber::ROOT,
            file_type: Ext2FileType::Dir,
        });
    };

    let mut dir = InodeNumber::ROOT;
    for part in intermediate {
        match lookup(image, dir, part)? {
            Some(record) if record.entry.file_type == Ext2FileType::Dir => {
                dir = InodeNumber(record.entry.inode);
            }
            Some(_) => return Ok(Resolved::Missing(MissingReason::NotADirectory)),
            None => return Ok(Resolved::Missing(MissingReason::Absent)),
        }
    }

    let resolved = match lookup(image, dir, last)? {
        Some(record) if filter.accepts(record.entry.file_type) => Resolved::Found {
            parent: dir,
            target: InodeNumber(record.entry.inode),
            file_type: record.entry.file_type,
        },
        _ => Resolved::ParentOnly { parent: dir },
    };
    trace!(target: "e2::path", path, ?resolved, "resolved");
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2_image::{FormatOptions, format};

    #[test]
    fn components_require_absolute_paths() {
        assert!(matches!(components("a/b"), Err(E2Error::InvalidPath(_))));
        assert!(matches!(components(""), Err(E2Error::InvalidPath(_))));
        assert_eq!(
            components("//a///b/").unwrap(),
            vec![b"a".as_slice(), b"b".as_slice()]
        );
        assert!(components("/").unwrap().is_empty());
    }

    #[test]
    fn file_name_of_root_is_none() {
        assert_eq!(file_name("/").unwrap(), None);
        assert_eq!(file_name("/x/y").unwrap(), Some(b"y".as_slice()));
    }

    #[test]
    fn root_resolves_to_itself() {
        let image = format(&FormatOptions::default()).unwrap();
        assert_eq!(
            resolve(&image, "/", EntryFilter::Any).unwrap(),
            Resolved::Found {
                parent: InodeNumber::ROOT,
                target: InodeNumber::ROOT,
                file_type: Ext2FileType::Dir,
            }
        );
    }

    #[test]
    fn lost_and_found_resolves() {
        let image = format(&FormatOptions::default()).unwrap();
        let resolved = resolve(&image, "/lost+found", EntryFilter::Any).unwrap();
        assert_eq!(resolved.parent(), Some(InodeNumber::ROOT));
        assert_eq!(resolved.target(), Some(InodeNumber(11)));
    }

    #[test]
    fn filter_turns_type_mismatch_into_parent_only() {
        let image = format(&FormatOptions::default()).unwrap();
        assert_eq!(
            resolve(
                &image,
                "/lost+found",
                EntryFilter::Kind(Ext2FileType::RegFile)
            )
            .unwrap(),
            Resolved::ParentOnly {
                parent: InodeNumber::ROOT
            }
        );
    }

    #[test]
    fn missing_intermediate_is_missing() {
        let image = format(&FormatOptions::default()).unwrap();
        let resolved = resolve(&image, "/nope/x", EntryFilter::Any).unwrap();
        assert_eq!(resolved, Resolved::Missing(MissingReason::Absent));
        assert!(matches!(
            resolved.require_parent("/nope/x"),
            Err(E2Error::NotFound(_))
        ));
    }

    #[test]
    fn absent_leaf_is_parent_only() {
        let image = format(&FormatOptions::default()).unwrap();
        assert_eq!(
            resolve(&image, "/lost+found/new", EntryFilter::Any).unwrap(),
            Resolved::ParentOnly {
                parent: InodeNumber(11)
            }
        );
    }
}
