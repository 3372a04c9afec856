#![forbid(unsafe_code)]
//! On-disk format parsing for ext2 structures.
//!
//! Pure parsing crate with no I/O. It parses byte slices into
//! typed Rust structures (superblock, group descriptor, inode, directory
//! record) and patches those structures back into byte slices, leaving every
//! byte the model does not cover untouched.

pub mod ext2;

pub use ext2::{
    DIR_ENTRY_HEADER_LEN, EXT2_FEATURE_INCOMPAT_FILETYPE, EXT2_GROUP_DESC_SIZE, Ext2DirEntry,
    Ext2DirEntryRef, Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock, parse_dir_record,
    required_rec_len, write_dir_record, write_rec_len,
};
