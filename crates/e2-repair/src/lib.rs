#![forbid(unsafe_code)]
//! Consistency checking and inspection for ext2 images.

pub mod check;
pub mod inspect;

pub use check::{CheckReport, CounterKind, Finding, check};
pub use inspect::{ImageSummary, inspect};
