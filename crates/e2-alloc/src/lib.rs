#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on a bitmap byte slice.
//! 2. **Image bitmaps**: 1-based inode/block indices on a live [`Image`],
//!    with the superblock and group-descriptor free counters moved together.
//! 3. **Inode & block allocator** ([`inode`]): builds new inodes and
//!    assigns or releases their data blocks.
//!
//! Lookup and commit are separate steps: [`find_free`] never mutates and
//! [`allocate`] is `find_free` followed by [`set_bit`].

pub mod inode;

pub use inode::{
    BlockRefs, block_refs, blocks_needed, create_inode, init_empty_dir_block, mark_blocks,
    release_blocks,
};

use e2_error::{E2Error, Result};
use e2_image::{FreeCounts, Image};
use e2_types::BitmapKind;
use tracing::{debug, trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// Lowest free (zero) bit among the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32) -> Option<u32> {
    (0..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Image bitmaps ───────────────────────────────────────────────────────────

fn bit_position(image: &Image, kind: BitmapKind, index: u32) -> Result<u32> {
    let geometry = image.geometry();
    geometry.bit_of(kind, index).ok_or_else(|| {
        let block = match kind {
            BitmapKind::Inode => geometry.inode_bitmap,
            BitmapKind::Block => geometry.block_bitmap,
        };
        E2Error::corruption(block.0, format!("{kind} index {index} outside the bitmap"))
    })
}

/// Whether 1-based `index` is marked in use.
pub fn bit_at(image: &Image, kind: BitmapKind, index: u32) -> Result<bool> {
    let bit = bit_position(image, kind, index)?;
    Ok(bitmap_get(image.bitmap(kind)?, bit))
}

/// Set or clear the bit for `index` and move both free counters with it.
///
/// Returns whether the bit changed. Writing a bit to the value it already
/// holds leaves the counters alone.
pub fn set_bit(image: &mut Image, kind: BitmapKind, index: u32, value: bool) -> Result<bool> {
    let changed = assign_bit(image, kind, index, value)?;
    if changed {
        adjust_free(image, kind, !value)?;
    }
    Ok(changed)
}

/// Set or clear the bit for `index` without touching the free counters.
///
/// Only for repair passes that recompute the counters from the bitmaps
/// afterwards.
pub fn assign_bit(image: &mut Image, kind: BitmapKind, index: u32, value: bool) -> Result<bool> {
    let bit = bit_position(image, kind, index)?;
    let bitmap = image.bitmap_mut(kind)?;
    if bitmap_get(bitmap, bit) == value {
        return Ok(false);
    }
    if value {
        bitmap_set(bitmap, bit);
    } else {
        bitmap_clear(bitmap, bit);
    }
    trace!(target: "e2::alloc", %kind, index, value, "bit flipped");
    Ok(true)
}

/// Lowest free 1-based index, or `None` when the bitmap is full.
pub fn find_free(image: &Image, kind: BitmapKind) -> Result<Option<u32>> {
    let geometry = image.geometry();
    let bits = geometry.bitmap_bits(kind);
    Ok(bitmap_find_free(image.bitmap(kind)?, bits).map(|bit| geometry.index_of(kind, bit)))
}

/// Claim the lowest free index.
pub fn allocate(image: &mut Image, kind: BitmapKind) -> Result<u32> {
    let Some(index) = find_free(image, kind)? else {
        debug!(target: "e2::alloc", %kind, "bitmap full");
        return Err(E2Error::NoSpace);
    };
    set_bit(image, kind, index, true)?;
    debug!(target: "e2::alloc", %kind, index, "allocated");
    Ok(index)
}

/// Free bits according to the bitmap itself (ignores the counters).
pub fn count_free(image: &Image, kind: BitmapKind) -> Result<u32> {
    let bits = image.geometry().bitmap_bits(kind);
    Ok(bitmap_count_free(image.bitmap(kind)?, bits))
}

fn adjust_free(image: &mut Image, kind: BitmapKind, freed: bool) -> Result<()> {
    let mut counts = image.free_counts()?;
    let FreeCounts {
        sb_free_blocks,
        sb_free_inodes,
        gd_free_blocks,
        gd_free_inodes,
    } = &mut counts;
    let (sb, gd) = match kind {
        BitmapKind::Inode => (sb_free_inodes, gd_free_inodes),
        BitmapKind::Block => (sb_free_blocks, gd_free_blocks),
    };
    if freed {
        *sb = sb.saturating_add(1);
        *gd = gd.saturating_add(1);
    } else {
        if *sb == 0 || *gd == 0 {
            warn!(target: "e2::alloc", %kind, sb = *sb, gd = *gd, "free counter already zero");
        }
        *sb = sb.saturating_sub(1);
        *gd = gd.saturating_sub(1);
    }
    image.set_free_counts(&counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2_image::{FormatOptions, format};

    fn reference() -> Image {
        format(&FormatOptions::default()).expect("format")
    }

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 9);
        assert_eq!(bm[1], 0b0000_0010);
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));
        // Out-of-range indices are ignored.
        bitmap_set(&mut bm, 100);
        assert!(!bitmap_get(&bm, 100));
    }

    #[test]
    fn bitmap_count_free_partial_byte() {
        let bm = [0xFF_u8, 0b0000_0101];
        assert_eq!(bitmap_count_free(&bm, 8), 0);
        assert_eq!(bitmap_count_free(&bm, 11), 1);
        assert_eq!(bitmap_count_free(&bm, 16), 6);
    }

    #[test]
    fn bitmap_find_free_lowest() {
        let bm = [0xFF_u8, 0b1111_1011];
        assert_eq!(bitmap_find_free(&bm, 16), Some(10));
        assert_eq!(bitmap_find_free(&bm, 10), None);
    }

    #[test]
    fn set_bit_moves_both_counters_together() {
        let mut image = reference();
        let before = image.free_counts().expect("counts");
        assert!(set_bit(&mut image, BitmapKind::Block, 50, true).expect("set"));
        let after = image.free_counts().expect("counts");
        assert_eq!(after.sb_free_blocks, before.sb_free_blocks - 1);
        assert_eq!(after.gd_free_blocks, before.gd_free_blocks - 1);
        assert_eq!(after.sb_free_inodes, before.sb_free_inodes);

        assert!(set_bit(&mut image, BitmapKind::Block, 50, false).expect("clear"));
        assert_eq!(image.free_counts().expect("counts"), before);
    }

    #[test]
    fn set_bit_to_current_value_is_a_no_op() {
        let mut image = reference();
        let before = image.free_counts().expect("counts");
        assert!(!set_bit(&mut image, BitmapKind::Inode, 2, true).expect("root already set"));
        assert!(!set_bit(&mut image, BitmapKind::Block, 60, false).expect("already clear"));
        assert_eq!(image.free_counts().expect("counts"), before);
    }

    #[test]
    fn assign_bit_leaves_counters_alone() {
        let mut image = reference();
        let before = image.free_counts().expect("counts");
        assert!(assign_bit(&mut image, BitmapKind::Inode, 20, true).expect("assign"));
        assert!(bit_at(&image, BitmapKind::Inode, 20).expect("bit"));
        assert_eq!(image.free_counts().expect("counts"), before);
    }

    #[test]
    fn out_of_range_indices_are_errors() {
        let mut image = reference();
        assert!(bit_at(&image, BitmapKind::Inode, 0).is_err());
        assert!(bit_at(&image, BitmapKind::Inode, 33).is_err());
        assert!(bit_at(&image, BitmapKind::Block, 0).is_err());
        assert!(bit_at(&image, BitmapKind::Block, 128).is_err());
        assert!(set_bit(&mut image, BitmapKind::Block, 128, true).is_err());
    }

    #[test]
    fn allocate_returns_lowest_free_index() {
        let mut image = reference();
        assert_eq!(find_free(&image, BitmapKind::Inode).expect("find"), Some(12));
        assert_eq!(allocate(&mut image, BitmapKind::Inode).expect("alloc"), 12);
        assert_eq!(allocate(&mut image, BitmapKind::Inode).expect("alloc"), 13);
        assert_eq!(find_free(&image, BitmapKind::Block).expect("find"), Some(11));
        assert_eq!(allocate(&mut image, BitmapKind::Block).expect("alloc"), 11);
    }

    #[test]
    fn allocate_reports_no_space_when_full() {
        let mut image = reference();
        let free = count_free(&image, BitmapKind::Inode).expect("count");
        for _ in 0..free {
            allocate(&mut image, BitmapKind::Inode).expect("alloc");
        }
        assert_eq!(find_free(&image, BitmapKind::Inode).expect("find"), None);
        assert!(matches!(
            allocate(&mut image, BitmapKind::Inode),
            Err(E2Error::NoSpace)
        ));
        let counts = image.free_counts().expect("counts");
        assert_eq!(counts.sb_free_inodes, 0);
        assert_eq!(counts.gd_free_inodes, 0);
    }

    #[test]
    fn counters_track_bitmap_through_allocations() {
        let mut image = reference();
        for _ in 0..40 {
            allocate(&mut image, BitmapKind::Block).expect("alloc");
        }
        for index in (20..40).step_by(3) {
            set_bit(&mut image, BitmapKind::Block, index, false).expect("free");
        }
        let counts = image.free_counts().expect("counts");
        let live = count_free(&image, BitmapKind::Block).expect("count");
        assert_eq!(counts.sb_free_blocks, live);
        assert_eq!(u32::from(counts.gd_free_blocks), live);
    }

    proptest::proptest! {
        #[test]
        fn random_set_clear_keeps_counters_equal_to_bitmap(
            ops in proptest::collection::vec((11_u32..128, proptest::bool::ANY), 0..200)
        ) {
            let mut image = reference();
            for (index, value) in ops {
                set_bit(&mut image, BitmapKind::Block, index, value).expect("set");
            }
            let counts = image.free_counts().expect("counts");
            let live = count_free(&image, BitmapKind::Block).expect("count");
            proptest::prop_assert_eq!(counts.sb_free_blocks, live);
            proptest::prop_assert_eq!(u32::from(counts.gd_free_blocks), live);
        }
    }
}
