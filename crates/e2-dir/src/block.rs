//! Record-level edits inside a single directory block.
//!
//! Nothing here knows about inodes or the image; every function takes the
//! raw block buffer. Errors are [`ParseError`]s and the directory layer
//! attaches the block number.

use e2_ondisk::{
    Ext2DirEntryRef, Ext2FileType, parse_dir_record, required_rec_len, write_dir_record,
    write_rec_len,
};
use e2_types::{ParseError, write_le_u32, write_u8};

/// Walks the record chain of one directory block.
///
/// Each step is bounds-checked by [`parse_dir_record`], so a record can never
/// run past the block; the cursor stops exactly when the record lengths have
/// summed to the block size. A malformed record is yielded once as an error
/// and ends the walk.
#[derive(Debug, Clone)]
pub struct RecordCursor<'a> {
    block: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> RecordCursor<'a> {
    #[must_use]
    pub fn new(block: &'a [u8]) -> Self {
        Self {
            block,
            offset: 0,
            failed: false,
        }
    }

    /// Offset of the next record to be yielded.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for RecordCursor<'a> {
    type Item = Result<(usize, Ext2DirEntryRef<'a>), ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.block.len() {
            return None;
        }
        match parse_dir_record(self.block, self.offset) {
            Ok(record) => {
                let at = self.offset;
                self.offset += usize::from(record.rec_len);
                Some(Ok((at, record)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Verify the chain and return its record count.
pub fn check_chain(block: &[u8]) -> Result<usize, ParseError> {
    let mut count = 0;
    let mut sum = 0_usize;
    for item in RecordCursor::new(block) {
        let (_, record) = item?;
        sum += usize::from(record.rec_len);
        count += 1;
    }
    if sum != block.len() || count == 0 {
        return Err(ParseError::InvalidField {
            field: "rec_len",
            reason: "record lengths do not sum to the block size",
        });
    }
    Ok(count)
}

fn last_record(block: &[u8]) -> Result<(usize, Ext2DirEntryRef<'_>), ParseError> {
    let mut last = None;
    for item in RecordCursor::new(block) {
        last = Some(item?);
    }
    last.ok_or(ParseError::InvalidField {
        field: "rec_len",
        reason: "directory block holds no records",
    })
}

/// Where a new record of `name_len` bytes would land after the final record.
///
/// Returns `(offset of the final record, its new rec_len, offset of the new
/// record, rec_len of the new record)`. An empty final record is replaced
/// whole rather than split.
fn append_slot(
    block: &[u8],
    name_len: usize,
) -> Result<Option<(usize, u16, usize, u16)>, ParseError> {
    let need = required_rec_len(name_len);
    let (offset, last) = last_record(block)?;
    let rec_len = usize::from(last.rec_len);

    if last.is_empty() {
        return Ok((rec_len >= need).then_some((offset, last.rec_len, offset, last.rec_len)));
    }

    let own = last.actual_size();
    let slack = rec_len - own;
    if slack < need {
        return Ok(None);
    }
    let shrunk = rec_len_u16(own)?;
    let rest = rec_len_u16(slack)?;
    Ok(Some((offset, shrunk, offset + own, rest)))
}

fn rec_len_u16(len: usize) -> Result<u16, ParseError> {
    u16::try_from(len).map_err(|_| ParseError::IntegerConversion { field: "rec_len" })
}

/// Whether a record for a `name_len`-byte name fits after the final record.
pub fn has_room(block: &[u8], name_len: usize) -> Result<bool, ParseError> {
    Ok(append_slot(block, name_len)?.is_some())
}

/// Append a record after the final one, splitting its slack.
///
/// Returns the offset of the new record, or `None` when the slack is too
/// small (the block is left untouched in that case).
pub fn append(
    block: &mut [u8],
    ino: u32,
    name: &[u8],
    file_type: Ext2FileType,
) -> Result<Option<usize>, ParseError> {
    let Some((last_offset, shrunk, offset, rec_len)) = append_slot(block, name.len())? else {
        return Ok(None);
    };
    if last_offset != offset {
        write_rec_len(block, last_offset, shrunk)?;
    }
    write_dir_record(block, offset, ino, rec_len, file_type, name)?;
    Ok(Some(offset))
}

/// A record detached by [`absorb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Absorbed {
    pub offset: usize,
    pub inode: u32,
    pub file_type: Ext2FileType,
}

/// Detach the live record named `name`.
///
/// Its length is folded into the record immediately before it and its bytes
/// stay where they are. A match at offset 0 has no predecessor, so only its
/// inode field is zeroed.
pub fn absorb(block: &mut [u8], name: &[u8]) -> Result<Option<Absorbed>, ParseError> {
    let mut previous: Option<(usize, u16)> = None;
    let mut found = None;
    for item in RecordCursor::new(block) {
        let (offset, record) = item?;
        if !record.is_empty() && record.name == name {
            found = Some((previous, offset, record.rec_len, record.inode, record.file_type));
            break;
        }
        previous = Some((offset, record.rec_len));
    }

    let Some((previous, offset, rec_len, inode, file_type)) = found else {
        return Ok(None);
    };
    match previous {
        Some((prev_offset, prev_len)) => {
            let merged = u16::checked_add(prev_len, rec_len)
                .ok_or(ParseError::IntegerConversion { field: "rec_len" })?;
            write_rec_len(block, prev_offset, merged)?;
        }
        None => write_le_u32(block, offset, 0)?,
    }
    Ok(Some(Absorbed {
        offset,
        inode,
        file_type,
    }))
}

/// Find the live record named `name`.
pub fn find<'a>(
    block: &'a [u8],
    name: &[u8],
) -> Result<Option<(usize, Ext2DirEntryRef<'a>)>, ParseError> {
    for item in RecordCursor::new(block) {
        let (offset, record) = item?;
        if !record.is_empty() && record.name == name {
            return Ok(Some((offset, record)));
        }
    }
    Ok(None)
}

/// A deleted record still sitting inside the slack of a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiddenRecord {
    /// The live record that absorbed it.
    pub live_offset: usize,
    /// The live record's current (absorbing) length.
    pub live_rec_len: u16,
    pub offset: usize,
    pub inode: u32,
    pub file_type: Ext2FileType,
}

/// Look for an absorbed record named `name` directly after a live record.
///
/// The live record must carry at least `required_rec_len(name)` bytes of
/// slack, the candidate must start right after the live record's own minimal
/// length, and it must end exactly where the live record ends so that
/// re-exposing it keeps the chain intact. Runs of consecutive deleted
/// records are not unpicked.
pub fn find_hidden(block: &[u8], name: &[u8]) -> Result<Option<HiddenRecord>, ParseError> {
    let need = required_rec_len(name.len());
    for item in RecordCursor::new(block) {
        let (offset, live) = item?;
        if live.is_empty() {
            continue;
        }
        let own = live.actual_size();
        let rec_len = usize::from(live.rec_len);
        if rec_len < own + need {
            continue;
        }
        let candidate_offset = offset + own;
        let Ok(candidate) = parse_dir_record(block, candidate_offset) else {
            continue;
        };
        if candidate.name != name
            || candidate_offset + usize::from(candidate.rec_len) != offset + rec_len
        {
            continue;
        }
        return Ok(Some(HiddenRecord {
            live_offset: offset,
            live_rec_len: live.rec_len,
            offset: candidate_offset,
            inode: candidate.inode,
            file_type: candidate.file_type,
        }));
    }
    Ok(None)
}

/// Shrink the absorbing record so the hidden one rejoins the chain.
pub fn expose(block: &mut [u8], hidden: &HiddenRecord) -> Result<(), ParseError> {
    let shrunk = rec_len_u16(hidden.offset - hidden.live_offset)?;
    write_rec_len(block, hidden.live_offset, shrunk)
}

/// Undo [`expose`].
pub fn conceal(block: &mut [u8], hidden: &HiddenRecord) -> Result<(), ParseError> {
    write_rec_len(block, hidden.live_offset, hidden.live_rec_len)
}

/// Overwrite the type tag of the record at `offset`.
pub fn set_file_type(
    block: &mut [u8],
    offset: usize,
    file_type: Ext2FileType,
) -> Result<(), ParseError> {
    parse_dir_record(block, offset)?;
    write_u8(block, offset + 7, file_type as u8)
}
