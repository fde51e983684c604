//! Mapping of file byte ranges onto chunk coordinates.
//!
//! A file is the concatenation of its chunks' committed bytes, so a range is
//! found by walking the ordered size list and subtracting each chunk's size
//! from a running offset. Nothing here touches the network.

use crate::{CfsError, Result};

/// A byte range in file coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// The part of one chunk that falls inside a requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSegment {
    /// Position of the chunk in the file's chunk list.
    pub index: usize,
    /// Offset inside the chunk.
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Chunk holding the first byte of the range.
    pub begin: usize,
    /// Chunk holding the last byte of the range.
    pub end: usize,
    /// One entry per non-empty chunk in `begin..=end`, in file order.
    pub segments: Vec<ChunkSegment>,
}

impl ChunkSpan {
    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|segment| segment.len).sum()
    }
}

/// Apply the default table for an `(offset, length)` request and clamp the
/// result to the file.
///
/// | offset | length | range               |
/// |--------|--------|---------------------|
/// | 0      | 0      | whole file          |
/// | O > 0  | 0      | `[O, file_size)`    |
/// | 0      | L > 0  | `[0, L)`            |
/// | O > 0  | L > 0  | `[O, O + L)`        |
///
/// Ranges running past the end are cut at `file_size`; an offset at or past
/// the end gives an empty range.
pub fn resolve_range(file_size: u64, offset: u64, length: u64) -> ByteRange {
    let requested = match (offset, length) {
        (0, 0) => file_size,
        (offset, 0) => file_size.saturating_sub(offset),
        (_, length) => length,
    };

    let available = file_size.saturating_sub(offset);
    ByteRange {
        offset,
        length: requested.min(available),
    }
}

/// Resolve `[offset, offset + length)` against the committed chunk sizes.
///
/// Returns `Ok(None)` for an empty range. The range is not clamped: asking
/// for bytes past the last committed byte is an error, callers clamp with
/// [`resolve_range`] first.
pub fn locate(chunk_sizes: &[u64], offset: u64, length: u64) -> Result<Option<ChunkSpan>> {
    let total: u64 = chunk_sizes.iter().sum();
    let end = offset.checked_add(length).ok_or_else(|| {
        CfsError::InvalidRequest(format!(
            "range overflows: offset={} length={}",
            offset, length
        ))
    })?;

    if end > total {
        return Err(CfsError::InvalidRequest(format!(
            "range past end of file: offset={} length={} size={}",
            offset, length, total
        )));
    }

    if length == 0 {
        return Ok(None);
    }

    let mut local_offset = offset;
    let mut begin = 0;
    for (index, size) in chunk_sizes.iter().enumerate() {
        if local_offset < *size {
            begin = index;
            break;
        }
        local_offset -= size;
    }

    let mut remaining_end = end;
    let mut last = begin;
    for (index, size) in chunk_sizes.iter().enumerate() {
        if remaining_end <= *size {
            last = index;
            break;
        }
        remaining_end -= size;
    }

    let mut segments = Vec::with_capacity(last - begin + 1);
    let mut remaining = length;
    for (index, size) in chunk_sizes.iter().enumerate().take(last + 1).skip(begin) {
        let len = remaining.min(size - local_offset);
        if len > 0 {
            segments.push(ChunkSegment {
                index,
                offset: local_offset,
                len,
            });
        }
        remaining -= len;
        local_offset = 0;
    }

    debug_assert_eq!(remaining, 0);

    Ok(Some(ChunkSpan {
        begin,
        end: last,
        segments,
    }))
}
