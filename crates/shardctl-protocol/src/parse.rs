//! Incremental RESP reply parser.
//!
//! Operates on buffered byte slices. The caller reads from the socket into a
//! buffer and calls [`parse_frame`] until it yields a frame; a partial buffer
//! returns `Ok(None)` and is left untouched so the call can be retried once
//! more data arrives.
//!
//! Servers answer in RESP2 unless a client negotiates RESP3, so the negative
//! lengths RESP2 uses for nulls (`$-1`, `*-1`) are accepted alongside the
//! RESP3 `_` null.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Frame;

/// Maximum nesting depth for arrays and maps.
const MAX_NESTING_DEPTH: usize = 64;

/// Maximum number of elements in an array or map.
const MAX_ARRAY_ELEMENTS: usize = 1_048_576;

/// Maximum length of a bulk string in bytes (512 MB).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound for `Vec::with_capacity` when an array header is read.
const PREALLOC_CAP: usize = 1024;

/// Checks whether `buf` contains a complete frame and parses it.
///
/// Returns `Ok(Some((frame, consumed)))` if a complete frame was parsed,
/// `Ok(None)` if the buffer doesn't contain enough data yet,
/// or `Err(...)` if the data is malformed.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    match try_parse(&mut cursor, 0) {
        Ok(frame) => Ok(Some((frame, cursor.position() as usize))),
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

fn try_parse(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, ProtocolError> {
    match read_byte(cursor)? {
        b'+' => {
            let line = read_line(cursor)?;
            let s = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8("simple"))?;
            Ok(Frame::Simple(s.to_owned()))
        }
        b'-' => {
            let line = read_line(cursor)?;
            let s = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8("error"))?;
            Ok(Frame::Error(s.to_owned()))
        }
        b':' => Ok(Frame::Integer(read_integer_line(cursor)?)),
        b'$' => {
            let len = read_integer_line(cursor)?;
            if len == -1 {
                return Ok(Frame::Null);
            }
            if len < 0 {
                return Err(ProtocolError::InvalidFrameLength(len));
            }
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::BulkStringTooLarge(len as usize));
            }
            let len = len as usize;

            // payload plus trailing \r\n
            if remaining(cursor) < len + 2 {
                return Err(ProtocolError::Incomplete);
            }

            let pos = cursor.position() as usize;
            let buf = *cursor.get_ref();
            if buf[pos + len] != b'\r' || buf[pos + len + 1] != b'\n' {
                return Err(ProtocolError::InvalidFrameLength(len as i64));
            }
            cursor.set_position((pos + len + 2) as u64);
            Ok(Frame::Bulk(Bytes::copy_from_slice(&buf[pos..pos + len])))
        }
        b'*' => {
            let count = read_count(cursor, depth)?;
            let Some(count) = count else {
                return Ok(Frame::Null);
            };
            let mut frames = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                frames.push(try_parse(cursor, depth + 1)?);
            }
            Ok(Frame::Array(frames))
        }
        b'%' => {
            let count = read_count(cursor, depth)?.unwrap_or(0);
            let mut pairs = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                let key = try_parse(cursor, depth + 1)?;
                let val = try_parse(cursor, depth + 1)?;
                pairs.push((key, val));
            }
            Ok(Frame::Map(pairs))
        }
        b'_' => {
            let _ = read_line(cursor)?;
            Ok(Frame::Null)
        }
        other => Err(ProtocolError::InvalidPrefix(other)),
    }
}

/// Reads an aggregate header. `None` means the RESP2 null array (`*-1`).
fn read_count(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Option<usize>, ProtocolError> {
    if depth + 1 > MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    let count = read_integer_line(cursor)?;
    if count == -1 {
        return Ok(None);
    }
    if count < 0 {
        return Err(ProtocolError::InvalidFrameLength(count));
    }
    if count as usize > MAX_ARRAY_ELEMENTS {
        return Err(ProtocolError::TooManyElements(count as usize));
    }
    Ok(Some(count as usize))
}

// ---------------------------------------------------------------------------
// low-level cursor helpers
// ---------------------------------------------------------------------------

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    let byte = *cursor.get_ref().get(pos).ok_or(ProtocolError::Incomplete)?;
    cursor.set_position((pos + 1) as u64);
    Ok(byte)
}

/// Returns the bytes up to the next `\r\n` and advances past it.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let buf: &'a [u8] = cursor.get_ref();
    let start = cursor.position() as usize;
    if start >= buf.len() {
        return Err(ProtocolError::Incomplete);
    }

    let mut pos = start;
    while let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            cursor.set_position((cr + 2) as u64);
            return Ok(&buf[start..cr]);
        }
        pos = cr + 1;
    }
    Err(ProtocolError::Incomplete)
}

fn read_integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let line = read_line(cursor)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(ProtocolError::InvalidInteger)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize)
}
