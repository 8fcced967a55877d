//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode commands and replies, and decode frames incrementally from
//! a socket buffer without blocking on partial input.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: A frame is only consumed once it is complete;
//!    partial input leaves the buffer untouched and reports `Ok(None)`.
//! 2. **Buffer Reuse**: Callers own the `BytesMut` and the output `Vec`.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns errors immediately.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Largest bulk string accepted from the peer (512 MiB, the Redis limit).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Deepest array nesting accepted from the peer.
pub const MAX_NESTING_DEPTH: usize = 32;

/// RESP value, used for both replies and server pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays; pub/sub pushes arrive in this shape.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Builds a non-null bulk string.
    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    /// Returns the payload of a simple or non-null bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(data) => Some(data),
            RespValue::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Converts a command frame (array of bulk strings) into its arguments.
    pub fn into_args(self) -> Option<Vec<Vec<u8>>> {
        let RespValue::Array(items) = self else {
            return None;
        };
        items
            .into_iter()
            .map(|item| match item {
                RespValue::Bulk(Some(data)) => Some(data),
                _ => None,
            })
            .collect()
    }
}

/// Framing errors reported by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RespError {
    /// The bytes on the wire do not form a RESP2 frame.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// A bulk string announced a length above [`MAX_BULK_LEN`].
    #[error("bulk length {0} exceeds limit")]
    TooLarge(i64),
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        push_bulk(out, arg);
    }
}

/// Encodes any RESP value, used for server replies and pushes.
pub fn encode_value(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::Simple(text) => {
            out.push(b'+');
            out.extend_from_slice(text);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error(text) => {
            out.push(b'-');
            out.extend_from_slice(text);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(value) => {
            out.push(b':');
            out.extend_from_slice(value.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Bulk(Some(data)) => push_bulk(out, data),
        RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(items) => {
            out.push(b'*');
            push_usize(out, items.len());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

/// Decodes one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; nothing is consumed in that
/// case.
pub fn decode(buf: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
    match parse_value(&buf[..], 0, 0)? {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_value(
    buf: &[u8],
    pos: usize,
    depth: usize,
) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some((line, next)) = read_line(buf, pos)? else {
        return Ok(None);
    };
    if line.is_empty() {
        return Err(RespError::InvalidFrame("empty line"));
    }

    match line[0] {
        b'+' => Ok(Some((RespValue::Simple(line[1..].to_vec()), next))),
        b'-' => Ok(Some((RespValue::Error(line[1..].to_vec()), next))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(&line[1..])?), next))),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            parse_bulk(buf, next, len)
        }
        b'*' => {
            let len = parse_i64(&line[1..])?;
            parse_array(buf, next, len, depth)
        }
        _ => Err(RespError::InvalidFrame("unknown type marker")),
    }
}

fn parse_bulk(buf: &[u8], start: usize, len: i64) -> Result<Option<(RespValue, usize)>, RespError> {
    if len < 0 {
        return Ok(Some((RespValue::Bulk(None), start)));
    }
    if len > MAX_BULK_LEN {
        return Err(RespError::TooLarge(len));
    }
    let end = start + len as usize;
    if buf.len() < end + 2 {
        return Ok(None);
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(RespError::InvalidFrame("bulk string missing CRLF"));
    }
    Ok(Some((RespValue::Bulk(Some(buf[start..end].to_vec())), end + 2)))
}

fn parse_array(
    buf: &[u8],
    start: usize,
    len: i64,
    depth: usize,
) -> Result<Option<(RespValue, usize)>, RespError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(RespError::InvalidFrame("nesting too deep"));
    }
    if len <= 0 {
        return Ok(Some((RespValue::Array(Vec::new()), start)));
    }

    // Cap the pre-allocation; the announced length is peer-controlled.
    let mut items = Vec::with_capacity((len as usize).min(64));
    let mut cursor = start;
    for _ in 0..len {
        match parse_value(buf, cursor, depth + 1)? {
            Some((item, next)) => {
                items.push(item);
                cursor = next;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(items), cursor)))
}

fn read_line(buf: &[u8], pos: usize) -> Result<Option<(&[u8], usize)>, RespError> {
    let rest = &buf[pos..];
    let Some(idx) = rest.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    if idx == 0 || rest[idx - 1] != b'\r' {
        return Err(RespError::InvalidFrame("line missing CR"));
    }
    Ok(Some((&rest[..idx - 1], pos + idx + 1)))
}

fn parse_i64(data: &[u8]) -> Result<i64, RespError> {
    if data.is_empty() {
        return Err(RespError::InvalidFrame("empty integer"));
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(RespError::InvalidFrame("non-digit in integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'$');
    push_usize(out, data.len());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
