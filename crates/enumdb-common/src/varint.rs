//! Compact variable-length integer and timestamp encodings.
//!
//! ## Integer format
//!
//! | Value (as unsigned bits) | Layout                                                 |
//! |--------------------------|--------------------------------------------------------|
//! | 0 - 191                  | `[value]`                                              |
//! | 192 and above            | `[192 + (v & 0x3F)]` then 7-bit chunks, low first      |
//!
//! Every chunk byte except the last carries the continuation bit `0x80`.
//! Negative values are encoded by their two's-complement bit pattern, so they
//! take the full width (5 bytes for `i32`, 10 bytes for `i64`).
//!
//! ## Timestamp format
//!
//! Millisecond timestamps are stored as a 5-byte big-endian offset from
//! [`TIME_BASE`]. Values before the base, or too far after it, fall back to a
//! sentinel byte `255` followed by the full 8-byte big-endian value.

use crate::error::{Result, StorageError};
use bytes::{Buf, BufMut};

/// Threshold below which an integer is written as a single byte.
const SINGLE_BYTE_LIMIT: u32 = 192;

/// Low bits carried by the first byte of a multi-byte integer.
const FIRST_BYTE_BITS: u32 = 6;

/// Continuation bit of chunk bytes.
const CONTINUATION: u8 = 0x80;

/// Epoch baseline for relative timestamps: 33 years of milliseconds.
pub const TIME_BASE: i64 = 33 * 365 * 24 * 3600 * 1000;

/// First relative timestamp that no longer fits the 5-byte form.
const TIME_RELATIVE_LIMIT: i64 = 0xFF_0000_0000;

/// Marker byte for timestamps stored in full.
const TIME_FULL_MARKER: u8 = 255;

/// Writes an i32 in the compact varint form.
pub fn put_int<B: BufMut>(buf: &mut B, value: i32) {
    let mut v = value as u32;
    if v < SINGLE_BYTE_LIMIT {
        buf.put_u8(v as u8);
        return;
    }
    buf.put_u8((SINGLE_BYTE_LIMIT + (v & 0x3F)) as u8);
    v >>= FIRST_BYTE_BITS;
    while v >= 0x80 {
        buf.put_u8((v & 0x7F) as u8 | CONTINUATION);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Reads an i32 written by [`put_int`].
pub fn get_int<B: Buf>(buf: &mut B) -> Result<i32> {
    let first = next_byte(buf)? as u32;
    if first < SINGLE_BYTE_LIMIT {
        return Ok(first as i32);
    }
    let mut result = first - SINGLE_BYTE_LIMIT;
    let mut shift = FIRST_BYTE_BITS;
    loop {
        if shift >= u32::BITS {
            return Err(StorageError::Codec("varint i32 is too long".to_string()));
        }
        let next = next_byte(buf)?;
        result |= ((next & 0x7F) as u32) << shift;
        if next & CONTINUATION == 0 {
            return Ok(result as i32);
        }
        shift += 7;
    }
}

/// Writes an i64 in the compact varint form.
pub fn put_long<B: BufMut>(buf: &mut B, value: i64) {
    let mut v = value as u64;
    if v < SINGLE_BYTE_LIMIT as u64 {
        buf.put_u8(v as u8);
        return;
    }
    buf.put_u8((SINGLE_BYTE_LIMIT as u64 + (v & 0x3F)) as u8);
    v >>= FIRST_BYTE_BITS;
    while v >= 0x80 {
        buf.put_u8((v & 0x7F) as u8 | CONTINUATION);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Reads an i64 written by [`put_long`].
pub fn get_long<B: Buf>(buf: &mut B) -> Result<i64> {
    let first = next_byte(buf)? as u64;
    if first < SINGLE_BYTE_LIMIT as u64 {
        return Ok(first as i64);
    }
    let mut result = first - SINGLE_BYTE_LIMIT as u64;
    let mut shift = FIRST_BYTE_BITS;
    loop {
        if shift >= u64::BITS {
            return Err(StorageError::Codec("varint i64 is too long".to_string()));
        }
        let next = next_byte(buf)?;
        result |= ((next & 0x7F) as u64) << shift;
        if next & CONTINUATION == 0 {
            return Ok(result as i64);
        }
        shift += 7;
    }
}

/// Returns the encoded length of an i32 without encoding it.
pub fn int_len(value: i32) -> usize {
    let mut v = value as u32;
    if v < SINGLE_BYTE_LIMIT {
        return 1;
    }
    v >>= FIRST_BYTE_BITS;
    let mut len = 2;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Writes a millisecond timestamp in the relative 5-byte form when possible.
pub fn put_time<B: BufMut>(buf: &mut B, timestamp: i64) {
    let relative = timestamp.wrapping_sub(TIME_BASE);
    if timestamp < TIME_BASE || !(0..TIME_RELATIVE_LIMIT).contains(&relative) {
        buf.put_u8(TIME_FULL_MARKER);
        buf.put_i64(timestamp);
        return;
    }
    buf.put_u8((relative >> 32) as u8);
    buf.put_u32(relative as u32);
}

/// Reads a timestamp written by [`put_time`].
pub fn get_time<B: Buf>(buf: &mut B) -> Result<i64> {
    let first = next_byte(buf)?;
    if first == TIME_FULL_MARKER {
        if buf.remaining() < 8 {
            return Err(truncated());
        }
        return Ok(buf.get_i64());
    }
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let low = buf.get_u32() as i64;
    Ok((((first as i64) << 32) | low) + TIME_BASE)
}

#[inline]
fn next_byte<B: Buf>(buf: &mut B) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn truncated() -> StorageError {
    StorageError::Codec("unexpected end of input".to_string())
}
