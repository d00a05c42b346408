//! MessagePack codec — the value format of the engine.
//!
//! Every tuple, key, WAL row, and run page stores its payload as
//! MessagePack. This module owns the wire format end to end: a
//! hand-written, byte-stable encoder/decoder with no external
//! serialization dependency, so the on-disk representation can never
//! change underneath us due to a dependency upgrade.
//!
//! # API shape
//!
//! - `write_*` functions append a single value to a `Vec<u8>`, always
//!   choosing the smallest (canonical) encoding.
//! - `read_*` functions decode one value from the front of a slice and
//!   return `(value, bytes_consumed)` so callers can walk a buffer of
//!   concatenated values.
//! - [`skip_value`] advances past one value of any type, recursively.
//! - [`ValueClass`] classifies a leading marker byte into the coarse
//!   type classes used by field-type validation and scalar comparison.
//!
//! # Safety limits
//!
//! Decoders bound every length field ([`MAX_BIN_LEN`], [`MAX_ELEMENTS`])
//! before allocating, so corrupted or hostile input cannot trigger an
//! allocation bomb.
//!
//! # Zero-panic guarantee
//!
//! No function in this module panics on malformed input; all failures
//! are reported through [`MsgpackError`].

#[cfg(test)]
mod tests;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Maximum byte length accepted for a single str/bin value (256 MiB).
pub const MAX_BIN_LEN: u32 = 256 * 1024 * 1024;

/// Maximum element count accepted for a single array/map (16 M).
pub const MAX_ELEMENTS: u32 = 16 * 1024 * 1024;

/// Maximum nesting depth accepted by [`skip_value`].
pub const MAX_DEPTH: u32 = 128;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding MessagePack values.
#[derive(Debug, Error)]
pub enum MsgpackError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// The leading marker byte did not match the expected type.
    #[error("unexpected marker 0x{marker:02X}, expected {expected}")]
    UnexpectedMarker {
        /// The marker byte that was read.
        marker: u8,
        /// Human-readable name of the expected type.
        expected: &'static str,
    },

    /// A length or count exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// Array/map nesting exceeded [`MAX_DEPTH`].
    #[error("nesting depth exceeds {MAX_DEPTH}")]
    DepthExceeded,

    /// A str value was not valid UTF-8.
    #[error("invalid UTF-8 in str value")]
    InvalidUtf8,

    /// The reserved marker 0xC1 was encountered.
    #[error("reserved marker 0xC1")]
    ReservedMarker,
}

// ------------------------------------------------------------------------------------------------
// Value classes
// ------------------------------------------------------------------------------------------------

/// Coarse type class of a MessagePack value, derived from its marker.
///
/// The ordering of the variants defines the cross-class comparison rank
/// used for SCALAR key parts: nil < bool < number < str < bin < array <
/// map < ext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueClass {
    /// `nil`.
    Nil,
    /// `true` / `false`.
    Bool,
    /// Any integer or float marker.
    Number,
    /// UTF-8 string.
    Str,
    /// Raw binary.
    Bin,
    /// Array.
    Array,
    /// Map.
    Map,
    /// Extension type.
    Ext,
}

/// Classifies a marker byte into its [`ValueClass`].
pub fn classify(marker: u8) -> Result<ValueClass, MsgpackError> {
    Ok(match marker {
        0x00..=0x7F | 0xE0..=0xFF => ValueClass::Number, // fixint
        0x80..=0x8F | 0xDE | 0xDF => ValueClass::Map,
        0x90..=0x9F | 0xDC | 0xDD => ValueClass::Array,
        0xA0..=0xBF | 0xD9..=0xDB => ValueClass::Str,
        0xC0 => ValueClass::Nil,
        0xC1 => return Err(MsgpackError::ReservedMarker),
        0xC2 | 0xC3 => ValueClass::Bool,
        0xC4..=0xC6 => ValueClass::Bin,
        0xC7..=0xC9 | 0xD4..=0xD8 => ValueClass::Ext,
        0xCA..=0xD3 => ValueClass::Number,
    })
}

// ------------------------------------------------------------------------------------------------
// Decoded value view
// ------------------------------------------------------------------------------------------------

/// A borrowed view of a single decoded MessagePack value.
///
/// Container variants keep the raw encoded bytes of the whole value so
/// that callers can re-emit or compare them without a deep decode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MpValue<'a> {
    /// `nil`.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Non-negative integer.
    Uint(u64),
    /// Negative integer.
    Int(i64),
    /// IEEE 754 double (float32 is widened on read).
    Double(f64),
    /// UTF-8 string payload (validity is not enforced on read).
    Str(&'a [u8]),
    /// Binary payload.
    Bin(&'a [u8]),
    /// Array: element count plus the raw encoded bytes of the whole value.
    Array {
        /// Number of elements.
        count: u32,
        /// Raw encoded bytes of the entire array value.
        raw: &'a [u8],
    },
    /// Map: pair count plus the raw encoded bytes of the whole value.
    Map {
        /// Number of key/value pairs.
        count: u32,
        /// Raw encoded bytes of the entire map value.
        raw: &'a [u8],
    },
}

impl MpValue<'_> {
    /// Class of this value for scalar comparison.
    pub fn class(&self) -> ValueClass {
        match self {
            MpValue::Nil => ValueClass::Nil,
            MpValue::Bool(_) => ValueClass::Bool,
            MpValue::Uint(_) | MpValue::Int(_) | MpValue::Double(_) => ValueClass::Number,
            MpValue::Str(_) => ValueClass::Str,
            MpValue::Bin(_) => ValueClass::Bin,
            MpValue::Array { .. } => ValueClass::Array,
            MpValue::Map { .. } => ValueClass::Map,
        }
    }

    /// Numeric view as f64 when the value is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MpValue::Uint(v) => Some(*v as f64),
            MpValue::Int(v) => Some(*v as f64),
            MpValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), MsgpackError> {
    if buf.len() < needed {
        Err(MsgpackError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn be_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

#[inline]
fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

#[inline]
fn be_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

fn check_len(len: u32) -> Result<usize, MsgpackError> {
    if len > MAX_BIN_LEN {
        return Err(MsgpackError::LengthOverflow(format!(
            "payload length {len} exceeds MAX_BIN_LEN ({MAX_BIN_LEN})"
        )));
    }
    Ok(len as usize)
}

fn check_count(count: u32) -> Result<u32, MsgpackError> {
    if count > MAX_ELEMENTS {
        return Err(MsgpackError::LengthOverflow(format!(
            "element count {count} exceeds MAX_ELEMENTS ({MAX_ELEMENTS})"
        )));
    }
    Ok(count)
}

// ------------------------------------------------------------------------------------------------
// Writers — always the canonical (smallest) encoding
// ------------------------------------------------------------------------------------------------

/// Appends `nil`.
pub fn write_nil(buf: &mut Vec<u8>) {
    buf.push(0xC0);
}

/// Appends a boolean.
pub fn write_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(if v { 0xC3 } else { 0xC2 });
}

/// Appends a non-negative integer.
pub fn write_uint(buf: &mut Vec<u8>, v: u64) {
    match v {
        0..=0x7F => buf.push(v as u8),
        0x80..=0xFF => {
            buf.push(0xCC);
            buf.push(v as u8);
        }
        0x100..=0xFFFF => {
            buf.push(0xCD);
            buf.extend_from_slice(&(v as u16).to_be_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.push(0xCE);
            buf.extend_from_slice(&(v as u32).to_be_bytes());
        }
        _ => {
            buf.push(0xCF);
            buf.extend_from_slice(&v.to_be_bytes());
        }
    }
}

/// Appends a signed integer. Non-negative values take the uint form.
pub fn write_int(buf: &mut Vec<u8>, v: i64) {
    if v >= 0 {
        return write_uint(buf, v as u64);
    }
    match v {
        -32..=-1 => buf.push(v as u8),
        -128..=-33 => {
            buf.push(0xD0);
            buf.push(v as u8);
        }
        -32768..=-129 => {
            buf.push(0xD1);
            buf.extend_from_slice(&(v as i16).to_be_bytes());
        }
        -2147483648..=-32769 => {
            buf.push(0xD2);
            buf.extend_from_slice(&(v as i32).to_be_bytes());
        }
        _ => {
            buf.push(0xD3);
            buf.extend_from_slice(&v.to_be_bytes());
        }
    }
}

/// Appends a float64.
pub fn write_double(buf: &mut Vec<u8>, v: f64) {
    buf.push(0xCB);
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Appends a str value.
pub fn write_str(buf: &mut Vec<u8>, s: &str) {
    let len = s.len();
    match len {
        0..=31 => buf.push(0xA0 | len as u8),
        32..=0xFF => {
            buf.push(0xD9);
            buf.push(len as u8);
        }
        0x100..=0xFFFF => {
            buf.push(0xDA);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            buf.push(0xDB);
            buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }
    buf.extend_from_slice(s.as_bytes());
}

/// Appends a bin value.
pub fn write_bin(buf: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    match len {
        0..=0xFF => {
            buf.push(0xC4);
            buf.push(len as u8);
        }
        0x100..=0xFFFF => {
            buf.push(0xC5);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            buf.push(0xC6);
            buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }
    buf.extend_from_slice(data);
}

/// Appends an array header for `count` elements.
pub fn write_array_len(buf: &mut Vec<u8>, count: u32) {
    match count {
        0..=15 => buf.push(0x90 | count as u8),
        16..=0xFFFF => {
            buf.push(0xDC);
            buf.extend_from_slice(&(count as u16).to_be_bytes());
        }
        _ => {
            buf.push(0xDD);
            buf.extend_from_slice(&count.to_be_bytes());
        }
    }
}

/// Appends a map header for `count` key/value pairs.
pub fn write_map_len(buf: &mut Vec<u8>, count: u32) {
    match count {
        0..=15 => buf.push(0x80 | count as u8),
        16..=0xFFFF => {
            buf.push(0xDE);
            buf.extend_from_slice(&(count as u16).to_be_bytes());
        }
        _ => {
            buf.push(0xDF);
            buf.extend_from_slice(&count.to_be_bytes());
        }
    }
}

/// Re-emits a decoded value, canonically.
pub fn write_value(buf: &mut Vec<u8>, value: &MpValue<'_>) {
    match value {
        MpValue::Nil => write_nil(buf),
        MpValue::Bool(v) => write_bool(buf, *v),
        MpValue::Uint(v) => write_uint(buf, *v),
        MpValue::Int(v) => write_int(buf, *v),
        MpValue::Double(v) => write_double(buf, *v),
        MpValue::Str(s) => {
            // Raw append preserves the payload even if it is not UTF-8.
            let len = s.len();
            match len {
                0..=31 => buf.push(0xA0 | len as u8),
                32..=0xFF => {
                    buf.push(0xD9);
                    buf.push(len as u8);
                }
                0x100..=0xFFFF => {
                    buf.push(0xDA);
                    buf.extend_from_slice(&(len as u16).to_be_bytes());
                }
                _ => {
                    buf.push(0xDB);
                    buf.extend_from_slice(&(len as u32).to_be_bytes());
                }
            }
            buf.extend_from_slice(s);
        }
        MpValue::Bin(data) => write_bin(buf, data),
        MpValue::Array { raw, .. } | MpValue::Map { raw, .. } => buf.extend_from_slice(raw),
    }
}

// ------------------------------------------------------------------------------------------------
// Readers — (value, consumed) pairs
// ------------------------------------------------------------------------------------------------

/// Decodes one value of any type.
pub fn read_value(buf: &[u8]) -> Result<(MpValue<'_>, usize), MsgpackError> {
    require(buf, 1)?;
    let marker = buf[0];
    match marker {
        0x00..=0x7F => Ok((MpValue::Uint(marker as u64), 1)),
        0xE0..=0xFF => Ok((MpValue::Int(marker as i8 as i64), 1)),
        0xC0 => Ok((MpValue::Nil, 1)),
        0xC2 => Ok((MpValue::Bool(false), 1)),
        0xC3 => Ok((MpValue::Bool(true), 1)),
        0xCC => {
            require(buf, 2)?;
            Ok((MpValue::Uint(buf[1] as u64), 2))
        }
        0xCD => {
            require(buf, 3)?;
            Ok((MpValue::Uint(be_u16(&buf[1..]) as u64), 3))
        }
        0xCE => {
            require(buf, 5)?;
            Ok((MpValue::Uint(be_u32(&buf[1..]) as u64), 5))
        }
        0xCF => {
            require(buf, 9)?;
            Ok((MpValue::Uint(be_u64(&buf[1..])), 9))
        }
        0xD0 => {
            require(buf, 2)?;
            Ok((MpValue::Int(buf[1] as i8 as i64), 2))
        }
        0xD1 => {
            require(buf, 3)?;
            Ok((MpValue::Int(be_u16(&buf[1..]) as i16 as i64), 3))
        }
        0xD2 => {
            require(buf, 5)?;
            Ok((MpValue::Int(be_u32(&buf[1..]) as i32 as i64), 5))
        }
        0xD3 => {
            require(buf, 9)?;
            Ok((MpValue::Int(be_u64(&buf[1..]) as i64), 9))
        }
        0xCA => {
            require(buf, 5)?;
            Ok((MpValue::Double(f32::from_be_bytes([
                buf[1], buf[2], buf[3], buf[4],
            ]) as f64), 5))
        }
        0xCB => {
            require(buf, 9)?;
            Ok((MpValue::Double(f64::from_be_bytes([
                buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
            ])), 9))
        }
        0xA0..=0xBF => {
            let len = (marker & 0x1F) as usize;
            require(buf, 1 + len)?;
            Ok((MpValue::Str(&buf[1..1 + len]), 1 + len))
        }
        0xD9 => {
            require(buf, 2)?;
            let len = check_len(buf[1] as u32)?;
            require(buf, 2 + len)?;
            Ok((MpValue::Str(&buf[2..2 + len]), 2 + len))
        }
        0xDA => {
            require(buf, 3)?;
            let len = check_len(be_u16(&buf[1..]) as u32)?;
            require(buf, 3 + len)?;
            Ok((MpValue::Str(&buf[3..3 + len]), 3 + len))
        }
        0xDB => {
            require(buf, 5)?;
            let len = check_len(be_u32(&buf[1..]))?;
            require(buf, 5 + len)?;
            Ok((MpValue::Str(&buf[5..5 + len]), 5 + len))
        }
        0xC4 => {
            require(buf, 2)?;
            let len = check_len(buf[1] as u32)?;
            require(buf, 2 + len)?;
            Ok((MpValue::Bin(&buf[2..2 + len]), 2 + len))
        }
        0xC5 => {
            require(buf, 3)?;
            let len = check_len(be_u16(&buf[1..]) as u32)?;
            require(buf, 3 + len)?;
            Ok((MpValue::Bin(&buf[3..3 + len]), 3 + len))
        }
        0xC6 => {
            require(buf, 5)?;
            let len = check_len(be_u32(&buf[1..]))?;
            require(buf, 5 + len)?;
            Ok((MpValue::Bin(&buf[5..5 + len]), 5 + len))
        }
        0x90..=0x9F | 0xDC | 0xDD => {
            let (count, _) = read_array_len(buf)?;
            let total = skip_value(buf)?;
            Ok((MpValue::Array {
                count,
                raw: &buf[..total],
            }, total))
        }
        0x80..=0x8F | 0xDE | 0xDF => {
            let (count, _) = read_map_len(buf)?;
            let total = skip_value(buf)?;
            Ok((MpValue::Map {
                count,
                raw: &buf[..total],
            }, total))
        }
        0xC1 => Err(MsgpackError::ReservedMarker),
        _ => Err(MsgpackError::UnexpectedMarker {
            marker,
            expected: "value",
        }),
    }
}

/// Decodes an array header, returning `(element_count, consumed)`.
pub fn read_array_len(buf: &[u8]) -> Result<(u32, usize), MsgpackError> {
    require(buf, 1)?;
    match buf[0] {
        m @ 0x90..=0x9F => Ok(((m & 0x0F) as u32, 1)),
        0xDC => {
            require(buf, 3)?;
            Ok((check_count(be_u16(&buf[1..]) as u32)?, 3))
        }
        0xDD => {
            require(buf, 5)?;
            Ok((check_count(be_u32(&buf[1..]))?, 5))
        }
        marker => Err(MsgpackError::UnexpectedMarker {
            marker,
            expected: "array",
        }),
    }
}

/// Decodes a map header, returning `(pair_count, consumed)`.
pub fn read_map_len(buf: &[u8]) -> Result<(u32, usize), MsgpackError> {
    require(buf, 1)?;
    match buf[0] {
        m @ 0x80..=0x8F => Ok(((m & 0x0F) as u32, 1)),
        0xDE => {
            require(buf, 3)?;
            Ok((check_count(be_u16(&buf[1..]) as u32)?, 3))
        }
        0xDF => {
            require(buf, 5)?;
            Ok((check_count(be_u32(&buf[1..]))?, 5))
        }
        marker => Err(MsgpackError::UnexpectedMarker {
            marker,
            expected: "map",
        }),
    }
}

/// Decodes a non-negative integer.
pub fn read_uint(buf: &[u8]) -> Result<(u64, usize), MsgpackError> {
    match read_value(buf)? {
        (MpValue::Uint(v), n) => Ok((v, n)),
        (_, _) => Err(MsgpackError::UnexpectedMarker {
            marker: buf[0],
            expected: "unsigned integer",
        }),
    }
}

/// Decodes any integer, signed view.
pub fn read_int(buf: &[u8]) -> Result<(i64, usize), MsgpackError> {
    match read_value(buf)? {
        (MpValue::Uint(v), n) => {
            let v = i64::try_from(v).map_err(|_| MsgpackError::LengthOverflow(
                format!("unsigned value {v} does not fit in i64"),
            ))?;
            Ok((v, n))
        }
        (MpValue::Int(v), n) => Ok((v, n)),
        (_, _) => Err(MsgpackError::UnexpectedMarker {
            marker: buf[0],
            expected: "integer",
        }),
    }
}

/// Decodes a str value and validates UTF-8.
pub fn read_str(buf: &[u8]) -> Result<(&str, usize), MsgpackError> {
    match read_value(buf)? {
        (MpValue::Str(s), n) => {
            let s = std::str::from_utf8(s).map_err(|_| MsgpackError::InvalidUtf8)?;
            Ok((s, n))
        }
        (_, _) => Err(MsgpackError::UnexpectedMarker {
            marker: buf[0],
            expected: "str",
        }),
    }
}

/// Decodes a bin value.
pub fn read_bin(buf: &[u8]) -> Result<(&[u8], usize), MsgpackError> {
    match read_value(buf)? {
        (MpValue::Bin(b), n) => Ok((b, n)),
        (_, _) => Err(MsgpackError::UnexpectedMarker {
            marker: buf[0],
            expected: "bin",
        }),
    }
}

// ------------------------------------------------------------------------------------------------
// Skipping
// ------------------------------------------------------------------------------------------------

/// Advances past exactly one value, returning the number of bytes it
/// occupies. Containers are skipped recursively up to [`MAX_DEPTH`].
pub fn skip_value(buf: &[u8]) -> Result<usize, MsgpackError> {
    skip_inner(buf, 0)
}

fn skip_inner(buf: &[u8], depth: u32) -> Result<usize, MsgpackError> {
    if depth > MAX_DEPTH {
        return Err(MsgpackError::DepthExceeded);
    }
    require(buf, 1)?;
    let marker = buf[0];
    // Fixed-width and length-prefixed scalars.
    let simple: Option<usize> = match marker {
        0x00..=0x7F | 0xE0..=0xFF | 0xC0 | 0xC2 | 0xC3 => Some(1),
        0xCC | 0xD0 => Some(2),
        0xCD | 0xD1 => Some(3),
        0xCE | 0xD2 | 0xCA => Some(5),
        0xCF | 0xD3 | 0xCB => Some(9),
        0xA0..=0xBF => Some(1 + (marker & 0x1F) as usize),
        0xD9 | 0xC4 => {
            require(buf, 2)?;
            Some(2 + check_len(buf[1] as u32)?)
        }
        0xDA | 0xC5 => {
            require(buf, 3)?;
            Some(3 + check_len(be_u16(&buf[1..]) as u32)?)
        }
        0xDB | 0xC6 => {
            require(buf, 5)?;
            Some(5 + check_len(be_u32(&buf[1..]))?)
        }
        // fixext / ext
        0xD4 => Some(3),
        0xD5 => Some(4),
        0xD6 => Some(6),
        0xD7 => Some(10),
        0xD8 => Some(18),
        0xC7 => {
            require(buf, 2)?;
            Some(3 + check_len(buf[1] as u32)?)
        }
        0xC8 => {
            require(buf, 3)?;
            Some(4 + check_len(be_u16(&buf[1..]) as u32)?)
        }
        0xC9 => {
            require(buf, 5)?;
            Some(6 + check_len(be_u32(&buf[1..]))?)
        }
        0xC1 => return Err(MsgpackError::ReservedMarker),
        _ => None,
    };
    if let Some(total) = simple {
        require(buf, total)?;
        return Ok(total);
    }

    // Containers.
    let (items, mut offset) = match marker {
        0x90..=0x9F | 0xDC | 0xDD => {
            let (count, n) = read_array_len(buf)?;
            (count as u64, n)
        }
        0x80..=0x8F | 0xDE | 0xDF => {
            let (count, n) = read_map_len(buf)?;
            (count as u64 * 2, n)
        }
        marker => {
            return Err(MsgpackError::UnexpectedMarker {
                marker,
                expected: "value",
            });
        }
    };
    for _ in 0..items {
        offset += skip_inner(&buf[offset..], depth + 1)?;
    }
    Ok(offset)
}

// ------------------------------------------------------------------------------------------------
// Value comparison
// ------------------------------------------------------------------------------------------------

/// Compares two decoded numbers with exact integer semantics where
/// possible, falling back to f64 only when a float is involved.
pub fn cmp_numbers(a: &MpValue<'_>, b: &MpValue<'_>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (MpValue::Uint(x), MpValue::Uint(y)) => x.cmp(y),
        (MpValue::Int(x), MpValue::Int(y)) => x.cmp(y),
        (MpValue::Uint(x), MpValue::Int(y)) => {
            // y < 0 always here (non-negative ints decode as Uint).
            if *y < 0 { Ordering::Greater } else { x.cmp(&(*y as u64)) }
        }
        (MpValue::Int(x), MpValue::Uint(y)) => {
            if *x < 0 { Ordering::Less } else { (*x as u64).cmp(y) }
        }
        _ => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
    }
}

/// Compares two values of arbitrary class: first by [`ValueClass`] rank,
/// then by value within the class. This is the SCALAR comparison rule.
pub fn cmp_scalar(a: &MpValue<'_>, b: &MpValue<'_>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match a.class().cmp(&b.class()) {
        Ordering::Equal => {}
        ord => return ord,
    }
    match (a, b) {
        (MpValue::Bool(x), MpValue::Bool(y)) => x.cmp(y),
        (MpValue::Str(x), MpValue::Str(y)) => x.cmp(y),
        (MpValue::Bin(x), MpValue::Bin(y)) => x.cmp(y),
        (MpValue::Array { raw: x, .. }, MpValue::Array { raw: y, .. }) => x.cmp(y),
        (MpValue::Map { raw: x, .. }, MpValue::Map { raw: y, .. }) => x.cmp(y),
        (MpValue::Nil, MpValue::Nil) => Ordering::Equal,
        _ => cmp_numbers(a, b),
    }
}
