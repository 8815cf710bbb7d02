//! Bencode decoding via `serde_bencode` plus raw span lookup for info hashing

use std::collections::HashMap;
use std::ops::Range;

pub use serde_bencode::value::Value;

/// Decoded bencode dictionary.
pub type BencodeDict = HashMap<Vec<u8>, Value>;

const MAX_NESTING_DEPTH: usize = 64;

/// Accessors over `serde_bencode` values.
pub trait BencodeValueExt {
    /// Looks up `key` when this value is a dictionary.
    fn get(&self, key: &[u8]) -> Option<&Value>;
    fn as_bytes(&self) -> Option<&[u8]>;
    fn as_str(&self) -> Option<&str>;
    fn as_integer(&self) -> Option<i64>;
    fn as_list(&self) -> Option<&[Value]>;
    fn as_dictionary(&self) -> Option<&BencodeDict>;
}

impl BencodeValueExt for Value {
    fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dictionary()?.get(key)
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    fn as_dictionary(&self) -> Option<&BencodeDict> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }
}

/// Builds a byte string value.
pub fn bytes(data: impl Into<Vec<u8>>) -> Value {
    Value::Bytes(data.into())
}

/// Builds a dictionary value from `(key, value)` pairs.
pub fn dictionary<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(key, value)| (key.as_bytes().to_vec(), value))
            .collect(),
    )
}

/// Errors produced while decoding or encoding bencode.
#[derive(Debug, thiserror::Error)]
pub enum BencodeError {
    #[error("Unexpected end of input at byte {position}")]
    UnexpectedEof { position: usize },

    #[error("Invalid prefix byte 0x{byte:02x} at byte {position}")]
    InvalidPrefix { byte: u8, position: usize },

    #[error("Invalid integer at byte {position}")]
    InvalidInteger { position: usize },

    #[error("Invalid byte string length at byte {position}")]
    InvalidLength { position: usize },

    #[error("Dictionary key at byte {position} is not a byte string")]
    NonStringKey { position: usize },

    #[error("Trailing data at byte {position}")]
    TrailingData { position: usize },

    #[error("Nesting deeper than {MAX_NESTING_DEPTH} levels")]
    NestingTooDeep,

    #[error(transparent)]
    Codec(#[from] serde_bencode::Error),
}

/// Decodes a complete bencode document.
///
/// The input is scanned for structure first, so deep nesting, trailing
/// bytes and non-canonical integers are rejected before deserializing.
///
/// # Errors
///
/// - `BencodeError::TrailingData` - Bytes remain after the first value
/// - Any other variant - The input is not valid bencode
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let end = value_end(data, 0, 0)?;
    if end != data.len() {
        return Err(BencodeError::TrailingData { position: end });
    }
    Ok(serde_bencode::from_bytes(data)?)
}

/// Encodes a value. Dictionary keys are written in sorted order.
///
/// # Errors
///
/// - `BencodeError::Codec` - Serialization failed
pub fn encode(value: &Value) -> Result<Vec<u8>, BencodeError> {
    Ok(serde_bencode::to_bytes(value)?)
}

/// Returns the byte range of `key`'s value inside the top-level dictionary.
///
/// The info-hash must be computed over the exact bytes a torrent carries,
/// so callers hash `&data[range]` instead of re-encoding a parsed value.
///
/// # Errors
///
/// - `BencodeError` - The document is not a well-formed dictionary
pub fn dictionary_value_span(
    data: &[u8],
    key: &[u8],
) -> Result<Option<Range<usize>>, BencodeError> {
    match peek(data, 0)? {
        b'd' => {}
        byte => return Err(BencodeError::InvalidPrefix { byte, position: 0 }),
    }

    let mut position = 1;
    while peek(data, position)? != b'e' {
        let (entry_key, start) = key_at(data, position)?;
        let end = value_end(data, start, 1)?;
        if entry_key == key {
            return Ok(Some(start..end));
        }
        position = end;
    }
    Ok(None)
}

fn peek(data: &[u8], position: usize) -> Result<u8, BencodeError> {
    data.get(position)
        .copied()
        .ok_or(BencodeError::UnexpectedEof { position })
}

/// Position just past the value starting at `position`.
fn value_end(data: &[u8], position: usize, depth: usize) -> Result<usize, BencodeError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(BencodeError::NestingTooDeep);
    }

    match peek(data, position)? {
        b'i' => integer_end(data, position),
        b'0'..=b'9' => string_span(data, position).map(|span| span.end),
        b'l' => {
            let mut cursor = position + 1;
            while peek(data, cursor)? != b'e' {
                cursor = value_end(data, cursor, depth + 1)?;
            }
            Ok(cursor + 1)
        }
        b'd' => {
            let mut cursor = position + 1;
            while peek(data, cursor)? != b'e' {
                let (_, value_start) = key_at(data, cursor)?;
                cursor = value_end(data, value_start, depth + 1)?;
            }
            Ok(cursor + 1)
        }
        byte => Err(BencodeError::InvalidPrefix { byte, position }),
    }
}

/// Dictionary key at `position` and the position of its value.
fn key_at(data: &[u8], position: usize) -> Result<(&[u8], usize), BencodeError> {
    if !peek(data, position)?.is_ascii_digit() {
        return Err(BencodeError::NonStringKey { position });
    }
    let span = string_span(data, position)?;
    let end = span.end;
    Ok((&data[span], end))
}

fn integer_end(data: &[u8], position: usize) -> Result<usize, BencodeError> {
    let digits_start = position + 1;
    let mut cursor = digits_start;
    while peek(data, cursor)? != b'e' {
        cursor += 1;
    }

    let digits = &data[digits_start..cursor];
    let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
    if unsigned.is_empty()
        || !unsigned.iter().all(u8::is_ascii_digit)
        || (unsigned.len() > 1 && unsigned[0] == b'0')
        || digits == b"-0"
        || std::str::from_utf8(digits)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .is_none()
    {
        return Err(BencodeError::InvalidInteger { position });
    }
    Ok(cursor + 1)
}

/// Payload range of the byte string starting at `position`.
fn string_span(data: &[u8], position: usize) -> Result<Range<usize>, BencodeError> {
    let invalid = BencodeError::InvalidLength { position };
    let mut cursor = position;
    while peek(data, cursor)? != b':' {
        if !data[cursor].is_ascii_digit() {
            return Err(invalid);
        }
        cursor += 1;
    }

    let digits = &data[position..cursor];
    if digits.is_empty() || (digits.len() > 1 && digits[0] == b'0') {
        return Err(invalid);
    }
    let length = std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .ok_or(invalid)?;

    let start = cursor + 1;
    let end = start
        .checked_add(length)
        .filter(|end| *end <= data.len())
        .ok_or(BencodeError::UnexpectedEof {
            position: data.len(),
        })?;
    Ok(start..end)
}
