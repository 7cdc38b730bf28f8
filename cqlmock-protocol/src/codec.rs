//! Primitive codec for the native protocol notation.
//!
//! Every decoder takes the remaining input and returns the decoded value
//! together with the input that follows it. Running out of input is reported
//! as [`ProtocolError::Truncated`]. Encoding lives on [`Buffer`]; the
//! `sizeof_*` helpers here compute the exact size to pre-allocate.

use crate::buffer::Buffer;
use crate::error::ProtocolError;

/// Result of decoding a value: the value and the unread input.
pub type Decoded<'a, T> = Result<(T, &'a [u8]), ProtocolError>;

/// A bound value (`[value]` in the protocol notation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Length `-1`.
    Null,
    /// Length `-2`, protocol v4 and later.
    Unset,
    Bytes(Buffer),
}

impl Value {
    pub fn bytes(bytes: impl Into<Buffer>) -> Self {
        Value::Bytes(bytes.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

fn split(input: &[u8], n: usize) -> Decoded<'_, &[u8]> {
    if input.len() < n {
        return Err(ProtocolError::truncated(n, input.len()));
    }
    Ok(input.split_at(n))
}

/// A fixed number of raw bytes.
pub fn decode_array<const N: usize>(input: &[u8]) -> Decoded<'_, [u8; N]> {
    let (head, rest) = split(input, N)?;
    let mut array = [0u8; N];
    array.copy_from_slice(head);
    Ok((array, rest))
}

pub fn decode_byte(input: &[u8]) -> Decoded<'_, u8> {
    let ([byte], rest) = decode_array::<1>(input)?;
    Ok((byte, rest))
}

pub fn decode_int8(input: &[u8]) -> Decoded<'_, i8> {
    let (bytes, rest) = decode_array(input)?;
    Ok((i8::from_be_bytes(bytes), rest))
}

pub fn decode_int16(input: &[u8]) -> Decoded<'_, i16> {
    let (bytes, rest) = decode_array(input)?;
    Ok((i16::from_be_bytes(bytes), rest))
}

pub fn decode_uint16(input: &[u8]) -> Decoded<'_, u16> {
    let (bytes, rest) = decode_array(input)?;
    Ok((u16::from_be_bytes(bytes), rest))
}

pub fn decode_int32(input: &[u8]) -> Decoded<'_, i32> {
    let (bytes, rest) = decode_array(input)?;
    Ok((i32::from_be_bytes(bytes), rest))
}

pub fn decode_uint32(input: &[u8]) -> Decoded<'_, u32> {
    let (bytes, rest) = decode_array(input)?;
    Ok((u32::from_be_bytes(bytes), rest))
}

pub fn decode_int64(input: &[u8]) -> Decoded<'_, i64> {
    let (bytes, rest) = decode_array(input)?;
    Ok((i64::from_be_bytes(bytes), rest))
}

fn utf8(bytes: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

/// `[string]`
pub fn decode_string(input: &[u8]) -> Decoded<'_, String> {
    let (len, rest) = decode_uint16(input)?;
    let (bytes, rest) = split(rest, len as usize)?;
    Ok((utf8(bytes)?, rest))
}

/// `[long string]`
pub fn decode_long_string(input: &[u8]) -> Decoded<'_, String> {
    let (len, rest) = decode_int32(input)?;
    if len < 0 {
        return Err(ProtocolError::InvalidLength(len));
    }
    let (bytes, rest) = split(rest, len as usize)?;
    Ok((utf8(bytes)?, rest))
}

/// `[bytes]`, where a negative length is null.
pub fn decode_bytes(input: &[u8]) -> Decoded<'_, Option<Buffer>> {
    let (value, rest) = decode_value(input)?;
    match value {
        Value::Bytes(bytes) => Ok((Some(bytes), rest)),
        Value::Null | Value::Unset => Ok((None, rest)),
    }
}

/// `[short bytes]`
pub fn decode_short_bytes(input: &[u8]) -> Decoded<'_, Buffer> {
    let (len, rest) = decode_uint16(input)?;
    let (bytes, rest) = split(rest, len as usize)?;
    Ok((Buffer::from_slice(bytes), rest))
}

/// `[value]`: `-1` is null, `-2` is unset, anything below is invalid.
pub fn decode_value(input: &[u8]) -> Decoded<'_, Value> {
    let (len, rest) = decode_int32(input)?;
    match len {
        -1 => Ok((Value::Null, rest)),
        -2 => Ok((Value::Unset, rest)),
        len if len < 0 => Err(ProtocolError::InvalidLength(len)),
        len => {
            let (bytes, rest) = split(rest, len as usize)?;
            Ok((Value::Bytes(Buffer::from_slice(bytes)), rest))
        }
    }
}

/// `<n><value_1>...<value_n>` with a u16 count.
pub fn decode_values(input: &[u8]) -> Decoded<'_, Vec<Value>> {
    let (count, mut rest) = decode_uint16(input)?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (value, next) = decode_value(rest)?;
        values.push(value);
        rest = next;
    }
    Ok((values, rest))
}

/// `<n><name_1><value_1>...<name_n><value_n>` with a u16 count.
pub fn decode_named_values(input: &[u8]) -> Decoded<'_, (Vec<String>, Vec<Value>)> {
    let (count, mut rest) = decode_uint16(input)?;
    let mut names = Vec::with_capacity(count as usize);
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (name, next) = decode_string(rest)?;
        let (value, next) = decode_value(next)?;
        names.push(name);
        values.push(value);
        rest = next;
    }
    Ok(((names, values), rest))
}

/// `[string list]`
pub fn decode_string_list(input: &[u8]) -> Decoded<'_, Vec<String>> {
    let (count, mut rest) = decode_uint16(input)?;
    let mut list = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (item, next) = decode_string(rest)?;
        list.push(item);
        rest = next;
    }
    Ok((list, rest))
}

/// `[string map]`, in wire order.
pub fn decode_string_map(input: &[u8]) -> Decoded<'_, Vec<(String, String)>> {
    let (count, mut rest) = decode_uint16(input)?;
    let mut map = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (key, next) = decode_string(rest)?;
        let (value, next) = decode_string(next)?;
        map.push((key, value));
        rest = next;
    }
    Ok((map, rest))
}

/// `[string multimap]`, in wire order.
pub fn decode_string_multimap(input: &[u8]) -> Decoded<'_, Vec<(String, Vec<String>)>> {
    let (count, mut rest) = decode_uint16(input)?;
    let mut map = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (key, next) = decode_string(rest)?;
        let (values, next) = decode_string_list(next)?;
        map.push((key, values));
        rest = next;
    }
    Ok((map, rest))
}

/// Fails with [`ProtocolError::TrailingBytes`] unless the input was fully consumed.
pub fn expect_end(rest: &[u8]) -> Result<(), ProtocolError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::TrailingBytes(rest.len()))
    }
}

pub fn sizeof_string(value: &str) -> usize {
    2 + value.len()
}

pub fn sizeof_long_string(value: &str) -> usize {
    4 + value.len()
}

pub fn sizeof_bytes(value: Option<&[u8]>) -> usize {
    4 + value.map_or(0, <[u8]>::len)
}

pub fn sizeof_short_bytes(value: &[u8]) -> usize {
    2 + value.len()
}

pub fn sizeof_value(value: &Value) -> usize {
    4 + value.as_bytes().map_or(0, <[u8]>::len)
}

pub fn sizeof_values(values: &[Value]) -> usize {
    2 + values.iter().map(sizeof_value).sum::<usize>()
}

pub fn sizeof_string_list<S: AsRef<str>>(list: &[S]) -> usize {
    2 + list.iter().map(|s| sizeof_string(s.as_ref())).sum::<usize>()
}

pub fn sizeof_string_map<K: AsRef<str>, V: AsRef<str>>(map: &[(K, V)]) -> usize {
    2 + map
        .iter()
        .map(|(k, v)| sizeof_string(k.as_ref()) + sizeof_string(v.as_ref()))
        .sum::<usize>()
}

pub fn sizeof_string_multimap<K: AsRef<str>, V: AsRef<str>>(map: &[(K, Vec<V>)]) -> usize {
    2 + map
        .iter()
        .map(|(k, v)| sizeof_string(k.as_ref()) + sizeof_string_list(v))
        .sum::<usize>()
}
