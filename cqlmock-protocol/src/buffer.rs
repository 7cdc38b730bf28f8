//! Byte container used for frame bodies, parameter values and encoded responses.
//!
//! Small payloads live inline and are copied by value. Payloads larger than
//! [`INLINE_CAPACITY`] are stored on the heap behind an `Arc`, so clones only
//! bump a reference count and can cross threads.
//!
//! Encoding is positional: a buffer is pre-sized with [`Buffer::with_size`]
//! and each `encode_*` call writes at an offset and returns the offset just
//! past what it wrote. Writing into shared storage copies it first.

use crate::codec::Value;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Largest payload stored without a heap allocation.
pub const INLINE_CAPACITY: usize = 16;

/// An owned, length-tagged sequence of bytes.
#[derive(Clone)]
pub struct Buffer {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Inline {
        data: [u8; INLINE_CAPACITY],
        len: u8,
    },
    Shared(Arc<[u8]>),
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            repr: Repr::Inline {
                data: [0; INLINE_CAPACITY],
                len: 0,
            },
        }
    }

    /// Creates a zero-filled buffer of exactly `size` bytes, ready for encoding.
    pub fn with_size(size: usize) -> Self {
        if size <= INLINE_CAPACITY {
            Self {
                repr: Repr::Inline {
                    data: [0; INLINE_CAPACITY],
                    len: size as u8,
                },
            }
        } else {
            Self {
                repr: Repr::Shared(Arc::from(vec![0u8; size])),
            }
        }
    }

    /// Creates a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        if bytes.len() <= INLINE_CAPACITY {
            let mut data = [0; INLINE_CAPACITY];
            data[..bytes.len()].copy_from_slice(bytes);
            Self {
                repr: Repr::Inline {
                    data,
                    len: bytes.len() as u8,
                },
            }
        } else {
            Self {
                repr: Repr::Shared(Arc::from(bytes)),
            }
        }
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Inline { len, .. } => *len as usize,
            Repr::Shared(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the bytes are stored inline.
    pub fn is_inline(&self) -> bool {
        matches!(self.repr, Repr::Inline { .. })
    }

    /// Returns true if both buffers point at the same heap storage.
    pub fn shares_storage_with(&self, other: &Buffer) -> bool {
        match (&self.repr, &other.repr) {
            (Repr::Shared(a), Repr::Shared(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            Repr::Inline { data, len } => &data[..*len as usize],
            Repr::Shared(bytes) => bytes,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.repr {
            Repr::Inline { data, len } => &mut data[..*len as usize],
            Repr::Shared(shared) => {
                if Arc::get_mut(shared).is_none() {
                    *shared = Arc::from(&shared[..]);
                }
                match Arc::get_mut(shared) {
                    Some(bytes) => bytes,
                    None => unreachable!("freshly copied storage has a single owner"),
                }
            }
        }
    }

    /// Copies raw bytes to `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the write would run past the pre-sized length.
    pub fn copy(&mut self, offset: usize, bytes: &[u8]) -> usize {
        let end = offset + bytes.len();
        assert!(
            end <= self.len(),
            "encode past end of buffer: {} > {}",
            end,
            self.len()
        );
        self.bytes_mut()[offset..end].copy_from_slice(bytes);
        end
    }

    pub fn encode_byte(&mut self, offset: usize, value: u8) -> usize {
        self.copy(offset, &[value])
    }

    pub fn encode_int8(&mut self, offset: usize, value: i8) -> usize {
        self.copy(offset, &value.to_be_bytes())
    }

    pub fn encode_int16(&mut self, offset: usize, value: i16) -> usize {
        self.copy(offset, &value.to_be_bytes())
    }

    pub fn encode_uint16(&mut self, offset: usize, value: u16) -> usize {
        self.copy(offset, &value.to_be_bytes())
    }

    pub fn encode_int32(&mut self, offset: usize, value: i32) -> usize {
        self.copy(offset, &value.to_be_bytes())
    }

    pub fn encode_uint32(&mut self, offset: usize, value: u32) -> usize {
        self.copy(offset, &value.to_be_bytes())
    }

    pub fn encode_int64(&mut self, offset: usize, value: i64) -> usize {
        self.copy(offset, &value.to_be_bytes())
    }

    /// `[string]`: u16 length followed by UTF-8 bytes.
    pub fn encode_string(&mut self, offset: usize, value: &str) -> usize {
        assert!(value.len() <= u16::MAX as usize, "string too long");
        let pos = self.encode_uint16(offset, value.len() as u16);
        self.copy(pos, value.as_bytes())
    }

    /// `[long string]`: i32 length followed by UTF-8 bytes.
    pub fn encode_long_string(&mut self, offset: usize, value: &str) -> usize {
        let pos = self.encode_int32(offset, value.len() as i32);
        self.copy(pos, value.as_bytes())
    }

    /// `[bytes]`: i32 length followed by the bytes, or `-1` for null.
    pub fn encode_bytes(&mut self, offset: usize, value: Option<&[u8]>) -> usize {
        match value {
            Some(bytes) => {
                let pos = self.encode_int32(offset, bytes.len() as i32);
                self.copy(pos, bytes)
            }
            None => self.encode_int32(offset, -1),
        }
    }

    /// `[short bytes]`: u16 length followed by the bytes.
    pub fn encode_short_bytes(&mut self, offset: usize, value: &[u8]) -> usize {
        assert!(value.len() <= u16::MAX as usize, "short bytes too long");
        let pos = self.encode_uint16(offset, value.len() as u16);
        self.copy(pos, value)
    }

    /// `[value]`: like `[bytes]`, with `-2` for an unset value.
    pub fn encode_value(&mut self, offset: usize, value: &Value) -> usize {
        match value {
            Value::Null => self.encode_int32(offset, -1),
            Value::Unset => self.encode_int32(offset, -2),
            Value::Bytes(bytes) => self.encode_bytes(offset, Some(bytes)),
        }
    }

    pub fn encode_string_list<S: AsRef<str>>(&mut self, offset: usize, list: &[S]) -> usize {
        let mut pos = self.encode_uint16(offset, list.len() as u16);
        for item in list {
            pos = self.encode_string(pos, item.as_ref());
        }
        pos
    }

    pub fn encode_string_map<K, V>(&mut self, offset: usize, map: &[(K, V)]) -> usize
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut pos = self.encode_uint16(offset, map.len() as u16);
        for (key, value) in map {
            pos = self.encode_string(pos, key.as_ref());
            pos = self.encode_string(pos, value.as_ref());
        }
        pos
    }

    pub fn encode_string_multimap<K, V>(&mut self, offset: usize, map: &[(K, Vec<V>)]) -> usize
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut pos = self.encode_uint16(offset, map.len() as u16);
        for (key, values) in map {
            pos = self.encode_string(pos, key.as_ref());
            pos = self.encode_string_list(pos, values);
        }
        pos
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 32;
        write!(f, "Buffer({} bytes: ", self.len())?;
        for byte in self.as_slice().iter().take(PREVIEW) {
            write!(f, "{:02x}", byte)?;
        }
        if self.len() > PREVIEW {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from_slice(bytes)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        if bytes.len() <= INLINE_CAPACITY {
            Self::from_slice(&bytes)
        } else {
            Self {
                repr: Repr::Shared(Arc::from(bytes)),
            }
        }
    }
}

impl From<&str> for Buffer {
    fn from(value: &str) -> Self {
        Self::from_slice(value.as_bytes())
    }
}

impl From<bytes::Bytes> for Buffer {
    fn from(bytes: bytes::Bytes) -> Self {
        Self::from_slice(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_buffer_is_inline() {
        let buffer = Buffer::from_slice(b"0123456789abcdef");
        assert!(buffer.is_inline());
        assert_eq!(buffer.len(), INLINE_CAPACITY);
        assert_eq!(buffer.as_slice(), b"0123456789abcdef");
    }

    #[test]
    fn test_large_buffer_is_shared() {
        let buffer = Buffer::from_slice(&[7u8; 17]);
        assert!(!buffer.is_inline());
        assert_eq!(buffer.len(), 17);

        let clone = buffer.clone();
        assert!(clone.shares_storage_with(&buffer));
        assert_eq!(clone, buffer);
    }

    #[test]
    fn test_encode_chains_offsets() {
        let mut buffer = Buffer::with_size(1 + 2 + 4 + 8);
        let pos = buffer.encode_byte(0, 0x84);
        let pos = buffer.encode_int16(pos, -2);
        let pos = buffer.encode_int32(pos, 0x0102_0304);
        let pos = buffer.encode_int64(pos, 1);
        assert_eq!(pos, buffer.len());
        assert_eq!(
            buffer.as_slice(),
            &[0x84, 0xff, 0xfe, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 1]
        );
    }

    #[test]
    fn test_encode_string_forms() {
        let mut buffer = Buffer::with_size(2 + 3 + 4 + 3);
        let pos = buffer.encode_string(0, "abc");
        let pos = buffer.encode_long_string(pos, "xyz");
        assert_eq!(pos, buffer.len());
        assert_eq!(&buffer[..5], &[0, 3, b'a', b'b', b'c']);
        assert_eq!(&buffer[5..], &[0, 0, 0, 3, b'x', b'y', b'z']);
    }

    #[test]
    fn test_encode_null_and_empty_bytes() {
        let mut buffer = Buffer::with_size(8);
        let pos = buffer.encode_bytes(0, None);
        let pos = buffer.encode_bytes(pos, Some(&[]));
        assert_eq!(pos, 8);
        assert_eq!(buffer.as_slice(), &[0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]);
    }

    #[test]
    fn test_write_after_clone_copies() {
        let mut original = Buffer::with_size(32);
        original.encode_int32(0, 1);
        let snapshot = original.clone();

        original.encode_int32(0, 2);

        assert_eq!(&snapshot[..4], &[0, 0, 0, 1]);
        assert_eq!(&original[..4], &[0, 0, 0, 2]);
        assert!(!original.shares_storage_with(&snapshot));
    }

    #[test]
    #[should_panic(expected = "encode past end of buffer")]
    fn test_encode_overflow_panics() {
        let mut buffer = Buffer::with_size(3);
        buffer.encode_int32(0, 1);
    }

    #[test]
    fn test_string_map_layout() {
        let map = [("CQL_VERSION", "3.0.0")];
        let mut buffer = Buffer::with_size(2 + 2 + 11 + 2 + 5);
        let pos = buffer.encode_string_map(0, &map);
        assert_eq!(pos, buffer.len());
        assert_eq!(&buffer[..4], &[0, 1, 0, 11]);
    }

    #[test]
    fn test_debug_preview() {
        let buffer = Buffer::from_slice(&[0xab, 0xcd]);
        assert_eq!(format!("{:?}", buffer), "Buffer(2 bytes: abcd)");
    }
}
