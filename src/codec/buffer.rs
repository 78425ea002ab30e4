//! Little-endian record buffer and its bounds-checked reader.

use bytes::{Buf, BufMut, BytesMut};

use crate::NsError;

/// Append-only byte buffer used to build one record.
#[derive(Debug, Default)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    /// Append one byte.
    #[inline]
    pub fn put_u8(&mut self, value: u8) {
        self.inner.put_u8(value);
    }

    /// Append a little-endian `u16`.
    #[inline]
    pub fn put_u16(&mut self, value: u16) {
        self.inner.put_u16_le(value);
    }

    /// Append a little-endian `u32`.
    #[inline]
    pub fn put_u32(&mut self, value: u32) {
        self.inner.put_u32_le(value);
    }

    /// Append a little-endian `u64`.
    #[inline]
    pub fn put_u64(&mut self, value: u64) {
        self.inner.put_u64_le(value);
    }

    /// Append raw bytes.
    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.inner.put_slice(bytes);
    }

    /// Append a NUL-terminated string prefixed with its `u16` length
    /// (terminator included).
    pub fn put_cstr(&mut self, value: &str) -> Result<(), NsError> {
        let len = u16::try_from(value.len() + 1).map_err(|_| NsError::InvalidArgument {
            operation: "encode",
            reason: format!("string of {} bytes does not fit a record", value.len()),
        })?;
        self.put_u16(len);
        self.put_bytes(value.as_bytes());
        self.put_u8(0);
        Ok(())
    }

    /// Bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if nothing was written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Finish the record.
    pub fn into_vec(self) -> Vec<u8> {
        self.inner.to_vec()
    }
}

/// Cursor over an encoded record. Every read checks the remaining length and
/// reports truncation as [`NsError::Corrupted`].
#[derive(Debug)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BufferReader<'a> {
    /// Start reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Current read offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], NsError> {
        if self.remaining() < n {
            return Err(NsError::corrupted(format!(
                "record truncated at offset {}: need {n} bytes, have {}",
                self.offset,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    /// Read one byte.
    pub fn grab_u8(&mut self) -> Result<u8, NsError> {
        Ok(self.take(1)?.get_u8())
    }

    /// Read a little-endian `u16`.
    pub fn grab_u16(&mut self) -> Result<u16, NsError> {
        Ok(self.take(2)?.get_u16_le())
    }

    /// Read a little-endian `u32`.
    pub fn grab_u32(&mut self) -> Result<u32, NsError> {
        Ok(self.take(4)?.get_u32_le())
    }

    /// Read a little-endian `u64`.
    pub fn grab_u64(&mut self) -> Result<u64, NsError> {
        Ok(self.take(8)?.get_u64_le())
    }

    /// Read `n` raw bytes.
    pub fn grab_bytes(&mut self, n: usize) -> Result<&'a [u8], NsError> {
        self.take(n)
    }

    /// Read a string written by [`Buffer::put_cstr`].
    pub fn grab_cstr(&mut self) -> Result<String, NsError> {
        let len = usize::from(self.grab_u16()?);
        let raw = self.take(len)?;
        let raw = match raw.split_last() {
            Some((0, text)) => text,
            _ => return Err(NsError::corrupted("string is not NUL-terminated")),
        };
        String::from_utf8(raw.to_vec())
            .map_err(|e| NsError::corrupted(format!("string is not UTF-8: {e}")))
    }
}
