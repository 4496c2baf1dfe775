//! Growable byte buffer passed between pipeline stages.
//!
//! Every transform in the tunnel cipher pipeline consumes one buffer and
//! produces a (possibly new) owned buffer; buffers are never shared between
//! two stages at the same time. Unlike a plain `Vec<u8>`, allocation failure
//! is surfaced as [`Error::OutOfMemory`] at the append boundary instead of
//! aborting the process.
//!
//! [`Error::OutOfMemory`]: crate::error::Error::OutOfMemory

use crate::error::Error;

/// An owned, growable byte sequence.
///
/// The number of valid bytes (`len`) never exceeds the allocated capacity,
/// and no operation reads past `len`. Growth on append is geometric.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    /// Creates an empty buffer without allocating.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Creates an empty buffer with at least `capacity` bytes preallocated.
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        let mut data = Vec::new();
        data.try_reserve(capacity)?;
        Ok(Self { data })
    }

    /// Creates a buffer holding a copy of `src`.
    pub fn from_slice(src: &[u8]) -> Result<Self, Error> {
        let mut buf = Self::with_capacity(src.len())?;
        buf.data.extend_from_slice(src);
        Ok(buf)
    }

    /// Appends `bytes` at the tail, growing the allocation if needed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.data.try_reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Consumes the first `n` bytes, shifting the remainder to the head.
    ///
    /// Consuming more bytes than the buffer holds empties it.
    pub fn truncate_front(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    /// The number of valid bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The allocated capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// The valid bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the buffer, returning the underlying storage.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_append_and_len() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());
        buf.append(b"hello").unwrap();
        buf.append(b", world").unwrap();
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.as_slice(), b"hello, world");
    }

    #[test]
    fn test_truncate_front() {
        let mut buf = Buffer::from_slice(b"0123456789").unwrap();
        buf.truncate_front(4);
        assert_eq!(buf.as_slice(), b"456789");
        buf.truncate_front(0);
        assert_eq!(buf.as_slice(), b"456789");
        buf.truncate_front(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_capacity_invariant() {
        let mut buf = Buffer::with_capacity(8).unwrap();
        assert!(buf.capacity() >= 8);
        for _ in 0..64 {
            buf.append(&[0u8; 16]).unwrap();
            assert!(buf.len() <= buf.capacity());
        }
        assert_eq!(buf.len(), 1024);
    }

    #[test]
    fn test_from_slice_owns_copy() {
        let src = vec![7u8; 32];
        let buf = Buffer::from_slice(&src).unwrap();
        drop(src);
        assert_eq!(buf.as_slice(), &[7u8; 32]);
    }
}
