//! Argument decomposition for delivered transport messages.
//!
//! Helper to decompose a slice of binary data (a message read from the device) into the
//! header and argument structures that follow it. Messages land in arbitrary daemon
//! buffers, so arguments are read out by value rather than borrowed in place.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use zerocopy::FromBytes;

/// An iterator that can be used to fetch typed arguments from a byte slice.
pub(crate) struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    /// Create a new argument iterator for the given byte slice.
    pub(crate) fn new(data: &'a [u8]) -> ArgumentIterator<'a> {
        ArgumentIterator { data }
    }

    /// Returns the size of the remaining data.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Fetch a slice of all remaining bytes.
    pub(crate) fn fetch_all(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }

    /// Fetch exactly `len` raw bytes. Returns `None` if there's not enough data left.
    pub(crate) fn fetch_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.data.len() < len {
            return None;
        }
        let (out, rest) = self.data.split_at(len);
        self.data = rest;
        Some(out)
    }

    /// Fetch a typed argument. Returns `None` if there's not enough data left.
    pub(crate) fn fetch<T: FromBytes>(&mut self) -> Option<T> {
        let (value, rest) = T::read_from_prefix(self.data).ok()?;
        self.data = rest;
        Some(value)
    }

    /// Fetch `count` consecutive typed arguments. Returns `None` if there's not enough data
    /// left, in which case nothing is consumed.
    pub(crate) fn fetch_vec<T: FromBytes>(&mut self, count: usize) -> Option<Vec<T>> {
        let needed = count.checked_mul(size_of::<T>())?;
        if self.data.len() < needed {
            return None;
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.fetch()?);
        }
        Some(out)
    }

    /// Fetch a (zero-terminated) string (can be non-utf8). Returns `None` if there's not enough
    /// data left or no zero-termination could be found.
    pub(crate) fn fetch_str(&mut self) -> Option<&'a OsStr> {
        let len = memchr::memchr(0, self.data)?;
        let (out, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Some(OsStr::from_bytes(out))
    }
}
