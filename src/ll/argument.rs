//! Argument decomposition for TNFS requests.
//!
//! Helper to decompose a request payload (the bytes after the 4-byte header)
//! into multiple data structures (request arguments). TNFS payloads are a mix
//! of packed little-endian structs and NUL-terminated strings.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

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
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Fetch a slice of all remaining bytes.
    pub(crate) fn fetch_all(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }

    /// Fetch a typed argument. Returns `None` if there's not enough data left.
    ///
    /// The `Unaligned` bound is what makes this safe at arbitrary offsets: the
    /// header is 4 bytes, so nothing past it can be assumed aligned.
    pub(crate) fn fetch<T: FromBytes + KnownLayout + Immutable + Unaligned>(
        &mut self,
    ) -> Option<&'a T> {
        let (arg, rest) = zerocopy::Ref::<_, T>::from_prefix(self.data).ok()?;
        self.data = rest;
        Some(zerocopy::Ref::into_ref(arg))
    }

    /// Fetch a single byte. Returns `None` if there's no data left.
    pub(crate) fn fetch_u8(&mut self) -> Option<u8> {
        let (&byte, rest) = self.data.split_first()?;
        self.data = rest;
        Some(byte)
    }

    /// Fetch a (NUL-terminated) string (can be non-utf8). Returns `None` if
    /// there's not enough data left or no NUL termination could be found.
    pub(crate) fn fetch_str(&mut self) -> Option<&'a OsStr> {
        let len = memchr::memchr(0, self.data)?;
        let (out, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Some(OsStr::from_bytes(out))
    }
}
