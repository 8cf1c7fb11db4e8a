//! Reply encoding for daemons driving the transport.
//!
//! A reply is one `fuse_out_header` followed by the operation's output arguments, written
//! to the device in a single call.

use std::io::IoSlice;

use smallvec::SmallVec;
use smallvec::smallvec;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use super::Errno;
use super::fuse_abi as abi;

const INLINE_DATA_THRESHOLD: usize = size_of::<u64>() * 4;
pub(crate) type ResponseBuf = SmallVec<[u8; INLINE_DATA_THRESHOLD]>;

/// The body of a reply to one request.
#[derive(Debug)]
pub enum Response<'a> {
    /// Header only: success when `None`, otherwise the error to report.
    Error(Option<Errno>),
    /// Owned output arguments.
    Data(ResponseBuf),
    /// Borrowed output arguments.
    Slice(&'a [u8]),
}

impl<'a> Response<'a> {
    /// Build the iovec for this reply to `unique` and hand it to `f`.
    ///
    /// # Panics
    /// Panics if the body does not fit in the header's 32-bit length field.
    pub fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(&self, unique: u64, f: F) -> T {
        let datalen = match &self {
            Response::Error(_) => 0,
            Response::Data(v) => v.len(),
            Response::Slice(d) => d.len(),
        };
        let header = abi::fuse_out_header {
            unique,
            error: if let Response::Error(Some(errno)) = self {
                errno.to_wire()
            } else {
                0
            },
            len: (size_of::<abi::fuse_out_header>() + datalen)
                .try_into()
                .expect("Too much data"),
        };
        let mut v: SmallVec<[IoSlice<'_>; 3]> = smallvec![IoSlice::new(header.as_bytes())];
        match &self {
            Response::Error(_) => {}
            Response::Data(d) => v.push(IoSlice::new(d)),
            Response::Slice(d) => v.push(IoSlice::new(d)),
        }
        f(&v)
    }

    /// Flatten the reply to `unique` into one buffer.
    pub fn to_vec(&self, unique: u64) -> Vec<u8> {
        self.with_iovec(unique, |iov| iov.iter().flat_map(|s| s.iter().copied()).collect())
    }

    /// Successful reply without output arguments.
    pub fn new_empty() -> Self {
        Self::Error(None)
    }

    /// Failed reply.
    pub fn new_error(error: Errno) -> Self {
        Self::Error(Some(error))
    }

    /// Reply carrying a copy of `data`.
    pub fn new_data<T: AsRef<[u8]> + Into<Vec<u8>>>(data: T) -> Self {
        Self::Data(if data.as_ref().len() <= INLINE_DATA_THRESHOLD {
            ResponseBuf::from_slice(data.as_ref())
        } else {
            ResponseBuf::from_vec(data.into())
        })
    }

    /// Reply borrowing `data`.
    pub fn new_slice(data: &'a [u8]) -> Self {
        Self::Slice(data)
    }

    /// Reply carrying one fixed-layout output struct.
    pub fn from_struct<T: IntoBytes + Immutable + ?Sized>(data: &T) -> Self {
        Self::Data(SmallVec::from_slice(data.as_bytes()))
    }
}
