//! Encoding of out-of-band notifications written by the daemon.
//!
//! A notification is a reply header with `unique == 0` whose `error` field carries the
//! notification code, followed by the code's fixed struct and optional trailing data.

use std::ffi::OsStr;
use std::io::IoSlice;
use std::num::TryFromIntError;
use std::os::unix::ffi::OsStrExt;

use smallvec::SmallVec;
use smallvec::smallvec;
use zerocopy::IntoBytes;

use super::fuse_abi as abi;
use super::fuse_abi::fuse_notify_code as notify_code;

const NUL: &[u8] = &[0];

#[derive(Debug)]
pub(crate) struct Notification<'a> {
    code: notify_code,
    head: SmallVec<[u8; 32]>,
    tail: SmallVec<[&'a [u8]; 2]>,
}

impl<'a> Notification<'a> {
    fn new<T: IntoBytes + zerocopy::Immutable>(
        code: notify_code,
        head: &T,
        tail: SmallVec<[&'a [u8]; 2]>,
    ) -> Self {
        Self {
            code,
            head: SmallVec::from_slice(head.as_bytes()),
            tail,
        }
    }

    pub(crate) fn new_poll(kh: u64) -> Self {
        let r = abi::fuse_notify_poll_wakeup_out { kh };
        Self::new(notify_code::FUSE_POLL, &r, smallvec![])
    }

    pub(crate) fn new_inval_inode(ino: u64, off: i64, len: i64) -> Self {
        let r = abi::fuse_notify_inval_inode_out { ino, off, len };
        Self::new(notify_code::FUSE_NOTIFY_INVAL_INODE, &r, smallvec![])
    }

    pub(crate) fn new_inval_entry(parent: u64, name: &'a OsStr) -> Result<Self, TryFromIntError> {
        let r = abi::fuse_notify_inval_entry_out {
            parent,
            namelen: name.len().try_into()?,
            padding: 0,
        };
        Ok(Self::new(
            notify_code::FUSE_NOTIFY_INVAL_ENTRY,
            &r,
            smallvec![name.as_bytes(), NUL],
        ))
    }

    pub(crate) fn new_delete(
        parent: u64,
        child: u64,
        name: &'a OsStr,
    ) -> Result<Self, TryFromIntError> {
        let r = abi::fuse_notify_delete_out {
            parent,
            child,
            namelen: name.len().try_into()?,
            padding: 0,
        };
        Ok(Self::new(
            notify_code::FUSE_NOTIFY_DELETE,
            &r,
            smallvec![name.as_bytes(), NUL],
        ))
    }

    pub(crate) fn new_store(ino: u64, offset: u64, data: &'a [u8]) -> Result<Self, TryFromIntError> {
        let r = abi::fuse_notify_store_out {
            nodeid: ino,
            offset,
            size: data.len().try_into()?,
            padding: 0,
        };
        Ok(Self::new(notify_code::FUSE_NOTIFY_STORE, &r, smallvec![data]))
    }

    pub(crate) fn new_retrieve(
        notify_unique: u64,
        ino: u64,
        offset: u64,
        size: u32,
    ) -> Self {
        let r = abi::fuse_notify_retrieve_out {
            notify_unique,
            nodeid: ino,
            offset,
            size,
            padding: 0,
        };
        Self::new(notify_code::FUSE_NOTIFY_RETRIEVE, &r, smallvec![])
    }

    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(
        &self,
        f: F,
    ) -> Result<T, TryFromIntError> {
        let datalen = self.head.len() + self.tail.iter().map(|t| t.len()).sum::<usize>();
        let header = abi::fuse_out_header {
            unique: 0,
            error: self.code as i32,
            len: (size_of::<abi::fuse_out_header>() + datalen).try_into()?,
        };
        let mut v: SmallVec<[IoSlice<'_>; 4]> =
            smallvec![IoSlice::new(header.as_bytes()), IoSlice::new(&self.head)];
        for t in &self.tail {
            v.push(IoSlice::new(t));
        }
        Ok(f(&v))
    }
}
