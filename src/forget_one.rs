use ref_cast::RefCast;
use zerocopy::IntoBytes;

use crate::ll::fuse_abi::fuse_forget_one;

/// One queued forget: the daemon may drop `nlookup` lookups of `nodeid`.
///
/// This is both the record kept on a node's forget queue and the entry format of a
/// `FUSE_BATCH_FORGET` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RefCast)]
#[repr(transparent)]
pub struct ForgetOne {
    forget_one: fuse_forget_one,
}

impl ForgetOne {
    /// A forget of `nlookup` lookups on `nodeid`.
    pub fn new(nodeid: u64, nlookup: u64) -> Self {
        Self {
            forget_one: fuse_forget_one { nodeid, nlookup },
        }
    }

    /// Inode number.
    pub fn nodeid(&self) -> u64 {
        self.forget_one.nodeid
    }

    /// Number of lookups.
    pub fn nlookup(&self) -> u64 {
        self.forget_one.nlookup
    }

    pub(crate) fn from_inner(inner: &fuse_forget_one) -> &Self {
        Self::ref_cast(inner)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.forget_one.as_bytes()
    }
}
