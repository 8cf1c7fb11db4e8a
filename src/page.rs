//! Pages and pipe buffers.
//!
//! A [`Page`] is one page-sized, shareable byte buffer. Requests carry page lists for bulk
//! data, the page cache behind [`InodeCache`](crate::InodeCache) hands out pages, and a
//! [`Pipe`] holds pages in flight between the device and the daemon. Sharing a [`PageRef`]
//! instead of copying bytes is what makes splice transfers zero-copy.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::ll::Errno;

/// Default number of buffers in a [`Pipe`].
pub const PIPE_DEF_BUFFERS: usize = 16;

/// Size in bytes of every [`Page`].
pub fn page_size() -> usize {
    page_size::get()
}

bitflags! {
    /// Page state relevant to copying and stealing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Contents are valid.
        const UPTODATE = 1 << 0;
        /// Contents differ from backing store.
        const DIRTY = 1 << 1;
        /// Being written back.
        const WRITEBACK = 1 << 2;
        /// Locked for I/O.
        const LOCKED = 1 << 3;
        /// Mapped into some process address space.
        const MAPPED = 1 << 4;
        /// Pinned in memory.
        const MLOCKED = 1 << 5;
        /// Has filesystem private data attached.
        const PRIVATE = 1 << 6;
        /// On an LRU list.
        const LRU = 1 << 7;
        /// Recently referenced.
        const REFERENCED = 1 << 8;
    }
}

/// Flags that may be set on a page handed over by stealing.
const STEALABLE: PageFlags = PageFlags::UPTODATE
    .union(PageFlags::LOCKED)
    .union(PageFlags::LRU)
    .union(PageFlags::REFERENCED);

/// Position of a page in the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageIndex {
    /// Owning inode.
    pub ino: u64,
    /// Page index within the file.
    pub index: u64,
}

/// One page of memory.
pub struct Page {
    data: Box<[u8]>,
    flags: PageFlags,
    mapping: Option<PageIndex>,
}

/// Shared handle to a [`Page`].
pub type PageRef = Arc<Mutex<Page>>;

impl Page {
    /// A zero-filled, unmapped page.
    pub fn new() -> Self {
        Self {
            data: vec![0; page_size()].into_boxed_slice(),
            flags: PageFlags::empty(),
            mapping: None,
        }
    }

    /// A page holding `bytes` at its start. Longer input is truncated to one page.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut page = Self::new();
        let n = bytes.len().min(page.data.len());
        page.data[..n].copy_from_slice(&bytes[..n]);
        page
    }

    /// Wrap into a shareable handle.
    pub fn into_ref(self) -> PageRef {
        Arc::new(Mutex::new(self))
    }

    /// Page contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable page contents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Current flags.
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Set or clear `flags`.
    pub fn set_flags(&mut self, flags: PageFlags, value: bool) {
        self.flags.set(flags, value);
    }

    /// Page cache position, if the page is in the cache.
    pub fn mapping(&self) -> Option<PageIndex> {
        self.mapping
    }

    /// Attach the page to, or detach it from, a page cache position.
    pub fn set_mapping(&mut self, mapping: Option<PageIndex>) {
        self.mapping = mapping;
    }

    /// Whether a page offered by the daemon may be taken over as is.
    pub(crate) fn is_stealable(&self) -> bool {
        !self.flags.contains(PageFlags::MAPPED)
            && self.mapping.is_none()
            && STEALABLE.contains(self.flags)
    }

    /// Whether a page about to be replaced is free of users that would notice.
    pub(crate) fn is_replaceable(&self) -> bool {
        !self.flags.intersects(
            PageFlags::MAPPED
                | PageFlags::PRIVATE
                | PageFlags::DIRTY
                | PageFlags::WRITEBACK
                | PageFlags::MLOCKED,
        )
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("flags", &self.flags)
            .field("mapping", &self.mapping)
            .finish_non_exhaustive()
    }
}

bitflags! {
    /// Per-buffer pipe flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipeBufFlags: u32 {
        /// The page was gifted by its owner and may be stolen.
        const GIFT = 1 << 0;
    }
}

bitflags! {
    /// Flags of a splice transfer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SpliceFlags: u32 {
        /// Move pages instead of copying, where possible.
        const MOVE = 1 << 0;
        /// Do not block.
        const NONBLOCK = 1 << 1;
        /// More data will follow.
        const MORE = 1 << 2;
        /// Pages are a gift.
        const GIFT = 1 << 3;
    }
}

/// A reference to part of a page sitting in a [`Pipe`].
#[derive(Debug, Clone)]
pub struct PipeBuffer {
    pub(crate) page: PageRef,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) flags: PipeBufFlags,
}

impl PipeBuffer {
    /// Buffer over `len` bytes of `page` starting at `offset`.
    pub fn new(page: PageRef, offset: usize, len: usize, flags: PipeBufFlags) -> Self {
        Self {
            page,
            offset,
            len,
            flags,
        }
    }

    /// The underlying page.
    pub fn page(&self) -> &PageRef {
        &self.page
    }

    /// Offset of the data within the page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffer flags.
    pub fn flags(&self) -> PipeBufFlags {
        self.flags
    }

    /// Copy out the buffer's bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.page.lock().data()[self.offset..self.offset + self.len].to_vec()
    }

    /// Check the buffer still describes valid page contents.
    pub(crate) fn confirm(&self) -> Result<(), Errno> {
        match self.offset.checked_add(self.len) {
            Some(end) if end <= page_size() => Ok(()),
            _ => Err(Errno::EINVAL),
        }
    }

    /// Whether the page can be taken away from this buffer: it must be a gift nobody else
    /// holds a reference to.
    pub(crate) fn can_steal(&self) -> bool {
        self.flags.contains(PipeBufFlags::GIFT) && Arc::strong_count(&self.page) == 1
    }
}

/// A bounded queue of page buffers, the userspace end of splice transfers.
#[derive(Debug)]
pub struct Pipe {
    bufs: VecDeque<PipeBuffer>,
    capacity: usize,
    readers: bool,
}

impl Pipe {
    /// An empty pipe with room for `capacity` buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            bufs: VecDeque::with_capacity(capacity),
            capacity,
            readers: true,
        }
    }

    /// Maximum number of buffers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently queued.
    pub fn nrbufs(&self) -> usize {
        self.bufs.len()
    }

    /// Total bytes queued.
    pub fn bytes(&self) -> usize {
        self.bufs.iter().map(|b| b.len).sum()
    }

    /// Whether the read end is still open.
    pub fn has_readers(&self) -> bool {
        self.readers
    }

    /// Close the read end.
    pub fn close_read_end(&mut self) {
        self.readers = false;
    }

    /// Queued buffers, oldest first.
    pub fn buffers(&self) -> impl Iterator<Item = &PipeBuffer> {
        self.bufs.iter()
    }

    /// Copy `data` into freshly allocated pages. Returns the number of bytes accepted, which
    /// is short when the pipe fills up.
    pub fn write_bytes(&mut self, data: &[u8]) -> usize {
        let mut written = 0;
        for chunk in data.chunks(page_size()) {
            if self.bufs.len() == self.capacity {
                break;
            }
            let page = Page::from_bytes(chunk).into_ref();
            self.bufs
                .push_back(PipeBuffer::new(page, 0, chunk.len(), PipeBufFlags::empty()));
            written += chunk.len();
        }
        written
    }

    /// Hand a whole page over to the pipe, allowing the reader to steal it.
    pub fn gift_page(&mut self, page: Page) -> Result<(), Errno> {
        if self.bufs.len() == self.capacity {
            return Err(Errno::EAGAIN);
        }
        let len = page.data().len();
        self.bufs
            .push_back(PipeBuffer::new(page.into_ref(), 0, len, PipeBufFlags::GIFT));
        Ok(())
    }

    /// Drain every queued byte.
    pub fn read_to_vec(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes());
        for buf in self.bufs.drain(..) {
            out.extend_from_slice(&buf.page.lock().data()[buf.offset..buf.offset + buf.len]);
        }
        out
    }

    /// Remove and return the oldest buffer.
    pub fn pop(&mut self) -> Option<PipeBuffer> {
        self.bufs.pop_front()
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.bufs.len())
    }

    pub(crate) fn extend(&mut self, bufs: impl IntoIterator<Item = PipeBuffer>) {
        self.bufs.extend(bufs);
    }

    /// Detach exactly `len` bytes worth of buffers from the front. A buffer straddling the
    /// boundary is split: the detached part loses its gift, since the page stays shared.
    pub(crate) fn take(&mut self, len: usize) -> Result<Vec<PipeBuffer>, Errno> {
        if self.bytes() < len {
            return Err(Errno::EINVAL);
        }
        let mut out = Vec::new();
        let mut rem = len;
        while rem > 0 {
            let Some(front) = self.bufs.front_mut() else {
                return Err(Errno::EINVAL);
            };
            if front.len <= rem {
                rem -= front.len;
                if let Some(buf) = self.bufs.pop_front() {
                    out.push(buf);
                }
            } else {
                let mut part = front.clone();
                part.len = rem;
                part.flags.remove(PipeBufFlags::GIFT);
                front.offset += rem;
                front.len -= rem;
                out.push(part);
                rem = 0;
            }
        }
        Ok(out)
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new(PIPE_DEF_BUFFERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_back() {
        let mut pipe = Pipe::new(4);
        let data: Vec<u8> = (0..page_size() + 10).map(|i| i as u8).collect();
        assert_eq!(pipe.write_bytes(&data), data.len());
        assert_eq!(pipe.nrbufs(), 2);
        assert_eq!(pipe.read_to_vec(), data);
        assert_eq!(pipe.nrbufs(), 0);
    }

    #[test]
    fn take_splits_partial_buffer() {
        let mut pipe = Pipe::new(4);
        pipe.gift_page(Page::from_bytes(b"abcdef")).unwrap();
        let taken = pipe.take(4).unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].to_vec(), b"abcd");
        assert!(!taken[0].flags().contains(PipeBufFlags::GIFT));
        let rest = pipe.pop().unwrap();
        assert_eq!(rest.offset(), 4);
        assert_eq!(rest.len(), page_size() - 4);
    }

    #[test]
    fn take_more_than_available() {
        let mut pipe = Pipe::new(4);
        pipe.write_bytes(b"xy");
        assert_eq!(pipe.take(3).unwrap_err(), Errno::EINVAL);
        assert_eq!(pipe.bytes(), 2);
    }

    #[test]
    fn gift_is_stealable_only_when_unshared() {
        let mut pipe = Pipe::new(1);
        pipe.gift_page(Page::new()).unwrap();
        let buf = pipe.pop().unwrap();
        assert!(buf.can_steal());
        let extra = buf.page().clone();
        assert!(!buf.can_steal());
        drop(extra);
        assert!(buf.page().lock().is_stealable());
    }

    #[test]
    fn full_pipe_refuses_gift() {
        let mut pipe = Pipe::new(1);
        pipe.gift_page(Page::new()).unwrap();
        assert_eq!(pipe.gift_page(Page::new()).unwrap_err(), Errno::EAGAIN);
    }
}
