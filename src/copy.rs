//! Copy engine: moves request arguments between a request and a daemon-supplied buffer.
//!
//! The daemon's buffer is walked one segment at a time. A vectored buffer is cut at page
//! boundaries, the way it would be pinned page by page; a pipe contributes one
//! [`PipeBuffer`] per segment. While a segment is in use the request is locked, so an
//! abort waits for the copy instead of tearing the buffers down under it.
//!
//! Page locks are never nested: data moving between a request page and a segment goes
//! through a scratch buffer.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use log::trace;
use log::warn;

use crate::cache::InodeCache;
use crate::ll::Errno;
use crate::node::NumaNode;
use crate::node::ReqRef;
use crate::page::Page;
use crate::page::PageFlags;
use crate::page::PageRef;
use crate::page::PipeBufFlags;
use crate::page::PipeBuffer;
use crate::page::page_size;
use crate::request::ArgList;

/// The daemon side of a transfer.
pub(crate) enum UserBuf<'a> {
    /// Destination of a device read.
    Read(VecDeque<&'a mut [u8]>),
    /// Source of a device write.
    Write(VecDeque<&'a [u8]>),
    /// Destination of a splice read: pages to be appended to a pipe, at most `capacity`.
    PipeOut {
        bufs: Vec<PipeBuffer>,
        capacity: usize,
    },
    /// Source of a splice write: buffers detached from a pipe.
    PipeIn(VecDeque<PipeBuffer>),
}

impl UserBuf<'_> {
    fn to_user(&self) -> bool {
        matches!(self, UserBuf::Read(_) | UserBuf::PipeOut { .. })
    }
}

/// The segment being copied.
enum Segment<'a> {
    None,
    Out(&'a mut [u8]),
    In(&'a [u8]),
    PipeOut { page: PageRef, filled: usize },
    PipeIn { buf: PipeBuffer, pos: usize },
}

pub(crate) struct CopyState<'a> {
    node: &'a NumaNode,
    req: Option<ReqRef>,
    user: UserBuf<'a>,
    seg: Segment<'a>,
    /// Bytes left in `seg`.
    len: usize,
    /// Whole gifted pages may replace the request's pages.
    pub(crate) move_pages: bool,
    cache: Option<Arc<dyn InodeCache>>,
}

impl<'a> CopyState<'a> {
    pub(crate) fn new(node: &'a NumaNode, user: UserBuf<'a>) -> Self {
        Self {
            node,
            req: None,
            user,
            seg: Segment::None,
            len: 0,
            move_pages: false,
            cache: None,
        }
    }

    /// Attach the request whose lock brackets each segment.
    pub(crate) fn set_request(&mut self, req: Option<ReqRef>) {
        self.req = req;
    }

    /// Page cache that stolen pages are installed into.
    pub(crate) fn set_cache(&mut self, cache: Option<Arc<dyn InodeCache>>) {
        self.cache = cache;
    }

    fn lock_request(&self) -> Result<(), Errno> {
        match &self.req {
            Some(req) => self.node.lock_request(req),
            None => Ok(()),
        }
    }

    fn unlock_request(&self) {
        if let Some(req) = &self.req {
            self.node.unlock_request(req);
        }
    }

    /// Release the current segment.
    pub(crate) fn finish(&mut self) {
        if let Segment::PipeOut { page, filled } = mem::replace(&mut self.seg, Segment::None) {
            if let UserBuf::PipeOut { bufs, .. } = &mut self.user {
                bufs.push(PipeBuffer::new(page, 0, filled, PipeBufFlags::empty()));
            }
        }
        self.len = 0;
    }

    /// Move on to the next segment of the daemon's buffer.
    fn fill(&mut self) -> Result<(), Errno> {
        self.unlock_request();
        self.finish();
        let psize = page_size();
        match &mut self.user {
            UserBuf::Read(segs) => {
                let seg = next_nonempty(segs).ok_or(Errno::EFAULT)?;
                let n = (psize - seg.as_ptr() as usize % psize).min(seg.len());
                let (chunk, rest) = seg.split_at_mut(n);
                if !rest.is_empty() {
                    segs.push_front(rest);
                }
                self.len = chunk.len();
                self.seg = Segment::Out(chunk);
            }
            UserBuf::Write(segs) => {
                let seg = loop {
                    match segs.pop_front() {
                        Some(seg) if seg.is_empty() => continue,
                        Some(seg) => break seg,
                        None => return Err(Errno::EFAULT),
                    }
                };
                let n = (psize - seg.as_ptr() as usize % psize).min(seg.len());
                let (chunk, rest) = seg.split_at(n);
                if !rest.is_empty() {
                    segs.push_front(rest);
                }
                self.len = chunk.len();
                self.seg = Segment::In(chunk);
            }
            UserBuf::PipeOut { bufs, capacity } => {
                if bufs.len() == *capacity {
                    return Err(Errno::EIO);
                }
                self.len = psize;
                self.seg = Segment::PipeOut {
                    page: Page::new().into_ref(),
                    filled: 0,
                };
            }
            UserBuf::PipeIn(bufs) => {
                let buf = bufs.pop_front().ok_or(Errno::EFAULT)?;
                buf.confirm()?;
                self.len = buf.len();
                self.seg = Segment::PipeIn { buf, pos: 0 };
            }
        }
        trace!("copy segment of {} bytes", self.len);
        self.lock_request()
    }

    /// Copy as much of `src` as the current segment takes. Returns the bytes copied.
    fn copy_do_out(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.len);
        match &mut self.seg {
            Segment::Out(dst) => {
                let (head, tail) = mem::take(dst).split_at_mut(n);
                head.copy_from_slice(&src[..n]);
                *dst = tail;
            }
            Segment::PipeOut { page, filled } => {
                page.lock().data_mut()[*filled..*filled + n].copy_from_slice(&src[..n]);
                *filled += n;
            }
            _ => return 0,
        }
        self.len -= n;
        n
    }

    /// Fill as much of `dst` as the current segment holds. Returns the bytes copied.
    fn copy_do_in(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        match &mut self.seg {
            Segment::In(src) => {
                dst[..n].copy_from_slice(&src[..n]);
                *src = &src[n..];
            }
            Segment::PipeIn { buf, pos } => {
                let start = buf.offset() + *pos;
                dst[..n].copy_from_slice(&buf.page().lock().data()[start..start + n]);
                *pos += n;
            }
            _ => return 0,
        }
        self.len -= n;
        n
    }

    /// Copy `src` to the daemon.
    pub(crate) fn copy_one_out(&mut self, mut src: &[u8]) -> Result<(), Errno> {
        while !src.is_empty() {
            if self.len == 0 {
                self.fill()?;
            }
            let n = self.copy_do_out(src);
            src = &src[n..];
        }
        Ok(())
    }

    /// Fill `dst` from the daemon.
    pub(crate) fn copy_one_in(&mut self, dst: &mut [u8]) -> Result<(), Errno> {
        let mut done = 0;
        while done < dst.len() {
            if self.len == 0 {
                self.fill()?;
            }
            done += self.copy_do_in(&mut dst[done..]);
        }
        Ok(())
    }

    /// Share `count` bytes of `page` with the pipe instead of copying them.
    fn ref_page(&mut self, page: &PageRef, offset: usize, count: usize) -> Result<(), Errno> {
        let full = match &self.user {
            UserBuf::PipeOut { bufs, capacity } => {
                let current = usize::from(matches!(self.seg, Segment::PipeOut { .. }));
                bufs.len() + current >= *capacity
            }
            _ => return Err(Errno::EFAULT),
        };
        if full {
            return Err(Errno::EIO);
        }
        self.unlock_request();
        self.finish();
        if let UserBuf::PipeOut { bufs, .. } = &mut self.user {
            bufs.push(PipeBuffer::new(
                page.clone(),
                offset,
                count,
                PipeBufFlags::empty(),
            ));
        }
        Ok(())
    }

    /// Try to take over the next pipe page in place of `*slot`. `Ok(true)` when the page
    /// was moved; `Ok(false)` when the caller has to copy from the current segment.
    fn try_move_page(&mut self, slot: &mut PageRef) -> Result<bool, Errno> {
        self.unlock_request();
        self.finish();
        let UserBuf::PipeIn(bufs) = &mut self.user else {
            return Err(Errno::EFAULT);
        };
        let buf = bufs.pop_front().ok_or(Errno::EFAULT)?;
        buf.confirm()?;

        let whole = buf.len() == page_size() && buf.offset() == 0;
        if !whole || !buf.can_steal() {
            return self.move_fallback(buf);
        }
        if !buf.page().lock().is_stealable() {
            warn!("refusing to steal a page with flags {:?}", buf.page().lock().flags());
            return self.move_fallback(buf);
        }
        if !slot.lock().is_replaceable() {
            warn!("request page can't be replaced: {:?}", slot.lock());
            return self.move_fallback(buf);
        }

        let newpage = buf.page;
        {
            let mut page = newpage.lock();
            page.set_flags(PageFlags::UPTODATE, true);
            page.set_flags(PageFlags::LOCKED, false);
        }
        let mapping = slot.lock().mapping();
        if let (Some(at), Some(cache)) = (mapping, &self.cache) {
            cache.replace_page(at, newpage.clone())?;
        }

        if let Some(req) = &self.req {
            let _st = self.node.lock();
            if req.status.lock().aborted {
                return Err(Errno::ENOENT);
            }
            *slot = newpage;
        } else {
            *slot = newpage;
        }
        trace!("moved page into request");
        Ok(true)
    }

    fn move_fallback(&mut self, buf: PipeBuffer) -> Result<bool, Errno> {
        self.len = buf.len();
        self.seg = Segment::PipeIn { buf, pos: 0 };
        self.lock_request()?;
        Ok(false)
    }

    /// Copy `count` bytes at `offset` of one page. With page moving enabled a whole page
    /// may be replaced in `slot` instead.
    pub(crate) fn copy_page(
        &mut self,
        slot: &mut PageRef,
        mut offset: usize,
        mut count: usize,
        zeroing: bool,
    ) -> Result<(), Errno> {
        let psize = page_size();
        if zeroing && count < psize {
            slot.lock().data_mut().fill(0);
        }
        let to_user = self.user.to_user();
        while count > 0 {
            if to_user && matches!(self.user, UserBuf::PipeOut { .. }) {
                return self.ref_page(slot, offset, count);
            }
            if self.len == 0 {
                if self.move_pages && offset == 0 && count == psize {
                    if self.try_move_page(slot)? {
                        return Ok(());
                    }
                } else {
                    self.fill()?;
                }
            }
            let n = count.min(self.len);
            let done = if to_user {
                let chunk = slot.lock().data()[offset..offset + n].to_vec();
                self.copy_do_out(&chunk)
            } else {
                let mut chunk = vec![0; n];
                let done = self.copy_do_in(&mut chunk);
                slot.lock().data_mut()[offset..offset + done].copy_from_slice(&chunk[..done]);
                done
            };
            offset += done;
            count -= done;
        }
        Ok(())
    }

    /// Copy `nbytes` of the request's page list, starting `page_offset` into the first page.
    fn copy_pages(
        &mut self,
        pages: &mut [PageRef],
        page_offset: usize,
        mut nbytes: usize,
        zeroing: bool,
    ) -> Result<(), Errno> {
        let psize = page_size();
        let mut offset = page_offset;
        let mut count = nbytes.min(psize.saturating_sub(offset));
        for slot in pages.iter_mut() {
            if nbytes == 0 && !zeroing {
                break;
            }
            self.copy_page(slot, offset, count, zeroing)?;
            nbytes -= count;
            count = nbytes.min(psize);
            offset = 0;
        }
        if nbytes > 0 {
            return Err(Errno::EFAULT);
        }
        Ok(())
    }

    /// Copy the request's input arguments to the daemon.
    pub(crate) fn copy_in_args(
        &mut self,
        args: &ArgList,
        pages: &mut [PageRef],
        page_offset: usize,
    ) -> Result<(), Errno> {
        let last = args.args.len().saturating_sub(1);
        for (i, arg) in args.args.iter().enumerate() {
            if i == last && args.argpages {
                self.copy_pages(pages, page_offset, arg.size, false)?;
            } else {
                self.copy_one_out(&arg.value[..arg.size])?;
            }
        }
        Ok(())
    }

    /// Fill the request's output arguments from the daemon.
    pub(crate) fn copy_out_args(
        &mut self,
        args: &mut ArgList,
        pages: &mut [PageRef],
        page_offset: usize,
        zeroing: bool,
    ) -> Result<(), Errno> {
        let last = args.args.len().saturating_sub(1);
        let argpages = args.argpages;
        for (i, arg) in args.args.iter_mut().enumerate() {
            if i == last && argpages {
                self.copy_pages(pages, page_offset, arg.size, zeroing)?;
            } else {
                let size = arg.size;
                self.copy_one_in(&mut arg.value[..size])?;
            }
        }
        Ok(())
    }

    /// Finish the transfer and return the pages destined for a pipe.
    pub(crate) fn into_pipe_bufs(mut self) -> Vec<PipeBuffer> {
        self.finish();
        match mem::replace(&mut self.user, UserBuf::Write(VecDeque::new())) {
            UserBuf::PipeOut { bufs, .. } => bufs,
            _ => Vec::new(),
        }
    }
}

fn next_nonempty<'a>(segs: &mut VecDeque<&'a mut [u8]>) -> Option<&'a mut [u8]> {
    loop {
        let seg = segs.pop_front()?;
        if !seg.is_empty() {
            return Some(seg);
        }
    }
}
