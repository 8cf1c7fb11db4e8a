//! The device a daemon talks to: requests go out through reads, replies and
//! notifications come back through writes.
//!
//! Every read returns exactly one complete message, every write must carry exactly one.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::io::IoSliceMut;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;
use log::trace;
use log::warn;
use parking_lot::MutexGuard;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

use crate::abort;
use crate::connection::Connection;
use crate::copy::CopyState;
use crate::copy::UserBuf;
use crate::ll::Errno;
use crate::ll::fuse_abi as abi;
use crate::ll::fuse_abi::fuse_opcode;
use crate::node::NodeState;
use crate::node::NumaNode;
use crate::node::ReqRef;
use crate::notify;
use crate::page::Pipe;
use crate::page::SpliceFlags;
use crate::poll_events::PollEvents;
use crate::request::ListKind;
use crate::request::RequestBody;
use crate::request::RequestState;
use crate::task::SigSet;
use crate::task::Task;

const IN_HEADER_SIZE: usize = size_of::<abi::fuse_in_header>();
const OUT_HEADER_SIZE: usize = size_of::<abi::fuse_out_header>();

/// A daemon's handle on a [`Connection`].
#[derive(Debug)]
pub struct Channel {
    conn: Arc<Connection>,
    nonblocking: AtomicBool,
}

impl Channel {
    /// Open the device end of `conn`.
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            nonblocking: AtomicBool::new(false),
        }
    }

    /// The connection served.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Make reads fail with `EAGAIN` instead of waiting for work.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::SeqCst);
    }

    /// Read one message into `buf`. Returns its length.
    ///
    /// Waits for work unless the channel is nonblocking. Interrupts go first, then queued
    /// forgets, then pending requests. A request that does not fit is failed (`E2BIG` for
    /// `SETXATTR`, `EIO` otherwise) and the read moves on to the next message; `Ok(0)`
    /// means nothing else was queued.
    pub fn read(&self, task: &Task, buf: &mut [u8]) -> Result<usize, Errno> {
        let nbytes = buf.len();
        let node = self.conn.node_for(task.numa_id());
        let mut cs = CopyState::new(node, UserBuf::Read(VecDeque::from([buf])));
        self.do_read(node, task, &mut cs, nbytes, self.is_nonblocking())
    }

    /// Vectored [`Channel::read`].
    pub fn readv(&self, task: &Task, bufs: &mut [IoSliceMut<'_>]) -> Result<usize, Errno> {
        let nbytes = bufs.iter().map(|b| b.len()).sum();
        let node = self.conn.node_for(task.numa_id());
        let segs = bufs.iter_mut().map(|b| &mut **b).collect();
        let mut cs = CopyState::new(node, UserBuf::Read(segs));
        self.do_read(node, task, &mut cs, nbytes, self.is_nonblocking())
    }

    /// Read one message of at most `len` bytes into `pipe`. Page-backed arguments are
    /// shared with the pipe rather than copied.
    pub fn splice_read(
        &self,
        task: &Task,
        pipe: &mut Pipe,
        len: usize,
        flags: SpliceFlags,
    ) -> Result<usize, Errno> {
        let node = self.conn.node_for(task.numa_id());
        let mut cs = CopyState::new(
            node,
            UserBuf::PipeOut {
                bufs: Vec::new(),
                capacity: pipe.capacity(),
            },
        );
        let nonblocking = self.is_nonblocking() || flags.contains(SpliceFlags::NONBLOCK);
        self.do_read(node, task, &mut cs, len, nonblocking)?;
        let bufs = cs.into_pipe_bufs();
        if !pipe.has_readers() {
            return Err(Errno::EPIPE);
        }
        if pipe.free_slots() < bufs.len() {
            return Err(Errno::EIO);
        }
        let bytes = bufs.iter().map(|b| b.len()).sum();
        pipe.extend(bufs);
        Ok(bytes)
    }

    /// Deliver one reply or notification. `buf` must hold exactly one message.
    pub fn write(&self, task: &Task, buf: &[u8]) -> Result<usize, Errno> {
        let node = self.conn.node_for(task.numa_id());
        let mut cs = CopyState::new(node, UserBuf::Write(VecDeque::from([buf])));
        self.do_write(node, task, &mut cs, buf.len())
    }

    /// Vectored [`Channel::write`].
    pub fn writev(&self, task: &Task, bufs: &[IoSlice<'_>]) -> Result<usize, Errno> {
        let nbytes = bufs.iter().map(|b| b.len()).sum();
        let node = self.conn.node_for(task.numa_id());
        let segs = bufs.iter().map(|b| &**b).collect();
        let mut cs = CopyState::new(node, UserBuf::Write(segs));
        self.do_write(node, task, &mut cs, nbytes)
    }

    /// Deliver one message of `len` bytes taken from `pipe`. With [`SpliceFlags::MOVE`],
    /// whole gifted pages may be moved into the request instead of copied.
    pub fn splice_write(
        &self,
        task: &Task,
        pipe: &mut Pipe,
        len: usize,
        flags: SpliceFlags,
    ) -> Result<usize, Errno> {
        let bufs = pipe.take(len)?;
        let node = self.conn.node_for(task.numa_id());
        let mut cs = CopyState::new(node, UserBuf::PipeIn(bufs.into()));
        cs.move_pages = flags.contains(SpliceFlags::MOVE);
        self.do_write(node, task, &mut cs, len)
    }

    /// Current readiness.
    pub fn poll(&self) -> PollEvents {
        self.conn.poll_mask()
    }

    /// Wait until readable or disconnected, at most `timeout`.
    pub fn poll_wait(&self, timeout: Option<Duration>) -> PollEvents {
        self.conn.poll_wait(timeout)
    }

    /// The daemon closed the device: disconnect and fail all queued work.
    pub fn release(&self) {
        abort::release(&self.conn);
    }

    fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::SeqCst)
    }

    fn do_read(
        &self,
        node: &Arc<NumaNode>,
        task: &Task,
        cs: &mut CopyState<'_>,
        nbytes: usize,
        nonblocking: bool,
    ) -> Result<usize, Errno> {
        let conn = &*self.conn;
        let mut restarted = false;
        loop {
            let mut st = node.lock();
            if restarted && !st.request_pending() {
                return Ok(0);
            }
            if nonblocking && conn.connected() && !st.request_pending() {
                return Err(Errno::EAGAIN);
            }
            task.wait_until(
                &node.waitq,
                &mut st,
                SigSet::ANY,
                node.reader_waker(),
                |st| !conn.connected() || st.request_pending(),
            );
            if !conn.connected() {
                return Err(Errno::ENODEV);
            }
            if !st.request_pending() {
                return Err(Errno::EINTR);
            }

            if let Some(req) = st.interrupts.pop_front() {
                return self.read_interrupt(node, st, cs, nbytes, &req);
            }
            if st.prefer_forget() {
                return self.read_forget(st, cs, nbytes);
            }

            let Some(req) = st.pending.front().cloned() else {
                continue;
            };
            let mut status = req.status.lock();
            status.state = RequestState::Reading;
            st.link(&req, &mut status, ListKind::Io);
            let reqsize = status.in_len;
            if nbytes < reqsize {
                let setxattr = status.opcode == fuse_opcode::FUSE_SETXATTR as u32;
                debug!(
                    "request {} needs {reqsize} bytes, reader offered {nbytes}",
                    req.unique()
                );
                status.error = Some(if setxattr { Errno::E2BIG } else { Errno::EIO });
                drop(status);
                node.request_end(conn, st, &req);
                restarted = true;
                continue;
            }
            drop(status);
            drop(st);
            return self.read_request(node, cs, &req, reqsize);
        }
    }

    /// Copy a request taken off `pending` to the daemon.
    fn read_request(
        &self,
        node: &Arc<NumaNode>,
        cs: &mut CopyState<'_>,
        req: &ReqRef,
        reqsize: usize,
    ) -> Result<usize, Errno> {
        let conn = &*self.conn;
        cs.set_request(Some(req.clone()));
        let res = {
            let mut body = req.body.lock();
            let header = in_header(&body, req.unique(), reqsize);
            let RequestBody {
                in_args,
                pages,
                page_offset,
                ..
            } = &mut *body;
            cs.copy_one_out(header.as_bytes())
                .and_then(|()| cs.copy_in_args(in_args, pages, *page_offset))
        };
        cs.finish();
        cs.set_request(None);

        let st = node.lock();
        let mut status = req.status.lock();
        status.locked = false;
        if status.aborted {
            drop(status);
            node.request_end(conn, st, req);
            return Err(Errno::ENODEV);
        }
        if let Err(err) = res {
            status.error = Some(Errno::EIO);
            drop(status);
            node.request_end(conn, st, req);
            return Err(err);
        }
        if !conn.connected() {
            status.error = Some(Errno::ECONNABORTED);
            drop(status);
            node.request_end(conn, st, req);
            return Err(Errno::ENODEV);
        }
        debug!(
            "delivered request {} (opcode {}, {reqsize} bytes)",
            req.unique(),
            status.opcode
        );
        if !status.isreply {
            drop(status);
            node.request_end(conn, st, req);
        } else {
            let mut st = st;
            status.state = RequestState::Sent;
            st.link(req, &mut status, ListKind::Processing);
            conn.index(req.unique(), node.id);
            if status.interrupted {
                node.queue_interrupt(conn, &mut st, req, &mut status);
            }
        }
        Ok(reqsize)
    }

    /// Deliver the interrupt of `req`. The message is built under the queue lock, with a
    /// fresh unique, so it always names the request that was queued.
    fn read_interrupt(
        &self,
        node: &NumaNode,
        st: MutexGuard<'_, NodeState>,
        cs: &mut CopyState<'_>,
        nbytes: usize,
        req: &ReqRef,
    ) -> Result<usize, Errno> {
        let conn = &*self.conn;
        let reqsize = IN_HEADER_SIZE + size_of::<abi::fuse_interrupt_in>();
        let (header, arg) = {
            let mut status = req.status.lock();
            status.intr_queued = false;
            let intr_unique = conn.next_unique();
            let old = std::mem::replace(&mut status.intr_unique, intr_unique);
            if old != 0 {
                conn.unindex(old);
            }
            conn.index(intr_unique, node.id);
            let header = abi::fuse_in_header {
                len: reqsize as u32,
                opcode: fuse_opcode::FUSE_INTERRUPT as u32,
                unique: intr_unique,
                ..Default::default()
            };
            let arg = abi::fuse_interrupt_in {
                unique: req.unique(),
            };
            (header, arg)
        };
        drop(st);
        if nbytes < reqsize {
            return Err(Errno::EINVAL);
        }
        debug!(
            "delivering interrupt {} for request {}",
            header.unique, arg.unique
        );
        cs.copy_one_out(header.as_bytes())?;
        cs.copy_one_out(arg.as_bytes())?;
        cs.finish();
        Ok(reqsize)
    }

    fn read_forget(
        &self,
        st: MutexGuard<'_, NodeState>,
        cs: &mut CopyState<'_>,
        nbytes: usize,
    ) -> Result<usize, Errno> {
        if self.conn.proto_minor() < abi::FUSE_BATCH_FORGET_MINOR || st.forgets.len() == 1 {
            self.read_single_forget(st, cs, nbytes)
        } else {
            self.read_batch_forget(st, cs, nbytes)
        }
    }

    fn read_single_forget(
        &self,
        mut st: MutexGuard<'_, NodeState>,
        cs: &mut CopyState<'_>,
        nbytes: usize,
    ) -> Result<usize, Errno> {
        let Some(forget) = st.forgets.pop_front() else {
            return Err(Errno::ENOENT);
        };
        drop(st);
        let arg = abi::fuse_forget_in {
            nlookup: forget.nlookup(),
        };
        let header = abi::fuse_in_header {
            len: (IN_HEADER_SIZE + size_of::<abi::fuse_forget_in>()) as u32,
            opcode: fuse_opcode::FUSE_FORGET as u32,
            unique: self.conn.next_unique(),
            nodeid: forget.nodeid(),
            ..Default::default()
        };
        if nbytes < header.len as usize {
            return Err(Errno::EINVAL);
        }
        trace!("delivering forget of {}", forget.nodeid());
        cs.copy_one_out(header.as_bytes())?;
        cs.copy_one_out(arg.as_bytes())?;
        cs.finish();
        Ok(header.len as usize)
    }

    fn read_batch_forget(
        &self,
        mut st: MutexGuard<'_, NodeState>,
        cs: &mut CopyState<'_>,
        nbytes: usize,
    ) -> Result<usize, Errno> {
        let fixed = IN_HEADER_SIZE + size_of::<abi::fuse_batch_forget_in>();
        if nbytes < fixed {
            return Err(Errno::EINVAL);
        }
        let max = (nbytes - fixed) / size_of::<abi::fuse_forget_one>();
        let forgets = st.dequeue_forgets(max);
        drop(st);

        let len = fixed + forgets.len() * size_of::<abi::fuse_forget_one>();
        let header = abi::fuse_in_header {
            len: len as u32,
            opcode: fuse_opcode::FUSE_BATCH_FORGET as u32,
            unique: self.conn.next_unique(),
            ..Default::default()
        };
        let arg = abi::fuse_batch_forget_in {
            count: forgets.len() as u32,
            dummy: 0,
        };
        trace!("delivering batch of {} forgets", forgets.len());
        cs.copy_one_out(header.as_bytes())?;
        cs.copy_one_out(arg.as_bytes())?;
        for forget in &forgets {
            cs.copy_one_out(forget.as_bytes())?;
        }
        cs.finish();
        Ok(len)
    }

    fn do_write(
        &self,
        local: &Arc<NumaNode>,
        task: &Task,
        cs: &mut CopyState<'_>,
        nbytes: usize,
    ) -> Result<usize, Errno> {
        let conn = &*self.conn;
        if nbytes < OUT_HEADER_SIZE {
            return Err(Errno::EINVAL);
        }
        let mut oh = abi::fuse_out_header::new_zeroed();
        cs.copy_one_in(oh.as_mut_bytes())?;
        if oh.len as usize != nbytes {
            warn!("reply header claims {} bytes, {nbytes} written", oh.len);
            return Err(Errno::EINVAL);
        }

        // Unique zero: unsolicited notification, the error field carries the code.
        if oh.unique == 0 {
            notify::dispatch(conn, oh.error, nbytes - OUT_HEADER_SIZE, cs, task)?;
            return Ok(nbytes);
        }

        if oh.error <= -abi::FUSE_MAX_ERRNO || oh.error > 0 {
            warn!("reply to {} carries bad error {}", oh.unique, oh.error);
            return Err(Errno::EINVAL);
        }

        let (node, mut st, req) = self.find_request(local, oh.unique)?;
        let mut status = req.status.lock();
        if status.aborted {
            return Err(Errno::ENOENT);
        }

        if status.intr_unique == oh.unique {
            if nbytes != OUT_HEADER_SIZE {
                return Err(Errno::EINVAL);
            }
            if oh.error == -libc::ENOSYS {
                debug!("daemon does not support interrupts");
                conn.set_no_interrupt();
            } else if oh.error == -libc::EAGAIN {
                node.queue_interrupt(conn, &mut st, &req, &mut status);
            }
            return Ok(nbytes);
        }

        st.link(&req, &mut status, ListKind::Io);
        status.locked = true;
        drop(status);
        drop(st);
        debug!("reply to {} ({nbytes} bytes, error {})", oh.unique, oh.error);

        cs.set_request(Some(req.clone()));
        cs.set_cache(conn.inode_cache());
        let res = {
            let mut body = req.body.lock();
            if !body.page_replace {
                cs.move_pages = false;
            }
            copy_out_args(cs, &mut body, nbytes, oh.error)
        };
        cs.finish();
        cs.set_request(None);

        let st = node.lock();
        let mut status = req.status.lock();
        status.locked = false;
        let res = match res {
            Ok(()) if status.aborted => Err(Errno::ENOENT),
            Ok(()) => {
                status.error = Errno::from_wire(oh.error).err();
                Ok(nbytes)
            }
            Err(err) => {
                if !status.aborted {
                    status.error = Some(Errno::EIO);
                }
                Err(err)
            }
        };
        drop(status);
        node.request_end(conn, st, &req);
        res
    }

    /// Find the request awaiting reply `unique`, on the writer's own queue first.
    fn find_request<'a>(
        &'a self,
        local: &'a Arc<NumaNode>,
        unique: u64,
    ) -> Result<(&'a Arc<NumaNode>, MutexGuard<'a, NodeState>, ReqRef), Errno> {
        let st = local.lock();
        if !self.conn.connected() {
            return Err(Errno::ENOENT);
        }
        if let Some(req) = st.find_processing(unique) {
            return Ok((local, st, req));
        }
        drop(st);
        // The replying thread may run on another node than the one that read the request.
        if let Some(id) = self.conn.lookup_index(unique) {
            let node = self.conn.node(id);
            let st = node.lock();
            if let Some(req) = st.find_processing(unique) {
                return Ok((node, st, req));
            }
        }
        warn!("reply to unknown request {unique}");
        Err(Errno::ENOENT)
    }
}

fn in_header(body: &RequestBody, unique: u64, len: usize) -> abi::fuse_in_header {
    abi::fuse_in_header {
        len: len as u32,
        opcode: body.opcode,
        unique,
        nodeid: body.nodeid,
        uid: body.uid,
        gid: body.gid,
        pid: body.pid,
        padding: 0,
    }
}

/// Check the reply size against the declared output arguments and copy them in. The
/// last argument may come back short when the request allows it.
fn copy_out_args(
    cs: &mut CopyState<'_>,
    body: &mut RequestBody,
    nbytes: usize,
    error: i32,
) -> Result<(), Errno> {
    if error != 0 {
        return if nbytes == OUT_HEADER_SIZE {
            Ok(())
        } else {
            Err(Errno::EINVAL)
        };
    }
    let reqsize = OUT_HEADER_SIZE + body.out_args.total();
    if reqsize < nbytes || (reqsize > nbytes && !body.out_argvar) {
        return Err(Errno::EINVAL);
    }
    if reqsize > nbytes {
        let diff = reqsize - nbytes;
        let last = body.out_args.args.last_mut().ok_or(Errno::EINVAL)?;
        if diff > last.size {
            return Err(Errno::EINVAL);
        }
        last.size -= diff;
    }
    let RequestBody {
        out_args,
        pages,
        page_offset,
        page_zeroing,
        ..
    } = body;
    cs.copy_out_args(out_args, pages, *page_offset, *page_zeroing)
}
