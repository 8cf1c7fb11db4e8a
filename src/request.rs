//! One in-flight filesystem operation.
//!
//! A [`Request`] is created by a caller through [`Connection::acquire_or_block`] or
//! [`Connection::acquire_nofail`], filled in through [`Request::body`], and submitted. Its
//! bookkeeping lives in three places with a fixed lock order, body before node queue
//! before status:
//!
//! * the body (header fields, argument lists, page list) behind its own lock, held by
//!   whoever fills it in or copies it across the transport;
//! * the status (state, flags, error, completion callback), only ever changed with the
//!   owning node's queue lock held; waiters read it under its own lock;
//! * an explicit reference count. When it drops to zero a request borrowed from a file's
//!   reserved slot goes back to that slot instead of being freed.
//!
//! [`Connection::acquire_or_block`]: crate::Connection::acquire_or_block
//! [`Connection::acquire_nofail`]: crate::Connection::acquire_nofail

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use smallvec::SmallVec;

use crate::connection::Connection;
use crate::ll::Errno;
use crate::ll::fuse_abi as abi;
use crate::ll::fuse_abi::fuse_opcode;
use crate::page::PageRef;
use crate::task::Task;
use crate::task::Waker;

/// Completion callback of a background request. Runs after the request is finished,
/// without any transport lock held.
pub type EndFn = Box<dyn FnOnce(&Request) + Send>;

/// Position of a request in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Allocated, being filled in by the caller.
    Init,
    /// Queued, waiting for a daemon read.
    Pending,
    /// Being copied to the daemon.
    Reading,
    /// Delivered, waiting for the reply.
    Sent,
    /// Done; the result is final.
    Finished,
}

/// Which node list currently holds a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListKind {
    Background,
    Pending,
    Io,
    Processing,
}

/// Where the request's storage came from, and where it goes back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Allocated,
    Reserved { file: u64 },
}

/// One argument. For the page-backed trailing argument `value` is empty and the bytes
/// live in the request's page list.
#[derive(Debug, Default, Clone)]
pub(crate) struct Arg {
    pub(crate) size: usize,
    pub(crate) value: Vec<u8>,
}

/// An input or output argument list.
#[derive(Debug, Default)]
pub(crate) struct ArgList {
    pub(crate) args: SmallVec<[Arg; 3]>,
    /// The last argument is backed by pages.
    pub(crate) argpages: bool,
}

impl ArgList {
    pub(crate) fn total(&self) -> usize {
        self.args.iter().map(|a| a.size).sum()
    }
}

/// Caller-filled part of a request: header fields, arguments and pages.
#[derive(Debug, Default)]
pub struct RequestBody {
    pub(crate) opcode: u32,
    pub(crate) nodeid: u64,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) pid: u32,
    pub(crate) in_args: ArgList,
    pub(crate) out_args: ArgList,
    /// The last output argument may be shorter than declared.
    pub(crate) out_argvar: bool,
    /// Zero page-backed output beyond what the daemon supplied.
    pub(crate) page_zeroing: bool,
    /// Output pages may be replaced by pages stolen from the daemon.
    pub(crate) page_replace: bool,
    pub(crate) pages: Vec<PageRef>,
    pub(crate) page_offset: usize,
}

impl RequestBody {
    fn for_task(task: &Task) -> Self {
        let (uid, gid, pid) = task.creds();
        Self {
            uid,
            gid,
            pid,
            ..Self::default()
        }
    }

    /// Set the operation.
    pub fn set_opcode(&mut self, opcode: fuse_opcode) {
        self.opcode = opcode as u32;
    }

    /// Set a raw operation code, including ones this crate has no name for.
    pub fn set_raw_opcode(&mut self, opcode: u32) {
        self.opcode = opcode;
    }

    /// Raw operation code.
    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    /// Set the target inode.
    pub fn set_nodeid(&mut self, nodeid: u64) {
        self.nodeid = nodeid;
    }

    /// Append an input argument.
    pub fn push_in_arg(&mut self, value: impl Into<Vec<u8>>) {
        let value = value.into();
        self.in_args.args.push(Arg {
            size: value.len(),
            value,
        });
    }

    /// Append a trailing input argument of `len` bytes taken from `pages`, starting
    /// `offset` bytes into the first page.
    pub fn set_in_pages(&mut self, pages: Vec<PageRef>, offset: usize, len: usize) {
        self.pages = pages;
        self.page_offset = offset;
        self.in_args.args.push(Arg {
            size: len,
            value: Vec::new(),
        });
        self.in_args.argpages = true;
    }

    /// Declare an output argument of `size` bytes.
    pub fn push_out_arg(&mut self, size: usize) {
        self.out_args.args.push(Arg {
            size,
            value: vec![0; size],
        });
    }

    /// Declare a trailing output argument of up to `len` bytes stored into `pages`.
    pub fn set_out_pages(&mut self, pages: Vec<PageRef>, offset: usize, len: usize) {
        self.pages = pages;
        self.page_offset = offset;
        self.out_args.args.push(Arg {
            size: len,
            value: Vec::new(),
        });
        self.out_args.argpages = true;
    }

    /// Allow the last output argument to come back shorter than declared.
    pub fn set_out_argvar(&mut self, argvar: bool) {
        self.out_argvar = argvar;
    }

    /// Zero the unfilled remainder of output pages.
    pub fn set_page_zeroing(&mut self, zeroing: bool) {
        self.page_zeroing = zeroing;
    }

    /// Let the transport swap output pages for pages gifted by the daemon.
    pub fn set_page_replace(&mut self, replace: bool) {
        self.page_replace = replace;
    }

    /// Output argument `index` as received, trimmed to its final size.
    pub fn out_arg(&self, index: usize) -> Option<&[u8]> {
        self.out_args
            .args
            .get(index)
            .map(|a| &a.value[..a.size.min(a.value.len())])
    }

    /// Final size of output argument `index`.
    pub fn out_arg_size(&self, index: usize) -> Option<usize> {
        self.out_args.args.get(index).map(|a| a.size)
    }

    /// The request's page list.
    pub fn pages(&self) -> &[PageRef] {
        &self.pages
    }

    /// Bytes the request occupies on the wire, header included.
    pub(crate) fn in_len(&self) -> usize {
        size_of::<abi::fuse_in_header>() + self.in_args.total()
    }
}

/// Lifecycle state and flags. Only modified with the owning node's lock held.
pub(crate) struct Status {
    pub(crate) state: RequestState,
    pub(crate) list: Option<ListKind>,
    pub(crate) isreply: bool,
    pub(crate) background: bool,
    pub(crate) aborted: bool,
    pub(crate) locked: bool,
    pub(crate) interrupted: bool,
    pub(crate) intr_queued: bool,
    pub(crate) force: bool,
    pub(crate) waiting: bool,
    pub(crate) intr_unique: u64,
    pub(crate) in_len: usize,
    pub(crate) opcode: u32,
    pub(crate) error: Option<Errno>,
    pub(crate) end: Option<EndFn>,
}

impl Status {
    fn new() -> Self {
        Self {
            state: RequestState::Init,
            list: None,
            isreply: false,
            background: false,
            aborted: false,
            locked: false,
            interrupted: false,
            intr_queued: false,
            force: false,
            waiting: false,
            intr_unique: 0,
            in_len: 0,
            opcode: 0,
            error: None,
            end: None,
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("state", &self.state)
            .field("list", &self.list)
            .field("isreply", &self.isreply)
            .field("background", &self.background)
            .field("aborted", &self.aborted)
            .field("locked", &self.locked)
            .field("interrupted", &self.interrupted)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

pub(crate) struct RequestInner {
    pub(crate) unique: AtomicU64,
    pub(crate) numa_id: AtomicUsize,
    refcount: AtomicUsize,
    pub(crate) origin: Origin,
    pub(crate) conn: Weak<Connection>,
    pub(crate) body: Mutex<RequestBody>,
    pub(crate) status: Mutex<Status>,
    pub(crate) waitq: Condvar,
}

impl fmt::Debug for RequestInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestInner")
            .field("unique", &self.unique())
            .finish_non_exhaustive()
    }
}

impl RequestInner {
    pub(crate) fn new(
        conn: Weak<Connection>,
        origin: Origin,
        unique: u64,
        numa_id: usize,
        task: &Task,
    ) -> Arc<Self> {
        Arc::new(Self {
            unique: AtomicU64::new(unique),
            numa_id: AtomicUsize::new(numa_id),
            refcount: AtomicUsize::new(1),
            origin,
            conn,
            body: Mutex::new(RequestBody::for_task(task)),
            status: Mutex::new(Status::new()),
            waitq: Condvar::new(),
        })
    }

    /// Bring a request that went back to its reserved slot into a fresh state.
    pub(crate) fn reinit(&self, unique: u64, numa_id: usize, task: &Task) {
        *self.body.lock() = RequestBody::for_task(task);
        *self.status.lock() = Status::new();
        self.unique.store(unique, Ordering::SeqCst);
        self.numa_id.store(numa_id, Ordering::SeqCst);
        self.refcount.store(1, Ordering::SeqCst);
    }

    pub(crate) fn unique(&self) -> u64 {
        self.unique.load(Ordering::SeqCst)
    }

    pub(crate) fn numa_id(&self) -> usize {
        self.numa_id.load(Ordering::SeqCst)
    }

    pub(crate) fn get(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::SeqCst);
        assert!(prev >= 1, "retain of a released request");
    }

    /// Drop one reference; `true` when it was the last one.
    pub(crate) fn put(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        assert!(prev >= 1, "release of a released request");
        prev == 1
    }

    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Callback for signal delivery to a task sleeping on this request.
    pub(crate) fn waker(self: &Arc<Self>) -> impl FnOnce() -> Waker {
        let req = self.clone();
        move || {
            Arc::new(move || {
                let _status = req.status.lock();
                req.waitq.notify_all();
            })
        }
    }

    /// Mark finished and wake everyone waiting on the request.
    pub(crate) fn finish(&self, status: &mut Status) {
        status.state = RequestState::Finished;
        self.waitq.notify_all();
    }
}

/// Handle to a request.
///
/// A handle stands for one reference. [`Request::retain`] takes another;
/// [`Request::release`] gives one back. Dropping a handle without releasing it leaves the
/// reference held.
pub struct Request {
    pub(crate) inner: Arc<RequestInner>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("unique", &self.unique())
            .field("numa_id", &self.numa_id())
            .field("status", &*self.inner.status.lock())
            .finish()
    }
}

impl Request {
    pub(crate) fn from_inner(inner: Arc<RequestInner>) -> Self {
        Self { inner }
    }

    /// Unique id; the key replies are matched by.
    pub fn unique(&self) -> u64 {
        self.inner.unique()
    }

    /// Affinity domain the request is queued on.
    pub fn numa_id(&self) -> usize {
        self.inner.numa_id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.inner.status.lock().state
    }

    /// Outcome: `Ok` unless the daemon or the transport reported an error.
    pub fn result(&self) -> Result<(), Errno> {
        match self.inner.status.lock().error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether the request was caught mid-copy by a connection abort.
    pub fn is_aborted(&self) -> bool {
        self.inner.status.lock().aborted
    }

    /// Whether the request was submitted in the background.
    pub fn is_background(&self) -> bool {
        self.inner.status.lock().background
    }

    /// Whether an interrupt has been requested for this request.
    pub fn is_interrupted(&self) -> bool {
        self.inner.status.lock().interrupted
    }

    /// Make a synchronous send wait for the reply even through fatal signals.
    pub fn set_force(&self, force: bool) {
        self.inner.status.lock().force = force;
    }

    /// Lock the body for filling in arguments or reading results.
    pub fn body(&self) -> MutexGuard<'_, RequestBody> {
        self.inner.body.lock()
    }

    /// Number of outstanding references.
    pub fn refcount(&self) -> usize {
        self.inner.refcount()
    }

    /// Take another reference.
    ///
    /// # Panics
    /// Panics if the request has already been released.
    pub fn retain(&self) -> Request {
        self.inner.get();
        Request {
            inner: self.inner.clone(),
        }
    }

    /// Give back this reference. The last release returns the storage to the allocator or
    /// to the reserved slot it came from.
    pub fn release(self) {
        match self.inner.conn.upgrade() {
            Some(conn) => conn.put_request(&self.inner),
            None => {
                self.inner.put();
            }
        }
    }
}
