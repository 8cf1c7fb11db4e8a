//! Per-mount transport state shared by all queues.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::trace;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use parking_lot::RwLock;
#[cfg(feature = "serializable")]
use serde::Deserialize;
#[cfg(feature = "serializable")]
use serde::Serialize;

use crate::cache::InodeCache;
use crate::forget_one::ForgetOne;
use crate::ll::Errno;
use crate::ll::fuse_abi as abi;
use crate::node::NodeState;
use crate::node::NumaNode;
use crate::node::ReqRef;
use crate::poll_events::PollEvents;
use crate::request::EndFn;
use crate::request::Origin;
use crate::request::Request;
use crate::request::RequestInner;
use crate::request::RequestState;
use crate::task::SigSet;
use crate::task::Task;

/// Upper bound on the number of affinity domains.
const MAX_NUMA_NODES: usize = 1024;

/// Configuration of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ConnectionConfig {
    /// Number of per-affinity queues. With more than one, requests are queued on the
    /// queue matching the calling task's affinity.
    pub numa_nodes: usize,
    /// Background requests allowed in flight per queue.
    pub max_background: usize,
    /// Outstanding background requests at which the connection reports congestion.
    pub congestion_threshold: usize,
    /// Negotiated protocol minor version.
    pub proto_minor: u32,
    /// Cap on simultaneously allocated requests. Allocation beyond it fails as if memory
    /// ran out.
    pub max_requests: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            numa_nodes: 1,
            max_background: abi::FUSE_DEFAULT_MAX_BACKGROUND,
            congestion_threshold: abi::FUSE_DEFAULT_CONGESTION_THRESHOLD,
            proto_minor: abi::FUSE_KERNEL_MINOR_VERSION,
            max_requests: None,
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of affinity domains
    pub fn numa_nodes(mut self, numa_nodes: usize) -> Self {
        self.numa_nodes = numa_nodes;
        self
    }

    /// Set the background request limit
    pub fn max_background(mut self, max_background: usize) -> Self {
        self.max_background = max_background;
        self
    }

    /// Set the congestion threshold. Values above the background limit are clamped to it
    /// when the connection is created.
    pub fn congestion_threshold(mut self, congestion_threshold: usize) -> Self {
        self.congestion_threshold = congestion_threshold;
        self
    }

    /// Set the negotiated protocol minor version
    pub fn proto_minor(mut self, proto_minor: u32) -> Self {
        self.proto_minor = proto_minor;
        self
    }

    /// Cap the number of allocated requests
    pub fn max_requests(mut self, max_requests: Option<usize>) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> io::Result<()> {
        if self.numa_nodes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "numa_nodes must be at least 1",
            ));
        }
        if self.numa_nodes > MAX_NUMA_NODES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("numa_nodes cannot exceed {MAX_NUMA_NODES}"),
            ));
        }
        if self.max_background == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "max_background must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Poll wakeup target registered under a daemon-chosen handle.
#[derive(Debug, Default)]
pub(crate) struct PollState {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl PollState {
    pub(crate) fn wake(&self) {
        *self.woken.lock() = true;
        self.cv.notify_all();
    }
}

/// State guarded by the connection-wide lock.
#[derive(Default)]
pub(crate) struct ConnShared {
    /// Reserved request of each open file; `None` while it is lent out.
    reserved: HashMap<u64, Option<ReqRef>>,
    next_file: u64,
    pub(crate) polled: BTreeMap<u64, Arc<PollState>>,
    fasync: Vec<mpsc::Sender<PollEvents>>,
}

/// One mounted filesystem's transport: the per-affinity queues plus everything they
/// share.
pub struct Connection {
    this: Weak<Connection>,
    nodes: Vec<Arc<NumaNode>>,
    connected: AtomicBool,
    conn_error: AtomicBool,
    no_interrupt: AtomicBool,
    congested: AtomicBool,
    proto_minor: AtomicU32,
    reqctr: AtomicU64,
    live_requests: AtomicUsize,
    max_requests: Option<usize>,
    /// Node holding each request awaiting a reply, keyed by main and interrupt unique.
    index: Mutex<HashMap<u64, usize>>,
    pub(crate) shared: Mutex<ConnShared>,
    reserved_waitq: Condvar,
    poll_waitq: Condvar,
    poll_seq: AtomicU64,
    cache: RwLock<Option<Arc<dyn InodeCache>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("nodes", &self.nodes.len())
            .field("connected", &self.connected())
            .field("no_interrupt", &self.no_interrupt())
            .field("congested", &self.is_congested())
            .field("proto_minor", &self.proto_minor())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connected transport.
    pub fn new(config: ConnectionConfig) -> io::Result<Arc<Self>> {
        config.validate()?;
        let congestion = config.congestion_threshold.min(config.max_background);
        debug!(
            "new connection: {} node(s), max_background {}, congestion_threshold {congestion}",
            config.numa_nodes, config.max_background
        );
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            nodes: (0..config.numa_nodes)
                .map(|id| Arc::new(NumaNode::new(id, config.max_background, congestion)))
                .collect(),
            connected: AtomicBool::new(true),
            conn_error: AtomicBool::new(false),
            no_interrupt: AtomicBool::new(false),
            congested: AtomicBool::new(false),
            proto_minor: AtomicU32::new(config.proto_minor),
            reqctr: AtomicU64::new(0),
            live_requests: AtomicUsize::new(0),
            max_requests: config.max_requests,
            index: Mutex::new(HashMap::new()),
            shared: Mutex::new(ConnShared::default()),
            reserved_waitq: Condvar::new(),
            poll_waitq: Condvar::new(),
            poll_seq: AtomicU64::new(0),
            cache: RwLock::new(None),
        }))
    }

    /// Whether the connection is still up. Once false it stays false.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Clear the connected flag; `true` for the caller that actually cleared it.
    pub(crate) fn disconnect(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    /// Whether the daemon turned out to not support interrupts.
    pub fn no_interrupt(&self) -> bool {
        self.no_interrupt.load(Ordering::SeqCst)
    }

    pub(crate) fn set_no_interrupt(&self) {
        self.no_interrupt.store(true, Ordering::SeqCst);
    }

    /// Whether background requests have reached the congestion threshold.
    pub fn is_congested(&self) -> bool {
        self.congested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_congested(&self, congested: bool) {
        self.congested.store(congested, Ordering::SeqCst);
    }

    /// Negotiated protocol minor version.
    pub fn proto_minor(&self) -> u32 {
        self.proto_minor.load(Ordering::SeqCst)
    }

    /// Record the protocol minor version negotiated with the daemon.
    pub fn set_proto_minor(&self, minor: u32) {
        self.proto_minor.store(minor, Ordering::SeqCst);
    }

    /// Mark connection setup as failed: synchronous requests are refused from now on.
    pub fn set_conn_error(&self) {
        self.conn_error.store(true, Ordering::SeqCst);
    }

    /// Change the background limit on every queue.
    pub fn set_max_background(&self, max_background: usize) {
        for node in &self.nodes {
            let mut st = node.lock();
            st.max_background = max_background;
            st.blocked = st.num_background >= max_background;
            if !st.blocked {
                node.blocked_waitq.notify_all();
            }
            node.flush_bg_queue(self, &mut st);
        }
    }

    /// Change the congestion threshold on every queue.
    pub fn set_congestion_threshold(&self, threshold: usize) {
        let mut congested = false;
        for node in &self.nodes {
            let mut st = node.lock();
            st.congestion_threshold = threshold;
            congested |= st.num_background >= threshold;
        }
        self.set_congested(congested);
    }

    /// Number of requests allocated or waiting for admission, over all queues.
    pub fn num_waiting(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.num_waiting.load(Ordering::SeqCst))
            .sum()
    }

    /// Install the page cache notifications operate on.
    pub fn attach_inode_cache(&self, cache: Arc<dyn InodeCache>) {
        *self.cache.write() = Some(cache);
    }

    pub(crate) fn inode_cache(&self) -> Option<Arc<dyn InodeCache>> {
        self.cache.read().clone()
    }

    /// Number of per-node queues.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn nodes(&self) -> &[Arc<NumaNode>] {
        &self.nodes
    }

    pub(crate) fn node(&self, id: usize) -> &Arc<NumaNode> {
        &self.nodes[id % self.nodes.len()]
    }

    /// Queue a task with affinity `numa_id` uses. Without per-affinity queues everything
    /// shares queue 0.
    pub(crate) fn node_for(&self, numa_id: usize) -> &Arc<NumaNode> {
        self.node(numa_id)
    }

    /// Next request id. Zero is reserved for notifications and is skipped on wraparound.
    pub(crate) fn next_unique(&self) -> u64 {
        loop {
            let id = self.reqctr.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    pub(crate) fn index(&self, unique: u64, node: usize) {
        self.index.lock().insert(unique, node);
    }

    pub(crate) fn unindex(&self, unique: u64) {
        self.index.lock().remove(&unique);
    }

    pub(crate) fn lookup_index(&self, unique: u64) -> Option<usize> {
        self.index.lock().get(&unique).copied()
    }

    fn alloc(&self, numa_id: usize, task: &Task) -> Result<ReqRef, Errno> {
        let live = self.live_requests.fetch_add(1, Ordering::SeqCst);
        if self.max_requests.is_some_and(|max| live >= max) {
            self.live_requests.fetch_sub(1, Ordering::SeqCst);
            return Err(Errno::ENOMEM);
        }
        Ok(RequestInner::new(
            self.this.clone(),
            Origin::Allocated,
            self.next_unique(),
            numa_id,
            task,
        ))
    }

    /// Wait until admission is open on `node`. `false` when a signal in `mask` arrived
    /// first.
    fn wait_unblocked(&self, node: &Arc<NumaNode>, task: &Task, mask: SigSet) -> bool {
        let mut st = node.lock();
        task.wait_until(
            &node.blocked_waitq,
            &mut st,
            mask,
            node.blocked_waker(),
            |st| !st.blocked,
        )
    }

    /// Get a request for a new operation, waiting while the caller's queue has too many
    /// background requests outstanding.
    ///
    /// Only a fatal signal interrupts the wait (`EINTR`). Fails with `ENOTCONN` once the
    /// connection is down and `ENOMEM` when no request can be allocated.
    pub fn acquire_or_block(&self, task: &Task) -> Result<Request, Errno> {
        let node = self.node_for(task.numa_id());
        node.num_waiting.fetch_add(1, Ordering::SeqCst);
        let res = if !self.wait_unblocked(node, task, SigSet::FATAL) {
            Err(Errno::EINTR)
        } else if !self.connected() {
            Err(Errno::ENOTCONN)
        } else {
            self.alloc(node.id, task)
        };
        match res {
            Ok(inner) => {
                inner.status.lock().waiting = true;
                Ok(Request::from_inner(inner))
            }
            Err(err) => {
                node.num_waiting.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Get a request that can't fail, for operations that must reach the daemon (such as
    /// a flush on close). When allocation fails, the file's reserved request is used,
    /// waiting for it if another thread has it.
    pub fn acquire_nofail(&self, file: &OpenFile, task: &Task) -> Request {
        let node = self.node_for(task.numa_id());
        node.num_waiting.fetch_add(1, Ordering::SeqCst);
        self.wait_unblocked(node, task, SigSet::NONE);
        let inner = match self.alloc(node.id, task) {
            Ok(inner) => inner,
            Err(_) => {
                debug!("allocation failed, using reserved request of file {}", file.fh);
                self.get_reserved(file.fh, node.id, task)
            }
        };
        inner.status.lock().waiting = true;
        Request::from_inner(inner)
    }

    fn get_reserved(&self, fh: u64, numa_id: usize, task: &Task) -> ReqRef {
        let mut shared = self.shared.lock();
        loop {
            if let Some(req) = shared.reserved.get_mut(&fh).and_then(Option::take) {
                drop(shared);
                req.reinit(self.next_unique(), numa_id, task);
                return req;
            }
            self.reserved_waitq.wait(&mut shared);
        }
    }

    fn put_reserved(&self, fh: u64, req: ReqRef) {
        let mut shared = self.shared.lock();
        // A closed file's slot is gone; the request is simply freed.
        if let Some(slot) = shared.reserved.get_mut(&fh) {
            assert!(slot.is_none(), "reserved slot of file {fh} already occupied");
            *slot = Some(req);
            self.reserved_waitq.notify_all();
        }
    }

    /// Drop one reference to `req`; the last one returns it to where it came from.
    pub(crate) fn put_request(&self, req: &ReqRef) {
        if !req.put() {
            return;
        }
        if req.status.lock().waiting {
            self.node(req.numa_id())
                .num_waiting
                .fetch_sub(1, Ordering::SeqCst);
        }
        match req.origin {
            Origin::Allocated => {
                self.live_requests.fetch_sub(1, Ordering::SeqCst);
            }
            Origin::Reserved { file } => self.put_reserved(file, req.clone()),
        }
    }

    /// Record the wire size and opcode of a request about to be queued.
    fn prepare(req: &ReqRef) -> (usize, u32) {
        let body = req.body.lock();
        (body.in_len(), body.opcode)
    }

    /// Send `req` and wait for the reply.
    ///
    /// The returned error is the daemon's reply error, or the transport's: `ENOTCONN`
    /// when disconnected, `ECONNREFUSED` after a failed setup, `EINTR` when a signal
    /// withdrew the request before the daemon saw it, `ECONNABORTED` on abort.
    pub fn submit_synchronous(&self, req: &Request, task: &Task) -> Result<(), Errno> {
        let inner = &req.inner;
        let (in_len, opcode) = Self::prepare(inner);
        let node = self.node(inner.numa_id());
        let mut st = node.lock();
        {
            let mut status = inner.status.lock();
            status.isreply = true;
            status.in_len = in_len;
            status.opcode = opcode;
            if !self.connected() {
                status.error = Some(Errno::ENOTCONN);
            } else if self.conn_error.load(Ordering::SeqCst) {
                status.error = Some(Errno::ECONNREFUSED);
            } else {
                node.queue_request(self, &mut st, inner, &mut status);
                // Still needed after request_end drops the queue's reference.
                inner.get();
                drop(status);
                st = self.wait_answer(node, st, inner, task);
            }
        }
        drop(st);
        req.result()
    }

    /// Sleep until `req` finishes or a signal in `mask` is pending. The queue lock is
    /// released for the duration.
    fn wait_finished<'a>(
        &self,
        node: &'a NumaNode,
        st: MutexGuard<'a, NodeState>,
        req: &ReqRef,
        task: &Task,
        mask: SigSet,
    ) -> MutexGuard<'a, NodeState> {
        if task.signal_pending(mask) {
            return st;
        }
        drop(st);
        {
            let mut status = req.status.lock();
            task.wait_until(&req.waitq, &mut status, mask, req.waker(), |s| {
                s.state == RequestState::Finished
            });
        }
        node.lock()
    }

    fn wait_answer<'a>(
        &self,
        node: &'a Arc<NumaNode>,
        mut st: MutexGuard<'a, NodeState>,
        req: &ReqRef,
        task: &Task,
    ) -> MutexGuard<'a, NodeState> {
        if !self.no_interrupt() {
            st = self.wait_finished(node, st, req, task, SigSet::ANY);
            let mut status = req.status.lock();
            if status.aborted {
                drop(status);
                return self.wait_unlocked(st, req);
            }
            if status.state == RequestState::Finished {
                return st;
            }
            status.interrupted = true;
            if status.state == RequestState::Sent {
                node.queue_interrupt(self, &mut st, req, &mut status);
            }
        }

        let force = req.status.lock().force;
        if !force {
            st = self.wait_finished(node, st, req, task, SigSet::FATAL);
            let mut status = req.status.lock();
            if status.aborted {
                drop(status);
                return self.wait_unlocked(st, req);
            }
            if status.state == RequestState::Finished {
                return st;
            }
            // Not yet seen by the daemon: withdraw it.
            if status.state == RequestState::Pending {
                debug!("request {} withdrawn by signal", req.unique());
                st.unlink(req, &mut status);
                status.error = Some(Errno::EINTR);
                req.finish(&mut status);
                req.put();
                return st;
            }
        }

        // Already with the daemon, or forced: wait it out.
        st = self.wait_finished(node, st, req, task, SigSet::NONE);
        if !req.status.lock().aborted {
            return st;
        }
        self.wait_unlocked(st, req)
    }

    /// An aborted request may still be mid-copy; its buffers stay in use until the
    /// copying thread unlocks it.
    fn wait_unlocked<'a>(
        &self,
        st: MutexGuard<'a, NodeState>,
        req: &ReqRef,
    ) -> MutexGuard<'a, NodeState> {
        let status = req.status.lock();
        debug_assert_eq!(status.state, RequestState::Finished);
        if !status.locked {
            drop(status);
            return st;
        }
        let node = MutexGuard::mutex(&st);
        drop(status);
        drop(st);
        let mut status = req.status.lock();
        while status.locked {
            req.waitq.wait(&mut status);
        }
        drop(status);
        node.lock()
    }

    /// Queue `req` without waiting for the reply. `end` runs once the request finishes;
    /// the request's reference passes to the queue.
    ///
    /// Background requests count against the queue's admission limit: at most
    /// `max_background` are handed to the daemon at a time, the rest are staged.
    pub fn submit_background(&self, req: Request, end: Option<EndFn>) {
        let inner = &req.inner;
        let (in_len, opcode) = Self::prepare(inner);
        let node = self.node(inner.numa_id());
        let mut st = node.lock();
        let mut status = inner.status.lock();
        status.isreply = true;
        status.in_len = in_len;
        status.opcode = opcode;
        status.end = end;
        if self.connected() {
            node.queue_background(self, &mut st, inner, &mut status);
            drop(status);
            node.flush_bg_queue(self, &mut st);
        } else {
            status.error = Some(Errno::ENOTCONN);
            drop(status);
            node.request_end(self, st, inner);
        }
    }

    /// Queue a no-reply request answering a daemon's retrieve, under the daemon-chosen
    /// `unique`. `end` runs once the request has been delivered. Fails with `ENODEV`
    /// when disconnected, in which case the request is ended right away.
    pub fn send_notify_reply(
        &self,
        req: Request,
        unique: u64,
        end: Option<EndFn>,
    ) -> Result<(), Errno> {
        let inner = &req.inner;
        let (in_len, opcode) = Self::prepare(inner);
        inner.unique.store(unique, Ordering::SeqCst);
        let node = self.node(inner.numa_id());
        let st = node.lock();
        let mut status = inner.status.lock();
        status.isreply = false;
        status.in_len = in_len;
        status.opcode = opcode;
        status.end = end;
        if self.connected() {
            let mut st = st;
            node.queue_request(self, &mut st, inner, &mut status);
            Ok(())
        } else {
            status.error = Some(Errno::ENODEV);
            drop(status);
            node.request_end(self, st, inner);
            Err(Errno::ENODEV)
        }
    }

    /// Tell the daemon that the kernel dropped `nlookup` references to `nodeid`.
    /// Forgets are never answered and are dropped when disconnected.
    pub fn queue_forget(&self, task: &Task, nodeid: u64, nlookup: u64) {
        let node = self.node_for(task.numa_id());
        let mut st = node.lock();
        if self.connected() {
            trace!("queue forget of {nodeid} ({nlookup}) on node {}", node.id);
            node.queue_forget(self, &mut st, ForgetOne::new(nodeid, nlookup));
        }
    }

    /// Open a file on the connection. Each open file owns one reserved request that
    /// [`Connection::acquire_nofail`] falls back on.
    pub fn open_file(&self) -> OpenFile {
        let mut shared = self.shared.lock();
        let fh = shared.next_file;
        shared.next_file += 1;
        let req = RequestInner::new(
            self.this.clone(),
            Origin::Reserved { file: fh },
            0,
            0,
            &Task::new(0),
        );
        // Parked in its slot, nobody holds it.
        req.put();
        shared.reserved.insert(fh, Some(req));
        OpenFile {
            conn: self.this.clone(),
            fh,
        }
    }

    /// Register for poll wakeups the daemon sends for handle `kh`.
    pub fn register_poll(&self, kh: u64) -> PollWaiter {
        let state = Arc::new(PollState::default());
        self.shared.lock().polled.insert(kh, state.clone());
        PollWaiter {
            conn: self.this.clone(),
            kh,
            state,
        }
    }

    /// Subscribe to asynchronous readiness events: one `POLLIN` each time work is queued
    /// and when the connection is aborted.
    pub fn subscribe_async(&self) -> mpsc::Receiver<PollEvents> {
        let (tx, rx) = mpsc::channel();
        self.shared.lock().fasync.push(tx);
        rx
    }

    /// Wake pollers and async subscribers: there is something to read.
    pub(crate) fn notify_readable(&self) {
        let mut shared = self.wake_pollers();
        Self::kill_fasync(&mut shared, PollEvents::POLLIN);
    }

    /// Wake threads in [`Connection::poll_wait`] so they recheck readiness.
    pub(crate) fn wake_pollers(&self) -> MutexGuard<'_, ConnShared> {
        self.poll_seq.fetch_add(1, Ordering::SeqCst);
        let shared = self.shared.lock();
        self.poll_waitq.notify_all();
        shared
    }

    pub(crate) fn kill_fasync(shared: &mut ConnShared, events: PollEvents) {
        shared.fasync.retain(|tx| tx.send(events).is_ok());
    }

    /// Readiness of the device: always writable, readable while any queue has work,
    /// only `POLLERR` once disconnected.
    pub fn poll_mask(&self) -> PollEvents {
        if !self.connected() {
            return PollEvents::POLLERR;
        }
        let mut mask = PollEvents::POLLOUT | PollEvents::POLLWRNORM;
        if self.nodes.iter().any(|n| n.lock().request_pending()) {
            mask |= PollEvents::POLLIN | PollEvents::POLLRDNORM;
        }
        mask
    }

    /// Wait until the device is readable or disconnected, or `timeout` passes.
    pub fn poll_wait(&self, timeout: Option<Duration>) -> PollEvents {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let seq = self.poll_seq.load(Ordering::SeqCst);
            let mask = self.poll_mask();
            if mask.intersects(PollEvents::POLLIN | PollEvents::POLLERR) {
                return mask;
            }
            let mut shared = self.shared.lock();
            if self.poll_seq.load(Ordering::SeqCst) != seq {
                continue;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return mask;
                    }
                    self.poll_waitq.wait_for(&mut shared, deadline - now);
                }
                None => self.poll_waitq.wait(&mut shared),
            }
        }
    }
}

/// An open file: owner of a reserved request. Closing it releases the slot.
#[derive(Debug)]
pub struct OpenFile {
    conn: Weak<Connection>,
    fh: u64,
}

impl OpenFile {
    /// File handle number.
    pub fn fh(&self) -> u64 {
        self.fh
    }

    /// Whether the reserved request is currently parked in its slot.
    pub fn reserved_available(&self) -> bool {
        self.conn.upgrade().is_some_and(|conn| {
            conn.shared
                .lock()
                .reserved
                .get(&self.fh)
                .is_some_and(Option::is_some)
        })
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.shared.lock().reserved.remove(&self.fh);
        }
    }
}

/// Registration for poll wakeups on one daemon poll handle.
#[derive(Debug)]
pub struct PollWaiter {
    conn: Weak<Connection>,
    kh: u64,
    state: Arc<PollState>,
}

impl PollWaiter {
    /// The registered handle.
    pub fn kh(&self) -> u64 {
        self.kh
    }

    /// Whether a wakeup arrived and has not been consumed yet.
    pub fn is_woken(&self) -> bool {
        *self.state.woken.lock()
    }

    /// Wait up to `timeout` for a wakeup, consuming it. `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut woken = self.state.woken.lock();
        while !*woken {
            if self.state.cv.wait_until(&mut woken, deadline).timed_out() {
                break;
            }
        }
        std::mem::take(&mut *woken)
    }
}

impl Drop for PollWaiter {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            let mut shared = conn.shared.lock();
            if shared
                .polled
                .get(&self.kh)
                .is_some_and(|s| Arc::ptr_eq(s, &self.state))
            {
                shared.polled.remove(&self.kh);
            }
        }
    }
}
