//! Per-node request queues.
//!
//! One [`NumaNode`] exists per affinity domain. Its lock guards every list and admission
//! counter below; a request moves between lists only while that lock is held. Readers
//! sleep on `waitq`, callers waiting for admission on `blocked_waitq`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use log::debug;
use log::trace;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::connection::Connection;
use crate::forget_one::ForgetOne;
use crate::ll::Errno;
use crate::request::ListKind;
use crate::request::Request;
use crate::request::RequestInner;
use crate::request::RequestState;
use crate::request::Status;
use crate::task::Waker;

/// Value the forget/request alternation counter restarts from.
pub(crate) const FORGET_BATCH: i32 = 16;
/// Once the counter reaches this, pending requests have had their turn.
const FORGET_BATCH_FLOOR: i32 = -8;

pub(crate) type ReqRef = Arc<RequestInner>;

#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) pending: VecDeque<ReqRef>,
    pub(crate) io: VecDeque<ReqRef>,
    pub(crate) processing: VecDeque<ReqRef>,
    pub(crate) bg_queue: VecDeque<ReqRef>,
    pub(crate) interrupts: VecDeque<ReqRef>,
    pub(crate) forgets: VecDeque<ForgetOne>,
    pub(crate) forget_batch: i32,
    pub(crate) num_background: usize,
    pub(crate) active_background: usize,
    pub(crate) max_background: usize,
    pub(crate) congestion_threshold: usize,
    pub(crate) blocked: bool,
}

impl NodeState {
    fn new(max_background: usize, congestion_threshold: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            io: VecDeque::new(),
            processing: VecDeque::new(),
            bg_queue: VecDeque::new(),
            interrupts: VecDeque::new(),
            forgets: VecDeque::new(),
            forget_batch: FORGET_BATCH,
            num_background: 0,
            active_background: 0,
            max_background,
            congestion_threshold,
            blocked: false,
        }
    }

    /// Anything a reader could pick up.
    pub(crate) fn request_pending(&self) -> bool {
        !self.pending.is_empty() || !self.interrupts.is_empty() || !self.forgets.is_empty()
    }

    /// Take up to `max` forgets in queue order.
    pub(crate) fn dequeue_forgets(&mut self, max: usize) -> Vec<ForgetOne> {
        let n = max.min(self.forgets.len());
        self.forgets.drain(..n).collect()
    }

    /// Decide whether the next read serves a forget rather than a pending request.
    ///
    /// Forgets win outright when nothing else is pending. Otherwise they win the next
    /// `FORGET_BATCH` decisions, then lose until the counter reaches the floor, then the
    /// cycle restarts.
    pub(crate) fn prefer_forget(&mut self) -> bool {
        if self.forgets.is_empty() {
            return false;
        }
        if self.pending.is_empty() {
            return true;
        }
        let turn = self.forget_batch;
        self.forget_batch -= 1;
        if turn > 0 {
            return true;
        }
        if self.forget_batch <= FORGET_BATCH_FLOOR {
            self.forget_batch = FORGET_BATCH;
        }
        false
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut VecDeque<ReqRef> {
        match kind {
            ListKind::Background => &mut self.bg_queue,
            ListKind::Pending => &mut self.pending,
            ListKind::Io => &mut self.io,
            ListKind::Processing => &mut self.processing,
        }
    }

    /// Take `req` off whatever list holds it, and off the interrupt queue.
    pub(crate) fn unlink(&mut self, req: &ReqRef, status: &mut Status) {
        if let Some(kind) = status.list.take() {
            let list = self.list_mut(kind);
            if let Some(pos) = list.iter().position(|r| Arc::ptr_eq(r, req)) {
                list.remove(pos);
            }
        }
        if status.intr_queued {
            status.intr_queued = false;
            if let Some(pos) = self.interrupts.iter().position(|r| Arc::ptr_eq(r, req)) {
                self.interrupts.remove(pos);
            }
        }
    }

    /// Put `req` at the tail of list `kind`.
    pub(crate) fn link(&mut self, req: &ReqRef, status: &mut Status, kind: ListKind) {
        self.unlink(req, status);
        status.list = Some(kind);
        self.list_mut(kind).push_back(req.clone());
    }

    /// Find a request awaiting a reply with `unique` as its main or interrupt id.
    pub(crate) fn find_processing(&self, unique: u64) -> Option<ReqRef> {
        self.processing
            .iter()
            .find(|r| r.unique() == unique || r.status.lock().intr_unique == unique)
            .cloned()
    }
}

/// Queues and admission state of one affinity domain.
#[derive(Debug)]
pub(crate) struct NumaNode {
    pub(crate) id: usize,
    pub(crate) state: Mutex<NodeState>,
    pub(crate) waitq: Condvar,
    pub(crate) blocked_waitq: Condvar,
    pub(crate) num_waiting: AtomicUsize,
}

impl NumaNode {
    pub(crate) fn new(id: usize, max_background: usize, congestion_threshold: usize) -> Self {
        Self {
            id,
            state: Mutex::new(NodeState::new(max_background, congestion_threshold)),
            waitq: Condvar::new(),
            blocked_waitq: Condvar::new(),
            num_waiting: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    pub(crate) fn reader_waker(self: &Arc<Self>) -> impl FnOnce() -> Waker {
        let node = self.clone();
        move || {
            Arc::new(move || {
                let _st = node.state.lock();
                node.waitq.notify_all();
            })
        }
    }

    pub(crate) fn blocked_waker(self: &Arc<Self>) -> impl FnOnce() -> Waker {
        let node = self.clone();
        move || {
            Arc::new(move || {
                let _st = node.state.lock();
                node.blocked_waitq.notify_all();
            })
        }
    }

    /// Append `req` to `pending` and wake a reader.
    pub(crate) fn queue_request(
        &self,
        conn: &Connection,
        st: &mut NodeState,
        req: &ReqRef,
        status: &mut Status,
    ) {
        st.link(req, status, ListKind::Pending);
        status.state = RequestState::Pending;
        if !status.waiting {
            status.waiting = true;
            self.num_waiting.fetch_add(1, Ordering::SeqCst);
        }
        trace!("queued request {} on node {}", req.unique(), self.id);
        self.waitq.notify_one();
        conn.notify_readable();
    }

    /// Queue a forget and wake a reader.
    pub(crate) fn queue_forget(&self, conn: &Connection, st: &mut NodeState, forget: ForgetOne) {
        st.forgets.push_back(forget);
        self.waitq.notify_one();
        conn.notify_readable();
    }

    /// Queue the interrupt of `req`, unless it is already queued.
    pub(crate) fn queue_interrupt(
        &self,
        conn: &Connection,
        st: &mut NodeState,
        req: &ReqRef,
        status: &mut Status,
    ) {
        if status.intr_queued {
            return;
        }
        status.intr_queued = true;
        st.interrupts.push_back(req.clone());
        debug!("queued interrupt for request {}", req.unique());
        self.waitq.notify_one();
        conn.notify_readable();
    }

    /// Move staged background requests to `pending` while admission allows.
    pub(crate) fn flush_bg_queue(&self, conn: &Connection, st: &mut NodeState) {
        while st.active_background < st.max_background {
            let Some(req) = st.bg_queue.front().cloned() else {
                break;
            };
            st.active_background += 1;
            let mut status = req.status.lock();
            self.queue_request(conn, st, &req, &mut status);
        }
    }

    /// Stage a background request and flush what admission allows.
    pub(crate) fn queue_background(
        &self,
        conn: &Connection,
        st: &mut NodeState,
        req: &ReqRef,
        status: &mut Status,
    ) {
        status.background = true;
        st.num_background += 1;
        if st.num_background == st.max_background {
            st.blocked = true;
        }
        if st.num_background == st.congestion_threshold {
            conn.set_congested(true);
        }
        st.link(req, status, ListKind::Background);
    }

    /// Finish `req`: unlink it, settle background accounting, wake its waiter, run its
    /// completion callback and drop the submitter's reference.
    ///
    /// Consumes the queue lock; the callback runs with no lock held.
    pub(crate) fn request_end(
        &self,
        conn: &Connection,
        mut st: MutexGuard<'_, NodeState>,
        req: &ReqRef,
    ) {
        let (end, background) = {
            let mut status = req.status.lock();
            st.unlink(req, &mut status);
            // Notify replies carry a daemon-chosen unique and are never indexed.
            if status.isreply {
                conn.unindex(req.unique());
            }
            if status.intr_unique != 0 {
                conn.unindex(status.intr_unique);
            }
            req.finish(&mut status);
            (status.end.take(), status.background)
        };
        if background {
            if st.num_background == st.max_background {
                st.blocked = false;
                self.blocked_waitq.notify_all();
            }
            if st.num_background == st.congestion_threshold && conn.connected() {
                conn.set_congested(false);
            }
            st.num_background = st.num_background.saturating_sub(1);
            st.active_background = st.active_background.saturating_sub(1);
            self.flush_bg_queue(conn, &mut st);
        }
        drop(st);
        if let Some(end) = end {
            end(&Request::from_inner(req.clone()));
        }
        conn.put_request(req);
    }

    /// Finish every request on list `kind` with `ECONNABORTED`. The lock is dropped
    /// around each completion.
    pub(crate) fn end_requests<'a>(
        &'a self,
        conn: &Connection,
        mut st: MutexGuard<'a, NodeState>,
        kind: ListKind,
    ) -> MutexGuard<'a, NodeState> {
        while let Some(req) = st.list_mut(kind).front().cloned() {
            req.status.lock().error = Some(Errno::ECONNABORTED);
            self.request_end(conn, st, &req);
            st = self.lock();
        }
        st
    }

    /// Mark `req` as being copied. Fails once the request has been aborted.
    pub(crate) fn lock_request(&self, req: &ReqRef) -> Result<(), Errno> {
        let _st = self.lock();
        let mut status = req.status.lock();
        if status.aborted {
            return Err(Errno::ENOENT);
        }
        status.locked = true;
        Ok(())
    }

    /// Clear the copy mark of `req`. If the request was aborted meanwhile, the thread
    /// waiting for the copy to finish is woken.
    pub(crate) fn unlock_request(&self, req: &ReqRef) {
        let _st = self.lock();
        let mut status = req.status.lock();
        status.locked = false;
        if status.aborted {
            req.waitq.notify_all();
        }
    }
}
