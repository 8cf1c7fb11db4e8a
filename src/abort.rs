//! Tearing a connection down.
//!
//! After an abort nothing stays queued: every request on every list finishes with
//! `ECONNABORTED`, forgets are dropped, and every thread sleeping on the connection wakes
//! up. A request that a writer is still copying into is only marked; its buffers stay
//! alive until the writer lets go of them.

use log::debug;
use log::info;
use parking_lot::MutexGuard;

use crate::connection::Connection;
use crate::ll::Errno;
use crate::node::NodeState;
use crate::node::NumaNode;
use crate::poll_events::PollEvents;
use crate::request::ListKind;
use crate::request::Request;

impl Connection {
    /// Abort the connection.
    ///
    /// Requests already being answered are marked aborted and finished; the writer copying
    /// the reply sees the mark and stops. Queued requests finish with `ECONNABORTED`.
    /// Readers, submitters waiting for admission and poll waiters all wake up.
    /// Aborting twice does nothing.
    pub fn abort(&self) {
        if !self.disconnect() {
            debug!("connection already aborted");
            return;
        }
        for node in self.nodes() {
            let mut st = node.lock();
            st.blocked = false;
            st = end_io_requests(self, node, st);
            node.waitq.notify_all();
            node.blocked_waitq.notify_all();
            drop(st);
        }
        drop(self.wake_pollers());
        end_queued_requests(self);
        end_polls(self);
        Connection::kill_fasync(&mut self.shared.lock(), PollEvents::POLLIN);
        info!("connection aborted");
    }
}

/// The daemon closed the device. Requests already being answered are left to their
/// writers; everything queued is ended.
pub(crate) fn release(conn: &Connection) {
    conn.disconnect();
    end_queued_requests(conn);
    for node in conn.nodes() {
        let mut st = node.lock();
        st.blocked = false;
        node.blocked_waitq.notify_all();
        node.waitq.notify_all();
    }
    end_polls(conn);
    drop(conn.wake_pollers());
    info!("device released");
}

/// Finish requests whose reply is being copied. The completion callback of such a request
/// only runs once the copy has let go of the request's buffers.
fn end_io_requests<'a>(
    conn: &Connection,
    node: &'a NumaNode,
    mut st: MutexGuard<'a, NodeState>,
) -> MutexGuard<'a, NodeState> {
    while let Some(req) = st.io.front().cloned() {
        let end = {
            let mut status = req.status.lock();
            status.aborted = true;
            status.error = Some(Errno::ECONNABORTED);
            st.unlink(&req, &mut status);
            req.finish(&mut status);
            status.end.take()
        };
        debug!("aborted request {} mid-copy", req.unique());
        let Some(end) = end else {
            continue;
        };
        req.get();
        drop(st);
        {
            let mut status = req.status.lock();
            while status.locked {
                req.waitq.wait(&mut status);
            }
        }
        end(&Request::from_inner(req.clone()));
        conn.put_request(&req);
        st = node.lock();
    }
    st
}

/// Finish everything still queued on every node and drop pending forgets.
fn end_queued_requests(conn: &Connection) {
    for node in conn.nodes() {
        let mut st = node.lock();
        st.max_background = usize::MAX;
        node.flush_bg_queue(conn, &mut st);
        let st = node.end_requests(conn, st, ListKind::Pending);
        let mut st = node.end_requests(conn, st, ListKind::Processing);
        if !st.forgets.is_empty() {
            debug!("dropping {} forgets on node {}", st.forgets.len(), node.id);
        }
        st.forgets.clear();
    }
}

/// Wake every registered poll waiter.
fn end_polls(conn: &Connection) {
    let shared = conn.shared.lock();
    for state in shared.polled.values() {
        state.wake();
    }
}
