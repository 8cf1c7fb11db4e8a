//! Calling context of blocking operations.
//!
//! Every call that may sleep takes a [`Task`]: the identity of the calling thread as the
//! transport sees it. It selects the per-node queue (affinity), supplies the credentials
//! copied into request headers, and carries the signals that can cut a wait short.

use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use bitflags::bitflags;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

/// A signal that may be sent to a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// An ordinary, catchable signal.
    Interrupt,
    /// A fatal signal; the task is being killed.
    Kill,
}

bitflags! {
    /// Set of signals a wait can be interrupted by.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct SigSet: u8 {
        const INTERRUPT = 1 << 0;
        const KILL = 1 << 1;
    }
}

impl SigSet {
    pub(crate) const FATAL: SigSet = SigSet::KILL;
    pub(crate) const ANY: SigSet = SigSet::all();
    pub(crate) const NONE: SigSet = SigSet::empty();
}

impl From<Signal> for SigSet {
    fn from(sig: Signal) -> Self {
        match sig {
            Signal::Interrupt => SigSet::INTERRUPT,
            Signal::Kill => SigSet::KILL,
        }
    }
}

pub(crate) type Waker = Arc<dyn Fn() + Send + Sync>;

struct TaskInner {
    numa_id: usize,
    uid: u32,
    gid: u32,
    pid: u32,
    pending: AtomicU8,
    waker: Mutex<Option<Waker>>,
}

/// Calling context: affinity domain, credentials and pending signals.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("numa_id", &self.inner.numa_id)
            .field("pid", &self.inner.pid)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Task {
    /// A task running on affinity domain `numa_id`, with root credentials.
    pub fn new(numa_id: usize) -> Self {
        Self::with_creds(numa_id, 0, 0, std::process::id())
    }

    /// A task with explicit credentials.
    pub fn with_creds(numa_id: usize, uid: u32, gid: u32, pid: u32) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                numa_id,
                uid,
                gid,
                pid,
                pending: AtomicU8::new(0),
                waker: Mutex::new(None),
            }),
        }
    }

    /// Affinity domain of the task.
    pub fn numa_id(&self) -> usize {
        self.inner.numa_id
    }

    /// Credentials as `(uid, gid, pid)`.
    pub fn creds(&self) -> (u32, u32, u32) {
        (self.inner.uid, self.inner.gid, self.inner.pid)
    }

    /// Deliver `sig`. A wait the signal may interrupt wakes up; the signal stays pending
    /// until [`Task::clear_signals`].
    pub fn send_signal(&self, sig: Signal) {
        self.inner
            .pending
            .fetch_or(SigSet::from(sig).bits(), Ordering::SeqCst);
        let waker = self.inner.waker.lock().clone();
        if let Some(waker) = waker {
            waker();
        }
    }

    /// Forget all pending signals.
    pub fn clear_signals(&self) {
        self.inner.pending.store(0, Ordering::SeqCst);
    }

    /// Whether any signal is pending.
    pub fn has_pending_signal(&self) -> bool {
        !self.pending().is_empty()
    }

    pub(crate) fn pending(&self) -> SigSet {
        SigSet::from_bits_truncate(self.inner.pending.load(Ordering::SeqCst))
    }

    pub(crate) fn signal_pending(&self, mask: SigSet) -> bool {
        self.pending().intersects(mask)
    }

    /// Sleep on `cv` with `guard` held until `done` holds or a signal in `mask` is pending.
    ///
    /// `waker` builds the callback a signal sender runs: it must take the lock behind
    /// `guard` before notifying `cv`, so a signal can't slip in between check and sleep.
    /// Returns `false` when interrupted.
    pub(crate) fn wait_until<T>(
        &self,
        cv: &Condvar,
        guard: &mut MutexGuard<'_, T>,
        mask: SigSet,
        waker: impl FnOnce() -> Waker,
        mut done: impl FnMut(&mut T) -> bool,
    ) -> bool {
        let _registration = (!mask.is_empty()).then(|| self.register_waker(waker()));
        loop {
            if done(&mut **guard) {
                return true;
            }
            if self.signal_pending(mask) {
                return false;
            }
            cv.wait(guard);
        }
    }

    fn register_waker(&self, waker: Waker) -> WakerRegistration<'_> {
        *self.inner.waker.lock() = Some(waker);
        WakerRegistration { task: self }
    }
}

struct WakerRegistration<'a> {
    task: &'a Task,
}

impl Drop for WakerRegistration<'_> {
    fn drop(&mut self) {
        *self.task.inner.waker.lock() = None;
    }
}
