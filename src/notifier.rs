//! Daemon side of notifications: encodes them and writes them to the device.

use std::ffi::OsStr;
use std::io;
use std::sync::Arc;

use crate::dev::Channel;
use crate::ll::notify::Notification;
use crate::task::Task;

/// A handle to a pending `poll()` request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PollHandle(pub u64);

/// A [handle](PollHandle) to a pending `poll()` request coupled with notifier reference.
/// Can be saved and used to notify the kernel when a poll is ready.
#[derive(Clone)]
pub struct PollNotifier {
    handle: PollHandle,
    notifier: Notifier,
}

impl PollNotifier {
    /// Pair `kh` with the notifier that will signal it.
    pub fn new(notifier: Notifier, kh: PollHandle) -> Self {
        Self {
            handle: kh,
            notifier,
        }
    }

    /// Handle associated with this poll notifier.
    pub fn handle(&self) -> PollHandle {
        self.handle
    }

    /// Notify the kernel that the associated file handle is ready to be polled.
    /// # Errors
    /// Returns an error if the kernel rejects the notification.
    pub fn notify(self) -> io::Result<()> {
        self.notifier.poll(self.handle)
    }
}

impl std::fmt::Debug for PollNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PollNotifier").field(&self.handle).finish()
    }
}

/// A handle by which the daemon sends notifications through its channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    channel: Arc<Channel>,
    task: Task,
}

impl Notifier {
    /// Notifications written through `channel`, in the context of `task`.
    pub fn new(channel: Arc<Channel>, task: Task) -> Self {
        Self { channel, task }
    }

    /// Notify poll clients of I/O readiness
    /// # Errors
    /// Returns an error if the kernel rejects the notification.
    pub fn poll(&self, kh: PollHandle) -> io::Result<()> {
        self.send(&Notification::new_poll(kh.0))
    }

    /// Invalidate the kernel cache for a given directory entry
    /// # Errors
    /// Returns an error if the notification data is too large.
    /// Returns an error if the kernel rejects the notification.
    pub fn inval_entry(&self, parent: u64, name: &OsStr) -> io::Result<()> {
        let notif = Notification::new_inval_entry(parent, name).map_err(Self::too_big_err)?;
        self.send_inval(&notif)
    }

    /// Invalidate the kernel cache for a given inode (metadata and
    /// data in the given range)
    /// # Errors
    /// Returns an error if the kernel rejects the notification.
    pub fn inval_inode(&self, ino: u64, offset: i64, len: i64) -> io::Result<()> {
        self.send_inval(&Notification::new_inval_inode(ino, offset, len))
    }

    /// Update the kernel's cached copy of a given inode's data
    /// # Errors
    /// Returns an error if the notification data is too large.
    /// Returns an error if the kernel rejects the notification.
    pub fn store(&self, ino: u64, offset: u64, data: &[u8]) -> io::Result<()> {
        let notif = Notification::new_store(ino, offset, data).map_err(Self::too_big_err)?;
        // The inode may have been evicted meanwhile; that is not a failure.
        self.send_inval(&notif)
    }

    /// Ask the kernel to send back up to `size` bytes of cached data of `ino` from
    /// `offset`. The data arrives as a `FUSE_NOTIFY_REPLY` request with unique
    /// `notify_unique`.
    /// # Errors
    /// Returns an error if the kernel rejects the notification.
    pub fn retrieve(&self, notify_unique: u64, ino: u64, offset: u64, size: u32) -> io::Result<()> {
        self.send(&Notification::new_retrieve(notify_unique, ino, offset, size))
    }

    /// Invalidate the kernel cache for a given directory entry and inform
    /// inotify watchers of a file deletion.
    /// # Errors
    /// Returns an error if the notification data is too large.
    /// Returns an error if the kernel rejects the notification.
    pub fn delete(&self, parent: u64, child: u64, name: &OsStr) -> io::Result<()> {
        let notif = Notification::new_delete(parent, child, name).map_err(Self::too_big_err)?;
        self.send_inval(&notif)
    }

    fn send_inval(&self, notification: &Notification<'_>) -> io::Result<()> {
        match self.send(notification) {
            // The kernel may have dropped the cached entry on its own already.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            x => x,
        }
    }

    fn send(&self, notification: &Notification<'_>) -> io::Result<()> {
        notification
            .with_iovec(|iov| self.channel.writev(&self.task, iov))
            .map_err(Self::too_big_err)?
            .map(|_| ())
            .map_err(io::Error::from)
    }

    /// Create an error for indicating when a notification message
    /// would exceed the capacity that its length descriptor field is
    /// capable of encoding.
    fn too_big_err(tfie: std::num::TryFromIntError) -> io::Error {
        io::Error::other(format!("Data too large: {tfie:?}"))
    }
}
