use std::fmt::Display;
use std::fmt::Formatter;

use bitflags::bitflags;

bitflags! {
    /// Readiness of the device, as reported by [`Connection::poll_mask`] and delivered
    /// to async subscribers.
    ///
    /// Values match poll(2).
    ///
    /// [`Connection::poll_mask`]: crate::Connection::poll_mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollEvents: u32 {
        /// A request, interrupt or forget is waiting to be read.
        const POLLIN = libc::POLLIN as u32;
        /// Replies and notifications can be written.
        const POLLOUT = libc::POLLOUT as u32;
        /// The connection is gone.
        const POLLERR = libc::POLLERR as u32;
        /// Same as `POLLIN`.
        const POLLRDNORM = libc::POLLRDNORM as u32;
        /// Same as `POLLOUT`.
        const POLLWRNORM = libc::POLLWRNORM as u32;
    }
}

impl Display for PollEvents {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}
