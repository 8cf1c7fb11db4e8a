//! Low-level wire format of the device protocol.

mod argument;
mod errno;
pub(crate) mod fuse_abi;
pub(crate) mod notify;
pub(crate) mod reply;
pub(crate) mod request;

pub use errno::Errno;
pub use reply::Response;
pub use request::{InHeader, KernelMessage, MessageError, Operation};
