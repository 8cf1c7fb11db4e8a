//! Kernel-side transport of a FUSE device.
//!
//! A [`Connection`] carries filesystem requests from in-kernel callers to a userspace
//! daemon and carries the daemon's replies back. Callers allocate a [`Request`], fill in
//! its [`RequestBody`] and submit it synchronously or in the background. The daemon talks
//! to the connection through a [`Channel`]: each read returns one complete request,
//! interrupt or forget; each write carries one reply or one unsolicited notification.
//!
//! Requests are queued per affinity domain ("node"); a [`Task`] selects its node and
//! carries the signals that can cut a wait short. Bulk data moves as [`Page`]s, either
//! copied through plain buffers or shared through a [`Pipe`] when spliced.
//! [`Connection::abort`] tears everything down and wakes every waiter.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub use crate::cache::InodeCache;
pub use crate::cache::MemInodeCache;
pub use crate::connection::Connection;
pub use crate::connection::ConnectionConfig;
pub use crate::connection::OpenFile;
pub use crate::connection::PollWaiter;
pub use crate::dev::Channel;
pub use crate::forget_one::ForgetOne;
pub use crate::ll::Errno;
pub use crate::ll::InHeader;
pub use crate::ll::KernelMessage;
pub use crate::ll::MessageError;
pub use crate::ll::Operation;
pub use crate::ll::Response;
pub use crate::ll::fuse_abi::consts;
pub use crate::ll::fuse_abi::fuse_notify_code;
pub use crate::ll::fuse_abi::fuse_opcode;
pub use crate::notifier::Notifier;
pub use crate::notifier::PollHandle;
pub use crate::notifier::PollNotifier;
pub use crate::page::PIPE_DEF_BUFFERS;
pub use crate::page::Page;
pub use crate::page::PageFlags;
pub use crate::page::PageIndex;
pub use crate::page::PageRef;
pub use crate::page::Pipe;
pub use crate::page::PipeBufFlags;
pub use crate::page::PipeBuffer;
pub use crate::page::SpliceFlags;
pub use crate::page::page_size;
pub use crate::poll_events::PollEvents;
pub use crate::request::EndFn;
pub use crate::request::Request;
pub use crate::request::RequestBody;
pub use crate::request::RequestState;
pub use crate::task::Signal;
pub use crate::task::Task;

mod abort;
mod cache;
mod connection;
mod copy;
mod dev;
mod forget_one;
mod ll;
mod node;
mod notifier;
mod notify;
mod page;
mod poll_events;
mod request;
mod task;
