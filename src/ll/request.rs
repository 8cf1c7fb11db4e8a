//! Decoding of messages read from the device.
//!
//! A daemon reads one complete message per read call. The helpers here split it into the
//! request header and a typed view of the arguments for the message kinds the transport
//! itself synthesizes (interrupts, forgets, notify replies). Every other opcode is handed
//! back as an opaque [`Operation`].

use std::ffi::OsStr;
use std::fmt;

use ref_cast::RefCast;

use super::argument::ArgumentIterator;
use super::fuse_abi as abi;
use super::fuse_abi::fuse_opcode;
use crate::forget_one::ForgetOne;

/// Error that may occur while decoding a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    /// Not enough data for parsing header (short read).
    ShortReadHeader(usize),
    /// Not enough data for arguments (short read).
    ShortRead(usize, usize),
    /// Insufficient argument data for the opcode.
    InsufficientData,
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::ShortReadHeader(len) => write!(
                f,
                "Short read of FUSE request header ({len} < {})",
                size_of::<abi::fuse_in_header>()
            ),
            MessageError::ShortRead(len, total) => {
                write!(f, "Short read of FUSE request ({len} < {total})")
            }
            MessageError::InsufficientData => write!(f, "Insufficient argument data"),
        }
    }
}

impl std::error::Error for MessageError {}

/// Header shared by every delivered message.
#[derive(Debug, RefCast)]
#[repr(transparent)]
pub struct InHeader(abi::fuse_in_header);

impl InHeader {
    /// Total message length, header included.
    pub fn len(&self) -> u32 {
        self.0.len
    }

    /// Raw opcode.
    pub fn opcode(&self) -> u32 {
        self.0.opcode
    }

    /// Request unique id (the reply matching key).
    pub fn unique(&self) -> u64 {
        self.0.unique
    }

    /// Target inode.
    pub fn nodeid(&self) -> u64 {
        self.0.nodeid
    }

    /// Caller credentials as `(uid, gid, pid)`.
    pub fn creds(&self) -> (u32, u32, u32) {
        (self.0.uid, self.0.gid, self.0.pid)
    }
}

/// A filesystem operation the transport does not interpret.
#[derive(Debug)]
pub struct Operation<'a> {
    header: abi::fuse_in_header,
    payload: &'a [u8],
}

impl<'a> Operation<'a> {
    /// The message header.
    pub fn header(&self) -> &InHeader {
        InHeader::ref_cast(&self.header)
    }

    /// Decoded opcode, or the raw value if it is unknown.
    pub fn opcode(&self) -> Result<fuse_opcode, u32> {
        fuse_opcode::try_from(self.header.opcode).map_err(|_| self.header.opcode)
    }

    /// Argument bytes following the header.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// The zero-terminated name leading the payload, as carried by name-based operations
    /// such as `FUSE_LOOKUP` or `FUSE_UNLINK`.
    pub fn name(&self) -> Option<&'a OsStr> {
        ArgumentIterator::new(self.payload).fetch_str()
    }
}

/// One message as read from the device.
#[derive(Debug)]
pub enum KernelMessage<'a> {
    /// Ask the daemon to abandon the request with unique `target`.
    Interrupt {
        /// Unique of the interrupt itself; an acknowledgement is a reply with this id.
        unique: u64,
        /// Unique of the interrupted request.
        target: u64,
    },
    /// Single forget.
    Forget {
        /// Synthesized unique; forgets take no reply.
        unique: u64,
        /// The forgotten lookups.
        forget: ForgetOne,
    },
    /// Several forgets coalesced into one message.
    BatchForget {
        /// Synthesized unique; forgets take no reply.
        unique: u64,
        /// Forgets in queue order.
        forgets: Vec<ForgetOne>,
    },
    /// Page-cache contents sent back for a retrieve notification.
    NotifyReply {
        /// The `notify_unique` the daemon chose when it asked for the retrieve.
        unique: u64,
        /// Inode whose pages were read.
        nodeid: u64,
        /// File offset of the first byte of `data`.
        offset: u64,
        /// The retrieved bytes.
        data: &'a [u8],
    },
    /// Any other request.
    Operation(Operation<'a>),
}

impl<'a> KernelMessage<'a> {
    /// Unique id of the message.
    pub fn unique(&self) -> u64 {
        match self {
            KernelMessage::Interrupt { unique, .. }
            | KernelMessage::Forget { unique, .. }
            | KernelMessage::BatchForget { unique, .. }
            | KernelMessage::NotifyReply { unique, .. } => *unique,
            KernelMessage::Operation(op) => op.header.unique,
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for KernelMessage<'a> {
    type Error = MessageError;

    fn try_from(data: &'a [u8]) -> Result<Self, Self::Error> {
        let mut it = ArgumentIterator::new(data);
        let header: abi::fuse_in_header = it
            .fetch()
            .ok_or(MessageError::ShortReadHeader(data.len()))?;
        let total = header.len as usize;
        if data.len() < total {
            return Err(MessageError::ShortRead(data.len(), total));
        }
        let mut it = ArgumentIterator::new(&data[size_of::<abi::fuse_in_header>()..total]);
        let message = match fuse_opcode::try_from(header.opcode) {
            Ok(fuse_opcode::FUSE_INTERRUPT) => {
                let arg: abi::fuse_interrupt_in =
                    it.fetch().ok_or(MessageError::InsufficientData)?;
                KernelMessage::Interrupt {
                    unique: header.unique,
                    target: arg.unique,
                }
            }
            Ok(fuse_opcode::FUSE_FORGET) => {
                let arg: abi::fuse_forget_in = it.fetch().ok_or(MessageError::InsufficientData)?;
                KernelMessage::Forget {
                    unique: header.unique,
                    forget: ForgetOne::new(header.nodeid, arg.nlookup),
                }
            }
            Ok(fuse_opcode::FUSE_BATCH_FORGET) => {
                let arg: abi::fuse_batch_forget_in =
                    it.fetch().ok_or(MessageError::InsufficientData)?;
                let raw: Vec<abi::fuse_forget_one> = it
                    .fetch_vec(arg.count as usize)
                    .ok_or(MessageError::InsufficientData)?;
                KernelMessage::BatchForget {
                    unique: header.unique,
                    forgets: raw.iter().map(|f| *ForgetOne::from_inner(f)).collect(),
                }
            }
            Ok(fuse_opcode::FUSE_NOTIFY_REPLY) => {
                let arg: abi::fuse_notify_retrieve_in =
                    it.fetch().ok_or(MessageError::InsufficientData)?;
                let data = it
                    .fetch_bytes(arg.size as usize)
                    .ok_or(MessageError::InsufficientData)?;
                KernelMessage::NotifyReply {
                    unique: header.unique,
                    nodeid: header.nodeid,
                    offset: arg.offset,
                    data,
                }
            }
            _ => KernelMessage::Operation(Operation {
                header,
                payload: it.fetch_all(),
            }),
        };
        Ok(message)
    }
}
