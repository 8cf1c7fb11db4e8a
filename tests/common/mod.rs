#![allow(dead_code)]

use std::sync::Arc;
use std::sync::mpsc;

use fusedev::Channel;
use fusedev::Connection;
use fusedev::ConnectionConfig;
use fusedev::Errno;
use fusedev::KernelMessage;
use fusedev::Request;
use fusedev::Response;
use fusedev::Task;
use fusedev::consts;
use fusedev::fuse_opcode;

pub const IN_HEADER: usize = 40;
pub const OUT_HEADER: usize = 16;

pub type Completion = (u64, Result<(), Errno>);

pub fn connection(config: ConnectionConfig) -> (Arc<Connection>, Arc<Channel>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let conn = Connection::new(config).unwrap();
    let channel = Arc::new(Channel::new(conn.clone()));
    (conn, channel)
}

/// A GETATTR request for `nodeid`, not yet submitted.
pub fn getattr(conn: &Connection, task: &Task, nodeid: u64) -> Request {
    let req = conn.acquire_or_block(task).unwrap();
    {
        let mut body = req.body();
        body.set_opcode(fuse_opcode::FUSE_GETATTR);
        body.set_nodeid(nodeid);
    }
    req
}

/// Submit a GETATTR in the background; its completion is sent to `tx`.
pub fn background(
    conn: &Connection,
    task: &Task,
    nodeid: u64,
    tx: mpsc::Sender<Completion>,
) -> u64 {
    let req = getattr(conn, task, nodeid);
    let unique = req.unique();
    conn.submit_background(
        req,
        Some(Box::new(move |r: &Request| {
            let _ = tx.send((r.unique(), r.result()));
        })),
    );
    unique
}

pub fn read_message(channel: &Channel, task: &Task) -> Vec<u8> {
    let mut buf = vec![0; consts::FUSE_MIN_READ_BUFFER];
    let n = channel.read(task, &mut buf).unwrap();
    buf.truncate(n);
    buf
}

pub fn unique_of(msg: &[u8]) -> u64 {
    KernelMessage::try_from(msg).unwrap().unique()
}

pub fn nodeid_of(msg: &[u8]) -> u64 {
    match KernelMessage::try_from(msg).unwrap() {
        KernelMessage::Operation(op) => op.header().nodeid(),
        other => panic!("expected an operation, got {other:?}"),
    }
}

pub fn reply(
    channel: &Channel,
    task: &Task,
    unique: u64,
    response: Response<'_>,
) -> Result<usize, Errno> {
    channel.write(task, &response.to_vec(unique))
}

/// A raw reply header.
pub fn out_header(len: usize, error: i32, unique: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(OUT_HEADER);
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&error.to_ne_bytes());
    buf.extend_from_slice(&unique.to_ne_bytes());
    buf
}
