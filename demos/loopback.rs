// A daemon and a handful of in-process callers talking over one connection.
//
// The daemon runs one reader per node and answers every LOOKUP with the name it was
// asked for, upper-cased. After the callers are done it pushes data into the page cache
// with a store notification, asks for it back with a retrieve, and finally the
// connection is aborted, which makes every reader's next read fail with ENODEV.

use std::ffi::OsStr;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use log::info;
use log::warn;

use fusedev::Channel;
use fusedev::Connection;
use fusedev::ConnectionConfig;
use fusedev::Errno;
use fusedev::KernelMessage;
use fusedev::MemInodeCache;
use fusedev::Notifier;
use fusedev::Response;
use fusedev::Task;
use fusedev::consts;
use fusedev::fuse_opcode;

const FILE_INO: u64 = 2;
const RETRIEVE_UNIQUE: u64 = 0x5eed;

#[derive(Parser)]
struct Options {
    /// Number of calling threads
    #[clap(short, long, default_value_t = 4)]
    callers: usize,

    /// Lookups issued by each caller
    #[clap(short, long, default_value_t = 8)]
    requests: usize,

    /// Number of per-node queues
    #[clap(short, long, default_value_t = 2)]
    nodes: usize,
}

fn serve(channel: &Channel, numa_id: usize) {
    let task = Task::new(numa_id);
    let mut buf = vec![0; consts::FUSE_MIN_READ_BUFFER + 4096];
    loop {
        let n = match channel.read(&task, &mut buf) {
            Ok(n) => n,
            Err(Errno::ENODEV) => {
                info!("connection gone, reader {numa_id} exiting");
                return;
            }
            Err(err) => {
                warn!("read failed: {err}");
                return;
            }
        };
        let message = match KernelMessage::try_from(&buf[..n]) {
            Ok(message) => message,
            Err(err) => {
                warn!("bad message: {err}");
                continue;
            }
        };
        let unique = message.unique();
        let reply = match message {
            KernelMessage::Operation(op) => match (op.opcode(), op.name()) {
                (Ok(fuse_opcode::FUSE_LOOKUP), Some(name)) => {
                    let answer = name.to_string_lossy().to_uppercase();
                    Response::new_data(answer.into_bytes())
                }
                _ => Response::new_error(Errno::ENOSYS),
            },
            KernelMessage::Interrupt { target, .. } => {
                info!("interrupt for {target}, ignored");
                continue;
            }
            KernelMessage::Forget { forget, .. } => {
                info!("forget {} x{}", forget.nodeid(), forget.nlookup());
                continue;
            }
            KernelMessage::BatchForget { forgets, .. } => {
                info!("batch of {} forgets", forgets.len());
                continue;
            }
            KernelMessage::NotifyReply { offset, data, .. } => {
                info!(
                    "retrieved {} bytes at {offset}: {:?}",
                    data.len(),
                    String::from_utf8_lossy(data)
                );
                continue;
            }
        };
        if let Err(err) = reply.with_iovec(unique, |iov| channel.writev(&task, iov)) {
            warn!("reply to {unique} failed: {err}");
        }
    }
}

fn lookup(conn: &Connection, task: &Task, name: &str) -> Result<String, Errno> {
    let req = conn.acquire_or_block(task)?;
    {
        let mut body = req.body();
        body.set_opcode(fuse_opcode::FUSE_LOOKUP);
        body.set_nodeid(1);
        let mut arg = name.as_bytes().to_vec();
        arg.push(0);
        body.push_in_arg(arg);
        body.push_out_arg(256);
        body.set_out_argvar(true);
    }
    let res = conn.submit_synchronous(&req, task).map(|()| {
        let body = req.body();
        String::from_utf8_lossy(body.out_arg(0).unwrap_or_default()).into_owned()
    });
    req.release();
    res
}

fn main() {
    let options = Options::parse();
    env_logger::init();

    let config = ConnectionConfig::new().numa_nodes(options.nodes);
    let conn = Connection::new(config).unwrap();
    let cache = MemInodeCache::new();
    cache.insert_inode(FILE_INO, 0);
    conn.attach_inode_cache(cache.clone());
    let channel = Arc::new(Channel::new(conn.clone()));

    // One reader per node: a reader only serves the queue of its own node.
    let readers: Vec<_> = (0..conn.num_nodes())
        .map(|numa_id| {
            let channel = channel.clone();
            thread::spawn(move || serve(&channel, numa_id))
        })
        .collect();

    let callers: Vec<_> = (0..options.callers)
        .map(|i| {
            let conn = conn.clone();
            let requests = options.requests;
            thread::spawn(move || {
                let task = Task::new(i % conn.num_nodes());
                for r in 0..requests {
                    let name = format!("file-{i}-{r}");
                    match lookup(&conn, &task, &name) {
                        Ok(answer) => info!("{name} -> {answer}"),
                        Err(err) => warn!("{name} failed: {err}"),
                    }
                }
                conn.queue_forget(&task, 100 + i as u64, 1);
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }

    let notifier = Notifier::new(channel.clone(), Task::new(0));
    notifier.store(FILE_INO, 0, b"hello from the daemon").unwrap();
    info!(
        "page cache now holds {:?}",
        String::from_utf8_lossy(&cache.read(FILE_INO, 0, 21))
    );
    notifier.retrieve(RETRIEVE_UNIQUE, FILE_INO, 6, 4).unwrap();
    notifier.inval_inode(FILE_INO, 0, 0).unwrap();
    notifier.inval_entry(1, OsStr::new("not-cached")).unwrap();

    conn.abort();
    for reader in readers {
        reader.join().unwrap();
    }
}
