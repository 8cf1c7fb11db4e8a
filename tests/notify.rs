use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::mpsc;

use fusedev::ConnectionConfig;
use fusedev::Errno;
use fusedev::InodeCache;
use fusedev::KernelMessage;
use fusedev::MemInodeCache;
use fusedev::Notifier;
use fusedev::PIPE_DEF_BUFFERS;
use fusedev::Page;
use fusedev::PageFlags;
use fusedev::Pipe;
use fusedev::PollHandle;
use fusedev::PollNotifier;
use fusedev::Response;
use fusedev::SpliceFlags;
use fusedev::Task;
use fusedev::fuse_notify_code;
use fusedev::page_size;

mod common;

use common::*;

const FILE: u64 = 2;

fn notification(code: fuse_notify_code, payload: &[u8]) -> Vec<u8> {
    let mut msg = out_header(OUT_HEADER + payload.len(), code as i32, 0);
    msg.extend_from_slice(payload);
    msg
}

fn store_out(nodeid: u64, offset: u64, size: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&nodeid.to_ne_bytes());
    out.extend_from_slice(&offset.to_ne_bytes());
    out.extend_from_slice(&size.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
    out
}

fn setup() -> (
    Arc<fusedev::Connection>,
    Arc<fusedev::Channel>,
    Arc<MemInodeCache>,
    Notifier,
) {
    let (conn, channel) = connection(ConnectionConfig::new());
    let cache = MemInodeCache::new();
    cache.insert_inode(1, 0);
    cache.insert_inode(FILE, 0);
    conn.attach_inode_cache(cache.clone());
    let notifier = Notifier::new(channel.clone(), Task::new(0));
    (conn, channel, cache, notifier)
}

#[test]
fn store_fills_cache_and_extends_size() {
    let (_conn, _channel, cache, notifier) = setup();
    notifier.store(FILE, 10, b"hello").unwrap();
    assert_eq!(cache.file_size(FILE), Some(15));
    assert_eq!(cache.read(FILE, 10, 5), b"hello");
    assert_eq!(cache.cached_pages(FILE), vec![0]);

    // Spanning two pages, starting mid-page.
    let psize = page_size() as u64;
    let data = vec![9u8; 200];
    notifier.store(FILE, psize - 100, &data).unwrap();
    assert_eq!(cache.file_size(FILE), Some(psize + 100));
    assert_eq!(cache.read(FILE, psize - 100, 200), data);
    assert_eq!(cache.cached_pages(FILE), vec![0, 1]);
    let last = cache.find_page(FILE, 1).unwrap();
    assert!(last.lock().flags().contains(PageFlags::UPTODATE));
}

#[test]
fn store_checks_payload_size() {
    let (_conn, channel, cache, notifier) = setup();
    let task = Task::new(0);
    let mut payload = store_out(FILE, 0, 8);
    payload.extend_from_slice(b"abcd");
    assert_eq!(
        channel.write(&task, &notification(fuse_notify_code::FUSE_NOTIFY_STORE, &payload)),
        Err(Errno::EINVAL)
    );
    assert_eq!(
        channel.write(&task, &notification(fuse_notify_code::FUSE_NOTIFY_STORE, &[0; 8])),
        Err(Errno::EINVAL)
    );
    assert!(cache.cached_pages(FILE).is_empty());

    // An unknown inode is reported to a raw writer but not through the notifier.
    let mut payload = store_out(99, 0, 4);
    payload.extend_from_slice(b"abcd");
    assert_eq!(
        channel.write(&task, &notification(fuse_notify_code::FUSE_NOTIFY_STORE, &payload)),
        Err(Errno::ENOENT)
    );
    notifier.store(99, 0, b"abcd").unwrap();
}

#[test]
fn retrieve_sends_cached_data_back() {
    let (conn, channel, _cache, notifier) = setup();
    let task = Task::new(0);
    notifier.store(FILE, 10, b"hello").unwrap();

    notifier.retrieve(0x77, FILE, 10, 100).unwrap();
    let msg = read_message(&channel, &task);
    match KernelMessage::try_from(&msg[..]).unwrap() {
        KernelMessage::NotifyReply {
            unique,
            nodeid,
            offset,
            data,
        } => {
            assert_eq!(unique, 0x77);
            assert_eq!(nodeid, FILE);
            assert_eq!(offset, 10);
            assert_eq!(data, b"hello");
        }
        other => panic!("unexpected {other:?}"),
    }

    // Past the end of file nothing is sent but the reply still comes.
    notifier.retrieve(0x78, FILE, 100, 10).unwrap();
    let msg = read_message(&channel, &task);
    match KernelMessage::try_from(&msg[..]).unwrap() {
        KernelMessage::NotifyReply { unique, data, .. } => {
            assert_eq!(unique, 0x78);
            assert!(data.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(conn.num_waiting(), 0);
}

#[test]
fn retrieve_of_unknown_inode_is_dropped() {
    let (_conn, channel, _cache, notifier) = setup();
    notifier.retrieve(1, 99, 0, 10).unwrap();
    channel.set_nonblocking(true);
    let mut buf = vec![0; 8192];
    assert_eq!(channel.read(&Task::new(0), &mut buf), Err(Errno::EAGAIN));

    // The payload size is still checked.
    assert_eq!(
        channel.write(
            &Task::new(0),
            &notification(fuse_notify_code::FUSE_NOTIFY_RETRIEVE, &[0; 16])
        ),
        Err(Errno::EINVAL)
    );
}

#[test]
fn inval_inode_drops_pages() {
    let (_conn, channel, cache, notifier) = setup();
    let psize = page_size();
    notifier.store(FILE, 0, &vec![1u8; 3 * psize]).unwrap();
    assert_eq!(cache.cached_pages(FILE), vec![0, 1, 2]);
    notifier.inval_inode(FILE, psize as i64, psize as i64).unwrap();
    assert_eq!(cache.cached_pages(FILE), vec![0, 2]);
    assert!(!cache.attr_valid(FILE));

    let mut payload = Vec::new();
    payload.extend_from_slice(&99u64.to_ne_bytes());
    payload.extend_from_slice(&0i64.to_ne_bytes());
    payload.extend_from_slice(&0i64.to_ne_bytes());
    let msg = notification(fuse_notify_code::FUSE_NOTIFY_INVAL_INODE, &payload);
    assert_eq!(channel.write(&Task::new(0), &msg), Err(Errno::ENOENT));
    notifier.inval_inode(99, 0, 0).unwrap();
}

#[test]
fn cache_notifications_need_a_cache() {
    let (_conn, channel) = connection(ConnectionConfig::new());
    let notifier = Notifier::new(channel.clone(), Task::new(0));
    let mut payload = Vec::new();
    payload.extend_from_slice(&FILE.to_ne_bytes());
    payload.extend_from_slice(&0i64.to_ne_bytes());
    payload.extend_from_slice(&0i64.to_ne_bytes());
    let msg = notification(fuse_notify_code::FUSE_NOTIFY_INVAL_INODE, &payload);
    assert_eq!(channel.write(&Task::new(0), &msg), Err(Errno::ENOENT));
    notifier.retrieve(5, FILE, 0, 10).unwrap();
    channel.set_nonblocking(true);
    let mut buf = vec![0; 8192];
    assert_eq!(channel.read(&Task::new(0), &mut buf), Err(Errno::EAGAIN));
}

#[test]
fn inval_entry_and_delete() {
    let (_conn, _channel, cache, notifier) = setup();
    cache.insert_entry(1, OsStr::new("a"), 5);
    cache.insert_entry(1, OsStr::new("b"), 6);

    notifier.inval_entry(1, OsStr::new("a")).unwrap();
    assert_eq!(cache.lookup(1, OsStr::new("a")), None);

    // The entry no longer names that child: nothing happens.
    notifier.delete(1, 7, OsStr::new("b")).unwrap();
    assert_eq!(cache.lookup(1, OsStr::new("b")), Some(6));
    notifier.delete(1, 6, OsStr::new("b")).unwrap();
    assert_eq!(cache.lookup(1, OsStr::new("b")), None);
}

#[test]
fn entry_names_are_checked() {
    let (_conn, channel, _cache, notifier) = setup();
    let long = "x".repeat(2000);
    let err = notifier.inval_entry(1, OsStr::new(&long)).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENAMETOOLONG));

    // Missing terminator.
    let mut payload = Vec::new();
    payload.extend_from_slice(&1u64.to_ne_bytes());
    payload.extend_from_slice(&1u32.to_ne_bytes());
    payload.extend_from_slice(&0u32.to_ne_bytes());
    payload.push(b'a');
    let msg = notification(fuse_notify_code::FUSE_NOTIFY_INVAL_ENTRY, &payload);
    assert_eq!(channel.write(&Task::new(0), &msg), Err(Errno::EINVAL));
}

#[test]
fn unknown_code_is_rejected() {
    let (_conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    assert_eq!(
        channel.write(&task, &out_header(OUT_HEADER, 99, 0)),
        Err(Errno::EINVAL)
    );
    assert_eq!(
        channel.write(&task, &out_header(OUT_HEADER, -2, 0)),
        Err(Errno::EINVAL)
    );
}

#[test]
fn poll_wakeup_reaches_waiter() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let notifier = Notifier::new(channel, Task::new(0));
    let waiter = conn.register_poll(7);
    assert!(!waiter.is_woken());
    PollNotifier::new(notifier.clone(), PollHandle(7))
        .notify()
        .unwrap();
    assert!(waiter.is_woken());

    // Nobody polls this handle.
    notifier.poll(PollHandle(8)).unwrap();
}

#[test]
fn spliced_store_moves_gifted_page() {
    let (_conn, channel, cache, _notifier) = setup();
    let psize = page_size();
    let old = cache.find_or_create_page(FILE, 0).unwrap();

    let mut header = out_header(
        OUT_HEADER + 24 + psize,
        fuse_notify_code::FUSE_NOTIFY_STORE as i32,
        0,
    );
    header.extend_from_slice(&store_out(FILE, 0, psize as u32));
    let mut pipe = Pipe::new(PIPE_DEF_BUFFERS);
    assert_eq!(pipe.write_bytes(&header), header.len());
    pipe.gift_page(Page::from_bytes(b"gift")).unwrap();

    let len = header.len() + psize;
    assert_eq!(
        channel.splice_write(&Task::new(0), &mut pipe, len, SpliceFlags::MOVE),
        Ok(len)
    );
    let now = cache.find_page(FILE, 0).unwrap();
    assert!(!Arc::ptr_eq(&now, &old));
    assert_eq!(old.lock().mapping(), None);
    assert!(now.lock().flags().contains(PageFlags::UPTODATE));
    assert_eq!(cache.read(FILE, 0, 4), b"gift");
    assert_eq!(cache.file_size(FILE), Some(psize as u64));
}

#[test]
fn retrieved_pages_are_released_after_delivery() {
    let (_conn, channel, cache, notifier) = setup();
    notifier.store(FILE, 0, b"data").unwrap();
    let page = cache.find_page(FILE, 0).unwrap();
    let before = Arc::strong_count(&page);
    notifier.retrieve(3, FILE, 0, 4).unwrap();
    assert!(Arc::strong_count(&page) > before);

    let msg = read_message(&channel, &Task::new(0));
    assert_eq!(unique_of(&msg), 3);
    assert_eq!(Arc::strong_count(&page), before);
}

#[test]
fn store_range_must_fit_in_u64() {
    let (_conn, channel, cache, _notifier) = setup();
    let mut payload = store_out(FILE, u64::MAX - 1, 4);
    payload.extend_from_slice(b"abcd");
    assert_eq!(
        channel.write(
            &Task::new(0),
            &notification(fuse_notify_code::FUSE_NOTIFY_STORE, &payload)
        ),
        Err(Errno::EINVAL)
    );
    assert_eq!(cache.file_size(FILE), Some(0));
    assert!(cache.cached_pages(FILE).is_empty());
}

#[test]
fn inval_inode_range_past_i64_reaches_end_of_file() {
    let (_conn, _channel, cache, notifier) = setup();
    let psize = page_size();
    notifier.store(FILE, 0, &vec![1u8; 3 * psize]).unwrap();

    notifier.inval_inode(FILE, i64::MAX, 2).unwrap();
    assert_eq!(cache.cached_pages(FILE), vec![0, 1, 2]);
    notifier.inval_inode(FILE, psize as i64, i64::MAX).unwrap();
    assert_eq!(cache.cached_pages(FILE), vec![0]);
}

#[test]
fn retrieve_without_cache_sends_nothing() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let notifier = Notifier::new(channel.clone(), Task::new(0));
    notifier.retrieve(9, FILE, 0, 4096).unwrap();
    assert_eq!(conn.num_waiting(), 0);
    channel.set_nonblocking(true);
    let mut buf = vec![0; 8192];
    assert_eq!(channel.read(&Task::new(0), &mut buf), Err(Errno::EAGAIN));
}

#[test]
fn retrieve_unique_may_match_request_in_flight() {
    let (conn, channel) = connection(ConnectionConfig::new().numa_nodes(2));
    let cache = MemInodeCache::new();
    cache.insert_inode(FILE, 0);
    conn.attach_inode_cache(cache);
    let notifier = Notifier::new(channel.clone(), Task::new(0));
    notifier.store(FILE, 0, b"data").unwrap();

    let (tx, rx) = mpsc::channel();
    let unique = background(&conn, &Task::new(1), 5, tx);
    assert_eq!(unique_of(&read_message(&channel, &Task::new(1))), unique);

    // The daemon reuses that unique for a retrieve served on the other node.
    notifier.retrieve(unique, FILE, 0, 4).unwrap();
    let msg = read_message(&channel, &Task::new(0));
    match KernelMessage::try_from(&msg[..]).unwrap() {
        KernelMessage::NotifyReply { unique: u, data, .. } => {
            assert_eq!(u, unique);
            assert_eq!(data, b"data");
        }
        other => panic!("unexpected {other:?}"),
    }

    // The request is still found from either node.
    assert_eq!(
        reply(&channel, &Task::new(0), unique, Response::new_empty()),
        Ok(OUT_HEADER)
    );
    assert_eq!(rx.try_recv().unwrap(), (unique, Ok(())));
}
