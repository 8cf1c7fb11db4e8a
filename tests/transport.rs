use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;

use fusedev::ConnectionConfig;
use fusedev::Errno;
use fusedev::ForgetOne;
use fusedev::KernelMessage;
use fusedev::PIPE_DEF_BUFFERS;
use fusedev::Page;
use fusedev::PageRef;
use fusedev::Pipe;
use fusedev::PollEvents;
use fusedev::Request;
use fusedev::RequestState;
use fusedev::Response;
use fusedev::Signal;
use fusedev::SpliceFlags;
use fusedev::Task;
use fusedev::fuse_opcode;
use fusedev::page_size;

mod common;

use common::*;

#[test]
fn delivered_in_submission_order() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    let (tx, rx) = mpsc::channel();
    let uniques: Vec<u64> = (1..=5)
        .map(|nodeid| background(&conn, &task, nodeid, tx.clone()))
        .collect();
    assert!(uniques.windows(2).all(|w| w[0] < w[1]));

    let mut delivered = Vec::new();
    for nodeid in 1..=5 {
        let msg = read_message(&channel, &task);
        assert_eq!(msg.len(), IN_HEADER);
        assert_eq!(nodeid_of(&msg), nodeid);
        delivered.push(unique_of(&msg));
    }
    assert_eq!(delivered, uniques);

    // Nothing is delivered twice.
    channel.set_nonblocking(true);
    let mut buf = vec![0; 8192];
    assert_eq!(channel.read(&task, &mut buf), Err(Errno::EAGAIN));

    for unique in uniques.iter().rev() {
        assert_eq!(
            reply(&channel, &task, *unique, Response::new_empty()),
            Ok(OUT_HEADER)
        );
    }
    let done: Vec<Completion> = rx.try_iter().collect();
    assert_eq!(done.len(), 5);
    assert_eq!(done[0], (uniques[4], Ok(())));
    assert!(done.iter().all(|(_, res)| res.is_ok()));
    assert_eq!(conn.num_waiting(), 0);
}

#[test]
fn synchronous_round_trip() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let caller = {
        let conn = conn.clone();
        thread::spawn(move || {
            let task = Task::new(0);
            let req = conn.acquire_or_block(&task).unwrap();
            {
                let mut body = req.body();
                body.set_opcode(fuse_opcode::FUSE_LOOKUP);
                body.set_nodeid(1);
                body.push_in_arg(b"foo\0".to_vec());
                body.push_out_arg(3);
            }
            let res = conn.submit_synchronous(&req, &task);
            let out = req.body().out_arg(0).map(<[u8]>::to_vec);
            req.release();
            (res, out)
        })
    };

    let task = Task::new(0);
    let msg = read_message(&channel, &task);
    let unique = match KernelMessage::try_from(&msg[..]).unwrap() {
        KernelMessage::Operation(op) => {
            assert_eq!(op.opcode(), Ok(fuse_opcode::FUSE_LOOKUP));
            assert_eq!(op.name(), Some(OsStr::new("foo")));
            op.header().unique()
        }
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(
        reply(&channel, &task, unique, Response::new_data(b"FOO".to_vec())),
        Ok(OUT_HEADER + 3)
    );
    let (res, out) = caller.join().unwrap();
    assert_eq!(res, Ok(()));
    assert_eq!(out.as_deref(), Some(&b"FOO"[..]));

    // Answered requests can't be answered again.
    assert_eq!(
        reply(&channel, &task, unique, Response::new_empty()),
        Err(Errno::ENOENT)
    );
    assert_eq!(conn.num_waiting(), 0);
}

#[test]
fn daemon_error_reaches_caller() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let caller = {
        let conn = conn.clone();
        thread::spawn(move || {
            let task = Task::new(0);
            let req = getattr(&conn, &task, 7);
            let res = conn.submit_synchronous(&req, &task);
            req.release();
            res
        })
    };
    let task = Task::new(0);
    let unique = unique_of(&read_message(&channel, &task));
    reply(&channel, &task, unique, Response::new_error(Errno::ENOENT)).unwrap();
    assert_eq!(caller.join().unwrap(), Err(Errno::ENOENT));
}

#[test]
fn malformed_replies_are_refused() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    let (tx, rx) = mpsc::channel();
    let unique = background(&conn, &task, 1, tx);
    read_message(&channel, &task);

    // Shorter than a header.
    assert_eq!(channel.write(&task, &[0; 8]), Err(Errno::EINVAL));
    // Length field disagrees with the write size.
    let mut msg = out_header(OUT_HEADER + 4, 0, unique);
    assert_eq!(channel.write(&task, &msg), Err(Errno::EINVAL));
    msg.extend_from_slice(&[0; 8]);
    assert_eq!(channel.write(&task, &msg), Err(Errno::EINVAL));
    // Error codes must be negative errnos.
    assert_eq!(
        channel.write(&task, &out_header(OUT_HEADER, 5, unique)),
        Err(Errno::EINVAL)
    );
    assert_eq!(
        channel.write(&task, &out_header(OUT_HEADER, -5000, unique)),
        Err(Errno::EINVAL)
    );
    // Unknown unique.
    assert_eq!(
        reply(&channel, &task, unique + 1000, Response::new_empty()),
        Err(Errno::ENOENT)
    );
    // None of the above touched the outstanding request.
    assert!(rx.try_recv().is_err());
    reply(&channel, &task, unique, Response::new_empty()).unwrap();
    assert_eq!(rx.try_recv().unwrap(), (unique, Ok(())));
}

#[test]
fn reply_larger_than_declared_fails_request() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    let req = conn.acquire_or_block(&task).unwrap();
    req.body().push_out_arg(4);
    let (tx, rx) = mpsc::channel();
    conn.submit_background(
        req,
        Some(Box::new(move |r: &Request| {
            let _ = tx.send(r.result());
        })),
    );
    let unique = unique_of(&read_message(&channel, &task));
    assert_eq!(
        reply(&channel, &task, unique, Response::new_data(vec![1u8; 8])),
        Err(Errno::EINVAL)
    );
    assert_eq!(rx.try_recv().unwrap(), Err(Errno::EIO));
}

#[test]
fn oversized_request_fails_without_consuming_buffer() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    let (tx, rx) = mpsc::channel();
    for opcode in [fuse_opcode::FUSE_SETXATTR, fuse_opcode::FUSE_WRITE] {
        let req = conn.acquire_or_block(&task).unwrap();
        {
            let mut body = req.body();
            body.set_opcode(opcode);
            body.set_nodeid(2);
            body.push_in_arg(vec![7u8; 64]);
        }
        let tx = tx.clone();
        conn.submit_background(
            req,
            Some(Box::new(move |r: &Request| {
                let _ = tx.send(r.result());
            })),
        );
        let mut buf = vec![0u8; IN_HEADER + 64 - 1];
        assert_eq!(channel.read(&task, &mut buf), Ok(0));
        assert!(buf.iter().all(|b| *b == 0));
    }
    let results: Vec<_> = rx.try_iter().collect();
    assert_eq!(results, vec![Err(Errno::E2BIG), Err(Errno::EIO)]);
}

#[test]
fn admission_blocks_until_completion() {
    let (conn, channel) = connection(ConnectionConfig::new().max_background(2));
    let task = Task::new(0);
    let (tx, rx) = mpsc::channel();
    let first = background(&conn, &task, 1, tx.clone());

    // Two requests acquired before the limit is reached, submitted concurrently.
    let submitters: Vec<_> = [2, 3]
        .into_iter()
        .map(|nodeid| {
            let req = getattr(&conn, &task, nodeid);
            let conn = conn.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                conn.submit_background(
                    req,
                    Some(Box::new(move |r: &Request| {
                        let _ = tx.send((r.unique(), r.result()));
                    })),
                );
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }
    assert!(conn.is_congested());

    let (admitted_tx, admitted_rx) = mpsc::channel();
    let waiter = {
        let conn = conn.clone();
        thread::spawn(move || {
            let task = Task::new(0);
            let res = conn.acquire_or_block(&task);
            let ok = res.is_ok();
            if let Ok(req) = res {
                req.release();
            }
            admitted_tx.send(ok).unwrap();
        })
    };
    assert_eq!(
        admitted_rx.recv_timeout(Duration::from_millis(200)),
        Err(RecvTimeoutError::Timeout)
    );

    // Only max_background requests are handed to the daemon at once.
    let m1 = unique_of(&read_message(&channel, &task));
    let m2 = unique_of(&read_message(&channel, &task));
    assert_eq!(m1, first);
    channel.set_nonblocking(true);
    let mut buf = vec![0; 8192];
    assert_eq!(channel.read(&task, &mut buf), Err(Errno::EAGAIN));

    reply(&channel, &task, m1, Response::new_empty()).unwrap();
    let n = channel.read(&task, &mut buf).unwrap();
    let m3 = unique_of(&buf[..n]);
    assert_eq!(
        admitted_rx.recv_timeout(Duration::from_millis(100)),
        Err(RecvTimeoutError::Timeout)
    );

    reply(&channel, &task, m2, Response::new_empty()).unwrap();
    assert_eq!(admitted_rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    waiter.join().unwrap();

    reply(&channel, &task, m3, Response::new_empty()).unwrap();
    assert_eq!(rx.try_iter().count(), 3);
    assert!(!conn.is_congested());
    assert_eq!(conn.num_waiting(), 0);
}

#[test]
fn forgets_are_batched() {
    let (conn, channel) = connection(ConnectionConfig::new().proto_minor(16));
    let task = Task::new(0);
    let expected: Vec<ForgetOne> = (0..17).map(|i| ForgetOne::new(100 + i, i + 1)).collect();
    for forget in &expected {
        conn.queue_forget(&task, forget.nodeid(), forget.nlookup());
    }

    // Header, batch header and room for five entries.
    let mut buf = vec![0; IN_HEADER + 8 + 5 * 16];
    let mut got = Vec::new();
    let mut sizes = Vec::new();
    while got.len() < expected.len() {
        let n = channel.read(&task, &mut buf).unwrap();
        match KernelMessage::try_from(&buf[..n]).unwrap() {
            KernelMessage::BatchForget { forgets, .. } => {
                sizes.push(forgets.len());
                got.extend(forgets);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(sizes, vec![5, 5, 5, 2]);
    assert_eq!(got, expected);
}

#[test]
fn old_protocol_gets_single_forgets() {
    let (conn, channel) = connection(ConnectionConfig::new().proto_minor(15));
    let task = Task::new(0);
    for nodeid in 1..=3 {
        conn.queue_forget(&task, nodeid, 2);
    }
    for nodeid in 1..=3 {
        let msg = read_message(&channel, &task);
        match KernelMessage::try_from(&msg[..]).unwrap() {
            KernelMessage::Forget { forget, .. } => {
                assert_eq!(forget, ForgetOne::new(nodeid, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn interrupt_is_delivered_and_requeued() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let caller_task = Task::new(0);
    let caller = {
        let conn = conn.clone();
        let task = caller_task.clone();
        thread::spawn(move || {
            let req = getattr(&conn, &task, 4);
            let res = conn.submit_synchronous(&req, &task);
            let interrupted = req.is_interrupted();
            req.release();
            (res, interrupted)
        })
    };

    let task = Task::new(0);
    let unique = unique_of(&read_message(&channel, &task));
    caller_task.send_signal(Signal::Interrupt);

    let first = match KernelMessage::try_from(&read_message(&channel, &task)[..]).unwrap() {
        KernelMessage::Interrupt { unique: intr, target } => {
            assert_eq!(target, unique);
            intr
        }
        other => panic!("unexpected {other:?}"),
    };
    // An interrupt reply must be a bare header.
    assert_eq!(
        reply(&channel, &task, first, Response::new_data(vec![0u8; 4])),
        Err(Errno::EINVAL)
    );
    // EAGAIN asks for the interrupt again.
    reply(&channel, &task, first, Response::new_error(Errno::EAGAIN)).unwrap();
    let second = match KernelMessage::try_from(&read_message(&channel, &task)[..]).unwrap() {
        KernelMessage::Interrupt { unique: intr, target } => {
            assert_eq!(target, unique);
            intr
        }
        other => panic!("unexpected {other:?}"),
    };
    assert_ne!(second, first);

    reply(&channel, &task, unique, Response::new_error(Errno::EINTR)).unwrap();
    assert_eq!(caller.join().unwrap(), (Err(Errno::EINTR), true));
    // The interrupt went away with its request.
    assert_eq!(
        reply(&channel, &task, second, Response::new_empty()),
        Err(Errno::ENOENT)
    );
}

#[test]
fn enosys_disables_interrupts() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let caller_task = Task::new(0);
    let caller = {
        let conn = conn.clone();
        let task = caller_task.clone();
        thread::spawn(move || {
            let req = getattr(&conn, &task, 4);
            let res = conn.submit_synchronous(&req, &task);
            req.release();
            res
        })
    };
    let task = Task::new(0);
    let unique = unique_of(&read_message(&channel, &task));
    caller_task.send_signal(Signal::Interrupt);
    let intr = unique_of(&read_message(&channel, &task));
    assert_ne!(intr, unique);
    assert!(!conn.no_interrupt());
    reply(&channel, &task, intr, Response::new_error(Errno::ENOSYS)).unwrap();
    assert!(conn.no_interrupt());
    reply(&channel, &task, unique, Response::new_empty()).unwrap();
    assert_eq!(caller.join().unwrap(), Ok(()));
}

#[test]
fn fatal_signal_withdraws_unsent_request() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    task.send_signal(Signal::Kill);
    let req = getattr(&conn, &task, 1);
    assert_eq!(conn.submit_synchronous(&req, &task), Err(Errno::EINTR));
    assert_eq!(req.state(), RequestState::Finished);
    assert_eq!(req.refcount(), 1);
    req.release();
    assert_eq!(conn.num_waiting(), 0);

    channel.set_nonblocking(true);
    let mut buf = vec![0; 8192];
    assert_eq!(channel.read(&Task::new(0), &mut buf), Err(Errno::EAGAIN));
}

#[test]
fn abort_ends_everything() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    let (tx, rx) = mpsc::channel();
    let sent = background(&conn, &task, 1, tx.clone());
    assert_eq!(unique_of(&read_message(&channel, &task)), sent);
    background(&conn, &task, 2, tx.clone());
    background(&conn, &task, 3, tx);
    conn.queue_forget(&task, 9, 1);

    let poll = conn.register_poll(42);
    let events = conn.subscribe_async();
    conn.abort();

    let done: Vec<Completion> = rx.try_iter().collect();
    assert_eq!(done.len(), 3);
    assert!(done.iter().all(|(_, res)| *res == Err(Errno::ECONNABORTED)));
    assert!(poll.wait(Duration::from_secs(1)));
    assert!(events.try_iter().any(|e| e == PollEvents::POLLIN));

    assert!(!conn.connected());
    assert_eq!(conn.poll_mask(), PollEvents::POLLERR);
    assert_eq!(conn.acquire_or_block(&task).unwrap_err(), Errno::ENOTCONN);
    let mut buf = vec![0; 8192];
    assert_eq!(channel.read(&task, &mut buf), Err(Errno::ENODEV));
    assert_eq!(
        reply(&channel, &task, sent, Response::new_empty()),
        Err(Errno::ENOENT)
    );

    // A second abort finds nothing to do.
    conn.abort();
    assert_eq!(conn.num_waiting(), 0);
}

#[test]
fn abort_wakes_sleepers() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let caller = {
        let conn = conn.clone();
        thread::spawn(move || {
            let task = Task::new(0);
            let req = getattr(&conn, &task, 1);
            let res = conn.submit_synchronous(&req, &task);
            req.release();
            res
        })
    };
    let task = Task::new(0);
    read_message(&channel, &task);

    let reader = {
        let channel = channel.clone();
        thread::spawn(move || {
            let mut buf = vec![0; 8192];
            channel.read(&Task::new(0), &mut buf)
        })
    };
    let poller = {
        let channel = channel.clone();
        thread::spawn(move || channel.poll_wait(None))
    };
    thread::sleep(Duration::from_millis(50));
    conn.abort();

    assert_eq!(caller.join().unwrap(), Err(Errno::ECONNABORTED));
    assert_eq!(reader.join().unwrap(), Err(Errno::ENODEV));
    assert_eq!(poller.join().unwrap(), PollEvents::POLLERR);
}

#[test]
fn release_ends_queued_requests() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    let (tx, rx) = mpsc::channel();
    let sent = background(&conn, &task, 1, tx.clone());
    read_message(&channel, &task);
    let queued = background(&conn, &task, 2, tx);

    channel.release();
    let mut done: Vec<Completion> = rx.try_iter().collect();
    done.sort_by_key(|(unique, _)| *unique);
    assert_eq!(
        done,
        vec![
            (sent, Err(Errno::ECONNABORTED)),
            (queued, Err(Errno::ECONNABORTED))
        ]
    );
    let mut buf = vec![0; 8192];
    assert_eq!(channel.read(&task, &mut buf), Err(Errno::ENODEV));
}

#[test]
fn requests_stay_on_their_node() {
    let (conn, channel) = connection(ConnectionConfig::new().numa_nodes(2));
    let (tx, rx) = mpsc::channel();
    let unique = background(&conn, &Task::new(1), 5, tx);

    channel.set_nonblocking(true);
    let mut buf = vec![0; 8192];
    assert_eq!(channel.read(&Task::new(0), &mut buf), Err(Errno::EAGAIN));
    let n = channel.read(&Task::new(1), &mut buf).unwrap();
    assert_eq!(unique_of(&buf[..n]), unique);

    // The reply may come from a thread on another node.
    reply(&channel, &Task::new(0), unique, Response::new_empty()).unwrap();
    assert_eq!(rx.try_recv().unwrap(), (unique, Ok(())));
}

#[test]
fn poll_reports_queued_work() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let idle = PollEvents::POLLOUT | PollEvents::POLLWRNORM;
    let events = conn.subscribe_async();
    assert_eq!(channel.poll(), idle);
    assert_eq!(channel.poll_wait(Some(Duration::from_millis(20))), idle);

    let waiter = {
        let channel = channel.clone();
        thread::spawn(move || channel.poll_wait(None))
    };
    thread::sleep(Duration::from_millis(50));
    conn.queue_forget(&Task::new(0), 1, 1);
    let mask = waiter.join().unwrap();
    assert!(mask.contains(PollEvents::POLLIN | PollEvents::POLLRDNORM));
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)),
        Ok(PollEvents::POLLIN)
    );
}

#[test]
fn reserved_request_is_shared_by_waiting() {
    let (conn, _channel) = connection(ConnectionConfig::new().max_requests(Some(0)));
    let file = conn.open_file();
    let held = conn.acquire_nofail(&file, &Task::new(0));
    let held_unique = held.unique();
    let (tx, rx) = mpsc::channel();
    thread::scope(|s| {
        let conn = &conn;
        let file = &file;
        s.spawn(move || {
            let req = conn.acquire_nofail(file, &Task::new(0));
            tx.send(req.unique()).unwrap();
            req.release();
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );
        held.release();
        let unique = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(unique, held_unique);
    });
    assert!(file.reserved_available());
}

#[test]
fn splice_read_shares_pages() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    let psize = page_size();
    let data: Vec<u8> = (0..psize + 100).map(|i| (i % 251) as u8).collect();
    let pages: Vec<PageRef> = data
        .chunks(psize)
        .map(|c| Page::from_bytes(c).into_ref())
        .collect();

    let req = conn.acquire_or_block(&task).unwrap();
    {
        let mut body = req.body();
        body.set_opcode(fuse_opcode::FUSE_WRITE);
        body.set_nodeid(3);
        body.push_in_arg(vec![1u8; 8]);
        body.set_in_pages(pages.clone(), 0, data.len());
    }
    let (tx, rx) = mpsc::channel();
    conn.submit_background(
        req,
        Some(Box::new(move |r: &Request| {
            let _ = tx.send((r.unique(), r.result()));
        })),
    );

    let mut pipe = Pipe::new(PIPE_DEF_BUFFERS);
    let n = channel
        .splice_read(&task, &mut pipe, 1 << 20, SpliceFlags::empty())
        .unwrap();
    assert_eq!(n, IN_HEADER + 8 + data.len());
    assert!(pipe.buffers().any(|b| Arc::ptr_eq(b.page(), &pages[0])));

    let bytes = pipe.read_to_vec();
    let unique = match KernelMessage::try_from(&bytes[..]).unwrap() {
        KernelMessage::Operation(op) => {
            assert_eq!(op.payload()[..8], [1u8; 8]);
            assert_eq!(&op.payload()[8..], &data[..]);
            op.header().unique()
        }
        other => panic!("unexpected {other:?}"),
    };
    reply(&channel, &task, unique, Response::new_empty()).unwrap();
    assert_eq!(rx.try_recv().unwrap(), (unique, Ok(())));
}

#[test]
fn splice_read_needs_a_reader() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    conn.queue_forget(&task, 1, 1);
    let mut pipe = Pipe::new(PIPE_DEF_BUFFERS);
    pipe.close_read_end();
    assert_eq!(
        channel.splice_read(&task, &mut pipe, 8192, SpliceFlags::empty()),
        Err(Errno::EPIPE)
    );
}

#[test]
fn splice_write_moves_gifted_page() {
    let (conn, channel) = connection(ConnectionConfig::new());
    let task = Task::new(0);
    let psize = page_size();
    let placeholder = Page::new().into_ref();

    let req = conn.acquire_or_block(&task).unwrap();
    {
        let mut body = req.body();
        body.set_opcode(fuse_opcode::FUSE_READ);
        body.set_nodeid(3);
        body.set_out_pages(vec![placeholder.clone()], 0, psize);
        body.set_page_replace(true);
    }
    let (tx, rx) = mpsc::channel();
    conn.submit_background(
        req,
        Some(Box::new(move |r: &Request| {
            let body = r.body();
            let page = body.pages()[0].clone();
            let data = page.lock().data()[..5].to_vec();
            let _ = tx.send((r.result(), page, data));
        })),
    );
    let unique = unique_of(&read_message(&channel, &task));

    let mut pipe = Pipe::new(PIPE_DEF_BUFFERS);
    pipe.write_bytes(&out_header(OUT_HEADER + psize, 0, unique));
    pipe.gift_page(Page::from_bytes(b"moved")).unwrap();
    assert_eq!(
        channel.splice_write(&task, &mut pipe, OUT_HEADER + psize, SpliceFlags::MOVE),
        Ok(OUT_HEADER + psize)
    );
    let (res, page, data) = rx.try_recv().unwrap();
    assert_eq!(res, Ok(()));
    assert!(!Arc::ptr_eq(&page, &placeholder));
    assert_eq!(data, b"moved");
}

#[test]
fn splice_write_needs_enough_bytes() {
    let (_conn, channel) = connection(ConnectionConfig::new());
    let mut pipe = Pipe::new(PIPE_DEF_BUFFERS);
    pipe.write_bytes(&out_header(OUT_HEADER, 0, 1));
    assert_eq!(
        channel.splice_write(&Task::new(0), &mut pipe, 64, SpliceFlags::empty()),
        Err(Errno::EINVAL)
    );
}

#[test]
fn failed_setup_refuses_requests() {
    let (conn, _channel) = connection(ConnectionConfig::new());
    conn.set_conn_error();
    let task = Task::new(0);
    let req = getattr(&conn, &task, 1);
    assert_eq!(conn.submit_synchronous(&req, &task), Err(Errno::ECONNREFUSED));
    req.release();
    assert_eq!(conn.num_waiting(), 0);
}

#[test]
fn raising_background_limit_flushes_staged_requests() {
    let (conn, channel) = connection(ConnectionConfig::new().max_background(1));
    let task = Task::new(0);
    let requests = [getattr(&conn, &task, 1), getattr(&conn, &task, 2)];
    let (first, second) = (requests[0].unique(), requests[1].unique());
    for req in requests {
        conn.submit_background(req, None);
    }
    assert_eq!(unique_of(&read_message(&channel, &task)), first);

    channel.set_nonblocking(true);
    let mut buf = vec![0; 8192];
    assert_eq!(channel.read(&task, &mut buf), Err(Errno::EAGAIN));
    conn.set_max_background(2);
    let n = channel.read(&task, &mut buf).unwrap();
    assert_eq!(unique_of(&buf[..n]), second);
}
