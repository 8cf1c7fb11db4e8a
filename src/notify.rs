//! Unsolicited messages from the daemon.
//!
//! A write whose header carries unique 0 is a notification: the header's error field holds
//! the [`fuse_notify_code`] and the payload follows. Each kind checks its payload size
//! exactly. Failures come back as the write's result and never affect the connection.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use log::debug;
use log::warn;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

use crate::cache::InodeCache;
use crate::connection::Connection;
use crate::copy::CopyState;
use crate::ll::Errno;
use crate::ll::fuse_abi as abi;
use crate::ll::fuse_abi::fuse_notify_code;
use crate::ll::fuse_abi::fuse_opcode;
use crate::page::PageFlags;
use crate::page::page_size;
use crate::task::Task;

/// Handle the notification `code` whose payload of `size` bytes is next in `cs`.
pub(crate) fn dispatch(
    conn: &Connection,
    code: i32,
    size: usize,
    cs: &mut CopyState<'_>,
    task: &Task,
) -> Result<(), Errno> {
    let code = u32::try_from(code)
        .ok()
        .and_then(|c| fuse_notify_code::try_from(c).ok())
        .ok_or_else(|| {
            warn!("unknown notification code {code}");
            Errno::EINVAL
        })?;
    debug!("notification {code:?} ({size} bytes)");
    let res = match code {
        fuse_notify_code::FUSE_POLL => poll(conn, size, cs),
        fuse_notify_code::FUSE_NOTIFY_INVAL_INODE => inval_inode(conn, size, cs),
        fuse_notify_code::FUSE_NOTIFY_INVAL_ENTRY => inval_entry(conn, size, cs),
        fuse_notify_code::FUSE_NOTIFY_STORE => store(conn, size, cs),
        fuse_notify_code::FUSE_NOTIFY_RETRIEVE => retrieve(conn, size, cs, task),
        fuse_notify_code::FUSE_NOTIFY_DELETE => delete(conn, size, cs),
    };
    cs.finish();
    res
}

/// Read a fixed-size payload that must make up the whole notification.
fn read_exact<T: FromBytes + IntoBytes>(
    size: usize,
    cs: &mut CopyState<'_>,
) -> Result<T, Errno> {
    if size != size_of::<T>() {
        return Err(Errno::EINVAL);
    }
    let mut out = T::new_zeroed();
    cs.copy_one_in(out.as_mut_bytes())?;
    Ok(out)
}

fn cache(conn: &Connection) -> Result<Arc<dyn InodeCache>, Errno> {
    conn.inode_cache().ok_or(Errno::ENOENT)
}

fn poll(conn: &Connection, size: usize, cs: &mut CopyState<'_>) -> Result<(), Errno> {
    let out: abi::fuse_notify_poll_wakeup_out = read_exact(size, cs)?;
    let state = conn.shared.lock().polled.get(&out.kh).cloned();
    match state {
        Some(state) => state.wake(),
        None => debug!("no poll waiter for handle {}", out.kh),
    }
    Ok(())
}

fn inval_inode(conn: &Connection, size: usize, cs: &mut CopyState<'_>) -> Result<(), Errno> {
    let out: abi::fuse_notify_inval_inode_out = read_exact(size, cs)?;
    cache(conn)?.inval_inode(out.ino, out.off, out.len)
}

/// Read a name of `namelen` bytes plus its terminator, filling the rest of the payload.
fn read_name(
    cs: &mut CopyState<'_>,
    size: usize,
    fixed: usize,
    namelen: u32,
) -> Result<Vec<u8>, Errno> {
    let namelen = namelen as usize;
    if namelen > abi::FUSE_NAME_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    if size != fixed + namelen + 1 {
        return Err(Errno::EINVAL);
    }
    let mut name = vec![0; namelen + 1];
    cs.copy_one_in(&mut name)?;
    name.truncate(namelen);
    Ok(name)
}

fn inval_entry(conn: &Connection, size: usize, cs: &mut CopyState<'_>) -> Result<(), Errno> {
    let fixed = size_of::<abi::fuse_notify_inval_entry_out>();
    if size < fixed {
        return Err(Errno::EINVAL);
    }
    let mut out = abi::fuse_notify_inval_entry_out::new_zeroed();
    cs.copy_one_in(out.as_mut_bytes())?;
    let name = read_name(cs, size, fixed, out.namelen)?;
    cache(conn)?.inval_entry(out.parent, OsStr::from_bytes(&name), None)
}

fn delete(conn: &Connection, size: usize, cs: &mut CopyState<'_>) -> Result<(), Errno> {
    let fixed = size_of::<abi::fuse_notify_delete_out>();
    if size < fixed {
        return Err(Errno::EINVAL);
    }
    let mut out = abi::fuse_notify_delete_out::new_zeroed();
    cs.copy_one_in(out.as_mut_bytes())?;
    let name = read_name(cs, size, fixed, out.namelen)?;
    cache(conn)?.inval_entry(out.parent, OsStr::from_bytes(&name), Some(out.child))
}

fn store(conn: &Connection, size: usize, cs: &mut CopyState<'_>) -> Result<(), Errno> {
    let fixed = size_of::<abi::fuse_notify_store_out>();
    if size < fixed {
        return Err(Errno::EINVAL);
    }
    let mut out = abi::fuse_notify_store_out::new_zeroed();
    cs.copy_one_in(out.as_mut_bytes())?;
    if size - fixed != out.size as usize {
        return Err(Errno::EINVAL);
    }

    let cache = cache(conn)?;
    let mut file_size = cache.file_size(out.nodeid).ok_or(Errno::ENOENT)?;
    cs.set_cache(Some(cache.clone()));

    let psize = page_size();
    let end = out
        .offset
        .checked_add(u64::from(out.size))
        .ok_or(Errno::EINVAL)?;
    if end > file_size {
        file_size = end;
        cache.set_file_size(out.nodeid, file_size);
    }

    let mut index = out.offset / psize as u64;
    let mut offset = (out.offset % psize as u64) as usize;
    let mut num = out.size as usize;
    while num > 0 {
        let mut page = cache.find_or_create_page(out.nodeid, index)?;
        let this_num = num.min(psize - offset);
        cs.copy_page(&mut page, offset, this_num, false)?;
        if offset == 0 && (this_num == psize || file_size == end) {
            page.lock().set_flags(PageFlags::UPTODATE, true);
        }
        num -= this_num;
        offset = 0;
        index += 1;
    }
    debug!("stored {} bytes at {} of inode {}", out.size, out.offset, out.nodeid);
    Ok(())
}

fn retrieve(
    conn: &Connection,
    size: usize,
    cs: &mut CopyState<'_>,
    task: &Task,
) -> Result<(), Errno> {
    let out: abi::fuse_notify_retrieve_out = read_exact(size, cs)?;
    cs.finish();

    let Some(cache) = conn.inode_cache() else {
        warn!("retrieve of inode {} without an inode cache", out.nodeid);
        return Ok(());
    };
    let Some(file_size) = cache.file_size(out.nodeid) else {
        debug!("retrieve of uncached inode {}", out.nodeid);
        return Ok(());
    };

    let req = conn.acquire_or_block(task)?;
    let psize = page_size();
    let page_offset = (out.offset % psize as u64) as usize;
    let mut offset = page_offset;
    let mut index = out.offset / psize as u64;
    let mut num = if out.offset > file_size {
        0
    } else {
        (file_size - out.offset).min(u64::from(out.size)) as usize
    };

    let mut pages = Vec::new();
    let mut total_len = 0;
    while num > 0 && pages.len() < abi::FUSE_MAX_PAGES_PER_REQ {
        let Some(page) = cache.find_page(out.nodeid, index) else {
            break;
        };
        let this_num = num.min(psize - offset);
        pages.push(page);
        total_len += this_num;
        num -= this_num;
        offset = 0;
        index += 1;
    }

    {
        let mut body = req.body();
        body.set_opcode(fuse_opcode::FUSE_NOTIFY_REPLY);
        body.set_nodeid(out.nodeid);
        let arg = abi::fuse_notify_retrieve_in {
            offset: out.offset,
            size: total_len as u32,
            ..Default::default()
        };
        body.push_in_arg(arg.as_bytes());
        body.set_in_pages(pages, page_offset, total_len);
    }
    debug!(
        "retrieving {total_len} bytes at {} of inode {} for {}",
        out.offset, out.nodeid, out.notify_unique
    );
    conn.send_notify_reply(
        req,
        out.notify_unique,
        Some(Box::new(|req| req.body().pages.clear())),
    )
}
