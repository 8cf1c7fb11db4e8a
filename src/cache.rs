//! The page cache and inode table the notification dispatcher operates on.
//!
//! The transport never owns file data. Notifications that touch cached state go through
//! [`InodeCache`], which a filesystem layer implements over its real caches.
//! [`MemInodeCache`] is a self-contained implementation backed by hash maps.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ll::Errno;
use crate::page::Page;
use crate::page::PageFlags;
use crate::page::PageIndex;
use crate::page::PageRef;
use crate::page::page_size;

/// Cached inode and page state, as seen by out-of-band notifications.
pub trait InodeCache: Send + Sync {
    /// Drop cached attributes of `ino` and, when `offset >= 0`, cached pages from `offset`
    /// for `len` bytes (`len <= 0` meaning to end of file).
    fn inval_inode(&self, ino: u64, offset: i64, len: i64) -> Result<(), Errno>;

    /// Drop the cached entry `name` under `parent`. When `child` is given, the entry must
    /// currently resolve to that inode.
    fn inval_entry(&self, parent: u64, name: &OsStr, child: Option<u64>) -> Result<(), Errno>;

    /// Size of `ino`, or `None` when the inode is not cached.
    fn file_size(&self, ino: u64) -> Option<u64>;

    /// Record a new size for `ino`.
    fn set_file_size(&self, ino: u64, size: u64);

    /// The cached page at `index` of `ino`, created empty if absent.
    fn find_or_create_page(&self, ino: u64, index: u64) -> Result<PageRef, Errno>;

    /// The cached page at `index` of `ino`, if present.
    fn find_page(&self, ino: u64, index: u64) -> Option<PageRef>;

    /// Put `new` in the cache slot `at`, in place of whatever page is there.
    fn replace_page(&self, at: PageIndex, new: PageRef) -> Result<(), Errno>;
}

#[derive(Debug, Default)]
struct MemInode {
    size: u64,
    pages: BTreeMap<u64, PageRef>,
    attr_valid: bool,
}

#[derive(Debug, Default)]
struct MemState {
    inodes: HashMap<u64, MemInode>,
    entries: HashMap<(u64, OsString), u64>,
}

/// An [`InodeCache`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemInodeCache {
    state: Mutex<MemState>,
}

impl MemInodeCache {
    /// An empty cache.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add (or resize) an inode.
    pub fn insert_inode(&self, ino: u64, size: u64) {
        let mut state = self.state.lock();
        let inode = state.inodes.entry(ino).or_default();
        inode.size = size;
        inode.attr_valid = true;
    }

    /// Add a directory entry.
    pub fn insert_entry(&self, parent: u64, name: &OsStr, child: u64) {
        self.state
            .lock()
            .entries
            .insert((parent, name.to_os_string()), child);
    }

    /// Child inode of a cached entry.
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Option<u64> {
        self.state
            .lock()
            .entries
            .get(&(parent, name.to_os_string()))
            .copied()
    }

    /// Whether the attributes of `ino` are cached and valid.
    pub fn attr_valid(&self, ino: u64) -> bool {
        self.state
            .lock()
            .inodes
            .get(&ino)
            .is_some_and(|i| i.attr_valid)
    }

    /// Indices of cached pages of `ino`.
    pub fn cached_pages(&self, ino: u64) -> Vec<u64> {
        self.state
            .lock()
            .inodes
            .get(&ino)
            .map(|i| i.pages.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Read `len` bytes of cached data from `offset`; missing pages read as zeros.
    pub fn read(&self, ino: u64, offset: u64, len: usize) -> Vec<u8> {
        let pages: Vec<(u64, PageRef)> = {
            let state = self.state.lock();
            match state.inodes.get(&ino) {
                Some(inode) => inode
                    .pages
                    .iter()
                    .map(|(k, v)| (*k, v.clone()))
                    .collect(),
                None => return vec![0; len],
            }
        };
        let psize = page_size() as u64;
        let mut out = vec![0; len];
        for (index, page) in pages {
            let start = index * psize;
            let end = start + psize;
            let lo = offset.max(start);
            let hi = (offset + len as u64).min(end);
            if lo >= hi {
                continue;
            }
            let page = page.lock();
            out[(lo - offset) as usize..(hi - offset) as usize]
                .copy_from_slice(&page.data()[(lo - start) as usize..(hi - start) as usize]);
        }
        out
    }
}

impl InodeCache for MemInodeCache {
    fn inval_inode(&self, ino: u64, offset: i64, len: i64) -> Result<(), Errno> {
        let mut state = self.state.lock();
        let inode = state.inodes.get_mut(&ino).ok_or(Errno::ENOENT)?;
        inode.attr_valid = false;
        if offset >= 0 {
            let psize = page_size() as i64;
            let first = (offset / psize) as u64;
            // An end beyond what an offset can express means to end of file.
            let last = match (len > 0).then(|| offset.checked_add(len - 1)).flatten() {
                Some(end) => (end / psize) as u64,
                None => u64::MAX,
            };
            inode.pages.retain(|index, _| *index < first || *index > last);
        }
        Ok(())
    }

    fn inval_entry(&self, parent: u64, name: &OsStr, child: Option<u64>) -> Result<(), Errno> {
        let mut state = self.state.lock();
        if !state.inodes.contains_key(&parent) {
            return Err(Errno::ENOENT);
        }
        let key = (parent, name.to_os_string());
        let found = *state.entries.get(&key).ok_or(Errno::ENOENT)?;
        if child.is_some_and(|c| c != found) {
            return Err(Errno::ENOENT);
        }
        state.entries.remove(&key);
        if let Some(inode) = state.inodes.get_mut(&parent) {
            inode.attr_valid = false;
        }
        Ok(())
    }

    fn file_size(&self, ino: u64) -> Option<u64> {
        self.state.lock().inodes.get(&ino).map(|i| i.size)
    }

    fn set_file_size(&self, ino: u64, size: u64) {
        if let Some(inode) = self.state.lock().inodes.get_mut(&ino) {
            inode.size = size;
        }
    }

    fn find_or_create_page(&self, ino: u64, index: u64) -> Result<PageRef, Errno> {
        let mut state = self.state.lock();
        let inode = state.inodes.get_mut(&ino).ok_or(Errno::ENOENT)?;
        let page = inode.pages.entry(index).or_insert_with(|| {
            let mut page = Page::new();
            page.set_mapping(Some(PageIndex { ino, index }));
            page.set_flags(PageFlags::LRU, true);
            page.into_ref()
        });
        Ok(page.clone())
    }

    fn find_page(&self, ino: u64, index: u64) -> Option<PageRef> {
        self.state
            .lock()
            .inodes
            .get(&ino)
            .and_then(|i| i.pages.get(&index).cloned())
    }

    fn replace_page(&self, at: PageIndex, new: PageRef) -> Result<(), Errno> {
        let mut state = self.state.lock();
        let inode = state.inodes.get_mut(&at.ino).ok_or(Errno::ENOENT)?;
        new.lock().set_mapping(Some(at));
        if let Some(old) = inode.pages.insert(at.index, new) {
            old.lock().set_mapping(None);
        }
        Ok(())
    }
}
