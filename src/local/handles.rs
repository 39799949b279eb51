//! File Handle Cache
//!
//! Keeps recently used block files open. A handle is "held" while in use and
//! armed on release; if nobody reuses it within the idle timeout the timer
//! sweeper drops it from the table and the file closes once the last user
//! lets go of its `Arc<File>`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::timer::{DeferredWork, TimerItem, TimerQueue};

#[derive(Clone)]
struct OpenFile {
    path: PathBuf,
    file: Arc<File>,
}

type HandleItem = TimerItem<OpenFile>;

/// Handle cache statistics
#[derive(Debug, Clone, Default)]
pub struct HandleStats {
    pub opens: u64,
    pub reuses: u64,
    pub idle_closes: u64,
    pub open_handles: usize,
}

struct HandleTable {
    open: Mutex<HashMap<PathBuf, Arc<HandleItem>>>,
    opens: AtomicU64,
    reuses: AtomicU64,
    idle_closes: AtomicU64,
}

impl DeferredWork<OpenFile> for HandleTable {
    fn deferred_work(&self, item: &Arc<HandleItem>, handle: OpenFile) {
        let mut open = self.open.lock();
        if open.get(&handle.path).is_some_and(|cur| Arc::ptr_eq(cur, item)) {
            open.remove(&handle.path);
            self.idle_closes.fetch_add(1, Ordering::Relaxed);
            trace!(path = %handle.path.display(), "closed idle handle");
        }
    }
}

/// Idle-closing cache of read-write file handles
pub struct FileHandles {
    table: Arc<HandleTable>,
    timers: TimerQueue<OpenFile>,
    idle_timeout: Duration,
}

impl FileHandles {
    /// Start a cache closing handles idle for `idle_timeout`
    pub fn new(idle_timeout: Duration) -> Result<Self> {
        let table = Arc::new(HandleTable {
            open: Mutex::new(HashMap::new()),
            opens: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            idle_closes: AtomicU64::new(0),
        });
        let weak: Weak<HandleTable> = Arc::downgrade(&table);
        let timers = TimerQueue::<OpenFile>::start("file-handles", weak)?;
        Ok(Self {
            table,
            timers,
            idle_timeout,
        })
    }

    /// Run `f` with an open handle for `path`, creating the file if needed
    pub fn with_file<R>(&self, path: &Path, f: impl FnOnce(&File) -> io::Result<R>) -> io::Result<R> {
        let item = self.hold(path)?;
        let result = match item.payload() {
            Some(handle) => f(&handle.file),
            None => Err(io::Error::other("file handle expired while held")),
        };
        self.timers.schedule(&item, self.idle_timeout);
        result
    }

    fn hold(&self, path: &Path) -> io::Result<Arc<HandleItem>> {
        let mut open = self.table.open.lock();
        if let Some(item) = open.get(path) {
            if item.timer().disable_if_not_expired() {
                self.table.reuses.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(item));
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        self.table.opens.fetch_add(1, Ordering::Relaxed);
        let item = TimerItem::new(OpenFile {
            path: path.to_path_buf(),
            file: Arc::new(file),
        });
        open.insert(path.to_path_buf(), Arc::clone(&item));
        Ok(item)
    }

    /// Drop the cached handle for `path` (before deleting the file)
    pub fn close(&self, path: &Path) {
        if let Some(item) = self.table.open.lock().remove(path) {
            item.timer().disable_if_not_expired();
        }
    }

    /// Get handle cache statistics
    pub fn stats(&self) -> HandleStats {
        HandleStats {
            opens: self.table.opens.load(Ordering::Relaxed),
            reuses: self.table.reuses.load(Ordering::Relaxed),
            idle_closes: self.table.idle_closes.load(Ordering::Relaxed),
            open_handles: self.table.open.lock().len(),
        }
    }

    /// Close everything and stop the sweeper
    pub fn shutdown(&self) {
        self.timers.shutdown();
        self.table.open.lock().clear();
    }
}
