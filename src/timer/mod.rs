//! Item Timers and the Timer Queue
//!
//! Deferred work that is cancelled far more often than it fires: releasing
//! an idle segment, closing an idle file handle. Each item owns an
//! [`ItemTimer`] whose state is a single atomic word:
//!
//! ```text
//!              arm(deadline)                 try_expire(now >= deadline)
//!   DISABLED ────────────────▶ ARMED(dl) ─────────────────────────────▶ EXPIRED
//!       ▲                          │
//!       └──────────────────────────┘
//!          disable_if_not_expired()
//! ```
//!
//! The owner re-arms after every use; the sweeper thread sleeps on the head
//! of a FIFO [`TimerQueue`] and runs the item's deferred work once the
//! deadline passes. EXPIRED is terminal, so deferred work runs at most once
//! per item, and disabling an expired timer fails so the owner knows the
//! item is gone.

pub mod coalesce;

pub use coalesce::{CoalescerStats, WriteCoalescer};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::Result;
use crate::transfer::{TransferQueue, Transferable};

const DISABLED: u64 = 0;
const EXPIRED: u64 = u64::MAX;

/// Longest single sleep of the sweeper, bounds shutdown latency
const MAX_NAP: Duration = Duration::from_millis(5);

// =============================================================================
// Item Timer
// =============================================================================

/// Result of a sweeper poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPoll {
    /// This poll moved the timer to EXPIRED
    Expired,
    /// A previous poll already expired it
    AlreadyExpired,
    /// The owner holds the item
    Disabled,
    /// Armed, with this long to go
    Remaining(Duration),
}

/// Lock-free timer state machine
#[derive(Debug)]
pub struct ItemTimer {
    state: AtomicU64,
}

impl Default for ItemTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemTimer {
    /// Create a disabled timer
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(DISABLED),
        }
    }

    /// Arm with an absolute deadline in clock milliseconds
    ///
    /// Only a disabled timer can be armed.
    pub fn arm(&self, deadline_ms: u64) -> bool {
        let armed = deadline_ms.saturating_add(1).min(EXPIRED - 1);
        self.state
            .compare_exchange(DISABLED, armed, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move ARMED to DISABLED; fails once the timer has expired
    pub fn disable_if_not_expired(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == EXPIRED {
                return false;
            }
            if current == DISABLED {
                return true;
            }
            match self.state.compare_exchange_weak(
                current,
                DISABLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Expire the timer if its deadline is at or before `now_ms`
    pub fn try_expire(&self, now_ms: u64) -> TimerPoll {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == EXPIRED {
                return TimerPoll::AlreadyExpired;
            }
            if current == DISABLED {
                return TimerPoll::Disabled;
            }
            let deadline = current - 1;
            if now_ms < deadline {
                return TimerPoll::Remaining(Duration::from_millis(deadline - now_ms));
            }
            match self.state.compare_exchange_weak(
                current,
                EXPIRED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return TimerPoll::Expired,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXPIRED
    }

    pub fn is_armed(&self) -> bool {
        let s = self.state.load(Ordering::Acquire);
        s != DISABLED && s != EXPIRED
    }
}

// =============================================================================
// Timer Item
// =============================================================================

/// A payload guarded by a timer
pub struct TimerItem<T> {
    timer: ItemTimer,
    queued: AtomicBool,
    payload: Mutex<Option<T>>,
}

impl<T: Send> Transferable for TimerItem<T> {
    fn queued_flag(&self) -> &AtomicBool {
        &self.queued
    }
}

impl<T> TimerItem<T> {
    /// Create an item with a disabled timer
    pub fn new(payload: T) -> Arc<Self> {
        Arc::new(Self {
            timer: ItemTimer::new(),
            queued: AtomicBool::new(false),
            payload: Mutex::new(Some(payload)),
        })
    }

    pub fn timer(&self) -> &ItemTimer {
        &self.timer
    }

    /// Clone of the payload, `None` after the deferred work ran
    pub fn payload(&self) -> Option<T>
    where
        T: Clone,
    {
        self.payload.lock().clone()
    }

    fn take_payload(&self) -> Option<T> {
        self.payload.lock().take()
    }
}

/// Work run by the sweeper when an item expires
pub trait DeferredWork<T>: Send + Sync {
    fn deferred_work(&self, item: &Arc<TimerItem<T>>, payload: T);
}

// =============================================================================
// Timer Queue
// =============================================================================

struct Sweeper<T: Send + 'static> {
    name: String,
    queue: TransferQueue<TimerItem<T>>,
    epoch: Instant,
    working: AtomicBool,
    fired: AtomicU64,
    receiver: Weak<dyn DeferredWork<T>>,
}

impl<T: Send + 'static> Sweeper<T> {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn run(&self) {
        debug!(timer = %self.name, "timer sweeper started");
        while self.working.load(Ordering::Acquire) {
            match self.queue.poll() {
                Some(item) => self.process(item),
                None => thread::sleep(Duration::from_millis(1)),
            }
        }

        // Whatever is still armed fires now
        while let Some(item) = self.queue.poll() {
            if item.timer.try_expire(EXPIRED - 1) == TimerPoll::Expired {
                self.fire(&item);
            }
        }
        debug!(timer = %self.name, fired = self.fired.load(Ordering::Relaxed), "timer sweeper stopped");
    }

    fn process(&self, item: Arc<TimerItem<T>>) {
        loop {
            let now = if self.working.load(Ordering::Acquire) {
                self.now_ms()
            } else {
                EXPIRED - 1
            };
            match item.timer.try_expire(now) {
                TimerPoll::Expired => {
                    self.fire(&item);
                    return;
                }
                TimerPoll::Remaining(left) => thread::sleep(left.min(MAX_NAP)),
                TimerPoll::Disabled | TimerPoll::AlreadyExpired => return,
            }
        }
    }

    fn fire(&self, item: &Arc<TimerItem<T>>) {
        let Some(payload) = item.take_payload() else {
            return;
        };
        self.fired.fetch_add(1, Ordering::Relaxed);
        match self.receiver.upgrade() {
            Some(receiver) => receiver.deferred_work(item, payload),
            None => debug!(timer = %self.name, "receiver gone, dropping expired item"),
        }
    }
}

/// FIFO of timer items with a single sweeper thread
///
/// Every item in one queue uses the same timeout, so deadlines are
/// non-decreasing along the queue and the sweeper only ever sleeps on the
/// head.
pub struct TimerQueue<T: Send + 'static> {
    sweeper: Arc<Sweeper<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> TimerQueue<T> {
    /// Start a queue whose expired items are handed to `receiver`
    pub fn start(name: &str, receiver: Weak<dyn DeferredWork<T>>) -> Result<Self> {
        let sweeper = Arc::new(Sweeper {
            name: name.to_string(),
            queue: TransferQueue::new(),
            epoch: Instant::now(),
            working: AtomicBool::new(true),
            fired: AtomicU64::new(0),
            receiver,
        });
        let runner = Arc::clone(&sweeper);
        let worker = thread::Builder::new()
            .name(format!("timer-{name}"))
            .spawn(move || runner.run())?;
        Ok(Self {
            sweeper,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Current clock reading in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.sweeper.now_ms()
    }

    /// Arm `item` to expire after `timeout` and make sure it is queued
    ///
    /// Returns false if the item already expired.
    pub fn schedule(&self, item: &Arc<TimerItem<T>>, timeout: Duration) -> bool {
        let deadline = self.now_ms() + timeout.as_millis() as u64;
        if !item.timer.arm(deadline) && item.timer.is_expired() {
            return false;
        }
        self.sweeper.queue.add(Arc::clone(item));
        true
    }

    /// Items waiting for the sweeper
    pub fn len(&self) -> usize {
        self.sweeper.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweeper.queue.is_empty()
    }

    /// Items whose deferred work ran
    pub fn fired(&self) -> u64 {
        self.sweeper.fired.load(Ordering::Relaxed)
    }

    /// Expire everything still armed and stop the sweeper
    pub fn shutdown(&self) {
        self.sweeper.working.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(timer = %self.sweeper.name, "timer sweeper panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for TimerQueue<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
