//! Transfer Queue
//!
//! An idempotent FIFO hand-off between producers and the worker pool that
//! owns an item type. Each item carries its own "queued" flag, so adding an
//! item that is already waiting is a no-op and an item is never processed
//! twice for one enqueue. Taking an item clears the flag, which lets the
//! producer enqueue it again while it is being processed.
//!
//! Used by the local write-back workers, the durable-tier upload workers and
//! the timer sweepers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

/// An item that can sit in a [`TransferQueue`]
pub trait Transferable: Send + Sync {
    /// Flag set while the item is waiting in a queue
    fn queued_flag(&self) -> &AtomicBool;

    /// Whether the item is currently waiting in a queue
    fn is_queued(&self) -> bool {
        self.queued_flag().load(Ordering::Acquire)
    }
}

/// Transfer queue statistics
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Items actually enqueued
    pub enqueued: u64,
    /// Adds that found the item already queued
    pub coalesced: u64,
    /// Items handed to consumers
    pub taken: u64,
    /// Items currently waiting
    pub depth: usize,
}

/// Idempotent multi-producer, multi-consumer FIFO
pub struct TransferQueue<T: Transferable> {
    tx: Sender<Arc<T>>,
    rx: Receiver<Arc<T>>,
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    taken: AtomicU64,
}

impl<T: Transferable> Default for TransferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transferable> TransferQueue<T> {
    /// Create an unbounded queue
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            enqueued: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            taken: AtomicU64::new(0),
        }
    }

    /// Enqueue `item` unless it is already waiting
    ///
    /// Returns true if the item was enqueued by this call.
    pub fn add(&self, item: Arc<T>) -> bool {
        if item.queued_flag().swap(true, Ordering::AcqRel) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // Both ends live in self, so the channel cannot be disconnected
        if self.tx.send(item).is_err() {
            return false;
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take the next item without waiting
    pub fn poll(&self) -> Option<Arc<T>> {
        match self.rx.try_recv() {
            Ok(item) => Some(self.claim(item)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Take the next item, waiting up to `timeout`
    pub fn take_timeout(&self, timeout: Duration) -> Option<Arc<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(self.claim(item)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Number of items waiting
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Check if no items are waiting
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Get queue statistics
    pub fn stats(&self) -> TransferStats {
        TransferStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            taken: self.taken.load(Ordering::Relaxed),
            depth: self.len(),
        }
    }

    #[inline]
    fn claim(&self, item: Arc<T>) -> Arc<T> {
        item.queued_flag().store(false, Ordering::Release);
        self.taken.fetch_add(1, Ordering::Relaxed);
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Job {
        id: u32,
        queued: AtomicBool,
    }

    impl Job {
        fn new(id: u32) -> Arc<Self> {
            Arc::new(Self {
                id,
                queued: AtomicBool::new(false),
            })
        }
    }

    impl Transferable for Job {
        fn queued_flag(&self) -> &AtomicBool {
            &self.queued
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let queue = TransferQueue::new();
        let job = Job::new(1);

        assert!(queue.add(job.clone()));
        assert!(!queue.add(job.clone()));
        assert!(!queue.add(job.clone()));
        assert_eq!(queue.len(), 1);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.coalesced, 2);
    }

    #[test]
    fn test_take_clears_flag() {
        let queue = TransferQueue::new();
        let job = Job::new(7);
        queue.add(job.clone());
        assert!(job.is_queued());

        let taken = queue.poll().unwrap();
        assert_eq!(taken.id, 7);
        assert!(!job.is_queued());

        // Re-adding after take enqueues again
        assert!(queue.add(job));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_fifo_order() {
        let queue = TransferQueue::new();
        for id in 0..5 {
            queue.add(Job::new(id));
        }
        let order: Vec<u32> = std::iter::from_fn(|| queue.poll()).map(|j| j.id).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_take_timeout_empty() {
        let queue: TransferQueue<Job> = TransferQueue::new();
        assert!(queue.take_timeout(Duration::from_millis(5)).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_adds_enqueue_once() {
        let queue = Arc::new(TransferQueue::new());
        let job = Job::new(3);
        let mut handles = vec![];

        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let job = Arc::clone(&job);
            handles.push(thread::spawn(move || queue.add(job)));
        }

        let added: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(added, 1);
        assert_eq!(queue.len(), 1);
    }
}
