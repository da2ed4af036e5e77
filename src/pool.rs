//! Shared work queue and cooperative shutdown for the stage worker pools.
//!
//! Every stage uses the same pattern: enumerate the work up front, put it in
//! one shared queue, spawn a fixed number of workers that pull one item at a
//! time until the queue is drained. Faster workers simply absorb more items;
//! there is no static partitioning.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Drain-until-empty queue shared across workers.
///
/// `pop` hands out one item together with its 1-based position, for progress
/// lines like `[7/1000]`. Once the queue is empty (or shutdown fired) workers
/// receive `None` and exit.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    total: usize,
    shutdown: Shutdown,
}

impl<T> WorkQueue<T> {
    pub fn new(items: Vec<T>, shutdown: Shutdown) -> Arc<Self> {
        let total = items.len();
        Arc::new(Self {
            items: Mutex::new(VecDeque::from(items)),
            total,
            shutdown,
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Next item and its position, or None when drained or shutting down.
    /// In-flight items are unaffected by shutdown; no new item starts.
    pub fn pop(&self) -> Option<(T, usize)> {
        if self.shutdown.is_triggered() {
            return None;
        }
        let mut items = self.items.lock().unwrap();
        let remaining = items.len();
        items.pop_front().map(|item| (item, self.total - remaining + 1))
    }
}

/// Cooperative shutdown flag, set from the Ctrl-C handler
#[derive(Clone, Default)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// Worker count for the parallel stages: one per hardware thread
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
