//! Progress observation and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Phase reported through progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPhase {
    /// Splitting, sorting and persisting chunks; `current` counts input
    /// bytes processed.
    Chunking,
    /// Merging sorted runs; `current` counts completed merges.
    Merging,
    /// The sort finished.
    Done,
}

/// One observer notification. `current` never decreases within a phase.
#[derive(Debug, Clone, Copy)]
pub struct SortProgress {
    pub phase: SortPhase,
    pub current: u64,
    pub total: u64,
}

/// Progress observer callback.
pub type ProgressFn = dyn Fn(SortProgress) + Send + Sync;

/// Cooperative cancellation signal. Clones share the signal.
///
/// Cancellation is observed at suspension points (reads, staging
/// flushes, merge steps); the sort surfaces it as an error after
/// disposing temp state. It is never preemptive.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Requests cancellation; observed at the next suspension point.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Serializes observer notifications for one phase so `current` stays
/// monotonic even when parallel workers finish out of order.
pub struct ProgressMeter<'a> {
    observer: Option<&'a ProgressFn>,
    phase: SortPhase,
    total: u64,
    current: Mutex<u64>,
}

impl<'a> ProgressMeter<'a> {
    pub fn new(observer: Option<&'a ProgressFn>, phase: SortPhase, total: u64) -> ProgressMeter<'a> {
        ProgressMeter {
            observer,
            phase,
            total,
            current: Mutex::new(0),
        }
    }

    /// Adds `amount` to the phase counter and notifies the observer.
    pub fn advance(&self, amount: u64) {
        let Some(observer) = self.observer else {
            return;
        };
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current += amount;
        observer(SortProgress {
            phase: self.phase,
            current: *current,
            total: self.total,
        });
    }
}
