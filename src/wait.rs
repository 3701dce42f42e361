//! Blocking-wait helper.
//!
//! Polling is the fast path; when a poll window expires the caller draws a
//! reusable sleep descriptor from the rail's pool and blocks on the
//! completion word instead of burning the core. The pool grows on demand and
//! never shrinks.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::rail::{EventWord, Rail};

/// Reusable sleep descriptor. On real interfaces this wraps a hardware sleep
/// object; here it carries the park interval and block statistics.
pub struct SleepSlot {
    park: Duration,
    blocks: AtomicU64,
}

impl SleepSlot {
    fn new(park: Duration) -> Self {
        Self {
            park,
            blocks: AtomicU64::new(0),
        }
    }

    /// How long one blocking nap lasts before the word is re-checked.
    pub fn park_interval(&self) -> Duration {
        self.park
    }

    pub fn note_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

/// Per-rail pool of sleep descriptors behind a single lock.
pub struct SleepPool {
    park: Duration,
    slots: Mutex<Vec<Arc<SleepSlot>>>,
    created: AtomicUsize,
}

impl SleepPool {
    pub fn new(park: Duration) -> Self {
        Self {
            park,
            slots: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Draw a descriptor, lazily creating one when the pool is dry.
    pub fn acquire(&self) -> Arc<SleepSlot> {
        if let Some(slot) = self.slots.lock().pop() {
            return slot;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        Arc::new(SleepSlot::new(self.park))
    }

    pub fn release(&self, slot: Arc<SleepSlot>) {
        self.slots.lock().push(slot);
    }

    /// Total descriptors ever created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

/// Poll first, then block through a pooled sleep descriptor.
///
/// Returns whether `word` fired within `poll + block`.
pub fn wait_event(
    rail: &dyn Rail,
    pool: &SleepPool,
    word: &EventWord,
    poll: Duration,
    block: Duration,
) -> bool {
    if rail.poll_event(word, poll) {
        return true;
    }
    let slot = pool.acquire();
    slot.note_block();
    let fired = rail.block_event(&slot, word, block);
    pool.release(slot);
    fired
}
