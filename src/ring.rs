//! Bounded receive ring the interface delivers headers/payloads into.
//!
//! One hardware producer per ring; consumers serialize on the ring lock.
//! The front pointer and its paired event pointer only move together, under
//! that lock, wrapping to the base after the top slot. Slot contents are
//! addressed by index only.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::rail::{membar_drain, membar_storestore, EventWord};

/// Consumer-side pointers. The event pointer mirrors the front pointer on
/// the interface side; both advance in the same critical section.
#[derive(Debug)]
pub struct RingFront {
    front: usize,
    event_front: usize,
}

impl RingFront {
    pub fn front(&self) -> usize {
        self.front
    }

    pub fn event_front(&self) -> usize {
        self.event_front
    }
}

#[derive(Debug)]
struct RingBack {
    back: usize,
}

/// Fixed-capacity circular slot array plus its completion word.
pub struct RecvRing {
    slot_size: usize,
    cap: usize,
    slots: UnsafeCell<Box<[u8]>>,
    consumer: Mutex<RingFront>,
    producer: Mutex<RingBack>,
    occupied: AtomicUsize,
    done: EventWord,
}

// The producer lock guards writes to slot `back`; the consumer lock guards
// reads of slot `front`. `occupied` keeps the two from overlapping: a slot is
// written only while unoccupied and read only while occupied.
unsafe impl Send for RecvRing {}
unsafe impl Sync for RecvRing {}

impl RecvRing {
    pub fn new(cap: usize, slot_size: usize) -> Self {
        assert!(cap > 0 && slot_size > 0);
        Self {
            slot_size,
            cap,
            slots: UnsafeCell::new(vec![0u8; cap * slot_size].into_boxed_slice()),
            consumer: Mutex::new(RingFront {
                front: 0,
                event_front: 0,
            }),
            producer: Mutex::new(RingBack { back: 0 }),
            occupied: AtomicUsize::new(0),
            done: EventWord::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Completion word the interface fires on delivery.
    pub fn done(&self) -> &EventWord {
        &self.done
    }

    pub fn lock_front(&self) -> MutexGuard<'_, RingFront> {
        self.consumer.lock()
    }

    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }

    /// Slot contents at `idx`. Caller must hold the consumer lock and only
    /// read the current front slot.
    pub fn slot(&self, idx: usize) -> &[u8] {
        debug_assert!(idx < self.cap);
        let start = idx * self.slot_size;
        let slots = unsafe { &*self.slots.get() };
        &slots[start..start + self.slot_size]
    }

    /// Retire the front slot: advance front and event pointer one slot
    /// (wrapping at the top), then reset the completion word only after the
    /// pointer writes are ordered.
    pub fn complete_slot(&self, g: &mut RingFront) {
        if g.front == self.cap - 1 {
            g.front = 0;
            g.event_front = 0;
        } else {
            g.front += 1;
            g.event_front += 1;
        }
        self.occupied.fetch_sub(1, Ordering::AcqRel);
        membar_storestore();
        self.done.reset();
    }

    /// Re-arm the delivery event for one more slot. Fires immediately when a
    /// delivery already landed while the word was being consumed.
    pub fn rearm(&self) {
        if self.occupied.load(Ordering::Acquire) > 0 {
            self.done.fire();
        }
    }

    /// Hardware side: deliver one slot's worth of bytes and fire the
    /// completion word. Fails when every slot is occupied (delivery overrun).
    pub fn deliver(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.slot_size {
            return Err(Error::Submit(format!(
                "delivery of {} bytes exceeds slot size {}",
                bytes.len(),
                self.slot_size
            )));
        }
        let mut back = self.producer.lock();
        if self.occupied.load(Ordering::Acquire) == self.cap {
            return Err(Error::Submit("receive ring overrun".into()));
        }
        let start = back.back * self.slot_size;
        unsafe {
            let slots = &mut *self.slots.get();
            slots[start..start + bytes.len()].copy_from_slice(bytes);
        }
        back.back = if back.back == self.cap - 1 {
            0
        } else {
            back.back + 1
        };
        membar_drain();
        self.occupied.fetch_add(1, Ordering::AcqRel);
        self.done.fire();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointers_advance_together_and_wrap() {
        let ring = RecvRing::new(3, 16);
        for _ in 0..3 {
            ring.deliver(&[0u8; 16]).unwrap();
        }
        let mut g = ring.lock_front();
        assert_eq!((g.front(), g.event_front()), (0, 0));
        ring.complete_slot(&mut g);
        assert_eq!((g.front(), g.event_front()), (1, 1));
        ring.complete_slot(&mut g);
        assert_eq!((g.front(), g.event_front()), (2, 2));
        ring.complete_slot(&mut g);
        // Wraps to base after the top slot.
        assert_eq!((g.front(), g.event_front()), (0, 0));
    }

    #[test]
    fn deliver_fires_and_complete_resets() {
        let ring = RecvRing::new(2, 8);
        assert!(!ring.done().fired());
        ring.deliver(&[1u8; 8]).unwrap();
        assert!(ring.done().fired());
        assert_eq!(ring.slot(0)[0], 1);

        let mut g = ring.lock_front();
        ring.complete_slot(&mut g);
        assert!(!ring.done().fired());
        // Nothing pending: re-arm keeps the word clear.
        ring.rearm();
        assert!(!ring.done().fired());
    }

    #[test]
    fn rearm_refires_when_backlogged() {
        let ring = RecvRing::new(4, 8);
        ring.deliver(&[1u8; 8]).unwrap();
        ring.deliver(&[2u8; 8]).unwrap();
        let mut g = ring.lock_front();
        ring.complete_slot(&mut g);
        assert!(!ring.done().fired());
        ring.rearm();
        assert!(ring.done().fired());
    }

    #[test]
    fn overrun_is_an_error() {
        let ring = RecvRing::new(1, 8);
        ring.deliver(&[0u8; 8]).unwrap();
        assert!(ring.deliver(&[0u8; 8]).is_err());
    }
}
