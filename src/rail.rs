//! Interface-access seam consumed by the transport core.
//!
//! The transport never talks to hardware directly: it fills a tagged
//! [`HwDesc`] (eager queue write, rendezvous write, rendezvous read), hands it
//! to a [`Rail`] for submission, and observes progress through [`EventWord`]s
//! the interface writes into main memory. A software implementation lives in
//! [`crate::loopback`].

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::ring::RecvRing;
use crate::wait::SleepSlot;

/// Interface address-space handle for a main-memory location.
pub type DmaAddr = u64;

/// Hardware-level peer address, distinct from message-layer rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VpId(pub u32);

/// Completion cookie tagging a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie(pub u64);

/// Command queues exposed by one rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Queue-write commands (headers + inline payload).
    Tx,
    /// Bulk rendezvous writes.
    Put,
    /// Remote-read initiation.
    Get,
}

/// Which delivery ring a queue write lands in on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingClass {
    Data,
    Completion,
}

/// Completion word the interface writes when a command chain finishes.
///
/// Lives in main memory so the poll-based completion engine can test it
/// without a queue round trip.
#[derive(Debug, Default)]
pub struct EventWord(AtomicU64);

impl EventWord {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn fired(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    /// Hardware side: signal completion.
    #[inline]
    pub fn fire(&self) {
        self.0.store(1, Ordering::Release);
    }

    /// Consumer side: disarm after the paired pointer write is visible.
    #[inline]
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// One hardware command within a descriptor chain.
#[derive(Debug, Clone)]
pub enum DmaCmd {
    /// Deliver `len` bytes starting at `src` into a slot of the target's
    /// ring of class `ring`.
    QueueWrite {
        vp: VpId,
        ring: RingClass,
        cookie: Cookie,
        src: DmaAddr,
        len: u32,
    },
    /// Bulk write from local `src` to remote `dst`.
    MemWrite {
        vp: VpId,
        cookie: Cookie,
        src: DmaAddr,
        dst: DmaAddr,
        len: u32,
    },
    /// Remote-originated read from remote `src` into local `dst`.
    MemRead {
        vp: VpId,
        cookie: Cookie,
        src: DmaAddr,
        dst: DmaAddr,
        len: u32,
    },
}

/// Eager descriptor: one queue write, optionally chained to a header copy
/// reported back into the sender's own completion ring.
#[derive(Debug)]
pub struct EagerDesc {
    pub main: DmaCmd,
    pub report: Option<DmaCmd>,
    pub done: Arc<EventWord>,
}

/// Rendezvous-write descriptor. The interface must complete `payload`
/// before delivering `fin`: the Fin header tells the receiver the payload
/// has fully arrived, so the ordering is enforced by event chaining in the
/// interface, never by software synchronization.
#[derive(Debug)]
pub struct WriteDesc {
    pub payload: DmaCmd,
    pub fin: DmaCmd,
    pub report: Option<DmaCmd>,
    pub done: Arc<EventWord>,
}

/// Rendezvous-read descriptor: remote read into a local buffer, chained to a
/// FinAck queue write back to the sender once the read has landed.
#[derive(Debug)]
pub struct ReadDesc {
    pub read: DmaCmd,
    pub fin_ack: DmaCmd,
    pub report: Option<DmaCmd>,
    pub done: Arc<EventWord>,
}

/// Hardware descriptor variants share a base layout on real interfaces;
/// modelled as an explicit tagged variant, never inferred from size.
#[derive(Debug)]
pub enum HwDesc {
    Eager(EagerDesc),
    Write(WriteDesc),
    Read(ReadDesc),
}

impl HwDesc {
    pub fn done(&self) -> &Arc<EventWord> {
        match self {
            HwDesc::Eager(d) => &d.done,
            HwDesc::Write(d) => &d.done,
            HwDesc::Read(d) => &d.done,
        }
    }
}

/// Raw interface access consumed by the transport core.
///
/// One `Rail` per physical rail. Implementations are expected to execute
/// descriptor chains in order: within one [`HwDesc`], a chained command
/// starts only after the previous command's completion event fires.
pub trait Rail: Send + Sync {
    /// Local virtual process id on this rail.
    fn vp(&self) -> VpId;

    /// Whether the interface can originate remote reads.
    fn has_remote_read(&self) -> bool;

    /// Translate a main-memory location into interface address space.
    fn translate(&self, ptr: *const u8) -> DmaAddr;

    /// Allocate a completion cookie for a locally originated command.
    fn local_cookie(&self, target: VpId) -> Cookie;

    /// Allocate a cookie for a command the remote interface originates.
    fn remote_cookie(&self, target: VpId) -> Cookie;

    /// Submit a descriptor to a command queue.
    fn submit(&self, queue: QueueKind, desc: &HwDesc) -> Result<()>;

    /// Flush/reorder a command queue after submission.
    fn flush(&self, queue: QueueKind);

    /// Poll a completion word, returning whether it fired within `timeout`.
    fn poll_event(&self, word: &EventWord, timeout: Duration) -> bool;

    /// Block on a completion word using a reusable sleep descriptor.
    fn block_event(&self, sleep: &SleepSlot, word: &EventWord, timeout: Duration) -> bool;

    /// Re-arm a ring's delivery event for one more slot.
    fn rearm(&self, ring: &RecvRing);
}

/// Make descriptor fields visible to the interface before submission.
#[inline]
pub fn membar_visible() {
    fence(Ordering::SeqCst);
}

/// Order a ring front-pointer store before the completion-word reset.
#[inline]
pub fn membar_storestore() {
    fence(Ordering::Release);
}

/// Drain main-memory writes a DMA engine will read before issuing it.
#[inline]
pub fn membar_drain() {
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_word_fire_reset() {
        let w = EventWord::new();
        assert!(!w.fired());
        w.fire();
        assert!(w.fired());
        w.reset();
        assert!(!w.fired());
    }
}
