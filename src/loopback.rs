//! Software rail: executes descriptor chains in-process.
//!
//! Useful for tests and single-node runs. Chain order matches what a real
//! interface enforces through event chaining: within one descriptor, each
//! command finishes before the next starts, and the completion word fires
//! only after the whole chain ran.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::rail::{Cookie, DmaAddr, DmaCmd, EventWord, HwDesc, QueueKind, Rail, RingClass, VpId};
use crate::ring::RecvRing;
use crate::wait::SleepSlot;

struct PeerRings {
    data: Arc<RecvRing>,
    comp: Option<Arc<RecvRing>>,
}

/// In-process fabric: the set of reachable virtual processes and their rings.
pub struct LoopbackFabric {
    peers: Mutex<HashMap<VpId, PeerRings>>,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Make `vp`'s rings reachable from every rail on this fabric.
    pub fn register(&self, vp: VpId, data: Arc<RecvRing>, comp: Option<Arc<RecvRing>>) {
        self.peers.lock().insert(vp, PeerRings { data, comp });
    }

    fn ring(&self, vp: VpId, class: RingClass) -> Result<Arc<RecvRing>> {
        let peers = self.peers.lock();
        let rings = peers
            .get(&vp)
            .ok_or_else(|| Error::Submit(format!("no rings registered for vp {}", vp.0)))?;
        match class {
            RingClass::Data => Ok(Arc::clone(&rings.data)),
            RingClass::Completion => rings.comp.clone().ok_or_else(|| {
                Error::Submit(format!("vp {} has no completion ring", vp.0))
            }),
        }
    }
}

/// One endpoint's view of the fabric.
pub struct LoopbackRail {
    vp: VpId,
    fabric: Arc<LoopbackFabric>,
    remote_read: bool,
    cookies: AtomicU64,
    mem_writes: AtomicU64,
    mem_reads: AtomicU64,
}

impl LoopbackRail {
    pub fn new(vp: VpId, fabric: Arc<LoopbackFabric>, remote_read: bool) -> Self {
        Self {
            vp,
            fabric,
            remote_read,
            cookies: AtomicU64::new(1),
            mem_writes: AtomicU64::new(0),
            mem_reads: AtomicU64::new(0),
        }
    }

    /// Bulk writes executed so far (payload DMA, not queue traffic).
    pub fn mem_writes(&self) -> u64 {
        self.mem_writes.load(Ordering::Relaxed)
    }

    /// Remote reads executed so far.
    pub fn mem_reads(&self) -> u64 {
        self.mem_reads.load(Ordering::Relaxed)
    }

    fn exec(&self, cmd: &DmaCmd) -> Result<()> {
        match *cmd {
            DmaCmd::QueueWrite { vp, ring, src, len, .. } => {
                let target = self.fabric.ring(vp, ring)?;
                // src came out of translate() on a buffer that outlives the
                // submission (staging buffers live in the descriptor).
                let bytes = unsafe { std::slice::from_raw_parts(src as *const u8, len as usize) };
                target.deliver(bytes)
            }
            DmaCmd::MemWrite { src, dst, len, .. } => {
                self.mem_writes.fetch_add(1, Ordering::Relaxed);
                unsafe {
                    std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len as usize);
                }
                Ok(())
            }
            DmaCmd::MemRead { src, dst, len, .. } => {
                self.mem_reads.fetch_add(1, Ordering::Relaxed);
                unsafe {
                    std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len as usize);
                }
                Ok(())
            }
        }
    }
}

impl Rail for LoopbackRail {
    fn vp(&self) -> VpId {
        self.vp
    }

    fn has_remote_read(&self) -> bool {
        self.remote_read
    }

    fn translate(&self, ptr: *const u8) -> DmaAddr {
        ptr as DmaAddr
    }

    fn local_cookie(&self, _target: VpId) -> Cookie {
        Cookie(self.cookies.fetch_add(1, Ordering::Relaxed))
    }

    fn remote_cookie(&self, _target: VpId) -> Cookie {
        Cookie(self.cookies.fetch_add(1, Ordering::Relaxed))
    }

    fn submit(&self, _queue: QueueKind, desc: &HwDesc) -> Result<()> {
        match desc {
            HwDesc::Eager(d) => {
                self.exec(&d.main)?;
                if let Some(report) = &d.report {
                    self.exec(report)?;
                }
                d.done.fire();
            }
            HwDesc::Write(d) => {
                // Payload strictly before the Fin header.
                self.exec(&d.payload)?;
                self.exec(&d.fin)?;
                if let Some(report) = &d.report {
                    self.exec(report)?;
                }
                d.done.fire();
            }
            HwDesc::Read(d) => {
                // Read strictly before the FinAck back to the sender.
                self.exec(&d.read)?;
                self.exec(&d.fin_ack)?;
                if let Some(report) = &d.report {
                    self.exec(report)?;
                }
                d.done.fire();
            }
        }
        Ok(())
    }

    fn flush(&self, _queue: QueueKind) {}

    fn poll_event(&self, word: &EventWord, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if word.fired() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
    }

    fn block_event(&self, sleep: &SleepSlot, word: &EventWord, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if word.fired() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(sleep.park_interval());
        }
    }

    fn rearm(&self, ring: &RecvRing) {
        ring.rearm();
    }
}
