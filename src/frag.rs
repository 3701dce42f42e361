//! Fragment descriptors and their pools.
//!
//! Send descriptors live in a fixed-capacity outstanding table; the table key
//! is what peers echo on the wire instead of a raw descriptor address, so a
//! stale or foreign reference can never dereference across address spaces.
//! Receive descriptors come from a pre-sized pool with a bounded-retry
//! acquire path.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use tracing::warn;

use crate::error::{Error, Result};
use crate::rail::HwDesc;
use crate::request::{RecvRequest, SendRequest};
use crate::wire::Header;

/// Request a send descriptor completes against.
#[derive(Clone)]
pub enum ReqRef {
    /// Outgoing message (eager, rendezvous write, control).
    Send(Arc<SendRequest>),
    /// Posted receive (rendezvous-read descriptors complete receive side).
    Recv(Arc<RecvRequest>),
    /// Pure control traffic with no owning request (acks).
    None,
}

/// Outstanding send-side fragment descriptor.
pub struct SendFrag {
    /// Hardware descriptor as submitted.
    pub hw: HwDesc,
    /// Copy of the last header sent for this fragment.
    pub header: Header,
    pub req: ReqRef,
    /// Payload bytes this fragment covers; reported upstream on completion.
    pub bytes: u64,
    /// Flips 0 -> 1 exactly once; gates reclaim and upstream completion.
    pub progressed: AtomicBool,
    pub ack_pending: bool,
    /// Reclaim ownership stays with the upstream layer.
    pub cached: bool,
    /// Staging buffer the queue-write commands read from.
    pub buf: Box<[u8]>,
}

/// Fixed-capacity table of in-flight send descriptors, in submission order.
pub struct Outstanding {
    cap: usize,
    inner: Mutex<OutstandingInner>,
}

struct OutstandingInner {
    table: Slab<SendFrag>,
    order: VecDeque<usize>,
}

impl Outstanding {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: Mutex::new(OutstandingInner {
                table: Slab::with_capacity(cap),
                order: VecDeque::with_capacity(cap),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a key and insert the descriptor `build` constructs for it.
    /// The key is embedded in the wire header, so it must exist before the
    /// header is encoded.
    pub fn insert_with<F>(&self, build: F) -> Result<u32>
    where
        F: FnOnce(u32) -> Result<SendFrag>,
    {
        let mut inner = self.inner.lock();
        if inner.table.len() >= self.cap {
            return Err(Error::ResourceExhausted {
                pool: "send descriptor",
                retries: 0,
            });
        }
        let entry = inner.table.vacant_entry();
        let key = entry.key();
        let frag = build(key as u32)?;
        entry.insert(frag);
        inner.order.push_back(key);
        Ok(key as u32)
    }

    /// Run `f` against the descriptor at `key`, if still resident.
    pub fn with_mut<R>(&self, key: u32, f: impl FnOnce(&mut SendFrag) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.table.get_mut(key as usize).map(f)
    }

    /// Remove a descriptor, unlinking it from the submission order.
    pub fn remove(&self, key: u32) -> Option<SendFrag> {
        let mut inner = self.inner.lock();
        if !inner.table.contains(key as usize) {
            return None;
        }
        inner.order.retain(|&k| k != key as usize);
        Some(inner.table.remove(key as usize))
    }

    /// Unlink from the submission order without reclaiming (cached
    /// descriptors: the upstream layer owns the storage).
    pub fn unlink(&self, key: u32) {
        let mut inner = self.inner.lock();
        inner.order.retain(|&k| k != key as usize);
    }

    /// Poll-based completion: the head of the submission order, if its local
    /// completion word fired. Later entries cannot complete before the head
    /// under strict FIFO submission, so the scan stops here.
    pub fn head_fired(&self) -> Option<u32> {
        let inner = self.inner.lock();
        let &head = inner.order.front()?;
        let frag = inner.table.get(head)?;
        frag.hw.done().fired().then_some(head as u32)
    }
}

/// Where an arrived fragment's payload lives. A receive descriptor is always
/// matched (payload in the destination request buffer) or buffered (payload
/// in its private buffer) once processed, never both, never neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadHome {
    /// Not yet matched or buffered; only valid mid-dispatch.
    Unset,
    /// Payload copied into the destination request at this offset.
    Request { offset: u64 },
    /// Payload copied into the descriptor's private unexpected buffer.
    Private,
}

/// Receive-side fragment descriptor.
pub struct RecvFrag {
    pub header: Header,
    pub request: Option<Arc<RecvRequest>>,
    pub home: PayloadHome,
    /// Fixed private buffer for unmatched payloads. The ring slot is reused
    /// as soon as the front pointer advances, so the copy happens at
    /// dispatch time.
    unex: Box<[u8]>,
    unex_len: usize,
    /// Bytes of header traffic consumed for this fragment.
    pub bytes_hdr: u32,
    /// Bytes of message payload consumed for this fragment.
    pub bytes_msg: u32,
}

impl RecvFrag {
    fn new(unex_size: usize) -> Self {
        Self {
            header: Header::Stop,
            request: None,
            home: PayloadHome::Unset,
            unex: vec![0u8; unex_size].into_boxed_slice(),
            unex_len: 0,
            bytes_hdr: 0,
            bytes_msg: 0,
        }
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self.home, PayloadHome::Private)
    }

    /// Copy an unmatched inline payload into the private buffer and mark the
    /// descriptor buffered.
    pub fn buffer_payload(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= self.unex.len());
        self.unex[..payload.len()].copy_from_slice(payload);
        self.unex_len = payload.len();
        self.home = PayloadHome::Private;
    }

    /// The privately buffered payload.
    pub fn buffered_data(&self) -> &[u8] {
        debug_assert!(self.is_buffered());
        &self.unex[..self.unex_len]
    }

    fn reset(&mut self) {
        self.header = Header::Stop;
        self.request = None;
        self.home = PayloadHome::Unset;
        self.unex_len = 0;
        self.bytes_hdr = 0;
        self.bytes_msg = 0;
    }
}

/// How many times an empty-pool acquire retries before surfacing an error.
const ACQUIRE_RETRIES: u32 = 1000;

/// Fixed-capacity pool of receive fragment descriptors.
pub struct RecvPool {
    inner: Mutex<Vec<RecvFrag>>,
}

impl RecvPool {
    pub fn new(count: usize, unex_size: usize) -> Self {
        let mut v = Vec::with_capacity(count);
        v.resize_with(count, || RecvFrag::new(unex_size));
        Self {
            inner: Mutex::new(v),
        }
    }

    /// Acquire a descriptor, retrying with diagnostics while the pool is
    /// empty. Exhaustion is recoverable: concurrent progress returns
    /// descriptors.
    pub fn acquire(&self) -> Result<RecvFrag> {
        for attempt in 0..ACQUIRE_RETRIES {
            if let Some(frag) = self.inner.lock().pop() {
                return Ok(frag);
            }
            if attempt % 64 == 0 {
                warn!(attempt, "retrying receive fragment allocation");
            }
            std::thread::yield_now();
        }
        Err(Error::ResourceExhausted {
            pool: "recv fragment",
            retries: ACQUIRE_RETRIES,
        })
    }

    pub fn release(&self, mut frag: RecvFrag) {
        frag.reset();
        self.inner.lock().push(frag);
    }

    pub fn available(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rail::{Cookie, DmaCmd, EagerDesc, EventWord, RingClass, VpId};

    fn dummy_frag() -> SendFrag {
        SendFrag {
            hw: HwDesc::Eager(EagerDesc {
                main: DmaCmd::QueueWrite {
                    vp: VpId(0),
                    ring: RingClass::Data,
                    cookie: Cookie(0),
                    src: 0,
                    len: 0,
                },
                report: None,
                done: Arc::new(EventWord::new()),
            }),
            header: Header::Stop,
            req: ReqRef::None,
            bytes: 0,
            progressed: AtomicBool::new(false),
            ack_pending: false,
            cached: false,
            buf: Box::new([]),
        }
    }

    #[test]
    fn outstanding_capacity_is_enforced() {
        let table = Outstanding::new(2);
        table.insert_with(|_| Ok(dummy_frag())).unwrap();
        table.insert_with(|_| Ok(dummy_frag())).unwrap();
        assert!(matches!(
            table.insert_with(|_| Ok(dummy_frag())),
            Err(Error::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn head_fired_respects_fifo_order() {
        let table = Outstanding::new(4);
        let a = table.insert_with(|_| Ok(dummy_frag())).unwrap();
        let b = table.insert_with(|_| Ok(dummy_frag())).unwrap();

        // Completing the second descriptor first must not unblock the scan.
        table
            .with_mut(b, |f| f.hw.done().fire())
            .unwrap();
        assert_eq!(table.head_fired(), None);

        table
            .with_mut(a, |f| f.hw.done().fire())
            .unwrap();
        assert_eq!(table.head_fired(), Some(a));
        table.remove(a).unwrap();
        assert_eq!(table.head_fired(), Some(b));
    }

    #[test]
    fn recv_pool_acquire_release() {
        let pool = RecvPool::new(1, 64);
        let mut frag = pool.acquire().unwrap();
        assert_eq!(pool.available(), 0);
        frag.buffer_payload(&[1, 2, 3]);
        assert!(frag.is_buffered());
        assert_eq!(frag.buffered_data(), &[1, 2, 3]);
        pool.release(frag);
        assert_eq!(pool.available(), 1);
        let frag = pool.acquire().unwrap();
        assert_eq!(frag.home, PayloadHome::Unset);
        pool.release(frag);
    }
}
