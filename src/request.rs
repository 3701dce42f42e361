//! Interface consumed from the message-matching layer.
//!
//! The matching layer owns request objects and match keys; the transport only
//! reads match metadata, fills in peer rendezvous coordinates learned from
//! acknowledgments, and reports byte progress back through [`Matcher`].

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::frag::RecvFrag;
use crate::wire::MatchFields;
use crate::Transport;

/// Outgoing message owned by the matching layer.
///
/// Peer rendezvous fields start unset and are filled from the peer's Ack;
/// they are atomics because an acknowledgment handler and a completion
/// handler may touch the same request from different progress threads.
pub struct SendRequest {
    pub peer_rank: u32,
    pub tag: i32,
    pub ctx: u32,
    pub seq: u32,
    data: Box<[u8]>,
    /// Peer rendezvous reference, stored as key + 1 (0 = unset).
    peer_match: AtomicU32,
    peer_addr: AtomicU64,
    peer_size: AtomicU64,
    bytes_acked: AtomicU64,
    /// Nacked descriptor key + 1 (0 = not refused).
    failed: AtomicU32,
}

impl SendRequest {
    pub fn new(peer_rank: u32, tag: i32, ctx: u32, seq: u32, data: Vec<u8>) -> Self {
        Self {
            peer_rank,
            tag,
            ctx,
            seq,
            data: data.into_boxed_slice(),
            peer_match: AtomicU32::new(0),
            peer_addr: AtomicU64::new(0),
            peer_size: AtomicU64::new(0),
            bytes_acked: AtomicU64::new(0),
            failed: AtomicU32::new(0),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn total_len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Record the rendezvous coordinates from a peer acknowledgment.
    pub fn set_peer(&self, match_ref: u32, addr: u64, size: u64) {
        self.peer_addr.store(addr, Ordering::Relaxed);
        self.peer_size.store(size, Ordering::Relaxed);
        self.peer_match.store(match_ref + 1, Ordering::Release);
    }

    /// Peer rendezvous reference, once an Ack delivered one.
    pub fn peer_match(&self) -> Option<u32> {
        match self.peer_match.load(Ordering::Acquire) {
            0 => None,
            v => Some(v - 1),
        }
    }

    pub fn peer_addr(&self) -> u64 {
        self.peer_addr.load(Ordering::Relaxed)
    }

    pub fn peer_size(&self) -> u64 {
        self.peer_size.load(Ordering::Relaxed)
    }

    /// Add acknowledged bytes. The counter saturates at the declared total.
    pub fn add_acked(&self, delta: u64) -> u64 {
        saturating_add(&self.bytes_acked, delta, self.total_len())
    }

    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked.load(Ordering::Acquire)
    }

    pub fn mark_failed(&self, src_ref: u32) {
        self.failed.store(src_ref + 1, Ordering::Release);
    }

    /// The descriptor key the peer nacked, if any. Retry policy is the
    /// matching layer's.
    pub fn failed_ref(&self) -> Option<u32> {
        match self.failed.load(Ordering::Acquire) {
            0 => None,
            v => Some(v - 1),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed_ref().is_some()
    }
}

/// Posted receive owned by the matching layer.
///
/// The destination buffer is written by matched fragment handlers and by the
/// interface's DMA engine (rendezvous write/read land directly in it).
pub struct RecvRequest {
    pub peer_rank: u32,
    pub tag: i32,
    pub ctx: u32,
    buf: UnsafeCell<Box<[u8]>>,
    bytes_received: AtomicU64,
}

// Fragment handlers write disjoint [offset, offset+len) ranges, serialized by
// the delivering ring's lock; DMA writes target ranges the protocol hands out
// exactly once via Ack. Concurrent readers only run after completion.
unsafe impl Send for RecvRequest {}
unsafe impl Sync for RecvRequest {}

impl RecvRequest {
    pub fn new(peer_rank: u32, tag: i32, ctx: u32, capacity: usize) -> Self {
        Self {
            peer_rank,
            tag,
            ctx,
            buf: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn total_len(&self) -> u64 {
        unsafe { (&*self.buf.get()).len() as u64 }
    }

    /// Raw destination buffer address for rendezvous coordinates.
    pub fn buf_ptr(&self) -> *mut u8 {
        unsafe { (&mut *self.buf.get()).as_mut_ptr() }
    }

    /// Copy an inline payload into the destination buffer, truncating at the
    /// declared length. Returns the bytes actually copied; 0 when `offset`
    /// falls past the buffer entirely.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> usize {
        let len = self.total_len() as usize;
        if offset >= len {
            return 0;
        }
        let n = data.len().min(len - offset);
        unsafe {
            let dst = (&mut *self.buf.get()).as_mut_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, n);
        }
        n
    }

    /// Add received bytes. The counter saturates at the declared total.
    pub fn add_received(&self, delta: u64) -> u64 {
        saturating_add(&self.bytes_received, delta, self.total_len())
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Acquire)
    }

    /// View the destination buffer. Only meaningful once no fragment or DMA
    /// for this request is in flight.
    pub fn data(&self) -> &[u8] {
        unsafe { &*self.buf.get() }
    }
}

/// Add `delta` to a byte counter without ever exceeding `limit`.
fn saturating_add(counter: &AtomicU64, delta: u64, limit: u64) -> u64 {
    let mut cur = counter.load(Ordering::Acquire);
    loop {
        let new = cur.saturating_add(delta).min(limit);
        match counter.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return new,
            Err(seen) => cur = seen,
        }
    }
}

/// Message-matching layer callbacks.
///
/// Callbacks run inside a dispatch iteration, under the delivering ring's
/// lock. They may submit new sends but must not re-enter
/// [`Transport::progress`].
pub trait Matcher: Send + Sync {
    /// Match an arriving first fragment against posted receives.
    ///
    /// Returns the matched request, or `None` to let the transport buffer the
    /// fragment as unexpected.
    fn match_recv(
        &self,
        owner: &Transport,
        frag: &mut RecvFrag,
        mat: &MatchFields,
    ) -> Option<Arc<RecvRequest>>;

    /// A fragment's payload has fully arrived for `req`.
    fn recv_progress(
        &self,
        owner: &Transport,
        req: &Arc<RecvRequest>,
        bytes_this_fragment: u64,
        bytes_total: u64,
    );

    /// `bytes_acked` of `req` are complete on the send side.
    fn send_progress(&self, owner: &Transport, req: &Arc<SendRequest>, bytes_acked: u64);
}

/// Payload copy/conversion hook for non-contiguous application buffers.
///
/// The default packer is a straight copy; the matching layer may inject a
/// datatype-aware converter instead.
pub trait Packer: Send + Sync {
    /// Pack up to `dst.len()` bytes of `req`'s payload starting at `offset`.
    /// Returns the bytes actually packed, which may be less than requested.
    fn pack(&self, req: &SendRequest, offset: u64, dst: &mut [u8]) -> Result<usize>;
}

/// Contiguous-buffer packer.
pub struct ContigPacker;

impl Packer for ContigPacker {
    fn pack(&self, req: &SendRequest, offset: u64, dst: &mut [u8]) -> Result<usize> {
        let data = req.data();
        let offset = offset as usize;
        if offset > data.len() {
            return Err(Error::PackFailure(format!(
                "offset {} past payload end {}",
                offset,
                data.len()
            )));
        }
        let n = dst.len().min(data.len() - offset);
        dst[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }
}
