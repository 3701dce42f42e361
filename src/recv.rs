//! Receive dispatcher.
//!
//! One iteration consumes exactly one delivered slot: decode the header at
//! the ring front, dispatch by kind, then advance the front and event
//! pointers, reset the completion word and re-arm the delivery event. The
//! whole iteration runs under the ring's consumer lock. Handler failures are
//! logged and the slot retired anyway, so a bad delivery can never wedge the
//! ring.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::frag::{PayloadHome, RecvFrag};
use crate::rail::RingClass;
use crate::request::RecvRequest;
use crate::ring::RecvRing;
use crate::wire::{AckFields, FragFields, HdrFlags, Header, MatchFields};
use crate::Transport;

/// Result of one dispatch iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing delivered.
    Idle,
    /// One slot consumed.
    Handled,
    /// Stop sentinel consumed; a dedicated thread should exit.
    Stopped,
}

impl Transport {
    /// Consume at most one delivered slot from `ring`.
    pub(crate) fn dispatch_once(&self, ring: &RecvRing, class: RingClass) -> Outcome {
        let mut front = ring.lock_front();
        if ring.occupied() == 0 {
            return Outcome::Idle;
        }
        let slot = ring.slot(front.front());
        let outcome = match Header::decode(slot) {
            Err(e) => {
                warn!(error = %e, "dropping undecodable delivery");
                Outcome::Handled
            }
            Ok((Header::Stop, _)) => Outcome::Stopped,
            Ok((header, combined)) => {
                if combined || class == RingClass::Completion {
                    self.handle_completion(&header);
                } else if let Err(e) = self.handle_data(&header, slot) {
                    warn!(kind = header.kind(), error = %e, "fragment handler failed");
                }
                Outcome::Handled
            }
        };
        ring.complete_slot(&mut front);
        drop(front);
        self.rail.rearm(ring);
        outcome
    }

    fn handle_data(&self, header: &Header, slot: &[u8]) -> Result<()> {
        if let Some(frag) = header.frag() {
            let end = header.wire_size() + frag.len as usize;
            if matches!(header, Header::Match { .. } | Header::Frag { .. }) && end > slot.len() {
                return Err(Error::ProtocolDesync {
                    kind: header.kind(),
                    size: end as u32,
                });
            }
        }
        match *header {
            Header::Match { flags, frag, mat } => {
                let payload = &slot[header.wire_size()..header.wire_size() + frag.len as usize];
                self.handle_match(flags, frag, mat, payload)
            }
            Header::Frag { frag, .. } => {
                let payload = &slot[header.wire_size()..header.wire_size() + frag.len as usize];
                self.handle_frag(frag, payload)
            }
            Header::Fin { frag, .. } => self.handle_fin(frag),
            Header::Ack { ack, .. } => {
                self.handle_ack(ack, false);
                Ok(())
            }
            Header::Nack { ack, .. } => {
                self.handle_ack(ack, true);
                Ok(())
            }
            Header::FinAck { ack, .. } => {
                self.handle_fin_ack(ack);
                Ok(())
            }
            Header::Stop => Ok(()),
        }
    }

    /// First fragment: match against posted receives, or buffer the inline
    /// payload privately before the slot can be overwritten.
    fn handle_match(
        &self,
        flags: HdrFlags,
        frag: FragFields,
        mat: MatchFields,
        payload: &[u8],
    ) -> Result<()> {
        let mut rfrag = match self.recv_pool.acquire() {
            Ok(f) => f,
            Err(e) => {
                // Tell the sender this fragment went nowhere.
                if let Ok(peer_vp) = self.peer_vp(mat.src_rank) {
                    let _ = self.start_ack(
                        peer_vp,
                        true,
                        AckFields {
                            src_ref: frag.src_ref,
                            ..AckFields::default()
                        },
                    );
                }
                return Err(e);
            }
        };
        rfrag.header = Header::Match { flags, frag, mat };
        rfrag.bytes_hdr = Header::Match { flags, frag, mat }.wire_size() as u32;
        rfrag.bytes_msg = payload.len() as u32;
        match self.matcher.match_recv(self, &mut rfrag, &mat) {
            Some(req) => {
                rfrag.request = Some(Arc::clone(&req));
                rfrag.home = PayloadHome::Request { offset: frag.offset };
                let res = self.deliver_matched(&req, flags, &frag, &mat, payload);
                self.recv_pool.release(rfrag);
                res
            }
            None => {
                rfrag.buffer_payload(payload);
                trace!(
                    src_rank = mat.src_rank,
                    tag = mat.tag,
                    hdr_bytes = rfrag.bytes_hdr,
                    payload_bytes = rfrag.bytes_msg,
                    "unmatched fragment buffered"
                );
                self.unexpected.lock().push(rfrag);
                Ok(())
            }
        }
    }

    /// Land a matched first fragment and kick off the rendezvous remainder
    /// (acknowledgment for peer writes, or a locally originated read).
    fn deliver_matched(
        &self,
        req: &Arc<RecvRequest>,
        flags: HdrFlags,
        frag: &FragFields,
        mat: &MatchFields,
        payload: &[u8],
    ) -> Result<()> {
        let copied = req.write_at(frag.offset as usize, payload) as u64;
        if copied < payload.len() as u64 {
            warn!(
                offset = frag.offset,
                bytes = payload.len(),
                copied,
                "matched fragment truncated at the posted buffer"
            );
        }
        let total = req.add_received(copied);
        let sent = frag.offset + payload.len() as u64;
        let remaining = mat.total_len.saturating_sub(sent);
        // Grant only the space the posted buffer still has.
        let grant = remaining.min(req.total_len().saturating_sub(total));
        let peer_vp = self.peer_vp(mat.src_rank)?;
        if remaining > 0 {
            if self.cfg.prefer_remote_read && self.rail.has_remote_read() && grant > 0 {
                // frag.dst_addr stashes the sender-side address of the
                // remainder.
                self.start_read(peer_vp, req, frag.src_ref, frag.dst_addr, total, grant)?;
            } else {
                let dst_ref = self.rendezvous.lock().insert(Arc::clone(req)) as u32;
                let dst_addr = self
                    .rail
                    .translate(unsafe { req.buf_ptr().add(total as usize) });
                self.start_ack(
                    peer_vp,
                    false,
                    AckFields {
                        src_ref: frag.src_ref,
                        dst_ref,
                        dst_addr,
                        dst_size: grant,
                    },
                )?;
            }
        } else if flags.contains(HdrFlags::ACK_WANTED) {
            self.start_ack(
                peer_vp,
                false,
                AckFields {
                    src_ref: frag.src_ref,
                    dst_ref: 0,
                    dst_addr: 0,
                    dst_size: 0,
                },
            )?;
        }
        self.matcher.recv_progress(self, req, copied, total);
        Ok(())
    }

    /// Follow-up inline fragment addressed through the rendezvous table.
    fn handle_frag(&self, frag: FragFields, payload: &[u8]) -> Result<()> {
        let req = self.rendezvous.lock().get(frag.dst_ref as usize).cloned();
        let Some(req) = req else {
            warn!(dst_ref = frag.dst_ref, "fragment for unknown rendezvous reference dropped");
            return Ok(());
        };
        let copied = req.write_at(frag.offset as usize, payload) as u64;
        if copied < payload.len() as u64 {
            warn!(
                dst_ref = frag.dst_ref,
                offset = frag.offset,
                "fragment past the posted buffer truncated"
            );
        }
        let total = req.add_received(copied);
        if total >= req.total_len() {
            let _ = self.rendezvous.lock().try_remove(frag.dst_ref as usize);
        }
        self.matcher.recv_progress(self, &req, copied, total);
        Ok(())
    }

    /// Rendezvous-write completion: the payload already landed via DMA before
    /// this header could be delivered.
    fn handle_fin(&self, frag: FragFields) -> Result<()> {
        let req = self.rendezvous.lock().get(frag.dst_ref as usize).cloned();
        let Some(req) = req else {
            warn!(dst_ref = frag.dst_ref, "completion notice for unknown rendezvous reference");
            return Ok(());
        };
        let before = req.bytes_received();
        let total = req.add_received(frag.len as u64);
        if total >= req.total_len() {
            let _ = self.rendezvous.lock().try_remove(frag.dst_ref as usize);
        }
        self.matcher.recv_progress(self, &req, total - before, total);
        Ok(())
    }

    /// Ack/Nack: resolve the originating descriptor via the echoed key, copy
    /// the peer's rendezvous coordinates, complete and reclaim.
    fn handle_ack(&self, ack: AckFields, refuse: bool) {
        let req = self.outstanding.with_mut(ack.src_ref, |f| f.req.clone());
        let Some(req) = req else {
            trace!(src_ref = ack.src_ref, "acknowledgment for reclaimed descriptor");
            return;
        };
        if let crate::frag::ReqRef::Send(r) = &req {
            if refuse {
                warn!(src_ref = ack.src_ref, "peer refused fragment");
                r.mark_failed(ack.src_ref);
            } else {
                r.set_peer(ack.dst_ref, ack.dst_addr, ack.dst_size);
            }
        }
        self.send_desc_done(ack.src_ref, None, true);
    }

    /// FinAck: the peer pulled the remainder itself; the descriptor completes
    /// with its inline bytes plus the bytes the peer read.
    fn handle_fin_ack(&self, ack: AckFields) {
        let info = self
            .outstanding
            .with_mut(ack.src_ref, |f| (f.req.clone(), f.bytes));
        let Some((req, inline)) = info else {
            trace!(src_ref = ack.src_ref, "read completion for reclaimed descriptor");
            return;
        };
        if let crate::frag::ReqRef::Send(r) = &req {
            r.set_peer(ack.dst_ref, ack.dst_addr, ack.dst_size);
        }
        self.send_desc_done(ack.src_ref, Some(inline + ack.dst_size), true);
    }

    /// Self-addressed completion copy: every kind carries the local
    /// descriptor key in its back-reference field.
    fn handle_completion(&self, header: &Header) {
        let key = match (header.frag(), header.ack()) {
            (Some(frag), _) => frag.src_ref,
            (_, Some(ack)) => ack.src_ref,
            _ => return,
        };
        self.send_desc_done(key, None, false);
    }

    /// Pull a buffered unexpected fragment whose matching metadata satisfies
    /// `pred`.
    pub fn take_unexpected<F>(&self, pred: F) -> Option<RecvFrag>
    where
        F: Fn(&MatchFields) -> bool,
    {
        let mut list = self.unexpected.lock();
        let pos = list
            .iter()
            .position(|f| matches!(&f.header, Header::Match { mat, .. } if pred(mat)))?;
        Some(list.swap_remove(pos))
    }

    /// Number of fragments waiting in the unexpected list.
    pub fn unexpected_len(&self) -> usize {
        self.unexpected.lock().len()
    }

    /// Land a previously buffered fragment into a now-posted receive, running
    /// the same rendezvous continuation a live match would.
    pub fn deliver_buffered(&self, frag: RecvFrag, req: &Arc<RecvRequest>) -> Result<()> {
        let Header::Match {
            flags,
            frag: ff,
            mat,
        } = frag.header
        else {
            return Err(Error::UnsupportedOperation(
                "buffered fragment is not a first fragment",
            ));
        };
        self.deliver_matched(req, flags, &ff, &mat, frag.buffered_data())?;
        self.recv_pool.release(frag);
        Ok(())
    }
}
