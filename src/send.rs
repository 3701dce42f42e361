//! Send-side descriptor builders.
//!
//! Every builder reserves an outstanding-table key first (the key goes on the
//! wire as `src_ref`), stages the header in a private buffer, fills one
//! [`HwDesc`] chain, issues the visibility barrier and submits. A failure
//! anywhere before submission drops the reservation without touching shared
//! state.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};
use crate::frag::{ReqRef, SendFrag};
use crate::rail::{
    membar_drain, membar_visible, DmaAddr, DmaCmd, EagerDesc, EventWord, HwDesc, QueueKind,
    ReadDesc, RingClass, VpId, WriteDesc,
};
use crate::request::{RecvRequest, SendRequest};
use crate::wire::{
    AckFields, FragFields, HdrFlags, Header, MatchFields, ACK_HDR_SIZE, FRAG_HDR_SIZE,
    MATCH_HDR_SIZE, STOP_HDR_SIZE,
};
use crate::{CompletionStrategy, Peer, Transport};

/// Per-send knobs exposed to the matching layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOpts {
    /// Request a peer acknowledgment even for a fully inline fragment.
    pub ack: bool,
    /// Leave descriptor reclaim to the caller (see
    /// [`Transport::release_cached`]).
    pub cached: bool,
}

impl Transport {
    /// Eager fragment: Match header at offset 0, Frag header (addressed via
    /// the peer's earlier Ack) afterwards, payload packed inline. Returns the
    /// bytes actually packed.
    pub(crate) fn start_eager(
        &self,
        peer: &Peer,
        req: &Arc<SendRequest>,
        offset: u64,
        len: u64,
        opts: SendOpts,
    ) -> Result<usize> {
        let want = len.min(self.eager_limit() as u64) as usize;
        let hdr_size = if offset == 0 {
            MATCH_HDR_SIZE
        } else {
            FRAG_HDR_SIZE
        };
        let mut packed = 0usize;
        let key = self.outstanding.insert_with(|key| {
            let mut buf =
                vec![0u8; hdr_size + want + self.report_room(hdr_size)].into_boxed_slice();
            let n = self
                .packer
                .pack(req, offset, &mut buf[hdr_size..hdr_size + want])?;
            packed = n;

            let rendezvous = offset == 0 && (n as u64) < req.total_len();
            let mut flags = HdrFlags::empty();
            if opts.ack || rendezvous {
                flags |= HdrFlags::ACK_WANTED;
            }
            let header = if offset == 0 {
                // dst_addr stashes where the remainder starts, so a
                // read-capable receiver can pull it directly.
                let stash = self.rail.translate(req.data()[n..].as_ptr());
                Header::Match {
                    flags,
                    frag: FragFields {
                        offset,
                        seq: req.seq,
                        src_ref: key,
                        dst_ref: 0,
                        dst_addr: stash,
                        len: n as u32,
                    },
                    mat: MatchFields {
                        ctx: req.ctx,
                        src_rank: self.rail.vp().0,
                        dst_rank: req.peer_rank,
                        tag: req.tag,
                        total_len: req.total_len(),
                        seq: req.seq,
                    },
                }
            } else {
                let dst_ref = req.peer_match().ok_or(Error::UnsupportedOperation(
                    "follow-up fragment before acknowledgment",
                ))?;
                Header::Frag {
                    flags,
                    frag: FragFields {
                        offset,
                        seq: req.seq,
                        src_ref: key,
                        dst_ref,
                        dst_addr: req.peer_addr(),
                        len: n as u32,
                    },
                }
            };
            header.encode(&mut buf[..hdr_size], false);

            let main_len = hdr_size + n;
            let main = DmaCmd::QueueWrite {
                vp: peer.vp,
                ring: RingClass::Data,
                cookie: self.rail.local_cookie(peer.vp),
                src: self.rail.translate(buf.as_ptr()),
                len: main_len as u32,
            };
            let report = self.self_report(&header, key, &mut buf, main_len);
            let frag = SendFrag {
                hw: HwDesc::Eager(EagerDesc {
                    main,
                    report,
                    done: Arc::new(EventWord::new()),
                }),
                header,
                req: ReqRef::Send(Arc::clone(req)),
                bytes: n as u64,
                progressed: AtomicBool::new(false),
                ack_pending: flags.contains(HdrFlags::ACK_WANTED),
                cached: opts.cached,
                buf,
            };
            membar_visible();
            self.rail.submit(QueueKind::Tx, &frag.hw)?;
            self.rail.flush(QueueKind::Tx);
            Ok(frag)
        })?;
        trace!(key, peer = peer.vp.0, offset, bytes = packed, "eager fragment submitted");
        Ok(packed)
    }

    /// Rendezvous write: bulk payload into the peer's acknowledged buffer,
    /// chained before the Fin header so the notice can never outrun the data.
    /// Returns the bytes covered.
    pub(crate) fn start_write(
        &self,
        peer: &Peer,
        req: &Arc<SendRequest>,
        offset: u64,
        len: u64,
    ) -> Result<usize> {
        let dst_ref = req.peer_match().ok_or(Error::UnsupportedOperation(
            "rendezvous write before acknowledgment",
        ))?;
        let n = len.min(req.peer_size());
        let key = self.outstanding.insert_with(|key| {
            let mut buf =
                vec![0u8; FRAG_HDR_SIZE + self.report_room(FRAG_HDR_SIZE)].into_boxed_slice();
            let header = Header::Fin {
                flags: HdrFlags::empty(),
                frag: FragFields {
                    offset,
                    seq: req.seq,
                    src_ref: key,
                    dst_ref,
                    dst_addr: req.peer_addr(),
                    len: n as u32,
                },
            };
            header.encode(&mut buf[..FRAG_HDR_SIZE], false);

            let payload = DmaCmd::MemWrite {
                vp: peer.vp,
                cookie: self.rail.local_cookie(peer.vp),
                src: self.rail.translate(req.data()[offset as usize..].as_ptr()),
                dst: req.peer_addr(),
                len: n as u32,
            };
            let fin = DmaCmd::QueueWrite {
                vp: peer.vp,
                ring: RingClass::Data,
                cookie: self.rail.local_cookie(peer.vp),
                src: self.rail.translate(buf.as_ptr()),
                len: FRAG_HDR_SIZE as u32,
            };
            let report = self.self_report(&header, key, &mut buf, FRAG_HDR_SIZE);
            let frag = SendFrag {
                hw: HwDesc::Write(WriteDesc {
                    payload,
                    fin,
                    report,
                    done: Arc::new(EventWord::new()),
                }),
                header,
                req: ReqRef::Send(Arc::clone(req)),
                bytes: n,
                progressed: AtomicBool::new(false),
                ack_pending: false,
                cached: false,
                buf,
            };
            // Payload lives in main memory the engine reads directly.
            membar_drain();
            self.rail.submit(QueueKind::Put, &frag.hw)?;
            self.rail.flush(QueueKind::Put);
            Ok(frag)
        })?;
        trace!(key, peer = peer.vp.0, offset, bytes = n, "rendezvous write submitted");
        Ok(n as usize)
    }

    /// Rendezvous read, receiver side: pull the remainder the sender stashed
    /// in its Match header, chained to a FinAck back to the sender.
    pub(crate) fn start_read(
        &self,
        peer_vp: VpId,
        req: &Arc<RecvRequest>,
        src_ref: u32,
        remote_src: DmaAddr,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        if !self.rail.has_remote_read() {
            return Err(Error::UnsupportedOperation(
                "interface cannot originate remote reads",
            ));
        }
        let key = self.outstanding.insert_with(|key| {
            // Offset stays within the posted buffer: the protocol only hands
            // out ranges inside the declared total.
            let local_dst = self
                .rail
                .translate(unsafe { req.buf_ptr().add(offset as usize) });
            let header = Header::FinAck {
                flags: HdrFlags::empty(),
                ack: AckFields {
                    src_ref,
                    dst_ref: key,
                    dst_addr: local_dst,
                    dst_size: len,
                },
            };
            let mut buf =
                vec![0u8; ACK_HDR_SIZE + self.report_room(ACK_HDR_SIZE)].into_boxed_slice();
            header.encode(&mut buf[..ACK_HDR_SIZE], false);

            let read = DmaCmd::MemRead {
                vp: peer_vp,
                cookie: self.rail.remote_cookie(peer_vp),
                src: remote_src,
                dst: local_dst,
                len: len as u32,
            };
            let fin_ack = DmaCmd::QueueWrite {
                vp: peer_vp,
                ring: RingClass::Data,
                cookie: self.rail.local_cookie(peer_vp),
                src: self.rail.translate(buf.as_ptr()),
                len: ACK_HDR_SIZE as u32,
            };
            let report = self.self_report(&header, key, &mut buf, ACK_HDR_SIZE);
            let frag = SendFrag {
                hw: HwDesc::Read(ReadDesc {
                    read,
                    fin_ack,
                    report,
                    done: Arc::new(EventWord::new()),
                }),
                header,
                req: ReqRef::Recv(Arc::clone(req)),
                bytes: len,
                progressed: AtomicBool::new(false),
                ack_pending: false,
                cached: false,
                buf,
            };
            membar_visible();
            self.rail.submit(QueueKind::Get, &frag.hw)?;
            self.rail.flush(QueueKind::Get);
            Ok(frag)
        })?;
        trace!(key, peer = peer_vp.0, offset, bytes = len, "rendezvous read submitted");
        Ok(())
    }

    /// Ack (or Nack when `refuse`): echo the sender's descriptor key plus the
    /// receiver's rendezvous coordinates.
    pub(crate) fn start_ack(&self, peer_vp: VpId, refuse: bool, ack: AckFields) -> Result<()> {
        let key = self.outstanding.insert_with(|key| {
            let header = if refuse {
                Header::Nack {
                    flags: HdrFlags::empty(),
                    ack,
                }
            } else {
                Header::Ack {
                    flags: HdrFlags::empty(),
                    ack,
                }
            };
            let mut buf =
                vec![0u8; ACK_HDR_SIZE + self.report_room(ACK_HDR_SIZE)].into_boxed_slice();
            header.encode(&mut buf[..ACK_HDR_SIZE], false);

            let main = DmaCmd::QueueWrite {
                vp: peer_vp,
                ring: RingClass::Data,
                cookie: self.rail.local_cookie(peer_vp),
                src: self.rail.translate(buf.as_ptr()),
                len: ACK_HDR_SIZE as u32,
            };
            let report = self.self_report(&header, key, &mut buf, ACK_HDR_SIZE);
            let frag = SendFrag {
                hw: HwDesc::Eager(EagerDesc {
                    main,
                    report,
                    done: Arc::new(EventWord::new()),
                }),
                header,
                req: ReqRef::None,
                bytes: 0,
                progressed: AtomicBool::new(false),
                ack_pending: false,
                cached: false,
                buf,
            };
            membar_visible();
            self.rail.submit(QueueKind::Tx, &frag.hw)?;
            self.rail.flush(QueueKind::Tx);
            Ok(frag)
        })?;
        trace!(key, peer = peer_vp.0, refuse, src_ref = ack.src_ref, "acknowledgment submitted");
        Ok(())
    }

    /// Deliver a Stop sentinel into one of this transport's own rings so a
    /// dedicated dispatch thread unblocks and exits. Stands outside the
    /// outstanding table; the staging buffer is held until the interface
    /// consumed it.
    pub(crate) fn start_stop(&self, ring: RingClass) -> Result<()> {
        let mut buf = vec![0u8; STOP_HDR_SIZE].into_boxed_slice();
        Header::Stop.encode(&mut buf, false);
        let done = Arc::new(EventWord::new());
        let hw = HwDesc::Eager(EagerDesc {
            main: DmaCmd::QueueWrite {
                vp: self.rail.vp(),
                ring,
                cookie: self.rail.local_cookie(self.rail.vp()),
                src: self.rail.translate(buf.as_ptr()),
                len: STOP_HDR_SIZE as u32,
            },
            report: None,
            done: Arc::clone(&done),
        });
        membar_visible();
        self.rail.submit(QueueKind::Tx, &hw)?;
        self.rail.flush(QueueKind::Tx);
        while !self.rail.poll_event(&done, Duration::from_millis(10)) {}
        Ok(())
    }

    /// Staging room for the self-addressed completion copy, if the configured
    /// strategy uses one.
    fn report_room(&self, hdr_size: usize) -> usize {
        match self.cfg.completion {
            CompletionStrategy::Poll => 0,
            CompletionStrategy::Queue | CompletionStrategy::Combined => hdr_size,
        }
    }

    /// Chained queue write delivering a header copy back to this transport's
    /// own completion path. Ack-type copies get `src_ref` rewritten to the
    /// local key, since that field otherwise echoes the peer's table.
    fn self_report(&self, header: &Header, key: u32, buf: &mut [u8], at: usize) -> Option<DmaCmd> {
        let (ring, combined) = match self.cfg.completion {
            CompletionStrategy::Queue => (RingClass::Completion, false),
            CompletionStrategy::Combined => (RingClass::Data, true),
            CompletionStrategy::Poll => return None,
        };
        let copy = match *header {
            Header::Ack { flags, mut ack } => {
                ack.src_ref = key;
                Header::Ack { flags, ack }
            }
            Header::Nack { flags, mut ack } => {
                ack.src_ref = key;
                Header::Nack { flags, ack }
            }
            Header::FinAck { flags, mut ack } => {
                ack.src_ref = key;
                Header::FinAck { flags, ack }
            }
            h => h,
        };
        let n = copy.encode(&mut buf[at..], combined);
        Some(DmaCmd::QueueWrite {
            vp: self.rail.vp(),
            ring,
            cookie: self.rail.local_cookie(self.rail.vp()),
            src: self.rail.translate(buf[at..].as_ptr()),
            len: n as u32,
        })
    }
}
