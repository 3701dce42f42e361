//! Wire header layout shared verbatim between peers.
//!
//! Every fragment starts with a fixed common block {kind, flags, size}
//! followed by a kind-specific block. All integers are little-endian and the
//! total size per kind is fixed; `size` is validated on receipt so a
//! truncated or desynchronized slot is dropped instead of misparsed.

use bitflags::bitflags;

use crate::error::Error;

/// First fragment of a message, carrying full matching metadata.
pub const KIND_MATCH: u32 = 1;
/// Follow-up data fragment addressed via the peer's earlier Ack.
pub const KIND_FRAG: u32 = 2;
/// Rendezvous acknowledgment carrying the receiver's buffer coordinates.
pub const KIND_ACK: u32 = 3;
/// Refusal; structurally identical to Ack.
pub const KIND_NACK: u32 = 4;
/// Rendezvous-write completion notice (payload fully arrived).
pub const KIND_FIN: u32 = 5;
/// Rendezvous-read completion notice back to the sender.
pub const KIND_FIN_ACK: u32 = 6;
/// Sentinel telling a dedicated dispatch thread to exit.
pub const KIND_STOP: u32 = 7;

/// High bit marking delivery through a combined completion queue.
pub const KIND_COMBINED: u32 = 0x8000_0000;

pub const COMMON_SIZE: usize = 12;
pub const FRAG_HDR_SIZE: usize = COMMON_SIZE + 32;
pub const MATCH_HDR_SIZE: usize = FRAG_HDR_SIZE + 28;
pub const ACK_HDR_SIZE: usize = COMMON_SIZE + 24;
pub const STOP_HDR_SIZE: usize = COMMON_SIZE;

/// Largest header any slot can carry.
pub const MAX_HDR_SIZE: usize = MATCH_HDR_SIZE;

bitflags! {
    /// Common-block flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HdrFlags: u32 {
        /// Sender wants a rendezvous acknowledgment for this fragment.
        const ACK_WANTED = 1 << 0;
    }
}

/// Data-fragment addressing block, common to Match, Frag and Fin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragFields {
    /// Byte offset of this fragment within the message.
    pub offset: u64,
    /// Fragment sequence within the message.
    pub seq: u32,
    /// Sender-side outstanding-descriptor key, echoed back by the peer.
    pub src_ref: u32,
    /// Receiver-side reference resolved at rendezvous time (Frag/Fin only).
    pub dst_ref: u32,
    /// Remote address: destination for Frag, stashed source for Match.
    pub dst_addr: u64,
    /// Payload bytes carried or announced by this fragment.
    pub len: u32,
}

/// Matching metadata carried only on the first fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchFields {
    pub ctx: u32,
    pub src_rank: u32,
    pub dst_rank: u32,
    pub tag: i32,
    pub total_len: u64,
    pub seq: u32,
}

/// Acknowledgment block, common to Ack, Nack and FinAck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckFields {
    /// Echo of the originating sender descriptor key.
    pub src_ref: u32,
    /// Receiver-side rendezvous reference the sender must echo on Fin.
    pub dst_ref: u32,
    /// Destination address for the remaining bytes.
    pub dst_addr: u64,
    /// Destination size (bytes acknowledged/granted).
    pub dst_size: u64,
}

/// Decoded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Match {
        flags: HdrFlags,
        frag: FragFields,
        mat: MatchFields,
    },
    Frag {
        flags: HdrFlags,
        frag: FragFields,
    },
    Ack {
        flags: HdrFlags,
        ack: AckFields,
    },
    Nack {
        flags: HdrFlags,
        ack: AckFields,
    },
    Fin {
        flags: HdrFlags,
        frag: FragFields,
    },
    FinAck {
        flags: HdrFlags,
        ack: AckFields,
    },
    Stop,
}

impl Header {
    pub fn kind(&self) -> u32 {
        match self {
            Header::Match { .. } => KIND_MATCH,
            Header::Frag { .. } => KIND_FRAG,
            Header::Ack { .. } => KIND_ACK,
            Header::Nack { .. } => KIND_NACK,
            Header::Fin { .. } => KIND_FIN,
            Header::FinAck { .. } => KIND_FIN_ACK,
            Header::Stop => KIND_STOP,
        }
    }

    /// Fixed on-wire size for this header's kind.
    pub fn wire_size(&self) -> usize {
        match self {
            Header::Match { .. } => MATCH_HDR_SIZE,
            Header::Frag { .. } | Header::Fin { .. } => FRAG_HDR_SIZE,
            Header::Ack { .. } | Header::Nack { .. } | Header::FinAck { .. } => ACK_HDR_SIZE,
            Header::Stop => STOP_HDR_SIZE,
        }
    }

    /// Data-fragment block, if this kind carries one.
    pub fn frag(&self) -> Option<&FragFields> {
        match self {
            Header::Match { frag, .. } | Header::Frag { frag, .. } | Header::Fin { frag, .. } => {
                Some(frag)
            }
            _ => None,
        }
    }

    /// Acknowledgment block, if this kind carries one.
    pub fn ack(&self) -> Option<&AckFields> {
        match self {
            Header::Ack { ack, .. } | Header::Nack { ack, .. } | Header::FinAck { ack, .. } => {
                Some(ack)
            }
            _ => None,
        }
    }

    /// Encode into `buf`, returning the bytes written.
    ///
    /// `combined` sets the high discriminant bit, marking the copy as routed
    /// through a combined completion queue.
    pub fn encode(&self, buf: &mut [u8], combined: bool) -> usize {
        let size = self.wire_size();
        debug_assert!(buf.len() >= size);
        let kind = if combined {
            self.kind() | KIND_COMBINED
        } else {
            self.kind()
        };
        put_u32(buf, 0, kind);
        put_u32(buf, 8, size as u32);
        match self {
            Header::Match { flags, frag, mat } => {
                put_u32(buf, 4, flags.bits());
                encode_frag(buf, frag);
                put_u32(buf, 44, mat.ctx);
                put_u32(buf, 48, mat.src_rank);
                put_u32(buf, 52, mat.dst_rank);
                put_u32(buf, 56, mat.tag as u32);
                put_u64(buf, 60, mat.total_len);
                put_u32(buf, 68, mat.seq);
            }
            Header::Frag { flags, frag } | Header::Fin { flags, frag } => {
                put_u32(buf, 4, flags.bits());
                encode_frag(buf, frag);
            }
            Header::Ack { flags, ack }
            | Header::Nack { flags, ack }
            | Header::FinAck { flags, ack } => {
                put_u32(buf, 4, flags.bits());
                put_u32(buf, 12, ack.src_ref);
                put_u32(buf, 16, ack.dst_ref);
                put_u64(buf, 20, ack.dst_addr);
                put_u64(buf, 28, ack.dst_size);
            }
            Header::Stop => {
                put_u32(buf, 4, 0);
            }
        }
        size
    }

    /// Decode the header at the front of `buf`.
    ///
    /// Returns the header and whether the combined-queue bit was set. Size is
    /// validated against the fixed per-kind layout; a mismatch or unknown
    /// kind is a [`Error::ProtocolDesync`].
    pub fn decode(buf: &[u8]) -> Result<(Header, bool), Error> {
        if buf.len() < COMMON_SIZE {
            return Err(Error::ProtocolDesync {
                kind: 0,
                size: buf.len() as u32,
            });
        }
        let raw_kind = get_u32(buf, 0);
        let combined = raw_kind & KIND_COMBINED != 0;
        let kind = raw_kind & !KIND_COMBINED;
        let flags = HdrFlags::from_bits_retain(get_u32(buf, 4));
        let size = get_u32(buf, 8);

        let expected = wire_size_of(kind).ok_or(Error::ProtocolDesync { kind, size })?;
        if size as usize != expected || buf.len() < expected {
            return Err(Error::ProtocolDesync { kind, size });
        }

        let hdr = match kind {
            KIND_MATCH => Header::Match {
                flags,
                frag: decode_frag(buf),
                mat: MatchFields {
                    ctx: get_u32(buf, 44),
                    src_rank: get_u32(buf, 48),
                    dst_rank: get_u32(buf, 52),
                    tag: get_u32(buf, 56) as i32,
                    total_len: get_u64(buf, 60),
                    seq: get_u32(buf, 68),
                },
            },
            KIND_FRAG => Header::Frag {
                flags,
                frag: decode_frag(buf),
            },
            KIND_FIN => Header::Fin {
                flags,
                frag: decode_frag(buf),
            },
            KIND_ACK => Header::Ack {
                flags,
                ack: decode_ack(buf),
            },
            KIND_NACK => Header::Nack {
                flags,
                ack: decode_ack(buf),
            },
            KIND_FIN_ACK => Header::FinAck {
                flags,
                ack: decode_ack(buf),
            },
            KIND_STOP => Header::Stop,
            _ => unreachable!("wire_size_of filtered unknown kinds"),
        };
        Ok((hdr, combined))
    }
}

fn wire_size_of(kind: u32) -> Option<usize> {
    match kind {
        KIND_MATCH => Some(MATCH_HDR_SIZE),
        KIND_FRAG | KIND_FIN => Some(FRAG_HDR_SIZE),
        KIND_ACK | KIND_NACK | KIND_FIN_ACK => Some(ACK_HDR_SIZE),
        KIND_STOP => Some(STOP_HDR_SIZE),
        _ => None,
    }
}

fn encode_frag(buf: &mut [u8], frag: &FragFields) {
    put_u64(buf, 12, frag.offset);
    put_u32(buf, 20, frag.seq);
    put_u32(buf, 24, frag.src_ref);
    put_u32(buf, 28, frag.dst_ref);
    put_u64(buf, 32, frag.dst_addr);
    put_u32(buf, 40, frag.len);
}

fn decode_frag(buf: &[u8]) -> FragFields {
    FragFields {
        offset: get_u64(buf, 12),
        seq: get_u32(buf, 20),
        src_ref: get_u32(buf, 24),
        dst_ref: get_u32(buf, 28),
        dst_addr: get_u64(buf, 32),
        len: get_u32(buf, 40),
    }
}

fn decode_ack(buf: &[u8]) -> AckFields {
    AckFields {
        src_ref: get_u32(buf, 12),
        dst_ref: get_u32(buf, 16),
        dst_addr: get_u64(buf, 20),
        dst_size: get_u64(buf, 28),
    }
}

#[inline]
fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}
