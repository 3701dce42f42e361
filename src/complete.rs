//! Completion and reclaim engine.
//!
//! A descriptor can be signalled more than once (local completion word, a
//! self-addressed completion copy, a peer acknowledgment); the `progressed`
//! flag's single 0 -> 1 transition decides which signal reports upstream and
//! reclaims. Descriptors still waiting on a peer acknowledgment defer their
//! local completion instead.

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::frag::ReqRef;
use crate::Transport;

enum Action {
    Defer,
    Dup,
    First {
        req: ReqRef,
        bytes: u64,
        cached: bool,
    },
}

impl Transport {
    /// Complete the descriptor at `key` exactly once.
    ///
    /// `bytes_override` replaces the descriptor's own byte count in the
    /// upstream report (rendezvous reads complete the whole message).
    /// `from_peer` marks signals carried by a peer acknowledgment, which are
    /// the only ones allowed to finish an ack-pending descriptor.
    ///
    /// Returns whether this call was the completing one.
    pub(crate) fn send_desc_done(
        &self,
        key: u32,
        bytes_override: Option<u64>,
        from_peer: bool,
    ) -> bool {
        let action = self.outstanding.with_mut(key, |frag| {
            if frag.ack_pending && !from_peer {
                return Action::Defer;
            }
            let first = frag
                .progressed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if first {
                Action::First {
                    req: frag.req.clone(),
                    bytes: bytes_override.unwrap_or(frag.bytes),
                    cached: frag.cached,
                }
            } else {
                Action::Dup
            }
        });
        match action {
            None => {
                trace!(key, "completion for reclaimed descriptor");
                false
            }
            Some(Action::Defer) => {
                // Local send finished, but the upstream report needs the
                // peer's coordinates; drop out of the completion scan only.
                self.outstanding.unlink(key);
                trace!(key, "local completion deferred until acknowledgment");
                false
            }
            Some(Action::Dup) => {
                trace!(key, "duplicate completion ignored");
                false
            }
            Some(Action::First { req, bytes, cached }) => {
                match req {
                    ReqRef::Send(r) => {
                        // A refused request's descriptor is reclaimed without
                        // counting bytes; the failure already reached it.
                        if r.is_failed() {
                            trace!(key, "descriptor of refused request reclaimed");
                        } else {
                            let total = r.add_acked(bytes);
                            self.matcher.send_progress(self, &r, total);
                        }
                    }
                    ReqRef::Recv(r) => {
                        let total = r.add_received(bytes);
                        self.matcher.recv_progress(self, &r, bytes, total);
                    }
                    ReqRef::None => {}
                }
                if cached {
                    self.outstanding.unlink(key);
                } else {
                    self.outstanding.remove(key);
                }
                true
            }
        }
    }

    /// Poll-based completion: walk outstanding sends in submission order,
    /// stopping at the first descriptor whose completion word has not fired.
    /// Returns how many descriptors the scan retired.
    pub(crate) fn poll_completions(&self) -> usize {
        let mut retired = 0;
        while let Some(key) = self.outstanding.head_fired() {
            if self.send_desc_done(key, None, false) {
                retired += 1;
            } else {
                // Deferred or duplicate; either way the scan must move past.
                self.outstanding.unlink(key);
            }
        }
        retired
    }

    /// Reclaim a cached descriptor. Cached descriptors report upstream like
    /// any other but their storage stays until the owner releases it.
    pub fn release_cached(&self, key: u32) {
        if self.outstanding.remove(key).is_none() {
            trace!(key, "release of unknown cached descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::Arc;

    use crate::frag::{ReqRef, SendFrag};
    use crate::loopback::{LoopbackFabric, LoopbackRail};
    use crate::rail::{Cookie, DmaCmd, EagerDesc, EventWord, HwDesc, RingClass, VpId};
    use crate::request::{Matcher, RecvRequest, SendRequest};
    use crate::wire::{Header, MatchFields};
    use crate::{Transport, TransportConfig};

    struct CountingMatcher {
        send_reports: AtomicU64,
    }

    impl Matcher for CountingMatcher {
        fn match_recv(
            &self,
            _owner: &Transport,
            _frag: &mut crate::frag::RecvFrag,
            _mat: &MatchFields,
        ) -> Option<Arc<RecvRequest>> {
            None
        }

        fn recv_progress(
            &self,
            _owner: &Transport,
            _req: &Arc<RecvRequest>,
            _bytes: u64,
            _total: u64,
        ) {
        }

        fn send_progress(&self, _owner: &Transport, _req: &Arc<SendRequest>, _acked: u64) {
            self.send_reports.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    fn transport(matcher: Arc<CountingMatcher>) -> Arc<Transport> {
        let fabric = LoopbackFabric::new();
        let rail = Arc::new(LoopbackRail::new(VpId(0), fabric.clone(), false));
        let t = Transport::new(rail, matcher, TransportConfig::default()).unwrap();
        fabric.register(VpId(0), t.data_ring(), t.comp_ring());
        t
    }

    fn plant_descriptor(t: &Transport, req: &Arc<SendRequest>, cached: bool) -> u32 {
        t.outstanding
            .insert_with(|_| {
                Ok(SendFrag {
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
                    req: ReqRef::Send(Arc::clone(req)),
                    bytes: 8,
                    progressed: AtomicBool::new(false),
                    ack_pending: false,
                    cached,
                    buf: Box::new([]),
                })
            })
            .unwrap()
    }

    #[test]
    fn triple_signal_completes_once() {
        let matcher = Arc::new(CountingMatcher {
            send_reports: AtomicU64::new(0),
        });
        let t = transport(matcher.clone());
        let req = Arc::new(SendRequest::new(0, 0, 0, 0, vec![0u8; 8]));
        let key = plant_descriptor(&t, &req, false);

        // Acknowledgment, self completion and a spurious repeat.
        assert!(t.send_desc_done(key, None, true));
        assert!(!t.send_desc_done(key, None, false));
        assert!(!t.send_desc_done(key, None, true));

        assert_eq!(
            matcher.send_reports.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert!(t.outstanding.is_empty());
        assert_eq!(req.bytes_acked(), 8);
    }

    #[test]
    fn cached_descriptor_survives_completion() {
        let matcher = Arc::new(CountingMatcher {
            send_reports: AtomicU64::new(0),
        });
        let t = transport(matcher.clone());
        let req = Arc::new(SendRequest::new(0, 0, 0, 0, vec![0u8; 8]));
        let key = plant_descriptor(&t, &req, true);

        assert!(t.send_desc_done(key, None, true));
        // Completed but not reclaimed; the owner releases it.
        assert_eq!(t.outstanding.len(), 1);
        t.release_cached(key);
        assert!(t.outstanding.is_empty());
    }

    #[test]
    fn deferred_head_is_not_counted_as_retired() {
        let matcher = Arc::new(CountingMatcher {
            send_reports: AtomicU64::new(0),
        });
        let t = transport(matcher.clone());
        let req = Arc::new(SendRequest::new(0, 0, 0, 0, vec![0u8; 8]));
        let key = plant_descriptor(&t, &req, false);
        t.outstanding.with_mut(key, |f| {
            f.ack_pending = true;
            f.hw.done().fire();
        });

        // Local completion defers; nothing was actually retired.
        assert_eq!(t.poll_completions(), 0);
        assert_eq!(t.outstanding.len(), 1);
        assert_eq!(
            matcher.send_reports.load(std::sync::atomic::Ordering::Relaxed),
            0
        );

        // The acknowledgment finishes it.
        assert!(t.send_desc_done(key, None, true));
        assert!(t.outstanding.is_empty());
    }

    #[test]
    fn refused_request_reclaims_without_progress() {
        let matcher = Arc::new(CountingMatcher {
            send_reports: AtomicU64::new(0),
        });
        let t = transport(matcher.clone());
        let req = Arc::new(SendRequest::new(0, 0, 0, 0, vec![0u8; 8]));
        let key = plant_descriptor(&t, &req, false);
        req.mark_failed(key);

        assert!(t.send_desc_done(key, None, true));
        assert!(t.outstanding.is_empty());
        assert_eq!(req.bytes_acked(), 0);
        assert_eq!(
            matcher.send_reports.load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn completion_scan_is_idempotent() {
        let matcher = Arc::new(CountingMatcher {
            send_reports: AtomicU64::new(0),
        });
        let t = transport(matcher.clone());
        let req = Arc::new(SendRequest::new(0, 0, 0, 0, vec![0u8; 8]));
        let key = plant_descriptor(&t, &req, false);
        t.outstanding.with_mut(key, |f| f.hw.done().fire());

        assert_eq!(t.poll_completions(), 1);
        assert_eq!(t.poll_completions(), 0);
        assert_eq!(
            matcher.send_reports.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
