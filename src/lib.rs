//! Reliable point-to-point fragment transport over a remote-DMA interface.
//!
//! `fraglink` sits between a message-matching layer (which owns requests and
//! decides what a fragment matches) and a raw interface-access layer (command
//! queues, DMA descriptors, completion events, modelled by [`rail::Rail`]).
//! It fragments messages, picks a transfer strategy per fragment — eager
//! inline copy for small payloads, rendezvous write or rendezvous read for
//! the rest — drives the handshake, and reclaims every descriptor exactly
//! once.
//!
//! One [`Transport`] serves one rail. Progress is poll-driven through
//! [`Transport::progress`], or delegated to dedicated threads in
//! [`DispatchMode::Threaded`].

pub mod error;
pub mod frag;
pub mod loopback;
pub mod rail;
pub mod request;
pub mod ring;
pub mod wait;
pub mod wire;

mod complete;
mod recv;
mod send;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use slab::Slab;
use tracing::debug;

pub use error::{Error, Result};
pub use recv::Outcome;
pub use send::SendOpts;

use frag::{Outstanding, RecvFrag, RecvPool};
use rail::{Rail, RingClass, VpId};
use request::{ContigPacker, Matcher, Packer, RecvRequest, SendRequest};
use ring::RecvRing;
use wait::{wait_event, SleepPool};
use wire::MAX_HDR_SIZE;

/// How dispatch is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Callers drive everything through [`Transport::progress`].
    Polled,
    /// Dedicated threads block in the wait helper and exit on Stop.
    Threaded,
}

/// How send completions are observed. Chosen at construction; the strategies
/// are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStrategy {
    /// Self-addressed header copies into a dedicated completion ring.
    Queue,
    /// Self-addressed copies share the data ring, marked by the high
    /// discriminant bit.
    Combined,
    /// No copies; outstanding sends are scanned in submission order.
    Poll,
}

/// Construction-time knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Ring slot size; also bounds the eager payload (slot minus the largest
    /// header).
    pub slot_size: usize,
    pub data_slots: usize,
    pub comp_slots: usize,
    /// Receive fragment descriptors in the pool.
    pub recv_frags: usize,
    /// In-flight send descriptors.
    pub max_outstanding: usize,
    pub dispatch: DispatchMode,
    pub completion: CompletionStrategy,
    /// Pull rendezvous remainders with remote reads instead of acknowledging
    /// for peer writes. Requires the rail capability.
    pub prefer_remote_read: bool,
    pub poll_timeout: Duration,
    pub block_timeout: Duration,
    /// Nap length of one blocking wait.
    pub park_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            slot_size: 8192,
            data_slots: 64,
            comp_slots: 64,
            recv_frags: 64,
            max_outstanding: 128,
            dispatch: DispatchMode::Polled,
            completion: CompletionStrategy::Poll,
            prefer_remote_read: false,
            poll_timeout: Duration::from_micros(100),
            block_timeout: Duration::from_millis(50),
            park_interval: Duration::from_micros(200),
        }
    }
}

impl TransportConfig {
    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    pub fn completion(mut self, strategy: CompletionStrategy) -> Self {
        self.completion = strategy;
        self
    }

    pub fn prefer_remote_read(mut self, on: bool) -> Self {
        self.prefer_remote_read = on;
        self
    }

    pub fn slot_size(mut self, bytes: usize) -> Self {
        self.slot_size = bytes;
        self
    }
}

/// Destination endpoint: message-layer rank plus hardware-level address.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub rank: u32,
    pub vp: VpId,
}

/// One transport per rail.
pub struct Transport {
    pub(crate) rail: Arc<dyn Rail>,
    pub(crate) matcher: Arc<dyn Matcher>,
    pub(crate) packer: Arc<dyn Packer>,
    pub(crate) cfg: TransportConfig,
    data_ring: Arc<RecvRing>,
    comp_ring: Option<Arc<RecvRing>>,
    pub(crate) outstanding: Outstanding,
    pub(crate) recv_pool: RecvPool,
    /// Receiver-side rendezvous references handed to peers via Ack.
    pub(crate) rendezvous: Mutex<Slab<Arc<RecvRequest>>>,
    pub(crate) unexpected: Mutex<Vec<RecvFrag>>,
    sleep_pool: SleepPool,
    peers: Mutex<HashMap<u32, VpId>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(
        rail: Arc<dyn Rail>,
        matcher: Arc<dyn Matcher>,
        cfg: TransportConfig,
    ) -> Result<Arc<Self>> {
        Self::with_packer(rail, matcher, Arc::new(ContigPacker), cfg)
    }

    pub fn with_packer(
        rail: Arc<dyn Rail>,
        matcher: Arc<dyn Matcher>,
        packer: Arc<dyn Packer>,
        cfg: TransportConfig,
    ) -> Result<Arc<Self>> {
        if cfg.slot_size <= MAX_HDR_SIZE {
            return Err(Error::UnsupportedOperation(
                "ring slot cannot hold the largest header",
            ));
        }
        if cfg.prefer_remote_read && !rail.has_remote_read() {
            return Err(Error::UnsupportedOperation(
                "remote read requested on a rail without the capability",
            ));
        }
        let comp_ring = matches!(cfg.completion, CompletionStrategy::Queue)
            .then(|| Arc::new(RecvRing::new(cfg.comp_slots, cfg.slot_size)));
        // Unexpected buffers must hold a full eager payload.
        let unex_size = cfg.slot_size - MAX_HDR_SIZE;
        Ok(Arc::new(Self {
            data_ring: Arc::new(RecvRing::new(cfg.data_slots, cfg.slot_size)),
            comp_ring,
            outstanding: Outstanding::new(cfg.max_outstanding),
            recv_pool: RecvPool::new(cfg.recv_frags, unex_size),
            rendezvous: Mutex::new(Slab::new()),
            unexpected: Mutex::new(Vec::new()),
            sleep_pool: SleepPool::new(cfg.park_interval),
            peers: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            rail,
            matcher,
            packer,
            cfg,
        }))
    }

    /// Ring the interface delivers data traffic into; hand it to the rail's
    /// fabric/routing setup.
    pub fn data_ring(&self) -> Arc<RecvRing> {
        Arc::clone(&self.data_ring)
    }

    /// Dedicated completion ring, present under
    /// [`CompletionStrategy::Queue`].
    pub fn comp_ring(&self) -> Option<Arc<RecvRing>> {
        self.comp_ring.clone()
    }

    /// Record how to reach a message-layer rank on this rail.
    pub fn add_peer(&self, rank: u32, vp: VpId) {
        self.peers.lock().insert(rank, vp);
    }

    pub(crate) fn peer_vp(&self, rank: u32) -> Result<VpId> {
        self.peers
            .lock()
            .get(&rank)
            .copied()
            .ok_or_else(|| Error::Submit(format!("no route to rank {rank}")))
    }

    /// Largest payload an eager fragment can carry inline.
    pub fn eager_limit(&self) -> usize {
        self.cfg.slot_size - MAX_HDR_SIZE
    }

    /// In-flight send descriptors.
    pub fn outstanding_sends(&self) -> usize {
        self.outstanding.len()
    }

    /// Send `len` bytes of `req` starting at `offset`. Returns the bytes this
    /// call actually put in flight; the caller re-invokes for the rest.
    ///
    /// Offset 0 always goes eager (the Match header must travel with the
    /// first bytes). Later ranges go as a rendezvous write once the peer's
    /// Ack supplied coordinates, or eager Frag headers otherwise.
    pub fn send(
        &self,
        peer: &Peer,
        req: &Arc<SendRequest>,
        offset: u64,
        len: u64,
        opts: SendOpts,
    ) -> Result<usize> {
        if let Some(src_ref) = req.failed_ref() {
            return Err(Error::NackReceived { src_ref });
        }
        if offset == 0 {
            self.start_eager(peer, req, offset, len, opts)
        } else if len > self.eager_limit() as u64 && req.peer_match().is_some() {
            self.start_write(peer, req, offset, len)
        } else {
            self.start_eager(peer, req, offset, len, opts)
        }
    }

    /// Drive everything once: drain delivered data slots, then run the
    /// configured completion strategy. Returns how many events were handled.
    pub fn progress(&self) -> usize {
        let mut handled = 0;
        loop {
            match self.dispatch_once(&self.data_ring, RingClass::Data) {
                Outcome::Handled => handled += 1,
                Outcome::Idle | Outcome::Stopped => break,
            }
        }
        match self.cfg.completion {
            CompletionStrategy::Queue => {
                if let Some(ring) = &self.comp_ring {
                    loop {
                        match self.dispatch_once(ring, RingClass::Completion) {
                            Outcome::Handled => handled += 1,
                            Outcome::Idle | Outcome::Stopped => break,
                        }
                    }
                }
            }
            CompletionStrategy::Poll => handled += self.poll_completions(),
            // Combined completions already came through the data ring.
            CompletionStrategy::Combined => {}
        }
        handled
    }

    /// Start the dedicated dispatch threads in [`DispatchMode::Threaded`].
    pub fn spawn_progress(self: &Arc<Self>) -> Result<()> {
        if self.cfg.dispatch != DispatchMode::Threaded {
            return Ok(());
        }
        let mut threads = self.threads.lock();
        let t = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name("fraglink-recv".into())
                .spawn(move || t.recv_loop())
                .map_err(|e| Error::Submit(e.to_string()))?,
        );
        if self.comp_ring.is_some() {
            let t = Arc::clone(self);
            threads.push(
                std::thread::Builder::new()
                    .name("fraglink-comp".into())
                    .spawn(move || t.comp_loop())
                    .map_err(|e| Error::Submit(e.to_string()))?,
            );
        }
        Ok(())
    }

    fn recv_loop(&self) {
        debug!("receive dispatch thread running");
        loop {
            wait_event(
                &*self.rail,
                &self.sleep_pool,
                self.data_ring.done(),
                self.cfg.poll_timeout,
                self.cfg.block_timeout,
            );
            loop {
                match self.dispatch_once(&self.data_ring, RingClass::Data) {
                    Outcome::Handled => {}
                    Outcome::Idle => break,
                    Outcome::Stopped => {
                        debug!("receive dispatch thread stopping");
                        return;
                    }
                }
            }
            if matches!(self.cfg.completion, CompletionStrategy::Poll) {
                self.poll_completions();
            }
        }
    }

    fn comp_loop(&self) {
        let Some(ring) = self.comp_ring.clone() else {
            return;
        };
        debug!("completion dispatch thread running");
        loop {
            wait_event(
                &*self.rail,
                &self.sleep_pool,
                ring.done(),
                self.cfg.poll_timeout,
                self.cfg.block_timeout,
            );
            loop {
                match self.dispatch_once(&ring, RingClass::Completion) {
                    Outcome::Handled => {}
                    Outcome::Idle => break,
                    Outcome::Stopped => {
                        debug!("completion dispatch thread stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Deliver Stop sentinels into this transport's own rings and join the
    /// dispatch threads. No-op when none were spawned.
    pub fn stop(&self) -> Result<()> {
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        if handles.is_empty() {
            return Ok(());
        }
        self.start_stop(RingClass::Data)?;
        if self.comp_ring.is_some() {
            self.start_stop(RingClass::Completion)?;
        }
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}
