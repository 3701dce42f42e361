//! Two-endpoint scenarios over the software loopback rail.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use fraglink::error::Error;
use fraglink::loopback::{LoopbackFabric, LoopbackRail};
use fraglink::rail::VpId;
use fraglink::request::{Matcher, RecvRequest, SendRequest};
use fraglink::wire::MatchFields;
use fraglink::{
    CompletionStrategy, DispatchMode, Peer, SendOpts, Transport, TransportConfig,
};

struct TestMatcher {
    posted: Mutex<Vec<(i32, Arc<RecvRequest>)>>,
    recv_events: Mutex<Vec<(u64, u64)>>,
    send_events: Mutex<Vec<u64>>,
}

impl TestMatcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            posted: Mutex::new(Vec::new()),
            recv_events: Mutex::new(Vec::new()),
            send_events: Mutex::new(Vec::new()),
        })
    }

    fn post(&self, tag: i32, req: Arc<RecvRequest>) {
        self.posted.lock().push((tag, req));
    }

    fn recv_events(&self) -> Vec<(u64, u64)> {
        self.recv_events.lock().clone()
    }

    fn send_events(&self) -> Vec<u64> {
        self.send_events.lock().clone()
    }
}

impl Matcher for TestMatcher {
    fn match_recv(
        &self,
        _owner: &Transport,
        _frag: &mut fraglink::frag::RecvFrag,
        mat: &MatchFields,
    ) -> Option<Arc<RecvRequest>> {
        let mut posted = self.posted.lock();
        let pos = posted.iter().position(|(tag, _)| *tag == mat.tag)?;
        Some(posted.remove(pos).1)
    }

    fn recv_progress(
        &self,
        _owner: &Transport,
        _req: &Arc<RecvRequest>,
        bytes_this_fragment: u64,
        bytes_total: u64,
    ) {
        self.recv_events
            .lock()
            .push((bytes_this_fragment, bytes_total));
    }

    fn send_progress(&self, _owner: &Transport, _req: &Arc<SendRequest>, bytes_acked: u64) {
        self.send_events.lock().push(bytes_acked);
    }
}

struct Endpoint {
    transport: Arc<Transport>,
    matcher: Arc<TestMatcher>,
    rail: Arc<LoopbackRail>,
}

fn pair(
    fabric: &Arc<LoopbackFabric>,
    cfg_a: TransportConfig,
    cfg_b: TransportConfig,
    remote_read: bool,
) -> (Endpoint, Endpoint) {
    init_logs();
    let mut endpoints = Vec::new();
    for (vp, cfg) in [(VpId(0), cfg_a), (VpId(1), cfg_b)] {
        let matcher = TestMatcher::new();
        let rail = Arc::new(LoopbackRail::new(vp, Arc::clone(fabric), remote_read));
        let transport = Transport::new(rail.clone(), matcher.clone(), cfg).unwrap();
        fabric.register(vp, transport.data_ring(), transport.comp_ring());
        endpoints.push(Endpoint {
            transport,
            matcher,
            rail,
        });
    }
    let b = endpoints.pop().unwrap();
    let a = endpoints.pop().unwrap();
    a.transport.add_peer(1, VpId(1));
    b.transport.add_peer(0, VpId(0));
    (a, b)
}

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn peer_b() -> Peer {
    Peer {
        rank: 1,
        vp: VpId(1),
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn eager_round_trip() {
    let fabric = LoopbackFabric::new();
    let (a, b) = pair(
        &fabric,
        TransportConfig::default(),
        TransportConfig::default(),
        false,
    );
    let data = pattern(256);
    let recv = Arc::new(RecvRequest::new(0, 7, 0, 256));
    b.matcher.post(7, recv.clone());

    let send = Arc::new(SendRequest::new(1, 7, 0, 0, data.clone()));
    let n = a
        .transport
        .send(&peer_b(), &send, 0, 256, SendOpts::default())
        .unwrap();
    assert_eq!(n, 256);

    assert!(b.transport.progress() > 0);
    assert_eq!(recv.data(), &data[..]);
    assert_eq!(b.matcher.recv_events(), vec![(256, 256)]);

    assert!(a.transport.progress() > 0);
    assert_eq!(a.matcher.send_events(), vec![256]);
    assert_eq!(a.transport.outstanding_sends(), 0);
}

#[test]
fn unmatched_fragment_survives_slot_reuse() {
    let fabric = LoopbackFabric::new();
    let mut cfg_b = TransportConfig::default();
    cfg_b.data_slots = 1;
    let (a, b) = pair(&fabric, TransportConfig::default(), cfg_b, false);

    let first = pattern(128);
    let send1 = Arc::new(SendRequest::new(1, 7, 0, 0, first.clone()));
    a.transport
        .send(&peer_b(), &send1, 0, 128, SendOpts::default())
        .unwrap();
    b.transport.progress();

    // The single ring slot is recycled by the next delivery.
    let send2 = Arc::new(SendRequest::new(1, 8, 0, 1, vec![0xee; 128]));
    a.transport
        .send(&peer_b(), &send2, 0, 128, SendOpts::default())
        .unwrap();
    b.transport.progress();
    assert_eq!(b.transport.unexpected_len(), 2);

    let frag = b.transport.take_unexpected(|mat| mat.tag == 7).unwrap();
    assert_eq!(frag.buffered_data(), &first[..]);

    // A late posting still lands the buffered payload.
    let recv = Arc::new(RecvRequest::new(0, 7, 0, 128));
    b.transport.deliver_buffered(frag, &recv).unwrap();
    assert_eq!(recv.data(), &first[..]);
    assert_eq!(recv.bytes_received(), 128);
}

#[test]
fn rendezvous_write_byte_accounting() {
    let fabric = LoopbackFabric::new();
    let (a, b) = pair(
        &fabric,
        TransportConfig::default(),
        TransportConfig::default(),
        false,
    );
    let total: usize = 64 * 1024;
    let inline = a.transport.eager_limit();
    let data = pattern(total);

    let recv = Arc::new(RecvRequest::new(0, 3, 0, total));
    b.matcher.post(3, recv.clone());
    let send = Arc::new(SendRequest::new(1, 3, 0, 0, data.clone()));

    // First fragment: eager portion plus the rendezvous handshake.
    let n = a
        .transport
        .send(&peer_b(), &send, 0, total as u64, SendOpts::default())
        .unwrap();
    assert_eq!(n, inline);
    assert!(b.transport.progress() > 0);
    assert!(a.transport.progress() > 0);
    assert_eq!(send.peer_size(), (total - inline) as u64);

    // Remainder as one bulk write, landed before its completion notice.
    let m = a
        .transport
        .send(
            &peer_b(),
            &send,
            inline as u64,
            (total - inline) as u64,
            SendOpts::default(),
        )
        .unwrap();
    assert_eq!(m, total - inline);
    assert_eq!(a.rail.mem_writes(), 1);

    assert!(b.transport.progress() > 0);
    assert!(a.transport.progress() > 0);
    // Progress again: everything already retired.
    assert_eq!(a.transport.progress(), 0);

    assert_eq!(recv.data(), &data[..]);
    let events = b.matcher.recv_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], (inline as u64, inline as u64));
    assert_eq!(events[1], ((total - inline) as u64, total as u64));
    // Per-fragment bytes sum exactly to the message length.
    assert_eq!(events.iter().map(|(b, _)| b).sum::<u64>(), total as u64);

    assert_eq!(send.bytes_acked(), total as u64);
    assert_eq!(a.transport.outstanding_sends(), 0);
}

#[test]
fn zero_length_message_completes_without_payload_dma() {
    let fabric = LoopbackFabric::new();
    let (a, b) = pair(
        &fabric,
        TransportConfig::default(),
        TransportConfig::default(),
        false,
    );
    let recv = Arc::new(RecvRequest::new(0, 5, 0, 0));
    b.matcher.post(5, recv.clone());

    let send = Arc::new(SendRequest::new(1, 5, 0, 0, Vec::new()));
    let n = a
        .transport
        .send(&peer_b(), &send, 0, 0, SendOpts::default())
        .unwrap();
    assert_eq!(n, 0);

    b.transport.progress();
    a.transport.progress();

    assert_eq!(b.matcher.recv_events(), vec![(0, 0)]);
    assert_eq!(a.matcher.send_events(), vec![0]);
    assert_eq!(a.rail.mem_writes(), 0);
    assert_eq!(b.rail.mem_writes(), 0);
}

#[test]
fn two_eager_fragments_complete_independently() {
    let fabric = LoopbackFabric::new();
    let (a, b) = pair(
        &fabric,
        TransportConfig::default(),
        TransportConfig::default(),
        false,
    );
    let total = 8192usize;
    let data = pattern(total);
    let recv = Arc::new(RecvRequest::new(0, 11, 0, total));
    b.matcher.post(11, recv.clone());

    let send = Arc::new(SendRequest::new(1, 11, 0, 0, data.clone()));
    assert_eq!(
        a.transport
            .send(&peer_b(), &send, 0, 4096, SendOpts::default())
            .unwrap(),
        4096
    );
    b.transport.progress();
    a.transport.progress();

    assert_eq!(
        a.transport
            .send(&peer_b(), &send, 4096, 4096, SendOpts::default())
            .unwrap(),
        4096
    );
    b.transport.progress();
    a.transport.progress();

    assert_eq!(recv.data(), &data[..]);
    assert_eq!(b.matcher.recv_events(), vec![(4096, 4096), (4096, 8192)]);
    assert_eq!(send.bytes_acked(), 8192);
}

#[test]
fn rendezvous_read_pulls_remainder() {
    let fabric = LoopbackFabric::new();
    let cfg_b = TransportConfig::default().prefer_remote_read(true);
    let (a, b) = pair(&fabric, TransportConfig::default(), cfg_b, true);
    let total: usize = 32 * 1024;
    let inline = a.transport.eager_limit();
    let data = pattern(total);

    let recv = Arc::new(RecvRequest::new(0, 9, 0, total));
    b.matcher.post(9, recv.clone());
    let send = Arc::new(SendRequest::new(1, 9, 0, 0, data.clone()));

    a.transport
        .send(&peer_b(), &send, 0, total as u64, SendOpts::default())
        .unwrap();
    // Match dispatch kicks the read; B observes its own read completion.
    b.transport.progress();
    assert_eq!(b.rail.mem_reads(), 1);
    a.transport.progress();

    assert_eq!(recv.data(), &data[..]);
    assert_eq!(recv.bytes_received(), total as u64);
    let events = b.matcher.recv_events();
    assert_eq!(events.iter().map(|(b, _)| b).sum::<u64>(), total as u64);
    assert_eq!(events.last().copied(), Some(((total - inline) as u64, total as u64)));

    // FinAck completed the whole send in one report.
    assert_eq!(a.matcher.send_events(), vec![total as u64]);
    assert_eq!(a.transport.outstanding_sends(), 0);
}

#[test]
fn remote_read_config_requires_capability() {
    init_logs();
    let fabric = LoopbackFabric::new();
    let rail = Arc::new(LoopbackRail::new(VpId(0), fabric, false));
    let matcher = TestMatcher::new();
    let res = Transport::new(
        rail,
        matcher,
        TransportConfig::default().prefer_remote_read(true),
    );
    assert!(matches!(res, Err(Error::UnsupportedOperation(_))));
}

#[test]
fn pool_exhaustion_nacks_the_sender() {
    let fabric = LoopbackFabric::new();
    let mut cfg_b = TransportConfig::default();
    cfg_b.recv_frags = 1;
    let (a, b) = pair(&fabric, TransportConfig::default(), cfg_b, false);

    // First unmatched fragment parks the only receive descriptor.
    let send1 = Arc::new(SendRequest::new(1, 21, 0, 0, pattern(64)));
    a.transport
        .send(&peer_b(), &send1, 0, 64, SendOpts::default())
        .unwrap();
    b.transport.progress();
    assert_eq!(b.transport.unexpected_len(), 1);

    let send2 = Arc::new(SendRequest::new(1, 22, 0, 1, pattern(64)));
    a.transport
        .send(&peer_b(), &send2, 0, 64, SendOpts::default())
        .unwrap();
    b.transport.progress();
    a.transport.progress();

    assert!(send2.is_failed());
    assert!(!send1.is_failed());
    // The refused send reports no progress; only the buffered one's local
    // completion does.
    assert_eq!(send2.bytes_acked(), 0);
    assert_eq!(a.matcher.send_events(), vec![64]);
    assert_eq!(a.transport.outstanding_sends(), 0);
}

#[test]
fn oversized_message_truncates_at_posted_buffer() {
    let fabric = LoopbackFabric::new();
    let (a, b) = pair(
        &fabric,
        TransportConfig::default(),
        TransportConfig::default(),
        false,
    );
    let data = pattern(128);
    // The posted buffer holds only half the matched message.
    let recv = Arc::new(RecvRequest::new(0, 13, 0, 64));
    b.matcher.post(13, recv.clone());

    let send = Arc::new(SendRequest::new(1, 13, 0, 0, data.clone()));
    a.transport
        .send(&peer_b(), &send, 0, 128, SendOpts::default())
        .unwrap();
    assert!(b.transport.progress() > 0);
    a.transport.progress();

    assert_eq!(recv.bytes_received(), 64);
    assert_eq!(recv.data(), &data[..64]);
    assert_eq!(b.matcher.recv_events(), vec![(64, 64)]);
    assert_eq!(a.transport.outstanding_sends(), 0);
}

#[test]
fn threaded_mode_runs_and_stops() {
    let fabric = LoopbackFabric::new();
    let cfg = TransportConfig::default()
        .dispatch(DispatchMode::Threaded)
        .completion(CompletionStrategy::Queue);
    let (a, b) = pair(&fabric, cfg.clone(), cfg, false);
    a.transport.spawn_progress().unwrap();
    b.transport.spawn_progress().unwrap();

    let data = pattern(512);
    let recv = Arc::new(RecvRequest::new(0, 2, 0, 512));
    b.matcher.post(2, recv.clone());
    let send = Arc::new(SendRequest::new(1, 2, 0, 0, data.clone()));
    a.transport
        .send(&peer_b(), &send, 0, 512, SendOpts::default())
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while (recv.bytes_received() < 512 || a.matcher.send_events().is_empty())
        && Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(recv.data(), &data[..]);
    assert_eq!(a.matcher.send_events(), vec![512]);

    a.transport.stop().unwrap();
    b.transport.stop().unwrap();
}

#[test]
fn combined_completions_share_the_data_ring() {
    let fabric = LoopbackFabric::new();
    let cfg = TransportConfig::default().completion(CompletionStrategy::Combined);
    let (a, b) = pair(&fabric, cfg.clone(), cfg, false);

    let data = pattern(300);
    let recv = Arc::new(RecvRequest::new(0, 4, 0, 300));
    b.matcher.post(4, recv.clone());
    let send = Arc::new(SendRequest::new(1, 4, 0, 0, data.clone()));
    a.transport
        .send(&peer_b(), &send, 0, 300, SendOpts::default())
        .unwrap();

    b.transport.progress();
    // The self-addressed copy sits in A's own data ring.
    a.transport.progress();

    assert_eq!(recv.data(), &data[..]);
    assert_eq!(a.matcher.send_events(), vec![300]);
    assert_eq!(a.transport.outstanding_sends(), 0);
}

#[test]
fn cached_descriptor_release_is_callers_job() {
    let fabric = LoopbackFabric::new();
    let (a, b) = pair(
        &fabric,
        TransportConfig::default(),
        TransportConfig::default(),
        false,
    );
    let recv = Arc::new(RecvRequest::new(0, 6, 0, 64));
    b.matcher.post(6, recv);

    let send = Arc::new(SendRequest::new(1, 6, 0, 0, pattern(64)));
    let opts = SendOpts {
        ack: false,
        cached: true,
    };
    a.transport.send(&peer_b(), &send, 0, 64, opts).unwrap();
    b.transport.progress();
    a.transport.progress();

    // Completed upstream, storage still resident.
    assert_eq!(a.matcher.send_events(), vec![64]);
    assert_eq!(a.transport.outstanding_sends(), 1);
    a.transport.release_cached(0);
    assert_eq!(a.transport.outstanding_sends(), 0);
}
