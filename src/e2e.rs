//! End-to-end scenarios: agent, collector and pods in one process over
//! loopback.

use std::{
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    path::Path,
    time::{Duration, Instant},
};

use crate::{
    agent::HostAgent,
    collector::Collector,
    config::{AgentConfig, CollectorConfig},
    constants::CTRL_MSG_SIZE,
    pod,
    verbs::{
        CmEvent, CmId, CompChannel, CompletionQueue, MemoryRegion, MrAccess, ProtectionDomain,
        QueuePair, SendWr,
    },
    wire::ControlMessage,
};

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    cond()
}

struct Plane {
    agent: HostAgent,
    collector: Collector,
    _agent_dir: tempfile::TempDir,
    out_dir: tempfile::TempDir,
}

impl Plane {
    /// Brings up a collector and an agent wired to it. The liveness period
    /// is long by default so registrations under test-pod ids survive.
    fn start(block_size: usize, mrs_per_pod: usize, interval_secs: u64, liveness_secs: u64) -> Self {
        let out_dir = tempfile::tempdir().unwrap();
        let collector = Collector::start(CollectorConfig {
            listen_port: 0,
            sampling_interval_secs: interval_secs,
            block_size,
            mrs_per_pod,
            output_dir: out_dir.path().to_path_buf(),
        })
        .unwrap();

        let agent_dir = tempfile::tempdir().unwrap();
        let agent = HostAgent::start(AgentConfig {
            listen_port: 0,
            peer_ip: "127.0.0.1".into(),
            peer_port: collector.rdma_port(),
            block_size,
            mrs_per_pod,
            liveness_period_secs: liveness_secs,
            workdir: agent_dir.path().to_path_buf(),
            ..AgentConfig::default()
        })
        .unwrap();

        Self {
            agent,
            collector,
            _agent_dir: agent_dir,
            out_dir,
        }
    }

    fn agent_addr(&self) -> SocketAddr {
        format!("127.0.0.1:{}", self.agent.registration_port())
            .parse()
            .unwrap()
    }

    fn stop(&self) {
        self.collector.shutdown();
        self.agent.shutdown();
    }
}

fn sample_lines(path: &Path) -> Vec<u64> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| line.parse().expect("sample lines are decimal nanoseconds"))
        .collect()
}

/// A direct collector peer that advertises a readable page the way an
/// agent session would, minus the agent. Lets tests drive disconnects and
/// failure injection deterministically.
struct Injector {
    cm: CmId,
    _pd: ProtectionDomain,
    _chan: CompChannel,
    _cq: CompletionQueue,
    _qp: QueuePair,
    _page: Box<[u8]>,
    page_mr: MemoryRegion,
    _send_buf: Box<[u8]>,
    _send_mr: MemoryRegion,
}

impl Injector {
    fn connect(collector_port: u16, block_size: usize) -> Self {
        let cm = CmId::new();
        let addr: SocketAddr = format!("127.0.0.1:{collector_port}").parse().unwrap();
        cm.resolve_addr(addr, Duration::from_millis(500)).unwrap();
        assert!(matches!(cm.get_event().unwrap(), CmEvent::AddrResolved));
        let pd = cm.alloc_pd().unwrap();
        let chan = CompChannel::new();
        let cq = cm.create_cq(&chan, 16).unwrap();
        let qp = cm.create_qp(&pd, &cq).unwrap();
        cm.resolve_route(Duration::from_millis(500)).unwrap();
        assert!(matches!(cm.get_event().unwrap(), CmEvent::RouteResolved));
        cm.connect().unwrap();
        assert!(matches!(cm.get_event().unwrap(), CmEvent::Established));

        let page = vec![9u8; block_size].into_boxed_slice();
        let page_mr = pd
            .register_mr(page.as_ptr() as u64, page.len(), MrAccess::RemoteRead)
            .unwrap();
        let mut send_buf = vec![0u8; CTRL_MSG_SIZE].into_boxed_slice();
        let send_mr = pd
            .register_mr(send_buf.as_ptr() as u64, send_buf.len(), MrAccess::LocalOnly)
            .unwrap();
        ControlMessage::Mr(page_mr.descriptor().unwrap())
            .encode(&mut send_buf)
            .unwrap();
        qp.post_send(SendWr {
            wr_id: 1,
            laddr: send_buf.as_ptr() as u64,
            lkey: send_mr.lkey(),
            length: CTRL_MSG_SIZE as u32,
        })
        .unwrap();

        Self {
            cm,
            _pd: pd,
            _chan: chan,
            _cq: cq,
            _qp: qp,
            _page: page,
            page_mr,
            _send_buf: send_buf,
            _send_mr: send_mr,
        }
    }
}

#[test]
fn single_pod_scrape_produces_samples() {
    let plane = Plane::start(1024, 1, 1, 600);

    // The sidecar is the discovery path pods actually use.
    let port = pod::discover_port(plane._agent_dir.path()).unwrap();
    assert_eq!(port, plane.agent.registration_port());

    let page = pod::register(plane.agent_addr(), 4242).unwrap();
    assert_eq!(page.name(), "shm-4242");
    assert_eq!(page.len(), 1024);
    page.write(0, b"cpu_seconds_total 17").unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        plane.collector.connection_count() == 1
    }));

    std::thread::sleep(Duration::from_millis(3400));
    plane.stop();

    let per_conn = sample_lines(&plane.out_dir.path().join("latency_samples_0.txt"));
    let global = sample_lines(&plane.out_dir.path().join("read_completion_latency.txt"));
    assert!(
        (2..=4).contains(&per_conn.len()),
        "expected ~3 per-connection samples, got {}",
        per_conn.len()
    );
    assert!(
        (2..=4).contains(&global.len()),
        "expected ~3 global samples, got {}",
        global.len()
    );
    assert!(per_conn.len().abs_diff(global.len()) <= 1);
}

#[test]
fn two_pods_register_and_round_counts_both() {
    let plane = Plane::start(1024, 1, 1, 600);

    let _page_a = pod::register(plane.agent_addr(), 1111).unwrap();
    let _page_b = pod::register(plane.agent_addr(), 2222).unwrap();

    for name in ["shm-1111", "shm-2222"] {
        let meta = std::fs::metadata(format!("/dev/shm/{name}")).unwrap();
        assert_eq!(meta.len(), 1024);
        assert_eq!(meta.permissions().mode() & 0o777, 0o666);
    }

    assert!(wait_until(Duration::from_secs(2), || {
        plane.collector.connection_count() == 2
    }));
    assert_eq!(plane.agent.pod_count(), 2);

    // A global round only completes once both connections report.
    let before = plane.collector.round_count();
    assert!(wait_until(Duration::from_secs(3), || {
        plane.collector.round_count() > before
    }));

    plane.stop();
    assert!(std::fs::metadata("/dev/shm/shm-1111").is_err());
    assert!(std::fs::metadata("/dev/shm/shm-2222").is_err());
}

#[test]
fn batched_reads_return_page_content() {
    let plane = Plane::start(1024, 4, 1, 600);

    let page = pod::register(plane.agent_addr(), 4343).unwrap();
    let mut pattern = vec![0u8; 1024];
    for (i, byte) in pattern.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    page.write(0, &pattern).unwrap();

    assert!(wait_until(Duration::from_secs(4), || {
        plane.collector.round_count() >= 1
    }));
    let snap = plane.collector.snapshot(0).expect("connection 0 is live");
    assert_eq!(snap, pattern);

    std::thread::sleep(Duration::from_millis(1200));
    plane.stop();

    // One sample per tick even though each tick posts four READs.
    let per_conn = sample_lines(&plane.out_dir.path().join("latency_samples_0.txt"));
    assert!(!per_conn.is_empty());
    let global = sample_lines(&plane.out_dir.path().join("read_completion_latency.txt"));
    for (round, conn) in global.iter().zip(per_conn.iter()) {
        assert!(round >= conn, "global round covers its slowest connection");
    }
}

#[test]
fn dead_pod_is_reaped_and_survivor_keeps_scraping() {
    let plane = Plane::start(1024, 1, 1, 1);

    // A pid above PID_MAX_LIMIT can never be alive.
    let dead_pid = 4_194_400u32;
    let _dead_page = pod::register(plane.agent_addr(), dead_pid).unwrap();
    let live_pid = std::process::id();
    let _live_page = pod::register(plane.agent_addr(), live_pid).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        plane.collector.connection_count() == 2
    }));

    // Within one watcher period plus disconnect latency, the dead pod's
    // connection is gone on both sides and its shared page is unlinked.
    assert!(wait_until(Duration::from_secs(3), || {
        plane.collector.connection_count() == 1 && plane.agent.pod_count() == 1
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        std::fs::metadata(format!("/dev/shm/shm-{dead_pid}")).is_err()
    }));

    // The survivor still completes rounds.
    let before = plane.collector.round_count();
    assert!(wait_until(Duration::from_secs(3), || {
        plane.collector.round_count() > before
    }));

    plane.stop();
}

#[test]
fn connect_disconnect_cycles_return_to_baseline() {
    let plane = Plane::start(1024, 1, 1, 1);

    // Shared-page churn: pids above PID_MAX_LIMIT can never be alive, so
    // the watcher reaps each registration on its next pass. Every cycle
    // the connection, the pod slot and the shared page must all return to
    // baseline before the next one starts.
    for pid in [4_194_310u32, 4_194_311, 4_194_312] {
        let _page = pod::register(plane.agent_addr(), pid).unwrap();
        let shm_path = format!("/dev/shm/shm-{pid}");
        assert!(std::fs::metadata(&shm_path).is_ok());

        assert!(wait_until(Duration::from_secs(5), || {
            std::fs::metadata(&shm_path).is_err()
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            plane.collector.connection_count() == 0 && plane.agent.pod_count() == 0
        }));
    }

    // The plane still scrapes after the churn: a fresh peer completes
    // rounds, then its explicit disconnect drains back down to zero.
    let injector = Injector::connect(plane.collector.rdma_port(), 1024);
    assert!(wait_until(Duration::from_secs(2), || {
        plane.collector.connection_count() == 1
    }));
    let before = plane.collector.round_count();
    assert!(wait_until(Duration::from_secs(3), || {
        plane.collector.round_count() > before
    }));
    injector.cm.disconnect().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        plane.collector.connection_count() == 0
    }));
    injector.cm.destroy();

    plane.stop();
}

#[test]
fn failed_read_completion_isolates_one_connection() {
    let plane = Plane::start(1024, 1, 1, 600);

    // First connection: a direct peer whose page registration can be
    // yanked mid-run, turning its next READ into a non-success completion.
    let mut injector = Injector::connect(plane.collector.rdma_port(), 1024);
    assert!(wait_until(Duration::from_secs(2), || {
        plane.collector.connection_count() == 1
    }));

    // Second connection: a normal pod through the agent.
    let _pod_page = pod::register(plane.agent_addr(), 6161).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        plane.collector.connection_count() == 2
    }));
    assert!(wait_until(Duration::from_secs(3), || {
        plane.collector.round_count() >= 1
    }));

    // Yank the registration; the collector's next READ against it fails
    // and only that poller exits.
    injector.page_mr.deregister();
    assert!(wait_until(Duration::from_secs(3), || {
        plane.collector.connection_count() == 1
    }));

    // The failed poller wrote its sample file on the way out.
    let failed = plane.out_dir.path().join("latency_samples_0.txt");
    assert!(wait_until(Duration::from_secs(2), || {
        failed.exists() && !sample_lines(&failed).is_empty()
    }));

    // The survivor keeps completing rounds.
    let before = plane.collector.round_count();
    assert!(wait_until(Duration::from_secs(3), || {
        plane.collector.round_count() > before
    }));

    injector.cm.destroy();
    plane.stop();
}

#[test]
fn unknown_control_tag_kills_only_that_connection() {
    let plane = Plane::start(1024, 1, 1, 600);

    // A rogue peer that speaks the CM handshake but sends garbage control
    // traffic.
    let rogue = CmId::new();
    let addr: SocketAddr = format!("127.0.0.1:{}", plane.collector.rdma_port())
        .parse()
        .unwrap();
    rogue.resolve_addr(addr, Duration::from_millis(500)).unwrap();
    assert!(matches!(rogue.get_event().unwrap(), CmEvent::AddrResolved));
    let pd = rogue.alloc_pd().unwrap();
    let chan = CompChannel::new();
    let cq = rogue.create_cq(&chan, 16).unwrap();
    let qp = rogue.create_qp(&pd, &cq).unwrap();
    rogue.resolve_route(Duration::from_millis(500)).unwrap();
    assert!(matches!(rogue.get_event().unwrap(), CmEvent::RouteResolved));
    rogue.connect().unwrap();
    assert!(matches!(rogue.get_event().unwrap(), CmEvent::Established));

    let mut buf = vec![0u8; CTRL_MSG_SIZE].into_boxed_slice();
    buf[0] = 0x2a; // no such tag
    let mr = pd
        .register_mr(buf.as_ptr() as u64, buf.len(), MrAccess::LocalOnly)
        .unwrap();
    qp.post_send(SendWr {
        wr_id: 1,
        laddr: buf.as_ptr() as u64,
        lkey: mr.lkey(),
        length: CTRL_MSG_SIZE as u32,
    })
    .unwrap();

    // The collector tears that connection down...
    assert!(wait_until(Duration::from_secs(2), || {
        plane.collector.connection_count() == 0
    }));
    rogue.destroy();

    // ...and keeps admitting well-behaved pods.
    let _page = pod::register(plane.agent_addr(), 5151).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        plane.collector.connection_count() == 1
    }));
    let before = plane.collector.round_count();
    assert!(wait_until(Duration::from_secs(3), || {
        plane.collector.round_count() > before
    }));

    plane.stop();
}
