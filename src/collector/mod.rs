//! Collector: the passive RDMA side that scrapes every registered pod page
//! with synchronized batched one-sided READs.

mod connection;
mod latency;
mod poller;
mod tick;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::{
    config::CollectorConfig,
    error::Result,
    spawner::{spawn_worker, ShutdownSignal},
    verbs::{CmEvent, CmId, CmListener},
};

use connection::{ScrapeConnection, Snapshot};
use latency::RoundClock;
use poller::Poller;
use tick::ScrapeSignal;

/// What the rest of the collector needs from a connection after its poller
/// takes ownership of the state proper.
struct ConnHandle {
    slot: Arc<ScrapeSignal>,
    cm: CmId,
    snapshot: Snapshot,
}

/// Registry of live connections, keyed by a run-monotonic logical index.
/// Indices are never reused, which keeps sample file names unambiguous
/// across connect/disconnect cycles.
#[derive(Default)]
pub(crate) struct ConnRegistry {
    conns: Mutex<HashMap<u64, ConnHandle>>,
    next_index: AtomicU64,
    live_pollers: AtomicUsize,
}

impl ConnRegistry {
    fn next_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, index: u64, handle: ConnHandle) {
        let _prev = self.conns.lock().insert(index, handle);
        let _count = self.live_pollers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove(&self, index: u64) {
        let _handle = self.conns.lock().remove(&index);
    }

    /// Remaining poller count after one exits.
    pub(crate) fn poller_exited(&self) -> usize {
        self.live_pollers.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn active_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Snapshot of every slot for the tick fan-out.
    pub(crate) fn slots(&self) -> Vec<Arc<ScrapeSignal>> {
        self.conns
            .lock()
            .values()
            .map(|h| Arc::clone(&h.slot))
            .collect()
    }

    fn snapshot(&self, index: u64) -> Option<Vec<u8>> {
        self.conns
            .lock()
            .get(&index)
            .map(|h| h.snapshot.lock().clone())
    }

    /// Begins teardown of every live connection.
    fn disconnect_all(&self) {
        for handle in self.conns.lock().values() {
            let _ignore = handle.cm.disconnect();
        }
    }
}

/// The collector process: CM listener, tick scheduler and one poller per
/// connection.
pub struct Collector {
    cfg: Arc<CollectorConfig>,
    registry: Arc<ConnRegistry>,
    round: Arc<RoundClock>,
    shutdown: Arc<ShutdownSignal>,
    rdma_port: u16,
    listener: Mutex<Option<CmListener>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Collector {
    /// Binds the RDMA listener and spawns the accept loop and the tick
    /// thread.
    pub fn start(cfg: CollectorConfig) -> Result<Self> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        let registry = Arc::new(ConnRegistry::default());
        let round = Arc::new(RoundClock::new());
        let shutdown = ShutdownSignal::new();
        let workers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();

        let listener = CmListener::bind(cfg.listen_port)?;
        let rdma_port = listener.local_port();
        info!("collector listening on port {rdma_port}");

        let mut threads = Vec::new();
        {
            let cfg = Arc::clone(&cfg);
            let registry = Arc::clone(&registry);
            let round = Arc::clone(&round);
            let workers = Arc::clone(&workers);
            let events = listener.event_source();
            threads.push(spawn_worker("mv-cm-listener", move || {
                listen_loop(&events, &cfg, &registry, &round, &workers);
            }));
        }
        {
            let registry = Arc::clone(&registry);
            let round = Arc::clone(&round);
            let shutdown = Arc::clone(&shutdown);
            let interval = Duration::from_secs(cfg.sampling_interval_secs);
            threads.push(spawn_worker("mv-tick", move || {
                tick::run(&registry, &round, interval, &shutdown);
            }));
        }

        Ok(Self {
            cfg,
            registry,
            round,
            shutdown,
            rdma_port,
            listener: Mutex::new(Some(listener)),
            threads: Mutex::new(threads),
            workers,
        })
    }

    /// Port the RDMA listener actually bound.
    pub fn rdma_port(&self) -> u16 {
        self.rdma_port
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Number of completed global rounds so far.
    pub fn round_count(&self) -> usize {
        self.round.sample_count()
    }

    /// Latest fully scraped page image for a connection, if it is live.
    pub fn snapshot(&self, index: u64) -> Option<Vec<u8>> {
        self.registry.snapshot(index)
    }

    /// Stops the collector: closes the listener, disconnects every
    /// connection and joins all workers. Sample files are flushed by the
    /// exiting pollers.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
        if let Some(mut listener) = self.listener.lock().take() {
            listener.shutdown();
        }
        self.registry.disconnect_all();
        for handle in self.threads.lock().drain(..) {
            let _ignore = handle.join();
        }
        // The listener loop is gone now; catch any connection it finished
        // building while the first pass ran.
        self.registry.disconnect_all();
        for handle in self.workers.lock().drain(..) {
            let _ignore = handle.join();
        }
        info!("collector stopped");
    }

    /// Collector configuration in effect.
    pub fn config(&self) -> &CollectorConfig {
        &self.cfg
    }
}

/// Accept loop: builds a connection per `ConnectRequest` and hands it to a
/// dedicated poller plus a CM event task. Build failures are scoped to the
/// one connection.
fn listen_loop(
    events: &flume::Receiver<CmEvent>,
    cfg: &Arc<CollectorConfig>,
    registry: &Arc<ConnRegistry>,
    round: &Arc<RoundClock>,
    workers: &Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    while let Ok(event) = events.recv() {
        let cm = match event {
            CmEvent::ConnectRequest(cm) => cm,
            other => {
                warn!("unexpected listener event: {other:?}");
                continue;
            }
        };
        let index = registry.next_index();
        let conn = match ScrapeConnection::build(index, cm.clone(), cfg) {
            Ok(conn) => conn,
            Err(err) => {
                error!("connection {index}: build failed: {err}");
                let _ignore = cm.disconnect();
                cm.destroy();
                continue;
            }
        };
        info!("connection {index}: accepted");

        let slot = ScrapeSignal::new();
        registry.insert(
            index,
            ConnHandle {
                slot: Arc::clone(&slot),
                cm: cm.clone(),
                snapshot: conn.snapshot(),
            },
        );

        // CM event task: waits for disconnection and kicks the poller out
        // of whichever wait it is parked in.
        {
            let slot = Arc::clone(&slot);
            let cq = conn.cq();
            let handle = spawn_worker(&format!("mv-cm-{index}"), move || loop {
                match cm.get_event() {
                    Ok(CmEvent::Disconnected) | Err(_) => {
                        slot.abort();
                        cq.push_flush();
                        return;
                    }
                    Ok(CmEvent::Established) => info!("connection {index}: established"),
                    Ok(other) => warn!("connection {index}: unexpected event {other:?}"),
                }
            });
            workers.lock().push(handle);
        }

        let poller = Poller {
            conn,
            slot,
            round: Arc::clone(round),
            registry: Arc::clone(registry),
            output_dir: cfg.output_dir.clone(),
        };
        let handle = spawn_worker(&format!("mv-poller-{index}"), move || poller.run());
        workers.lock().push(handle);
    }
}
