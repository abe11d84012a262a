//! Host agent: owns the per-pod shared pages and the active side of every
//! RDMA connection to the collector.

mod liveness;
mod registrar;
mod session;
mod shm;

use std::{
    net::{Ipv4Addr, TcpStream},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use log::{info, warn};
use parking_lot::Mutex;

use crate::{
    config::AgentConfig,
    constants::POD_SENTINEL,
    error::Result,
    spawner::{spawn_worker, ShutdownSignal},
    verbs::CmId,
};

/// Control-plane table tying pod ids to their connections' CM handles.
///
/// Slots are append-only for the process lifetime; a reaped pod leaves a
/// sentinel behind so indices stay stable for whoever holds one.
#[derive(Debug, Default)]
pub(crate) struct PodTable {
    entries: Mutex<Vec<PodEntry>>,
}

#[derive(Debug)]
struct PodEntry {
    pid: i32,
    cm: CmId,
}

impl PodTable {
    pub(crate) fn register(&self, pid: i32, cm: CmId) {
        self.entries.lock().push(PodEntry { pid, cm });
    }

    /// Marks a pod's slot with the sentinel once its session has ended.
    pub(crate) fn retire(&self, pid: i32) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.pid == pid) {
            entry.pid = POD_SENTINEL;
        }
    }

    /// Probes every live slot and disconnects the dead ones, all under the
    /// table lock. Disconnect is fire-and-forget; teardown drains in the
    /// session threads.
    pub(crate) fn reap_dead(&self, alive: impl Fn(i32) -> bool) {
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            if entry.pid == POD_SENTINEL || alive(entry.pid) {
                continue;
            }
            info!("pod {} vanished, disconnecting", entry.pid);
            if let Err(err) = entry.cm.disconnect() {
                warn!("disconnect for dead pod {}: {err}", entry.pid);
            }
            entry.pid = POD_SENTINEL;
        }
    }

    /// Disconnects every live connection (agent shutdown).
    pub(crate) fn disconnect_all(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            if entry.pid == POD_SENTINEL {
                continue;
            }
            let _ignore = entry.cm.disconnect();
            entry.pid = POD_SENTINEL;
        }
    }

    /// Number of live (non-sentinel) pods.
    pub(crate) fn live_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.pid != POD_SENTINEL)
            .count()
    }
}

/// The host agent process: registration listener, per-pod sessions and the
/// liveness watcher.
pub struct HostAgent {
    cfg: Arc<AgentConfig>,
    pods: Arc<PodTable>,
    shutdown: Arc<ShutdownSignal>,
    port: u16,
    threads: Mutex<Vec<JoinHandle<()>>>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl HostAgent {
    /// Binds the registration listener, writes the `.port` sidecar and
    /// spawns the acceptor and the liveness watcher.
    pub fn start(cfg: AgentConfig) -> Result<Self> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        let pods = Arc::new(PodTable::default());
        let shutdown = ShutdownSignal::new();

        let (listener, port) = registrar::bind(&cfg)?;
        let sessions: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();

        let mut threads = Vec::new();
        {
            let cfg = Arc::clone(&cfg);
            let pods = Arc::clone(&pods);
            let sessions = Arc::clone(&sessions);
            let shutdown = Arc::clone(&shutdown);
            threads.push(spawn_worker("mv-registrar", move || {
                registrar::accept_loop(&listener, &cfg, &pods, &sessions, &shutdown);
            }));
        }
        {
            let pods = Arc::clone(&pods);
            let shutdown = Arc::clone(&shutdown);
            let period = Duration::from_secs(cfg.liveness_period_secs);
            threads.push(spawn_worker("mv-liveness", move || {
                liveness::watch(&pods, period, &shutdown);
            }));
        }

        Ok(Self {
            cfg,
            pods,
            shutdown,
            port,
            threads: Mutex::new(threads),
            sessions,
        })
    }

    /// Port the registration listener actually bound.
    pub fn registration_port(&self) -> u16 {
        self.port
    }

    /// Number of pods with a live session.
    pub fn pod_count(&self) -> usize {
        self.pods.live_count()
    }

    /// Stops the agent: closes every pod connection and joins the workers.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
        self.pods.disconnect_all();
        // Unblock the acceptor.
        let _ignore = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port));
        for handle in self.threads.lock().drain(..) {
            let _ignore = handle.join();
        }
        // No new handlers past this point; catch any session that
        // registered while the first pass ran.
        self.pods.disconnect_all();
        for handle in self.sessions.lock().drain(..) {
            let _ignore = handle.join();
        }
        info!("agent stopped");
    }

    /// Agent configuration in effect.
    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }
}
