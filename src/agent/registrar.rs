//! TCP pod-registration listener.
//!
//! The wire format is deliberately tiny: a pod sends its 4-byte big-endian
//! process id and gets back the fixed-width name of its shared-memory
//! object. The bound port lands in a `.port` sidecar so pods on the same
//! host can discover the agent without environment plumbing.

use std::{
    io::{Read, Write},
    net::{Ipv4Addr, TcpListener, TcpStream},
    sync::Arc,
    thread::JoinHandle,
};

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::{
    config::AgentConfig,
    constants::{PORT_FILE, SHM_NAME_LEN},
    error::{Error, Result},
    spawner::{spawn_worker, ShutdownSignal},
};

use super::{session, shm::SharedPage, PodTable};

/// Binds the registration listener and writes the sidecar. Fatal on
/// failure: without the listener the agent has no purpose.
pub(crate) fn bind(cfg: &AgentConfig) -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.listen_port))
        .map_err(|err| Error::Transport(format!("bind registration port: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| Error::Transport(format!("local addr: {err}")))?
        .port();
    std::fs::write(cfg.workdir.join(PORT_FILE), port.to_string())?;
    info!("pod registration listening on port {port}");
    Ok((listener, port))
}

/// Runs the accept loop. Each inbound registration gets its own handler
/// thread; a handler failure never takes the acceptor down. Handler join
/// handles are parked in `sessions` so shutdown can wait for teardown.
pub(crate) fn accept_loop(
    listener: &TcpListener,
    cfg: &Arc<AgentConfig>,
    pods: &Arc<PodTable>,
    sessions: &Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown: &Arc<ShutdownSignal>,
) {
    for stream in listener.incoming() {
        if shutdown.is_shutdown() {
            return;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                error!("registration accept failed: {err}");
                return;
            }
        };
        let cfg = Arc::clone(cfg);
        let pods = Arc::clone(pods);
        let handle = spawn_worker("pod-handler", move || {
            if let Err(err) = handle_pod(stream, &cfg, &pods) {
                warn!("pod registration handler failed: {err}");
            }
        });
        sessions.lock().push(handle);
    }
}

/// Handshake plus session for a single pod. Any failure here is scoped to
/// this handler; the shared object name stays reusable for a retry.
fn handle_pod(mut stream: TcpStream, cfg: &AgentConfig, pods: &PodTable) -> Result<()> {
    let mut id_buf = [0u8; 4];
    stream.read_exact(&mut id_buf)?;
    let pod_id = u32::from_be_bytes(id_buf);
    info!("registering pod {pod_id}");

    let name = format!("shm-{pod_id}");
    let mut page = SharedPage::create(&name, cfg.block_size)?;

    let mut name_buf = [0u8; SHM_NAME_LEN];
    name_buf[..name.len()].copy_from_slice(name.as_bytes());
    stream.write_all(&name_buf)?;
    drop(stream);

    page.map()?;
    session::run(cfg, pods, page, pod_id)
}
