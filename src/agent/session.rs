//! Active-side RDMA session, one per registered pod.
//!
//! The session thread doubles as the connection's CM event task: it drives
//! the resolve/connect ladder, advertises the pod page once established and
//! runs teardown when the connection drops. The agent never issues RDMA
//! operations itself; the page MR exists solely for the collector's READs.

use std::{net::SocketAddr, time::Duration};

use log::{debug, info, warn};

use crate::{
    config::AgentConfig,
    constants::{CQ_DEPTH, CTRL_MSG_SIZE},
    error::{Error, Result},
    verbs::{
        CmEvent, CmId, CompChannel, CompletionQueue, MemoryRegion, MrAccess, ProtectionDomain,
        QueuePair, RecvWr, SendWr,
    },
    wire::{ControlMessage, SendState},
};

use super::{shm::SharedPage, PodTable};

/// Verbs resources of one agent-side connection.
struct AgentConnection {
    _pd: ProtectionDomain,
    _chan: CompChannel,
    _cq: CompletionQueue,
    qp: QueuePair,
    page_mr: MemoryRegion,
    send_buf: Box<[u8]>,
    send_mr: MemoryRegion,
    _recv_buf: Box<[u8]>,
    recv_mr: MemoryRegion,
    send_state: SendState,
    connected: bool,
}

impl AgentConnection {
    /// Builds PD, CQ, QP and registrations for one pod page. The page
    /// reference travels through this call path rather than any side
    /// channel, so the types keep the mapping's lifetime honest.
    fn build(cm: &CmId, page: &SharedPage, _cfg: &AgentConfig) -> Result<Self> {
        let pd = cm.alloc_pd()?;
        let chan = CompChannel::new();
        let cq = cm.create_cq(&chan, CQ_DEPTH)?;
        let qp = cm.create_qp(&pd, &cq)?;

        let page_mr = pd.register_mr(page.addr()?, page.len(), MrAccess::RemoteRead)?;
        let send_buf = vec![0u8; CTRL_MSG_SIZE].into_boxed_slice();
        let send_mr = pd.register_mr(send_buf.as_ptr() as u64, send_buf.len(), MrAccess::LocalOnly)?;
        let recv_buf = vec![0u8; CTRL_MSG_SIZE].into_boxed_slice();
        let recv_mr = pd.register_mr(recv_buf.as_ptr() as u64, recv_buf.len(), MrAccess::LocalOnly)?;

        // One receive is enough: only the reserved DONE could ever arrive.
        qp.post_recv(RecvWr {
            wr_id: 0,
            laddr: recv_buf.as_ptr() as u64,
            lkey: recv_mr.lkey(),
            length: CTRL_MSG_SIZE as u32,
        })?;

        Ok(Self {
            _pd: pd,
            _chan: chan,
            _cq: cq,
            qp,
            page_mr,
            send_buf,
            send_mr,
            _recv_buf: recv_buf,
            recv_mr,
            send_state: SendState::Init,
            connected: false,
        })
    }

    /// Sends the MR control message advertising the pod page.
    fn advertise(&mut self) -> Result<()> {
        let desc = self
            .page_mr
            .descriptor()
            .ok_or_else(|| Error::ConnectionBuild("page MR has no remote descriptor".into()))?;
        ControlMessage::Mr(desc)
            .encode(&mut self.send_buf)
            .map_err(|err| Error::Protocol(err.to_string()))?;
        self.qp.post_send(SendWr {
            wr_id: 1,
            laddr: self.send_buf.as_ptr() as u64,
            lkey: self.send_mr.lkey(),
            length: CTRL_MSG_SIZE as u32,
        })?;
        if !self.send_state.advance(SendState::MrSent) {
            return Err(Error::Protocol("send state regression".into()));
        }
        self.connected = true;
        debug!(
            "advertised page addr {:#x} rkey {:#x} len {}",
            desc.addr, desc.rkey, desc.length
        );
        Ok(())
    }

    /// Releases verbs resources: QP out of service first, then the MRs,
    /// then the buffers backing them.
    fn teardown(mut self) {
        self.qp.destroy();
        self.page_mr.deregister();
        self.send_mr.deregister();
        self.recv_mr.deregister();
    }
}

/// Runs the CM event loop for one pod until disconnection.
///
/// The mapped page is owned here; it outlives every state in which the
/// connection could still be read and is unmapped only after teardown.
pub(crate) fn run(cfg: &AgentConfig, pods: &PodTable, mut page: SharedPage, pod_id: u32) -> Result<()> {
    let cm = CmId::new();
    pods.register(pod_id as i32, cm.clone());

    let result = drive(cfg, &cm, &page, pod_id);
    if result.is_err() {
        // Make sure the peer learns about a half-built session.
        let _ignore = cm.disconnect();
    }
    cm.destroy();
    pods.retire(pod_id as i32);
    page.unlink(cfg.unlink_policy);
    result
}

fn drive(cfg: &AgentConfig, cm: &CmId, page: &SharedPage, pod_id: u32) -> Result<()> {
    let peer: SocketAddr = format!("{}:{}", cfg.peer_ip, cfg.peer_port)
        .parse()
        .map_err(|err| Error::Resolve(format!("peer address: {err}")))?;
    let timeout = Duration::from_millis(cfg.resolve_timeout_ms);
    cm.resolve_addr(peer, timeout)?;

    let mut conn: Option<AgentConnection> = None;
    let outcome = (|| -> Result<()> {
        loop {
            match cm.get_event()? {
                CmEvent::AddrResolved => {
                    conn = Some(AgentConnection::build(cm, page, cfg)?);
                    cm.resolve_route(timeout)?;
                }
                CmEvent::RouteResolved => cm.connect()?,
                CmEvent::Established => match conn.as_mut() {
                    Some(conn) => conn.advertise()?,
                    None => return Err(Error::Protocol("established before build".into())),
                },
                CmEvent::Disconnected => {
                    info!("pod {pod_id}: connection closed");
                    return Ok(());
                }
                CmEvent::ConnectRequest(_) => {
                    return Err(Error::Protocol("connect request on active id".into()))
                }
            }
        }
    })();
    if let Some(conn) = conn.take() {
        if !conn.connected {
            warn!("pod {pod_id}: torn down before establishment");
        }
        conn.teardown();
    }
    outcome
}
