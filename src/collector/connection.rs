//! Per-connection scrape state on the collector.

use std::{sync::Arc, time::Instant};

use log::info;
use parking_lot::Mutex;

use crate::{
    config::CollectorConfig,
    constants::{CQ_DEPTH, CTRL_MSG_SIZE},
    error::{Error, Result},
    verbs::{
        CmId, CompChannel, CompletionQueue, MemoryRegion, MrAccess, ProtectionDomain, QueuePair,
        ReadWr, RecvWr, WcOpcode, WorkCompletion,
    },
    wire::{ControlMessage, MrDescriptor, RecvState, SendState},
};

use super::latency::{LatencyMeter, RoundClock};

/// Latest fully scraped page image, shared with whatever exports it.
pub(crate) type Snapshot = Arc<Mutex<Vec<u8>>>;

/// One collector-side connection: its verbs resources, control state and
/// batch bookkeeping. Touched only by the owning poller thread once built.
pub(crate) struct ScrapeConnection {
    index: u64,
    cm: CmId,
    _pd: ProtectionDomain,
    chan: CompChannel,
    cq: CompletionQueue,
    qp: QueuePair,
    _ctrl_send: Box<[u8]>,
    ctrl_send_mr: MemoryRegion,
    ctrl_recv: Box<[u8]>,
    ctrl_recv_mr: MemoryRegion,
    sinks: Vec<Box<[u8]>>,
    sink_mrs: Vec<MemoryRegion>,
    peer: Option<MrDescriptor>,
    send_state: SendState,
    recv_state: RecvState,
    /// READs completed in the current batch. Starts full so the first arm
    /// is gated only on the MR advertisement.
    completed: usize,
    batch: usize,
    block_size: usize,
    batch_start: Instant,
    batch_seq: u64,
    meter: LatencyMeter,
    snapshot: Snapshot,
}

impl ScrapeConnection {
    /// Builds the passive-side resources for an inbound connection and
    /// accepts it: PD, CQ with its channel, QP, control buffers and the N
    /// read-sink buffers. Nothing here is remotely readable.
    pub(crate) fn build(index: u64, cm: CmId, cfg: &CollectorConfig) -> Result<Self> {
        let pd = cm.alloc_pd()?;
        let chan = CompChannel::new();
        let cq = cm.create_cq(&chan, CQ_DEPTH)?;
        let qp = cm.create_qp(&pd, &cq)?;

        let ctrl_send = vec![0u8; CTRL_MSG_SIZE].into_boxed_slice();
        let ctrl_send_mr =
            pd.register_mr(ctrl_send.as_ptr() as u64, ctrl_send.len(), MrAccess::LocalOnly)?;
        let ctrl_recv = vec![0u8; CTRL_MSG_SIZE].into_boxed_slice();
        let ctrl_recv_mr =
            pd.register_mr(ctrl_recv.as_ptr() as u64, ctrl_recv.len(), MrAccess::LocalOnly)?;

        let mut sinks = Vec::with_capacity(cfg.mrs_per_pod);
        let mut sink_mrs = Vec::with_capacity(cfg.mrs_per_pod);
        for _ in 0..cfg.mrs_per_pod {
            let sink = vec![0u8; cfg.block_size].into_boxed_slice();
            let mr = pd.register_mr(sink.as_ptr() as u64, sink.len(), MrAccess::LocalOnly)?;
            sinks.push(sink);
            sink_mrs.push(mr);
        }

        qp.post_recv(RecvWr {
            wr_id: 0,
            laddr: ctrl_recv.as_ptr() as u64,
            lkey: ctrl_recv_mr.lkey(),
            length: CTRL_MSG_SIZE as u32,
        })?;
        cm.accept()?;

        Ok(Self {
            index,
            cm,
            _pd: pd,
            chan,
            cq,
            qp,
            _ctrl_send: ctrl_send,
            ctrl_send_mr,
            ctrl_recv,
            ctrl_recv_mr,
            sinks,
            sink_mrs,
            peer: None,
            send_state: SendState::Init,
            recv_state: RecvState::Init,
            completed: cfg.mrs_per_pod,
            batch: cfg.mrs_per_pod,
            block_size: cfg.block_size,
            batch_start: Instant::now(),
            batch_seq: 0,
            meter: LatencyMeter::default(),
            snapshot: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub(crate) fn index(&self) -> u64 {
        self.index
    }

    pub(crate) fn cq(&self) -> CompletionQueue {
        self.cq.clone()
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.snapshot)
    }

    /// A batch may be armed only once the peer MR is known and the prior
    /// batch has fully returned.
    pub(crate) fn ready_to_arm(&self) -> bool {
        self.recv_state >= RecvState::MrRecv && self.completed == self.batch
    }

    /// Blocks on the completion channel.
    pub(crate) fn wait_completions(&self) -> Result<()> {
        self.chan.wait()
    }

    /// Re-arms the completion notification.
    pub(crate) fn rearm(&self) {
        self.cq.rearm();
    }

    pub(crate) fn poll_completion(&self) -> Option<WorkCompletion> {
        self.cq.poll()
    }

    /// Posts the next READ batch: N chained work requests, every one
    /// signaled, all targeting the advertised page base.
    pub(crate) fn arm_batch(&mut self) -> Result<()> {
        debug_assert!(self.ready_to_arm(), "batch armed while previous outstanding");
        let peer = self
            .peer
            .ok_or_else(|| Error::Protocol("batch armed before MR advertisement".into()))?;
        self.batch_start = Instant::now();
        let wrs: Vec<ReadWr> = (0..self.batch)
            .map(|i| ReadWr {
                wr_id: self.batch_seq * self.batch as u64 + i as u64,
                laddr: self.sinks[i].as_ptr() as u64,
                lkey: self.sink_mrs[i].lkey(),
                raddr: peer.addr,
                rkey: peer.rkey,
                length: self.block_size as u32,
            })
            .collect();
        self.qp.post_read_batch(&wrs)?;
        self.completed = 0;
        self.batch_seq += 1;
        if !self.send_state.advance(SendState::RdmaSent) {
            return Err(Error::Protocol("send state regression".into()));
        }
        Ok(())
    }

    /// Dispatches one work completion. An `Err` return ends the poller
    /// loop and flows into teardown.
    pub(crate) fn on_completion(&mut self, wc: WorkCompletion, round: &RoundClock) -> Result<()> {
        if !wc.is_success() {
            return Err(Error::Completion(wc.status.to_string()));
        }
        match wc.opcode {
            WcOpcode::Recv => self.on_control(wc),
            WcOpcode::RdmaRead => {
                self.completed += 1;
                if self.completed == self.batch {
                    self.meter.record(self.batch_start.elapsed());
                    self.publish_snapshot();
                    round.finish_connection();
                }
                Ok(())
            }
            // The collector posts no sends today; tolerate for DONE later.
            WcOpcode::Send => Ok(()),
        }
    }

    fn on_control(&mut self, wc: WorkCompletion) -> Result<()> {
        if (wc.byte_len as usize) < ControlMessage::WIRE_SIZE {
            return Err(Error::Protocol(format!(
                "short control message: {} bytes",
                wc.byte_len
            )));
        }
        let msg = ControlMessage::decode(&self.ctrl_recv)
            .map_err(|err| Error::Protocol(err.to_string()))?;
        match msg {
            ControlMessage::Mr(desc) => {
                if self.recv_state != RecvState::Init {
                    return Err(Error::Protocol("duplicate MR advertisement".into()));
                }
                if !self.recv_state.advance(RecvState::MrRecv) {
                    return Err(Error::Protocol("recv state regression".into()));
                }
                self.peer = Some(desc);
                info!(
                    "connection {}: peer MR addr {:#x} rkey {:#x} len {}",
                    self.index, desc.addr, desc.rkey, desc.length
                );
                Ok(())
            }
            ControlMessage::Done => {
                if self.recv_state < RecvState::MrRecv {
                    return Err(Error::Protocol("DONE before MR advertisement".into()));
                }
                let _ = self.recv_state.advance(RecvState::DoneRecv);
                // Reserved for graceful teardown; the disconnect event does
                // the actual work.
                Ok(())
            }
        }
    }

    /// Copies the freshest sink into the shared snapshot.
    fn publish_snapshot(&self) {
        if let Some(last) = self.sinks.last() {
            let mut snap = self.snapshot.lock();
            snap.clear();
            snap.extend_from_slice(last);
        }
    }

    /// Tears the connection down in dependency order and hands back the
    /// latency meter for the sample file.
    pub(crate) fn teardown(mut self) -> LatencyMeter {
        // Fires the local Disconnected event exactly once, releasing the CM
        // event task even when teardown started from a poller-side error.
        let _ignore = self.cm.disconnect();
        self.qp.destroy();
        self.ctrl_send_mr.deregister();
        self.ctrl_recv_mr.deregister();
        for mr in &mut self.sink_mrs {
            mr.deregister();
        }
        self.cm.destroy();
        // Control and sink buffers drop with self, strictly after their
        // registrations are gone.
        std::mem::take(&mut self.meter)
    }
}
