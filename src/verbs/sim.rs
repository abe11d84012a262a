//! Software reliable-connected transport over TCP.
//!
//! Connection management follows the librdmacm event order: the active side
//! observes `AddrResolved -> RouteResolved -> Established`, the passive side
//! observes `ConnectRequest` on its listener and `Established` on the child
//! id. Data-path frames are bincode encoded; TCP's FIFO ordering stands in
//! for the RC guarantee that posted work requests complete in post order.
//!
//! One-sided READs are served by the demux thread of the owning side
//! directly from registered memory after rkey and range validation; no code
//! above this module runs on the serving side.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, BufReader, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    spawner::{spawn_worker, AbortSignal},
    wire::MrDescriptor,
};

use super::{MrAccess, ReadWr, RecvWr, SendWr, WcOpcode, WcStatus, WorkCompletion};

/// Connection-manager event.
#[derive(Debug)]
pub(crate) enum CmEvent {
    AddrResolved,
    RouteResolved,
    /// A new inbound connection; carries the child id to accept on.
    ConnectRequest(CmId),
    Established,
    Disconnected,
}

/// Frames exchanged on the emulated wire.
#[derive(Debug, bincode::Encode, bincode::Decode)]
enum Frame {
    Connect,
    Accept,
    Disconnect,
    Send { data: Vec<u8> },
    ReadReq { raddr: u64, rkey: u32, length: u32 },
    ReadResp { ok: bool, data: Vec<u8> },
}

/// A registered memory range.
#[derive(Debug, Clone, Copy)]
struct Region {
    addr: u64,
    length: usize,
}

impl Region {
    fn contains(&self, addr: u64, length: u32) -> bool {
        addr >= self.addr
            && u64::from(length) <= self.length as u64
            && addr.saturating_add(u64::from(length)) <= self.addr + self.length as u64
    }
}

/// Per-connection registration tables. `remote` holds regions the peer may
/// READ (keyed by rkey); `local` holds everything usable as a local buffer
/// (keyed by lkey).
#[derive(Debug, Default)]
struct MrTables {
    remote: Mutex<HashMap<u32, Region>>,
    local: Mutex<HashMap<u32, Region>>,
}

impl MrTables {
    fn lookup_local(&self, lkey: u32, addr: u64, length: u32) -> bool {
        self.local
            .lock()
            .get(&lkey)
            .is_some_and(|r| r.contains(addr, length))
    }
}

fn read_region(addr: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let slice = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
    data.copy_from_slice(slice);
    data
}

fn write_region(addr: u64, data: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len());
    }
}

/// Serializes every frame writer of a connection behind one lock so frames
/// from the demux thread and the posting threads cannot interleave.
type SharedWriter = Arc<Mutex<TcpStream>>;

fn write_frame(writer: &SharedWriter, frame: &Frame) -> io::Result<()> {
    let mut guard = writer.lock();
    bincode::encode_into_std_write(frame, &mut *guard, bincode::config::standard())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    guard.flush()
}

// ---------------------------------------------------------------------------
// Completion queue and completion channel
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CqInner {
    queue: Mutex<VecDeque<WorkCompletion>>,
    armed: AtomicBool,
    notify_tx: flume::Sender<()>,
}

impl CqInner {
    fn push(&self, wc: WorkCompletion) {
        self.queue.lock().push_back(wc);
        if self.armed.swap(false, Ordering::AcqRel) {
            let _ignore = self.notify_tx.send(());
        }
    }
}

/// Completion queue handle. Cheap to clone; pushes from the demux thread and
/// drains from the poller share the same inner queue.
#[derive(Debug, Clone)]
pub(crate) struct CompletionQueue {
    inner: Arc<CqInner>,
}

impl CompletionQueue {
    /// Pops one completion, non-blocking.
    pub(crate) fn poll(&self) -> Option<WorkCompletion> {
        self.inner.queue.lock().pop_front()
    }

    /// Re-arms the completion channel notification. Entries that raced in
    /// between drain and re-arm trigger an immediate wakeup.
    pub(crate) fn rearm(&self) {
        self.inner.armed.store(true, Ordering::Release);
        if !self.inner.queue.lock().is_empty() && self.inner.armed.swap(false, Ordering::AcqRel) {
            let _ignore = self.inner.notify_tx.send(());
        }
    }

    /// Pushes a flush completion, failing any waiter. Used at teardown to
    /// kick a poller blocked on the completion channel.
    pub(crate) fn push_flush(&self) {
        self.inner.push(WorkCompletion {
            wr_id: 0,
            opcode: WcOpcode::RdmaRead,
            status: WcStatus::FlushError,
            byte_len: 0,
        });
    }
}

/// Blocking side of a completion queue's notification channel.
#[derive(Debug)]
pub(crate) struct CompChannel {
    tx: flume::Sender<()>,
    rx: flume::Receiver<()>,
}

impl CompChannel {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Blocks until the associated CQ signals. An error means every sender
    /// is gone, which only happens at teardown.
    pub(crate) fn wait(&self) -> Result<()> {
        self.rx.recv().map_err(|_| Error::Disconnected)
    }
}

// ---------------------------------------------------------------------------
// Protection domain and memory regions
// ---------------------------------------------------------------------------

/// Protection domain. One per connection; registrations land in the
/// connection's tables so the demux thread can validate peer READs.
#[derive(Debug)]
pub(crate) struct ProtectionDomain {
    mrs: Arc<MrTables>,
    next_key: Arc<AtomicU32>,
}

impl ProtectionDomain {
    /// Registers `length` bytes at `addr`. The memory must stay valid until
    /// the region is deregistered.
    pub(crate) fn register_mr(
        &self,
        addr: u64,
        length: usize,
        access: MrAccess,
    ) -> Result<MemoryRegion> {
        let lkey = self.next_key.fetch_add(1, Ordering::Relaxed);
        let region = Region { addr, length };
        let _prev = self.mrs.local.lock().insert(lkey, region);
        let rkey = match access {
            MrAccess::LocalOnly => None,
            MrAccess::RemoteRead => {
                let rkey = self.next_key.fetch_add(1, Ordering::Relaxed);
                let _prev = self.mrs.remote.lock().insert(rkey, region);
                Some(rkey)
            }
        };
        debug!("registered mr addr {addr:#x} len {length} lkey {lkey} rkey {rkey:?}");
        Ok(MemoryRegion {
            lkey,
            rkey,
            addr,
            length,
            mrs: Arc::clone(&self.mrs),
            registered: true,
        })
    }
}

/// A registered memory region. Deregistration is explicit so teardown can
/// order it before QP destruction; dropping an undereregistered region also
/// removes it from the tables.
#[derive(Debug)]
pub(crate) struct MemoryRegion {
    lkey: u32,
    rkey: Option<u32>,
    addr: u64,
    length: usize,
    mrs: Arc<MrTables>,
    registered: bool,
}

impl MemoryRegion {
    pub(crate) fn lkey(&self) -> u32 {
        self.lkey
    }

    /// Remote descriptor, present only for remotely readable regions.
    pub(crate) fn descriptor(&self) -> Option<MrDescriptor> {
        self.rkey.map(|rkey| MrDescriptor {
            addr: self.addr,
            rkey,
            length: self.length as u32,
        })
    }

    pub(crate) fn deregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        let _local = self.mrs.local.lock().remove(&self.lkey);
        if let Some(rkey) = self.rkey {
            let _remote = self.mrs.remote.lock().remove(&rkey);
        }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.deregister();
    }
}

// ---------------------------------------------------------------------------
// Queue pair
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QpInner {
    writer: SharedWriter,
    cq: Arc<CqInner>,
    mrs: Arc<MrTables>,
    recv_queue: Mutex<VecDeque<RecvWr>>,
    /// Inbound sends that arrived before a receive was posted. Holding them
    /// here emulates the transport's infinite RNR retry.
    pending_inbound: Mutex<VecDeque<Vec<u8>>>,
    /// Posted READs awaiting their responses, FIFO.
    outstanding_reads: Mutex<VecDeque<ReadWr>>,
    closed: AtomicBool,
}

impl QpInner {
    fn deliver_inbound(&self, data: Vec<u8>) {
        let mut pending = self.pending_inbound.lock();
        let wr = self.recv_queue.lock().pop_front();
        match wr {
            Some(wr) => {
                drop(pending);
                self.complete_recv(wr, &data);
            }
            None => pending.push_back(data),
        }
    }

    fn complete_recv(&self, wr: RecvWr, data: &[u8]) {
        let len = data.len().min(wr.length as usize);
        let status = if self.mrs.lookup_local(wr.lkey, wr.laddr, len as u32) {
            write_region(wr.laddr, &data[..len]);
            WcStatus::Success
        } else {
            WcStatus::LocalProtectionError
        };
        self.cq.push(WorkCompletion {
            wr_id: wr.wr_id,
            opcode: WcOpcode::Recv,
            status,
            byte_len: len as u32,
        });
    }

    fn complete_read(&self, ok: bool, data: &[u8]) {
        let Some(wr) = self.outstanding_reads.lock().pop_front() else {
            warn!("read response without an outstanding read");
            return;
        };
        let status = if !ok {
            WcStatus::RemoteAccessError
        } else if self.mrs.lookup_local(wr.lkey, wr.laddr, wr.length) {
            write_region(wr.laddr, &data[..wr.length as usize]);
            WcStatus::Success
        } else {
            WcStatus::LocalProtectionError
        };
        self.cq.push(WorkCompletion {
            wr_id: wr.wr_id,
            opcode: WcOpcode::RdmaRead,
            status,
            byte_len: wr.length,
        });
    }
}

/// Queue pair handle.
#[derive(Debug, Clone)]
pub(crate) struct QueuePair {
    inner: Arc<QpInner>,
}

impl QueuePair {
    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    /// Posts a send. The payload is captured at post time; the completion is
    /// reported once the transport has taken the data.
    pub(crate) fn post_send(&self, wr: SendWr) -> Result<()> {
        self.ensure_open()?;
        if !self.inner.mrs.lookup_local(wr.lkey, wr.laddr, wr.length) {
            return Err(Error::Completion(WcStatus::LocalProtectionError.to_string()));
        }
        let data = read_region(wr.laddr, wr.length as usize);
        write_frame(&self.inner.writer, &Frame::Send { data })?;
        self.inner.cq.push(WorkCompletion {
            wr_id: wr.wr_id,
            opcode: WcOpcode::Send,
            status: WcStatus::Success,
            byte_len: wr.length,
        });
        Ok(())
    }

    /// Posts a receive for the next inbound send.
    pub(crate) fn post_recv(&self, wr: RecvWr) -> Result<()> {
        self.ensure_open()?;
        // Hold the pending lock across the whole post so an inbound send
        // cannot slip between the emptiness check and the queue push.
        let mut pending = self.inner.pending_inbound.lock();
        match pending.pop_front() {
            Some(data) => {
                drop(pending);
                self.inner.complete_recv(wr, &data);
            }
            None => self.inner.recv_queue.lock().push_back(wr),
        }
        Ok(())
    }

    /// Posts a chained batch of one-sided READs. All completions are
    /// signaled and arrive in post order.
    pub(crate) fn post_read_batch(&self, wrs: &[ReadWr]) -> Result<()> {
        self.ensure_open()?;
        for wr in wrs {
            self.inner.outstanding_reads.lock().push_back(*wr);
            write_frame(
                &self.inner.writer,
                &Frame::ReadReq {
                    raddr: wr.raddr,
                    rkey: wr.rkey,
                    length: wr.length,
                },
            )?;
        }
        Ok(())
    }

    /// Transitions the QP out of service; further posts fail.
    pub(crate) fn destroy(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Connection manager id
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CmIdInner {
    events_tx: flume::Sender<CmEvent>,
    events_rx: flume::Receiver<CmEvent>,
    stream: Mutex<Option<TcpStream>>,
    writer: Mutex<Option<SharedWriter>>,
    qp: Mutex<Option<Arc<QpInner>>>,
    mrs: Arc<MrTables>,
    next_key: Arc<AtomicU32>,
    demux: Mutex<Option<JoinHandle<()>>>,
    disconnected: AtomicBool,
}

impl CmIdInner {
    fn emit_disconnected_once(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            let _ignore = self.events_tx.send(CmEvent::Disconnected);
        }
    }
}

/// Connection-manager id: one per RDMA connection, carrying its own event
/// stream. Cloning yields another handle onto the same connection, which is
/// how the control plane keeps a disconnect handle in its tables.
#[derive(Debug, Clone)]
pub(crate) struct CmId {
    inner: Arc<CmIdInner>,
}

impl CmId {
    pub(crate) fn new() -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            inner: Arc::new(CmIdInner {
                events_tx,
                events_rx,
                stream: Mutex::new(None),
                writer: Mutex::new(None),
                qp: Mutex::new(None),
                mrs: Arc::new(MrTables::default()),
                next_key: Arc::new(AtomicU32::new(rand::random::<u32>() | 1)),
                demux: Mutex::new(None),
                disconnected: AtomicBool::new(false),
            }),
        }
    }

    fn from_stream(stream: TcpStream) -> Result<Self> {
        let id = Self::new();
        id.set_stream(stream)?;
        Ok(id)
    }

    fn set_stream(&self, stream: TcpStream) -> Result<()> {
        let writer = stream.try_clone().map_err(Error::Io)?;
        *self.inner.writer.lock() = Some(Arc::new(Mutex::new(writer)));
        *self.inner.stream.lock() = Some(stream);
        Ok(())
    }

    fn shared_writer(&self) -> Result<SharedWriter> {
        self.inner
            .writer
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::Transport("not connected".into()))
    }

    /// Blocks for the next CM event. An error means the event channel is
    /// gone, which only happens at teardown.
    pub(crate) fn get_event(&self) -> Result<CmEvent> {
        self.inner.events_rx.recv().map_err(|_| Error::Disconnected)
    }

    /// Resolves the peer address, bounded by `timeout`.
    pub(crate) fn resolve_addr(&self, addr: SocketAddr, timeout: Duration) -> Result<()> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| Error::Resolve(format!("{addr}: {err}")))?;
        stream.set_nodelay(true).map_err(Error::Io)?;
        self.set_stream(stream)?;
        let _ignore = self.inner.events_tx.send(CmEvent::AddrResolved);
        Ok(())
    }

    /// Resolves the route to the peer.
    pub(crate) fn resolve_route(&self, _timeout: Duration) -> Result<()> {
        if self.inner.stream.lock().is_none() {
            return Err(Error::Resolve("route resolution before address".into()));
        }
        let _ignore = self.inner.events_tx.send(CmEvent::RouteResolved);
        Ok(())
    }

    /// Allocates the connection's protection domain.
    pub(crate) fn alloc_pd(&self) -> Result<ProtectionDomain> {
        Ok(ProtectionDomain {
            mrs: Arc::clone(&self.inner.mrs),
            next_key: Arc::clone(&self.inner.next_key),
        })
    }

    /// Creates a completion queue notifying through `channel`.
    pub(crate) fn create_cq(&self, channel: &CompChannel, _depth: usize) -> Result<CompletionQueue> {
        Ok(CompletionQueue {
            inner: Arc::new(CqInner {
                queue: Mutex::new(VecDeque::new()),
                armed: AtomicBool::new(true),
                notify_tx: channel.tx.clone(),
            }),
        })
    }

    /// Creates the connection's queue pair.
    pub(crate) fn create_qp(&self, pd: &ProtectionDomain, cq: &CompletionQueue) -> Result<QueuePair> {
        let writer = self
            .shared_writer()
            .map_err(|_| Error::ConnectionBuild("no stream for qp".into()))?;
        let inner = Arc::new(QpInner {
            writer,
            cq: Arc::clone(&cq.inner),
            mrs: Arc::clone(&pd.mrs),
            recv_queue: Mutex::new(VecDeque::new()),
            pending_inbound: Mutex::new(VecDeque::new()),
            outstanding_reads: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });
        *self.inner.qp.lock() = Some(Arc::clone(&inner));
        Ok(QueuePair { inner })
    }

    /// Active side: requests the connection. `Established` is delivered once
    /// the peer accepts.
    pub(crate) fn connect(&self) -> Result<()> {
        self.spawn_demux()?;
        self.write(&Frame::Connect)
    }

    /// Passive side: accepts a connection received via `ConnectRequest`.
    pub(crate) fn accept(&self) -> Result<()> {
        self.spawn_demux()?;
        self.write(&Frame::Accept)?;
        let _ignore = self.inner.events_tx.send(CmEvent::Established);
        Ok(())
    }

    /// Initiates disconnect. The local `Disconnected` event fires
    /// immediately; the peer observes its own through its event channel.
    pub(crate) fn disconnect(&self) -> Result<()> {
        if let Err(err) = self.write(&Frame::Disconnect) {
            debug!("disconnect frame not delivered: {err}");
        }
        self.inner.emit_disconnected_once();
        Ok(())
    }

    /// Releases the id: closes the wire and reaps the demux thread.
    pub(crate) fn destroy(&self) {
        self.inner.disconnected.store(true, Ordering::Release);
        let _writer = self.inner.writer.lock().take();
        if let Some(stream) = self.inner.stream.lock().take() {
            let _ignore = stream.shutdown(Shutdown::Both);
        }
        let handle = self.inner.demux.lock().take();
        if let Some(handle) = handle {
            let _ignore = handle.join();
        }
    }

    fn stream_clone(&self) -> io::Result<TcpStream> {
        self.inner
            .stream
            .lock()
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?
            .try_clone()
    }

    fn write(&self, frame: &Frame) -> Result<()> {
        write_frame(&self.shared_writer()?, frame).map_err(Error::Io)
    }

    fn spawn_demux(&self) -> Result<()> {
        let reader = self
            .stream_clone()
            .map_err(|err| Error::ConnectionBuild(format!("demux stream: {err}")))?;
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("sim-demux".into())
            .spawn(move || run_demux(&inner, reader))
            .unwrap_or_else(|err| unreachable!("failed to spawn demux: {err}"));
        *self.inner.demux.lock() = Some(handle);
        Ok(())
    }
}

fn run_demux(inner: &CmIdInner, reader: TcpStream) {
    let mut reader = BufReader::new(reader);
    loop {
        let frame =
            match bincode::decode_from_std_read::<Frame, _, _>(&mut reader, bincode::config::standard())
            {
                Ok(frame) => frame,
                Err(_) => {
                    // Peer gone or wire closed under us.
                    inner.emit_disconnected_once();
                    return;
                }
            };
        match frame {
            Frame::Accept => {
                let _ignore = inner.events_tx.send(CmEvent::Established);
            }
            Frame::Connect => warn!("unexpected connect frame on established wire"),
            Frame::Disconnect => {
                inner.emit_disconnected_once();
                return;
            }
            Frame::Send { data } => {
                let qp = inner.qp.lock().clone();
                match qp {
                    Some(qp) => qp.deliver_inbound(data),
                    None => warn!("send frame before qp creation, dropped"),
                }
            }
            Frame::ReadReq { raddr, rkey, length } => {
                let resp = serve_read(&inner.mrs, raddr, rkey, length);
                let Some(writer) = inner.writer.lock().as_ref().cloned() else {
                    return;
                };
                if write_frame(&writer, &resp).is_err() {
                    inner.emit_disconnected_once();
                    return;
                }
            }
            Frame::ReadResp { ok, data } => {
                let qp = inner.qp.lock().clone();
                match qp {
                    Some(qp) => qp.complete_read(ok, &data),
                    None => warn!("read response before qp creation, dropped"),
                }
            }
        }
    }
}

/// Validates and executes a peer READ against the registration table.
fn serve_read(mrs: &MrTables, raddr: u64, rkey: u32, length: u32) -> Frame {
    let region = mrs.remote.lock().get(&rkey).copied();
    match region {
        Some(region) if region.contains(raddr, length) => Frame::ReadResp {
            ok: true,
            data: read_region(raddr, length as usize),
        },
        _ => {
            error!("rejecting read: rkey {rkey:#x} addr {raddr:#x} len {length}");
            Frame::ReadResp {
                ok: false,
                data: Vec::new(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Passive listener
// ---------------------------------------------------------------------------

/// Passive-side CM listener. Each inbound connection surfaces as a
/// `ConnectRequest` event carrying the child id.
#[derive(Debug)]
pub(crate) struct CmListener {
    events_rx: flume::Receiver<CmEvent>,
    local_port: u16,
    abort: AbortSignal,
    acceptor: Option<JoinHandle<()>>,
}

impl CmListener {
    /// Binds and starts accepting. Port 0 binds an ephemeral port,
    /// retrievable through [`local_port`](Self::local_port).
    pub(crate) fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|err| Error::Transport(format!("bind port {port}: {err}")))?;
        let local_port = listener
            .local_addr()
            .map_err(|err| Error::Transport(format!("local addr: {err}")))?
            .port();
        let (events_tx, events_rx) = flume::unbounded();
        let abort = AbortSignal::new();
        let abort_c = abort.clone();
        let acceptor = spawn_worker("sim-acceptor", move || {
            accept_loop(&listener, &events_tx, &abort_c);
        });
        Ok(Self {
            events_rx,
            local_port,
            abort,
            acceptor: Some(acceptor),
        })
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Event stream handle for the listener's CM event task. Drains empty
    /// once the listener shuts down.
    pub(crate) fn event_source(&self) -> flume::Receiver<CmEvent> {
        self.events_rx.clone()
    }

    /// Stops accepting and reaps the acceptor thread.
    pub(crate) fn shutdown(&mut self) {
        self.abort.abort();
        // Wake the blocking accept.
        let _ignore = TcpStream::connect((Ipv4Addr::LOCALHOST, self.local_port));
        if let Some(handle) = self.acceptor.take() {
            let _ignore = handle.join();
        }
    }
}

impl Drop for CmListener {
    fn drop(&mut self) {
        if self.acceptor.is_some() {
            self.shutdown();
        }
    }
}

fn accept_loop(listener: &TcpListener, events_tx: &flume::Sender<CmEvent>, abort: &AbortSignal) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(err) => {
                error!("accept failed: {err}");
                return;
            }
        };
        if abort.should_abort() {
            return;
        }
        if stream.set_nodelay(true).is_err() {
            continue;
        }
        // The connect frame arrives only after the active side finishes its
        // resource build, so take it off the acceptor's critical path.
        let events_tx = events_tx.clone();
        let _handle = std::thread::Builder::new()
            .name("sim-handshake".into())
            .spawn(move || {
                let mut reader = BufReader::new(match stream.try_clone() {
                    Ok(clone) => clone,
                    Err(err) => {
                        warn!("handshake clone failed for {peer}: {err}");
                        return;
                    }
                });
                match bincode::decode_from_std_read::<Frame, _, _>(
                    &mut reader,
                    bincode::config::standard(),
                ) {
                    Ok(Frame::Connect) => match CmId::from_stream(stream) {
                        Ok(child) => {
                            let _ignore = events_tx.send(CmEvent::ConnectRequest(child));
                        }
                        Err(err) => warn!("child id setup for {peer} failed: {err}"),
                    },
                    Ok(frame) => warn!("unexpected handshake frame from {peer}: {frame:?}"),
                    Err(err) => warn!("handshake decode from {peer}: {err}"),
                }
            })
            .unwrap_or_else(|err| unreachable!("failed to spawn handshake: {err}"));
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::constants::CQ_DEPTH;

    fn establish_pair() -> (CmId, CmId, CmListener) {
        let listener = CmListener::bind(0).unwrap();
        let addr: SocketAddr = format!("127.0.0.1:{}", listener.local_port())
            .parse()
            .unwrap();

        let active = CmId::new();
        active
            .resolve_addr(addr, Duration::from_millis(500))
            .unwrap();
        assert!(matches!(active.get_event().unwrap(), CmEvent::AddrResolved));
        active.resolve_route(Duration::from_millis(500)).unwrap();
        assert!(matches!(active.get_event().unwrap(), CmEvent::RouteResolved));

        active.connect().unwrap();
        let passive = match listener.event_source().recv().unwrap() {
            CmEvent::ConnectRequest(child) => child,
            other => panic!("expected connect request, got {other:?}"),
        };
        passive.accept().unwrap();
        assert!(matches!(active.get_event().unwrap(), CmEvent::Established));
        assert!(matches!(passive.get_event().unwrap(), CmEvent::Established));
        (active, passive, listener)
    }

    fn build_qp(cm: &CmId) -> (ProtectionDomain, CompChannel, CompletionQueue, QueuePair) {
        let pd = cm.alloc_pd().unwrap();
        let chan = CompChannel::new();
        let cq = cm.create_cq(&chan, CQ_DEPTH).unwrap();
        let qp = cm.create_qp(&pd, &cq).unwrap();
        (pd, chan, cq, qp)
    }

    fn wait_wc(chan: &CompChannel, cq: &CompletionQueue) -> WorkCompletion {
        loop {
            if let Some(wc) = cq.poll() {
                return wc;
            }
            chan.wait().unwrap();
            cq.rearm();
        }
    }

    #[test]
    fn send_recv_roundtrip() {
        let (active, passive, _listener) = establish_pair();
        let (active_pd, active_chan, active_cq, active_qp) = build_qp(&active);
        let (passive_pd, passive_chan, passive_cq, passive_qp) = build_qp(&passive);

        let payload = *b"metric page descriptor";
        let src = vec![0u8; 64].into_boxed_slice();
        let src_addr = src.as_ptr() as u64;
        write_region(src_addr, &payload);
        let src_mr = active_pd
            .register_mr(src_addr, src.len(), MrAccess::LocalOnly)
            .unwrap();

        let dst = vec![0u8; 64].into_boxed_slice();
        let dst_addr = dst.as_ptr() as u64;
        let dst_mr = passive_pd
            .register_mr(dst_addr, dst.len(), MrAccess::LocalOnly)
            .unwrap();
        passive_qp
            .post_recv(RecvWr {
                wr_id: 9,
                laddr: dst_addr,
                lkey: dst_mr.lkey(),
                length: 64,
            })
            .unwrap();

        active_qp
            .post_send(SendWr {
                wr_id: 1,
                laddr: src_addr,
                lkey: src_mr.lkey(),
                length: payload.len() as u32,
            })
            .unwrap();

        let send_wc = wait_wc(&active_chan, &active_cq);
        assert_eq!(send_wc.opcode, WcOpcode::Send);
        assert!(send_wc.is_success());

        let recv_wc = wait_wc(&passive_chan, &passive_cq);
        assert_eq!(recv_wc.opcode, WcOpcode::Recv);
        assert_eq!(recv_wc.wr_id, 9);
        assert_eq!(recv_wc.byte_len as usize, payload.len());
        assert_eq!(&dst[..payload.len()], &payload);
    }

    #[test]
    fn inbound_send_waits_for_posted_recv() {
        let (active, passive, _listener) = establish_pair();
        let (active_pd, _active_chan, _active_cq, active_qp) = build_qp(&active);
        let (passive_pd, passive_chan, passive_cq, passive_qp) = build_qp(&passive);

        let src = vec![7u8; 16].into_boxed_slice();
        let src_addr = src.as_ptr() as u64;
        let src_mr = active_pd
            .register_mr(src_addr, src.len(), MrAccess::LocalOnly)
            .unwrap();
        active_qp
            .post_send(SendWr {
                wr_id: 1,
                laddr: src_addr,
                lkey: src_mr.lkey(),
                length: 16,
            })
            .unwrap();

        // Give the frame time to arrive with no receive posted.
        std::thread::sleep(Duration::from_millis(50));

        let dst = vec![0u8; 16].into_boxed_slice();
        let dst_addr = dst.as_ptr() as u64;
        let dst_mr = passive_pd
            .register_mr(dst_addr, dst.len(), MrAccess::LocalOnly)
            .unwrap();
        passive_qp
            .post_recv(RecvWr {
                wr_id: 2,
                laddr: dst_addr,
                lkey: dst_mr.lkey(),
                length: 16,
            })
            .unwrap();

        let wc = wait_wc(&passive_chan, &passive_cq);
        assert_eq!(wc.opcode, WcOpcode::Recv);
        assert!(wc.is_success());
        assert_eq!(&dst[..], &[7u8; 16]);
    }

    #[test]
    fn read_batch_completes_in_post_order() {
        let (active, passive, _listener) = establish_pair();
        let (active_pd, _active_chan, _active_cq, _active_qp) = build_qp(&active);
        let (passive_pd, passive_chan, passive_cq, passive_qp) = build_qp(&passive);

        let page = (0u8..64).collect::<Vec<u8>>().into_boxed_slice();
        let page_addr = page.as_ptr() as u64;
        let page_mr = active_pd
            .register_mr(page_addr, page.len(), MrAccess::RemoteRead)
            .unwrap();
        let desc = page_mr.descriptor().unwrap();

        let n = 4usize;
        let sinks: Vec<Box<[u8]>> = (0..n).map(|_| vec![0u8; 64].into_boxed_slice()).collect();
        let sink_mrs: Vec<MemoryRegion> = sinks
            .iter()
            .map(|sink| {
                passive_pd
                    .register_mr(sink.as_ptr() as u64, sink.len(), MrAccess::LocalOnly)
                    .unwrap()
            })
            .collect();

        let wrs: Vec<ReadWr> = (0..n)
            .map(|i| ReadWr {
                wr_id: i as u64,
                laddr: sinks[i].as_ptr() as u64,
                lkey: sink_mrs[i].lkey(),
                raddr: desc.addr,
                rkey: desc.rkey,
                length: desc.length,
            })
            .collect();
        passive_qp.post_read_batch(&wrs).unwrap();

        for i in 0..n {
            let wc = wait_wc(&passive_chan, &passive_cq);
            assert_eq!(wc.opcode, WcOpcode::RdmaRead);
            assert!(wc.is_success());
            assert_eq!(wc.wr_id, i as u64, "completions must follow post order");
        }
        for sink in &sinks {
            assert_eq!(&sink[..], &page[..]);
        }
    }

    #[test]
    fn read_with_bad_rkey_fails_remotely() {
        let (active, passive, _listener) = establish_pair();
        let (active_pd, _active_chan, _active_cq, _active_qp) = build_qp(&active);
        let (passive_pd, passive_chan, passive_cq, passive_qp) = build_qp(&passive);

        let page = vec![1u8; 64].into_boxed_slice();
        let page_mr = active_pd
            .register_mr(page.as_ptr() as u64, page.len(), MrAccess::RemoteRead)
            .unwrap();
        let desc = page_mr.descriptor().unwrap();

        let sink = vec![0u8; 64].into_boxed_slice();
        let sink_mr = passive_pd
            .register_mr(sink.as_ptr() as u64, sink.len(), MrAccess::LocalOnly)
            .unwrap();

        passive_qp
            .post_read_batch(&[ReadWr {
                wr_id: 1,
                laddr: sink.as_ptr() as u64,
                lkey: sink_mr.lkey(),
                raddr: desc.addr,
                rkey: desc.rkey.wrapping_add(1),
                length: desc.length,
            }])
            .unwrap();

        let wc = wait_wc(&passive_chan, &passive_cq);
        assert_eq!(wc.status, WcStatus::RemoteAccessError);
    }

    #[test]
    fn connect_disconnect_cycles_leave_no_registrations() {
        for _ in 0..3 {
            let (active, passive, _listener) = establish_pair();
            let (active_pd, _active_chan, _active_cq, active_qp) = build_qp(&active);

            let page = vec![0u8; 64].into_boxed_slice();
            let mut page_mr = active_pd
                .register_mr(page.as_ptr() as u64, page.len(), MrAccess::RemoteRead)
                .unwrap();
            let ctrl = vec![0u8; 64].into_boxed_slice();
            let ctrl_mr = active_pd
                .register_mr(ctrl.as_ptr() as u64, ctrl.len(), MrAccess::LocalOnly)
                .unwrap();
            assert_eq!(active_pd.mrs.local.lock().len(), 2);
            assert_eq!(active_pd.mrs.remote.lock().len(), 1);

            active_qp.destroy();
            page_mr.deregister();
            // The Drop path deregisters too.
            drop(ctrl_mr);
            assert!(active_pd.mrs.local.lock().is_empty());
            assert!(active_pd.mrs.remote.lock().is_empty());

            active.disconnect().unwrap();
            assert!(matches!(active.get_event().unwrap(), CmEvent::Disconnected));
            assert!(matches!(
                passive.get_event().unwrap(),
                CmEvent::Disconnected
            ));
            active.destroy();
            passive.destroy();
        }
    }

    #[test]
    fn deregistered_mr_no_longer_serves_reads() {
        let (active, passive, _listener) = establish_pair();
        let (active_pd, _active_chan, _active_cq, _active_qp) = build_qp(&active);
        let (passive_pd, passive_chan, passive_cq, passive_qp) = build_qp(&passive);

        let page = vec![3u8; 64].into_boxed_slice();
        let mut page_mr = active_pd
            .register_mr(page.as_ptr() as u64, page.len(), MrAccess::RemoteRead)
            .unwrap();
        let desc = page_mr.descriptor().unwrap();

        let sink = vec![0u8; 64].into_boxed_slice();
        let sink_mr = passive_pd
            .register_mr(sink.as_ptr() as u64, sink.len(), MrAccess::LocalOnly)
            .unwrap();
        let wr = ReadWr {
            wr_id: 1,
            laddr: sink.as_ptr() as u64,
            lkey: sink_mr.lkey(),
            raddr: desc.addr,
            rkey: desc.rkey,
            length: desc.length,
        };

        passive_qp.post_read_batch(&[wr]).unwrap();
        assert!(wait_wc(&passive_chan, &passive_cq).is_success());

        page_mr.deregister();
        passive_qp.post_read_batch(&[wr]).unwrap();
        let wc = wait_wc(&passive_chan, &passive_cq);
        assert_eq!(wc.status, WcStatus::RemoteAccessError);
    }

    #[test]
    fn disconnect_reaches_both_sides() {
        let (active, passive, _listener) = establish_pair();
        let (_pd_a, _chan_a, _cq_a, _qp_a) = build_qp(&active);
        let (_pd_p, _chan_p, _cq_p, _qp_p) = build_qp(&passive);

        active.disconnect().unwrap();
        assert!(matches!(active.get_event().unwrap(), CmEvent::Disconnected));
        assert!(matches!(
            passive.get_event().unwrap(),
            CmEvent::Disconnected
        ));
        active.destroy();
        passive.destroy();
    }
}
