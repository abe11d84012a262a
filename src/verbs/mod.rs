//! Transport-neutral verbs surface the scraping plane is written against.
//!
//! The shape mirrors the connection-manager flavour of the verbs API: a CM
//! id with a blocking event stream drives connection lifecycle, and each
//! established connection owns its protection domain, completion queue with
//! completion channel, queue pair and registered memory regions.
//!
//! `sim` provides the software implementation of this surface: a reliable
//! connected transport emulated over TCP. A hardware backend would provide
//! the same types over libibverbs; everything above this module is agnostic.

mod sim;

pub(crate) use sim::{
    CmEvent, CmId, CmListener, CompChannel, CompletionQueue, MemoryRegion, ProtectionDomain,
    QueuePair,
};

/// Access granted when registering a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MrAccess {
    /// Usable only as a local buffer (sends, receives, READ sinks).
    LocalOnly,
    /// Additionally readable by the remote peer via one-sided READ.
    RemoteRead,
}

/// Opcode of a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WcOpcode {
    /// A posted send finished.
    Send,
    /// A posted receive was consumed by an inbound send.
    Recv,
    /// A one-sided READ returned.
    RdmaRead,
}

/// Status of a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum WcStatus {
    #[error("success")]
    Success,
    /// The peer rejected the access (bad rkey or out-of-range READ).
    #[error("remote access error")]
    RemoteAccessError,
    /// A local buffer did not belong to a registered region.
    #[error("local protection error")]
    LocalProtectionError,
    /// The work request was flushed because the connection went down.
    #[error("work request flushed")]
    FlushError,
}

/// One entry drained from a completion queue.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkCompletion {
    pub(crate) wr_id: u64,
    pub(crate) opcode: WcOpcode,
    pub(crate) status: WcStatus,
    pub(crate) byte_len: u32,
}

impl WorkCompletion {
    pub(crate) fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Send work request. `laddr`/`lkey` name a registered local buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendWr {
    pub(crate) wr_id: u64,
    pub(crate) laddr: u64,
    pub(crate) lkey: u32,
    pub(crate) length: u32,
}

/// Receive work request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecvWr {
    pub(crate) wr_id: u64,
    pub(crate) laddr: u64,
    pub(crate) lkey: u32,
    pub(crate) length: u32,
}

/// One-sided READ work request: fetch `length` bytes from the peer region
/// named by `(raddr, rkey)` into the local buffer `(laddr, lkey)`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadWr {
    pub(crate) wr_id: u64,
    pub(crate) laddr: u64,
    pub(crate) lkey: u32,
    pub(crate) raddr: u64,
    pub(crate) rkey: u32,
    pub(crate) length: u32,
}
