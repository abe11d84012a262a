//! Control message codec.
//!
//! Exactly one `MR` message travels agent → collector per connection, right
//! after establishment; it advertises the pod page's remote descriptor. The
//! `DONE` tag is reserved for graceful teardown and currently has no sender;
//! disconnection events alone drive teardown.

use bytemuck::{Pod, Zeroable};

use crate::constants::CTRL_MSG_SIZE;

/// Remote memory-region descriptor: everything a peer needs to issue a
/// one-sided READ against the region.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MrDescriptor {
    /// Virtual address of the region in the owner's address space.
    pub addr: u64,
    /// Remote key authorizing access.
    pub rkey: u32,
    /// Region length in bytes.
    pub length: u32,
}

/// Control message exchanged over the send/recv rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Advertises a remotely readable memory region.
    Mr(MrDescriptor),
    /// Reserved for graceful teardown.
    Done,
}

const TAG_MR: u32 = 0;
const TAG_DONE: u32 = 1;

/// On-wire layout, padded to `CTRL_MSG_SIZE` so both peers size their
/// control buffers identically. Transmitted raw; both ends are assumed to
/// share endianness, as they share a host/NIC pair.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawControlMessage {
    tag: u32,
    _pad: u32,
    addr: u64,
    rkey: u32,
    length: u32,
    _reserved: [u8; CTRL_MSG_SIZE - 24],
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown control message tag {0}")]
    UnknownTag(u32),
    #[error("control buffer too short: {0} bytes")]
    ShortBuffer(usize),
}

impl ControlMessage {
    /// Serialized size of any control message.
    pub const WIRE_SIZE: usize = CTRL_MSG_SIZE;

    /// Writes the message into the first `WIRE_SIZE` bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::ShortBuffer(buf.len()));
        }
        let mut raw = RawControlMessage::zeroed();
        match *self {
            ControlMessage::Mr(desc) => {
                raw.tag = TAG_MR;
                raw.addr = desc.addr;
                raw.rkey = desc.rkey;
                raw.length = desc.length;
            }
            ControlMessage::Done => raw.tag = TAG_DONE,
        }
        buf[..Self::WIRE_SIZE].copy_from_slice(bytemuck::bytes_of(&raw));
        Ok(())
    }

    /// Decodes a message from the first `WIRE_SIZE` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::ShortBuffer(buf.len()));
        }
        let raw: RawControlMessage = bytemuck::pod_read_unaligned(&buf[..Self::WIRE_SIZE]);
        match raw.tag {
            TAG_MR => Ok(ControlMessage::Mr(MrDescriptor {
                addr: raw.addr,
                rkey: raw.rkey,
                length: raw.length,
            })),
            TAG_DONE => Ok(ControlMessage::Done),
            tag => Err(WireError::UnknownTag(tag)),
        }
    }
}

/// Control-protocol progress of a connection's send half. Advances
/// monotonically; a regression indicates a state-machine bug.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SendState {
    #[default]
    Init,
    MrSent,
    RdmaSent,
    /// Reserved, like the DONE message itself.
    #[allow(dead_code)]
    DoneSent,
}

/// Control-protocol progress of a connection's receive half.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RecvState {
    #[default]
    Init,
    MrRecv,
    DoneRecv,
}

impl SendState {
    /// Advances to `next`; returns `false` on an attempted regression.
    pub(crate) fn advance(&mut self, next: Self) -> bool {
        if next < *self {
            return false;
        }
        *self = next;
        true
    }
}

impl RecvState {
    /// Advances to `next`; returns `false` on an attempted regression.
    pub(crate) fn advance(&mut self, next: Self) -> bool {
        if next < *self {
            return false;
        }
        *self = next;
        true
    }
}
