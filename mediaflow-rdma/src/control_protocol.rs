//! Fixed-size control records exchanged over the reliable connection.
//!
//! Every record is [`MESSAGE_BYTES`] long and little-endian:
//!
//! ```text
//!  0..4   magic
//!  4      version
//!  5      type tag
//!  6..8   slot index
//!  8..12  sequence (per-slot credit generation)
//! 12..16  remote key        (BUFFER_DONE)
//! 16..24  remote address    (BUFFER_DONE)
//! 24..28  length            (capacity for BUFFER_DONE, payload for BUFFER_READY)
//! 28..32  reserved
//! ```

use bytes::{Buf, BufMut};
use thiserror::Error;

pub const MESSAGE_MAGIC: u32 = 0x4d46_5244;
pub const PROTOCOL_VERSION: u8 = 1;
pub const MESSAGE_BYTES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum MessageType {
    BufferDone = 1,
    BufferReady = 2,
}

impl MessageType {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::BufferDone),
            2 => Some(Self::BufferReady),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// Consumer → producer: `slot` is free and may be written at
    /// `remote_addr` with `rkey`, up to `capacity` bytes.
    BufferDone {
        slot: u16,
        seq: u32,
        remote_addr: u64,
        rkey: u32,
        capacity: u32,
    },
    /// Producer → consumer: `len` valid bytes were written into `slot`.
    BufferReady { slot: u16, seq: u32, len: u32 },
}

/// Why a received record was discarded.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("truncated record: {len} bytes")]
    Truncated { len: usize },
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type {0}")]
    UnknownType(u8),
}

impl WireMessage {
    pub fn slot(&self) -> u16 {
        match self {
            WireMessage::BufferDone { slot, .. } | WireMessage::BufferReady { slot, .. } => *slot,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::BufferDone { .. } => "buffer_done",
            WireMessage::BufferReady { .. } => "buffer_ready",
        }
    }

    pub fn encode(&self) -> [u8; MESSAGE_BYTES] {
        let mut bytes = [0_u8; MESSAGE_BYTES];
        let mut out = &mut bytes[..];
        out.put_u32_le(MESSAGE_MAGIC);
        out.put_u8(PROTOCOL_VERSION);
        match *self {
            WireMessage::BufferDone {
                slot,
                seq,
                remote_addr,
                rkey,
                capacity,
            } => {
                out.put_u8(MessageType::BufferDone as u8);
                out.put_u16_le(slot);
                out.put_u32_le(seq);
                out.put_u32_le(rkey);
                out.put_u64_le(remote_addr);
                out.put_u32_le(capacity);
            }
            WireMessage::BufferReady { slot, seq, len } => {
                out.put_u8(MessageType::BufferReady as u8);
                out.put_u16_le(slot);
                out.put_u32_le(seq);
                out.put_u32_le(0);
                out.put_u64_le(0);
                out.put_u32_le(len);
            }
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolViolation> {
        if bytes.len() < MESSAGE_BYTES {
            return Err(ProtocolViolation::Truncated { len: bytes.len() });
        }
        let mut buf = &bytes[..MESSAGE_BYTES];
        let magic = buf.get_u32_le();
        if magic != MESSAGE_MAGIC {
            return Err(ProtocolViolation::BadMagic(magic));
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolViolation::UnsupportedVersion(version));
        }
        let raw_type = buf.get_u8();
        let kind = MessageType::from_u8(raw_type).ok_or(ProtocolViolation::UnknownType(raw_type))?;
        let slot = buf.get_u16_le();
        let seq = buf.get_u32_le();
        let rkey = buf.get_u32_le();
        let remote_addr = buf.get_u64_le();
        let len = buf.get_u32_le();

        Ok(match kind {
            MessageType::BufferDone => WireMessage::BufferDone {
                slot,
                seq,
                remote_addr,
                rkey,
                capacity: len,
            },
            MessageType::BufferReady => WireMessage::BufferReady { slot, seq, len },
        })
    }
}
