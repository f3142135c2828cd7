//! Terrace wire framing: headers, sealed messages, and the receive-side
//! protocol adaptor.
//!
//! A frame on the wire is a [`WireHeader`] immediately followed by
//! `data_length` payload bytes. Everything multi-byte is big-endian.

mod adaptor;
mod header;
mod message;
pub mod nv;

pub use adaptor::ProtocolAdaptor;
pub use header::{
    HeaderBase, WireHeader, MAX_HEADER_LENGTH, MIN_HEADER_LENGTH, PROTOCOL_VERSION,
};
pub use message::WireMessage;

use crate::buffers::StreamError;

// ── Message types ─────────────────────────────────────────────────────────────

/// Registered message types carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Ping = 1,
    Pong = 2,
    CommitTransaction = 10,
    BroadcastTransaction = 14,
    GroupWrapper = 46,
    GroupHandshake = 47,
    StripeIdMap = 54,
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Ping),
            2 => Ok(MessageType::Pong),
            10 => Ok(MessageType::CommitTransaction),
            14 => Ok(MessageType::BroadcastTransaction),
            46 => Ok(MessageType::GroupWrapper),
            47 => Ok(MessageType::GroupHandshake),
            54 => Ok(MessageType::StripeIdMap),
            other => Err(ProtocolError::UnknownMessageType(other as i32)),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(t: MessageType) -> u16 {
        t as u16
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Malformed input from a peer. Always fatal to the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown protocol version: {0}")]
    BadVersion(u8),

    #[error("invalid header length: {0}")]
    BadHeaderLength(usize),

    #[error("reserved header bits are non-zero: 0x{0:04x}")]
    ReservedBitsSet(u16),

    #[error("corrupt payload length: {0}")]
    CorruptDataLength(u32),

    #[error("payload length {len} exceeds maximum {max}")]
    MessageTooLarge { len: u32, max: u32 },

    #[error("header checksum mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("{offered} bytes committed but only {free} bytes of buffer were free")]
    OverDelivery { offered: usize, free: usize },

    #[error("negative count: {0}")]
    NegativeCount(i32),

    #[error("unknown node identity tag: {0}")]
    UnknownNodeIdTag(u8),

    #[error("unknown name in name-value body: {0}")]
    UnknownName(u8),

    #[error("unknown message type: {0}")]
    UnknownMessageType(i32),

    #[error("unknown string dictionary id: {0}")]
    UnknownDictionaryId(i32),

    #[error("string dictionary id {0} is not positive")]
    InvalidDictionaryId(i32),

    #[error("string dictionary id {0} appears twice")]
    DuplicateDictionaryId(i32),

    #[error("missing required value: {0}")]
    MissingValue(&'static str),

    #[error("truncated input: {0}")]
    Stream(#[from] StreamError),
}

/// Misuse of a [`WireMessage`] or a length that cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message is already sealed")]
    AlreadySealed,

    #[error("message is not sealed")]
    NotSealed,

    #[error("message was recycled")]
    Recycled,

    #[error("message length {0} does not fit a 32-bit count")]
    LengthOverflow(u64),

    #[error("{0} option bytes do not fit in a header")]
    OptionsTooLong(usize),
}
