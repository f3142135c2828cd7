use terrace_core::buffers::StreamError;
use terrace_core::node::NodeId;
use terrace_core::wire::{MessageError, ProtocolError};

use crate::message::GroupMessageType;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("already joined")]
    AlreadyJoined,

    #[error("not joined")]
    NotJoined,

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("{0} left while a response was pending")]
    MemberLeft(NodeId),

    #[error("no response after {waited_ms} ms")]
    Timeout { waited_ms: u64 },

    #[error("zap request from {from} not supported here: {reason}")]
    ZapUnsupported { from: NodeId, reason: String },

    #[error("a listener is already registered for {0:?}")]
    ListenerRegistered(GroupMessageType),

    #[error("group transport closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("runtime: {0}")]
    Runtime(#[from] std::io::Error),
}
