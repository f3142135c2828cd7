//! Group messages: one flat envelope plus a body per message type.
//!
//! ```text
//! [type:i32][messageId:i64][inResponseTo:i64]{body}
//! ```
//!
//! Bodies:
//! - handshake: name-value pairs (node id, version)
//! - zap-node request: `[zapType:i32][reason:string][count:i32]{weight:i64}`
//! - stripe-ID exchange: name-value pairs (stripe name, stripe uuid, active)
//! - application: `[len:i32][bytes]`
//! - ack: empty

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;

use terrace_core::buffers::{ByteBufferInput, ByteBufferOutput, ChunkPool, StreamError};
use terrace_core::node::NodeId;
use terrace_core::wire::nv::{self, NvMessage, NvWriter};
use terrace_core::wire::{MessageType, ProtocolError, WireMessage};

use crate::GroupError;

// ── Message ids ───────────────────────────────────────────────────────────────

/// Sender-local message id. Ids from one factory are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(i64);

impl MessageId {
    pub const NULL: MessageId = MessageId(-1);

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "MessageId(NULL)")
        } else {
            write!(f, "MessageId({})", self.0)
        }
    }
}

/// Monotonic id source. Owned by a group manager and handed to whoever
/// builds messages; tests can start it at a known seed.
#[derive(Debug, Default)]
pub struct MessageIdFactory {
    next: AtomicI64,
}

impl MessageIdFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: i64) -> Self {
        Self {
            next: AtomicI64::new(seed),
        }
    }

    pub fn next_id(&self) -> MessageId {
        MessageId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum GroupMessageType {
    Handshake = 0,
    ZapNodeRequest = 1,
    StripeIdExchange = 2,
    Application = 3,
    Ack = 4,
}

impl TryFrom<i32> for GroupMessageType {
    type Error = ProtocolError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::ZapNodeRequest),
            2 => Ok(Self::StripeIdExchange),
            3 => Ok(Self::Application),
            4 => Ok(Self::Ack),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

// ── Bodies ────────────────────────────────────────────────────────────────────

/// First message on a new connection: who the sender is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub node_id: NodeId,
    pub version: String,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            node_id: NodeId::Null,
            version: String::new(),
        }
    }
}

const HANDSHAKE_NODE_ID: u8 = 0;
const HANDSHAKE_VERSION: u8 = 1;

impl NvMessage for Handshake {
    fn dehydrate(&self, out: &mut NvWriter<'_>) -> Result<(), StreamError> {
        out.put_with(HANDSHAKE_NODE_ID, |o| self.node_id.encode(o))?;
        out.put_string(HANDSHAKE_VERSION, &self.version)
    }

    fn hydrate_value(&mut self, name: u8, input: &mut ByteBufferInput) -> Result<bool, ProtocolError> {
        match name {
            HANDSHAKE_NODE_ID => self.node_id = NodeId::decode(input)?,
            HANDSHAKE_VERSION => self.version = input.read_string()?.unwrap_or_default(),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.node_id.is_null() {
            return Err(ProtocolError::MissingValue("node_id"));
        }
        Ok(())
    }
}

/// Request that the receiver leave the group. `weights` let the receiver
/// decide which side of a split yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapNodeRequest {
    pub zap_type: i32,
    pub reason: String,
    pub weights: Vec<i64>,
}

/// Identity of the stripe a server belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripeIdExchange {
    pub stripe_name: String,
    pub stripe_uuid: String,
    pub is_active: bool,
}

const STRIPE_NAME: u8 = 0;
const STRIPE_UUID: u8 = 1;
const STRIPE_ACTIVE: u8 = 2;

impl NvMessage for StripeIdExchange {
    fn dehydrate(&self, out: &mut NvWriter<'_>) -> Result<(), StreamError> {
        out.put_string(STRIPE_NAME, &self.stripe_name)?;
        out.put_string(STRIPE_UUID, &self.stripe_uuid)?;
        out.put_bool(STRIPE_ACTIVE, self.is_active);
        Ok(())
    }

    fn hydrate_value(&mut self, name: u8, input: &mut ByteBufferInput) -> Result<bool, ProtocolError> {
        match name {
            STRIPE_NAME => self.stripe_name = input.read_string()?.unwrap_or_default(),
            STRIPE_UUID => self.stripe_uuid = input.read_string()?.unwrap_or_default(),
            STRIPE_ACTIVE => self.is_active = input.read_bool()?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBody {
    Handshake(Handshake),
    ZapNodeRequest(ZapNodeRequest),
    StripeIdExchange(StripeIdExchange),
    Application(Bytes),
    Ack,
}

impl GroupBody {
    pub fn message_type(&self) -> GroupMessageType {
        match self {
            GroupBody::Handshake(_) => GroupMessageType::Handshake,
            GroupBody::ZapNodeRequest(_) => GroupMessageType::ZapNodeRequest,
            GroupBody::StripeIdExchange(_) => GroupMessageType::StripeIdExchange,
            GroupBody::Application(_) => GroupMessageType::Application,
            GroupBody::Ack => GroupMessageType::Ack,
        }
    }

    fn encode(&self, out: &mut ByteBufferOutput) -> Result<(), StreamError> {
        match self {
            GroupBody::Handshake(h) => nv::encode(h, out),
            GroupBody::ZapNodeRequest(z) => {
                out.write_i32(z.zap_type);
                out.write_string(Some(&z.reason))?;
                out.write_length(z.weights.len())?;
                for w in &z.weights {
                    out.write_i64(*w);
                }
                Ok(())
            }
            GroupBody::StripeIdExchange(s) => nv::encode(s, out),
            GroupBody::Application(data) => out.write_byte_array(data),
            GroupBody::Ack => Ok(()),
        }
    }

    fn decode(ty: GroupMessageType, input: &mut ByteBufferInput) -> Result<Self, ProtocolError> {
        let body = match ty {
            GroupMessageType::Handshake => GroupBody::Handshake(nv::decode(input)?),
            GroupMessageType::ZapNodeRequest => {
                let zap_type = input.read_i32()?;
                let reason = input.read_string()?.unwrap_or_default();
                let count = input.read_i32()?;
                if count < 0 {
                    return Err(ProtocolError::NegativeCount(count));
                }
                let mut weights = Vec::with_capacity((count as usize).min(input.available() / 8));
                for _ in 0..count {
                    weights.push(input.read_i64()?);
                }
                GroupBody::ZapNodeRequest(ZapNodeRequest {
                    zap_type,
                    reason,
                    weights,
                })
            }
            GroupMessageType::StripeIdExchange => GroupBody::StripeIdExchange(nv::decode(input)?),
            GroupMessageType::Application => GroupBody::Application(input.read_byte_array()?),
            GroupMessageType::Ack => GroupBody::Ack,
        };
        Ok(body)
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One message exchanged between group members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    id: MessageId,
    in_response_to: MessageId,
    sender: Option<NodeId>,
    body: GroupBody,
}

impl GroupMessage {
    pub fn new(ids: &MessageIdFactory, body: GroupBody) -> Self {
        Self {
            id: ids.next_id(),
            in_response_to: MessageId::NULL,
            sender: None,
            body,
        }
    }

    /// A reply to `request`. The receiver matches it to the waiting call.
    pub fn response_to(ids: &MessageIdFactory, request: &GroupMessage, body: GroupBody) -> Self {
        Self {
            in_response_to: request.id,
            ..Self::new(ids, body)
        }
    }

    pub fn zap_node_request(
        ids: &MessageIdFactory,
        zap_type: i32,
        reason: impl Into<String>,
        weights: Vec<i64>,
    ) -> Self {
        Self::new(
            ids,
            GroupBody::ZapNodeRequest(ZapNodeRequest {
                zap_type,
                reason: reason.into(),
                weights,
            }),
        )
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn in_response_to(&self) -> MessageId {
        self.in_response_to
    }

    pub fn message_type(&self) -> GroupMessageType {
        self.body.message_type()
    }

    pub fn body(&self) -> &GroupBody {
        &self.body
    }

    pub fn into_body(self) -> GroupBody {
        self.body
    }

    /// Who sent this message. Set on receipt, never on the wire.
    pub fn sender(&self) -> Option<&NodeId> {
        self.sender.as_ref()
    }

    pub(crate) fn set_sender(&mut self, node: NodeId) {
        self.sender = Some(node);
    }

    pub fn encode(&self, out: &mut ByteBufferOutput) -> Result<(), StreamError> {
        out.write_i32(self.message_type() as i32);
        out.write_i64(self.id.0);
        out.write_i64(self.in_response_to.0);
        self.body.encode(out)
    }

    pub fn decode(input: &mut ByteBufferInput) -> Result<Self, ProtocolError> {
        let ty = GroupMessageType::try_from(input.read_i32()?)?;
        let id = MessageId(input.read_i64()?);
        let in_response_to = MessageId(input.read_i64()?);
        let body = GroupBody::decode(ty, input)?;
        Ok(Self {
            id,
            in_response_to,
            sender: None,
            body,
        })
    }

    /// Wrap in an unsealed wire message. Handshakes travel as their own
    /// wire type, everything else inside the group wrapper.
    pub fn to_wire(&self, pool: &ChunkPool) -> Result<WireMessage, StreamError> {
        let mut out = ByteBufferOutput::new(pool);
        self.encode(&mut out)?;
        let wire_type = match self.body {
            GroupBody::Handshake(_) => MessageType::GroupHandshake,
            _ => MessageType::GroupWrapper,
        };
        Ok(WireMessage::from_output(wire_type, out))
    }

    /// Decode the payload of a received wire message.
    pub fn from_wire(message: &WireMessage) -> Result<Self, GroupError> {
        match message.message_type()? {
            MessageType::GroupHandshake | MessageType::GroupWrapper => {}
            other => {
                return Err(ProtocolError::UnknownMessageType(u16::from(other) as i32).into());
            }
        }
        let mut input = message.payload_input()?;
        Ok(Self::decode(&mut input)?)
    }
}

impl fmt::Display for GroupMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.message_type(), self.id)?;
        if !self.in_response_to.is_null() {
            write!(f, " in response to {}", self.in_response_to)?;
        }
        Ok(())
    }
}
