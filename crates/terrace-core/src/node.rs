//! Node identities.
//!
//! A server identity is a human-readable name plus opaque uid bytes.
//! Equality, hashing and ordering look at the uid only; two identities that
//! differ just by name are the same node.
//!
//! Wire form: `[tag:u8]{variant}` with tag 0 = NULL, 1 = server, 2 = group.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use rand::RngCore;

use crate::buffers::{ByteBufferInput, ByteBufferOutput, StreamError};
use crate::wire::ProtocolError;

const TAG_NULL: u8 = 0;
const TAG_SERVER: u8 = 1;
const TAG_GROUP: u8 = 2;

/// Length of generated uids and of instance uids.
pub const UID_LENGTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    /// Sentinel for "no node". Sorts before every real identity.
    Null,
    Server(ServerId),
    Group(GroupId),
}

impl NodeId {
    pub fn is_null(&self) -> bool {
        matches!(self, NodeId::Null)
    }

    pub fn encode(&self, out: &mut ByteBufferOutput) -> Result<(), StreamError> {
        match self {
            NodeId::Null => out.write_u8(TAG_NULL),
            NodeId::Server(id) => {
                out.write_u8(TAG_SERVER);
                out.write_string(Some(&id.name))?;
                out.write_byte_array(&id.uid)?;
                match &id.instance {
                    Some(instance) => {
                        out.write_bool(true);
                        out.write_bytes(instance);
                    }
                    None => out.write_bool(false),
                }
            }
            NodeId::Group(id) => {
                out.write_u8(TAG_GROUP);
                out.write_i32(id.0);
            }
        }
        Ok(())
    }

    pub fn decode(input: &mut ByteBufferInput) -> Result<Self, ProtocolError> {
        match input.read_u8()? {
            TAG_NULL => Ok(NodeId::Null),
            TAG_SERVER => {
                let name = input.read_string()?.unwrap_or_default();
                let uid = input.read_byte_array()?.to_vec();
                let instance = if input.read_bool()? {
                    let mut instance = [0u8; UID_LENGTH];
                    input.read_fully(&mut instance)?;
                    Some(instance)
                } else {
                    None
                };
                Ok(NodeId::Server(ServerId {
                    name,
                    uid,
                    instance,
                }))
            }
            TAG_GROUP => Ok(NodeId::Group(GroupId(input.read_i32()?))),
            tag => Err(ProtocolError::UnknownNodeIdTag(tag)),
        }
    }
}

impl From<ServerId> for NodeId {
    fn from(id: ServerId) -> Self {
        NodeId::Server(id)
    }
}

impl From<GroupId> for NodeId {
    fn from(id: GroupId) -> Self {
        NodeId::Group(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Null => f.write_str("NULL"),
            NodeId::Server(id) => id.fmt(f),
            NodeId::Group(id) => id.fmt(f),
        }
    }
}

// ── Server identity ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerId {
    name: String,
    uid: Vec<u8>,
    instance: Option<[u8; UID_LENGTH]>,
}

impl ServerId {
    pub fn new(name: impl Into<String>, uid: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
            instance: None,
        }
    }

    /// Fresh identity with a random uid.
    pub fn generate(name: impl Into<String>) -> Self {
        let mut uid = [0u8; UID_LENGTH];
        rand::thread_rng().fill_bytes(&mut uid);
        Self::new(name, uid.to_vec())
    }

    /// Tag this identity with the uid of one process incarnation.
    pub fn with_instance(mut self, instance: [u8; UID_LENGTH]) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    pub fn instance(&self) -> Option<&[u8; UID_LENGTH]> {
        self.instance.as_ref()
    }
}

impl PartialEq for ServerId {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for ServerId {}

impl Hash for ServerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl PartialOrd for ServerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.uid.cmp(&other.uid)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, hex::encode(&self.uid))
    }
}

// ── Group identity ────────────────────────────────────────────────────────────

/// A group of servers, identified by number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub i32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Group-{}", self.0)
    }
}
