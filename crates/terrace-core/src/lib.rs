//! terrace-core: buffer streams, the framed wire protocol, DNA records and
//! node identity. The group crate builds on this one.

pub mod buffers;
pub mod config;
pub mod dna;
pub mod node;
pub mod wire;

pub use buffers::{ByteBufferInput, ByteBufferOutput, ChunkPool, StreamError};
pub use config::TerraceConfig;
pub use node::{GroupId, NodeId, ServerId};
pub use wire::{MessageType, ProtocolAdaptor, ProtocolError, WireHeader, WireMessage};
