//! terrace-group: group membership and messaging between servers. Holds the
//! group message envelope, the `GroupManager` contract, a single-node
//! implementation, an in-process transport and zap-node fencing.

mod error;
pub mod local;
pub mod manager;
pub mod message;
pub mod null;
pub mod zap;

pub use error::GroupError;
pub use local::{LocalGroupManager, LocalHub};
pub use manager::{GroupEventsListener, GroupManager, GroupMessageListener, GroupResponse, MessageSink};
pub use message::{GroupBody, GroupMessage, GroupMessageType, MessageId, MessageIdFactory};
pub use null::NullGroupManager;
pub use zap::{DefaultZapNodeRequestProcessor, WeightedZapNodeRequestProcessor, ZapNodeRequestProcessor};
