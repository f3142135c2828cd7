//! Single-node mode: a group with nobody else in it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use terrace_core::node::{NodeId, ServerId};

use crate::manager::{
    GroupEventsListener, GroupManager, GroupMessageListener, GroupResponse, MessageSink, Route, Routes,
};
use crate::message::{GroupMessage, GroupMessageType, MessageIdFactory};
use crate::zap::ZapNodeRequestProcessor;
use crate::GroupError;

/// Satisfies [`GroupManager`] without a transport. Broadcasts reach no one
/// and point-to-point sends fail, since no other node ever exists.
pub struct NullGroupManager {
    node: ServerId,
    ids: MessageIdFactory,
    joined: AtomicBool,
    routes: Routes,
}

impl NullGroupManager {
    pub fn new(node: ServerId) -> Self {
        Self {
            node,
            ids: MessageIdFactory::new(),
            joined: AtomicBool::new(false),
            routes: Routes::default(),
        }
    }

    fn check_joined(&self) -> Result<(), GroupError> {
        if !self.joined.load(Ordering::Acquire) {
            return Err(GroupError::NotJoined);
        }
        Ok(())
    }
}

impl GroupManager for NullGroupManager {
    fn join(&self, _all_peers: &[ServerId]) -> Result<NodeId, GroupError> {
        if self.joined.swap(true, Ordering::AcqRel) {
            return Err(GroupError::AlreadyJoined);
        }
        Ok(self.node.clone().into())
    }

    fn local_node_id(&self) -> Result<NodeId, GroupError> {
        self.check_joined()?;
        Ok(self.node.clone().into())
    }

    fn message_ids(&self) -> &MessageIdFactory {
        &self.ids
    }

    fn send_all(&self, _message: GroupMessage) -> Result<(), GroupError> {
        self.check_joined()
    }

    fn send_all_to(&self, _message: GroupMessage, _nodes: &[NodeId]) -> Result<(), GroupError> {
        self.check_joined()
    }

    fn send_all_and_wait_for_response(&self, _message: GroupMessage) -> Result<GroupResponse, GroupError> {
        self.check_joined()?;
        Ok(GroupResponse::default())
    }

    fn send_all_to_and_wait_for_response(
        &self,
        _message: GroupMessage,
        _nodes: &[NodeId],
    ) -> Result<GroupResponse, GroupError> {
        self.check_joined()?;
        Ok(GroupResponse::default())
    }

    fn send_to(&self, node: &NodeId, _message: GroupMessage) -> Result<(), GroupError> {
        self.check_joined()?;
        Err(GroupError::UnknownNode(node.clone()))
    }

    fn send_to_and_wait_for_response(
        &self,
        node: &NodeId,
        _message: GroupMessage,
    ) -> Result<GroupMessage, GroupError> {
        self.check_joined()?;
        Err(GroupError::UnknownNode(node.clone()))
    }

    fn register_for_messages(
        &self,
        message_type: GroupMessageType,
        listener: Arc<dyn GroupMessageListener>,
    ) -> Result<(), GroupError> {
        self.routes.register(message_type, Route::Listener(listener))
    }

    fn route_messages(&self, message_type: GroupMessageType, sink: MessageSink) -> Result<(), GroupError> {
        self.routes.register(message_type, Route::Sink(sink))
    }

    fn register_for_group_events(&self, _listener: Arc<dyn GroupEventsListener>) {}

    fn zap_node(&self, node: &NodeId, zap_type: i32, reason: &str) -> Result<(), GroupError> {
        self.check_joined()?;
        tracing::warn!(%node, zap_type, reason, "ignoring zap request in single-node mode");
        Ok(())
    }

    fn set_zap_node_request_processor(&self, _processor: Arc<dyn ZapNodeRequestProcessor>) {}

    fn is_node_connected(&self, _node: &NodeId) -> bool {
        false
    }

    fn state_map(&self) -> serde_json::Value {
        serde_json::json!({
            "className": "NullGroupManager",
            "node": self.node.to_string(),
            "joined": self.joined.load(Ordering::Acquire),
        })
    }

    fn disconnect(&self) {
        self.routes.clear();
    }
}
