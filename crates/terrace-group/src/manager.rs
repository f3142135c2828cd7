//! The group manager contract and the message routing shared by its
//! implementations.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use terrace_core::node::{NodeId, ServerId};

use crate::message::{GroupMessage, GroupMessageType, MessageIdFactory};
use crate::zap::ZapNodeRequestProcessor;
use crate::GroupError;

/// Direct callback for low-volume control messages. Runs on the receive
/// thread, so it must not block on group calls.
pub trait GroupMessageListener: Send + Sync {
    fn message_received(&self, from: &NodeId, message: GroupMessage);
}

impl<F> GroupMessageListener for F
where
    F: Fn(&NodeId, GroupMessage) + Send + Sync,
{
    fn message_received(&self, from: &NodeId, message: GroupMessage) {
        self(from, message)
    }
}

/// Queue for high-volume message types, drained off the receive thread.
pub type MessageSink = mpsc::UnboundedSender<GroupMessage>;

pub trait GroupEventsListener: Send + Sync {
    fn node_joined(&self, node: &NodeId);
    fn node_left(&self, node: &NodeId);
}

/// Replies collected by a blocking broadcast.
#[derive(Debug, Clone, Default)]
pub struct GroupResponse {
    responses: Vec<GroupMessage>,
}

impl GroupResponse {
    pub(crate) fn new(responses: Vec<GroupMessage>) -> Self {
        Self { responses }
    }

    pub fn responses(&self) -> &[GroupMessage] {
        &self.responses
    }

    pub fn response_from(&self, node: &NodeId) -> Option<&GroupMessage> {
        let found = self.responses.iter().find(|m| m.sender() == Some(node));
        if found.is_none() {
            tracing::warn!(%node, "missing response");
        }
        found
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn into_responses(self) -> Vec<GroupMessage> {
        self.responses
    }
}

/// Membership and messaging for a group of servers.
///
/// Every operation except `join` fails with [`GroupError::NotJoined`] until
/// `join` succeeds. The `*_and_wait_*` calls block the calling thread and
/// must not be made from a receive thread or an async context.
pub trait GroupManager: Send + Sync {
    /// Join the group formed with `all_peers`. Peers not yet present are
    /// ignored. Joining twice fails.
    fn join(&self, all_peers: &[ServerId]) -> Result<NodeId, GroupError>;

    fn local_node_id(&self) -> Result<NodeId, GroupError>;

    /// Id source for messages sent through this manager.
    fn message_ids(&self) -> &MessageIdFactory;

    /// Fire-and-forget to every connected member.
    fn send_all(&self, message: GroupMessage) -> Result<(), GroupError>;

    /// Fire-and-forget to the connected members among `nodes`.
    fn send_all_to(&self, message: GroupMessage, nodes: &[NodeId]) -> Result<(), GroupError>;

    /// Send to every connected member and wait until each has replied or
    /// left.
    fn send_all_and_wait_for_response(&self, message: GroupMessage) -> Result<GroupResponse, GroupError>;

    fn send_all_to_and_wait_for_response(
        &self,
        message: GroupMessage,
        nodes: &[NodeId],
    ) -> Result<GroupResponse, GroupError>;

    fn send_to(&self, node: &NodeId, message: GroupMessage) -> Result<(), GroupError>;

    /// Send to one member and wait for its reply. Fails if it leaves first.
    fn send_to_and_wait_for_response(
        &self,
        node: &NodeId,
        message: GroupMessage,
    ) -> Result<GroupMessage, GroupError>;

    /// Deliver messages of `message_type` to `listener`. One registration
    /// per type, shared with [`route_messages`](Self::route_messages).
    fn register_for_messages(
        &self,
        message_type: GroupMessageType,
        listener: Arc<dyn GroupMessageListener>,
    ) -> Result<(), GroupError>;

    /// Queue messages of `message_type` on `sink`.
    fn route_messages(&self, message_type: GroupMessageType, sink: MessageSink) -> Result<(), GroupError>;

    fn register_for_group_events(&self, listener: Arc<dyn GroupEventsListener>);

    /// Ask `node` to leave. The processor may veto the request; a vetoed or
    /// unroutable request is logged and dropped.
    fn zap_node(&self, node: &NodeId, zap_type: i32, reason: &str) -> Result<(), GroupError>;

    fn set_zap_node_request_processor(&self, processor: Arc<dyn ZapNodeRequestProcessor>);

    fn is_node_connected(&self, node: &NodeId) -> bool;

    /// Diagnostic snapshot.
    fn state_map(&self) -> serde_json::Value;

    /// Leave the group. Members waiting on this node see it leave.
    fn disconnect(&self);
}

// ── Routing ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) enum Route {
    Listener(Arc<dyn GroupMessageListener>),
    Sink(MessageSink),
}

/// Per-type registrations. A type has at most one route.
#[derive(Default)]
pub(crate) struct Routes {
    routes: DashMap<GroupMessageType, Route>,
}

impl Routes {
    pub(crate) fn register(&self, message_type: GroupMessageType, route: Route) -> Result<(), GroupError> {
        match self.routes.entry(message_type) {
            Entry::Occupied(_) => Err(GroupError::ListenerRegistered(message_type)),
            Entry::Vacant(v) => {
                v.insert(route);
                Ok(())
            }
        }
    }

    /// Hand `message` to its route. Returns false when nothing is
    /// registered for its type.
    pub(crate) fn dispatch(&self, from: &NodeId, message: GroupMessage) -> bool {
        let message_type = message.message_type();
        // clone out so a listener can register routes without deadlocking
        let Some(route) = self.routes.get(&message_type).map(|r| r.value().clone()) else {
            tracing::warn!(%from, ?message_type, "no route for group message, dropping");
            return false;
        };
        match route {
            Route::Listener(listener) => listener.message_received(from, message),
            Route::Sink(sink) => {
                if sink.send(message).is_err() {
                    tracing::warn!(%from, ?message_type, "message sink closed, dropping");
                }
            }
        }
        true
    }

    pub(crate) fn clear(&self) {
        self.routes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::GroupBody;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer() -> NodeId {
        ServerId::new("peer", vec![3; 16]).into()
    }

    #[test]
    fn one_route_per_type() {
        let routes = Routes::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        routes
            .register(GroupMessageType::Application, Route::Sink(tx))
            .unwrap();
        let listener: Arc<dyn GroupMessageListener> = Arc::new(|_: &NodeId, _: GroupMessage| {});
        assert!(matches!(
            routes.register(GroupMessageType::Application, Route::Listener(listener.clone())),
            Err(GroupError::ListenerRegistered(GroupMessageType::Application))
        ));
        routes
            .register(GroupMessageType::Ack, Route::Listener(listener))
            .unwrap();
    }

    #[test]
    fn dispatch_reaches_listener_and_sink() {
        let ids = MessageIdFactory::new();
        let routes = Routes::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let listener: Arc<dyn GroupMessageListener> = Arc::new(move |_: &NodeId, _: GroupMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        routes
            .register(GroupMessageType::Ack, Route::Listener(listener))
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        routes
            .register(GroupMessageType::Application, Route::Sink(tx))
            .unwrap();

        assert!(routes.dispatch(&peer(), GroupMessage::new(&ids, GroupBody::Ack)));
        assert!(routes.dispatch(
            &peer(),
            GroupMessage::new(&ids, GroupBody::Application(bytes::Bytes::from_static(b"a")))
        ));
        assert!(!routes.dispatch(
            &peer(),
            GroupMessage::zap_node_request(&ids, 1, "x", Vec::new())
        ));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_recv().unwrap().message_type(), GroupMessageType::Application);
    }

    #[test]
    fn response_lookup_by_sender() {
        let ids = MessageIdFactory::new();
        let mut reply = GroupMessage::new(&ids, GroupBody::Ack);
        reply.set_sender(peer());
        let response = GroupResponse::new(vec![reply]);
        assert_eq!(response.len(), 1);
        assert!(response.response_from(&peer()).is_some());
        assert!(response
            .response_from(&ServerId::new("other", vec![4; 16]).into())
            .is_none());
    }
}
