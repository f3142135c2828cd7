//! In-process group transport.
//!
//! Every member owns a receive thread fed by a [`LocalHub`]. Each hop goes
//! through the real path: group message → sealed [`WireMessage`] → chunks
//! → per-connection [`ProtocolAdaptor`] → group message. Departures travel
//! on the same queue as data, so a member sees them in order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::multiple::RefMutMulti;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot};

use terrace_core::buffers::ChunkPool;
use terrace_core::config::{GroupConfig, ProtocolConfig, TerraceConfig};
use terrace_core::node::{NodeId, ServerId};
use terrace_core::wire::ProtocolAdaptor;

use crate::manager::{
    GroupEventsListener, GroupManager, GroupMessageListener, GroupResponse, MessageSink, Route, Routes,
};
use crate::message::{GroupBody, GroupMessage, GroupMessageType, Handshake, MessageId, MessageIdFactory};
use crate::zap::{DefaultZapNodeRequestProcessor, ZapNodeRequestProcessor};
use crate::GroupError;

enum Frame {
    /// One sealed wire message.
    Data { from: NodeId, chunks: Vec<Bytes> },
    Departed(NodeId),
}

// ── Hub ───────────────────────────────────────────────────────────────────────

/// Connects the members of one in-process group.
pub struct LocalHub {
    members: DashMap<NodeId, mpsc::UnboundedSender<Frame>>,
    pool: ChunkPool,
    protocol: ProtocolConfig,
    /// Drives response timeouts for every member. Built on first use.
    timer: OnceLock<tokio::runtime::Runtime>,
}

impl LocalHub {
    pub fn new(pool: ChunkPool, protocol: ProtocolConfig) -> Arc<Self> {
        Arc::new(Self {
            members: DashMap::new(),
            pool,
            protocol,
            timer: OnceLock::new(),
        })
    }

    pub fn from_config(config: &TerraceConfig) -> Arc<Self> {
        Self::new(ChunkPool::from_config(&config.buffers), config.protocol.clone())
    }

    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    /// Members currently attached.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn timer(&self) -> Result<&tokio::runtime::Runtime, GroupError> {
        if let Some(runtime) = self.timer.get() {
            return Ok(runtime);
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("group-timer")
            .enable_time()
            .build()?;
        // a racing builder loses and its runtime is dropped here
        Ok(self.timer.get_or_init(|| runtime))
    }

    fn deliver(&self, to: &NodeId, frame: Frame) -> Result<(), GroupError> {
        let tx = self
            .members
            .get(to)
            .map(|m| m.value().clone())
            .ok_or_else(|| GroupError::UnknownNode(to.clone()))?;
        tx.send(frame).map_err(|_| GroupError::Closed)
    }
}

impl std::fmt::Debug for LocalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHub")
            .field("members", &self.members.len())
            .field("pool", &self.pool)
            .finish()
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// A [`GroupManager`] whose peers live in the same process. Cheap to clone;
/// clones share one membership.
#[derive(Clone)]
pub struct LocalGroupManager {
    inner: Arc<Inner>,
}

struct Pending {
    waiting: HashSet<NodeId>,
    responses: Vec<GroupMessage>,
    /// Point-to-point waits fail when the peer leaves; broadcasts just
    /// stop waiting for it.
    fail_on_departure: bool,
    done: Option<oneshot::Sender<Result<Vec<GroupMessage>, GroupError>>>,
}

struct Inner {
    hub: Arc<LocalHub>,
    node: NodeId,
    ids: MessageIdFactory,
    joined: AtomicBool,
    peers: DashSet<NodeId>,
    routes: Routes,
    pending: DashMap<MessageId, Pending>,
    zapped: DashSet<NodeId>,
    zap_processor: RwLock<Arc<dyn ZapNodeRequestProcessor>>,
    listeners: RwLock<Vec<Arc<dyn GroupEventsListener>>>,
    wait_for_response: Duration,
}

impl LocalGroupManager {
    pub fn new(hub: &Arc<LocalHub>, node: ServerId, config: &GroupConfig) -> Self {
        Self::with_message_ids(hub, node, config, MessageIdFactory::new())
    }

    pub fn with_message_ids(
        hub: &Arc<LocalHub>,
        node: ServerId,
        config: &GroupConfig,
        ids: MessageIdFactory,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hub: hub.clone(),
                node: node.into(),
                ids,
                joined: AtomicBool::new(false),
                peers: DashSet::new(),
                routes: Routes::default(),
                pending: DashMap::new(),
                zapped: DashSet::new(),
                zap_processor: RwLock::new(Arc::new(DefaultZapNodeRequestProcessor)),
                listeners: RwLock::new(Vec::new()),
                wait_for_response: Duration::from_millis(config.wait_for_response_ms),
            }),
        }
    }

    fn check_joined(&self) -> Result<(), GroupError> {
        if !self.inner.joined.load(Ordering::Acquire) {
            return Err(GroupError::NotJoined);
        }
        Ok(())
    }

    fn check_member(&self, node: &NodeId) -> Result<(), GroupError> {
        self.check_joined()?;
        if !self.inner.peers.contains(node) {
            return Err(GroupError::UnknownNode(node.clone()));
        }
        Ok(())
    }

    /// Connected members among `nodes`.
    fn members_among(&self, nodes: &[NodeId]) -> Vec<NodeId> {
        nodes
            .iter()
            .filter(|n| {
                let present = self.inner.peers.contains(*n);
                if !present {
                    tracing::debug!(node = %n, "not a member, skipping");
                }
                present
            })
            .cloned()
            .collect()
    }

    fn all_members(&self) -> Vec<NodeId> {
        self.inner.peers.iter().map(|p| p.key().clone()).collect()
    }
}

impl GroupManager for LocalGroupManager {
    fn join(&self, all_peers: &[ServerId]) -> Result<NodeId, GroupError> {
        let inner = &self.inner;
        if inner.joined.swap(true, Ordering::AcqRel) {
            return Err(GroupError::AlreadyJoined);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.hub.members.insert(inner.node.clone(), tx);
        let receiver = inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("group-recv-{}", inner.node))
            .spawn(move || receiver.receive_loop(rx));
        if let Err(e) = spawned {
            inner.hub.members.remove(&inner.node);
            inner.joined.store(false, Ordering::Release);
            return Err(e.into());
        }

        let present: Vec<NodeId> = all_peers
            .iter()
            .map(|p| NodeId::from(p.clone()))
            .filter(|p| *p != inner.node && inner.hub.members.contains_key(p))
            .collect();
        let handshake = GroupMessage::new(&inner.ids, inner.handshake());
        let answered = inner.request(present, handshake, false)?;
        tracing::info!(node = %inner.node, peers = answered.len(), "joined group");
        Ok(inner.node.clone())
    }

    fn local_node_id(&self) -> Result<NodeId, GroupError> {
        self.check_joined()?;
        Ok(self.inner.node.clone())
    }

    fn message_ids(&self) -> &MessageIdFactory {
        &self.inner.ids
    }

    fn send_all(&self, message: GroupMessage) -> Result<(), GroupError> {
        self.check_joined()?;
        for node in self.all_members() {
            self.inner.transmit_or_log(&node, &message);
        }
        Ok(())
    }

    fn send_all_to(&self, message: GroupMessage, nodes: &[NodeId]) -> Result<(), GroupError> {
        self.check_joined()?;
        for node in self.members_among(nodes) {
            self.inner.transmit_or_log(&node, &message);
        }
        Ok(())
    }

    fn send_all_and_wait_for_response(&self, message: GroupMessage) -> Result<GroupResponse, GroupError> {
        self.check_joined()?;
        let targets = self.all_members();
        Ok(GroupResponse::new(self.inner.request(targets, message, false)?))
    }

    fn send_all_to_and_wait_for_response(
        &self,
        message: GroupMessage,
        nodes: &[NodeId],
    ) -> Result<GroupResponse, GroupError> {
        self.check_joined()?;
        let targets = self.members_among(nodes);
        Ok(GroupResponse::new(self.inner.request(targets, message, false)?))
    }

    fn send_to(&self, node: &NodeId, message: GroupMessage) -> Result<(), GroupError> {
        self.check_member(node)?;
        self.inner.transmit(node, &message)
    }

    fn send_to_and_wait_for_response(
        &self,
        node: &NodeId,
        message: GroupMessage,
    ) -> Result<GroupMessage, GroupError> {
        self.check_member(node)?;
        self.inner
            .request(vec![node.clone()], message, true)?
            .into_iter()
            .next()
            .ok_or_else(|| GroupError::MemberLeft(node.clone()))
    }

    fn register_for_messages(
        &self,
        message_type: GroupMessageType,
        listener: Arc<dyn GroupMessageListener>,
    ) -> Result<(), GroupError> {
        if message_type == GroupMessageType::ZapNodeRequest {
            return Err(GroupError::ListenerRegistered(message_type));
        }
        self.inner.routes.register(message_type, Route::Listener(listener))
    }

    fn route_messages(&self, message_type: GroupMessageType, sink: MessageSink) -> Result<(), GroupError> {
        if message_type == GroupMessageType::ZapNodeRequest {
            return Err(GroupError::ListenerRegistered(message_type));
        }
        self.inner.routes.register(message_type, Route::Sink(sink))
    }

    fn register_for_group_events(&self, listener: Arc<dyn GroupEventsListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn zap_node(&self, node: &NodeId, zap_type: i32, reason: &str) -> Result<(), GroupError> {
        self.check_joined()?;
        let inner = &self.inner;
        if !inner.peers.contains(node) {
            tracing::warn!(%node, zap_type, reason, "ignoring zap request, node is not a member");
            return Ok(());
        }
        let processor = inner.zap_processor();
        if !processor.accept_outgoing_zap_node_request(node, zap_type, reason) {
            tracing::warn!(%node, zap_type, reason, "zap request vetoed by local policy");
            return Ok(());
        }
        inner.zapped.insert(node.clone());
        let weights = processor.current_node_weights();
        tracing::warn!(%node, zap_type, reason, ?weights, "zapping node");
        let message = GroupMessage::zap_node_request(&inner.ids, zap_type, reason, weights);
        inner.transmit(node, &message)
    }

    fn set_zap_node_request_processor(&self, processor: Arc<dyn ZapNodeRequestProcessor>) {
        *self
            .inner
            .zap_processor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = processor;
    }

    fn is_node_connected(&self, node: &NodeId) -> bool {
        self.inner.peers.contains(node)
    }

    fn state_map(&self) -> serde_json::Value {
        let inner = &self.inner;
        let mut members: Vec<String> = inner.peers.iter().map(|p| p.key().to_string()).collect();
        members.sort();
        let mut zapped: Vec<String> = inner.zapped.iter().map(|p| p.key().to_string()).collect();
        zapped.sort();
        serde_json::json!({
            "className": "LocalGroupManager",
            "node": inner.node.to_string(),
            "joined": inner.joined.load(Ordering::Acquire),
            "members": members,
            "zapped": zapped,
            "pendingRequests": inner.pending.len(),
        })
    }

    fn disconnect(&self) {
        self.inner.leave();
    }
}

impl std::fmt::Debug for LocalGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroupManager")
            .field("node", &self.inner.node)
            .field("joined", &self.inner.joined.load(Ordering::Relaxed))
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

impl Inner {
    fn handshake(&self) -> GroupBody {
        GroupBody::Handshake(Handshake {
            node_id: self.node.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    fn zap_processor(&self) -> Arc<dyn ZapNodeRequestProcessor> {
        self.zap_processor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn event_listeners(&self) -> Vec<Arc<dyn GroupEventsListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transmit(&self, to: &NodeId, message: &GroupMessage) -> Result<(), GroupError> {
        let mut wire = message
            .to_wire(&self.hub.pool)?
            .with_checksum(self.hub.protocol.checksum);
        wire.seal()?;
        let chunks = wire.entire_message()?;
        tracing::trace!(to = %to, %message, bytes = wire.total_length()?, "sending");
        let delivered = self.hub.deliver(
            to,
            Frame::Data {
                from: self.node.clone(),
                chunks,
            },
        );
        wire.was_sent()?;
        delivered
    }

    fn transmit_or_log(&self, to: &NodeId, message: &GroupMessage) {
        if let Err(e) = self.transmit(to, message) {
            tracing::warn!(to = %to, %message, error = %e, "send failed");
        }
    }

    /// Send `message` to `targets` and block until each has replied, left,
    /// or the wait times out.
    fn request(
        &self,
        targets: Vec<NodeId>,
        message: GroupMessage,
        fail_on_departure: bool,
    ) -> Result<Vec<GroupMessage>, GroupError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let id = message.id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            Pending {
                waiting: targets.iter().cloned().collect(),
                responses: Vec::new(),
                fail_on_departure,
                done: Some(tx),
            },
        );
        for node in &targets {
            if let Err(e) = self.transmit(node, &message) {
                tracing::warn!(%node, %message, error = %e, "send failed, not waiting for it");
                self.stop_waiting(|p| p.key() == &id, node);
            }
        }
        self.wait(id, rx)
    }

    fn wait(
        &self,
        id: MessageId,
        rx: oneshot::Receiver<Result<Vec<GroupMessage>, GroupError>>,
    ) -> Result<Vec<GroupMessage>, GroupError> {
        let received = if self.wait_for_response.is_zero() {
            rx.blocking_recv()
        } else {
            match self.hub.timer()?.block_on(tokio::time::timeout(self.wait_for_response, rx)) {
                Ok(received) => received,
                Err(_) => {
                    self.pending.remove(&id);
                    let waited_ms = self.wait_for_response.as_millis() as u64;
                    tracing::warn!(node = %self.node, %id, waited_ms, "gave up waiting for responses");
                    return Err(GroupError::Timeout { waited_ms });
                }
            }
        };
        match received {
            Ok(result) => result,
            Err(_) => Err(GroupError::Closed),
        }
    }

    /// Record a reply. Hands the message back when no call is waiting on it.
    fn take_response(&self, from: &NodeId, message: GroupMessage) -> Option<GroupMessage> {
        let id = message.in_response_to();
        if id.is_null() {
            return Some(message);
        }
        let complete = match self.pending.get_mut(&id) {
            None => return Some(message),
            Some(mut pending) => {
                if !pending.waiting.remove(from) {
                    tracing::warn!(%from, %id, "response from a node not being waited on, dropping");
                    return None;
                }
                pending.responses.push(message);
                pending.waiting.is_empty()
            }
        };
        if complete {
            self.complete(id, None);
        }
        None
    }

    fn complete(&self, id: MessageId, failure: Option<GroupError>) {
        let Some((_, mut pending)) = self.pending.remove(&id) else {
            return;
        };
        if let Some(done) = pending.done.take() {
            let result = match failure {
                Some(e) => Err(e),
                None => Ok(pending.responses),
            };
            // the waiter may already have timed out
            let _ = done.send(result);
        }
    }

    /// Drop `node` from the pending requests selected by `which`.
    fn stop_waiting(&self, which: impl Fn(&RefMutMulti<'_, MessageId, Pending>) -> bool, node: &NodeId) {
        let mut finished = Vec::new();
        for mut entry in self.pending.iter_mut() {
            if !which(&entry) || !entry.waiting.remove(node) {
                continue;
            }
            if entry.fail_on_departure {
                finished.push((*entry.key(), Some(GroupError::MemberLeft(node.clone()))));
            } else if entry.waiting.is_empty() {
                finished.push((*entry.key(), None));
            }
        }
        for (id, failure) in finished {
            self.complete(id, failure);
        }
    }

    fn peer_joined(&self, node: &NodeId) {
        if !self.peers.insert(node.clone()) {
            return;
        }
        self.zapped.remove(node);
        tracing::debug!(local = %self.node, peer = %node, "member joined");
        for listener in self.event_listeners() {
            listener.node_joined(node);
        }
    }

    fn peer_left(&self, node: &NodeId) {
        let was_member = self.peers.remove(node).is_some();
        self.stop_waiting(|_| true, node);
        if was_member {
            tracing::debug!(local = %self.node, peer = %node, "member left");
            for listener in self.event_listeners() {
                listener.node_left(node);
            }
        }
    }

    fn leave(&self) {
        if !self.joined.swap(false, Ordering::AcqRel) {
            return;
        }
        self.hub.members.remove(&self.node);
        let peers: Vec<NodeId> = self.peers.iter().map(|p| p.key().clone()).collect();
        self.peers.clear();
        for peer in &peers {
            if let Err(e) = self.hub.deliver(peer, Frame::Departed(self.node.clone())) {
                tracing::debug!(%peer, error = %e, "peer already gone");
            }
        }
        let waiting: Vec<MessageId> = self.pending.iter().map(|e| *e.key()).collect();
        for id in waiting {
            self.complete(id, Some(GroupError::Closed));
        }
        self.routes.clear();
        tracing::info!(node = %self.node, "left group");
    }

    fn receive_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Frame>) {
        let mut connections: HashMap<NodeId, ProtocolAdaptor> = HashMap::new();
        while let Some(frame) = rx.blocking_recv() {
            let (from, chunks) = match frame {
                Frame::Departed(node) => {
                    connections.remove(&node);
                    self.peer_left(&node);
                    continue;
                }
                Frame::Data { from, chunks } => (from, chunks),
            };

            let adaptor = connections
                .entry(from.clone())
                .or_insert_with(|| ProtocolAdaptor::from_config(&self.hub.pool, &self.hub.protocol));
            let fed = chunks.iter().try_for_each(|chunk| adaptor.add_read_data(chunk));
            let messages = match fed {
                Ok(()) => adaptor.take_messages(),
                Err(e) => {
                    tracing::warn!(%from, error = %e, "protocol error, dropping connection");
                    connections.remove(&from);
                    self.peer_left(&from);
                    continue;
                }
            };

            for mut wire in messages {
                let decoded = GroupMessage::from_wire(&wire);
                wire.recycle();
                let mut message = match decoded {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(%from, error = %e, "undecodable group message, dropping");
                        continue;
                    }
                };
                message.set_sender(from.clone());
                if let Err(e) = self.message_received(&from, message) {
                    tracing::error!(node = %self.node, %from, error = %e, "fatal group error, leaving");
                    self.leave();
                    return;
                }
            }
        }
        tracing::debug!(node = %self.node, "receive loop finished");
    }

    fn message_received(&self, from: &NodeId, message: GroupMessage) -> Result<(), GroupError> {
        if let GroupBody::Handshake(handshake) = message.body() {
            if handshake.node_id != *from {
                tracing::warn!(%from, claimed = %handshake.node_id, "handshake identity mismatch");
            }
            self.peer_joined(from);
            if message.in_response_to().is_null() {
                let reply = GroupMessage::response_to(&self.ids, &message, self.handshake());
                self.transmit_or_log(from, &reply);
                return Ok(());
            }
        } else if !self.peers.contains(from) {
            tracing::warn!(%from, %message, "message from a node that is not a member, dropping");
            return Ok(());
        }

        let Some(message) = self.take_response(from, message) else {
            return Ok(());
        };
        if let GroupBody::ZapNodeRequest(zap) = message.body() {
            tracing::warn!(%from, zap_type = zap.zap_type, reason = %zap.reason, "zap request received");
            return self.zap_processor().incoming_zap_node_request(
                from,
                zap.zap_type,
                &zap.reason,
                &zap.weights,
            );
        }
        self.routes.dispatch(from, message);
        Ok(())
    }
}
