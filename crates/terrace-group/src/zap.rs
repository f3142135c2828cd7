//! Zap-node fencing: deciding whether to send a zap request and what to do
//! when one arrives.

use terrace_core::node::NodeId;

use crate::GroupError;

/// Well-known zap reasons.
pub mod zap_type {
    pub const COMMUNICATION_ERROR: i32 = 0x01;
    pub const PROGRAM_ERROR: i32 = 0x02;
    pub const NODE_JOINED_WITH_DIRTY_DB: i32 = 0x03;
    pub const COMMUNICATION_TO_ACTIVE_ERROR: i32 = 0x04;
    pub const SPLIT_BRAIN: i32 = 0xff;
}

/// Local policy for zap requests.
pub trait ZapNodeRequestProcessor: Send + Sync {
    /// Consulted before a request to `node` is sent.
    fn accept_outgoing_zap_node_request(&self, node: &NodeId, zap_type: i32, reason: &str) -> bool;

    /// A request arrived from `from`. An error here is fatal to the local
    /// node's group membership.
    fn incoming_zap_node_request(
        &self,
        from: &NodeId,
        zap_type: i32,
        reason: &str,
        weights: &[i64],
    ) -> Result<(), GroupError>;

    /// Weights attached to outgoing requests.
    fn current_node_weights(&self) -> Vec<i64>;
}

/// For topologies without real fencing: sends are allowed, an incoming
/// request is fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultZapNodeRequestProcessor;

impl ZapNodeRequestProcessor for DefaultZapNodeRequestProcessor {
    fn accept_outgoing_zap_node_request(&self, _node: &NodeId, _zap_type: i32, _reason: &str) -> bool {
        true
    }

    fn incoming_zap_node_request(
        &self,
        from: &NodeId,
        zap_type: i32,
        reason: &str,
        _weights: &[i64],
    ) -> Result<(), GroupError> {
        tracing::error!(%from, zap_type, reason, "zap request received without a fencing policy");
        Err(GroupError::ZapUnsupported {
            from: from.clone(),
            reason: reason.to_string(),
        })
    }

    fn current_node_weights(&self) -> Vec<i64> {
        Vec::new()
    }
}

type WeightSource = Box<dyn Fn() -> Vec<i64> + Send + Sync>;
type RestartHook = Box<dyn Fn(&NodeId, i32, &str) + Send + Sync>;

/// Yields to a requester whose weights are strictly heavier, compared
/// element by element. Yielding means running the restart hook.
pub struct WeightedZapNodeRequestProcessor {
    weights: WeightSource,
    restart: RestartHook,
}

impl WeightedZapNodeRequestProcessor {
    pub fn new(
        weights: impl Fn() -> Vec<i64> + Send + Sync + 'static,
        restart: impl Fn(&NodeId, i32, &str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            weights: Box::new(weights),
            restart: Box::new(restart),
        }
    }
}

impl ZapNodeRequestProcessor for WeightedZapNodeRequestProcessor {
    fn accept_outgoing_zap_node_request(&self, node: &NodeId, zap_type: i32, reason: &str) -> bool {
        tracing::debug!(%node, zap_type, reason, "sending zap request");
        true
    }

    fn incoming_zap_node_request(
        &self,
        from: &NodeId,
        zap_type: i32,
        reason: &str,
        weights: &[i64],
    ) -> Result<(), GroupError> {
        let ours = (self.weights)();
        if weights > ours.as_slice() {
            tracing::warn!(%from, zap_type, reason, ?weights, ?ours, "yielding to heavier node");
            (self.restart)(from, zap_type, reason);
        } else {
            tracing::warn!(%from, zap_type, reason, ?weights, ?ours, "ignoring zap request from lighter node");
        }
        Ok(())
    }

    fn current_node_weights(&self) -> Vec<i64> {
        (self.weights)()
    }
}

impl std::fmt::Debug for WeightedZapNodeRequestProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedZapNodeRequestProcessor")
            .field("weights", &(self.weights)())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use terrace_core::node::ServerId;

    fn peer() -> NodeId {
        ServerId::new("peer", vec![9; 16]).into()
    }

    #[test]
    fn default_processor_treats_incoming_as_fatal() {
        let p = DefaultZapNodeRequestProcessor;
        assert!(p.accept_outgoing_zap_node_request(&peer(), zap_type::SPLIT_BRAIN, "x"));
        assert!(matches!(
            p.incoming_zap_node_request(&peer(), zap_type::SPLIT_BRAIN, "x", &[1]),
            Err(GroupError::ZapUnsupported { .. })
        ));
        assert!(p.current_node_weights().is_empty());
    }

    #[test]
    fn weighted_processor_yields_only_to_heavier() {
        let restarts = Arc::new(AtomicUsize::new(0));
        let counter = restarts.clone();
        let p = WeightedZapNodeRequestProcessor::new(
            || vec![10, 20],
            move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        p.incoming_zap_node_request(&peer(), zap_type::SPLIT_BRAIN, "lighter", &[10, 19])
            .unwrap();
        p.incoming_zap_node_request(&peer(), zap_type::SPLIT_BRAIN, "equal", &[10, 20])
            .unwrap();
        assert_eq!(restarts.load(Ordering::SeqCst), 0);

        p.incoming_zap_node_request(&peer(), zap_type::SPLIT_BRAIN, "heavier", &[11])
            .unwrap();
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(p.current_node_weights(), vec![10, 20]);
    }
}
