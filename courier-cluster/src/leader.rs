//! Peer selection for reconciliation and diagnostics.
//!
//! There is no election. [`FirstReachable`] walks the configured node order
//! and picks the first node that is this node or answers a ping.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::NodeId;
use tracing::debug;

use crate::config::Membership;
use crate::fanout::Fanout;

/// Chooses which node leads and which peer to pull from.
#[async_trait]
pub trait PeerSelector: Send + Sync + 'static {
    /// Returns the current leader.
    async fn leader(&self) -> NodeId;

    /// Returns the peer to reconcile against, or `None` if no peer is
    /// reachable.
    async fn source_peer(&self) -> Option<NodeId>;
}

/// First node in configured order that is self or reachable.
#[derive(Debug)]
pub struct FirstReachable {
    self_id: NodeId,
    order: Vec<NodeId>,
    fanout: Arc<Fanout>,
}

impl FirstReachable {
    /// Creates a selector over the membership's node order.
    #[must_use]
    pub fn new(membership: &Membership, fanout: Arc<Fanout>) -> Self {
        Self {
            self_id: membership.self_id().clone(),
            order: membership.order(),
            fanout,
        }
    }

    async fn reachable(&self, id: &NodeId) -> bool {
        let Some(peer) = self.fanout.peer(id) else {
            return false;
        };
        match peer.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %id, error = %e, "Peer unreachable");
                false
            }
        }
    }
}

#[async_trait]
impl PeerSelector for FirstReachable {
    async fn leader(&self) -> NodeId {
        for id in &self.order {
            if *id == self.self_id || self.reachable(id).await {
                return id.clone();
            }
        }
        self.self_id.clone()
    }

    async fn source_peer(&self) -> Option<NodeId> {
        for id in &self.order {
            if *id != self.self_id && self.reachable(id).await {
                return Some(id.clone());
            }
        }
        None
    }
}
