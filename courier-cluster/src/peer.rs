//! Remote replica abstraction.
//!
//! Fanout, catch-up and leader probing go through [`ReplicaPeer`] so that
//! tests can substitute in-process peers for TCP ones.

use async_trait::async_trait;
use courier_core::{Message, NodeId, Offset, PartitionId};

use crate::codec::{ReplicateAck, Request, Response};
use crate::config::ClusterTiming;
use crate::transport::{PeerClient, TransportError, TransportResult};

/// Operations a node performs against one peer.
#[async_trait]
pub trait ReplicaPeer: Send + Sync + 'static {
    /// Returns the peer's node ID.
    fn node_id(&self) -> &NodeId;

    /// Applies `batch` on the peer at the messages' own offsets.
    async fn replicate(&self, batch: Vec<Message>) -> TransportResult<ReplicateAck>;

    /// Fetches the peer's messages with `from <= offset < to`.
    async fn get_range(
        &self,
        topic: &str,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
    ) -> TransportResult<Vec<Message>>;

    /// Checks that the peer answers.
    async fn ping(&self) -> TransportResult<()>;
}

/// A peer reached over the TCP peer protocol.
#[derive(Debug)]
pub struct TcpPeer {
    client: PeerClient,
    timing: ClusterTiming,
}

impl TcpPeer {
    /// Creates a peer for `addr`.
    #[must_use]
    pub fn new(node_id: NodeId, addr: impl Into<String>, timing: ClusterTiming) -> Self {
        Self {
            client: PeerClient::new(node_id, addr, timing),
            timing,
        }
    }

    /// Returns the peer's address.
    #[must_use]
    pub fn addr(&self) -> &str {
        self.client.addr()
    }

    fn unexpected(&self) -> TransportError {
        TransportError::UnexpectedResponse {
            peer: self.client.peer_id().clone(),
        }
    }
}

#[async_trait]
impl ReplicaPeer for TcpPeer {
    fn node_id(&self) -> &NodeId {
        self.client.peer_id()
    }

    async fn replicate(&self, batch: Vec<Message>) -> TransportResult<ReplicateAck> {
        match self.client.call(&Request::Replicate(batch)).await? {
            Response::Ack(ack) => Ok(ack),
            _ => Err(self.unexpected()),
        }
    }

    async fn get_range(
        &self,
        topic: &str,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
    ) -> TransportResult<Vec<Message>> {
        let request = Request::GetRange {
            topic: topic.to_string(),
            partition,
            from,
            to,
        };
        match self.client.call(&request).await? {
            Response::Batch(messages) => Ok(messages),
            _ => Err(self.unexpected()),
        }
    }

    async fn ping(&self) -> TransportResult<()> {
        match self
            .client
            .call_with_timeout(&Request::Ping, self.timing.probe_timeout)
            .await?
        {
            Response::Pong => Ok(()),
            _ => Err(self.unexpected()),
        }
    }
}
