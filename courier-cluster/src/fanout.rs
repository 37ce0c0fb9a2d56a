//! Outbound replication: broadcast and catch-up.
//!
//! # Design
//!
//! - **Broadcast** spawns one task per peer. Each task sends the batch once
//!   and logs a failure; nothing is retried and the caller is never told.
//!   The returned [`Broadcast`] may be dropped or joined.
//! - **Catch-up** pulls a range from one named peer in windows of at most
//!   `catch_up_page` offsets and applies every message through the
//!   offset-preserving append. A peer may answer a window with fewer
//!   messages than it holds (its response frame is full); the next window
//!   starts right after the last offset received. An empty answer ends the
//!   pull.
//!
//! A fanout built from single-node membership has no peers: broadcast
//! spawns nothing and catch-up fails `NotFound` for any peer.

use std::sync::Arc;

use courier_core::{Error, Message, NodeId, Offset, PartitionId, Result};
use courier_store::{AppendOutcome, LogStore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::ReplicateAck;
use crate::config::{ClusterTiming, Membership};
use crate::peer::{ReplicaPeer, TcpPeer};

/// The outbound client set for every peer.
pub struct Fanout {
    self_id: NodeId,
    peers: Vec<Arc<dyn ReplicaPeer>>,
    page: u64,
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("self_id", &self.self_id)
            .field("peers", &self.peer_ids())
            .field("page", &self.page)
            .finish()
    }
}

impl Fanout {
    /// Creates a fanout over `peers`, which must exclude this node.
    #[must_use]
    pub fn new(self_id: NodeId, peers: Vec<Arc<dyn ReplicaPeer>>, timing: ClusterTiming) -> Self {
        Self {
            self_id,
            peers,
            page: timing.catch_up_page.max(1),
        }
    }

    /// Creates TCP peers for every other configured node, in configured
    /// order. Inert unless more than one node is configured.
    #[must_use]
    pub fn from_membership(membership: &Membership, timing: ClusterTiming) -> Self {
        let peers: Vec<Arc<dyn ReplicaPeer>> = if membership.is_clustered() {
            membership
                .peers()
                .map(|node| {
                    Arc::new(TcpPeer::new(
                        NodeId::new(node.id.clone()),
                        node.host.clone(),
                        timing,
                    )) as Arc<dyn ReplicaPeer>
                })
                .collect()
        } else {
            Vec::new()
        };
        Self::new(membership.self_id().clone(), peers, timing)
    }

    /// Returns this node's id.
    #[must_use]
    pub const fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Returns true if there are no peers.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.peers.is_empty()
    }

    /// Returns peer ids in configured order.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.node_id().clone()).collect()
    }

    /// Looks up a peer by id.
    #[must_use]
    pub fn peer(&self, id: &NodeId) -> Option<&Arc<dyn ReplicaPeer>> {
        self.peers.iter().find(|p| p.node_id() == id)
    }

    /// Sends `batch` to every peer concurrently. Must be called within a
    /// tokio runtime.
    pub fn broadcast(&self, batch: Vec<Message>) -> Broadcast {
        if batch.is_empty() || self.peers.is_empty() {
            return Broadcast {
                handles: Vec::new(),
            };
        }

        let batch = Arc::new(batch);
        let handles = self
            .peers
            .iter()
            .map(|peer| {
                let peer = Arc::clone(peer);
                let batch = Arc::clone(&batch);
                tokio::spawn(async move {
                    let count = batch.len();
                    match peer.replicate(batch.as_ref().clone()).await {
                        Ok(ack) => {
                            debug!(
                                peer = %peer.node_id(),
                                applied = ack.applied,
                                duplicates = ack.duplicates,
                                "Broadcast delivered"
                            );
                            Some(ack)
                        }
                        Err(e) => {
                            warn!(
                                peer = %peer.node_id(),
                                messages = count,
                                error = %e,
                                "Broadcast to peer failed"
                            );
                            None
                        }
                    }
                })
            })
            .collect();
        Broadcast { handles }
    }

    /// Pulls `[from, to)` from `peer_id` (to the peer's end when `to` is
    /// `None`) and applies it locally.
    ///
    /// Each window resumes after the last offset the peer returned, so a
    /// peer that answers with size-limited batches is still drained. Paging
    /// stops at the first empty window: a hole spanning a whole window in
    /// the peer's log ends the pull early, and the next call resumes from
    /// the local end.
    ///
    /// # Errors
    /// - `NotFound` if `peer_id` is not a peer.
    /// - `Replication` if the peer cannot be reached or answers with an error.
    /// - `Storage` if a local write fails. Messages applied before the failure
    ///   stay applied.
    pub async fn catch_up(
        &self,
        peer_id: &NodeId,
        topic: &str,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
        log: &LogStore,
    ) -> Result<CatchUpReport> {
        let peer = self.peer(peer_id).ok_or_else(|| Error::NotFound {
            resource: "peer",
            name: peer_id.to_string(),
        })?;

        let mut report = CatchUpReport::default();
        let mut cursor = from.get();
        loop {
            let window_end = match to {
                Some(to) if cursor >= to.get() => break,
                Some(to) => to.get().min(cursor.saturating_add(self.page)),
                None => cursor.saturating_add(self.page),
            };

            let batch = peer
                .get_range(
                    topic,
                    partition,
                    Offset::new(cursor),
                    Some(Offset::new(window_end)),
                )
                .await?;
            let Some(last) = batch.last().map(|m| m.offset) else {
                break;
            };

            for message in &batch {
                match log.append_at_offset(message)? {
                    AppendOutcome::Applied => report.applied += 1,
                    AppendOutcome::Duplicate => report.duplicates += 1,
                }
            }
            report.fetched += batch.len() as u64;

            // Never move backwards on a misbehaving peer.
            match last.checked_next() {
                Some(next) if next.get() > cursor => cursor = next.get(),
                _ => break,
            }
        }

        if report.fetched > 0 {
            debug!(
                peer = %peer_id,
                topic = %topic,
                partition = partition.get(),
                from = from.get(),
                fetched = report.fetched,
                applied = report.applied,
                "Catch-up complete"
            );
        }
        Ok(report)
    }
}

/// Result of one catch-up pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    /// Messages received from the peer.
    pub fetched: u64,
    /// Messages written locally.
    pub applied: u64,
    /// Messages already present locally.
    pub duplicates: u64,
}

/// In-progress broadcast: one task per peer.
#[derive(Debug)]
pub struct Broadcast {
    handles: Vec<JoinHandle<Option<ReplicateAck>>>,
}

impl Broadcast {
    /// Returns the number of peers the batch was sent to.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if the batch was sent to no one.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every send to finish. Returns the acks of the peers that
    /// succeeded.
    pub async fn join(self) -> Vec<ReplicateAck> {
        let mut acks = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            if let Ok(Some(ack)) = handle.await {
                acks.push(ack);
            }
        }
        acks
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use courier_core::MessageId;
    use courier_store::{HwmIndex, Store};

    use super::*;
    use crate::replica::ReplicaService;
    use crate::transport::{TransportError, TransportResult};

    /// In-process peer over its own store.
    struct MemoryPeer {
        id: NodeId,
        service: ReplicaService,
        log: LogStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl ReplicaPeer for MemoryPeer {
        fn node_id(&self) -> &NodeId {
            &self.id
        }

        async fn replicate(&self, batch: Vec<Message>) -> TransportResult<ReplicateAck> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TransportError::Closed {
                    peer: self.id.clone(),
                });
            }
            self.service
                .replicate(&batch)
                .map_err(|e| TransportError::Remote {
                    peer: self.id.clone(),
                    message: e.to_string(),
                })
        }

        async fn get_range(
            &self,
            topic: &str,
            partition: PartitionId,
            from: Offset,
            to: Option<Offset>,
        ) -> TransportResult<Vec<Message>> {
            self.service
                .get_range(topic, partition, from, to)
                .map_err(|e| TransportError::Remote {
                    peer: self.id.clone(),
                    message: e.to_string(),
                })
        }

        async fn ping(&self) -> TransportResult<()> {
            Ok(())
        }
    }

    fn open_log() -> (tempfile::TempDir, LogStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).unwrap();
        (dir, LogStore::new(store, Arc::new(HwmIndex::new())))
    }

    fn memory_peer(id: &str) -> (tempfile::TempDir, Arc<MemoryPeer>) {
        memory_peer_with(id, courier_core::Limits::default())
    }

    fn memory_peer_with(id: &str, limits: courier_core::Limits) -> (tempfile::TempDir, Arc<MemoryPeer>) {
        let (dir, log) = open_log();
        let peer = Arc::new(MemoryPeer {
            id: NodeId::new(id),
            service: ReplicaService::new(log.clone(), limits),
            log,
            down: AtomicBool::new(false),
        });
        (dir, peer)
    }

    fn published(log: &LogStore, count: usize) -> Vec<Message> {
        (0..count)
            .map(|i| {
                let mut m = Message::new("t", PartitionId::new(0), "k", format!("m{i}"), "p");
                log.append(&mut m).unwrap();
                m
            })
            .collect()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer() {
        let (_d1, a) = memory_peer("b");
        let (_d2, b) = memory_peer("c");
        let fanout = Fanout::new(
            NodeId::new("a"),
            vec![a.clone() as Arc<dyn ReplicaPeer>, b.clone()],
            ClusterTiming::fast_for_testing(),
        );

        let message = Message::new("t", PartitionId::new(0), "k", "x", "p")
            .with_id(MessageId::generate())
            .with_offset(Offset::new(0));
        let broadcast = fanout.broadcast(vec![message.clone()]);
        assert_eq!(broadcast.len(), 2);
        assert_eq!(broadcast.join().await.len(), 2);

        for peer in [&a, &b] {
            let read = peer.log.read("t", PartitionId::new(0), Offset::new(0), 10).unwrap();
            assert_eq!(read, vec![message.clone()]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_failure_is_isolated() {
        let (_d1, down) = memory_peer("b");
        let (_d2, up) = memory_peer("c");
        down.down.store(true, Ordering::SeqCst);
        let fanout = Fanout::new(
            NodeId::new("a"),
            vec![down.clone() as Arc<dyn ReplicaPeer>, up.clone()],
            ClusterTiming::fast_for_testing(),
        );

        let message = Message::new("t", PartitionId::new(0), "k", "x", "p")
            .with_id(MessageId::generate())
            .with_offset(Offset::new(0));
        let acks = fanout.broadcast(vec![message]).join().await;
        assert_eq!(acks.len(), 1);
        assert_eq!(up.log.end_offset("t", PartitionId::new(0)).unwrap(), Offset::new(1));
        assert_eq!(down.log.end_offset("t", PartitionId::new(0)).unwrap(), Offset::new(0));
    }

    #[tokio::test]
    async fn test_inert_fanout() {
        let fanout = Fanout::from_membership(
            &Membership::single_node(NodeId::new("a")),
            ClusterTiming::fast_for_testing(),
        );
        assert!(fanout.is_inert());
        let message = Message::new("t", PartitionId::new(0), "k", "x", "p");
        assert!(fanout.broadcast(vec![message]).is_empty());
    }

    #[tokio::test]
    async fn test_catch_up_pages_to_peer_end() {
        let (_d1, source) = memory_peer("b");
        let expected = published(&source.log, 10);
        let fanout = Fanout::new(
            NodeId::new("a"),
            vec![source.clone() as Arc<dyn ReplicaPeer>],
            ClusterTiming::fast_for_testing(),
        );

        let (_d2, local) = open_log();
        let report = fanout
            .catch_up(&NodeId::new("b"), "t", PartitionId::new(0), Offset::new(0), None, &local)
            .await
            .unwrap();
        assert_eq!(report.fetched, 10);
        assert_eq!(report.applied, 10);

        let read = local.read("t", PartitionId::new(0), Offset::new(0), 100).unwrap();
        assert_eq!(read, expected);
        assert_eq!(local.hwm().next_offset(&courier_core::PartitionKey::new("t", PartitionId::new(0))), Offset::new(10));

        // Second pass applies nothing new.
        let again = fanout
            .catch_up(&NodeId::new("b"), "t", PartitionId::new(0), Offset::new(10), None, &local)
            .await
            .unwrap();
        assert_eq!(again, CatchUpReport::default());
    }

    #[tokio::test]
    async fn test_catch_up_drains_size_limited_pages() {
        let mut limits = courier_core::Limits::default();
        limits.max_frame_bytes = 2048;
        let (_d1, source) = memory_peer_with("b", limits);
        let expected: Vec<Message> = (0..9)
            .map(|i| {
                let mut m = Message::new("t", PartitionId::new(0), "k", vec![i; 600], "p");
                source.log.append(&mut m).unwrap();
                m
            })
            .collect();
        let fanout = Fanout::new(
            NodeId::new("a"),
            vec![source.clone() as Arc<dyn ReplicaPeer>],
            ClusterTiming::fast_for_testing(),
        );

        // Three 600-byte messages fit a frame, fewer than the 4-offset window.
        let page = source
            .get_range("t", PartitionId::new(0), Offset::new(0), Some(Offset::new(4)))
            .await
            .unwrap();
        assert_eq!(page.len(), 3);

        let (_d2, local) = open_log();
        let report = fanout
            .catch_up(&NodeId::new("b"), "t", PartitionId::new(0), Offset::new(0), None, &local)
            .await
            .unwrap();
        assert_eq!(report.fetched, 9);
        assert_eq!(report.applied, 9);
        let read = local.read("t", PartitionId::new(0), Offset::new(0), 100).unwrap();
        assert_eq!(read, expected);
    }

    #[tokio::test]
    async fn test_catch_up_bounded_range() {
        let (_d1, source) = memory_peer("b");
        let expected = published(&source.log, 10);
        let fanout = Fanout::new(
            NodeId::new("a"),
            vec![source.clone() as Arc<dyn ReplicaPeer>],
            ClusterTiming::fast_for_testing(),
        );

        let (_d2, local) = open_log();
        let report = fanout
            .catch_up(
                &NodeId::new("b"),
                "t",
                PartitionId::new(0),
                Offset::new(2),
                Some(Offset::new(7)),
                &local,
            )
            .await
            .unwrap();
        assert_eq!(report.fetched, 5);
        let read = local.read("t", PartitionId::new(0), Offset::new(0), 100).unwrap();
        assert_eq!(read, expected[2..7].to_vec());
    }

    #[tokio::test]
    async fn test_catch_up_unknown_peer() {
        let fanout = Fanout::new(NodeId::new("a"), Vec::new(), ClusterTiming::fast_for_testing());
        let (_d, local) = open_log();
        let err = fanout
            .catch_up(&NodeId::new("zz"), "t", PartitionId::new(0), Offset::new(0), None, &local)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
