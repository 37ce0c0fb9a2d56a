//! In-process peers for cluster tests.
//!
//! [`LocalNode`] owns one node's stores in a temporary directory.
//! [`LocalPeer`] exposes a node's replica service through the
//! [`ReplicaPeer`] seam, with switches to drop broadcasts or make the peer
//! unreachable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_cluster::{ReplicaPeer, ReplicaService, ReplicateAck, TransportError, TransportResult};
use courier_core::{Limits, Message, NodeId, Offset, PartitionId};
use courier_store::{Catalog, HwmIndex, LogStore, QueueConfig, QueueStore, Store};
use tempfile::TempDir;
use tracing::trace;

/// One node's store components in a temporary directory.
#[derive(Debug)]
pub struct LocalNode {
    /// This node's id.
    pub id: NodeId,
    /// Durable keyspace.
    pub store: Store,
    /// Partition log.
    pub log: LogStore,
    /// Metadata catalog.
    pub catalog: Catalog,
    /// Work queues.
    pub queues: QueueStore,
    /// Inbound apply service.
    pub replica: ReplicaService,
    dir: TempDir,
}

impl LocalNode {
    /// Opens a fresh node.
    ///
    /// # Panics
    /// Panics if the temporary directory or the store cannot be created.
    #[must_use]
    pub fn open(id: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        Self::open_in(id, dir)
    }

    /// Opens a node over an existing directory, rebuilding the HWM index.
    ///
    /// # Panics
    /// Panics if the store cannot be opened or the rebuild fails.
    #[must_use]
    pub fn open_in(id: &str, dir: TempDir) -> Self {
        let store = Store::open_path(dir.path()).expect("open store");
        let log = LogStore::new(store.clone(), Arc::new(HwmIndex::new()));
        log.hwm().rebuild(&log).expect("rebuild hwm");
        let limits = Limits::default();
        Self {
            id: NodeId::new(id),
            catalog: Catalog::new(store.clone(), limits),
            queues: QueueStore::new(store.clone(), QueueConfig::default()),
            replica: ReplicaService::new(log.clone(), limits),
            log,
            store,
            dir,
        }
    }

    /// Persists and closes the node, returning its directory for reopening.
    ///
    /// # Panics
    /// Panics if the keyspace cannot be persisted.
    #[must_use]
    pub fn close(self) -> TempDir {
        self.store.persist().expect("persist");
        self.dir
    }

    /// Returns a peer handle over this node.
    #[must_use]
    pub fn peer(&self) -> Arc<LocalPeer> {
        Arc::new(LocalPeer::new(self.id.clone(), self.replica.clone()))
    }
}

/// An in-process peer.
#[derive(Debug)]
pub struct LocalPeer {
    id: NodeId,
    service: ReplicaService,
    drop_broadcasts: AtomicBool,
    unreachable: AtomicBool,
    dropped: AtomicU64,
}

impl LocalPeer {
    /// Creates a reachable peer that accepts broadcasts.
    #[must_use]
    pub const fn new(id: NodeId, service: ReplicaService) -> Self {
        Self {
            id,
            service,
            drop_broadcasts: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Drops (and fails) every replicate call while set.
    pub fn set_drop_broadcasts(&self, drop: bool) {
        self.drop_broadcasts.store(drop, Ordering::SeqCst);
    }

    /// Fails every call while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Returns how many broadcasts were dropped.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> TransportResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed {
                peer: self.id.clone(),
                addr: "local".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "unreachable"),
            });
        }
        Ok(())
    }

    fn remote(&self, e: &courier_core::Error) -> TransportError {
        TransportError::Remote {
            peer: self.id.clone(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl ReplicaPeer for LocalPeer {
    fn node_id(&self) -> &NodeId {
        &self.id
    }

    async fn replicate(&self, batch: Vec<Message>) -> TransportResult<ReplicateAck> {
        self.check_reachable()?;
        if self.drop_broadcasts.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            trace!(peer = %self.id, messages = batch.len(), "Dropping broadcast");
            return Err(TransportError::Timeout {
                peer: self.id.clone(),
                timeout: Duration::ZERO,
            });
        }
        self.service.replicate(&batch).map_err(|e| self.remote(&e))
    }

    async fn get_range(
        &self,
        topic: &str,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
    ) -> TransportResult<Vec<Message>> {
        self.check_reachable()?;
        self.service
            .get_range(topic, partition, from, to)
            .map_err(|e| self.remote(&e))
    }

    async fn ping(&self) -> TransportResult<()> {
        self.check_reachable()
    }
}
