//! Node bootstrap: wires the stores, background tasks and replication.
//!
//! Startup order:
//! 1. Open the keyspace and rebuild the HWM index from the durable log.
//! 2. Spawn the queue redelivery sweep.
//! 3. If clustered, bind the replica server on this node's address and
//!    spawn the reconciler.
//!
//! [`Node::shutdown`] stops every background task and persists the keyspace.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use courier_cluster::{
    ClusterTiming, Fanout, FirstReachable, Membership, PeerSelector, ReconcileReport, Reconciler,
    ReplicaServer, ReplicaService,
};
use courier_core::{Limits, NodeId};
use courier_store::{Catalog, HwmIndex, LogStore, QueueConfig, QueueStore, Store, StoreConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::error::{NodeError, NodeResult};

/// Everything needed to start a node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// This node's id.
    pub node_id: NodeId,
    /// Keyspace directory.
    pub data_dir: PathBuf,
    /// Membership file. `None` or a missing file means single-node.
    pub cluster_config: Option<PathBuf>,
    /// Replica server bind address, overriding the membership entry.
    pub listen_addr: Option<String>,
    /// Keyspace fsync interval in milliseconds.
    pub fsync_ms: Option<u16>,
    /// Queue timing.
    pub queue: QueueConfig,
    /// Replication timing.
    pub timing: ClusterTiming,
    /// System limits.
    pub limits: Limits,
}

impl NodeOptions {
    /// Creates options with default timing and limits.
    #[must_use]
    pub fn new(node_id: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            data_dir: data_dir.into(),
            cluster_config: None,
            listen_addr: None,
            fsync_ms: None,
            queue: QueueConfig::default(),
            timing: ClusterTiming::default(),
            limits: Limits::default(),
        }
    }

    /// Sets the membership file.
    #[must_use]
    pub fn with_cluster_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.cluster_config = Some(path.into());
        self
    }

    /// Sets the replica server bind address.
    #[must_use]
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Sets the queue configuration.
    #[must_use]
    pub const fn with_queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the replication timing.
    #[must_use]
    pub const fn with_timing(mut self, timing: ClusterTiming) -> Self {
        self.timing = timing;
        self
    }
}

/// A running broker node.
pub struct Node {
    membership: Membership,
    store: Store,
    broker: Broker,
    selector: Arc<dyn PeerSelector>,
    reconciler: Option<Arc<Reconciler>>,
    replica_addr: Option<SocketAddr>,
    shutdown_txs: Vec<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("membership", &self.membership)
            .field("replica_addr", &self.replica_addr)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Starts a node.
    ///
    /// # Errors
    /// Returns an error if configuration is invalid, the store cannot be
    /// opened, the HWM rebuild fails, or the replica server cannot bind.
    pub async fn start(options: NodeOptions) -> NodeResult<Self> {
        options.queue.validate()?;
        options.timing.validate()?;
        options.limits.validate()?;

        let membership = match &options.cluster_config {
            Some(path) => Membership::load(options.node_id.clone(), path)?,
            None => Membership::single_node(options.node_id.clone()),
        };

        let mut store_config = StoreConfig::new(&options.data_dir);
        if let Some(ms) = options.fsync_ms {
            store_config = store_config.with_fsync_ms(ms);
        }
        let store = Store::open(&store_config)?;

        let hwm = Arc::new(HwmIndex::new());
        let log = LogStore::new(store.clone(), Arc::clone(&hwm));
        let partitions = hwm.rebuild(&log)?;
        let catalog = Catalog::new(store.clone(), options.limits);
        let queues = QueueStore::new(store.clone(), options.queue);

        let mut shutdown_txs = Vec::new();
        let mut tasks = Vec::new();

        let (tx, rx) = mpsc::channel(1);
        tasks.push(queues.spawn_requeue_loop(rx));
        shutdown_txs.push(tx);

        let fanout = Arc::new(Fanout::from_membership(&membership, options.timing));
        let selector: Arc<dyn PeerSelector> =
            Arc::new(FirstReachable::new(&membership, Arc::clone(&fanout)));

        let mut replica_addr = None;
        let mut reconciler = None;
        if membership.is_clustered() {
            let addr = match (&options.listen_addr, membership.self_host()) {
                (Some(addr), _) => addr.clone(),
                (None, Some(host)) => host.to_string(),
                (None, None) => {
                    return Err(NodeError::MissingSelfHost {
                        node_id: options.node_id.to_string(),
                    })
                }
            };
            let server = ReplicaServer::bind(&addr).await?;
            replica_addr = Some(server.local_addr());
            let service = ReplicaService::new(log.clone(), options.limits);
            let (tx, rx) = mpsc::channel(1);
            tasks.push(server.spawn(service, rx));
            shutdown_txs.push(tx);

            let driver = Arc::new(Reconciler::new(
                catalog.clone(),
                log.clone(),
                Arc::clone(&fanout),
                Arc::clone(&selector),
                options.timing.reconcile_interval,
            ));
            let (tx, rx) = mpsc::channel(1);
            tasks.push(Arc::clone(&driver).spawn(rx));
            shutdown_txs.push(tx);
            reconciler = Some(driver);
        }

        info!(
            node_id = %options.node_id,
            data_dir = %options.data_dir.display(),
            partitions,
            clustered = membership.is_clustered(),
            replica_addr = ?replica_addr,
            "Node started"
        );

        let broker = Broker::new(catalog, log, queues, fanout, options.limits);
        Ok(Self {
            membership,
            store,
            broker,
            selector,
            reconciler,
            replica_addr,
            shutdown_txs,
            tasks,
        })
    }

    /// Returns the broker.
    #[must_use]
    pub const fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Returns the membership.
    #[must_use]
    pub const fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Returns the replica server's bound address when clustered.
    #[must_use]
    pub const fn replica_addr(&self) -> Option<SocketAddr> {
        self.replica_addr
    }

    /// Returns the current leader.
    pub async fn leader(&self) -> NodeId {
        self.selector.leader().await
    }

    /// Runs one reconciliation pass now. Returns `None` when single-node.
    pub async fn reconcile_now(&self) -> Option<ReconcileReport> {
        match &self.reconciler {
            Some(reconciler) => Some(reconciler.tick().await),
            None => None,
        }
    }

    /// Stops background tasks and persists the keyspace.
    ///
    /// # Errors
    /// Returns `Broker(Storage)` if the final persist fails.
    pub async fn shutdown(self) -> NodeResult<()> {
        for tx in &self.shutdown_txs {
            let _ = tx.send(()).await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }
        self.store.persist()?;
        info!(node_id = %self.membership.self_id(), "Node stopped");
        Ok(())
    }
}
