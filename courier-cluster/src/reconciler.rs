//! Periodic gap repair.
//!
//! Each tick pulls, for every catalogued partition, whatever one reachable
//! peer holds beyond the local HWM. This repairs dropped broadcasts; it is
//! not consensus. Failures are logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{NodeId, Offset, PartitionId, PartitionKey};
use courier_store::{Catalog, LogStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fanout::Fanout;
use crate::leader::PeerSelector;

/// Outcome of one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The peer pulled from, if any was reachable.
    pub peer: Option<NodeId>,
    /// Partitions examined.
    pub partitions: usize,
    /// Messages written locally.
    pub applied: u64,
    /// Partitions whose catch-up failed.
    pub failures: usize,
}

/// Background catch-up driver.
pub struct Reconciler {
    catalog: Catalog,
    log: LogStore,
    fanout: Arc<Fanout>,
    selector: Arc<dyn PeerSelector>,
    interval: Duration,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("fanout", &self.fanout)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        catalog: Catalog,
        log: LogStore,
        fanout: Arc<Fanout>,
        selector: Arc<dyn PeerSelector>,
        interval: Duration,
    ) -> Self {
        Self {
            catalog,
            log,
            fanout,
            selector,
            interval,
        }
    }

    /// Runs one reconciliation pass.
    pub async fn tick(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if self.fanout.is_inert() {
            return report;
        }
        let Some(peer) = self.selector.source_peer().await else {
            debug!("No reachable peer, skipping reconciliation");
            return report;
        };

        let hwm = self.log.hwm().snapshot();
        let topics = match self.catalog.list_topics() {
            Ok(topics) => topics,
            Err(e) => {
                warn!(error = %e, "Failed to list topics for reconciliation");
                report.peer = Some(peer);
                report.failures += 1;
                return report;
            }
        };

        for topic in &topics {
            for p in 0..topic.partitions {
                let partition = PartitionId::new(p);
                let from = hwm
                    .get(&PartitionKey::new(topic.name.as_str(), partition))
                    .copied()
                    .unwrap_or(Offset::new(0));
                report.partitions += 1;

                match self
                    .fanout
                    .catch_up(&peer, &topic.name, partition, from, None, &self.log)
                    .await
                {
                    Ok(catch_up) => report.applied += catch_up.applied,
                    Err(e) => {
                        warn!(
                            peer = %peer,
                            topic = %topic.name,
                            partition = p,
                            from = from.get(),
                            error = %e,
                            "Catch-up failed"
                        );
                        report.failures += 1;
                    }
                }
            }
        }

        if report.applied > 0 {
            info!(
                peer = %peer,
                partitions = report.partitions,
                applied = report.applied,
                "Reconciled missing messages"
            );
        } else {
            debug!(peer = %peer, partitions = report.partitions, "Reconciliation tick");
        }
        report.peer = Some(peer);
        report
    }

    /// Spawns the timer loop. It exits when `shutdown_rx` fires or its sender
    /// is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // The first tick completes immediately; reconcile after one period.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Reconciler shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }
}
