//! Broker use cases over the stores and the replication fanout.
//!
//! The broker decides what callers see: unknown topics and queues are
//! `NotFound`, partition indices are bounds-checked against the catalog, and
//! a publish succeeds as soon as the local append commits. Replication to
//! peers is started but never awaited.

use std::sync::Arc;

use bytes::Bytes;
use courier_cluster::Fanout;
use courier_core::{
    partition_for_key, Error, Limits, Message, MessageId, Offset, PartitionId, Result,
};
use courier_store::{Catalog, LogStore, QueueInfo, QueueStore, TopicInfo};
use tracing::debug;

/// Where a published message landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Partition chosen from the key.
    pub partition: PartitionId,
    /// Assigned offset.
    pub offset: Offset,
    /// Assigned message id.
    pub id: MessageId,
}

/// Topic and queue operations for one node.
#[derive(Debug, Clone)]
pub struct Broker {
    catalog: Catalog,
    log: LogStore,
    queues: QueueStore,
    fanout: Arc<Fanout>,
    limits: Limits,
}

impl Broker {
    /// Creates a broker.
    #[must_use]
    pub const fn new(
        catalog: Catalog,
        log: LogStore,
        queues: QueueStore,
        fanout: Arc<Fanout>,
        limits: Limits,
    ) -> Self {
        Self {
            catalog,
            log,
            queues,
            fanout,
            limits,
        }
    }

    /// Returns the catalog.
    #[must_use]
    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Returns the log store.
    #[must_use]
    pub const fn log(&self) -> &LogStore {
        &self.log
    }

    /// Returns the queue store.
    #[must_use]
    pub const fn queues(&self) -> &QueueStore {
        &self.queues
    }

    // -------------------------------------------------------------------------
    // Topics
    // -------------------------------------------------------------------------

    /// Creates a topic.
    ///
    /// # Errors
    /// - `InvalidArgument` for a bad name or partition count.
    /// - `AlreadyExists` if the name is taken.
    pub fn create_topic(&self, name: &str, partitions: u32, creator: &str) -> Result<TopicInfo> {
        self.catalog.create_topic(name, partitions, creator)
    }

    /// Lists topics.
    ///
    /// # Errors
    /// Returns `Storage` if the scan fails.
    pub fn list_topics(&self) -> Result<Vec<TopicInfo>> {
        self.catalog.list_topics()
    }

    /// Deletes a topic's catalog record. Log data is kept.
    ///
    /// # Errors
    /// - `NotFound` if the topic does not exist.
    /// - `Unauthorized` if `user` is not the creator.
    pub fn delete_topic(&self, name: &str, user: &str) -> Result<()> {
        self.catalog.delete_topic(name, user)
    }

    /// Appends a message to the partition selected by `key`, then broadcasts
    /// it to peers. Must be called within a tokio runtime when clustered.
    ///
    /// # Errors
    /// - `NotFound` if the topic does not exist.
    /// - `InvalidArgument` if the key, payload or producer exceeds limits.
    /// - `Storage` if the append fails.
    pub fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: impl Into<Bytes>,
        producer: &str,
    ) -> Result<PublishReceipt> {
        let partition_count = self.catalog.partition_count(topic)?;
        let partition = partition_for_key(key, partition_count);

        let mut message = Message::new(topic, partition, key, payload, producer);
        message.validate(&self.limits)?;
        let offset = self.log.append(&mut message)?;
        let receipt = PublishReceipt {
            partition,
            offset,
            id: message.id,
        };

        // Fire-and-forget.
        let _ = self.fanout.broadcast(vec![message]);
        debug!(
            topic = %topic,
            partition = partition.get(),
            offset = offset.get(),
            "Published message"
        );
        Ok(receipt)
    }

    /// Reads up to `max` messages from the group's committed offset (0 if the
    /// group never committed).
    ///
    /// # Errors
    /// - `NotFound` if the topic does not exist.
    /// - `OutOfRange` if the partition index is too large.
    pub fn pull(
        &self,
        topic: &str,
        group: &str,
        partition: PartitionId,
        max: usize,
    ) -> Result<Vec<Message>> {
        self.check_partition(topic, partition)?;
        let from = self
            .catalog
            .get_offset(group, topic, partition)?
            .unwrap_or_default();
        self.log.read(topic, partition, from, max)
    }

    /// Commits a group's offset for a partition.
    ///
    /// # Errors
    /// - `NotFound` if the topic does not exist.
    /// - `OutOfRange` if the partition index is too large.
    pub fn commit(
        &self,
        topic: &str,
        group: &str,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<()> {
        self.check_partition(topic, partition)?;
        self.catalog.commit_offset(group, topic, partition, offset)
    }

    fn check_partition(&self, topic: &str, partition: PartitionId) -> Result<()> {
        let partition_count = self.catalog.partition_count(topic)?;
        if partition.get() >= partition_count {
            return Err(Error::OutOfRange {
                topic: topic.to_string(),
                partition,
                partition_count,
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queues
    // -------------------------------------------------------------------------

    /// Creates a queue.
    ///
    /// # Errors
    /// - `InvalidArgument` for a bad name.
    /// - `AlreadyExists` if the name is taken.
    pub fn create_queue(&self, name: &str, creator: &str) -> Result<QueueInfo> {
        self.catalog.create_queue(name, creator)
    }

    /// Lists queues.
    ///
    /// # Errors
    /// Returns `Storage` if the scan fails.
    pub fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        self.catalog.list_queues()
    }

    /// Deletes a queue's catalog record.
    ///
    /// # Errors
    /// - `NotFound` if the queue does not exist.
    /// - `Unauthorized` if `user` is not the creator.
    pub fn delete_queue(&self, name: &str, user: &str) -> Result<()> {
        self.catalog.delete_queue(name, user)
    }

    /// Appends a message to a queue.
    ///
    /// # Errors
    /// - `NotFound` if the queue was never created.
    /// - `InvalidArgument` if the payload or producer exceeds limits.
    pub fn enqueue(
        &self,
        queue: &str,
        payload: impl Into<Bytes>,
        producer: &str,
    ) -> Result<MessageId> {
        self.check_queue(queue)?;
        let message = Message::for_queue(queue, payload, producer);
        message.validate(&self.limits)?;
        self.queues.enqueue(queue, message)
    }

    /// Takes the next pending message, if any.
    ///
    /// # Errors
    /// Returns `NotFound` if the queue was never created.
    pub fn dequeue(&self, queue: &str) -> Result<Option<Message>> {
        self.check_queue(queue)?;
        self.queues.dequeue(queue)
    }

    /// Acknowledges an in-flight message. Unknown ids succeed.
    ///
    /// # Errors
    /// Returns `NotFound` if the queue was never created.
    pub fn ack(&self, queue: &str, id: MessageId) -> Result<()> {
        self.check_queue(queue)?;
        self.queues.ack(queue, id)
    }

    fn check_queue(&self, queue: &str) -> Result<()> {
        if self.catalog.queue_exists(queue)? {
            Ok(())
        } else {
            Err(Error::queue_not_found(queue))
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_cluster::{ClusterTiming, Membership};
    use courier_core::NodeId;
    use courier_store::{HwmIndex, QueueConfig, Store};

    use super::*;

    fn open() -> (tempfile::TempDir, Broker) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(dir.path()).unwrap();
        let limits = Limits::default();
        let fanout = Arc::new(Fanout::from_membership(
            &Membership::single_node(NodeId::new("n1")),
            ClusterTiming::default(),
        ));
        let broker = Broker::new(
            Catalog::new(store.clone(), limits),
            LogStore::new(store.clone(), Arc::new(HwmIndex::new())),
            QueueStore::new(store, QueueConfig::default()),
            fanout,
            limits,
        );
        (dir, broker)
    }

    #[test]
    fn test_publish_and_pull() {
        let (_dir, broker) = open();
        broker.create_topic("events", 1, "alice").unwrap();

        let first = broker.publish("events", "k", "a", "svc").unwrap();
        let second = broker.publish("events", "k", "b", "svc").unwrap();
        assert_eq!(first.offset, Offset::new(0));
        assert_eq!(second.offset, Offset::new(1));
        assert_eq!(first.partition, PartitionId::new(0));

        let p = PartitionId::new(0);
        let pulled = broker.pull("events", "g", p, 10).unwrap();
        assert_eq!(pulled.len(), 2);
        assert_eq!(pulled[0].id, first.id);

        broker.commit("events", "g", p, Offset::new(1)).unwrap();
        let pulled = broker.pull("events", "g", p, 10).unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].payload, "b");

        // Other groups keep their own cursor.
        assert_eq!(broker.pull("events", "other", p, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_publish_uses_key_partition() {
        let (_dir, broker) = open();
        broker.create_topic("orders", 4, "alice").unwrap();
        let receipt = broker.publish("orders", "customer-7", "x", "svc").unwrap();
        assert_eq!(receipt.partition, partition_for_key("customer-7", 4));
        let again = broker.publish("orders", "customer-7", "y", "svc").unwrap();
        assert_eq!(again.partition, receipt.partition);
        assert_eq!(again.offset, Offset::new(1));
    }

    #[test]
    fn test_publish_unknown_topic() {
        let (_dir, broker) = open();
        assert!(broker.publish("nope", "k", "x", "svc").unwrap_err().is_not_found());
    }

    #[test]
    fn test_pull_out_of_range_partition() {
        let (_dir, broker) = open();
        broker.create_topic("orders", 4, "alice").unwrap();
        let err = broker.pull("orders", "g", PartitionId::new(4), 10).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { partition_count: 4, .. }));
        let err = broker
            .commit("orders", "g", PartitionId::new(9), Offset::new(0))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[test]
    fn test_queue_requires_creation() {
        let (_dir, broker) = open();
        assert!(broker.enqueue("jobs", "x", "svc").unwrap_err().is_not_found());
        assert!(broker.dequeue("jobs").unwrap_err().is_not_found());
        assert!(broker.ack("jobs", MessageId::generate()).unwrap_err().is_not_found());

        broker.create_queue("jobs", "alice").unwrap();
        let id = broker.enqueue("jobs", "x", "svc").unwrap();
        let message = broker.dequeue("jobs").unwrap().unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.payload, "x");
        broker.ack("jobs", id).unwrap();
        assert!(broker.dequeue("jobs").unwrap().is_none());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (_dir, broker) = open();
        broker.create_topic("events", 1, "alice").unwrap();
        let payload = vec![0u8; Limits::default().max_payload_bytes as usize + 1];
        let err = broker.publish("events", "k", payload, "svc").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "payload", .. }));
    }

    #[test]
    fn test_long_producer_rejected_and_partition_stays_readable() {
        let (_dir, broker) = open();
        broker.create_topic("events", 1, "alice").unwrap();
        let producer = "p".repeat(70_000);
        let err = broker.publish("events", "k", "x", &producer).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "producer", .. }));

        broker.create_queue("jobs", "alice").unwrap();
        let err = broker.enqueue("jobs", "x", &producer).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "producer", .. }));

        let receipt = broker.publish("events", "k", "ok", "svc").unwrap();
        assert_eq!(receipt.offset, Offset::new(0));
        let pulled = broker.pull("events", "g", PartitionId::new(0), 10).unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].payload, "ok");
    }
}
