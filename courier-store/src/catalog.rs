//! Metadata catalog: topics, queues and consumer-group offsets.
//!
//! Records are JSON values under `t:` (topics) and `u:` (queues). Committed
//! group offsets are 8-byte big-endian counters under `o:`. Every operation
//! is atomic at single-key granularity.

use courier_core::{validate_name, Error, Limits, Offset, PartitionId, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{decode_u64, encode_u64, Store};
use crate::keys;

/// A topic as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    /// Topic name.
    pub name: String,
    /// Fixed partition count.
    pub partitions: u32,
    /// Identity that created the topic.
    pub creator: String,
}

/// A queue as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Queue name.
    pub name: String,
    /// Identity that created the queue.
    pub creator: String,
}

#[derive(Serialize, Deserialize)]
struct TopicRecord {
    partitions: u32,
    creator: String,
}

#[derive(Serialize, Deserialize)]
struct QueueRecord {
    creator: String,
}

/// Durable registry of topics, queues and group offsets.
#[derive(Debug, Clone)]
pub struct Catalog {
    store: Store,
    limits: Limits,
}

impl Catalog {
    /// Creates a catalog over `store`.
    #[must_use]
    pub const fn new(store: Store, limits: Limits) -> Self {
        Self { store, limits }
    }

    // -------------------------------------------------------------------------
    // Topics
    // -------------------------------------------------------------------------

    /// Registers a topic.
    ///
    /// # Errors
    /// - `InvalidArgument` for a bad name or partition count.
    /// - `AlreadyExists` if the name is taken.
    pub fn create_topic(&self, name: &str, partitions: u32, creator: &str) -> Result<TopicInfo> {
        validate_name("topic", name, &self.limits)?;
        if partitions == 0 || partitions > self.limits.max_partitions {
            return Err(Error::InvalidArgument {
                name: "partitions",
                reason: format!("must be between 1 and {}", self.limits.max_partitions),
            });
        }

        let record = TopicRecord {
            partitions,
            creator: creator.to_string(),
        };
        self.insert_new("create_topic", "topic", name, &keys::topic(name), &record)?;

        info!(topic = name, partitions, creator, "Topic created");
        Ok(TopicInfo {
            name: name.to_string(),
            partitions,
            creator: creator.to_string(),
        })
    }

    /// Looks up a topic.
    ///
    /// # Errors
    /// Returns `NotFound` if the topic does not exist.
    pub fn get_topic(&self, name: &str) -> Result<TopicInfo> {
        let value = self
            .store
            .get("get_topic", &keys::topic(name))?
            .ok_or_else(|| Error::topic_not_found(name))?;
        let record: TopicRecord = decode_record("get_topic", &value)?;
        Ok(TopicInfo {
            name: name.to_string(),
            partitions: record.partitions,
            creator: record.creator,
        })
    }

    /// Returns a topic's partition count.
    ///
    /// # Errors
    /// Returns `NotFound` if the topic does not exist.
    pub fn partition_count(&self, name: &str) -> Result<u32> {
        Ok(self.get_topic(name)?.partitions)
    }

    /// Lists every topic in name order.
    ///
    /// # Errors
    /// Returns `Storage` if the scan fails.
    pub fn list_topics(&self) -> Result<Vec<TopicInfo>> {
        self.store
            .scan_prefix("list_topics", keys::TOPIC_PREFIX)?
            .iter()
            .map(|(key, value)| {
                let record: TopicRecord = decode_record("list_topics", value)?;
                Ok(TopicInfo {
                    name: strip_prefix(key, keys::TOPIC_PREFIX),
                    partitions: record.partitions,
                    creator: record.creator,
                })
            })
            .collect()
    }

    /// Deletes a topic record. Only its creator may do so.
    ///
    /// Log data is left in place.
    ///
    /// # Errors
    /// - `NotFound` if the topic does not exist.
    /// - `Unauthorized` if `user` is not the creator.
    pub fn delete_topic(&self, name: &str, user: &str) -> Result<()> {
        self.remove_owned("delete_topic", "topic", name, &keys::topic(name), user, |v| {
            decode_record::<TopicRecord>("delete_topic", v).map(|r| r.creator)
        })?;
        info!(topic = name, user, "Topic deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queues
    // -------------------------------------------------------------------------

    /// Registers a queue.
    ///
    /// # Errors
    /// - `InvalidArgument` for a bad name.
    /// - `AlreadyExists` if the name is taken.
    pub fn create_queue(&self, name: &str, creator: &str) -> Result<QueueInfo> {
        validate_name("queue", name, &self.limits)?;
        let record = QueueRecord {
            creator: creator.to_string(),
        };
        self.insert_new("create_queue", "queue", name, &keys::queue(name), &record)?;

        info!(queue = name, creator, "Queue created");
        Ok(QueueInfo {
            name: name.to_string(),
            creator: creator.to_string(),
        })
    }

    /// Looks up a queue.
    ///
    /// # Errors
    /// Returns `NotFound` if the queue does not exist.
    pub fn get_queue(&self, name: &str) -> Result<QueueInfo> {
        let value = self
            .store
            .get("get_queue", &keys::queue(name))?
            .ok_or_else(|| Error::queue_not_found(name))?;
        let record: QueueRecord = decode_record("get_queue", &value)?;
        Ok(QueueInfo {
            name: name.to_string(),
            creator: record.creator,
        })
    }

    /// Returns true if the queue has been created.
    ///
    /// # Errors
    /// Returns `Storage` if the read fails.
    pub fn queue_exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.get("queue_exists", &keys::queue(name))?.is_some())
    }

    /// Lists every queue in name order.
    ///
    /// # Errors
    /// Returns `Storage` if the scan fails.
    pub fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        self.store
            .scan_prefix("list_queues", keys::QUEUE_PREFIX)?
            .iter()
            .map(|(key, value)| {
                let record: QueueRecord = decode_record("list_queues", value)?;
                Ok(QueueInfo {
                    name: strip_prefix(key, keys::QUEUE_PREFIX),
                    creator: record.creator,
                })
            })
            .collect()
    }

    /// Deletes a queue record. Only its creator may do so.
    ///
    /// # Errors
    /// - `NotFound` if the queue does not exist.
    /// - `Unauthorized` if `user` is not the creator.
    pub fn delete_queue(&self, name: &str, user: &str) -> Result<()> {
        self.remove_owned("delete_queue", "queue", name, &keys::queue(name), user, |v| {
            decode_record::<QueueRecord>("delete_queue", v).map(|r| r.creator)
        })?;
        info!(queue = name, user, "Queue deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Consumer-group offsets
    // -------------------------------------------------------------------------

    /// Returns a group's committed offset, or `None` before the first commit.
    ///
    /// # Errors
    /// Returns `Storage` if the read fails.
    pub fn get_offset(
        &self,
        group: &str,
        topic: &str,
        partition: PartitionId,
    ) -> Result<Option<Offset>> {
        self.store
            .get("get_offset", &keys::group_offset(group, topic, partition))?
            .map(|v| decode_u64("get_offset", &v).map(Offset::new))
            .transpose()
    }

    /// Records a group's committed offset, overwriting any previous value.
    ///
    /// # Errors
    /// - `InvalidArgument` for a bad group name.
    /// - `Storage` if the write fails.
    pub fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<()> {
        validate_name("group", group, &self.limits)?;
        let mut tx = self.store.write_tx();
        tx.insert(
            self.store.partition(),
            keys::group_offset(group, topic, partition),
            encode_u64(offset.get()),
        );
        tx.commit().map_err(|e| Error::storage("commit_offset", e))
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn insert_new<T: Serialize>(
        &self,
        operation: &'static str,
        resource: &'static str,
        name: &str,
        key: &str,
        record: &T,
    ) -> Result<()> {
        let value = serde_json::to_vec(record).map_err(|e| Error::storage(operation, e))?;
        let mut tx = self.store.write_tx();
        if tx
            .get(self.store.partition(), key)
            .map_err(|e| Error::storage(operation, e))?
            .is_some()
        {
            return Err(Error::AlreadyExists {
                resource,
                name: name.to_string(),
            });
        }
        tx.insert(self.store.partition(), key, value);
        tx.commit().map_err(|e| Error::storage(operation, e))
    }

    fn remove_owned(
        &self,
        operation: &'static str,
        resource: &'static str,
        name: &str,
        key: &str,
        user: &str,
        creator_of: impl FnOnce(&[u8]) -> Result<String>,
    ) -> Result<()> {
        let mut tx = self.store.write_tx();
        let value = tx
            .get(self.store.partition(), key)
            .map_err(|e| Error::storage(operation, e))?
            .ok_or_else(|| Error::NotFound {
                resource,
                name: name.to_string(),
            })?;
        if creator_of(&value)? != user {
            return Err(Error::Unauthorized {
                resource,
                name: name.to_string(),
                user: user.to_string(),
            });
        }
        tx.remove(self.store.partition(), key);
        tx.commit().map_err(|e| Error::storage(operation, e))
    }
}

fn decode_record<T: for<'de> Deserialize<'de>>(operation: &'static str, value: &[u8]) -> Result<T> {
    serde_json::from_slice(value).map_err(|e| Error::storage(operation, e))
}

fn strip_prefix(key: &[u8], prefix: &str) -> String {
    String::from_utf8_lossy(&key[prefix.len().min(key.len())..]).into_owned()
}
