//! Partitioned, offset-ordered message log.
//!
//! Locally produced messages go through [`LogStore::append`], which assigns
//! the next offset. Messages arriving from peers go through
//! [`LogStore::append_at_offset`], which keeps the sender's offset and is
//! idempotent. Both commit the record and the durable HWM key in one
//! transaction, then advance the in-memory [`HwmIndex`].

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{Error, Message, Offset, PartitionId, PartitionKey, Result};
use tracing::debug;

use crate::db::{decode_message, decode_u64, encode_message, encode_u64, Store};
use crate::hwm::HwmIndex;
use crate::keys;

/// Result of an offset-preserving append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The record was written.
    Applied,
    /// A record already occupied the offset; only the HWM may have moved.
    Duplicate,
}

/// Durable partition log.
#[derive(Debug, Clone)]
pub struct LogStore {
    store: Store,
    hwm: Arc<HwmIndex>,
}

impl LogStore {
    /// Creates a log over `store`, keeping `hwm` up to date.
    #[must_use]
    pub const fn new(store: Store, hwm: Arc<HwmIndex>) -> Self {
        Self { store, hwm }
    }

    /// Returns the HWM index this log advances.
    #[must_use]
    pub const fn hwm(&self) -> &Arc<HwmIndex> {
        &self.hwm
    }

    /// Appends a locally produced message.
    ///
    /// Assigns an identifier if absent and the next offset of the message's
    /// partition, writing both back into `message`. The record and the
    /// durable HWM commit together.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the message cannot be encoded or the
    /// partition has no offset left, or `Storage` if the transaction fails.
    /// Nothing is written in either case.
    pub fn append(&self, message: &mut Message) -> Result<Offset> {
        message.ensure_id();
        let hwm_key = keys::hwm(&message.topic, message.partition);

        let mut tx = self.store.write_tx();
        let next = tx
            .get(self.store.partition(), &hwm_key)
            .map_err(|e| Error::storage("append", e))?
            .map(|v| decode_u64("append", &v))
            .transpose()?
            .unwrap_or(0);

        let offset = Offset::new(next);
        let next = successor(&message.topic, message.partition, offset)?;
        message.offset = offset;
        tx.insert(
            self.store.partition(),
            keys::message(&message.topic, message.partition, offset),
            encode_message(message)?,
        );
        tx.insert(
            self.store.partition(),
            hwm_key.as_str(),
            encode_u64(next.get()),
        );
        tx.commit()
            .map_err(|e| Error::storage("append", e))?;

        self.hwm.track_next_offset(&message.partition_key(), next);
        debug!(
            topic = %message.topic,
            partition = message.partition.get(),
            offset = offset.get(),
            "Appended message"
        );
        Ok(offset)
    }

    /// Writes a replicated message at its original offset.
    ///
    /// A no-op if that offset is already occupied, except that the HWM is
    /// still raised to `offset + 1` when it lags. Never lowers the HWM.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the message cannot be encoded or its
    /// offset is `u64::MAX`, or `Storage` if the transaction fails.
    pub fn append_at_offset(&self, message: &Message) -> Result<AppendOutcome> {
        let mut message = message.clone();
        message.ensure_id();
        let next = successor(&message.topic, message.partition, message.offset)?;
        let value = encode_message(&message)?;
        let message_key = keys::message(&message.topic, message.partition, message.offset);
        let hwm_key = keys::hwm(&message.topic, message.partition);

        let mut tx = self.store.write_tx();
        let exists = tx
            .get(self.store.partition(), &message_key)
            .map_err(|e| Error::storage("append_at_offset", e))?
            .is_some();
        let current = tx
            .get(self.store.partition(), &hwm_key)
            .map_err(|e| Error::storage("append_at_offset", e))?
            .map(|v| decode_u64("append_at_offset", &v))
            .transpose()?
            .unwrap_or(0);

        if !exists {
            tx.insert(self.store.partition(), message_key.as_str(), value);
        }
        if next.get() > current {
            tx.insert(self.store.partition(), hwm_key.as_str(), encode_u64(next.get()));
        }
        tx.commit()
            .map_err(|e| Error::storage("append_at_offset", e))?;

        self.hwm.track_next_offset(&message.partition_key(), next);

        if exists {
            debug!(
                topic = %message.topic,
                partition = message.partition.get(),
                offset = message.offset.get(),
                "Replicated message already present"
            );
            Ok(AppendOutcome::Duplicate)
        } else {
            Ok(AppendOutcome::Applied)
        }
    }

    /// Reads up to `max` messages starting at `from`, in offset order.
    ///
    /// Returns an empty vector (not an error) if `from` is at or past the end.
    /// Holes left by replication are skipped as in
    /// [`read_range`](Self::read_range).
    ///
    /// # Errors
    /// Returns `Storage` if the scan or decoding fails.
    pub fn read(
        &self,
        topic: &str,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> Result<Vec<Message>> {
        self.read_range(topic, partition, from, None, max)
    }

    /// Reads messages with `from <= offset < to` (or to the end if `to` is
    /// `None`), at most `max` of them.
    ///
    /// Locally appended partitions are gapless. A partition filled by
    /// replication may have holes until the reconciler repairs them; the
    /// records on either side of a hole are returned together, in offset
    /// order, so a reader never stalls at one.
    ///
    /// # Errors
    /// Returns `Storage` if the scan or decoding fails.
    pub fn read_range(
        &self,
        topic: &str,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
        max: usize,
    ) -> Result<Vec<Message>> {
        self.read_range_within(topic, partition, from, to, max, usize::MAX)
    }

    /// [`read_range`](Self::read_range) that also stops once the stored
    /// records total `max_bytes`. The first record is returned even if it is
    /// larger, so a caller always makes progress.
    ///
    /// # Errors
    /// Returns `Storage` if the scan or decoding fails.
    pub fn read_range_within(
        &self,
        topic: &str,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
        max: usize,
        max_bytes: usize,
    ) -> Result<Vec<Message>> {
        if max == 0 || to.is_some_and(|to| to <= from) {
            return Ok(Vec::new());
        }
        let start = keys::message(topic, partition, from);
        let end = match to {
            Some(to) => keys::message(topic, partition, to),
            None => keys::prefix_end(&keys::message_partition_prefix(topic, partition)),
        };

        self.store
            .scan_range("read", &start, &end, max, max_bytes)?
            .iter()
            .map(|(_, value)| decode_message("read", value))
            .collect()
    }

    /// Returns the durable next offset of a partition (0 if never written).
    ///
    /// # Errors
    /// Returns `Storage` if the read fails.
    pub fn end_offset(&self, topic: &str, partition: PartitionId) -> Result<Offset> {
        let next = self
            .store
            .get("end_offset", &keys::hwm(topic, partition))?
            .map(|v| decode_u64("end_offset", &v))
            .transpose()?
            .unwrap_or(0);
        Ok(Offset::new(next))
    }

    /// Scans every durable message key and returns the largest offset seen
    /// per partition.
    ///
    /// # Errors
    /// Returns `Storage` if the scan fails.
    pub fn max_offsets(&self) -> Result<HashMap<PartitionKey, Offset>> {
        let mut max_offsets: HashMap<PartitionKey, Offset> = HashMap::new();
        for (key, _) in self.store.scan_prefix("rebuild", keys::MESSAGE_PREFIX)? {
            let Some((topic, partition, offset)) = keys::parse_message(&key) else {
                continue;
            };
            let entry = max_offsets
                .entry(PartitionKey::new(topic, partition))
                .or_insert(offset);
            if offset > *entry {
                *entry = offset;
            }
        }
        Ok(max_offsets)
    }
}

/// Returns `offset + 1`, or `InvalidArgument` if `offset` is the last one.
pub(crate) fn successor(topic: &str, partition: PartitionId, offset: Offset) -> Result<Offset> {
    offset.checked_next().ok_or_else(|| Error::InvalidArgument {
        name: "offset",
        reason: format!(
            "{topic}/{} is full at offset {}",
            partition.get(),
            offset.get()
        ),
    })
}
