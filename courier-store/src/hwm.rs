//! In-memory high-water-mark index.
//!
//! Maps each (topic, partition) to the next offset to assign. The durable log
//! is the source of truth; this is a derived cache that can be dropped and
//! rebuilt at any time.

use std::collections::HashMap;

use courier_core::{Offset, PartitionKey, Result};
use parking_lot::Mutex;
use tracing::info;

use crate::log::{successor, LogStore};

/// Next-offset cache for every known partition.
#[derive(Debug, Default)]
pub struct HwmIndex {
    entries: Mutex<HashMap<PartitionKey, Offset>>,
}

impl HwmIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the entry for `key` to `candidate` if it is larger.
    ///
    /// Concurrent updates commute, so a single lock suffices. Returns the
    /// resulting value.
    pub fn track_next_offset(&self, key: &PartitionKey, candidate: Offset) -> Offset {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(current) => {
                if candidate > *current {
                    *current = candidate;
                }
                *current
            }
            None => {
                entries.insert(key.clone(), candidate);
                candidate
            }
        }
    }

    /// Returns the next offset for `key`, or 0 if the partition is unknown.
    #[must_use]
    pub fn next_offset(&self, key: &PartitionKey) -> Offset {
        self.entries.lock().get(key).copied().unwrap_or_default()
    }

    /// Returns a point-in-time copy of every entry.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<PartitionKey, Offset> {
        self.entries.lock().clone()
    }

    /// Returns the number of tracked partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no partition is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Rebuilds the index from every durable record in `log`.
    ///
    /// Each partition with records is set to (max offset seen) + 1. Gaps in
    /// the log are tolerated. Returns the number of partitions found.
    ///
    /// # Errors
    /// Returns `Storage` if the log cannot be scanned, or `InvalidArgument`
    /// if a stored record sits at `u64::MAX`. The index is unchanged then.
    pub fn rebuild(&self, log: &LogStore) -> Result<usize> {
        let rebuilt = log
            .max_offsets()?
            .into_iter()
            .map(|(key, max)| successor(&key.topic, key.partition, max).map(|next| (key, next)))
            .collect::<Result<HashMap<_, _>>>()?;
        let count = rebuilt.len();
        *self.entries.lock() = rebuilt;
        info!(partitions = count, "HWM index rebuilt");
        Ok(count)
    }
}
