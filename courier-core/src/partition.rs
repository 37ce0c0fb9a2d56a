//! Key to partition mapping.

use xxhash_rust::xxh3::xxh3_64;

use crate::types::PartitionId;

/// Selects the partition for a producer key.
///
/// Single-partition (or degenerate zero-partition) topics always map to
/// partition 0. Otherwise the key's xxh3 hash is reduced modulo the count, so
/// equal keys always land in the same partition.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // Result is < partition_count.
pub fn partition_for_key(key: &str, partition_count: u32) -> PartitionId {
    if partition_count <= 1 {
        return PartitionId::new(0);
    }
    let hash = xxh3_64(key.as_bytes());
    PartitionId::new((hash % u64::from(partition_count)) as u32)
}
