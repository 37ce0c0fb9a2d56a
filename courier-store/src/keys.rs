//! Durable key layout.
//!
//! Keys are `:`-separated UTF-8. Numbers are zero-padded to a fixed width so
//! lexicographic order equals numeric order and a range scan over a
//! partition's message keys yields messages in offset order.
//!
//! | Key | Value |
//! |---|---|
//! | `m:{topic}:{partition:010}:{offset:020}` | message |
//! | `h:{topic}:{partition:010}` | next offset |
//! | `q:{queue}:{generation:020}` | pending message |
//! | `g:{queue}` | next pending generation |
//! | `f:{queue}:{id}` | in-flight expiry (unix millis) |
//! | `b:{queue}:{id}` | in-flight message body |
//! | `t:{topic}` | topic record |
//! | `u:{queue}` | queue record |
//! | `o:{group}:{topic}:{partition:010}` | committed offset |

use courier_core::{MessageId, Offset, PartitionId};

/// Prefix of all message keys.
pub const MESSAGE_PREFIX: &str = "m:";
/// Prefix of all in-flight expiry keys.
pub const INFLIGHT_PREFIX: &str = "f:";
/// Prefix of all topic records.
pub const TOPIC_PREFIX: &str = "t:";
/// Prefix of all queue records.
pub const QUEUE_PREFIX: &str = "u:";

/// Key of one message.
#[must_use]
pub fn message(topic: &str, partition: PartitionId, offset: Offset) -> String {
    format!("m:{topic}:{:010}:{:020}", partition.get(), offset.get())
}

/// Prefix covering every message of one partition.
#[must_use]
pub fn message_partition_prefix(topic: &str, partition: PartitionId) -> String {
    format!("m:{topic}:{:010}:", partition.get())
}

/// Parses a message key into (topic, partition, offset).
#[must_use]
pub fn parse_message(key: &[u8]) -> Option<(String, PartitionId, Offset)> {
    let key = std::str::from_utf8(key).ok()?;
    let rest = key.strip_prefix(MESSAGE_PREFIX)?;
    let mut parts = rest.split(':');
    let topic = parts.next()?;
    let partition = parts.next()?.parse().ok()?;
    let offset = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((topic.to_string(), PartitionId::new(partition), Offset::new(offset)))
}

/// Key caching the next offset of one partition.
#[must_use]
pub fn hwm(topic: &str, partition: PartitionId) -> String {
    format!("h:{topic}:{:010}", partition.get())
}

/// Key of one pending queue entry.
#[must_use]
pub fn pending(queue: &str, generation: u64) -> String {
    format!("q:{queue}:{generation:020}")
}

/// Prefix covering every pending entry of a queue.
#[must_use]
pub fn pending_prefix(queue: &str) -> String {
    format!("q:{queue}:")
}

/// Key of a queue's next pending generation.
#[must_use]
pub fn generation(queue: &str) -> String {
    format!("g:{queue}")
}

/// Key of an in-flight expiry.
#[must_use]
pub fn inflight_expiry(queue: &str, id: MessageId) -> String {
    format!("f:{queue}:{id}")
}

/// Prefix covering every in-flight expiry of a queue.
#[must_use]
pub fn inflight_prefix(queue: &str) -> String {
    format!("f:{queue}:")
}

/// Parses an in-flight expiry key into (queue, id).
#[must_use]
pub fn parse_inflight(key: &[u8]) -> Option<(String, MessageId)> {
    let key = std::str::from_utf8(key).ok()?;
    let rest = key.strip_prefix(INFLIGHT_PREFIX)?;
    let (queue, id) = rest.split_once(':')?;
    Some((queue.to_string(), id.parse().ok()?))
}

/// Key of an in-flight message body.
#[must_use]
pub fn inflight_body(queue: &str, id: MessageId) -> String {
    format!("b:{queue}:{id}")
}

/// Key of a topic record.
#[must_use]
pub fn topic(name: &str) -> String {
    format!("t:{name}")
}

/// Key of a queue record.
#[must_use]
pub fn queue(name: &str) -> String {
    format!("u:{name}")
}

/// Key of a consumer group's committed offset.
#[must_use]
pub fn group_offset(group: &str, topic: &str, partition: PartitionId) -> String {
    format!("o:{group}:{topic}:{:010}", partition.get())
}

/// Returns the smallest key greater than every key starting with `prefix`.
///
/// Prefixes here always end in `:` (0x3A), so bumping the last byte to `;`
/// stays valid UTF-8.
#[must_use]
pub fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.to_string();
    if let Some(last) = end.pop() {
        end.push(char::from_u32(u32::from(last) + 1).unwrap_or(char::MAX));
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_keys_sort_by_offset() {
        let p = PartitionId::new(0);
        let a = message("t", p, Offset::new(9));
        let b = message("t", p, Offset::new(10));
        assert!(a < b);
        assert!(a.starts_with(&message_partition_prefix("t", p)));
    }

    #[test]
    fn test_parse_message_key() {
        let key = message("orders", PartitionId::new(3), Offset::new(17));
        let (topic, partition, offset) = parse_message(key.as_bytes()).unwrap();
        assert_eq!(topic, "orders");
        assert_eq!(partition.get(), 3);
        assert_eq!(offset.get(), 17);
        assert!(parse_message(b"h:orders:0000000003").is_none());
        assert!(parse_message(b"m:orders:x:1").is_none());
    }

    #[test]
    fn test_parse_inflight_key() {
        let id = MessageId::generate();
        let key = inflight_expiry("jobs", id);
        assert_eq!(parse_inflight(key.as_bytes()), Some(("jobs".to_string(), id)));
        assert!(parse_inflight(b"f:jobs:not-an-id").is_none());
    }

    #[test]
    fn test_prefix_end_bounds_prefix() {
        let prefix = message_partition_prefix("t", PartitionId::new(1));
        let end = prefix_end(&prefix);
        let inside = message("t", PartitionId::new(1), Offset::new(u64::MAX));
        let next_partition = message("t", PartitionId::new(2), Offset::new(0));
        assert!(inside < end);
        assert!(next_partition > end);
    }

    #[test]
    fn test_partition_prefix_does_not_match_longer_topic() {
        let prefix = message_partition_prefix("ab", PartitionId::new(0));
        let other = message("abc", PartitionId::new(0), Offset::new(0));
        assert!(!other.starts_with(&prefix));
    }
}
