//! System limits and configuration bounds.
//!
//! Every payload, name, batch and frame has an explicit maximum size. This
//! prevents unbounded growth and makes the broker predictable.

/// Fixed bytes of an encoded message besides its variable fields.
const MESSAGE_OVERHEAD: u64 = 16 + 2 + 4 + 8 + 4 + 2 + 4;

/// Tag and count bytes of a batch frame body.
const FRAME_OVERHEAD: u64 = 1 + 4;

/// System-wide limits for Courier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Message limits.
    /// Maximum size of a message payload in bytes.
    pub max_payload_bytes: u32,
    /// Maximum size of a producer key in bytes.
    pub max_key_bytes: u32,
    /// Maximum size of a producer identity in bytes.
    pub max_producer_bytes: u32,

    // Catalog limits.
    /// Maximum length of a topic, queue or group name in bytes.
    pub max_name_bytes: u32,
    /// Maximum number of partitions per topic.
    pub max_partitions: u32,

    // Replication limits.
    /// Maximum number of messages in one replicated batch.
    pub max_batch_messages: u32,
    /// Maximum size of a peer protocol frame in bytes.
    pub max_frame_bytes: u32,
    /// Maximum number of messages returned by an unbounded range read.
    pub max_range_messages: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Messages: 1MB payload, 4KB key, 1KB producer.
            max_payload_bytes: 1024 * 1024,
            max_key_bytes: 4 * 1024,
            max_producer_bytes: 1024,

            // Catalog: Kafka-compatible name length, 1024 partitions.
            max_name_bytes: 249,
            max_partitions: 1024,

            // Replication: 10k messages/batch, 64MB frames, 1M range.
            max_batch_messages: 10_000,
            max_frame_bytes: 64 * 1024 * 1024,
            max_range_messages: 1_000_000,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_payload_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_payload_bytes",
                reason: "must be positive".to_string(),
            });
        }

        // Producer and name lengths travel as u16 prefixes.
        if self.max_producer_bytes > u32::from(u16::MAX) || self.max_name_bytes > u32::from(u16::MAX)
        {
            return Err(crate::Error::InvalidArgument {
                name: "max_producer_bytes",
                reason: format!("producer and name limits must be <= {}", u16::MAX),
            });
        }

        // A frame must hold at least one maximal message.
        if u64::from(self.max_frame_bytes) < self.max_message_bytes() + FRAME_OVERHEAD {
            return Err(crate::Error::InvalidArgument {
                name: "max_frame_bytes",
                reason: format!(
                    "must be >= {} to hold one maximal message",
                    self.max_message_bytes() + FRAME_OVERHEAD
                ),
            });
        }

        if self.max_partitions == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_partitions",
                reason: "must be positive".to_string(),
            });
        }

        if self.max_batch_messages == 0 || self.max_range_messages == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_batch_messages",
                reason: "batch and range limits must be positive".to_string(),
            });
        }

        Ok(())
    }
}

impl Limits {
    /// Returns the encoded size of the largest message these limits admit.
    #[must_use]
    pub fn max_message_bytes(&self) -> u64 {
        MESSAGE_OVERHEAD
            + u64::from(self.max_name_bytes)
            + u64::from(self.max_key_bytes)
            + u64::from(self.max_producer_bytes)
            + u64::from(self.max_payload_bytes)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        let limits = Limits::new();
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_invalid_payload_size() {
        let mut limits = Limits::new();
        limits.max_payload_bytes = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_frame_smaller_than_message() {
        let mut limits = Limits::new();
        limits.max_frame_bytes = 1024;
        assert!(limits.validate().is_err());

        let mut limits = Limits::new();
        limits.max_frame_bytes = u32::try_from(limits.max_message_bytes()).unwrap();
        assert!(limits.validate().is_err());
        limits.max_frame_bytes += 5;
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_producer_limit_fits_length_prefix() {
        let mut limits = Limits::new();
        limits.max_producer_bytes = 70_000;
        assert!(limits.validate().is_err());
    }
}
