//! Strongly-typed identifiers for Courier entities.
//!
//! Explicit types prevent bugs from mixing up a partition index with an
//! offset, or a node id with a producer name.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::limits::Limits;

/// Macro to generate strongly-typed numeric wrappers.
///
/// Each wrapper provides:
/// - Type safety (can't mix `PartitionId` with `Offset`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as the raw integer)
macro_rules! define_id {
    ($name:ident, $raw:ty, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name($raw);

        impl $name {
            /// Creates a new value from the raw integer.
            #[inline]
            #[must_use]
            pub const fn new(value: $raw) -> Self {
                Self(value)
            }

            /// Returns the raw integer value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> $raw {
                self.0
            }

            /// Returns the next value in sequence.
            ///
            /// # Panics
            /// Panics if the value would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < <$raw>::MAX, "ID overflow");
                Self(self.0 + 1)
            }

            /// Returns the next value in sequence, or `None` at the maximum.
            #[inline]
            #[must_use]
            pub const fn checked_next(self) -> Option<Self> {
                match self.0.checked_add(1) {
                    Some(value) => Some(Self(value)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<$raw> for $name {
            fn from(value: $raw) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for $raw {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(PartitionId, u32, "partition", "Index of a partition within a topic.");
define_id!(Offset, u64, "offset", "Position of a message within a partition log.");

/// Identifier of a broker process in the cluster membership file (e.g. `n1`).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Unique message identifier.
///
/// Assigned once when a message is first stored and carried unchanged through
/// replication and redelivery. The nil id means "not yet assigned".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The unassigned id.
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns true if the id has not been assigned.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Builds an id from its 16 raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16 raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidArgument {
                name: "message_id",
                reason: e.to_string(),
            })
    }
}

/// A (topic, partition) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    /// Topic name.
    pub topic: String,
    /// Partition index within the topic.
    pub partition: PartitionId,
}

impl PartitionKey {
    /// Creates a partition key.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition.get())
    }
}

/// Validates a topic, queue or consumer-group name.
///
/// Names are used verbatim inside `:`-separated storage keys, so they are
/// restricted to ASCII alphanumerics, `-`, `_` and `.`.
///
/// # Errors
/// Returns `InvalidArgument` if the name is empty, too long, or contains a
/// disallowed character.
pub fn validate_name(kind: &'static str, name: &str, limits: &Limits) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument {
            name: kind,
            reason: "must not be empty".to_string(),
        });
    }
    if name.len() > limits.max_name_bytes as usize {
        return Err(Error::InvalidArgument {
            name: kind,
            reason: format!("longer than {} bytes", limits.max_name_bytes),
        });
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(Error::InvalidArgument {
            name: kind,
            reason: format!("contains disallowed character {bad:?}"),
        });
    }
    Ok(())
}
