//! Error types for Courier operations.
//!
//! Stores and the catalog return precise failure kinds; the use-case layer
//! decides what a caller sees. Reading past the end of a log is not an error.

use thiserror::Error;

use crate::types::PartitionId;

/// The result type for Courier operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Courier operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The named topic or queue does not exist.
    #[error("{resource} not found: {name}")]
    NotFound {
        /// The type of resource (`topic`, `queue`, `peer`).
        resource: &'static str,
        /// The resource name.
        name: String,
    },

    /// A topic or queue with this name already exists.
    #[error("{resource} already exists: {name}")]
    AlreadyExists {
        /// The type of resource.
        resource: &'static str,
        /// The resource name.
        name: String,
    },

    /// The caller is not the creator of the resource.
    #[error("{user} is not allowed to delete {resource} {name}")]
    Unauthorized {
        /// The type of resource.
        resource: &'static str,
        /// The resource name.
        name: String,
        /// The user that attempted the operation.
        user: String,
    },

    /// The partition index is not below the topic's partition count.
    #[error("partition {} out of range for topic {topic} ({partition_count} partitions)", partition.get())]
    OutOfRange {
        /// The topic.
        topic: String,
        /// The requested partition.
        partition: PartitionId,
        /// The topic's partition count.
        partition_count: u32,
    },

    /// An invalid argument was provided.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: String,
    },

    /// A durable transaction failed. Never retried inside the store.
    #[error("storage error during {operation}: {message}")]
    Storage {
        /// The operation that failed.
        operation: &'static str,
        /// Error description.
        message: String,
    },

    /// A request to a peer failed.
    #[error("replication to {peer} failed: {message}")]
    Replication {
        /// The peer node.
        peer: String,
        /// Error description.
        message: String,
    },
}

impl Error {
    /// Builds a `NotFound` error for a topic.
    #[must_use]
    pub fn topic_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            resource: "topic",
            name: name.into(),
        }
    }

    /// Builds a `NotFound` error for a queue.
    #[must_use]
    pub fn queue_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            resource: "queue",
            name: name.into(),
        }
    }

    /// Builds a `Storage` error from any displayable engine error.
    #[must_use]
    pub fn storage(operation: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation,
            message: error.to_string(),
        }
    }

    /// Returns true for `NotFound`.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
