//! Node error types.

use courier_cluster::{ConfigError, TransportError};

/// Errors raised while starting or stopping a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Invalid cluster or runtime configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The replica server could not be started.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A store or catalog operation failed.
    #[error(transparent)]
    Broker(#[from] courier_core::Error),

    /// Clustered, but no peer address is configured for this node.
    #[error("no peer address configured for node {node_id}")]
    MissingSelfHost {
        /// This node's id.
        node_id: String,
    },
}

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;
