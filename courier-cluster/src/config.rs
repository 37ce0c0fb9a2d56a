//! Cluster membership and timing configuration.
//!
//! Membership is a static JSON list of nodes loaded once at startup:
//!
//! ```json
//! {"nodes": [{"id": "n1", "host": "127.0.0.1:7001"},
//!            {"id": "n2", "host": "127.0.0.1:7002"}]}
//! ```
//!
//! A missing file, or a list with a single node, means single-node mode:
//! replication and reconciliation become no-ops.

use std::path::Path;
use std::time::Duration;

use courier_core::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// One entry of the membership file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier.
    pub id: String,
    /// Peer protocol address (`host:port`).
    pub host: String,
}

/// The membership file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Nodes in configured order.
    pub nodes: Vec<NodeConfig>,
}

impl ClusterConfig {
    /// Parses a membership document.
    ///
    /// # Errors
    /// Returns `Parse` for malformed JSON or an invalid node list.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the membership file at `path`. Returns `None` if it does not exist.
    ///
    /// # Errors
    /// Returns `Io` if the file exists but cannot be read, or `Parse` if it is
    /// invalid.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    /// Validates the node list.
    ///
    /// # Errors
    /// Returns `InvalidNode` for an empty id or host, or a duplicate id.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id.is_empty() {
                return Err(ConfigError::InvalidNode {
                    message: format!("node {i} has an empty id"),
                });
            }
            if node.host.is_empty() {
                return Err(ConfigError::InvalidNode {
                    message: format!("node {} has an empty host", node.id),
                });
            }
            if self.nodes[..i].iter().any(|n| n.id == node.id) {
                return Err(ConfigError::InvalidNode {
                    message: format!("duplicate node id {}", node.id),
                });
            }
        }
        Ok(())
    }
}

/// This process's view of the cluster: its own id plus every node in
/// configured order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    self_id: NodeId,
    nodes: Vec<NodeConfig>,
}

impl Membership {
    /// Membership containing only this node.
    #[must_use]
    pub const fn single_node(self_id: NodeId) -> Self {
        Self {
            self_id,
            nodes: Vec::new(),
        }
    }

    /// Builds membership from a parsed config.
    ///
    /// # Errors
    /// Returns `UnknownSelf` if the config lists several nodes but not this one.
    pub fn from_config(self_id: NodeId, config: ClusterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.nodes.len() > 1 && !config.nodes.iter().any(|n| n.id == self_id.as_str()) {
            return Err(ConfigError::UnknownSelf {
                node_id: self_id.to_string(),
            });
        }
        Ok(Self {
            self_id,
            nodes: config.nodes,
        })
    }

    /// Loads membership from `path`, falling back to single-node mode if the
    /// file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but is unreadable or invalid.
    pub fn load(self_id: NodeId, path: &Path) -> Result<Self, ConfigError> {
        match ClusterConfig::load(path)? {
            Some(config) => {
                let membership = Self::from_config(self_id, config)?;
                info!(
                    node_id = %membership.self_id,
                    nodes = membership.nodes.len(),
                    path = %path.display(),
                    "Cluster membership loaded"
                );
                Ok(membership)
            }
            None => {
                info!(path = %path.display(), "No cluster config, running single-node");
                Ok(Self::single_node(self_id))
            }
        }
    }

    /// Returns this node's id.
    #[must_use]
    pub const fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Returns every configured node in order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    /// Returns true if more than one node is configured.
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        self.nodes.len() > 1
    }

    /// Returns the other nodes, in configured order.
    pub fn peers(&self) -> impl Iterator<Item = &NodeConfig> + '_ {
        self.nodes
            .iter()
            .filter(move |n| n.id != self.self_id.as_str())
    }

    /// Returns this node's configured peer address, if any.
    #[must_use]
    pub fn self_host(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.id == self.self_id.as_str())
            .map(|n| n.host.as_str())
    }

    /// Returns every node id in configured order (just self when single-node).
    #[must_use]
    pub fn order(&self) -> Vec<NodeId> {
        if self.nodes.is_empty() {
            return vec![self.self_id.clone()];
        }
        self.nodes.iter().map(|n| NodeId::new(n.id.clone())).collect()
    }
}

/// Timing configuration for replication and reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterTiming {
    /// Timeout for establishing a peer connection.
    pub connect_timeout: Duration,
    /// Timeout for one request/response exchange.
    pub request_timeout: Duration,
    /// Timeout for a reachability probe.
    pub probe_timeout: Duration,
    /// Interval between reconciliation ticks.
    pub reconcile_interval: Duration,
    /// Number of offsets requested per catch-up page.
    pub catch_up_page: u64,
}

impl Default for ClusterTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(30),
            catch_up_page: 1000,
        }
    }
}

impl ClusterTiming {
    /// Creates timing config suitable for testing (faster timeouts).
    #[must_use]
    pub const fn fast_for_testing() -> Self {
        Self {
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(100),
            reconcile_interval: Duration::from_millis(50),
            catch_up_page: 4,
        }
    }

    /// Sets the reconcile interval.
    #[must_use]
    pub const fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Sets the catch-up page size.
    #[must_use]
    pub const fn with_catch_up_page(mut self, page: u64) -> Self {
        self.catch_up_page = page;
        self
    }

    /// Validates the timing configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero()
            || self.request_timeout.is_zero()
            || self.probe_timeout.is_zero()
        {
            return Err(ConfigError::InvalidTiming {
                message: "timeouts must be positive".to_string(),
            });
        }
        if self.reconcile_interval.is_zero() {
            return Err(ConfigError::InvalidTiming {
                message: "reconcile_interval must be positive".to_string(),
            });
        }
        if self.catch_up_page == 0 {
            return Err(ConfigError::InvalidTiming {
                message: "catch_up_page must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The membership file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The membership document is malformed.
    #[error("invalid cluster config: {message}")]
    Parse {
        /// Error description.
        message: String,
    },

    /// A node entry is invalid.
    #[error("invalid node: {message}")]
    InvalidNode {
        /// Error description.
        message: String,
    },

    /// This node is missing from a multi-node membership list.
    #[error("node {node_id} is not in the cluster config")]
    UnknownSelf {
        /// This node's id.
        node_id: String,
    },

    /// Invalid timing configuration.
    #[error("invalid timing: {message}")]
    InvalidTiming {
        /// Error description.
        message: String,
    },
}
