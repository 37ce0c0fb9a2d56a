//! Courier Server - Broker facade and node bootstrap.
//!
//! [`Node`] opens the stores, rebuilds the HWM index, starts the background
//! tasks and, when clustered, the replica server and reconciler. [`Broker`]
//! exposes the topic and queue use cases on top of them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod error;
mod node;

pub use broker::{Broker, PublishReceipt};
pub use error::{NodeError, NodeResult};
pub use node::{Node, NodeOptions};
