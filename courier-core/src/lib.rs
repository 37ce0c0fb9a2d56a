//! Courier Core - Strongly-typed identifiers, messages and limits for Courier.
//!
//! This crate holds the vocabulary shared by every other Courier crate. It
//! has no storage, network or runtime dependencies.
//!
//! # Contents
//!
//! - **Identifiers**: `NodeId`, `PartitionId`, `Offset`, `MessageId`,
//!   `PartitionKey`. Distinct types prevent mixing a partition index with an
//!   offset.
//! - **Messages**: the immutable `Message` record and its binary encoding,
//!   shared by the durable store and the peer wire protocol.
//! - **Errors**: the broker error taxonomy (`NotFound`, `AlreadyExists`,
//!   `Unauthorized`, `OutOfRange`, storage and replication failures).
//! - **Limits**: explicit bounds on payloads, names, partitions and batches.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod message;
mod partition;
mod types;

pub use error::{Error, Result};
pub use limits::Limits;
pub use message::{Message, MessageDecodeError, MessageEncodeError};
pub use partition::partition_for_key;
pub use types::{validate_name, MessageId, NodeId, Offset, PartitionId, PartitionKey};
