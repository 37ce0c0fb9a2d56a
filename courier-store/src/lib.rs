//! Courier Store - Durable storage for the Courier broker.
//!
//! All state lives in one embedded transactional keyspace. The durable store
//! is the sole source of truth; the in-memory [`HwmIndex`] is a cache derived
//! from it.
//!
//! # Components
//!
//! - [`LogStore`]: offset-ordered append log per (topic, partition), with an
//!   idempotent offset-preserving path for replicated writes.
//! - [`QueueStore`]: FIFO queues with in-flight tracking and timed
//!   redelivery.
//! - [`Catalog`]: topics, queues, creators and consumer-group offsets.
//! - [`HwmIndex`]: next offset to assign per partition, rebuilt at startup.
//!
//! # Example
//!
//! ```ignore
//! let store = Store::open(&StoreConfig::new("/var/lib/courier"))?;
//! let hwm = Arc::new(HwmIndex::new());
//! let log = LogStore::new(store.clone(), Arc::clone(&hwm));
//! hwm.rebuild(&log)?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod catalog;
mod db;
mod hwm;
pub mod keys;
mod log;
mod queue;

pub use catalog::{Catalog, QueueInfo, TopicInfo};
pub use db::{Store, StoreConfig, FORMAT_VERSION, PARTITION_NAME};
pub use hwm::HwmIndex;
pub use log::{AppendOutcome, LogStore};
pub use queue::{now_millis, QueueConfig, QueueStore, RedeliveryPayload, PLACEHOLDER_PAYLOAD};
