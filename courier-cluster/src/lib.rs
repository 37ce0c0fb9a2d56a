//! Courier Cluster - Peer replication for the Courier broker.
//!
//! Every node holds a full replica of every partition. Newly appended
//! messages are broadcast to peers without waiting; a periodic reconciler
//! pulls anything a reachable peer has beyond the local HWM.
//!
//! # Components
//!
//! - [`Membership`] and [`ClusterTiming`]: static node list and timeouts.
//! - [`codec`]: length-prefixed peer protocol frames.
//! - [`PeerClient`] and [`ReplicaServer`]: TCP transport.
//! - [`ReplicaPeer`]: the seam over a remote node; [`TcpPeer`] implements it.
//! - [`Fanout`]: broadcast and catch-up against every peer.
//! - [`ReplicaService`]: applies inbound batches at their original offsets.
//! - [`PeerSelector`]: leader and source-peer choice.
//! - [`Reconciler`]: the timer-driven repair loop.
//!
//! A single-node membership makes broadcast, catch-up and reconciliation
//! no-ops, so the same wiring runs standalone.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod codec;
mod config;
mod fanout;
mod leader;
mod peer;
mod reconciler;
mod replica;
mod transport;

pub use codec::{CodecError, CodecResult, ReplicateAck, Request, Response, MAX_FRAME_SIZE};
pub use config::{ClusterConfig, ClusterTiming, ConfigError, Membership, NodeConfig};
pub use fanout::{Broadcast, CatchUpReport, Fanout};
pub use leader::{FirstReachable, PeerSelector};
pub use peer::{ReplicaPeer, TcpPeer};
pub use reconciler::{ReconcileReport, Reconciler};
pub use replica::ReplicaService;
pub use transport::{PeerClient, ReplicaServer, TransportError, TransportResult};
