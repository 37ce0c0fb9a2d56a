//! Courier Tests - Multi-component integration tests for Courier.
//!
//! ## Test Organization
//!
//! **Integration Tests** (`*_tests.rs`):
//! - `store_tests`: log, HWM and catalog behavior across restarts
//! - `queue_tests`: delivery, acknowledgment and redelivery
//! - `cluster_tests`: broadcast, catch-up and reconciliation between nodes,
//!   in-process and over TCP
//!
//! **Support Modules**:
//! - `local_peer`: an in-process peer with fault switches, and a node's
//!   store components in a temporary directory
//!
//! ## Naming Conventions
//!
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod local_peer;

// Integration test modules (multi-component tests).
#[cfg(test)]
mod cluster_tests;
