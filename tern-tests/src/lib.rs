//! Tern Tests - cross-crate scenarios for the replication core.
//!
//! The unit tests live with their crates; this crate wires real components
//! together: live master/slave endpoints over loopback TCP, and replica
//! state managers driven by the real controller registry. Tests are
//! organized by component:
//!
//! - `harness`: shared fixtures (in-memory brokers, in-process controller)
//! - `replication_tests`: handshake truncation, divergence, ISR tracking
//! - `failover_tests`: manager-driven role switches end to end
//! - `property_tests`: randomized invariant checks

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod harness;

// Test modules (only compiled for tests).
#[cfg(test)]
mod failover_tests;
#[cfg(test)]
mod property_tests;
