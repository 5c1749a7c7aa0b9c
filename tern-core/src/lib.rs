//! Tern Core - Strongly-typed identifiers shared across the Tern broker.
//!
//! This crate provides the epoch and broker-id types used by the
//! replication protocol, the replica state machine and the controller.
//! It deliberately contains no I/O: network, storage and scheduling live
//! in the crates that own them.
//!
//! # Design Principles
//!
//! - **Strongly-typed counters**: a master epoch is not an ISR epoch
//! - **Explicit widths**: epochs are u32, broker ids are i64 (wire widths)
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod limits;
mod state;
mod types;

pub use limits::Limits;
pub use state::HaConnectionState;
pub use types::{BrokerId, Epoch, SyncEpoch};
