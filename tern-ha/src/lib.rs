//! Tern HA - the replication endpoints of an auto-switch broker.
//!
//! A master serves every slave over one TCP channel each: the slave opens
//! the channel, the two sides reconcile their epoch histories to find the
//! last byte-identical point, the slave truncates anything beyond it, and
//! the master then streams the commit log while the slave reports how far
//! it has durably appended. Reported offsets feed the master's in-sync
//! tracking and its confirm offset (the commit watermark).
//!
//! Role changes arrive from the replica state manager; this crate never
//! talks to the controller itself.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod codec;
mod client;
mod config;
mod connection;
mod error;
mod service;
mod store;

pub use config::HaConfig;
pub use error::{HaError, HaResult};
pub use service::{HaRole, HaService};
pub use store::{CommitLog, MemoryCommitLog};
