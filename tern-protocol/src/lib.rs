//! Tern Protocol - request and response types for the controller API.
//!
//! These are the payloads brokers exchange with the controller quorum:
//! registration, replica-info polling, ISR alteration and master election.
//! Field names are part of the contract; the surrounding transport framing
//! is out of scope and supplied by the host process.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod codes;
mod headers;

pub use codes::ErrorCode;
pub use headers::{
    AlterSyncStateSetRequest, AlterSyncStateSetResponse, ControllerMetaData, ElectMasterRequest,
    ElectMasterResponse, GetReplicaInfoRequest, GetReplicaInfoResponse, RegisterBrokerRequest,
    RegisterBrokerResponse, SyncStateSet,
};
