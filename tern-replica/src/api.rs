//! Collaborator interfaces and manager errors.

use async_trait::async_trait;
use tern_protocol::{
    AlterSyncStateSetRequest, AlterSyncStateSetResponse, ControllerMetaData,
    GetReplicaInfoRequest, GetReplicaInfoResponse, RegisterBrokerRequest, RegisterBrokerResponse,
};
use thiserror::Error;

/// Errors from replica management.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// A controller RPC failed at the transport level.
    #[error("controller request failed: {0}")]
    Controller(String),

    /// No controller self-identified as leader.
    #[error("no controller leader available")]
    NoControllerLeader,

    /// The replication endpoint failed.
    #[error("replication endpoint error: {0}")]
    Ha(#[from] tern_ha::HaError),

    /// Invalid manager configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result type for replica management operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// The broker's view of the controller quorum.
///
/// Implementations own the transport; errors are transport-level only.
/// Controller-side rejections arrive as error codes inside the responses.
#[async_trait]
pub trait ControllerClient: Send + Sync + 'static {
    /// Asks one controller instance to describe itself.
    async fn get_controller_metadata(
        &self,
        controller_address: &str,
    ) -> ReplicaResult<ControllerMetaData>;

    /// Registers this broker with the controller leader.
    async fn register_broker(
        &self,
        leader_address: &str,
        request: RegisterBrokerRequest,
    ) -> ReplicaResult<RegisterBrokerResponse>;

    /// Fetches this broker group's replica metadata.
    async fn get_replica_info(
        &self,
        leader_address: &str,
        request: GetReplicaInfoRequest,
    ) -> ReplicaResult<GetReplicaInfoResponse>;

    /// Proposes a new in-sync replica set.
    async fn alter_sync_state_set(
        &self,
        leader_address: &str,
        request: AlterSyncStateSetRequest,
    ) -> ReplicaResult<AlterSyncStateSetResponse>;
}

/// The broker-level name-service registration hook.
#[async_trait]
pub trait NameService: Send + Sync + 'static {
    /// Re-registers the broker (and its current role) with every name
    /// server.
    async fn register_broker_all(&self, force: bool) -> ReplicaResult<()>;
}
