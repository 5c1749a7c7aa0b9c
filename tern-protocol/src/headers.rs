//! Controller request and response payloads.
//!
//! Addresses are plain `host:port` strings; the optional `*_ha_address`
//! fields carry the replication listener, which is a different port from
//! the broker's client-facing address.

use std::collections::{HashMap, HashSet};

use tern_core::{BrokerId, Epoch, SyncEpoch};

use crate::codes::ErrorCode;

/// The in-sync replica set and its version, carried as a response body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncStateSet {
    /// Addresses of the in-sync replicas.
    pub sync_state_set: HashSet<String>,
    /// Version of the set; any change increments it.
    pub sync_state_set_epoch: SyncEpoch,
}

impl SyncStateSet {
    /// Creates a sync state set body.
    #[must_use]
    pub const fn new(sync_state_set: HashSet<String>, sync_state_set_epoch: SyncEpoch) -> Self {
        Self {
            sync_state_set,
            sync_state_set_epoch,
        }
    }
}

/// Registers a replica with the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBrokerRequest {
    /// Cluster the broker group belongs to.
    pub cluster_name: String,
    /// Broker group name; all replicas of one log share it.
    pub broker_name: String,
    /// The replica's client-facing address.
    pub broker_address: String,
    /// The replica's replication listener, if it exposes one.
    pub broker_ha_address: Option<String>,
}

impl RegisterBrokerRequest {
    /// Creates a register request.
    #[must_use]
    pub fn new(
        cluster_name: impl Into<String>,
        broker_name: impl Into<String>,
        broker_address: impl Into<String>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            broker_name: broker_name.into(),
            broker_address: broker_address.into(),
            broker_ha_address: None,
        }
    }

    /// Attaches the replication listener address.
    #[must_use]
    pub fn with_ha_address(mut self, ha_address: impl Into<String>) -> Self {
        self.broker_ha_address = Some(ha_address.into());
        self
    }
}

/// Response to [`RegisterBrokerRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegisterBrokerResponse {
    /// Id allocated (or previously allocated) to the registering address.
    pub broker_id: BrokerId,
    /// Current master address, empty if the group has none.
    pub master_address: String,
    /// Current master epoch.
    pub master_epoch: Epoch,
    /// Current sync-state-set epoch.
    pub sync_state_set_epoch: SyncEpoch,
    /// The master's replication listener, if known.
    pub master_ha_address: Option<String>,
}

/// Asks the controller for the replica metadata of one broker group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetReplicaInfoRequest {
    /// Broker group to look up.
    pub broker_name: String,
    /// The requester's address, used to resolve its broker id.
    pub broker_address: String,
}

impl GetReplicaInfoRequest {
    /// Creates a replica-info request.
    #[must_use]
    pub fn new(broker_name: impl Into<String>, broker_address: impl Into<String>) -> Self {
        Self {
            broker_name: broker_name.into(),
            broker_address: broker_address.into(),
        }
    }
}

/// Response to [`GetReplicaInfoRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetReplicaInfoResponse {
    /// Current master address, empty if the group has none.
    pub master_address: String,
    /// Current master epoch.
    pub master_epoch: Epoch,
    /// The requester's broker id, [`BrokerId::UNKNOWN`] if unregistered.
    pub broker_id: BrokerId,
    /// The master's replication listener, if known.
    pub master_ha_address: Option<String>,
    /// Outcome of the lookup.
    pub error_code: ErrorCode,
    /// The current in-sync replica set.
    pub sync_state_set: SyncStateSet,
}

/// Master-initiated ISR change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterSyncStateSetRequest {
    /// Broker group being altered.
    pub broker_name: String,
    /// The requester, which must be the current master.
    pub master_address: String,
    /// The requester's view of the master epoch.
    pub master_epoch: Epoch,
    /// Proposed in-sync replica set.
    pub new_sync_state_set: HashSet<String>,
    /// The requester's view of the sync-state-set epoch.
    pub sync_state_set_epoch: SyncEpoch,
}

impl AlterSyncStateSetRequest {
    /// Creates an alter request.
    #[must_use]
    pub fn new(
        broker_name: impl Into<String>,
        master_address: impl Into<String>,
        master_epoch: Epoch,
        new_sync_state_set: HashSet<String>,
        sync_state_set_epoch: SyncEpoch,
    ) -> Self {
        Self {
            broker_name: broker_name.into(),
            master_address: master_address.into(),
            master_epoch,
            new_sync_state_set,
            sync_state_set_epoch,
        }
    }
}

/// Response to [`AlterSyncStateSetRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlterSyncStateSetResponse {
    /// Outcome; non-zero means the set was not changed.
    pub error_code: ErrorCode,
    /// The authoritative set after the request.
    pub sync_state_set: SyncStateSet,
}

/// Asks the controller to elect a new master for a broker group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectMasterRequest {
    /// Broker group to elect for.
    pub broker_name: String,
}

impl ElectMasterRequest {
    /// Creates an elect request.
    #[must_use]
    pub fn new(broker_name: impl Into<String>) -> Self {
        Self {
            broker_name: broker_name.into(),
        }
    }
}

/// Response to [`ElectMasterRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ElectMasterResponse {
    /// Stable identity of the elected master (`<group>-<broker id>`).
    pub new_master_identity: String,
    /// Address of the elected master, empty when the election failed.
    pub new_master_address: String,
    /// Master epoch after the election.
    pub master_epoch: Epoch,
    /// Sync-state-set epoch after the election.
    pub sync_state_set_epoch: SyncEpoch,
    /// All registered replicas: identity to `(broker id, address)`.
    pub broker_table: HashMap<String, (BrokerId, String)>,
    /// Outcome of the election.
    pub error_code: ErrorCode,
}

/// Self-description of one controller instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControllerMetaData {
    /// True if this instance is the quorum leader.
    pub is_leader: bool,
    /// Addresses of every controller in the quorum.
    pub peers: Vec<String>,
}
