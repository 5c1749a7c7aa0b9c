//! The replica metadata table and its request handlers.
//!
//! Handlers take `&self` and return a [`ControllerResult`]; only
//! [`ReplicaRegistry::apply_event`] writes. Validation failures surface as
//! an [`ErrorCode`] in the response with no events, never as an error.

use std::collections::{HashMap, HashSet};

use tern_core::{BrokerId, Epoch, SyncEpoch};
use tern_protocol::{
    AlterSyncStateSetRequest, AlterSyncStateSetResponse, ElectMasterRequest, ElectMasterResponse,
    ErrorCode, GetReplicaInfoRequest, GetReplicaInfoResponse, RegisterBrokerRequest,
    RegisterBrokerResponse, SyncStateSet,
};
use tracing::{info, warn};

use crate::event::{ControllerResult, Event};

/// One registered replica address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReplicaIdent {
    broker_id: BrokerId,
    ha_address: Option<String>,
}

/// Authoritative metadata for one broker group.
#[derive(Debug, Clone)]
struct ReplicaInfo {
    cluster_name: String,
    master_address: String,
    master_epoch: Epoch,
    sync_state_set: HashSet<String>,
    sync_state_set_epoch: SyncEpoch,
    replicas: HashMap<String, ReplicaIdent>,
    next_broker_id: i64,
}

impl ReplicaInfo {
    fn new(cluster_name: String) -> Self {
        Self {
            cluster_name,
            master_address: String::new(),
            master_epoch: Epoch::new(0),
            sync_state_set: HashSet::new(),
            sync_state_set_epoch: SyncEpoch::new(0),
            replicas: HashMap::new(),
            next_broker_id: 1,
        }
    }

    fn broker_id_of(&self, address: &str) -> BrokerId {
        self.replicas
            .get(address)
            .map_or(BrokerId::UNKNOWN, |ident| ident.broker_id)
    }

    fn ha_address_of(&self, address: &str) -> Option<String> {
        self.replicas.get(address)?.ha_address.clone()
    }

    fn sync_state_set_body(&self) -> SyncStateSet {
        SyncStateSet::new(self.sync_state_set.clone(), self.sync_state_set_epoch)
    }

    fn identity_of(&self, broker_name: &str, address: &str) -> String {
        format!("{broker_name}-{}", self.broker_id_of(address).get())
    }
}

/// The controller-side replica metadata state machine.
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    groups: HashMap<String, ReplicaInfo>,
}

impl ReplicaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles a broker registration.
    ///
    /// A brand-new group elects the registering address as first master; a
    /// replica rejoining a masterless group is re-elected iff it is still
    /// in the sync state set (it provably holds the committed log).
    /// Registering a known `(group, address)` pair is idempotent.
    #[must_use]
    pub fn register_broker(
        &self,
        request: &RegisterBrokerRequest,
    ) -> ControllerResult<RegisterBrokerResponse> {
        let mut events = Vec::new();
        let mut response = RegisterBrokerResponse::default();

        match self.groups.get(&request.broker_name) {
            None => {
                // First replica of a new group: register and elect it.
                let assigned = BrokerId::new(1);
                events.push(Event::BrokerRegistered {
                    cluster_name: request.cluster_name.clone(),
                    broker_name: request.broker_name.clone(),
                    broker_address: request.broker_address.clone(),
                    broker_ha_address: request.broker_ha_address.clone(),
                    assigned_id: assigned,
                });
                events.push(Event::MasterElected {
                    broker_name: request.broker_name.clone(),
                    new_master_address: request.broker_address.clone(),
                    new_master_elected: true,
                });

                response.broker_id = assigned;
                response.master_address = request.broker_address.clone();
                response.master_epoch = Epoch::new(1);
                response.sync_state_set_epoch = SyncEpoch::new(1);
                response.master_ha_address = request.broker_ha_address.clone();
            }
            Some(info) => {
                let broker_id = match info.replicas.get(&request.broker_address) {
                    Some(ident) => ident.broker_id,
                    None => {
                        let assigned = BrokerId::new(info.next_broker_id);
                        events.push(Event::BrokerRegistered {
                            cluster_name: request.cluster_name.clone(),
                            broker_name: request.broker_name.clone(),
                            broker_address: request.broker_address.clone(),
                            broker_ha_address: request.broker_ha_address.clone(),
                            assigned_id: assigned,
                        });
                        assigned
                    }
                };

                response.broker_id = broker_id;
                response.master_address = info.master_address.clone();
                response.master_epoch = info.master_epoch;
                response.sync_state_set_epoch = info.sync_state_set_epoch;
                response.master_ha_address = info.ha_address_of(&info.master_address);

                if info.master_address.is_empty()
                    && info.sync_state_set.contains(&request.broker_address)
                {
                    // The group lost its master; this replica held the full
                    // committed log, so it takes over.
                    events.push(Event::MasterElected {
                        broker_name: request.broker_name.clone(),
                        new_master_address: request.broker_address.clone(),
                        new_master_elected: true,
                    });
                    response.master_address = request.broker_address.clone();
                    response.master_epoch = info.master_epoch.next();
                    response.sync_state_set_epoch = info.sync_state_set_epoch.next();
                    response.master_ha_address = request.broker_ha_address.clone();
                }
            }
        }

        ControllerResult::with_events(events, response)
    }

    /// Handles a read-only replica metadata lookup.
    #[must_use]
    pub fn get_replica_info(
        &self,
        request: &GetReplicaInfoRequest,
    ) -> ControllerResult<GetReplicaInfoResponse> {
        let mut response = GetReplicaInfoResponse::default();

        match self.groups.get(&request.broker_name) {
            None => {
                response.broker_id = BrokerId::UNKNOWN;
                response.error_code = ErrorCode::BrokerNotExist;
            }
            Some(info) => {
                response.master_address = info.master_address.clone();
                response.master_epoch = info.master_epoch;
                response.broker_id = info.broker_id_of(&request.broker_address);
                response.master_ha_address = info.ha_address_of(&info.master_address);
                response.sync_state_set = info.sync_state_set_body();
            }
        }

        ControllerResult::of(response)
    }

    /// Handles a master-initiated ISR change.
    ///
    /// Accepted iff the requester is the current master, both epochs match,
    /// the proposed set is within the registered replicas and contains the
    /// master. On rejection the response carries the authoritative set.
    #[must_use]
    pub fn alter_sync_state_set(
        &self,
        request: &AlterSyncStateSetRequest,
    ) -> ControllerResult<AlterSyncStateSetResponse> {
        let mut response = AlterSyncStateSetResponse::default();

        let Some(info) = self.groups.get(&request.broker_name) else {
            response.error_code = ErrorCode::BrokerNotExist;
            return ControllerResult::of(response);
        };
        response.sync_state_set = info.sync_state_set_body();

        let error_code = Self::validate_alter(info, request);
        if !error_code.is_ok() {
            warn!(
                broker_name = %request.broker_name,
                requester = %request.master_address,
                code = %error_code,
                "Rejecting syncStateSet alteration"
            );
            response.error_code = error_code;
            return ControllerResult::of(response);
        }

        let next_epoch = info.sync_state_set_epoch.next();
        info!(
            broker_name = %request.broker_name,
            new_set = ?request.new_sync_state_set,
            epoch = %next_epoch,
            "Accepting syncStateSet alteration"
        );

        response.sync_state_set =
            SyncStateSet::new(request.new_sync_state_set.clone(), next_epoch);
        ControllerResult::with_events(
            vec![Event::SyncStateSetAltered {
                broker_name: request.broker_name.clone(),
                new_sync_state_set: request.new_sync_state_set.clone(),
            }],
            response,
        )
    }

    fn validate_alter(info: &ReplicaInfo, request: &AlterSyncStateSetRequest) -> ErrorCode {
        if info.master_address.is_empty() || info.master_address != request.master_address {
            return ErrorCode::NotMaster;
        }
        if request.master_epoch != info.master_epoch {
            return ErrorCode::StaleMasterEpoch;
        }
        if request.sync_state_set_epoch != info.sync_state_set_epoch {
            return ErrorCode::StaleSyncStateSetEpoch;
        }
        if !request.new_sync_state_set.contains(&request.master_address) {
            return ErrorCode::InvalidSyncStateSet;
        }
        let within_replicas = request
            .new_sync_state_set
            .iter()
            .all(|addr| info.replicas.contains_key(addr) || *addr == info.master_address);
        if !within_replicas {
            return ErrorCode::InvalidSyncStateSet;
        }
        ErrorCode::None
    }

    /// Handles a master election.
    ///
    /// The new master is chosen deterministically from the sync state set
    /// minus the current master, smallest address first. When no candidate
    /// exists, one event still records the failed election so the master
    /// slot is cleared; the master epoch stays put.
    #[must_use]
    pub fn elect_master(
        &self,
        request: &ElectMasterRequest,
    ) -> ControllerResult<ElectMasterResponse> {
        let mut response = ElectMasterResponse::default();

        let Some(info) = self.groups.get(&request.broker_name) else {
            response.error_code = ErrorCode::BrokerNotExist;
            return ControllerResult::of(response);
        };

        let mut candidates: Vec<&String> = info
            .sync_state_set
            .iter()
            .filter(|addr| **addr != info.master_address)
            .collect();
        candidates.sort();

        response.broker_table = info
            .replicas
            .iter()
            .map(|(addr, ident)| {
                (
                    format!("{}-{}", request.broker_name, ident.broker_id.get()),
                    (ident.broker_id, addr.clone()),
                )
            })
            .collect();

        match candidates.first() {
            Some(&new_master) => {
                info!(
                    broker_name = %request.broker_name,
                    new_master = %new_master,
                    epoch = %info.master_epoch.next(),
                    "Elected new master"
                );
                response.new_master_identity = info.identity_of(&request.broker_name, new_master);
                response.new_master_address = new_master.clone();
                response.master_epoch = info.master_epoch.next();
                response.sync_state_set_epoch = info.sync_state_set_epoch.next();

                ControllerResult::with_events(
                    vec![Event::MasterElected {
                        broker_name: request.broker_name.clone(),
                        new_master_address: new_master.clone(),
                        new_master_elected: true,
                    }],
                    response,
                )
            }
            None => {
                warn!(
                    broker_name = %request.broker_name,
                    "No candidate for master election"
                );
                response.master_epoch = info.master_epoch;
                response.sync_state_set_epoch = info.sync_state_set_epoch;
                response.error_code = ErrorCode::ElectMasterFailed;

                ControllerResult::with_events(
                    vec![Event::MasterElected {
                        broker_name: request.broker_name.clone(),
                        new_master_address: String::new(),
                        new_master_elected: false,
                    }],
                    response,
                )
            }
        }
    }

    /// Applies one committed event. The only writer.
    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::BrokerRegistered {
                cluster_name,
                broker_name,
                broker_address,
                broker_ha_address,
                assigned_id,
            } => {
                let info = self
                    .groups
                    .entry(broker_name.clone())
                    .or_insert_with(|| ReplicaInfo::new(cluster_name.clone()));
                info.replicas
                    .entry(broker_address.clone())
                    .or_insert_with(|| ReplicaIdent {
                        broker_id: *assigned_id,
                        ha_address: broker_ha_address.clone(),
                    });
                info.next_broker_id = info.next_broker_id.max(assigned_id.get() + 1);
            }
            Event::MasterElected {
                broker_name,
                new_master_address,
                new_master_elected,
            } => {
                let Some(info) = self.groups.get_mut(broker_name) else {
                    return;
                };
                if *new_master_elected {
                    info.master_address = new_master_address.clone();
                    info.master_epoch = info.master_epoch.next();
                    // A fresh master starts alone; slaves rejoin once they
                    // catch up against the new history.
                    info.sync_state_set = HashSet::from([new_master_address.clone()]);
                    info.sync_state_set_epoch = info.sync_state_set_epoch.next();
                } else {
                    info.master_address.clear();
                }
            }
            Event::SyncStateSetAltered {
                broker_name,
                new_sync_state_set,
            } => {
                let Some(info) = self.groups.get_mut(broker_name) else {
                    return;
                };
                info.sync_state_set = new_sync_state_set.clone();
                info.sync_state_set_epoch = info.sync_state_set_epoch.next();
            }
        }
    }

    /// Returns the cluster a group belongs to, if registered.
    #[must_use]
    pub fn cluster_of(&self, broker_name: &str) -> Option<&str> {
        self.groups
            .get(broker_name)
            .map(|info| info.cluster_name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_all(registry: &mut ReplicaRegistry, events: &[Event]) {
        for event in events {
            registry.apply_event(event);
        }
    }

    fn register(
        registry: &mut ReplicaRegistry,
        broker_name: &str,
        address: &str,
    ) -> RegisterBrokerResponse {
        let request = RegisterBrokerRequest::new("cluster1", broker_name, address);
        let result = registry.register_broker(&request);
        let (events, response) = result.into_parts();
        apply_all(registry, &events);
        response
    }

    fn alter(
        registry: &mut ReplicaRegistry,
        broker_name: &str,
        master: &str,
        master_epoch: u32,
        new_set: &[&str],
        ss_epoch: u32,
    ) -> AlterSyncStateSetResponse {
        let request = AlterSyncStateSetRequest::new(
            broker_name,
            master,
            Epoch::new(master_epoch),
            new_set.iter().map(|s| (*s).to_string()).collect(),
            SyncEpoch::new(ss_epoch),
        );
        let result = registry.alter_sync_state_set(&request);
        let (events, response) = result.into_parts();
        apply_all(registry, &events);
        response
    }

    fn replica_info(registry: &ReplicaRegistry, broker_name: &str) -> GetReplicaInfoResponse {
        registry
            .get_replica_info(&GetReplicaInfoRequest::new(broker_name, "nobody:0"))
            .response()
            .clone()
    }

    /// Three replicas, A elected master at registration, full ISR.
    fn mock_meta_data(registry: &mut ReplicaRegistry) {
        let first = register(registry, "broker1", "127.0.0.1:9000");
        assert_eq!(first.broker_id, BrokerId::new(1));
        assert_eq!(first.master_address, "127.0.0.1:9000");
        assert_eq!(first.master_epoch, Epoch::new(1));

        let second = register(registry, "broker1", "127.0.0.1:9001");
        assert_eq!(second.broker_id, BrokerId::new(2));
        let third = register(registry, "broker1", "127.0.0.1:9002");
        assert_eq!(third.broker_id, BrokerId::new(3));

        let altered = alter(
            registry,
            "broker1",
            "127.0.0.1:9000",
            1,
            &["127.0.0.1:9000", "127.0.0.1:9001", "127.0.0.1:9002"],
            1,
        );
        assert!(altered.error_code.is_ok());
        assert_eq!(altered.sync_state_set.sync_state_set_epoch, SyncEpoch::new(2));
    }

    #[test]
    fn test_first_register_elects_master() {
        let mut registry = ReplicaRegistry::new();
        let response = register(&mut registry, "broker1", "127.0.0.1:9000");

        assert_eq!(response.broker_id, BrokerId::new(1));
        assert_eq!(response.master_address, "127.0.0.1:9000");
        assert_eq!(response.master_epoch, Epoch::new(1));
        assert_eq!(response.sync_state_set_epoch, SyncEpoch::new(1));

        let info = replica_info(&registry, "broker1");
        assert_eq!(info.master_address, "127.0.0.1:9000");
        assert_eq!(info.master_epoch, Epoch::new(1));
        assert_eq!(info.sync_state_set.sync_state_set.len(), 1);
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = ReplicaRegistry::new();
        mock_meta_data(&mut registry);

        let before = replica_info(&registry, "broker1");
        let again = register(&mut registry, "broker1", "127.0.0.1:9001");
        let after = replica_info(&registry, "broker1");

        assert_eq!(again.broker_id, BrokerId::new(2));
        assert_eq!(before.sync_state_set, after.sync_state_set);
        assert_eq!(before.master_epoch, after.master_epoch);
    }

    #[test]
    fn test_elect_master() {
        let mut registry = ReplicaRegistry::new();
        mock_meta_data(&mut registry);

        let result = registry.elect_master(&ElectMasterRequest::new("broker1"));
        let (events, response) = result.into_parts();
        assert!(response.error_code.is_ok());
        assert_eq!(response.master_epoch, Epoch::new(2));
        assert_eq!(response.sync_state_set_epoch, SyncEpoch::new(3));
        assert!(!response.new_master_address.is_empty());
        assert_ne!(response.new_master_address, "127.0.0.1:9000");
        assert_eq!(response.broker_table.len(), 3);

        apply_all(&mut registry, &events);
        let info = replica_info(&registry, "broker1");
        assert_eq!(info.master_address, response.new_master_address);
        assert_eq!(info.master_epoch, Epoch::new(2));
        // The fresh master starts alone in the ISR.
        assert_eq!(
            info.sync_state_set.sync_state_set,
            HashSet::from([response.new_master_address.clone()])
        );
    }

    #[test]
    fn test_election_is_deterministic() {
        let mut registry = ReplicaRegistry::new();
        mock_meta_data(&mut registry);

        // Smallest candidate address wins.
        let response = registry
            .elect_master(&ElectMasterRequest::new("broker1"))
            .response()
            .clone();
        assert_eq!(response.new_master_address, "127.0.0.1:9001");
    }

    #[test]
    fn test_elect_with_no_candidate_clears_master_only() {
        let mut registry = ReplicaRegistry::new();
        mock_meta_data(&mut registry);

        // New master at epoch 2, alone in the ISR.
        let (events, elected) = registry
            .elect_master(&ElectMasterRequest::new("broker1"))
            .into_parts();
        apply_all(&mut registry, &events);
        assert_eq!(elected.master_epoch, Epoch::new(2));

        // Every other replica is gone; electing again finds no candidate.
        let (events, response) = registry
            .elect_master(&ElectMasterRequest::new("broker1"))
            .into_parts();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Event::MasterElected {
                new_master_elected: false,
                ..
            }
        ));
        assert_eq!(response.error_code, ErrorCode::ElectMasterFailed);
        assert_eq!(response.master_epoch, Epoch::new(2));

        apply_all(&mut registry, &events);
        let info = replica_info(&registry, "broker1");
        assert_eq!(info.master_address, "");
        assert_eq!(info.master_epoch, Epoch::new(2));
    }

    #[test]
    fn test_register_into_masterless_group_reelects_isr_member() {
        let mut registry = ReplicaRegistry::new();
        mock_meta_data(&mut registry);

        // Fail over to 9001, then lose it too.
        let (events, _) = registry
            .elect_master(&ElectMasterRequest::new("broker1"))
            .into_parts();
        apply_all(&mut registry, &events);
        let (events, _) = registry
            .elect_master(&ElectMasterRequest::new("broker1"))
            .into_parts();
        apply_all(&mut registry, &events);
        assert_eq!(replica_info(&registry, "broker1").master_address, "");

        // 9001 was the last ISR member; its re-registration re-elects it.
        let response = register(&mut registry, "broker1", "127.0.0.1:9001");
        assert_eq!(response.master_address, "127.0.0.1:9001");
        assert_eq!(response.master_epoch, Epoch::new(3));

        let info = replica_info(&registry, "broker1");
        assert_eq!(info.master_address, "127.0.0.1:9001");
        assert_eq!(info.master_epoch, Epoch::new(3));
    }

    #[test]
    fn test_register_into_masterless_group_out_of_sync_waits() {
        let mut registry = ReplicaRegistry::new();
        mock_meta_data(&mut registry);

        let (events, _) = registry
            .elect_master(&ElectMasterRequest::new("broker1"))
            .into_parts();
        apply_all(&mut registry, &events);
        let (events, _) = registry
            .elect_master(&ElectMasterRequest::new("broker1"))
            .into_parts();
        apply_all(&mut registry, &events);

        // 9002 fell out of the ISR before the failures; it may not lead.
        let response = register(&mut registry, "broker1", "127.0.0.1:9002");
        assert_eq!(response.master_address, "");
        assert_eq!(replica_info(&registry, "broker1").master_address, "");
    }

    #[test]
    fn test_alter_rejects_non_master() {
        let mut registry = ReplicaRegistry::new();
        mock_meta_data(&mut registry);

        let response = alter(
            &mut registry,
            "broker1",
            "127.0.0.1:9001",
            1,
            &["127.0.0.1:9001"],
            2,
        );
        assert_eq!(response.error_code, ErrorCode::NotMaster);
    }

    #[test]
    fn test_alter_rejects_stale_epochs() {
        let mut registry = ReplicaRegistry::new();
        mock_meta_data(&mut registry);

        let stale_master = alter(
            &mut registry,
            "broker1",
            "127.0.0.1:9000",
            9,
            &["127.0.0.1:9000"],
            2,
        );
        assert_eq!(stale_master.error_code, ErrorCode::StaleMasterEpoch);

        let stale_set = alter(
            &mut registry,
            "broker1",
            "127.0.0.1:9000",
            1,
            &["127.0.0.1:9000"],
            1,
        );
        assert_eq!(stale_set.error_code, ErrorCode::StaleSyncStateSetEpoch);
        // The authoritative set rides back on the rejection.
        assert_eq!(stale_set.sync_state_set.sync_state_set_epoch, SyncEpoch::new(2));
    }

    #[test]
    fn test_alter_rejects_invalid_set() {
        let mut registry = ReplicaRegistry::new();
        mock_meta_data(&mut registry);

        // Master missing from the proposed set.
        let no_master = alter(
            &mut registry,
            "broker1",
            "127.0.0.1:9000",
            1,
            &["127.0.0.1:9001"],
            2,
        );
        assert_eq!(no_master.error_code, ErrorCode::InvalidSyncStateSet);

        // Unregistered address in the proposed set.
        let stranger = alter(
            &mut registry,
            "broker1",
            "127.0.0.1:9000",
            1,
            &["127.0.0.1:9000", "127.0.0.1:9999"],
            2,
        );
        assert_eq!(stranger.error_code, ErrorCode::InvalidSyncStateSet);
    }

    #[test]
    fn test_unknown_group_errors() {
        let registry = ReplicaRegistry::new();

        let info = registry
            .get_replica_info(&GetReplicaInfoRequest::new("ghost", "127.0.0.1:9000"))
            .response()
            .clone();
        assert_eq!(info.error_code, ErrorCode::BrokerNotExist);
        assert_eq!(info.broker_id, BrokerId::UNKNOWN);

        let elect = registry
            .elect_master(&ElectMasterRequest::new("ghost"))
            .response()
            .clone();
        assert_eq!(elect.error_code, ErrorCode::BrokerNotExist);
    }

    #[test]
    fn test_epochs_never_decrease_across_trace() {
        let mut registry = ReplicaRegistry::new();
        let mut last_master_epoch = Epoch::new(0);
        let mut last_sync_epoch = SyncEpoch::new(0);

        let mut observe = |registry: &ReplicaRegistry| {
            let info = replica_info(registry, "broker1");
            assert!(info.master_epoch >= last_master_epoch);
            assert!(info.sync_state_set.sync_state_set_epoch >= last_sync_epoch);
            last_master_epoch = info.master_epoch;
            last_sync_epoch = info.sync_state_set.sync_state_set_epoch;
        };

        mock_meta_data(&mut registry);
        observe(&registry);

        for _ in 0..4 {
            let (events, _) = registry
                .elect_master(&ElectMasterRequest::new("broker1"))
                .into_parts();
            apply_all(&mut registry, &events);
            observe(&registry);

            let info = replica_info(&registry, "broker1");
            if info.master_address.is_empty() {
                break;
            }
            let altered = alter(
                &mut registry,
                "broker1",
                &info.master_address.clone(),
                info.master_epoch.get(),
                &[info.master_address.as_str(), "127.0.0.1:9002"],
                info.sync_state_set.sync_state_set_epoch.get(),
            );
            assert!(altered.error_code.is_ok());
            observe(&registry);
        }
    }

    #[test]
    fn test_accepted_alter_keeps_invariants() {
        let mut registry = ReplicaRegistry::new();
        mock_meta_data(&mut registry);

        let info = replica_info(&registry, "broker1");
        let set = &info.sync_state_set.sync_state_set;
        // master ∈ ISR and ISR ⊆ replicas.
        assert!(set.contains(&info.master_address));
        for addr in set {
            assert!(registry.groups["broker1"].replicas.contains_key(addr));
        }
    }
}
