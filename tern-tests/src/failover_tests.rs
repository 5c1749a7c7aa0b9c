//! Manager-driven role switches, end to end.
//!
//! Two brokers run the full stack: replica state manager, in-process
//! controller registry, and live replication endpoints over loopback.

use std::sync::Arc;
use std::time::Duration;

use tern_core::{BrokerId, Epoch, SyncEpoch};
use tern_ha::{CommitLog, HaConfig};
use tern_protocol::{ElectMasterRequest, GetReplicaInfoRequest};
use tern_replica::{ControllerClient, ReplicaConfig, ReplicaRole, ReplicaStateManager};

use crate::harness::{
    init_test_logging, payload, wait_until, InProcessController, NoopNameService, TestBroker,
};

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROLLER_ADDR: &str = "127.0.0.1:7700";

struct ManagedBroker {
    broker: TestBroker,
    manager: ReplicaStateManager,
}

impl ManagedBroker {
    async fn spawn(controller: &Arc<InProcessController>, address: &str) -> Self {
        let broker = TestBroker::spawn(address).await;
        let config = ReplicaConfig::fast_for_testing(
            "broker1",
            address,
            HaConfig::fast_for_testing("127.0.0.1:0".parse().unwrap()),
        )
        .with_controller_addr_list(CONTROLLER_ADDR)
        .with_ha_address(broker.ha_addr.to_string());

        let manager = ReplicaStateManager::new(
            config,
            Arc::clone(controller) as Arc<dyn ControllerClient>,
            Arc::new(NoopNameService),
            Arc::clone(&broker.ha),
        )
        .unwrap();
        manager.start().await;

        Self { broker, manager }
    }
}

fn isr_of(controller: &InProcessController) -> std::collections::HashSet<String> {
    controller.with(|registry| {
        registry
            .get_replica_info(&GetReplicaInfoRequest::new("broker1", "nobody:0"))
            .response()
            .sync_state_set
            .sync_state_set
            .clone()
    })
}

#[tokio::test]
async fn test_full_lifecycle_register_replicate_failover() {
    init_test_logging();
    let controller = Arc::new(InProcessController::new(CONTROLLER_ADDR));

    // First broker registers into an empty group and becomes master.
    let b1 = ManagedBroker::spawn(&controller, "127.0.0.1:9100").await;
    assert!(
        wait_until(SYNC_TIMEOUT, || b1.manager.is_master_state()).await,
        "first broker never became master"
    );
    {
        let view = b1.manager.view();
        assert_eq!(view.master_epoch, Epoch::new(1));
        assert_eq!(view.broker_id, BrokerId::MASTER);
    }
    b1.broker.store.put(&payload(1000, 11));

    // Second broker registers, becomes slave, and replicates the log.
    let b2 = ManagedBroker::spawn(&controller, "127.0.0.1:9101").await;
    assert!(
        wait_until(SYNC_TIMEOUT, || {
            b2.manager.view().role == ReplicaRole::Slave
                && b2.broker.store.max_phy_offset() == 1000
        })
        .await,
        "second broker never replicated as slave"
    );
    assert_eq!(b2.broker.store.snapshot(), b1.broker.store.snapshot());

    // The master's ISR maintenance admits the caught-up slave.
    assert!(
        wait_until(SYNC_TIMEOUT, || isr_of(&controller).contains("127.0.0.1:9101")).await,
        "controller never saw the ISR expand"
    );
    assert!(
        wait_until(SYNC_TIMEOUT, || {
            let view = b1.manager.view();
            view.sync_state_set.len() == 2
                && view.sync_state_set_epoch >= SyncEpoch::new(2)
        })
        .await,
        "master never installed the expanded ISR"
    );

    // Controller-side failover: the slave is the only candidate.
    let elected = controller.with(|registry| {
        let result = registry.elect_master(&ElectMasterRequest::new("broker1"));
        InProcessController::commit(registry, result)
    });
    assert!(elected.error_code.is_ok());
    assert_eq!(elected.new_master_address, "127.0.0.1:9101");
    assert_eq!(elected.master_epoch, Epoch::new(2));

    // Both brokers observe the flip through their metadata sync.
    assert!(
        wait_until(SYNC_TIMEOUT, || {
            b2.manager.view().role == ReplicaRole::Master
                && b1.manager.view().role == ReplicaRole::Slave
        })
        .await,
        "roles never flipped after the election"
    );
    {
        let view = b1.manager.view();
        assert_eq!(view.master_address, "127.0.0.1:9101");
        assert_eq!(view.master_epoch, Epoch::new(2));
        assert_eq!(view.broker_id, BrokerId::new(1));
    }

    // Writes on the new master reach the old one.
    b2.broker.store.put(&payload(700, 12));
    assert!(
        wait_until(SYNC_TIMEOUT, || {
            b1.broker.store.max_phy_offset() == 1700
        })
        .await,
        "old master never replicated from the new one"
    );
    assert_eq!(b1.broker.store.snapshot(), b2.broker.store.snapshot());

    // The old master rejoins the ISR after catching up.
    assert!(
        wait_until(SYNC_TIMEOUT, || isr_of(&controller).contains("127.0.0.1:9100")).await,
        "old master never rejoined the ISR"
    );

    b1.manager.shutdown();
    b2.manager.shutdown();
}

#[tokio::test]
async fn test_failed_election_keeps_epoch_and_clears_master() {
    let controller = Arc::new(InProcessController::new(CONTROLLER_ADDR));

    let b1 = ManagedBroker::spawn(&controller, "127.0.0.1:9110").await;
    assert!(
        wait_until(SYNC_TIMEOUT, || b1.manager.is_master_state()).await,
        "broker never became master"
    );

    // The master is alone in the ISR; electing away from it must fail.
    let response = controller.with(|registry| {
        let result = registry.elect_master(&ElectMasterRequest::new("broker1"));
        InProcessController::commit(registry, result)
    });
    assert!(!response.error_code.is_ok());
    assert_eq!(response.master_epoch, Epoch::new(1));

    let info = controller.with(|registry| {
        registry
            .get_replica_info(&GetReplicaInfoRequest::new("broker1", "127.0.0.1:9110"))
            .response()
            .clone()
    });
    assert_eq!(info.master_address, "");
    assert_eq!(info.master_epoch, Epoch::new(1));

    // The local broker keeps its role: there is no newer epoch to follow.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b1.manager.is_master_state());

    b1.manager.shutdown();
}
