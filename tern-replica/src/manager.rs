//! The replica state manager.
//!
//! Three periodic tasks drive a broker's life under the controller:
//!
//! - **T1** re-probes the controller quorum for its leader.
//! - **T2** fetches this group's replica metadata and applies role
//!   transitions under strict epoch guards.
//! - **T3** (master only) compares the observed in-sync slaves with the
//!   current set and asks the controller to alter it.
//!
//! All role and epoch mutations go through one mutex; every transition is
//! a no-op unless it carries a strictly newer master epoch, so stale polls
//! can never roll a broker backwards.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tern_core::{BrokerId, Epoch, SyncEpoch};
use tern_ha::HaService;
use tern_protocol::{
    AlterSyncStateSetRequest, GetReplicaInfoRequest, GetReplicaInfoResponse,
    RegisterBrokerRequest,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ControllerClient, NameService, ReplicaError, ReplicaResult};
use crate::config::ReplicaConfig;

/// Role of the local broker in its replica group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    /// Not yet assigned a role by the controller.
    Unjoined,
    /// The group's master.
    Master,
    /// A slave replicating from the master.
    Slave,
}

/// The local broker's view of its replica group.
#[derive(Debug, Clone)]
pub struct ReplicaView {
    /// Current role.
    pub role: ReplicaRole,
    /// Address of the group's master, empty if unknown.
    pub master_address: String,
    /// Highest master epoch observed.
    pub master_epoch: Epoch,
    /// This broker's id, [`BrokerId::MASTER`] while master.
    pub broker_id: BrokerId,
    /// Last installed in-sync replica set.
    pub sync_state_set: HashSet<String>,
    /// Version of the installed set.
    pub sync_state_set_epoch: SyncEpoch,
}

impl ReplicaView {
    fn new() -> Self {
        Self {
            role: ReplicaRole::Unjoined,
            master_address: String::new(),
            master_epoch: Epoch::new(0),
            broker_id: BrokerId::UNKNOWN,
            sync_state_set: HashSet::new(),
            sync_state_set_epoch: SyncEpoch::new(0),
        }
    }
}

/// Startup phases, advanced by `start_basic_service`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    MetadataSynced,
    Running,
}

/// What a metadata poll decided while holding the view lock.
enum SyncAction {
    None,
    ChangeToMaster {
        epoch: Epoch,
        sync_epoch: SyncEpoch,
    },
    ChangeToSlave {
        master_address: String,
        master_ha_address: Option<String>,
        epoch: Epoch,
        broker_id: BrokerId,
    },
    Register,
    ReconcileSet {
        set: HashSet<String>,
        sync_epoch: SyncEpoch,
    },
}

struct ManagerInner {
    config: ReplicaConfig,
    controller: Arc<dyn ControllerClient>,
    name_service: Arc<dyn NameService>,
    ha: Arc<HaService>,
    view: Mutex<ReplicaView>,
    controller_leader: Mutex<Option<String>>,
    phase: Mutex<Phase>,
    check_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl ManagerInner {
    fn view_lock(&self) -> std::sync::MutexGuard<'_, ReplicaView> {
        self.view.lock().expect("replica view lock poisoned")
    }

    fn leader(&self) -> Option<String> {
        self.controller_leader
            .lock()
            .expect("replica view lock poisoned")
            .clone()
    }

    fn phase(&self) -> Phase {
        *self.phase.lock().expect("replica view lock poisoned")
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().expect("replica view lock poisoned") = phase;
    }
}

/// Drives one broker's role under the controller.
pub struct ReplicaStateManager {
    inner: Arc<ManagerInner>,
}

impl ReplicaStateManager {
    /// Creates the manager.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: ReplicaConfig,
        controller: Arc<dyn ControllerClient>,
        name_service: Arc<dyn NameService>,
        ha: Arc<HaService>,
    ) -> ReplicaResult<Self> {
        config.validate().map_err(ReplicaError::InvalidConfig)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                controller,
                name_service,
                ha,
                view: Mutex::new(ReplicaView::new()),
                controller_leader: Mutex::new(None),
                phase: Mutex::new(Phase::Initial),
                check_task: Mutex::new(None),
                shutdown,
            }),
        })
    }

    /// Starts the manager. If the controller is unreachable the startup
    /// sequence keeps retrying on a background task; the broker itself
    /// never fails to boot over controller unavailability.
    pub async fn start(&self) {
        if !self.inner.config.startup_controller_mode {
            info!("Controller mode disabled, replica state manager idle");
            return;
        }
        if Self::start_basic_service(&self.inner).await {
            info!(broker = %self.inner.config.broker_name, "Replica state manager started");
            return;
        }

        error!("Failed to start replica state manager, retrying in background");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut shutdown = inner.shutdown.subscribe();
            let mut tries: u64 = 1;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    () = tokio::time::sleep(inner.config.startup_retry_delay) => {}
                    _ = shutdown.changed() => break,
                }
                tries += 1;
                if Self::start_basic_service(&inner).await {
                    info!(tries, "Replica state manager started after retries");
                    break;
                }
                warn!(tries, phase = ?inner.phase(), "Startup attempt failed, trying again");
            }
        });
    }

    /// Cancels the periodic tasks and shuts the replication endpoints.
    pub fn shutdown(&self) {
        self.inner.set_phase(Phase::Initial);
        let _ = self.inner.shutdown.send(true);
        if let Some(task) = self
            .inner
            .check_task
            .lock()
            .expect("replica view lock poisoned")
            .take()
        {
            task.abort();
        }
        self.inner.ha.shutdown();
    }

    /// Returns a snapshot of the local view.
    #[must_use]
    pub fn view(&self) -> ReplicaView {
        self.inner.view_lock().clone()
    }

    /// Returns the controller leader the manager is talking to.
    #[must_use]
    pub fn controller_leader(&self) -> Option<String> {
        self.inner.leader()
    }

    /// True once the broker acts as master.
    #[must_use]
    pub fn is_master_state(&self) -> bool {
        self.inner.view_lock().role == ReplicaRole::Master
    }

    /// Walks the startup phases: find the leader (spawning T1), register
    /// (which may already assign a role), then start T2.
    async fn start_basic_service(inner: &Arc<ManagerInner>) -> bool {
        if inner.phase() == Phase::Initial {
            if Self::locate_controller_leader(inner).await {
                info!("First controller metadata sync succeeded");
                inner.set_phase(Phase::MetadataSynced);
                Self::spawn_controller_metadata_task(inner);
            } else {
                return false;
            }
        }

        if inner.phase() == Phase::MetadataSynced {
            if Self::register_broker(inner).await {
                info!("First broker registration succeeded");
                inner.set_phase(Phase::Running);
            } else {
                return false;
            }
        }

        Self::spawn_broker_metadata_task(inner);
        true
    }

    /// Probes the quorum up to three times for a leader.
    async fn locate_controller_leader(inner: &Arc<ManagerInner>) -> bool {
        for _ in 0..3 {
            if Self::update_controller_leader(inner).await {
                return true;
            }
        }
        error!(
            controllers = ?inner.config.controller_addrs,
            "No controller identified itself as leader"
        );
        false
    }

    /// Asks every configured controller; the first self-identified leader
    /// wins.
    async fn update_controller_leader(inner: &Arc<ManagerInner>) -> bool {
        for address in &inner.config.controller_addrs {
            match inner.controller.get_controller_metadata(address).await {
                Ok(meta) if meta.is_leader => {
                    let mut leader = inner
                        .controller_leader
                        .lock()
                        .expect("replica view lock poisoned");
                    if leader.as_deref() != Some(address.as_str()) {
                        info!(leader = %address, "Controller leader changed");
                    }
                    *leader = Some(address.clone());
                    return true;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(controller = %address, error = %e, "Controller probe failed");
                }
            }
        }
        false
    }

    /// T1: periodic controller leader refresh.
    fn spawn_controller_metadata_task(inner: &Arc<ManagerInner>) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let mut shutdown = inner.shutdown.subscribe();
            let mut tick = tokio::time::interval(inner.config.sync_controller_metadata_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        if !Self::update_controller_leader(&inner).await {
                            warn!("No controller leader reachable");
                        }
                    }
                }
            }
        });
    }

    /// T2: periodic replica metadata sync.
    fn spawn_broker_metadata_task(inner: &Arc<ManagerInner>) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let mut shutdown = inner.shutdown.subscribe();
            let mut tick = tokio::time::interval(inner.config.sync_broker_metadata_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => Self::sync_broker_metadata(&inner).await,
                }
            }
        });
    }

    /// One T2 cycle: fetch, decide under the lock, act outside it.
    async fn sync_broker_metadata(inner: &Arc<ManagerInner>) {
        let Some(leader) = inner.leader() else {
            return;
        };
        let request = GetReplicaInfoRequest::new(
            inner.config.broker_name.clone(),
            inner.config.broker_address.clone(),
        );
        let info = match inner.controller.get_replica_info(&leader, request).await {
            Ok(info) => info,
            Err(e) => {
                warn!(broker = %inner.config.broker_name, error = %e, "Metadata sync failed");
                return;
            }
        };
        if !info.error_code.is_ok() {
            warn!(code = %info.error_code, "Controller rejected metadata sync");
            return;
        }

        let action = {
            let view = inner.view_lock();
            Self::decide(inner, &view, &info)
        };
        match action {
            SyncAction::None => {}
            SyncAction::ChangeToMaster { epoch, sync_epoch } => {
                Self::change_to_master(inner, epoch, sync_epoch);
            }
            SyncAction::ChangeToSlave {
                master_address,
                master_ha_address,
                epoch,
                broker_id,
            } => {
                Self::change_to_slave(inner, master_address, master_ha_address, epoch, broker_id);
            }
            SyncAction::Register => {
                // The controller does not know this replica: rejoin.
                let _ = Self::register_broker(inner).await;
            }
            SyncAction::ReconcileSet { set, sync_epoch } => {
                Self::change_sync_state_set(inner, set, sync_epoch);
            }
        }
    }

    fn decide(
        inner: &ManagerInner,
        view: &ReplicaView,
        info: &GetReplicaInfoResponse,
    ) -> SyncAction {
        let master_changed = !info.master_address.is_empty()
            && info.master_address != view.master_address
            && info.master_epoch > view.master_epoch;

        if master_changed {
            if info.master_address == inner.config.broker_address {
                return SyncAction::ChangeToMaster {
                    epoch: info.master_epoch,
                    sync_epoch: info.sync_state_set.sync_state_set_epoch,
                };
            }
            if info.broker_id.get() > 0 {
                return SyncAction::ChangeToSlave {
                    master_address: info.master_address.clone(),
                    master_ha_address: info.master_ha_address.clone(),
                    epoch: info.master_epoch,
                    broker_id: info.broker_id,
                };
            }
            return SyncAction::Register;
        }

        if view.role == ReplicaRole::Master {
            return SyncAction::ReconcileSet {
                set: info.sync_state_set.sync_state_set.clone(),
                sync_epoch: info.sync_state_set.sync_state_set_epoch,
            };
        }
        SyncAction::None
    }

    /// Registers with the controller; the response may already name a
    /// master (possibly ourselves) and drives the matching transition.
    async fn register_broker(inner: &Arc<ManagerInner>) -> bool {
        let Some(leader) = inner.leader() else {
            return false;
        };
        let request = RegisterBrokerRequest::new(
            inner.config.cluster_name.clone(),
            inner.config.broker_name.clone(),
            inner.config.broker_address.clone(),
        )
        .with_ha_address(inner.config.broker_ha_address.clone());

        match inner.controller.register_broker(&leader, request).await {
            Ok(response) => {
                if !response.master_address.is_empty() {
                    if response.master_address == inner.config.broker_address {
                        Self::change_to_master(
                            inner,
                            response.master_epoch,
                            response.sync_state_set_epoch,
                        );
                    } else {
                        Self::change_to_slave(
                            inner,
                            response.master_address,
                            response.master_ha_address,
                            response.master_epoch,
                            response.broker_id,
                        );
                    }
                }
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to register broker with controller");
                false
            }
        }
    }

    /// Transition to master. No-op unless `new_epoch` is strictly newer.
    fn change_to_master(inner: &Arc<ManagerInner>, new_epoch: Epoch, sync_epoch: SyncEpoch) {
        {
            let mut view = inner.view_lock();
            if new_epoch <= view.master_epoch {
                return;
            }
            info!(
                broker = %inner.config.broker_name,
                %new_epoch,
                "Begin change to master"
            );

            view.role = ReplicaRole::Master;
            view.master_address = inner.config.broker_address.clone();
            view.master_epoch = new_epoch;
            view.broker_id = BrokerId::MASTER;
            Self::install_sync_state_set(
                inner,
                &mut view,
                HashSet::from([inner.config.broker_address.clone()]),
                sync_epoch,
            );
        }

        Self::spawn_check_sync_state_set_task(inner);

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            // Re-register with the name service first; slaves learn the new
            // master from it. Only then flip the replication endpoint.
            if let Err(e) = inner.name_service.register_broker_all(true).await {
                error!(error = %e, "Name-service registration failed, master switch aborted");
                return;
            }
            if let Err(e) = inner.ha.change_to_master(new_epoch) {
                error!(error = %e, "Replication endpoint failed to become master");
                return;
            }
            info!(
                broker = %inner.config.broker_address,
                %new_epoch,
                "Change to master complete"
            );
        });
    }

    /// Transition to slave. No-op unless `new_epoch` is strictly newer.
    fn change_to_slave(
        inner: &Arc<ManagerInner>,
        master_address: String,
        master_ha_address: Option<String>,
        new_epoch: Epoch,
        broker_id: BrokerId,
    ) {
        {
            let mut view = inner.view_lock();
            if new_epoch <= view.master_epoch {
                return;
            }
            info!(
                broker = %inner.config.broker_name,
                master = %master_address,
                %new_epoch,
                %broker_id,
                "Begin change to slave"
            );

            view.role = ReplicaRole::Slave;
            view.master_address = master_address.clone();
            view.master_epoch = new_epoch;
            view.broker_id = broker_id;
        }

        Self::stop_check_sync_state_set_task(inner);

        // The controller stores the master's replication listener; fall
        // back to its broker address if an old record lacks one.
        let ha_address = master_ha_address.unwrap_or_else(|| master_address.clone());

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            if let Err(e) = inner.name_service.register_broker_all(true).await {
                error!(error = %e, "Name-service registration failed, slave switch aborted");
                return;
            }
            if let Err(e) = inner.ha.change_to_slave(ha_address, new_epoch, broker_id) {
                error!(error = %e, "Replication endpoint failed to become slave");
                return;
            }
            info!(master = %master_address, %new_epoch, "Change to slave complete");
        });
    }

    /// Installs a newer in-sync set into the view and the ack tracker.
    fn change_sync_state_set(
        inner: &Arc<ManagerInner>,
        set: HashSet<String>,
        sync_epoch: SyncEpoch,
    ) {
        let mut view = inner.view_lock();
        Self::install_sync_state_set(inner, &mut view, set, sync_epoch);
    }

    fn install_sync_state_set(
        inner: &ManagerInner,
        view: &mut ReplicaView,
        set: HashSet<String>,
        sync_epoch: SyncEpoch,
    ) {
        if sync_epoch <= view.sync_state_set_epoch {
            return;
        }
        info!(
            from = ?view.sync_state_set,
            to = ?set,
            epoch = %sync_epoch,
            "syncStateSet changed"
        );
        view.sync_state_set_epoch = sync_epoch;
        view.sync_state_set = set.clone();
        inner.ha.set_sync_state_set(set);
    }

    /// T3: master-only in-sync set maintenance.
    fn spawn_check_sync_state_set_task(inner: &Arc<ManagerInner>) {
        let mut slot = inner
            .check_task
            .lock()
            .expect("replica view lock poisoned");
        if let Some(task) = slot.take() {
            task.abort();
        }

        let inner_task = Arc::clone(inner);
        *slot = Some(tokio::spawn(async move {
            let mut shutdown = inner_task.shutdown.subscribe();
            let mut tick =
                tokio::time::interval(inner_task.config.check_sync_state_set_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => Self::check_sync_state_set(&inner_task).await,
                }
            }
        }));
    }

    fn stop_check_sync_state_set_task(inner: &ManagerInner) {
        if let Some(task) = inner
            .check_task
            .lock()
            .expect("replica view lock poisoned")
            .take()
        {
            task.abort();
        }
    }

    /// One T3 cycle: propose `{local} ∪ caught-up slaves` when it differs
    /// from the current set. A stale-epoch rejection is dropped; the next
    /// T2 cycle refreshes the view.
    async fn check_sync_state_set(inner: &Arc<ManagerInner>) {
        let mut new_set = inner.ha.latest_in_sync_slaves();
        new_set.insert(inner.config.broker_address.clone());

        let request = {
            let view = inner.view_lock();
            if view.role != ReplicaRole::Master || view.sync_state_set == new_set {
                return;
            }
            AlterSyncStateSetRequest::new(
                inner.config.broker_name.clone(),
                view.master_address.clone(),
                view.master_epoch,
                new_set,
                view.sync_state_set_epoch,
            )
        };

        let Some(leader) = inner.leader() else {
            return;
        };
        match inner.controller.alter_sync_state_set(&leader, request).await {
            Ok(response) if response.error_code.is_ok() => {
                Self::change_sync_state_set(
                    inner,
                    response.sync_state_set.sync_state_set,
                    response.sync_state_set.sync_state_set_epoch,
                );
            }
            Ok(response) => {
                warn!(code = %response.error_code, "Controller rejected syncStateSet change");
            }
            Err(e) => {
                error!(error = %e, "Failed to alter syncStateSet");
            }
        }
    }
}
