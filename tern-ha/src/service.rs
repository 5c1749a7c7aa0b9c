//! The replication service of one broker.
//!
//! Owns the master-side listener, the slave-side client task, and the
//! shared tables both feed: per-connection ack offsets (for the confirm
//! offset) and per-slave caught-up timestamps (for in-sync candidacy).
//! Role switches arrive from the replica state manager and never block on
//! the network: they flip shared state and nudge the endpoint tasks.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use socket2::{Domain, Socket, Type};
use tern_core::{BrokerId, Epoch};
use tern_epoch::EpochCache;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::client::{run_client, ClientCommand};
use crate::config::HaConfig;
use crate::connection::run_connection;
use crate::error::{HaError, HaResult};
use crate::store::CommitLog;

/// Replication role of the local broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaRole {
    /// Serving slaves from the local log.
    Master,
    /// Pulling the log from a master.
    Slave,
}

/// A live master-side connection's view, keyed by connection id.
#[derive(Debug)]
pub(crate) struct ConnMeta {
    /// The slave's broker address, known after its handshake.
    pub(crate) slave_address: Option<String>,
    /// Highest offset the slave has acked.
    pub(crate) ack_offset: i64,
}

#[derive(Debug)]
pub(crate) struct ServiceState {
    pub(crate) role: HaRole,
    pub(crate) current_epoch: Epoch,
    pub(crate) sync_state_set: HashSet<String>,
    pub(crate) connections: HashMap<u64, ConnMeta>,
    /// Slave broker address to the last wall-clock ms it was caught up.
    pub(crate) caught_up: HashMap<String, i64>,
    next_connection_id: u64,
}

/// State shared between the service handle and its endpoint tasks.
pub(crate) struct HaShared {
    pub(crate) config: HaConfig,
    pub(crate) store: Arc<dyn CommitLog>,
    pub(crate) epoch_cache: Arc<EpochCache>,
    pub(crate) local_address: String,
    pub(crate) state: Mutex<ServiceState>,
    /// Confirm offset learned from the master while in the slave role.
    pub(crate) confirm_from_master: AtomicI64,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl HaShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.state.lock().expect("ha service lock poisoned")
    }

    pub(crate) fn role(&self) -> HaRole {
        self.lock().role
    }

    pub(crate) fn current_epoch(&self) -> Epoch {
        self.lock().current_epoch
    }

    pub(crate) fn register_connection(&self) -> u64 {
        let mut state = self.lock();
        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.connections.insert(
            id,
            ConnMeta {
                slave_address: None,
                ack_offset: 0,
            },
        );
        id
    }

    pub(crate) fn connection_registered(&self, id: u64) -> bool {
        self.lock().connections.contains_key(&id)
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        self.lock().connections.remove(&id);
    }

    pub(crate) fn set_connection_address(&self, id: u64, address: &str) {
        let mut state = self.lock();
        if let Some(meta) = state.connections.get_mut(&id) {
            meta.slave_address = Some(address.to_string());
        }
    }

    /// Records a slave's offset report: ack for the confirm offset, and a
    /// caught-up timestamp when its lag is within the configured gap.
    pub(crate) fn update_slave_ack(&self, id: u64, reported: i64) {
        let now = self.store.now_ms();
        let master_max = self.store.max_phy_offset();
        let mut state = self.lock();

        let Some(meta) = state.connections.get_mut(&id) else {
            return;
        };
        meta.ack_offset = reported;
        let Some(address) = meta.slave_address.clone() else {
            return;
        };

        if master_max - reported <= self.config.max_gap_not_in_sync {
            state.caught_up.insert(address, now);
        }
    }

    /// The master's commit watermark: its own max offset floored by every
    /// in-sync slave with a live connection.
    pub(crate) fn master_confirm_offset(&self) -> i64 {
        let max = self.store.max_phy_offset();
        let state = self.lock();
        state
            .connections
            .values()
            .filter(|meta| {
                meta.slave_address
                    .as_ref()
                    .is_some_and(|addr| state.sync_state_set.contains(addr))
            })
            .fold(max, |confirm, meta| confirm.min(meta.ack_offset))
    }
}

/// The replication service handle.
pub struct HaService {
    shared: Arc<HaShared>,
    client_tx: mpsc::UnboundedSender<ClientCommand>,
    client_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientCommand>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl HaService {
    /// Creates the service. No I/O happens until [`HaService::start`].
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: HaConfig,
        store: Arc<dyn CommitLog>,
        epoch_cache: Arc<EpochCache>,
        local_address: impl Into<String>,
    ) -> HaResult<Self> {
        config.validate().map_err(HaError::InvalidConfig)?;

        let (shutdown, _) = watch::channel(false);
        let (client_tx, client_rx) = mpsc::unbounded_channel();

        Ok(Self {
            shared: Arc::new(HaShared {
                config,
                store,
                epoch_cache,
                local_address: local_address.into(),
                state: Mutex::new(ServiceState {
                    role: HaRole::Slave,
                    current_epoch: Epoch::new(0),
                    sync_state_set: HashSet::new(),
                    connections: HashMap::new(),
                    caught_up: HashMap::new(),
                    next_connection_id: 1,
                }),
                confirm_from_master: AtomicI64::new(-1),
                shutdown,
            }),
            client_tx,
            client_rx: Mutex::new(Some(client_rx)),
            listen_addr: Mutex::new(None),
        })
    }

    /// Binds the replication listener and spawns the endpoint tasks.
    ///
    /// Returns the bound address (useful with port 0 in tests).
    ///
    /// # Errors
    /// Returns an error if binding fails or the service was already started.
    pub async fn start(&self) -> HaResult<SocketAddr> {
        let listener = create_reusable_listener(self.shared.config.listen_addr).map_err(|e| {
            HaError::BindFailed {
                addr: self.shared.config.listen_addr,
                source: e,
            }
        })?;
        let bound = listener.local_addr()?;
        *self
            .listen_addr
            .lock()
            .expect("ha service lock poisoned") = Some(bound);

        info!(
            local = %self.shared.local_address,
            addr = %bound,
            "Replication listener started"
        );

        let rx = self
            .client_rx
            .lock()
            .expect("ha service lock poisoned")
            .take()
            .ok_or(HaError::Shutdown)?;

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            run_client(shared, rx).await;
        });

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            accept_loop(shared, listener).await;
        });

        Ok(bound)
    }

    /// Returns the bound listener address, once started.
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().expect("ha service lock poisoned")
    }

    /// Signals every endpoint task to stop and close its sockets.
    pub fn shutdown(&self) {
        info!(local = %self.shared.local_address, "Replication service shutting down");
        let _ = self.shared.shutdown.send(true);
    }

    /// Switches the local broker to master for `epoch`.
    ///
    /// Destroys live connections, drops any torn tail write, and stamps the
    /// new term into the epoch cache at the current log end.
    ///
    /// # Errors
    /// Returns an error if the self check or the epoch append fails.
    pub fn change_to_master(&self, epoch: Epoch) -> HaResult<()> {
        {
            let mut state = self.shared.lock();
            let stale = epoch < state.current_epoch
                || (state.role == HaRole::Master && epoch == state.current_epoch);
            if stale {
                debug!(%epoch, current = %state.current_epoch, "Ignoring stale master switch");
                return Ok(());
            }
            state.role = HaRole::Master;
            state.current_epoch = epoch;
            state.sync_state_set = HashSet::from([self.shared.local_address.clone()]);
            // Orphan live connections; their tasks exit on the next tick
            // and slaves re-handshake against the new history.
            state.connections.clear();
            state.caught_up.clear();
        }

        let _ = self.client_tx.send(ClientCommand::UpdateMaster(None));
        let _ = self.client_tx.send(ClientCommand::Reopen);

        if let Some(tail) = self.shared.store.truncate_dirty_tail() {
            warn!(tail, "Dropped torn tail before becoming master");
            self.shared.epoch_cache.truncate_suffix_from_offset(tail)?;
        }

        let max_offset = self.shared.store.max_phy_offset();
        self.shared.epoch_cache.set_last_end_offset(max_offset);
        self.shared.epoch_cache.append_entry(epoch, max_offset)?;
        self.shared.confirm_from_master.store(-1, Ordering::Release);

        info!(%epoch, max_offset, "Changed to master");
        Ok(())
    }

    /// Switches the local broker to a slave of `master_ha_address`.
    ///
    /// # Errors
    /// Currently infallible; kept fallible for symmetry with the master
    /// transition so callers handle both alike.
    pub fn change_to_slave(
        &self,
        master_ha_address: impl Into<String>,
        epoch: Epoch,
        broker_id: BrokerId,
    ) -> HaResult<()> {
        let master_ha_address = master_ha_address.into();
        {
            let mut state = self.shared.lock();
            state.role = HaRole::Slave;
            state.current_epoch = epoch;
            state.connections.clear();
            state.caught_up.clear();
        }

        let _ = self
            .client_tx
            .send(ClientCommand::UpdateMaster(Some(master_ha_address.clone())));
        let _ = self.client_tx.send(ClientCommand::Reopen);

        info!(master = %master_ha_address, %epoch, %broker_id, "Changed to slave");
        Ok(())
    }

    /// Returns the current role.
    #[must_use]
    pub fn role(&self) -> HaRole {
        self.shared.role()
    }

    /// Returns the current master epoch known to the endpoints.
    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        self.shared.current_epoch()
    }

    /// Installs the controller's authoritative in-sync set.
    pub fn set_sync_state_set(&self, set: HashSet<String>) {
        let mut state = self.shared.lock();
        debug!(?set, "Installing syncStateSet");
        state.sync_state_set = set;
    }

    /// Returns the in-sync set the ack tracker is using.
    #[must_use]
    pub fn sync_state_set(&self) -> HashSet<String> {
        self.shared.lock().sync_state_set.clone()
    }

    /// Slaves that acked within the catch-up window, candidates for ISR
    /// expansion. The local broker is not included.
    #[must_use]
    pub fn latest_in_sync_slaves(&self) -> HashSet<String> {
        let now = self.shared.store.now_ms();
        let window = i64::try_from(self.shared.config.max_time_slave_not_catchup.as_millis())
            .unwrap_or(i64::MAX);
        let state = self.shared.lock();
        state
            .caught_up
            .iter()
            .filter(|&(_, &at)| now - at <= window)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// The commit watermark: as master, the ISR-floored max offset; as
    /// slave, the watermark last pushed by the master (`-1` before any).
    #[must_use]
    pub fn confirm_offset(&self) -> i64 {
        match self.role() {
            HaRole::Master => self.shared.master_confirm_offset(),
            HaRole::Slave => self.shared.confirm_from_master.load(Ordering::Acquire),
        }
    }

    /// Number of live master-side connections, for observability.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }
}

async fn accept_loop(shared: Arc<HaShared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("Accept loop shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if shared.role() != HaRole::Master {
                        debug!(%peer, "Rejecting replication connection while not master");
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer, error = %e, "Failed to set nodelay");
                    }
                    let id = shared.register_connection();
                    info!(%peer, id, "Accepted slave connection");
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        run_connection(shared, id, stream, peer).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept replication connection");
                }
            }
        }
    }
}

/// Create a TCP listener with `SO_REUSEADDR` enabled.
///
/// Lets the endpoint rebind a port still in `TIME_WAIT`, which matters for
/// fast restarts during tests and failovers.
fn create_reusable_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
