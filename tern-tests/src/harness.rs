//! Shared fixtures for the integration tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tern_controller::ReplicaRegistry;
use tern_epoch::EpochCache;
use tern_ha::{HaConfig, HaService, MemoryCommitLog};
use tern_protocol::{
    AlterSyncStateSetRequest, AlterSyncStateSetResponse, ControllerMetaData,
    GetReplicaInfoRequest, GetReplicaInfoResponse, RegisterBrokerRequest, RegisterBrokerResponse,
};
use tern_replica::{ControllerClient, NameService, ReplicaResult};

/// One in-memory broker with a live replication endpoint.
pub struct TestBroker {
    /// The broker's client-facing address (its identity in the ISR).
    pub address: String,
    /// In-memory commit log.
    pub store: Arc<MemoryCommitLog>,
    /// Volatile epoch cache.
    pub cache: Arc<EpochCache>,
    /// The replication service.
    pub ha: Arc<HaService>,
    /// The bound replication listener.
    pub ha_addr: SocketAddr,
}

impl TestBroker {
    /// Spawns a broker with started endpoints on an ephemeral port.
    ///
    /// # Panics
    /// Panics if the endpoint cannot be created or bound.
    pub async fn spawn(address: &str) -> Self {
        let store = Arc::new(MemoryCommitLog::new());
        let cache = Arc::new(EpochCache::new());
        let ha = Arc::new(
            HaService::new(
                HaConfig::fast_for_testing("127.0.0.1:0".parse().expect("addr")),
                Arc::clone(&store) as Arc<dyn tern_ha::CommitLog>,
                Arc::clone(&cache),
                address,
            )
            .expect("ha service"),
        );
        let ha_addr = ha.start().await.expect("ha start");

        Self {
            address: address.to_string(),
            store,
            cache,
            ha,
            ha_addr,
        }
    }
}

/// Installs a test-friendly tracing subscriber, honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `cond` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// A deterministic payload for byte-identical log prefixes.
#[must_use]
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| {
            // Cheap byte mixer, stable across runs.
            #[allow(clippy::cast_possible_truncation)]
            let b = (i as u64).wrapping_mul(31).wrapping_add(u64::from(seed)) as u8;
            b
        })
        .collect()
}

/// The real controller registry behind the broker-side client trait, with
/// a fixed leader address.
pub struct InProcessController {
    registry: Mutex<ReplicaRegistry>,
    leader_address: String,
}

impl InProcessController {
    /// Creates a controller that answers as leader at `leader_address`.
    #[must_use]
    pub fn new(leader_address: &str) -> Self {
        Self {
            registry: Mutex::new(ReplicaRegistry::new()),
            leader_address: leader_address.to_string(),
        }
    }

    /// Runs `f` against the registry under its lock.
    pub fn with<T>(&self, f: impl FnOnce(&mut ReplicaRegistry) -> T) -> T {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        f(&mut registry)
    }

    /// Commits and applies a handler result, returning its response.
    pub fn commit<T>(
        registry: &mut ReplicaRegistry,
        result: tern_controller::ControllerResult<T>,
    ) -> T {
        let (events, response) = result.into_parts();
        for event in &events {
            registry.apply_event(event);
        }
        response
    }
}

#[async_trait]
impl ControllerClient for InProcessController {
    async fn get_controller_metadata(
        &self,
        controller_address: &str,
    ) -> ReplicaResult<ControllerMetaData> {
        Ok(ControllerMetaData {
            is_leader: controller_address == self.leader_address,
            peers: vec![self.leader_address.clone()],
        })
    }

    async fn register_broker(
        &self,
        _leader: &str,
        request: RegisterBrokerRequest,
    ) -> ReplicaResult<RegisterBrokerResponse> {
        Ok(self.with(|registry| {
            let result = registry.register_broker(&request);
            Self::commit(registry, result)
        }))
    }

    async fn get_replica_info(
        &self,
        _leader: &str,
        request: GetReplicaInfoRequest,
    ) -> ReplicaResult<GetReplicaInfoResponse> {
        Ok(self.with(|registry| registry.get_replica_info(&request).response().clone()))
    }

    async fn alter_sync_state_set(
        &self,
        _leader: &str,
        request: AlterSyncStateSetRequest,
    ) -> ReplicaResult<AlterSyncStateSetResponse> {
        Ok(self.with(|registry| {
            let result = registry.alter_sync_state_set(&request);
            Self::commit(registry, result)
        }))
    }
}

/// A name service that records nothing.
pub struct NoopNameService;

#[async_trait]
impl NameService for NoopNameService {
    async fn register_broker_all(&self, _force: bool) -> ReplicaResult<()> {
        Ok(())
    }
}
