//! Broker replica configuration.

use std::time::Duration;

use tern_ha::HaConfig;

/// Configuration for one broker's replica state manager.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Cluster this broker belongs to.
    pub cluster_name: String,
    /// Broker group name shared by all replicas of one log.
    pub broker_name: String,
    /// This broker's client-facing address.
    pub broker_address: String,
    /// This broker's advertised replication listener.
    pub broker_ha_address: String,
    /// Controller quorum addresses.
    pub controller_addrs: Vec<String>,
    /// How often the controller leader is re-probed.
    pub sync_controller_metadata_period: Duration,
    /// How often replica metadata is fetched from the leader.
    pub sync_broker_metadata_period: Duration,
    /// How often the master re-evaluates the in-sync set.
    pub check_sync_state_set_period: Duration,
    /// Backoff between startup attempts when the controller is down.
    pub startup_retry_delay: Duration,
    /// Configured replica count of the group.
    pub total_replicas: u32,
    /// Configured quorum of in-sync replicas.
    pub in_sync_replicas: u32,
    /// Whether the broker runs under controller management at all.
    pub startup_controller_mode: bool,
    /// Replication endpoint settings.
    pub ha: HaConfig,
}

impl ReplicaConfig {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub fn new(
        cluster_name: impl Into<String>,
        broker_name: impl Into<String>,
        broker_address: impl Into<String>,
        ha: HaConfig,
    ) -> Self {
        let broker_ha_address = ha.listen_addr.to_string();
        Self {
            cluster_name: cluster_name.into(),
            broker_name: broker_name.into(),
            broker_address: broker_address.into(),
            broker_ha_address,
            controller_addrs: Vec::new(),
            sync_controller_metadata_period: Duration::from_secs(10),
            sync_broker_metadata_period: Duration::from_secs(5),
            check_sync_state_set_period: Duration::from_secs(5),
            startup_retry_delay: Duration::from_secs(1),
            total_replicas: 3,
            in_sync_replicas: 2,
            startup_controller_mode: true,
            ha,
        }
    }

    /// Parses a `;`-separated controller address list.
    #[must_use]
    pub fn with_controller_addr_list(mut self, list: &str) -> Self {
        self.controller_addrs = list
            .split(';')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(String::from)
            .collect();
        self
    }

    /// Overrides the advertised replication listener address.
    #[must_use]
    pub fn with_ha_address(mut self, address: impl Into<String>) -> Self {
        self.broker_ha_address = address.into();
        self
    }

    /// Creates a configuration with short periods for tests.
    #[must_use]
    pub fn fast_for_testing(
        broker_name: impl Into<String>,
        broker_address: impl Into<String>,
        ha: HaConfig,
    ) -> Self {
        let mut config = Self::new("cluster-test", broker_name, broker_address, ha);
        config.sync_controller_metadata_period = Duration::from_millis(100);
        config.sync_broker_metadata_period = Duration::from_millis(50);
        config.check_sync_state_set_period = Duration::from_millis(50);
        config.startup_retry_delay = Duration::from_millis(50);
        config
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.broker_name.is_empty() {
            return Err("broker_name must not be empty");
        }
        if self.broker_address.is_empty() {
            return Err("broker_address must not be empty");
        }
        if self.startup_controller_mode && self.controller_addrs.is_empty() {
            return Err("controller_addrs must not be empty in controller mode");
        }
        if self.in_sync_replicas == 0 || self.in_sync_replicas > self.total_replicas {
            return Err("in_sync_replicas must be in 1..=total_replicas");
        }
        self.ha.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ha() -> HaConfig {
        HaConfig::new("127.0.0.1:10912".parse().unwrap())
    }

    #[test]
    fn test_controller_addr_list_parsing() {
        let config = ReplicaConfig::new("c", "b", "127.0.0.1:9000", ha())
            .with_controller_addr_list("127.0.0.1:7000;127.0.0.1:7001; ;127.0.0.1:7002");
        assert_eq!(
            config.controller_addrs,
            vec!["127.0.0.1:7000", "127.0.0.1:7001", "127.0.0.1:7002"]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_controller_mode_requires_addresses() {
        let config = ReplicaConfig::new("c", "b", "127.0.0.1:9000", ha());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quorum_bounds() {
        let mut config = ReplicaConfig::new("c", "b", "127.0.0.1:9000", ha())
            .with_controller_addr_list("127.0.0.1:7000");
        config.in_sync_replicas = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ha_address_defaults_to_listener() {
        let config = ReplicaConfig::new("c", "b", "127.0.0.1:9000", ha());
        assert_eq!(config.broker_ha_address, "127.0.0.1:10912");
    }
}
