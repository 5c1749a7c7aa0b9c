//! Replication endpoint configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the replication endpoints of one broker.
#[derive(Debug, Clone)]
pub struct HaConfig {
    /// Address the master-side listener binds.
    pub listen_addr: SocketAddr,
    /// How often idle endpoints report/heartbeat.
    pub send_heartbeat_interval: Duration,
    /// No bytes read for this long closes the connection.
    pub housekeeping_interval: Duration,
    /// How long the slave waits for the master's handshake reply.
    pub handshake_timeout: Duration,
    /// Delay between slave connect attempts.
    pub connect_retry_delay: Duration,
    /// A slave that has not acked the confirm offset for this long drops
    /// out of the candidate in-sync set.
    pub max_time_slave_not_catchup: Duration,
    /// A slave counts as caught up while its ack lags the master's log end
    /// by at most this many bytes.
    pub max_gap_not_in_sync: i64,
    /// Upper bound on one transfer frame body.
    pub transfer_batch_size: usize,
    /// Serve fresh slaves from the newest commit-log file instead of the
    /// oldest retained offset.
    pub sync_from_last_file: bool,
}

impl HaConfig {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            send_heartbeat_interval: Duration::from_secs(5),
            housekeeping_interval: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(5),
            connect_retry_delay: Duration::from_secs(5),
            max_time_slave_not_catchup: Duration::from_secs(15),
            max_gap_not_in_sync: 256 * 1024,
            transfer_batch_size: 32 * 1024,
            sync_from_last_file: false,
        }
    }

    /// Creates a configuration with short intervals for tests.
    #[must_use]
    pub fn fast_for_testing(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            send_heartbeat_interval: Duration::from_millis(50),
            housekeeping_interval: Duration::from_millis(2000),
            handshake_timeout: Duration::from_millis(1000),
            connect_retry_delay: Duration::from_millis(50),
            max_time_slave_not_catchup: Duration::from_millis(1000),
            max_gap_not_in_sync: 256 * 1024,
            transfer_batch_size: 32 * 1024,
            sync_from_last_file: false,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a description of the first invalid field.
    pub const fn validate(&self) -> Result<(), &'static str> {
        if self.transfer_batch_size == 0 {
            return Err("transfer_batch_size must be positive");
        }
        if self.max_gap_not_in_sync < 0 {
            return Err("max_gap_not_in_sync must be non-negative");
        }
        if self.housekeeping_interval.as_millis() <= self.send_heartbeat_interval.as_millis() {
            return Err("housekeeping_interval must be > send_heartbeat_interval");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(HaConfig::new(any_addr()).validate().is_ok());
        assert!(HaConfig::fast_for_testing(any_addr()).validate().is_ok());
    }

    #[test]
    fn test_housekeeping_must_exceed_heartbeat() {
        let mut config = HaConfig::new(any_addr());
        config.housekeeping_interval = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}
