//! System limits for the replication core.
//!
//! Every buffer and wire payload has an explicit maximum size. The
//! replication endpoints reject frames beyond these bounds instead of
//! growing without limit.

/// System-wide limits for Tern replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum body size of a single transfer frame in bytes.
    pub max_transfer_body_bytes: u32,
    /// Maximum number of epoch entries in a handshake payload.
    pub max_epoch_entries: u32,
    /// Maximum size of an endpoint read buffer in bytes.
    pub max_read_buffer_bytes: u32,
    /// Maximum length of a broker address carried on the wire.
    pub max_address_bytes: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // A frame never crosses an epoch boundary, so 4MB is plenty.
            max_transfer_body_bytes: 4 * 1024 * 1024,
            max_epoch_entries: 100_000,
            max_read_buffer_bytes: 4 * 1024 * 1024,
            max_address_bytes: 512,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub const fn validate(&self) -> Result<(), &'static str> {
        if self.max_transfer_body_bytes == 0 {
            return Err("max_transfer_body_bytes must be positive");
        }
        if self.max_read_buffer_bytes < self.max_transfer_body_bytes {
            return Err("max_read_buffer_bytes must be >= max_transfer_body_bytes");
        }
        if self.max_epoch_entries == 0 {
            return Err("max_epoch_entries must be positive");
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        assert!(Limits::new().validate().is_ok());
    }

    #[test]
    fn test_read_buffer_smaller_than_body() {
        let mut limits = Limits::new();
        limits.max_read_buffer_bytes = 1024;
        assert!(limits.validate().is_err());
    }
}
