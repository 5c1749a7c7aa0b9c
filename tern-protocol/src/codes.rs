//! Controller error codes.
//!
//! Controller-side validation never raises transport errors; rejections
//! travel back to the broker as one of these codes.

use std::fmt;

/// Outcome of a controller request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    /// The request was accepted.
    #[default]
    None,
    /// The broker group is not registered.
    BrokerNotExist,
    /// The requester is not the current master.
    NotMaster,
    /// The request carried an outdated master epoch.
    StaleMasterEpoch,
    /// The request carried an outdated sync-state-set epoch.
    StaleSyncStateSetEpoch,
    /// The proposed set is not a subset of the replicas, or omits the master.
    InvalidSyncStateSet,
    /// No replica was eligible to become master.
    ElectMasterFailed,
}

impl ErrorCode {
    /// Returns the wire code.
    #[must_use]
    pub const fn as_code(self) -> u16 {
        match self {
            Self::None => 0,
            Self::BrokerNotExist => 1,
            Self::NotMaster => 2,
            Self::StaleMasterEpoch => 3,
            Self::StaleSyncStateSetEpoch => 4,
            Self::InvalidSyncStateSet => 5,
            Self::ElectMasterFailed => 6,
        }
    }

    /// Decodes a wire code, rejecting unknown values.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::BrokerNotExist),
            2 => Some(Self::NotMaster),
            3 => Some(Self::StaleMasterEpoch),
            4 => Some(Self::StaleSyncStateSetEpoch),
            5 => Some(Self::InvalidSyncStateSet),
            6 => Some(Self::ElectMasterFailed),
            _ => None,
        }
    }

    /// Returns true if the request was accepted.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::BrokerNotExist => "BROKER_NOT_EXIST",
            Self::NotMaster => "NOT_MASTER",
            Self::StaleMasterEpoch => "STALE_MASTER_EPOCH",
            Self::StaleSyncStateSetEpoch => "STALE_SYNC_STATE_SET_EPOCH",
            Self::InvalidSyncStateSet => "INVALID_SYNC_STATE_SET",
            Self::ElectMasterFailed => "ELECT_MASTER_FAILED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in [
            ErrorCode::None,
            ErrorCode::BrokerNotExist,
            ErrorCode::NotMaster,
            ErrorCode::StaleMasterEpoch,
            ErrorCode::StaleSyncStateSetEpoch,
            ErrorCode::InvalidSyncStateSet,
            ErrorCode::ElectMasterFailed,
        ] {
            assert_eq!(ErrorCode::from_code(code.as_code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(99), None);
    }

    #[test]
    fn test_only_none_is_ok() {
        assert!(ErrorCode::None.is_ok());
        assert!(!ErrorCode::ElectMasterFailed.is_ok());
    }
}
