//! Strongly-typed counters for Tern entities.
//!
//! Explicit types prevent bugs from mixing up the two epoch counters the
//! replication protocol carries side by side: the master term and the
//! ISR version.

use std::fmt;

/// Macro to generate strongly-typed u32 epoch wrappers.
///
/// Each epoch type wraps a u32 and provides:
/// - Type safety (can't mix a master `Epoch` with a `SyncEpoch`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u32)
macro_rules! define_epoch {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Creates a new epoch from a raw u32 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u32) -> Self {
                Self(value)
            }

            /// Returns the raw u32 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u32 {
                self.0
            }

            /// Returns the next epoch in sequence.
            ///
            /// # Panics
            /// Panics if the epoch would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u32::MAX, "epoch overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u32 {
            fn from(epoch: $name) -> Self {
                epoch.get()
            }
        }
    };
}

define_epoch!(Epoch, "epoch", "Master term. Bumped at each successful election.");
define_epoch!(SyncEpoch, "ss-epoch", "Version counter for the in-sync replica set.");

/// Broker identifier assigned by the controller.
///
/// The acting master always carries [`BrokerId::MASTER`]; slaves carry the
/// positive id the controller allocated at registration. Negative values
/// mean the controller does not know the replica and it must re-register.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct BrokerId(i64);

impl BrokerId {
    /// The id carried by the acting master.
    pub const MASTER: Self = Self(0);

    /// Sentinel for a replica the controller has no record of.
    pub const UNKNOWN: Self = Self(-1);

    /// Creates a broker id from a raw i64 value.
    #[inline]
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw i64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns true if this is the master id.
    #[inline]
    #[must_use]
    pub const fn is_master(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the controller does not know this replica.
    #[inline]
    #[must_use]
    pub const fn is_unknown(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Debug for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker({})", self.0)
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker-{}", self.0)
    }
}

impl From<i64> for BrokerId {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl From<BrokerId> for i64 {
    fn from(id: BrokerId) -> Self {
        id.get()
    }
}
