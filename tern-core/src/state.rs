//! Replication connection state.
//!
//! Both endpoints of an HA channel run the same five-state machine, and
//! the state ordinal travels on the wire in every header, so the mapping
//! here is part of the protocol and must never be reordered.

use std::fmt;

/// State of one side of a master/slave replication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HaConnectionState {
    /// Not connected; the slave retries the master from here.
    #[default]
    Ready,
    /// Exchanging epoch histories to find the consistent point.
    Handshake,
    /// Streaming log data master to slave.
    Transfer,
    /// Parked; an external actor must resume the endpoint.
    Suspend,
    /// Terminal; resources released.
    Shutdown,
}

impl HaConnectionState {
    /// Returns the wire ordinal of this state.
    #[must_use]
    pub const fn as_wire(self) -> u32 {
        match self {
            Self::Ready => 0,
            Self::Handshake => 1,
            Self::Transfer => 2,
            Self::Suspend => 3,
            Self::Shutdown => 4,
        }
    }

    /// Decodes a wire ordinal, rejecting unknown values.
    #[must_use]
    pub const fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ready),
            1 => Some(Self::Handshake),
            2 => Some(Self::Transfer),
            3 => Some(Self::Suspend),
            4 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for HaConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "READY",
            Self::Handshake => "HANDSHAKE",
            Self::Transfer => "TRANSFER",
            Self::Suspend => "SUSPEND",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}
