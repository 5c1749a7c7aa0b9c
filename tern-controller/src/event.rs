//! Events produced by request handlers and the result envelope.
//!
//! An event describes a state mutation without performing it; epochs are
//! derived inside `apply_event` so monotonicity is enforced in exactly one
//! place.

use std::collections::HashSet;

use tern_core::BrokerId;

/// A committed mutation of the replica metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A replica address joined a broker group.
    BrokerRegistered {
        /// Cluster the group belongs to.
        cluster_name: String,
        /// Broker group name.
        broker_name: String,
        /// The registering replica's address.
        broker_address: String,
        /// The replica's replication listener, if provided.
        broker_ha_address: Option<String>,
        /// Id allocated to the address.
        assigned_id: BrokerId,
    },
    /// A master election concluded.
    MasterElected {
        /// Broker group the election was for.
        broker_name: String,
        /// The elected address; empty when no candidate existed.
        new_master_address: String,
        /// False when the election failed and the master slot was cleared.
        new_master_elected: bool,
    },
    /// The master replaced the in-sync replica set.
    SyncStateSetAltered {
        /// Broker group being altered.
        broker_name: String,
        /// The accepted set.
        new_sync_state_set: HashSet<String>,
    },
}

/// The outcome of one controller request: events to commit plus the
/// response to send once they are applied.
#[derive(Debug, Clone)]
pub struct ControllerResult<T> {
    events: Vec<Event>,
    response: T,
}

impl<T> ControllerResult<T> {
    /// Creates a result with no events (read-only or rejected requests).
    pub const fn of(response: T) -> Self {
        Self {
            events: Vec::new(),
            response,
        }
    }

    /// Creates a result carrying events.
    pub const fn with_events(events: Vec<Event>, response: T) -> Self {
        Self { events, response }
    }

    /// Appends an event.
    pub fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Returns the events to commit, in order.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Returns the response.
    #[must_use]
    pub const fn response(&self) -> &T {
        &self.response
    }

    /// Consumes the result, returning events and response.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Event>, T) {
        (self.events, self.response)
    }
}
