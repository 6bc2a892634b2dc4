/// Typed broadcast bus: one topic per kind of notification the core emits
use crate::leads::LeadChange;
use crate::relay::connection::{ConnectionState, RelayUrl};
use crate::router::RoutedEvent;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateChanged {
    pub relay: RelayUrl,
    pub state: ConnectionState,
}

/// Cheap to clone; clones publish to the same topics
#[derive(Debug, Clone)]
pub struct EventBus {
    connection: broadcast::Sender<ConnectionStateChanged>,
    routed: broadcast::Sender<RoutedEvent>,
    leads: broadcast::Sender<LeadChange>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (connection, _) = broadcast::channel(capacity);
        let (routed, _) = broadcast::channel(capacity);
        let (leads, _) = broadcast::channel(capacity);
        Self {
            connection,
            routed,
            leads,
        }
    }

    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionStateChanged> {
        self.connection.subscribe()
    }

    pub fn subscribe_routed(&self) -> broadcast::Receiver<RoutedEvent> {
        self.routed.subscribe()
    }

    pub fn subscribe_leads(&self) -> broadcast::Receiver<LeadChange> {
        self.leads.subscribe()
    }

    // Sending only fails when nobody listens, which is fine.

    pub fn emit_connection(&self, relay: RelayUrl, state: ConnectionState) {
        if self
            .connection
            .send(ConnectionStateChanged { relay, state })
            .is_err()
        {
            trace!("No connection-state listeners");
        }
    }

    pub fn emit_routed(&self, event: RoutedEvent) {
        if self.routed.send(event).is_err() {
            trace!("No routed-event listeners");
        }
    }

    pub fn emit_lead(&self, change: LeadChange) {
        if self.leads.send(change).is_err() {
            trace!("No lead listeners");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
