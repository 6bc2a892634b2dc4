/// Boundary to the relay wire protocol.
///
/// Every transport call is fire-and-forget; outcomes come back later as
/// [`TransportEvent`]s on the coordinator's inbound channel.
use crate::event::Event;
use crate::filter::Filter;
use crate::relay::connection::RelayUrl;
use crate::relay::subscription::SubscriptionId;
use std::sync::{Arc, Mutex};

/// Error reason a transport reports when the socket dropped under it
pub const SOCKET_NOT_CONNECTED: &str = "socket not connected";

pub trait RelayTransport: Send {
    fn connect(&mut self, relay: &RelayUrl);
    fn disconnect(&mut self, relay: &RelayUrl);
    fn publish(&mut self, relay: &RelayUrl, event: &Event);
    fn subscribe(&mut self, relay: &RelayUrl, id: &SubscriptionId, filters: &[Filter]);
    fn close(&mut self, relay: &RelayUrl, id: &SubscriptionId);
}

/// Callback from the transport, already decoded
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected {
        relay: RelayUrl,
    },
    Disconnected {
        relay: RelayUrl,
    },
    Error {
        relay: RelayUrl,
        reason: String,
    },
    Event {
        relay: RelayUrl,
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    EndOfStoredEvents {
        relay: RelayUrl,
        subscription_id: SubscriptionId,
    },
}

impl TransportEvent {
    pub fn relay(&self) -> &RelayUrl {
        match self {
            TransportEvent::Connected { relay }
            | TransportEvent::Disconnected { relay }
            | TransportEvent::Error { relay, .. }
            | TransportEvent::Event { relay, .. }
            | TransportEvent::EndOfStoredEvents { relay, .. } => relay,
        }
    }
}

/// Whether an error reason means the socket merely dropped
pub fn is_transient(reason: &str) -> bool {
    reason.to_ascii_lowercase().contains(SOCKET_NOT_CONNECTED)
}

/// What a [`RecordingTransport`] was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Connect(RelayUrl),
    Disconnect(RelayUrl),
    Publish(RelayUrl, Box<Event>),
    Subscribe(RelayUrl, SubscriptionId, Vec<Filter>),
    Close(RelayUrl, SubscriptionId),
}

/// Transport that only records commands; clones share one log.
/// Used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<Vec<TransportCommand>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, command: TransportCommand) {
        if let Ok(mut log) = self.log.lock() {
            log.push(command);
        }
    }

    pub fn commands(&self) -> Vec<TransportCommand> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Return and forget everything recorded so far
    pub fn take(&self) -> Vec<TransportCommand> {
        self.log
            .lock()
            .map(|mut log| std::mem::take(&mut *log))
            .unwrap_or_default()
    }

    pub fn subscriptions(&self) -> Vec<(RelayUrl, SubscriptionId, Vec<Filter>)> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                TransportCommand::Subscribe(relay, id, filters) => Some((relay, id, filters)),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> Vec<RelayUrl> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                TransportCommand::Connect(relay) => Some(relay),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<(RelayUrl, Event)> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                TransportCommand::Publish(relay, event) => Some((relay, *event)),
                _ => None,
            })
            .collect()
    }
}

impl RelayTransport for RecordingTransport {
    fn connect(&mut self, relay: &RelayUrl) {
        self.record(TransportCommand::Connect(relay.clone()));
    }

    fn disconnect(&mut self, relay: &RelayUrl) {
        self.record(TransportCommand::Disconnect(relay.clone()));
    }

    fn publish(&mut self, relay: &RelayUrl, event: &Event) {
        self.record(TransportCommand::Publish(relay.clone(), Box::new(event.clone())));
    }

    fn subscribe(&mut self, relay: &RelayUrl, id: &SubscriptionId, filters: &[Filter]) {
        self.record(TransportCommand::Subscribe(
            relay.clone(),
            id.clone(),
            filters.to_vec(),
        ));
    }

    fn close(&mut self, relay: &RelayUrl, id: &SubscriptionId) {
        self.record(TransportCommand::Close(relay.clone(), id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient("socket not connected"));
        assert!(is_transient("Socket Not Connected (os error 57)"));
        assert!(!is_transient("certificate verify failed"));
    }

    #[test]
    fn test_recording_transport_shares_log() {
        let relay: RelayUrl = "wss://a.example".parse().unwrap();
        let recorder = RecordingTransport::new();
        let mut transport = recorder.clone();

        transport.connect(&relay);
        transport.disconnect(&relay);

        assert_eq!(recorder.connects(), vec![relay.clone()]);
        assert_eq!(recorder.take().len(), 2);
        assert!(recorder.commands().is_empty());
    }
}
