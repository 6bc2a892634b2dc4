//! Shared helpers for the integration tests
#![allow(dead_code)]

use spotlink_core::relay::{RecordingTransport, RelayUrl, SubscriptionId, TransportEvent};
use spotlink_core::store::MemoryStore;
use spotlink_core::{Config, Coordinator, Event, Keys};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub const RELAY_A: &str = "wss://a.example";
pub const RELAY_B: &str = "wss://b.example";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn relay(url: &str) -> RelayUrl {
    url.parse().unwrap()
}

pub fn config(relays: &[&str]) -> Config {
    Config {
        relays: relays.iter().map(|r| r.to_string()).collect(),
        consent_granted: true,
        ..Default::default()
    }
}

pub struct Harness {
    pub coordinator: Coordinator<RecordingTransport>,
    pub transport: RecordingTransport,
    pub store: MemoryStore,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        init_tracing();
        let transport = RecordingTransport::new();
        let store = MemoryStore::new();
        let coordinator =
            Coordinator::new(&config, transport.clone(), Arc::new(store.clone())).unwrap();
        Self {
            coordinator,
            transport,
            store,
        }
    }

    /// Started coordinator with an identity, first relay connected
    pub fn connected(relays: &[&str]) -> (Self, Keys) {
        let mut harness = Self::new(config(relays));
        let keys = Keys::generate();
        harness.coordinator.set_identity(keys.clone()).unwrap();
        harness.coordinator.start();
        harness.connect(relays[0]);
        (harness, keys)
    }

    pub fn connect(&mut self, url: &str) {
        self.coordinator
            .handle_transport_event(TransportEvent::Connected { relay: relay(url) });
    }

    pub fn deliver(&mut self, url: &str, subscription_id: &str, event: Event) {
        self.coordinator.handle_transport_event(TransportEvent::Event {
            relay: relay(url),
            subscription_id: SubscriptionId::new(subscription_id),
            event: Box::new(event),
        });
    }
}
