/// Relay pool lifecycle: consent gating, connect/reconnect, subscription
/// replay and the one-time onboarding message
use crate::config::Config;
use crate::crypto::{encode_envelope, encrypt, ContentKind};
use crate::error::Result;
use crate::event::{Event, EventBuilder, Kind, Tag};
use crate::filter::Filter;
use crate::identity::{self, Keys, PublicKey};
use crate::relay::connection::{ConnectionState, RelayPool, RelayUrl};
use crate::relay::subscription::{
    SubscriptionId, SubscriptionLink, SubscriptionPurpose, SubscriptionRegistry,
};
use crate::relay::transport::{is_transient, RelayTransport, TransportEvent};
use crate::store::{KvStore, ONBOARDING_KEY};
use crate::utils::event_bus::EventBus;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Plaintext of the presence message sent during onboarding
pub const ONLINE_MESSAGE: &str = "online";

pub const RECONNECT_LIMIT_REACHED: &str = "reconnect limit reached";

/// Relay payload handed on to the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDelivery {
    Event {
        subscription_id: SubscriptionId,
        event: Event,
    },
    EndOfStoredEvents {
        subscription_id: SubscriptionId,
    },
}

/// What took a relay down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropCause {
    /// Transient socket error; the transport still owes a close callback
    Error,
    Closed,
}

/// Sends registry traffic to every connected relay of the pool
struct PoolLink<'a> {
    pool: &'a RelayPool,
    transport: &'a mut dyn RelayTransport,
}

impl SubscriptionLink for PoolLink<'_> {
    fn is_connected(&self) -> bool {
        self.pool.is_connected()
    }

    fn send_subscribe(&mut self, id: &SubscriptionId, filters: &[Filter]) {
        for relay in self.pool.connected_urls() {
            self.transport.subscribe(&relay, id, filters);
        }
    }

    fn send_close(&mut self, id: &SubscriptionId) {
        for relay in self.pool.connected_urls() {
            self.transport.close(&relay, id);
        }
    }
}

pub struct RelayConnectionManager<T: RelayTransport> {
    relays: Vec<RelayUrl>,
    pool: RelayPool,
    transport: T,
    registry: SubscriptionRegistry,
    store: Arc<dyn KvStore>,
    identity: Option<Keys>,
    support_pubkey: Option<PublicKey>,
    consent_granted: bool,
    /// Cleared by `stop()`; suppresses every automatic reconnect
    running: bool,
    max_reconnect_attempts: u32,
    bus: EventBus,
}

impl<T: RelayTransport> RelayConnectionManager<T> {
    pub fn new(config: &Config, transport: T, store: Arc<dyn KvStore>, bus: EventBus) -> Result<Self> {
        let relays = config.relay_urls()?;
        let support_pubkey = config.support_key()?;
        let identity = identity::load(store.as_ref())?;

        Ok(Self {
            relays,
            pool: RelayPool::default(),
            transport,
            registry: SubscriptionRegistry::new(config.channel_feed_limit, config.user_feed_limit),
            store,
            identity,
            support_pubkey,
            consent_granted: config.consent_granted,
            running: false,
            max_reconnect_attempts: config.max_reconnect_attempts,
            bus,
        })
    }

    pub fn set_consent(&mut self, granted: bool) {
        self.consent_granted = granted;
    }

    /// Use an externally supplied keypair and persist it as the identity
    pub fn set_identity(&mut self, keys: Keys) -> Result<()> {
        self.store.set(crate::store::IDENTITY_KEY, &keys.secret_hex())?;
        self.identity = Some(keys);
        Ok(())
    }

    pub fn identity(&self) -> Option<&Keys> {
        self.identity.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Open connections to every configured relay. No-op without consent.
    pub fn start(&mut self) {
        if !self.consent_granted {
            info!("Network consent not granted, not starting");
            return;
        }
        if self.running {
            debug!("Already running");
            return;
        }

        info!(relays = self.relays.len(), "Starting relay pool");
        self.running = true;
        if self.pool.is_empty() {
            self.pool = RelayPool::new(self.relays.iter().cloned());
        }
        for relay in self.pool.connectable_urls() {
            self.connect(&relay);
        }
    }

    /// Close every subscription, disconnect every relay and suppress
    /// reconnects until the next `start()`
    pub fn stop(&mut self) {
        if !self.running {
            debug!("Stop requested while not running");
        }
        self.running = false;

        let mut link = PoolLink {
            pool: &self.pool,
            transport: &mut self.transport,
        };
        let closed = self.registry.close_all(&mut link);

        let relays: Vec<RelayUrl> = self.pool.all().iter().map(|r| r.url.clone()).collect();
        for relay in &relays {
            if self.pool.state(relay) != Some(&ConnectionState::Disconnected) {
                self.transport.disconnect(relay);
            }
            self.set_state(relay, ConnectionState::Disconnected);
            if let Some(connection) = self.pool.get_mut(relay) {
                connection.pending_closes = 0;
            }
        }
        info!(closed, "Relay pool stopped");
    }

    /// Connect every relay that is neither connected nor connecting.
    /// Explicit retries also revive relays left in `error`.
    pub fn reconnect_if_needed(&mut self) {
        if !self.consent_granted {
            debug!("Network consent not granted, not reconnecting");
            return;
        }
        if !self.running {
            debug!("Not running, reconnect ignored");
            return;
        }
        if self.pool.is_empty() {
            info!("Recreating empty relay pool");
            self.pool = RelayPool::new(self.relays.iter().cloned());
        }

        for relay in self.pool.connectable_urls() {
            if let Some(connection) = self.pool.get_mut(&relay) {
                connection.reconnect_attempts = 0;
                connection.pending_closes = 0;
            }
            self.connect(&relay);
        }
    }

    /// Hand a signed event to every connected relay. Returns how many
    /// relays it went to; acknowledgments are not awaited.
    pub fn publish(&mut self, event: &Event) -> usize {
        if !self.running {
            debug!(event_id = %event.id, "Not running, event not published");
            return 0;
        }

        let relays = self.pool.connected_urls();
        for relay in &relays {
            self.transport.publish(relay, event);
        }
        debug!(event_id = %event.id, relays = relays.len(), "Event published");
        relays.len()
    }

    pub fn subscribe(&mut self, filters: Vec<Filter>) -> Option<SubscriptionId> {
        let mut link = PoolLink {
            pool: &self.pool,
            transport: &mut self.transport,
        };
        self.registry
            .subscribe_if_needed(&mut link, filters, SubscriptionPurpose::Custom)
    }

    pub fn subscribe_channel(&mut self, channel_id: &str) -> Vec<SubscriptionId> {
        let mut link = PoolLink {
            pool: &self.pool,
            transport: &mut self.transport,
        };
        self.registry.request_channel_subscription(&mut link, channel_id)
    }

    pub fn subscribe_user(&mut self, target: &PublicKey) -> Option<SubscriptionId> {
        let Some(me) = self.identity.as_ref().map(Keys::public_key) else {
            warn!(target = %target, "No identity, cannot subscribe to user");
            return None;
        };
        let mut link = PoolLink {
            pool: &self.pool,
            transport: &mut self.transport,
        };
        self.registry.request_user_subscription(&mut link, &me, target)
    }

    /// Apply a transport callback. Relay payloads come back for routing.
    pub fn handle(&mut self, event: TransportEvent) -> Option<RelayDelivery> {
        match event {
            TransportEvent::Connected { relay } => {
                self.on_connected(&relay);
                None
            }
            TransportEvent::Disconnected { relay } => {
                self.on_dropped(&relay, DropCause::Closed);
                None
            }
            TransportEvent::Error { relay, reason } => {
                if is_transient(&reason) {
                    debug!(relay = %relay, reason = %reason, "Transient relay error");
                    self.on_dropped(&relay, DropCause::Error);
                } else {
                    self.on_failed(&relay, reason);
                }
                None
            }
            TransportEvent::Event {
                relay,
                subscription_id,
                event,
            } => {
                if !self.accepts_payload(&relay) {
                    return None;
                }
                if !self.matches_subscription(&subscription_id, &event) {
                    debug!(
                        relay = %relay,
                        subscription_id = %subscription_id,
                        event_id = %event.id,
                        "Event outside its subscription's filters, dropping"
                    );
                    return None;
                }
                Some(RelayDelivery::Event {
                    subscription_id,
                    event: *event,
                })
            }
            TransportEvent::EndOfStoredEvents {
                relay,
                subscription_id,
            } => {
                if !self.accepts_payload(&relay) {
                    return None;
                }
                Some(RelayDelivery::EndOfStoredEvents { subscription_id })
            }
        }
    }

    fn accepts_payload(&self, relay: &RelayUrl) -> bool {
        if !self.running {
            trace!(relay = %relay, "Stopped, dropping relay payload");
            return false;
        }
        if self.pool.get(relay).is_none() {
            trace!(relay = %relay, "Payload from relay outside the pool");
            return false;
        }
        true
    }

    /// Events for subscriptions this registry issued must match one of its
    /// filters. Unknown ids are passed through.
    fn matches_subscription(&self, subscription_id: &SubscriptionId, event: &Event) -> bool {
        self.registry
            .get(subscription_id)
            .map_or(true, |sub| sub.filters.iter().any(|f| f.matches(event)))
    }

    fn connect(&mut self, relay: &RelayUrl) {
        debug!(relay = %relay, "Connecting");
        self.set_state(relay, ConnectionState::Connecting);
        self.transport.connect(relay);
    }

    fn set_state(&mut self, relay: &RelayUrl, state: ConnectionState) {
        if let Some(previous) = self.pool.set_state(relay, state.clone()) {
            if previous != state {
                debug!(relay = %relay, from = ?previous, to = ?state, "Relay state changed");
                self.bus.emit_connection(relay.clone(), state);
            }
        }
    }

    fn on_connected(&mut self, relay: &RelayUrl) {
        if !self.running {
            debug!(relay = %relay, "Connected after stop, disconnecting");
            self.transport.disconnect(relay);
            return;
        }
        if self.pool.get(relay).is_none() {
            warn!(relay = %relay, "Connect callback for unknown relay");
            return;
        }

        let pool_was_connected = self.pool.is_connected();
        self.set_state(relay, ConnectionState::Connected);
        info!(relay = %relay, "Relay connected");

        if pool_was_connected {
            // late joiner: serve it the same filters as the rest of the pool
            for sub in self.registry.live() {
                self.transport.subscribe(relay, &sub.id, &sub.filters);
            }
            return;
        }

        let me = self.identity.as_ref().map(Keys::public_key);
        let mut link = PoolLink {
            pool: &self.pool,
            transport: &mut self.transport,
        };
        self.registry.flush_pending_on_connect(&mut link, me.as_ref());

        match self.run_onboarding() {
            Ok(true) => {
                // identity was created just now, defaults could not go out yet
                if let Some(me) = self.identity.as_ref().map(Keys::public_key) {
                    let mut link = PoolLink {
                        pool: &self.pool,
                        transport: &mut self.transport,
                    };
                    self.registry.issue_default_subscriptions(&mut link, &me);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Onboarding failed, will retry on next connection: {}", e),
        }
    }

    fn on_dropped(&mut self, relay: &RelayUrl, cause: DropCause) {
        let Some(connection) = self.pool.get_mut(relay) else {
            return;
        };
        match (&connection.state, cause) {
            (ConnectionState::Disconnected | ConnectionState::Error(_), _) => {
                trace!(relay = %relay, state = ?connection.state, "Relay already down, ignoring drop");
                return;
            }
            (ConnectionState::Connecting, DropCause::Closed) if connection.pending_closes > 0 => {
                // close of the socket whose error already triggered this attempt
                connection.pending_closes -= 1;
                trace!(relay = %relay, "Close of a failed socket, attempt still in flight");
                return;
            }
            _ => {}
        }
        let attempts = connection.reconnect_attempts;

        self.set_state(relay, ConnectionState::Disconnected);
        self.check_pool_lost();

        if !self.running {
            debug!(relay = %relay, "Stopped, not reconnecting");
            return;
        }
        if attempts >= self.max_reconnect_attempts {
            warn!(relay = %relay, attempts, "Giving up on relay");
            self.set_state(relay, ConnectionState::Error(RECONNECT_LIMIT_REACHED.to_string()));
            return;
        }

        info!(relay = %relay, attempt = attempts + 1, "Reconnecting");
        self.connect(relay);
        if let Some(connection) = self.pool.get_mut(relay) {
            connection.reconnect_attempts = attempts + 1;
            if cause == DropCause::Error {
                connection.pending_closes += 1;
            }
        }
    }

    fn on_failed(&mut self, relay: &RelayUrl, reason: String) {
        if self.pool.get(relay).is_none() {
            return;
        }
        warn!(relay = %relay, reason = %reason, "Relay error, no automatic reconnect");
        self.set_state(relay, ConnectionState::Error(reason));
        self.check_pool_lost();
    }

    fn check_pool_lost(&mut self) {
        if !self.pool.is_connected() && self.registry.live().next().is_some() {
            info!("Lost every relay connection");
            self.registry.on_pool_lost();
        }
    }

    /// Returns whether the identity was created by this call
    fn run_onboarding(&mut self) -> Result<bool> {
        if self.store.get(ONBOARDING_KEY)?.is_some() {
            return Ok(false);
        }

        let created = self.identity.is_none();
        let keys = match &self.identity {
            Some(keys) => keys.clone(),
            None => {
                let keys = identity::load_or_create(self.store.as_ref())?;
                self.identity = Some(keys.clone());
                keys
            }
        };

        match self.support_pubkey {
            Some(support) => {
                let content = encrypt(
                    &encode_envelope(ONLINE_MESSAGE, ContentKind::Text),
                    &support,
                    &keys,
                )?;
                let event = EventBuilder::new(Kind::EncryptedDirectMessage, content)
                    .tag(Tag::pubkey(&support))
                    .sign(&keys)?;
                self.publish(&event);
            }
            None => debug!("No support recipient configured, skipping presence message"),
        }

        self.store.set(ONBOARDING_KEY, "true")?;
        info!(pubkey = %keys.public_key(), "Onboarding completed");
        Ok(created)
    }
}
