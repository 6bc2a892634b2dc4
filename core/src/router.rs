/// Classifies relay deliveries by kind and hands each one on exactly once
use crate::event::{Event, EventId, Kind};
use crate::identity::PublicKey;
use crate::relay::subscription::SubscriptionId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// Whether an event was authored by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedEvent {
    ChannelCreated {
        subscription_id: SubscriptionId,
        direction: Direction,
        event: Event,
    },
    ChannelUpdated {
        subscription_id: SubscriptionId,
        channel_id: String,
        direction: Direction,
        event: Event,
    },
    ChannelMessage {
        subscription_id: SubscriptionId,
        channel_id: String,
        direction: Direction,
        event: Event,
    },
    DirectMessage {
        subscription_id: SubscriptionId,
        direction: Direction,
        event: Event,
    },
    /// Backlog for this subscription is done; later events are live
    CaughtUp { subscription_id: SubscriptionId },
}

impl RoutedEvent {
    pub fn subscription_id(&self) -> &SubscriptionId {
        match self {
            RoutedEvent::ChannelCreated { subscription_id, .. }
            | RoutedEvent::ChannelUpdated { subscription_id, .. }
            | RoutedEvent::ChannelMessage { subscription_id, .. }
            | RoutedEvent::DirectMessage { subscription_id, .. }
            | RoutedEvent::CaughtUp { subscription_id } => subscription_id,
        }
    }

    pub fn event(&self) -> Option<&Event> {
        match self {
            RoutedEvent::ChannelCreated { event, .. }
            | RoutedEvent::ChannelUpdated { event, .. }
            | RoutedEvent::ChannelMessage { event, .. }
            | RoutedEvent::DirectMessage { event, .. } => Some(event),
            RoutedEvent::CaughtUp { .. } => None,
        }
    }
}

/// How duplicate deliveries are detected.
///
/// `Adjacent` only compares against the previous delivery, so a duplicate
/// with anything in between passes through. `Window(n)` remembers the last
/// `n` ids across all relays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    #[default]
    Adjacent,
    Window(usize),
}

#[derive(Debug)]
struct Deduplicator {
    policy: DedupPolicy,
    last: Option<EventId>,
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl Deduplicator {
    fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            last: None,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id` and report whether it was already seen
    fn check(&mut self, id: EventId) -> bool {
        match self.policy {
            DedupPolicy::Adjacent => self.last.replace(id) == Some(id),
            DedupPolicy::Window(size) => {
                if self.seen.contains(&id) {
                    return true;
                }
                self.seen.insert(id);
                self.order.push_back(id);
                while self.order.len() > size.max(1) {
                    if let Some(old) = self.order.pop_front() {
                        self.seen.remove(&old);
                    }
                }
                false
            }
        }
    }
}

pub struct EventRouter {
    me: Option<PublicKey>,
    dedup: Deduplicator,
    /// Every channel event seen so far, keyed by channel id, in arrival order
    archive: HashMap<String, Vec<Event>>,
}

impl EventRouter {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            me: None,
            dedup: Deduplicator::new(policy),
            archive: HashMap::new(),
        }
    }

    pub fn set_identity(&mut self, me: PublicKey) {
        self.me = Some(me);
    }

    fn direction(&self, event: &Event) -> Direction {
        match &self.me {
            Some(me) if *me == event.pubkey => Direction::Outbound,
            _ => Direction::Inbound,
        }
    }

    fn archive(&mut self, channel_id: &str, event: &Event) {
        let events = self.archive.entry(channel_id.to_string()).or_default();
        if !events.iter().any(|e| e.id == event.id) {
            events.push(event.clone());
        }
    }

    /// Route one delivered event. `None` means duplicate or not ours to route.
    pub fn route(&mut self, subscription_id: SubscriptionId, event: Event) -> Option<RoutedEvent> {
        if self.dedup.check(event.id) {
            trace!(event_id = %event.id, "Dropping duplicate delivery");
            return None;
        }

        let direction = self.direction(&event);
        match event.kind {
            Kind::ChannelCreation => {
                self.archive(&event.id.to_hex(), &event);
                Some(RoutedEvent::ChannelCreated {
                    subscription_id,
                    direction,
                    event,
                })
            }
            Kind::ChannelMetadata | Kind::ChannelMessage => {
                let Some(channel_id) = event.channel_id() else {
                    debug!(event_id = %event.id, kind = event.kind.as_u16(), "Channel event without channel reference, dropping");
                    return None;
                };
                self.archive(&channel_id, &event);
                if event.kind == Kind::ChannelMetadata {
                    Some(RoutedEvent::ChannelUpdated {
                        subscription_id,
                        channel_id,
                        direction,
                        event,
                    })
                } else {
                    Some(RoutedEvent::ChannelMessage {
                        subscription_id,
                        channel_id,
                        direction,
                        event,
                    })
                }
            }
            Kind::EncryptedDirectMessage => Some(RoutedEvent::DirectMessage {
                subscription_id,
                direction,
                event,
            }),
            other => {
                debug!(event_id = %event.id, kind = other.as_u16(), "Ignoring event of unrouted kind");
                None
            }
        }
    }

    /// Archive a channel event we just published so it can be deleted
    /// before the relay echo arrives
    pub fn archive_outbound(&mut self, event: &Event) {
        if let Some(channel_id) = event.channel_id() {
            self.archive(&channel_id, event);
        }
    }

    pub fn end_of_stored_events(&self, subscription_id: SubscriptionId) -> RoutedEvent {
        debug!(subscription_id = %subscription_id, "Caught up");
        RoutedEvent::CaughtUp { subscription_id }
    }

    pub fn archived(&self, channel_id: &str) -> &[Event] {
        self.archive
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Archived events of a channel that `author` may ask relays to delete
    pub fn deletion_targets(&self, channel_id: &str, author: &PublicKey) -> Vec<EventId> {
        self.archived(channel_id)
            .iter()
            .filter(|e| &e.pubkey == author)
            .map(|e| e.id)
            .collect()
    }

    pub fn forget_channel(&mut self, channel_id: &str) -> usize {
        self.archive
            .remove(channel_id)
            .map(|events| events.len())
            .unwrap_or(0)
    }
}
