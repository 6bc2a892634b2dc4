/// Subscription bookkeeping: ids, filters, the pending buffer and the
/// default subscriptions issued on every connection cycle
use crate::event::Kind;
use crate::filter::Filter;
use crate::identity::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a subscription exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionPurpose {
    ChannelMetadata(String),
    ChannelFeed(String),
    User(PublicKey),
    /// Channels created by the local identity
    OwnChannels,
    /// Direct messages and channel creations tagged to the local identity
    Inbox,
    Custom,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub filters: Vec<Filter>,
    pub purpose: SubscriptionPurpose,
    pub created_at: i64,
    /// False once the pool that served it went away. Dead entries are
    /// pruned on the next connect.
    pub live: bool,
}

/// What the registry needs from the relay pool
pub trait SubscriptionLink {
    fn is_connected(&self) -> bool;
    fn send_subscribe(&mut self, id: &SubscriptionId, filters: &[Filter]);
    fn send_close(&mut self, id: &SubscriptionId);
}

/// Channel ids waiting for the pool to connect, in request order
#[derive(Debug, Clone, Default)]
pub struct PendingSubscriptionBuffer {
    channels: VecDeque<String>,
}

impl PendingSubscriptionBuffer {
    pub fn push(&mut self, channel_id: impl Into<String>) {
        self.channels.push_back(channel_id.into());
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.channels.iter().any(|c| c == channel_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    /// Take every entry in FIFO order, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<String> {
        self.channels.drain(..).collect()
    }
}

pub struct SubscriptionRegistry {
    subscriptions: Vec<Subscription>,
    pending: PendingSubscriptionBuffer,
    channel_feed_limit: usize,
    user_feed_limit: usize,
}

impl SubscriptionRegistry {
    pub fn new(channel_feed_limit: usize, user_feed_limit: usize) -> Self {
        Self {
            subscriptions: Vec::new(),
            pending: PendingSubscriptionBuffer::default(),
            channel_feed_limit,
            user_feed_limit,
        }
    }

    /// Issue a new subscription on the live pool.
    ///
    /// Never deduplicates: every call creates a new id. Returns `None` when
    /// the pool is not connected.
    pub fn subscribe_if_needed(
        &mut self,
        link: &mut dyn SubscriptionLink,
        filters: Vec<Filter>,
        purpose: SubscriptionPurpose,
    ) -> Option<SubscriptionId> {
        if !link.is_connected() {
            debug!(?purpose, "Pool not connected, subscription not issued");
            return None;
        }

        let id = SubscriptionId::generate();
        link.send_subscribe(&id, &filters);
        debug!(subscription_id = %id, ?purpose, "Subscription issued");

        self.subscriptions.push(Subscription {
            id: id.clone(),
            filters,
            purpose,
            created_at: chrono::Utc::now().timestamp(),
            live: true,
        });
        Some(id)
    }

    /// Subscribe to a channel's metadata and feed, or buffer the request
    /// until the pool connects.
    pub fn request_channel_subscription(
        &mut self,
        link: &mut dyn SubscriptionLink,
        channel_id: &str,
    ) -> Vec<SubscriptionId> {
        if !link.is_connected() {
            debug!(channel_id, "Pool not connected, buffering channel subscription");
            self.pending.push(channel_id);
            return Vec::new();
        }

        let metadata = Filter::new()
            .ids([channel_id])
            .kinds([Kind::ChannelCreation, Kind::ChannelMetadata]);
        let feed = Filter::new()
            .kinds([Kind::ChannelMessage])
            .tag('e', [channel_id])
            .limit(self.channel_feed_limit);

        [
            self.subscribe_if_needed(
                link,
                vec![metadata],
                SubscriptionPurpose::ChannelMetadata(channel_id.to_string()),
            ),
            self.subscribe_if_needed(
                link,
                vec![feed],
                SubscriptionPurpose::ChannelFeed(channel_id.to_string()),
            ),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Replay buffered channel requests in order, then the defaults.
    pub fn flush_pending_on_connect(
        &mut self,
        link: &mut dyn SubscriptionLink,
        me: Option<&PublicKey>,
    ) -> Vec<SubscriptionId> {
        let dead = self.prune_dead();
        if dead > 0 {
            debug!(dead, "Pruned subscriptions of the lost pool");
        }

        let channels = self.pending.drain();
        if !channels.is_empty() {
            info!(count = channels.len(), "Replaying buffered channel subscriptions");
        }

        let mut issued = Vec::new();
        for channel_id in &channels {
            issued.extend(self.request_channel_subscription(link, channel_id));
        }

        match me {
            Some(me) => issued.extend(self.issue_default_subscriptions(link, me)),
            None => warn!("No identity yet, default subscriptions not issued"),
        }
        issued
    }

    /// Own channel creations, plus DMs and creations tagged to us
    pub fn issue_default_subscriptions(
        &mut self,
        link: &mut dyn SubscriptionLink,
        me: &PublicKey,
    ) -> Vec<SubscriptionId> {
        let own_channels = Filter::new()
            .kinds([Kind::ChannelCreation])
            .authors([*me]);
        let inbox = Filter::new()
            .kinds([Kind::EncryptedDirectMessage, Kind::ChannelCreation])
            .pubkeys([*me]);

        [
            self.subscribe_if_needed(link, vec![own_channels], SubscriptionPurpose::OwnChannels),
            self.subscribe_if_needed(link, vec![inbox], SubscriptionPurpose::Inbox),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Conversation with `target` in both directions.
    ///
    /// Unlike channel requests this is not buffered while disconnected; the
    /// caller gets `None` and must retry after connecting.
    pub fn request_user_subscription(
        &mut self,
        link: &mut dyn SubscriptionLink,
        me: &PublicKey,
        target: &PublicKey,
    ) -> Option<SubscriptionId> {
        if !link.is_connected() {
            debug!(target = %target, "Pool not connected, user subscription dropped");
            return None;
        }

        let kinds = [Kind::EncryptedDirectMessage, Kind::ChannelCreation];
        let outgoing = Filter::new()
            .kinds(kinds)
            .authors([*me])
            .pubkeys([*target])
            .limit(self.user_feed_limit);
        let incoming = Filter::new()
            .kinds(kinds)
            .authors([*target])
            .pubkeys([*me])
            .limit(self.user_feed_limit);

        self.subscribe_if_needed(
            link,
            vec![outgoing, incoming],
            SubscriptionPurpose::User(*target),
        )
    }

    /// Close every subscription created since the last start. Returns how
    /// many were still live.
    pub fn close_all(&mut self, link: &mut dyn SubscriptionLink) -> usize {
        let subscriptions = std::mem::take(&mut self.subscriptions);
        let mut closed = 0;
        for sub in subscriptions.iter().filter(|s| s.live) {
            link.send_close(&sub.id);
            closed += 1;
        }
        debug!(closed, dropped = subscriptions.len() - closed, "Closed all subscriptions");
        closed
    }

    /// The last relay dropped: everything is dead relay-side. Channel feeds
    /// are queued again so the next connection restores them.
    pub fn on_pool_lost(&mut self) -> usize {
        let mut requeued = 0;
        for sub in self.subscriptions.iter_mut().filter(|s| s.live) {
            sub.live = false;
            if let SubscriptionPurpose::ChannelFeed(channel_id) = &sub.purpose {
                if !self.pending.contains(channel_id) {
                    self.pending.push(channel_id.clone());
                    requeued += 1;
                }
            }
        }
        if requeued > 0 {
            info!(requeued, "Pool lost, channel subscriptions queued for reconnect");
        }
        requeued
    }

    fn prune_dead(&mut self) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.live);
        before - self.subscriptions.len()
    }

    pub fn live(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter().filter(|s| s.live)
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| &s.id == id)
    }

    pub fn pending(&self) -> &PendingSubscriptionBuffer {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
