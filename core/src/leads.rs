/// Known channels ("leads") and the per-correspondent unread index.
///
/// This is the read model the UI observes. Every mutation goes through
/// [`LeadsCache`] and is announced on the event bus.
use crate::crypto::{decode_envelope, decrypt, ContentEnvelope, ContentKind};
use crate::error::Result;
use crate::event::{Event, EventId, Kind};
use crate::identity::{Keys, PublicKey};
use crate::router::RoutedEvent;
use crate::store::{read_marker_key, KvStore};
use crate::utils::event_bus::EventBus;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shown in place of a message that could not be decrypted
pub const UNREADABLE_PLACEHOLDER: &str = "…";

const LONG_TEXT_LIMIT: usize = 80;
const SECRET_KEY_PREFIX: &str = "nsec1";

const PALETTE: [&str; 8] = [
    "#E4572E", "#17BEBB", "#FFC914", "#2E282A", "#76B041", "#6C4AB6", "#F25F5C", "#247BA0",
];

/// Stable display color for a channel
pub fn lead_color(channel_id: &str) -> &'static str {
    let digest = Sha256::digest(channel_id.as_bytes());
    PALETTE[digest[0] as usize % PALETTE.len()]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// JSON content of channel creation and metadata events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl ChannelMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn at(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn from_content(content: &str) -> Option<Self> {
        serde_json::from_str(content).ok()
    }

    pub fn to_content(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinate {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}

/// One discovered channel
#[derive(Debug, Clone, PartialEq)]
pub struct Lead {
    pub channel_id: String,
    pub name: String,
    pub icon: Option<String>,
    pub coordinate: Option<Coordinate>,
    /// Creation event backing this lead, when it was seen on the wire
    pub event: Option<Event>,
    pub metadata: Option<ChannelMetadata>,
    pub color: String,
    /// Newest event timestamp seen for the channel
    pub last_activity: i64,
}

impl Lead {
    pub fn new(channel_id: impl Into<String>) -> Self {
        let channel_id = channel_id.into();
        Self {
            name: channel_id.clone(),
            color: lead_color(&channel_id).to_string(),
            channel_id,
            icon: None,
            coordinate: None,
            event: None,
            metadata: None,
            last_activity: 0,
        }
    }

    /// Lead for a channel creation event. Unparseable metadata keeps the
    /// channel id as name.
    pub fn from_creation(event: &Event) -> Self {
        let mut lead = Lead::new(event.id.to_hex());
        lead.event = Some(event.clone());
        lead.last_activity = event.created_at;
        if let Some(metadata) = ChannelMetadata::from_content(&event.content) {
            lead.apply_metadata(metadata);
        }
        lead
    }

    pub fn apply_metadata(&mut self, metadata: ChannelMetadata) {
        if !metadata.name.is_empty() {
            self.name = metadata.name.clone();
        }
        if metadata.picture.is_some() {
            self.icon = metadata.picture.clone();
        }
        if let Some(coordinate) = metadata.coordinate() {
            self.coordinate = Some(coordinate);
        }
        self.metadata = Some(metadata);
    }
}

/// Lead as persisted by the host application, used to seed the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub channel_id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl From<LeadRecord> for Lead {
    fn from(record: LeadRecord) -> Self {
        let mut lead = Lead::new(record.channel_id);
        lead.name = record.name;
        lead.icon = record.icon;
        if let (Some(latitude), Some(longitude)) = (record.latitude, record.longitude) {
            lead.coordinate = Some(Coordinate {
                latitude,
                longitude,
            });
        }
        lead
    }
}

/// Change notification for the leads topic
#[derive(Debug, Clone, PartialEq)]
pub enum LeadChange {
    Upserted { lead: Lead },
    Removed { channel_id: String },
    UnreadChanged { correspondent: PublicKey, unread: u32 },
}

/// One line of the activity log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub event_id: EventId,
    pub author: PublicKey,
    pub correspondent: PublicKey,
    pub kind: Kind,
    pub channel_id: Option<String>,
    pub created_at: i64,
    /// `None` when the content could not be decrypted
    pub content_kind: Option<ContentKind>,
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationGroup {
    pub correspondent: PublicKey,
    pub npub: String,
    pub unread: u32,
    /// Newest first
    pub entries: Vec<ActivityEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ReadState {
    last_read: Option<i64>,
    unread: u32,
}

pub struct LeadsCache {
    leads: Vec<Lead>,
    activity: Vec<ActivityEntry>,
    recorded: HashSet<EventId>,
    read_state: HashMap<PublicKey, ReadState>,
    blacklist: HashSet<PublicKey>,
    identity: Option<Keys>,
    store: Arc<dyn KvStore>,
    bus: EventBus,
}

impl LeadsCache {
    pub fn new(store: Arc<dyn KvStore>, bus: EventBus) -> Self {
        Self {
            leads: Vec::new(),
            activity: Vec::new(),
            recorded: HashSet::new(),
            read_state: HashMap::new(),
            blacklist: HashSet::new(),
            identity: None,
            store,
            bus,
        }
    }

    pub fn set_identity(&mut self, keys: Keys) {
        self.identity = Some(keys);
    }

    pub fn set_blacklist(&mut self, blacklist: impl IntoIterator<Item = PublicKey>) {
        self.blacklist = blacklist.into_iter().collect();
    }

    fn me(&self) -> Option<PublicKey> {
        self.identity.as_ref().map(Keys::public_key)
    }

    /// Replace the lead with the same channel id, or append
    pub fn upsert(&mut self, lead: Lead) {
        match self
            .leads
            .iter_mut()
            .find(|l| l.channel_id == lead.channel_id)
        {
            Some(existing) => *existing = lead.clone(),
            None => self.leads.push(lead.clone()),
        }
        debug!(channel_id = %lead.channel_id, name = %lead.name, "Lead upserted");
        self.bus.emit_lead(LeadChange::Upserted { lead });
    }

    pub fn remove(&mut self, channel_id: &str) -> usize {
        let before = self.leads.len();
        self.leads.retain(|l| l.channel_id != channel_id);
        let removed = before - self.leads.len();
        if removed > 0 {
            debug!(channel_id, "Lead removed");
            self.bus.emit_lead(LeadChange::Removed {
                channel_id: channel_id.to_string(),
            });
        }
        removed
    }

    pub fn seed(&mut self, records: impl IntoIterator<Item = LeadRecord>) {
        for record in records {
            self.upsert(record.into());
        }
    }

    /// Fold a routed event into the read model
    pub fn apply(&mut self, routed: &RoutedEvent) {
        match routed {
            RoutedEvent::ChannelCreated { event, .. } => {
                let channel_id = event.id.to_hex();
                let lead = match self.lead(&channel_id).cloned() {
                    // replayed creation: metadata applied since then wins
                    Some(mut existing) => {
                        existing.event = Some(event.clone());
                        existing.last_activity = existing.last_activity.max(event.created_at);
                        existing
                    }
                    None => Lead::from_creation(event),
                };
                self.upsert(lead);
            }
            RoutedEvent::ChannelUpdated {
                channel_id, event, ..
            } => {
                let Some(metadata) = ChannelMetadata::from_content(&event.content) else {
                    debug!(channel_id = %channel_id, "Unparseable channel metadata, ignoring");
                    return;
                };
                match self.lead(channel_id).cloned() {
                    Some(mut lead) => {
                        lead.apply_metadata(metadata);
                        self.upsert(lead);
                    }
                    None => debug!(channel_id = %channel_id, "Metadata for unknown channel"),
                }
            }
            RoutedEvent::ChannelMessage {
                channel_id, event, ..
            } => {
                if let Some(mut lead) = self.lead(channel_id).cloned() {
                    if event.created_at > lead.last_activity {
                        lead.last_activity = event.created_at;
                        self.upsert(lead);
                    }
                }
                self.record_incoming_event(event);
            }
            RoutedEvent::DirectMessage { event, .. } => {
                self.record_incoming_event(event);
            }
            RoutedEvent::CaughtUp { .. } => {}
        }
    }

    /// Add an event to the activity log and bump the unread count when it is
    /// newer than the correspondent's last-read marker. Returns whether the
    /// event was recorded.
    pub fn record_incoming_event(&mut self, event: &Event) -> bool {
        if self.recorded.contains(&event.id) {
            return false;
        }
        if self.blacklist.contains(&event.pubkey) {
            debug!(author = %event.pubkey, "Ignoring event from blacklisted author");
            return false;
        }

        let me = self.me();
        let correspondent = match (event.kind, me) {
            (Kind::EncryptedDirectMessage, Some(me)) => event.counterparty(&me),
            _ => Some(event.pubkey),
        };
        let Some(correspondent) = correspondent else {
            debug!(event_id = %event.id, "No correspondent for event");
            return false;
        };

        let (content_kind, display) = self.describe(event, &correspondent);
        self.recorded.insert(event.id);
        self.activity.push(ActivityEntry {
            event_id: event.id,
            author: event.pubkey,
            correspondent,
            kind: event.kind,
            channel_id: event.channel_id(),
            created_at: event.created_at,
            content_kind,
            display,
        });

        if Some(event.pubkey) == me {
            return true;
        }

        let state = self.read_state_mut(&correspondent);
        if event.created_at > state.last_read.unwrap_or(i64::MIN) {
            state.unread += 1;
            let unread = state.unread;
            self.bus.emit_lead(LeadChange::UnreadChanged {
                correspondent,
                unread,
            });
        }
        true
    }

    /// Zero the unread count and advance the last-read marker. The marker
    /// never moves backwards.
    pub fn mark_read(&mut self, correspondent: &PublicKey, timestamp: i64) -> Result<()> {
        let state = self.read_state_mut(correspondent);
        let last_read = state.last_read.map_or(timestamp, |t| t.max(timestamp));
        state.last_read = Some(last_read);
        state.unread = 0;

        self.bus.emit_lead(LeadChange::UnreadChanged {
            correspondent: *correspondent,
            unread: 0,
        });
        self.store.set(
            &read_marker_key(&correspondent.to_hex()),
            &last_read.to_string(),
        )
    }

    fn read_state_mut(&mut self, correspondent: &PublicKey) -> &mut ReadState {
        let store = &self.store;
        self.read_state.entry(*correspondent).or_insert_with(|| {
            let last_read = match store.get(&read_marker_key(&correspondent.to_hex())) {
                Ok(value) => value.and_then(|v| v.parse().ok()),
                Err(e) => {
                    warn!(correspondent = %correspondent, "Failed to load read marker: {}", e);
                    None
                }
            };
            ReadState {
                last_read,
                unread: 0,
            }
        })
    }

    fn describe(&self, event: &Event, correspondent: &PublicKey) -> (Option<ContentKind>, String) {
        let plaintext = if event.kind == Kind::EncryptedDirectMessage {
            let Some(keys) = &self.identity else {
                return (None, UNREADABLE_PLACEHOLDER.to_string());
            };
            match decrypt(&event.content, correspondent, &keys.secret_key()) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    debug!(event_id = %event.id, "Unreadable direct message: {}", e);
                    return (None, UNREADABLE_PLACEHOLDER.to_string());
                }
            }
        } else {
            event.content.clone()
        };

        let envelope = decode_envelope(&plaintext);
        let display = match &envelope {
            ContentEnvelope::Invite(_) => "Invited you to a channel".to_string(),
            ContentEnvelope::Invoice(_) => "Sent a payment request".to_string(),
            ContentEnvelope::Photo { .. } => "Sent a photo".to_string(),
            ContentEnvelope::Video { .. } => "Sent a video".to_string(),
            ContentEnvelope::Text(text) if text.trim_start().starts_with(SECRET_KEY_PREFIX) => {
                "Shared a private key".to_string()
            }
            ContentEnvelope::Text(text) if text.chars().count() > LONG_TEXT_LIMIT => {
                let head: String = text.chars().take(LONG_TEXT_LIMIT).collect();
                format!("{}{}", head.trim_end(), UNREADABLE_PLACEHOLDER)
            }
            ContentEnvelope::Text(text) => text.clone(),
        };
        (Some(envelope.kind()), display)
    }

    pub fn leads(&self) -> &[Lead] {
        &self.leads
    }

    pub fn lead(&self, channel_id: &str) -> Option<&Lead> {
        self.leads.iter().find(|l| l.channel_id == channel_id)
    }

    pub fn activity(&self) -> &[ActivityEntry] {
        &self.activity
    }

    pub fn unread_count(&self, correspondent: &PublicKey) -> u32 {
        self.read_state
            .get(correspondent)
            .map(|s| s.unread)
            .unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.read_state.values().map(|s| s.unread).sum()
    }

    pub fn last_read(&self, correspondent: &PublicKey) -> Option<i64> {
        self.read_state.get(correspondent).and_then(|s| s.last_read)
    }

    /// Activity grouped by correspondent, newest conversation first. Our own
    /// messages are left out.
    pub fn grouped_by_correspondent(&self) -> Vec<ConversationGroup> {
        let me = self.me();
        let mut groups: HashMap<PublicKey, Vec<ActivityEntry>> = HashMap::new();
        for entry in &self.activity {
            if Some(entry.author) == me || Some(entry.correspondent) == me {
                continue;
            }
            groups
                .entry(entry.correspondent)
                .or_default()
                .push(entry.clone());
        }

        let mut groups: Vec<ConversationGroup> = groups
            .into_iter()
            .map(|(correspondent, mut entries)| {
                entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                ConversationGroup {
                    npub: correspondent.to_npub(),
                    unread: self.unread_count(&correspondent),
                    correspondent,
                    entries,
                }
            })
            .collect();
        groups.sort_by(|a, b| {
            let newest = |g: &ConversationGroup| g.entries.first().map(|e| e.created_at);
            newest(b).cmp(&newest(a))
        });
        groups
    }
}
