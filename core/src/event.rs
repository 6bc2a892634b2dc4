/// Signed, content-addressed events as delivered by relays
use crate::error::{Result, SyncError};
use crate::identity::{Keys, PublicKey};
use secp256k1::{schnorr, Message, SECP256K1};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Event kinds the core understands; everything else is carried as `Other`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum Kind {
    EncryptedDirectMessage,
    Deletion,
    ChannelCreation,
    ChannelMetadata,
    ChannelMessage,
    Other(u16),
}

impl From<u16> for Kind {
    fn from(value: u16) -> Self {
        match value {
            4 => Kind::EncryptedDirectMessage,
            5 => Kind::Deletion,
            40 => Kind::ChannelCreation,
            41 => Kind::ChannelMetadata,
            42 => Kind::ChannelMessage,
            other => Kind::Other(other),
        }
    }
}

impl From<Kind> for u16 {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::EncryptedDirectMessage => 4,
            Kind::Deletion => 5,
            Kind::ChannelCreation => 40,
            Kind::ChannelMetadata => 41,
            Kind::ChannelMessage => 42,
            Kind::Other(other) => other,
        }
    }
}

impl Kind {
    pub fn as_u16(self) -> u16 {
        self.into()
    }
}

/// SHA-256 content hash identifying an event
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId([u8; 32]);

impl EventId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for EventId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| SyncError::InvalidEvent(format!("Invalid event id hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SyncError::InvalidEvent("Event id must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.to_hex())
    }
}

impl Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        EventId::from_str(&encoded).map_err(serde::de::Error::custom)
    }
}

/// One tag: a key followed by its values, e.g. `["e", "<id>", "", "root"]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<String>);

impl Tag {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// `["e", <event id>]`
    pub fn event(id: impl Into<String>) -> Self {
        Self(vec!["e".to_string(), id.into()])
    }

    /// `["e", <event id>, <relay hint>, "root"]`
    pub fn event_root(id: impl Into<String>) -> Self {
        Self(vec![
            "e".to_string(),
            id.into(),
            String::new(),
            "root".to_string(),
        ])
    }

    /// `["p", <public key>]`
    pub fn pubkey(pk: &PublicKey) -> Self {
        Self(vec!["p".to_string(), pk.to_hex()])
    }

    pub fn key(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the key
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn values(&self) -> &[String] {
        self.0.get(1..).unwrap_or(&[])
    }

    /// NIP-10 style marker in the fourth position
    pub fn marker(&self) -> Option<&str> {
        self.0.get(3).map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Immutable signed event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: i64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: schnorr::Signature,
}

impl Event {
    /// Decode an event from its JSON wire shape
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Recompute the id and check the signature
    pub fn verify(&self) -> Result<()> {
        let expected = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if expected != self.id {
            return Err(SyncError::InvalidEvent(format!(
                "id mismatch: expected {}, got {}",
                expected, self.id
            )));
        }

        let message = Message::from_digest(*self.id.as_bytes());
        SECP256K1
            .verify_schnorr(&self.sig, &message, self.pubkey.as_xonly())
            .map_err(|e| SyncError::InvalidEvent(format!("bad signature on {}: {}", self.id, e)))
    }

    /// Values of every tag with the given key, first value only
    pub fn tag_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.key() == Some(key))
            .filter_map(Tag::value)
    }

    pub fn first_tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key() == Some(key))
            .and_then(Tag::value)
    }

    /// Channel this event belongs to.
    ///
    /// A channel is identified by the id of its creation event; metadata and
    /// message events point at it through their `e` tag, preferring the one
    /// marked `root`.
    pub fn channel_id(&self) -> Option<String> {
        match self.kind {
            Kind::ChannelCreation => Some(self.id.to_hex()),
            Kind::ChannelMetadata | Kind::ChannelMessage => self
                .tags
                .iter()
                .find(|t| t.key() == Some("e") && t.marker() == Some("root"))
                .and_then(Tag::value)
                .or_else(|| self.first_tag_value("e"))
                .map(str::to_string),
            _ => None,
        }
    }

    /// The other party of a direct message, seen from `me`
    pub fn counterparty(&self, me: &PublicKey) -> Option<PublicKey> {
        if &self.pubkey == me {
            self.first_tag_value("p")
                .and_then(|pk| PublicKey::from_hex(pk).ok())
        } else {
            Some(self.pubkey)
        }
    }
}

/// Id hash over `[0, pubkey, created_at, kind, tags, content]`
pub fn compute_id(
    pubkey: &PublicKey,
    created_at: i64,
    kind: Kind,
    tags: &[Tag],
    content: &str,
) -> Result<EventId> {
    let canonical = serde_json::json!([0, pubkey.to_hex(), created_at, kind.as_u16(), tags, content]);
    let serialized = serde_json::to_string(&canonical)?;
    let digest = Sha256::digest(serialized.as_bytes());
    Ok(EventId(digest.into()))
}

/// Builder for events authored by the local identity
#[derive(Debug, Clone)]
pub struct EventBuilder {
    kind: Kind,
    content: String,
    tags: Vec<Tag>,
    created_at: Option<i64>,
}

impl EventBuilder {
    pub fn new(kind: Kind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Override the creation time (defaults to now)
    pub fn created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn sign(self, keys: &Keys) -> Result<Event> {
        let pubkey = keys.public_key();
        let created_at = self
            .created_at
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let id = compute_id(&pubkey, created_at, self.kind, &self.tags, &self.content)?;
        let sig = keys.sign_digest(*id.as_bytes());

        Ok(Event {
            id,
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Kind::from(4), Kind::EncryptedDirectMessage);
        assert_eq!(Kind::from(40), Kind::ChannelCreation);
        assert_eq!(Kind::from(1), Kind::Other(1));
        assert_eq!(Kind::ChannelMessage.as_u16(), 42);
    }

    #[test]
    fn test_signed_event_verifies() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::ChannelMessage, "hello")
            .tag(Tag::event_root("abc"))
            .created_at(100)
            .sign(&keys)
            .unwrap();

        assert!(event.verify().is_ok());
        assert_eq!(event.pubkey, keys.public_key());
        assert_eq!(event.channel_id().as_deref(), Some("abc"));
    }

    #[test]
    fn test_tampered_event_fails_verification() {
        let keys = Keys::generate();
        let mut event = EventBuilder::new(Kind::ChannelMessage, "hello")
            .sign(&keys)
            .unwrap();
        event.content = "goodbye".to_string();

        assert!(event.verify().is_err());
    }

    #[test]
    fn test_wire_shape() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::ChannelCreation, "{}")
            .created_at(1_700_000_000)
            .sign(&keys)
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["kind"], 40);
        assert_eq!(value["created_at"], 1_700_000_000);
        assert_eq!(value["pubkey"], keys.public_key().to_hex());
        assert_eq!(value["id"], event.id.to_hex());

        let decoded = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn test_channel_id_prefers_root_marker() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::ChannelMessage, "reply")
            .tag(Tag::event("reply-target"))
            .tag(Tag::event_root("channel"))
            .sign(&keys)
            .unwrap();
        assert_eq!(event.channel_id().as_deref(), Some("channel"));

        let creation = EventBuilder::new(Kind::ChannelCreation, "{}")
            .sign(&keys)
            .unwrap();
        assert_eq!(creation.channel_id(), Some(creation.id.to_hex()));
    }

    #[test]
    fn test_counterparty() {
        let me = Keys::generate();
        let them = Keys::generate();

        let outgoing = EventBuilder::new(Kind::EncryptedDirectMessage, "x")
            .tag(Tag::pubkey(&them.public_key()))
            .sign(&me)
            .unwrap();
        assert_eq!(
            outgoing.counterparty(&me.public_key()),
            Some(them.public_key())
        );

        let incoming = EventBuilder::new(Kind::EncryptedDirectMessage, "x")
            .tag(Tag::pubkey(&me.public_key()))
            .sign(&them)
            .unwrap();
        assert_eq!(
            incoming.counterparty(&me.public_key()),
            Some(them.public_key())
        );
    }
}
