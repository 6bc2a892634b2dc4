/// The `{content, kind}` JSON envelope carried inside event content.
///
/// Decoding never fails: unparseable input becomes plain text and unknown
/// kinds degrade to text, since peers may run older or newer versions.
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Content strings starting with this are channel invites whatever their declared kind
pub const INVITE_PREFIX: &str = "spotlink://invite/";

const VIDEO_EXTENSIONS: [&str; 3] = ["mov", "mp4", "m4v"];
const THUMBNAIL_EXTENSION: &str = "jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Photo,
    Video,
    Invite,
    Invoice,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Photo => "photo",
            ContentKind::Video => "video",
            ContentKind::Invite => "invite",
            ContentKind::Invoice => "invoice",
        }
    }

    /// Unknown kinds map to `None`; decoding treats them as text
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "text" => Some(ContentKind::Text),
            "photo" => Some(ContentKind::Photo),
            "video" => Some(ContentKind::Video),
            "invite" => Some(ContentKind::Invite),
            "invoice" => Some(ContentKind::Invoice),
            _ => None,
        }
    }
}

/// Decoded application payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEnvelope {
    Text(String),
    Photo { url: String, thumbnail: String },
    Video { url: String, thumbnail: String },
    /// Encrypted invite payload
    Invite(String),
    /// Encrypted invoice payload
    Invoice(String),
}

impl ContentEnvelope {
    pub fn kind(&self) -> ContentKind {
        match self {
            ContentEnvelope::Text(_) => ContentKind::Text,
            ContentEnvelope::Photo { .. } => ContentKind::Photo,
            ContentEnvelope::Video { .. } => ContentKind::Video,
            ContentEnvelope::Invite(_) => ContentKind::Invite,
            ContentEnvelope::Invoice(_) => ContentKind::Invoice,
        }
    }

    /// The content string as carried on the wire
    pub fn content(&self) -> &str {
        match self {
            ContentEnvelope::Text(c)
            | ContentEnvelope::Invite(c)
            | ContentEnvelope::Invoice(c) => c,
            ContentEnvelope::Photo { url, .. } | ContentEnvelope::Video { url, .. } => url,
        }
    }
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    content: &'a str,
    kind: &'a str,
}

#[derive(Deserialize)]
struct WireEnvelope {
    content: String,
    #[serde(default)]
    kind: String,
}

/// Serialize `{content, kind}`; falls back to the raw content
pub fn encode_envelope(content: &str, kind: ContentKind) -> String {
    let wire = WireEnvelopeRef {
        content,
        kind: kind.as_str(),
    };
    serde_json::to_string(&wire).unwrap_or_else(|_| content.to_string())
}

pub fn decode_envelope(raw: &str) -> ContentEnvelope {
    let wire: WireEnvelope = match serde_json::from_str(raw) {
        Ok(wire) => wire,
        Err(e) => {
            trace!("content is not an envelope ({}), using plain text", e);
            return ContentEnvelope::Text(raw.to_string());
        }
    };

    if wire.content.starts_with(INVITE_PREFIX) {
        return ContentEnvelope::Invite(wire.content);
    }

    match ContentKind::from_wire(&wire.kind) {
        Some(ContentKind::Photo) => ContentEnvelope::Photo {
            thumbnail: wire.content.clone(),
            url: wire.content,
        },
        Some(ContentKind::Video) => ContentEnvelope::Video {
            thumbnail: video_thumbnail(&wire.content),
            url: wire.content,
        },
        Some(ContentKind::Invite) => ContentEnvelope::Invite(wire.content),
        Some(ContentKind::Invoice) => ContentEnvelope::Invoice(wire.content),
        Some(ContentKind::Text) => ContentEnvelope::Text(wire.content),
        None => {
            trace!(kind = %wire.kind, "unknown envelope kind, using plain text");
            ContentEnvelope::Text(wire.content)
        }
    }
}

/// Video thumbnails live next to the video with a `.jpg` extension
fn video_thumbnail(url: &str) -> String {
    match url.rsplit_once('.') {
        Some((stem, ext)) if VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => {
            format!("{}.{}", stem, THUMBNAIL_EXTENSION)
        }
        _ => url.to_string(),
    }
}
