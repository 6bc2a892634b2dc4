/// Configuration management
use crate::error::{Result, SyncError};
use crate::identity::PublicKey;
use crate::relay::connection::RelayUrl;
use crate::router::DedupPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_RELAYS: [&str; 3] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
];

/// Core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay endpoints making up the pool
    pub relays: Vec<String>,

    /// Network activity stays off until the user accepted the terms
    pub consent_granted: bool,

    /// Recipient of the one-time "online" message (hex or npub)
    pub support_pubkey: Option<String>,

    /// Backlog size requested per channel feed
    pub channel_feed_limit: usize,

    /// Backlog size requested per user conversation
    pub user_feed_limit: usize,

    /// Consecutive automatic reconnects per relay before giving up
    pub max_reconnect_attempts: u32,

    pub dedup: DedupPolicy,

    /// Drop deliveries whose id or signature does not check out
    pub verify_signatures: bool,

    /// Capacity of each event bus topic
    pub bus_capacity: usize,

    /// Optional data directory for the persistent store
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            consent_granted: false,
            support_pubkey: None,
            channel_feed_limit: 32,
            user_feed_limit: 64,
            max_reconnect_attempts: 5,
            dedup: DedupPolicy::Adjacent,
            verify_signatures: true,
            bus_capacity: 256,
            data_dir: None,
        }
    }
}

impl Config {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `SPOTLINK_RELAYS`, `SPOTLINK_SUPPORT_PUBKEY` and `SPOTLINK_CONSENT`
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(relays) = var("SPOTLINK_RELAYS") {
            self.relays = relays
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(pubkey) = var("SPOTLINK_SUPPORT_PUBKEY") {
            self.support_pubkey = Some(pubkey.trim().to_string()).filter(|p| !p.is_empty());
        }
        if let Some(consent) = var("SPOTLINK_CONSENT") {
            self.consent_granted = matches!(
                consent.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relays.is_empty() {
            return Err(SyncError::Config("At least one relay is required".to_string()));
        }
        self.relay_urls()?;
        self.support_key()?;

        if self.channel_feed_limit == 0 || self.user_feed_limit == 0 {
            return Err(SyncError::Config("Feed limits must be positive".to_string()));
        }
        if self.bus_capacity == 0 {
            return Err(SyncError::Config("bus_capacity must be positive".to_string()));
        }
        if self.dedup == DedupPolicy::Window(0) {
            return Err(SyncError::Config("Dedup window must be positive".to_string()));
        }
        Ok(())
    }

    pub fn relay_urls(&self) -> Result<Vec<RelayUrl>> {
        self.relays.iter().map(|r| r.parse()).collect()
    }

    pub fn support_key(&self) -> Result<Option<PublicKey>> {
        self.support_pubkey
            .as_deref()
            .map(str::parse::<PublicKey>)
            .transpose()
            .map_err(|e| SyncError::Config(format!("Invalid support_pubkey: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keys;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(!config.consent_granted);
        assert_eq!(config.channel_feed_limit, 32);
        assert_eq!(config.user_feed_limit, 64);
        assert_eq!(config.dedup, DedupPolicy::Adjacent);
        assert_eq!(config.relay_urls().unwrap().len(), DEFAULT_RELAYS.len());
    }

    #[test]
    fn test_overrides() {
        let support = Keys::generate().public_key();
        let vars: HashMap<&str, String> = [
            ("SPOTLINK_RELAYS", "wss://a.example, wss://b.example".to_string()),
            ("SPOTLINK_SUPPORT_PUBKEY", support.to_npub()),
            ("SPOTLINK_CONSENT", "true".to_string()),
        ]
        .into_iter()
        .collect();

        let config = Config::default()
            .with_overrides(|k| vars.get(k).cloned())
            .unwrap();
        assert_eq!(config.relays, vec!["wss://a.example", "wss://b.example"]);
        assert!(config.consent_granted);
        assert_eq!(config.support_key().unwrap(), Some(support));
    }

    #[test]
    fn test_validation_failures() {
        let bad_relay = Config {
            relays: vec!["http://nope.example".to_string()],
            ..Default::default()
        };
        assert!(bad_relay.validate().is_err());

        let empty = Config {
            relays: Vec::new(),
            ..Default::default()
        };
        assert!(empty.validate().is_err());

        let bad_key = Config {
            support_pubkey: Some("abc".to_string()),
            ..Default::default()
        };
        assert!(matches!(bad_key.validate(), Err(SyncError::Config(_))));

        let zero_window = Config {
            dedup: DedupPolicy::Window(0),
            ..Default::default()
        };
        assert!(zero_window.validate().is_err());
    }

    #[test]
    fn test_load_json_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"relays":["ws://127.0.0.1:7777"],"consent_granted":true,"dedup":{"window":128}}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.relays, vec!["ws://127.0.0.1:7777"]);
        assert!(config.consent_granted);
        assert_eq!(config.dedup, DedupPolicy::Window(128));
        assert_eq!(config.max_reconnect_attempts, 5);

        assert!(Config::load(&dir.path().join("missing.json")).is_err());
    }
}
