/// Relay endpoints and their connection state
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use url::Url;

/// Validated `ws://` or `wss://` relay address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl(Url);

impl RelayUrl {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for RelayUrl {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s.trim())
            .map_err(|e| SyncError::InvalidRelayUrl(format!("{}: {}", s, e)))?;
        match url.scheme() {
            "ws" | "wss" if url.host_str().is_some() => Ok(Self(url)),
            _ => Err(SyncError::InvalidRelayUrl(format!(
                "{}: expected ws:// or wss:// with a host",
                s
            ))),
        }
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0.into()
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of one relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Disconnected after a non-transient error; only an explicit retry reconnects
    Error(String),
}

impl ConnectionState {
    /// Whether a fresh connect may be issued from this state
    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error(_))
    }
}

#[derive(Debug, Clone)]
pub struct RelayConnection {
    pub url: RelayUrl,
    pub state: ConnectionState,
    /// Consecutive automatic reconnects since the last successful connect
    pub reconnect_attempts: u32,
    /// Close callbacks still owed by sockets that already reported an error
    pub pending_closes: u32,
    pub connected_at: Option<Instant>,
}

impl RelayConnection {
    pub fn new(url: RelayUrl) -> Self {
        Self {
            url,
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            pending_closes: 0,
            connected_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Ordered set of relays, each with an independent state
#[derive(Debug, Clone, Default)]
pub struct RelayPool {
    relays: Vec<RelayConnection>,
}

impl RelayPool {
    pub fn new(urls: impl IntoIterator<Item = RelayUrl>) -> Self {
        let mut pool = Self::default();
        for url in urls {
            pool.add(url);
        }
        pool
    }

    /// Add a relay unless it is already present
    pub fn add(&mut self, url: RelayUrl) -> bool {
        if self.get(&url).is_some() {
            return false;
        }
        self.relays.push(RelayConnection::new(url));
        true
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn get(&self, url: &RelayUrl) -> Option<&RelayConnection> {
        self.relays.iter().find(|r| &r.url == url)
    }

    pub fn get_mut(&mut self, url: &RelayUrl) -> Option<&mut RelayConnection> {
        self.relays.iter_mut().find(|r| &r.url == url)
    }

    pub fn state(&self, url: &RelayUrl) -> Option<&ConnectionState> {
        self.get(url).map(|r| &r.state)
    }

    /// Set a relay's state, returning the previous one
    pub fn set_state(&mut self, url: &RelayUrl, state: ConnectionState) -> Option<ConnectionState> {
        let relay = self.get_mut(url)?;
        if state == ConnectionState::Connected {
            relay.connected_at = Some(Instant::now());
            relay.reconnect_attempts = 0;
            relay.pending_closes = 0;
        } else {
            relay.connected_at = None;
        }
        Some(std::mem::replace(&mut relay.state, state))
    }

    pub fn all(&self) -> &[RelayConnection] {
        &self.relays
    }

    /// The pool counts as connected while any relay is
    pub fn is_connected(&self) -> bool {
        self.relays.iter().any(RelayConnection::is_connected)
    }

    /// No relay is in the error state
    pub fn is_healthy(&self) -> bool {
        !self
            .relays
            .iter()
            .any(|r| matches!(r.state, ConnectionState::Error(_)))
    }

    pub fn connected_urls(&self) -> Vec<RelayUrl> {
        self.relays
            .iter()
            .filter(|r| r.is_connected())
            .map(|r| r.url.clone())
            .collect()
    }

    /// Relays a fresh connect may be issued to
    pub fn connectable_urls(&self) -> Vec<RelayUrl> {
        self.relays
            .iter()
            .filter(|r| r.state.can_connect())
            .map(|r| r.url.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> RelayUrl {
        s.parse().unwrap()
    }

    #[test]
    fn test_relay_url_validation() {
        assert!("wss://relay.example.com".parse::<RelayUrl>().is_ok());
        assert!("ws://127.0.0.1:7777".parse::<RelayUrl>().is_ok());
        assert!("https://relay.example.com".parse::<RelayUrl>().is_err());
        assert!("not a url".parse::<RelayUrl>().is_err());
    }

    #[test]
    fn test_pool_deduplicates() {
        let mut pool = RelayPool::new([url("wss://a.example"), url("wss://b.example")]);
        assert_eq!(pool.len(), 2);
        assert!(!pool.add(url("wss://a.example")));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_pool_state_tracking() {
        let a = url("wss://a.example");
        let b = url("wss://b.example");
        let mut pool = RelayPool::new([a.clone(), b.clone()]);

        assert!(!pool.is_connected());
        assert_eq!(pool.connectable_urls().len(), 2);

        pool.get_mut(&a).unwrap().reconnect_attempts = 3;
        pool.get_mut(&a).unwrap().pending_closes = 1;
        let prev = pool.set_state(&a, ConnectionState::Connected);
        assert_eq!(prev, Some(ConnectionState::Disconnected));
        assert!(pool.is_connected());
        assert_eq!(pool.connected_urls(), vec![a.clone()]);
        assert_eq!(pool.get(&a).unwrap().reconnect_attempts, 0);
        assert_eq!(pool.get(&a).unwrap().pending_closes, 0);

        pool.set_state(&b, ConnectionState::Error("boom".to_string()));
        assert!(!pool.is_healthy());
        assert_eq!(pool.connectable_urls(), vec![b]);
    }
}
