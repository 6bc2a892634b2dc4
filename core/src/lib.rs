/// SpotLink relay synchronization core
///
/// Keeps a pool of relay connections alive behind a consent gate, issues and
/// replays subscriptions, routes signed events by kind, decrypts private
/// content and maintains the leads/unread read model the UI observes.

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod event;
pub mod filter;
pub mod identity;
pub mod leads;
pub mod relay;
pub mod router;
pub mod store;
pub mod utils;

pub use config::Config;
pub use coordinator::{Command, Coordinator, CoordinatorHandle};
pub use error::{Result, SyncError};
pub use event::{Event, EventBuilder, EventId, Kind, Tag};
pub use filter::Filter;
pub use identity::{Keys, PublicKey};
pub use leads::{ChannelMetadata, Lead, LeadChange, LeadRecord, LeadsCache};
pub use router::{DedupPolicy, Direction, EventRouter, RoutedEvent};
