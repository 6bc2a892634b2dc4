/// Relay pool, transport boundary, subscriptions and the connection manager
pub mod connection;
pub mod manager;
pub mod subscription;
pub mod transport;

pub use connection::{ConnectionState, RelayConnection, RelayPool, RelayUrl};
pub use manager::{RelayConnectionManager, RelayDelivery};
pub use subscription::{
    PendingSubscriptionBuffer, Subscription, SubscriptionId, SubscriptionLink,
    SubscriptionPurpose, SubscriptionRegistry,
};
pub use transport::{RecordingTransport, RelayTransport, TransportCommand, TransportEvent};
