/// Owns the relay manager, router and leads cache and serializes every
/// transport callback and command onto one task
use crate::config::Config;
use crate::crypto::{encode_envelope, encrypt, ContentKind};
use crate::error::{Result, SyncError};
use crate::event::{Event, EventBuilder, Kind, Tag};
use crate::identity::{Keys, PublicKey};
use crate::leads::{ChannelMetadata, ConversationGroup, Lead, LeadRecord, LeadsCache};
use crate::relay::manager::{RelayConnectionManager, RelayDelivery};
use crate::relay::subscription::SubscriptionId;
use crate::relay::transport::{RelayTransport, TransportEvent};
use crate::router::EventRouter;
use crate::store::{KvStore, MemoryStore, SledStore};
use crate::utils::event_bus::EventBus;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;

pub struct Coordinator<T: RelayTransport> {
    manager: RelayConnectionManager<T>,
    router: EventRouter,
    leads: LeadsCache,
    bus: EventBus,
    verify_signatures: bool,
    known_identity: Option<PublicKey>,
}

impl<T: RelayTransport> Coordinator<T> {
    pub fn new(config: &Config, transport: T, store: Arc<dyn KvStore>) -> Result<Self> {
        config.validate()?;
        let bus = EventBus::new(config.bus_capacity);
        let manager = RelayConnectionManager::new(config, transport, store.clone(), bus.clone())?;

        let mut coordinator = Self {
            manager,
            router: EventRouter::new(config.dedup),
            leads: LeadsCache::new(store, bus.clone()),
            bus,
            verify_signatures: config.verify_signatures,
            known_identity: None,
        };
        coordinator.sync_identity();
        Ok(coordinator)
    }

    /// Build with the store the config asks for: sled under `data_dir`,
    /// otherwise in memory
    pub fn open(config: &Config, transport: T) -> Result<Self> {
        let store: Arc<dyn KvStore> = match &config.data_dir {
            Some(dir) => Arc::new(SledStore::open(dir)?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::new(config, transport, store)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn leads(&self) -> &LeadsCache {
        &self.leads
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn manager(&self) -> &RelayConnectionManager<T> {
        &self.manager
    }

    pub fn identity(&self) -> Option<PublicKey> {
        self.known_identity
    }

    pub fn set_identity(&mut self, keys: Keys) -> Result<()> {
        self.manager.set_identity(keys)?;
        self.sync_identity();
        Ok(())
    }

    pub fn set_consent(&mut self, granted: bool) {
        self.manager.set_consent(granted);
    }

    /// Propagate an identity the manager loaded or created
    fn sync_identity(&mut self) {
        let Some(keys) = self.manager.identity() else {
            return;
        };
        if self.known_identity == Some(keys.public_key()) {
            return;
        }
        let keys = keys.clone();
        debug!(pubkey = %keys.public_key(), "Identity available");
        self.known_identity = Some(keys.public_key());
        self.router.set_identity(keys.public_key());
        self.leads.set_identity(keys);
    }

    fn keys(&self) -> Result<Keys> {
        self.manager
            .identity()
            .cloned()
            .ok_or(SyncError::MissingIdentity)
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        let delivery = self.manager.handle(event);
        self.sync_identity();

        match delivery {
            Some(RelayDelivery::Event {
                subscription_id,
                event,
            }) => {
                if self.verify_signatures {
                    if let Err(e) = event.verify() {
                        debug!(event_id = %event.id, "Dropping unverifiable event: {}", e);
                        return;
                    }
                }
                if let Some(routed) = self.router.route(subscription_id, event) {
                    self.leads.apply(&routed);
                    self.bus.emit_routed(routed);
                }
            }
            Some(RelayDelivery::EndOfStoredEvents { subscription_id }) => {
                let routed = self.router.end_of_stored_events(subscription_id);
                self.bus.emit_routed(routed);
            }
            None => {}
        }
    }

    pub fn start(&mut self) {
        self.manager.start();
    }

    pub fn stop(&mut self) {
        self.manager.stop();
    }

    pub fn reconnect_if_needed(&mut self) {
        self.manager.reconnect_if_needed();
    }

    pub fn publish(&mut self, event: &Event) -> usize {
        self.manager.publish(event)
    }

    pub fn subscribe_channel(&mut self, channel_id: &str) -> Vec<SubscriptionId> {
        self.manager.subscribe_channel(channel_id)
    }

    pub fn subscribe_user(&mut self, target: &PublicKey) -> Option<SubscriptionId> {
        self.manager.subscribe_user(target)
    }

    fn publish_own(&mut self, event: Event) -> Event {
        self.router.archive_outbound(&event);
        let relays = self.manager.publish(&event);
        if relays == 0 {
            warn!(event_id = %event.id, "Event signed but no relay connected");
        }
        event
    }

    pub fn create_channel(&mut self, metadata: &ChannelMetadata) -> Result<Event> {
        let keys = self.keys()?;
        let event = EventBuilder::new(Kind::ChannelCreation, metadata.to_content()?).sign(&keys)?;
        info!(channel_id = %event.id, name = %metadata.name, "Creating channel");
        Ok(self.publish_own(event))
    }

    pub fn send_channel_message(
        &mut self,
        channel_id: &str,
        content: &str,
        kind: ContentKind,
    ) -> Result<Event> {
        let keys = self.keys()?;
        let event = EventBuilder::new(Kind::ChannelMessage, encode_envelope(content, kind))
            .tag(Tag::event_root(channel_id))
            .sign(&keys)?;
        Ok(self.publish_own(event))
    }

    pub fn send_direct_message(
        &mut self,
        recipient: &PublicKey,
        content: &str,
        kind: ContentKind,
    ) -> Result<Event> {
        let keys = self.keys()?;
        let ciphertext = encrypt(&encode_envelope(content, kind), recipient, &keys)?;
        let event = EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
            .tag(Tag::pubkey(recipient))
            .sign(&keys)?;
        Ok(self.publish_own(event))
    }

    /// Ask relays to delete everything we published in a channel, then drop
    /// the lead. Returns the deletion event, if there was anything to delete.
    pub fn delete_channel(&mut self, channel_id: &str) -> Result<Option<Event>> {
        let keys = self.keys()?;
        let targets = self.router.deletion_targets(channel_id, &keys.public_key());

        let deletion = if targets.is_empty() {
            debug!(channel_id, "Nothing of ours to delete in channel");
            None
        } else {
            let event = EventBuilder::new(Kind::Deletion, "")
                .tags(targets.iter().map(|id| Tag::event(id.to_hex())))
                .sign(&keys)?;
            info!(channel_id, events = targets.len(), "Deleting channel events");
            self.manager.publish(&event);
            Some(event)
        };

        self.router.forget_channel(channel_id);
        self.leads.remove(channel_id);
        Ok(deletion)
    }

    /// Forget a lead locally without touching the network
    pub fn remove_spot(&mut self, channel_id: &str) -> usize {
        self.leads.remove(channel_id)
    }

    pub fn mark_read(&mut self, correspondent: &PublicKey, timestamp: i64) -> Result<()> {
        self.leads.mark_read(correspondent, timestamp)
    }

    pub fn set_blacklist(&mut self, blacklist: impl IntoIterator<Item = PublicKey>) {
        self.leads.set_blacklist(blacklist);
    }

    pub fn seed_leads(&mut self, records: impl IntoIterator<Item = LeadRecord>) {
        self.leads.seed(records);
    }

    fn execute(&mut self, command: Command) {
        // a dropped reply receiver just means the caller stopped waiting
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::ReconnectIfNeeded => self.reconnect_if_needed(),
            Command::SetConsent(granted) => self.set_consent(granted),
            Command::Publish { event, reply } => {
                let _ = reply.send(self.publish(&event));
            }
            Command::SubscribeChannel { channel_id, reply } => {
                let _ = reply.send(self.subscribe_channel(&channel_id));
            }
            Command::SubscribeUser { target, reply } => {
                let _ = reply.send(self.subscribe_user(&target));
            }
            Command::CreateChannel { metadata, reply } => {
                let _ = reply.send(self.create_channel(&metadata));
            }
            Command::SendChannelMessage {
                channel_id,
                content,
                kind,
                reply,
            } => {
                let _ = reply.send(self.send_channel_message(&channel_id, &content, kind));
            }
            Command::SendDirectMessage {
                recipient,
                content,
                kind,
                reply,
            } => {
                let _ = reply.send(self.send_direct_message(&recipient, &content, kind));
            }
            Command::DeleteChannel { channel_id, reply } => {
                let _ = reply.send(self.delete_channel(&channel_id));
            }
            Command::RemoveSpot { channel_id } => {
                self.remove_spot(&channel_id);
            }
            Command::MarkRead {
                correspondent,
                timestamp,
                reply,
            } => {
                let _ = reply.send(self.mark_read(&correspondent, timestamp));
            }
            Command::SetBlacklist(blacklist) => self.set_blacklist(blacklist),
            Command::SeedLeads(records) => self.seed_leads(records),
            Command::Leads { reply } => {
                let _ = reply.send(self.leads.leads().to_vec());
            }
            Command::UnreadCount {
                correspondent,
                reply,
            } => {
                let _ = reply.send(self.leads.unread_count(&correspondent));
            }
            Command::TotalUnread { reply } => {
                let _ = reply.send(self.leads.total_unread());
            }
            Command::Conversations { reply } => {
                let _ = reply.send(self.leads.grouped_by_correspondent());
            }
            Command::Shutdown => {}
        }
    }

    /// Run until `Shutdown` arrives or every handle is dropped
    pub async fn run(
        mut self,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        info!("Coordinator loop started");
        loop {
            tokio::select! {
                Some(event) = transport_rx.recv() => self.handle_transport_event(event),
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.execute(command),
                },
            }
        }
        self.manager.stop();
        info!("Coordinator loop stopped");
    }
}

impl<T: RelayTransport + 'static> Coordinator<T> {
    /// Move the coordinator onto its own task
    pub fn spawn(self, transport_rx: mpsc::Receiver<TransportEvent>) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = CoordinatorHandle {
            commands: tx,
            bus: self.bus.clone(),
        };
        let task = tokio::spawn(self.run(transport_rx, rx));
        (handle, task)
    }
}

/// Requests into the coordinator loop; queries carry a oneshot reply
#[derive(Debug)]
pub enum Command {
    Start,
    Stop,
    ReconnectIfNeeded,
    SetConsent(bool),
    Publish {
        event: Box<Event>,
        reply: oneshot::Sender<usize>,
    },
    SubscribeChannel {
        channel_id: String,
        reply: oneshot::Sender<Vec<SubscriptionId>>,
    },
    SubscribeUser {
        target: PublicKey,
        reply: oneshot::Sender<Option<SubscriptionId>>,
    },
    CreateChannel {
        metadata: ChannelMetadata,
        reply: oneshot::Sender<Result<Event>>,
    },
    SendChannelMessage {
        channel_id: String,
        content: String,
        kind: ContentKind,
        reply: oneshot::Sender<Result<Event>>,
    },
    SendDirectMessage {
        recipient: PublicKey,
        content: String,
        kind: ContentKind,
        reply: oneshot::Sender<Result<Event>>,
    },
    DeleteChannel {
        channel_id: String,
        reply: oneshot::Sender<Result<Option<Event>>>,
    },
    RemoveSpot {
        channel_id: String,
    },
    MarkRead {
        correspondent: PublicKey,
        timestamp: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    SetBlacklist(Vec<PublicKey>),
    SeedLeads(Vec<LeadRecord>),
    Leads {
        reply: oneshot::Sender<Vec<Lead>>,
    },
    UnreadCount {
        correspondent: PublicKey,
        reply: oneshot::Sender<u32>,
    },
    TotalUnread {
        reply: oneshot::Sender<u32>,
    },
    Conversations {
        reply: oneshot::Sender<Vec<ConversationGroup>>,
    },
    Shutdown,
}

/// Cloneable front door to a running coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    bus: EventBus,
}

impl CoordinatorHandle {
    pub fn new(commands: mpsc::Sender<Command>, bus: EventBus) -> Self {
        Self { commands, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::CoordinatorStopped)
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| SyncError::CoordinatorStopped)
    }

    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    pub async fn reconnect_if_needed(&self) -> Result<()> {
        self.send(Command::ReconnectIfNeeded).await
    }

    pub async fn set_consent(&self, granted: bool) -> Result<()> {
        self.send(Command::SetConsent(granted)).await
    }

    pub async fn publish(&self, event: Event) -> Result<usize> {
        self.request(|reply| Command::Publish {
            event: Box::new(event),
            reply,
        })
        .await
    }

    pub async fn subscribe_channel(&self, channel_id: &str) -> Result<Vec<SubscriptionId>> {
        let channel_id = channel_id.to_string();
        self.request(|reply| Command::SubscribeChannel { channel_id, reply })
            .await
    }

    pub async fn subscribe_user(&self, target: PublicKey) -> Result<Option<SubscriptionId>> {
        self.request(|reply| Command::SubscribeUser { target, reply })
            .await
    }

    pub async fn create_channel(&self, metadata: ChannelMetadata) -> Result<Event> {
        self.request(|reply| Command::CreateChannel { metadata, reply })
            .await?
    }

    pub async fn send_channel_message(
        &self,
        channel_id: &str,
        content: &str,
        kind: ContentKind,
    ) -> Result<Event> {
        let (channel_id, content) = (channel_id.to_string(), content.to_string());
        self.request(|reply| Command::SendChannelMessage {
            channel_id,
            content,
            kind,
            reply,
        })
        .await?
    }

    pub async fn send_direct_message(
        &self,
        recipient: PublicKey,
        content: &str,
        kind: ContentKind,
    ) -> Result<Event> {
        let content = content.to_string();
        self.request(|reply| Command::SendDirectMessage {
            recipient,
            content,
            kind,
            reply,
        })
        .await?
    }

    pub async fn delete_channel(&self, channel_id: &str) -> Result<Option<Event>> {
        let channel_id = channel_id.to_string();
        self.request(|reply| Command::DeleteChannel { channel_id, reply })
            .await?
    }

    pub async fn remove_spot(&self, channel_id: &str) -> Result<()> {
        self.send(Command::RemoveSpot {
            channel_id: channel_id.to_string(),
        })
        .await
    }

    pub async fn mark_read(&self, correspondent: PublicKey, timestamp: i64) -> Result<()> {
        self.request(|reply| Command::MarkRead {
            correspondent,
            timestamp,
            reply,
        })
        .await?
    }

    pub async fn set_blacklist(&self, blacklist: Vec<PublicKey>) -> Result<()> {
        self.send(Command::SetBlacklist(blacklist)).await
    }

    pub async fn seed_leads(&self, records: Vec<LeadRecord>) -> Result<()> {
        self.send(Command::SeedLeads(records)).await
    }

    pub async fn leads(&self) -> Result<Vec<Lead>> {
        self.request(|reply| Command::Leads { reply }).await
    }

    pub async fn unread_count(&self, correspondent: PublicKey) -> Result<u32> {
        self.request(|reply| Command::UnreadCount {
            correspondent,
            reply,
        })
        .await
    }

    pub async fn total_unread(&self) -> Result<u32> {
        self.request(|reply| Command::TotalUnread { reply }).await
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationGroup>> {
        self.request(|reply| Command::Conversations { reply })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }
}
