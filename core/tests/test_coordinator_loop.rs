/// The coordinator running on its own task, driven through channels
mod common;

use common::RELAY_A;
use spotlink_core::crypto::{encode_envelope, encrypt, ContentKind};
use spotlink_core::leads::ChannelMetadata;
use spotlink_core::relay::{
    ConnectionState, RecordingTransport, SubscriptionId, TransportCommand, TransportEvent,
};
use spotlink_core::store::MemoryStore;
use spotlink_core::{Coordinator, EventBuilder, Keys, Kind, Tag};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_loop_routes_and_answers_queries() {
    common::init_tracing();
    let transport = RecordingTransport::new();
    let coordinator = Coordinator::new(
        &common::config(&[RELAY_A]),
        transport.clone(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    let (transport_tx, transport_rx) = mpsc::channel(16);
    let (handle, task) = coordinator.spawn(transport_rx);
    let mut connection = handle.bus().subscribe_connection();
    let mut routed = handle.bus().subscribe_routed();

    // commands and transport callbacks travel on separate channels, so
    // wait for each step to show up on the bus before the next one
    handle.start().await.unwrap();
    let change = timeout(WAIT, connection.recv()).await.unwrap().unwrap();
    assert_eq!(change.state, ConnectionState::Connecting);

    transport_tx
        .send(TransportEvent::Connected {
            relay: common::relay(RELAY_A),
        })
        .await
        .unwrap();
    let change = timeout(WAIT, connection.recv()).await.unwrap().unwrap();
    assert_eq!(change.state, ConnectionState::Connected);

    // channel discovered from a peer
    let peer = Keys::generate();
    let created = EventBuilder::new(
        Kind::ChannelCreation,
        ChannelMetadata::new("Dock").to_content().unwrap(),
    )
    .sign(&peer)
    .unwrap();
    transport_tx
        .send(TransportEvent::Event {
            relay: common::relay(RELAY_A),
            subscription_id: SubscriptionId::new("inbox"),
            event: Box::new(created.clone()),
        })
        .await
        .unwrap();
    timeout(WAIT, routed.recv()).await.unwrap().unwrap();

    let leads = handle.leads().await.unwrap();
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].name, "Dock");

    let ids = handle
        .subscribe_channel(&created.id.to_hex())
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    // onboarding created our identity on connect, so authoring works
    let sent = handle
        .send_direct_message(peer.public_key(), "hello", ContentKind::Text)
        .await
        .unwrap();
    assert_eq!(sent.kind, Kind::EncryptedDirectMessage);
    assert!(transport
        .published()
        .iter()
        .any(|(_, event)| event.id == sent.id));
    let me = sent.pubkey;

    // the peer answers
    let reply = EventBuilder::new(
        Kind::EncryptedDirectMessage,
        encrypt(&encode_envelope("hi back", ContentKind::Text), &me, &peer).unwrap(),
    )
    .tag(Tag::pubkey(&me))
    .sign(&peer)
    .unwrap();
    transport_tx
        .send(TransportEvent::Event {
            relay: common::relay(RELAY_A),
            subscription_id: SubscriptionId::new("inbox"),
            event: Box::new(reply.clone()),
        })
        .await
        .unwrap();
    timeout(WAIT, routed.recv()).await.unwrap().unwrap();

    assert_eq!(handle.unread_count(peer.public_key()).await.unwrap(), 1);
    let conversations = handle.conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].entries[0].display, "hi back");

    handle
        .mark_read(peer.public_key(), reply.created_at)
        .await
        .unwrap();
    assert_eq!(handle.total_unread().await.unwrap(), 0);

    handle.shutdown().await.unwrap();
    timeout(WAIT, task).await.unwrap().unwrap();
    assert!(transport
        .commands()
        .iter()
        .any(|c| matches!(c, TransportCommand::Disconnect(_))));
}

#[tokio::test]
async fn test_dropping_every_handle_ends_the_loop() {
    let coordinator = Coordinator::new(
        &common::config(&[RELAY_A]),
        RecordingTransport::new(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    let (_transport_tx, transport_rx) = mpsc::channel(4);
    let (handle, task) = coordinator.spawn(transport_rx);

    handle.start().await.unwrap();
    drop(handle);
    timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_authoring_without_identity_fails_cleanly() {
    let coordinator = Coordinator::new(
        &common::config(&[RELAY_A]),
        RecordingTransport::new(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    let (_transport_tx, transport_rx) = mpsc::channel(4);
    let (handle, _task) = coordinator.spawn(transport_rx);

    let result = handle.create_channel(ChannelMetadata::new("nope")).await;
    assert!(matches!(
        result,
        Err(spotlink_core::SyncError::MissingIdentity)
    ));
    // the loop is still alive
    assert_eq!(handle.total_unread().await.unwrap(), 0);
}
