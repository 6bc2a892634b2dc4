/// Subscription buffering and replay across connection cycles
mod common;

use common::{Harness, RELAY_A, RELAY_B};
use spotlink_core::relay::TransportEvent;
use spotlink_core::{Filter, Keys, Kind};

fn channel_of(filters: &[Filter]) -> String {
    let filter = &filters[0];
    filter
        .ids
        .as_ref()
        .map(|ids| ids[0].clone())
        .or_else(|| filter.tag_values('e').map(|v| v[0].clone()))
        .unwrap()
}

#[test]
fn test_buffered_channels_replay_in_order_then_defaults() {
    let mut harness = Harness::new(common::config(&[RELAY_A]));
    let me = Keys::generate();
    harness.coordinator.set_identity(me.clone()).unwrap();

    // requested before the pool exists
    for id in ["a", "b", "c"] {
        assert!(harness.coordinator.subscribe_channel(id).is_empty());
    }

    harness.coordinator.start();
    harness.connect(RELAY_A);

    let subs = harness.transport.subscriptions();
    assert_eq!(subs.len(), 8);

    let order: Vec<String> = subs[..6].iter().map(|(_, _, f)| channel_of(f)).collect();
    assert_eq!(order, vec!["a", "a", "b", "b", "c", "c"]);

    // metadata first, then feed, for every channel
    for pair in subs[..6].chunks(2) {
        assert!(pair[0].2[0].ids.is_some());
        assert_eq!(pair[1].2[0].kinds, Some(vec![Kind::ChannelMessage]));
        assert_eq!(pair[1].2[0].limit, Some(32));
    }

    assert_eq!(subs[6].2[0].authors, Some(vec![me.public_key()]));
    assert_eq!(
        subs[7].2[0].tag_values('p'),
        Some(&[me.public_key().to_hex()][..])
    );

    // exactly once: the buffer is empty after the flush
    assert!(harness
        .coordinator
        .manager()
        .registry()
        .pending()
        .is_empty());
}

#[test]
fn test_user_subscription_is_not_buffered() {
    let mut harness = Harness::new(common::config(&[RELAY_A]));
    harness.coordinator.set_identity(Keys::generate()).unwrap();
    let target = Keys::generate().public_key();

    assert!(harness.coordinator.subscribe_user(&target).is_none());

    harness.coordinator.start();
    harness.connect(RELAY_A);
    let defaults_only = harness.transport.subscriptions().len();
    assert_eq!(defaults_only, 2);

    let id = harness.coordinator.subscribe_user(&target).unwrap();
    let subs = harness.transport.subscriptions();
    assert_eq!(subs.len(), 3);
    assert_eq!(subs[2].1, id);
    assert!(subs[2]
        .2
        .iter()
        .all(|f| f.kinds == Some(vec![Kind::EncryptedDirectMessage, Kind::ChannelCreation])));
}

#[test]
fn test_duplicate_channel_requests_each_issue() {
    let (mut harness, _) = Harness::connected(&[RELAY_A]);
    harness.transport.take();

    let first = harness.coordinator.subscribe_channel("chan");
    let second = harness.coordinator.subscribe_channel("chan");
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert!(first.iter().all(|id| !second.contains(id)));
    assert_eq!(harness.transport.subscriptions().len(), 4);
}

#[test]
fn test_subscriptions_fan_out_to_connected_relays() {
    let (mut harness, _) = Harness::connected(&[RELAY_A, RELAY_B]);
    harness.connect(RELAY_B);
    harness.transport.take();

    harness.coordinator.subscribe_channel("chan");
    let subs = harness.transport.subscriptions();
    assert_eq!(subs.len(), 4);
    assert_eq!(subs.iter().filter(|(r, _, _)| r.as_str().contains("a.example")).count(), 2);
    assert_eq!(subs.iter().filter(|(r, _, _)| r.as_str().contains("b.example")).count(), 2);
}

#[test]
fn test_channel_feeds_survive_pool_loss() {
    let (mut harness, _) = Harness::connected(&[RELAY_A]);
    harness.coordinator.subscribe_channel("x");

    harness
        .coordinator
        .handle_transport_event(TransportEvent::Disconnected {
            relay: common::relay(RELAY_A),
        });
    harness.transport.take();
    harness.connect(RELAY_A);

    let subs = harness.transport.subscriptions();
    // metadata + feed for x, then both defaults
    assert_eq!(subs.len(), 4);
    assert_eq!(channel_of(&subs[0].2), "x");
    assert_eq!(channel_of(&subs[1].2), "x");
}

#[test]
fn test_stop_closes_every_subscription() {
    let (mut harness, _) = Harness::connected(&[RELAY_A]);
    harness.coordinator.subscribe_channel("x");
    let issued: Vec<_> = harness
        .transport
        .subscriptions()
        .into_iter()
        .map(|(_, id, _)| id)
        .collect();
    harness.transport.take();

    harness.coordinator.stop();
    let closed: Vec<_> = harness
        .transport
        .commands()
        .into_iter()
        .filter_map(|c| match c {
            spotlink_core::relay::TransportCommand::Close(_, id) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(closed, issued);
    assert!(harness.coordinator.manager().registry().is_empty());
}
