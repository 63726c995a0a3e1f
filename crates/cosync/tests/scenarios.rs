//! Multi-node scenarios over in-memory connections.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cosync::{LoadOptions, Loaded, LocalNode, NodeError, Owner, PeerId, Role, ValueId, ValueKind};
use cosync_testkit::{agent_id, connect, eventually, init_tracing, node, within, ManualClock};
use serde_json::{json, Value as JsonValue};

fn field(node: &LocalNode, id: ValueId, key: &str) -> Option<JsonValue> {
    node.content(&id).ok()?.as_map()?.get(key).cloned()
}

fn go_offline(client: &LocalNode, server: &LocalNode, peers: &(PeerId, PeerId)) {
    client.disconnect_peer(&peers.0);
    server.disconnect_peer(&peers.1);
}

async fn synced(node: &LocalNode, ids: &[ValueId]) {
    for id in ids {
        within("sync", node.wait_for_sync(*id, Duration::from_secs(5)))
            .await
            .unwrap();
    }
}

/// Alice owns a group with Bob as writer and Carol as reader, and a map
/// owned by the group, all synced to a server.
struct Team {
    clock: Arc<ManualClock>,
    server: LocalNode,
    alice: LocalNode,
    bob: LocalNode,
    group: ValueId,
    map: ValueId,
    alice_link: (PeerId, PeerId),
    bob_link: (PeerId, PeerId),
}

async fn team() -> Team {
    init_tracing();
    let clock = ManualClock::new(100);
    let server = node(9, Arc::clone(&clock));
    let alice = node(1, Arc::clone(&clock));
    let bob = node(2, Arc::clone(&clock));

    let group = alice.create_group().unwrap();
    alice.add_member(group, agent_id(2), Role::Writer).unwrap();
    alice.add_member(group, agent_id(3), Role::Reader).unwrap();
    let map = alice
        .create(ValueKind::Map, Owner::Group(group), Vec::new())
        .unwrap();
    alice.map_set(map, "x", json!("start")).unwrap();

    let alice_link = connect(&alice, &server);
    synced(&alice, &[group, map]).await;

    let bob_link = connect(&bob, &server);
    let loaded = within("bob loads", bob.load(map, LoadOptions::default()))
        .await
        .unwrap();
    assert_eq!(
        loaded.content().and_then(|c| c.as_map()?.get("x").cloned()),
        Some(json!("start"))
    );

    Team {
        clock,
        server,
        alice,
        bob,
        group,
        map,
        alice_link,
        bob_link,
    }
}

#[tokio::test]
async fn test_concurrent_offline_writes_converge() {
    let mut t = team().await;
    go_offline(&t.alice, &t.server, &t.alice_link);
    go_offline(&t.bob, &t.server, &t.bob_link);

    t.clock.set(1_000);
    t.alice.map_set(t.map, "x", json!("alice")).unwrap();
    t.clock.set(2_000);
    t.bob.map_set(t.map, "x", json!("bob")).unwrap();
    assert_eq!(field(&t.alice, t.map, "x"), Some(json!("alice")));

    t.alice_link = connect(&t.alice, &t.server);
    t.bob_link = connect(&t.bob, &t.server);

    eventually("alice sees bob's later write", || {
        field(&t.alice, t.map, "x") == Some(json!("bob"))
    })
    .await;
    eventually("bob keeps his write", || {
        field(&t.bob, t.map, "x") == Some(json!("bob"))
    })
    .await;
    eventually("same history on both", || {
        t.alice.known_state(&t.map).ok() == t.bob.known_state(&t.map).ok()
    })
    .await;

    // A reader loading afterwards sees the same winner.
    let carol = node(3, Arc::clone(&t.clock));
    connect(&carol, &t.server);
    let loaded = within("carol loads", carol.load(t.map, LoadOptions::default()))
        .await
        .unwrap();
    assert_eq!(
        loaded.content().and_then(|c| c.as_map()?.get("x").cloned()),
        Some(json!("bob"))
    );
    assert_eq!(t.alice.content(&t.map).unwrap(), carol.content(&t.map).unwrap());
}

#[tokio::test]
async fn test_revoked_writer_is_excluded_everywhere() {
    let mut t = team().await;
    go_offline(&t.bob, &t.server, &t.bob_link);

    t.clock.set(2_000);
    t.alice.remove_member(t.group, agent_id(2)).unwrap();
    synced(&t.alice, &[t.group]).await;

    // Bob has not seen the revocation yet and writes anyway.
    t.clock.set(3_000);
    t.bob.map_set(t.map, "x", json!("too late")).unwrap();
    assert_eq!(field(&t.bob, t.map, "x"), Some(json!("too late")));

    t.bob_link = connect(&t.bob, &t.server);
    eventually("alice holds bob's transaction", || {
        t.alice
            .known_state(&t.map)
            .map(|known| known.sessions.len() == 2)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(field(&t.alice, t.map, "x"), Some(json!("start")));

    eventually("bob learns of the revocation", || {
        field(&t.bob, t.map, "x") == Some(json!("start"))
    })
    .await;
    assert!(matches!(
        t.bob.map_set(t.map, "x", json!("again")),
        Err(NodeError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_reader_cannot_write() {
    let t = team().await;
    let carol = node(3, Arc::clone(&t.clock));
    connect(&carol, &t.server);
    within("carol loads", carol.load(t.map, LoadOptions::default()))
        .await
        .unwrap();

    assert!(matches!(
        carol.map_set(t.map, "x", json!("carol")),
        Err(NodeError::PermissionDenied(_))
    ));
    assert!(carol.add_member(t.group, agent_id(4), Role::Writer).is_err());
}

#[tokio::test]
async fn test_invite_grants_access() {
    let t = team().await;
    let invite = t.alice.create_invite(t.group, Role::Writer).unwrap();
    synced(&t.alice, &[t.group]).await;

    let dave = node(4, Arc::clone(&t.clock));
    connect(&dave, &t.server);
    let role = within("dave joins", dave.accept_invite(t.group, invite))
        .await
        .unwrap();
    assert_eq!(role, Role::Writer);

    within("dave loads", dave.load(t.map, LoadOptions::default()))
        .await
        .unwrap();
    assert_eq!(field(&dave, t.map, "x"), Some(json!("start")));

    t.clock.advance(10);
    dave.map_set(t.map, "x", json!("dave")).unwrap();
    eventually("alice sees dave's write", || {
        field(&t.alice, t.map, "x") == Some(json!("dave"))
    })
    .await;
    assert!(t
        .alice
        .members(&t.group)
        .unwrap()
        .contains(&(agent_id(4), Role::Writer)));
}

#[tokio::test]
async fn test_subscribers_follow_remote_changes() {
    let t = team().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = {
        let seen = Arc::clone(&seen);
        t.alice
            .subscribe(t.map, move |content| {
                let x = content.as_map().and_then(|m| m.get("x").cloned());
                seen.lock().unwrap().push(x);
            })
            .unwrap()
    };
    assert_eq!(*seen.lock().unwrap(), vec![Some(json!("start"))]);

    t.clock.advance(10);
    t.bob.map_set(t.map, "x", json!("bob")).unwrap();
    eventually("subscriber notified", || {
        seen.lock().unwrap().last() == Some(&Some(json!("bob")))
    })
    .await;

    drop(subscription);
    let calls = seen.lock().unwrap().len();
    t.clock.advance(10);
    t.alice.map_set(t.map, "x", json!("quiet")).unwrap();
    assert_eq!(seen.lock().unwrap().len(), calls);
}

#[tokio::test]
async fn test_load_missing_value_is_unavailable() {
    init_tracing();
    let clock = ManualClock::new(0);
    let server = node(9, Arc::clone(&clock));
    let client = node(1, clock);
    connect(&client, &server);

    let loaded = within(
        "load",
        client.load(ValueId::from_bytes([42; 32]), LoadOptions::default()),
    )
    .await
    .unwrap();
    assert_eq!(loaded, Loaded::Unavailable);
}

#[tokio::test]
async fn test_wait_for_sync_times_out_without_acks() {
    init_tracing();
    let clock = ManualClock::new(0);
    let alice = node(1, clock);
    let (local, _silent) = cosync::sync::memory::pair(alice.config().sync.message_limits);
    alice
        .add_peer(PeerId::new("silent"), cosync::PeerRole::Server, local)
        .unwrap();

    let map = alice
        .create(ValueKind::Map, Owner::Agent, Vec::new())
        .unwrap();
    let result = alice.wait_for_sync(map, Duration::from_millis(50)).await;
    assert!(matches!(result, Err(NodeError::Timeout(_))));
    assert_ne!(
        alice.status(&map, &PeerId::new("silent")),
        cosync::ValueStatus::InSync
    );
}
