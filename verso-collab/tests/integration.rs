//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use verso_collab::protocol::{Frame, SyncMessage};
use verso_collab::{ConnectionState, ServerConfig, SyncClient, SyncEvent, SyncHub, SyncServer};
use verso_core::{Replica, YrsReplica};
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

/// Start a server on a free port, return its URL and hub.
async fn start_test_server() -> (String, Arc<SyncHub>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server: SyncServer = SyncServer::new(ServerConfig::default());
    let hub = server.hub().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (format!("ws://{addr}"), hub)
}

fn insert(replica: &YrsReplica, chunk: &str) {
    let mut txn = replica.doc().transact_mut();
    let text = txn.get_or_insert_text("content");
    let len = text.len(&txn);
    text.insert(&mut txn, len, chunk);
}

fn content(replica: &YrsReplica) -> String {
    let txn = replica.doc().transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_raw_socket_receives_step1_first() {
    let (url, hub) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/raw?token=x"))
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(data) = msg else {
        panic!("Expected binary frame, got {msg:?}");
    };
    assert!(matches!(Frame::decode(&data).unwrap(), Frame::Sync(SyncMessage::SyncStep1(_))));
    assert_eq!(hub.room_names().await, vec!["raw".to_string()]);
}

#[tokio::test]
async fn test_malformed_frame_keeps_socket_open() {
    let (url, hub) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/doc")).await.unwrap();
    let _step1 = ws.next().await;

    ws.send(Message::Binary(vec![9u8, 9, 9].into())).await.unwrap();

    let author = YrsReplica::empty().unwrap();
    insert(&author, "still here");
    let delta = author.take_emitted().remove(0);
    ws.send(Message::Binary(Frame::update(delta).encode().into())).await.unwrap();

    // The update is echoed back to its sender.
    let msg = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(data) = msg else {
        panic!("Expected echoed update");
    };
    assert!(matches!(Frame::decode(&data).unwrap(), Frame::Sync(SyncMessage::Update(_))));
    assert_eq!(hub.stats().decode_errors, 1);
    assert_eq!(hub.connection_count("doc").await, 1);
}

#[tokio::test]
async fn test_two_clients_converge() {
    let (url, _hub) = start_test_server().await;

    let mut alice: SyncClient = SyncClient::new(&url, "notes").unwrap();
    alice.connect().await.unwrap();
    alice.edit(|r| insert(r, "Hello")).await.unwrap();

    // Bob joins late and catches up through the handshake.
    let mut bob: SyncClient = SyncClient::new(&url, "notes").unwrap();
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    let (alice, bob) = (&alice, &bob);
    assert!(eventually(move || async move { content(bob.replica()) == "Hello" }).await);

    let synced = timeout(Duration::from_secs(2), async {
        while let Some(event) = bob_events.recv().await {
            if matches!(event, SyncEvent::Synced) {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(synced, Ok(true));

    bob.edit(|r| insert(r, ", world")).await.unwrap();
    assert!(eventually(move || async move { content(alice.replica()) == "Hello, world" }).await);
    assert_eq!(content(bob.replica()), "Hello, world");
}

#[tokio::test]
async fn test_offline_edits_resync_on_reconnect() {
    let (url, _hub) = start_test_server().await;

    let mut alice: SyncClient = SyncClient::new(&url, "draft").unwrap();
    alice.connect().await.unwrap();
    let mut bob: SyncClient = SyncClient::new(&url, "draft").unwrap();
    bob.edit(|r| insert(r, "written offline")).await.unwrap();
    assert_eq!(bob.connection_state().await, ConnectionState::Disconnected);

    bob.connect().await.unwrap();
    let alice = &alice;
    assert!(eventually(move || async move { content(alice.replica()) == "written offline" }).await);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (url, hub) = start_test_server().await;

    let mut left: SyncClient = SyncClient::new(&url, "left").unwrap();
    let mut right: SyncClient = SyncClient::new(&url, "right").unwrap();
    left.connect().await.unwrap();
    right.connect().await.unwrap();
    let hub = &hub;
    assert!(eventually(move || async move { hub.room_count().await == 2 }).await);

    left.edit(|r| insert(r, "only left")).await.unwrap();
    let left_done = eventually(move || async move {
        hub.with_room("left", |room| content(room.doc()) == "only left")
            .await
            .unwrap_or(false)
    })
    .await;
    assert!(left_done);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(content(right.replica()), "");
}

#[tokio::test]
async fn test_presence_cleared_when_peer_leaves() {
    let (url, hub) = start_test_server().await;

    let mut alice: SyncClient = SyncClient::new(&url, "team").unwrap().with_client_id(1);
    let mut bob: SyncClient = SyncClient::new(&url, "team").unwrap().with_client_id(2);
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    alice
        .set_local_state(Some(json!({"user": {"name": "Alice"}})))
        .await
        .unwrap();
    let (bob, hub) = (&bob, &hub);
    assert!(eventually(move || async move { bob.peers().await.contains_key(&1) }).await);

    // Drop the socket without a polite tombstone.
    drop(alice);
    assert!(eventually(move || async move { bob.peers().await.is_empty() }).await);
    assert!(eventually(move || async move { hub.awareness_states("team").await.is_empty() }).await);
}

#[tokio::test]
async fn test_room_destroyed_after_last_disconnect() {
    let (url, hub) = start_test_server().await;

    let mut client: SyncClient = SyncClient::new(&url, "ephemeral").unwrap();
    client.connect().await.unwrap();
    let hub = &hub;
    assert!(eventually(move || async move { hub.room_count().await == 1 }).await);

    client.disconnect().await;
    assert!(eventually(move || async move { hub.room_count().await == 0 }).await);
    assert_eq!(hub.stats().connections_closed, 1);
}
