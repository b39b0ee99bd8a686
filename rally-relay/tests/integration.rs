//! Integration tests for the relay: a real server on a loopback port and
//! real engines talking to it through `RelayStore`.

use futures_util::{SinkExt, StreamExt};
use rally_relay::{FaultKind, RelayConfig, RelayFrame, RelayServer, RelayStore};
use rally_sync::{
    EngineConfig, MatchListener, MemoryQueue, MemoryStore, Roster, SessionDocument, SessionPatch,
    SessionProbe, SessionStatus, SessionStore, StoreError, SyncEngine,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Start a relay on a free port, return its URL and backing store.
async fn start_relay() -> (String, MemoryStore) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let store = MemoryStore::new();
    let server = RelayServer::with_store(RelayConfig::for_testing(), store.clone());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (format!("ws://127.0.0.1:{port}"), store)
}

async fn engine_over(url: &str) -> SyncEngine {
    let store = RelayStore::connect(url).await.unwrap();
    SyncEngine::start(
        Arc::new(store),
        Arc::new(MemoryQueue::new()),
        EngineConfig::for_testing(),
    )
    .await
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_connected_count(store: &MemoryStore, session_id: &str, expected: u32) -> u32 {
    let mut count = 0;
    for _ in 0..200 {
        count = store
            .get(session_id)
            .await
            .unwrap()
            .map_or(0, |doc| doc.connected_count);
        if count == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    count
}

#[tokio::test]
async fn test_store_operations_round_trip() {
    let (url, backing) = start_relay().await;
    let store = RelayStore::connect(&url).await.unwrap();

    assert!(store.get("RT001").await.unwrap().is_none());
    store
        .create("RT001", SessionDocument::hosted("h", json!({"s": 0})))
        .await
        .unwrap();
    store
        .merge("RT001", SessionPatch::state(json!({"s": 1})))
        .await
        .unwrap();

    let doc = store.get("RT001").await.unwrap().unwrap();
    assert_eq!(doc.state, json!({"s": 1}));
    assert_eq!(backing.get("RT001").await.unwrap().unwrap(), doc);

    store
        .put_member("RT001", Roster::Spectators, "u1", json!({"uid": "u1"}))
        .await
        .unwrap();
    let members = store.list_members("RT001", Roster::Spectators).await.unwrap();
    assert_eq!(members, vec![("u1".to_string(), json!({"uid": "u1"}))]);

    store
        .delete_members("RT001", Roster::Spectators, &["u1".to_string()])
        .await
        .unwrap();
    assert!(store.list_members("RT001", Roster::Spectators).await.unwrap().is_empty());

    store.delete("RT001").await.unwrap();
    assert!(store.get("RT001").await.unwrap().is_none());
}

#[tokio::test]
async fn test_store_errors_keep_their_kind() {
    let (url, _backing) = start_relay().await;
    let store = RelayStore::connect(&url).await.unwrap();

    store
        .merge("FIN01", SessionPatch::finish())
        .await
        .unwrap();
    let err = store
        .merge("FIN01", SessionPatch::state(json!(1)))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::SessionFinished("FIN01".into()));
}

#[tokio::test]
async fn test_watch_streams_changes() {
    let (url, backing) = start_relay().await;
    let store = RelayStore::connect(&url).await.unwrap();

    let mut snapshots = store.watch("WCH01").await;
    let first = timeout(Duration::from_secs(2), snapshots.next()).await.unwrap();
    assert_eq!(first, Some(Ok(None)));

    backing
        .create("WCH01", SessionDocument::hosted("h", json!("a")))
        .await
        .unwrap();
    let second = timeout(Duration::from_secs(2), snapshots.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second.state, json!("a"));
}

#[tokio::test]
async fn test_host_and_spectator_over_relay() {
    let (url, backing) = start_relay().await;
    let host = engine_over(&url).await;
    let spectator = engine_over(&url).await;

    host.host_match("ABC12", "host-uid", json!({"scoreA": 0}))
        .await
        .unwrap();

    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let ended = Arc::new(Mutex::new(0u32));
    let (r, e) = (received.clone(), ended.clone());
    let listener = MatchListener::new(move |state| r.lock().unwrap().push(state))
        .on_session_ended(move || *e.lock().unwrap() += 1);
    let _sub = spectator.subscribe_to_match("ABC12", listener);

    assert!(eventually(|| received.lock().unwrap().contains(&json!({"scoreA": 0}))).await);

    host.broadcast_state("ABC12", json!({"scoreA": 1}));
    assert!(eventually(|| received.lock().unwrap().contains(&json!({"scoreA": 1}))).await);

    spectator.join_as_spectator("ABC12", "viewer-1").await.unwrap();
    assert_eq!(wait_for_connected_count(&backing, "ABC12", 2).await, 2);

    host.end_session("ABC12").await.unwrap();
    assert!(eventually(|| *ended.lock().unwrap() == 1).await);
    assert_eq!(
        backing.get("ABC12").await.unwrap().unwrap().status,
        SessionStatus::Finished
    );
    assert_eq!(backing.member_count("ABC12", Roster::Spectators).await, 0);
    assert_eq!(spectator.check_session_status("ABC12").await, SessionProbe::Finished);
}

#[tokio::test]
async fn test_malformed_frame_gets_error_response() {
    let (url, _backing) = start_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Text("not json".into())).await.unwrap();
    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let frame = match reply {
        Message::Text(text) => RelayFrame::decode(text.as_str()).unwrap(),
        other => panic!("unexpected message {other:?}"),
    };
    match frame {
        RelayFrame::Error { id, error } => {
            assert_eq!(id, 0);
            assert_eq!(error.kind, FaultKind::Malformed);
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_to_missing_relay_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    assert!(RelayStore::connect(&format!("ws://127.0.0.1:{port}")).await.is_err());
}
