//! Integration tests for the concrete end-to-end scenarios in spec.md
//! \S8 ("Concrete end-to-end scenarios (literal)"), exercised against the
//! public `room`/`coordinator` API rather than the CRDT directly.

use std::sync::Arc;
use std::time::Duration;

use marginalia::auth::{DevTokenResolver, Identity};
use marginalia::codec::ServerMessage;
use marginalia::config::Config;
use marginalia::connection::Connection;
use marginalia::coordinator::{AdmissionError, SessionCoordinator};
use marginalia::crdt::SequenceCRDT;
use marginalia::room::{self, SubmitOutcome};
use marginalia::store::{DocumentStore, InMemoryDocumentStore};

fn test_config() -> Config {
    Config {
        save_delay: Duration::from_millis(50),
        ..Config::default()
    }
}

/// Scenario 1: two-client interleave. A types "H" then "i" at the front
/// of a fresh document; B concurrently inserts "!" at the front. After
/// both streams drain, every replica (including the room's own CRDT)
/// converges on the same three-character string.
#[tokio::test]
async fn two_client_interleave_converges() {
    let (retired_tx, _retired_rx) = tokio::sync::mpsc::unbounded_channel();
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
    let config = Arc::new(test_config());
    let handle = room::spawn("d1".into(), "server".into(), config, store, retired_tx);

    let (conn_a, rx_a) = Connection::new("d1".into(), Identity::Guest, "A".into());
    let (conn_b, rx_b) = Connection::new("d1".into(), Identity::Guest, "B".into());
    let id_a = conn_a.id;
    let id_b = conn_b.id;
    handle.subscribe(conn_a).await.unwrap();
    handle.subscribe(conn_b).await.unwrap();
    // Drain the user_joined broadcasts so they don't interleave with
    // operation messages below.
    let _ = rx_a.try_recv();

    // Each client maintains its own local replica, generating ops the
    // way a real browser-side replica would.
    let mut replica_a = SequenceCRDT::new("A".to_string());
    let op_h = replica_a.local_insert(0, 'H').unwrap();
    let op_i = replica_a.local_insert(1, 'i').unwrap();

    let mut replica_b = SequenceCRDT::new("B".to_string());
    let op_bang = replica_b.local_insert(0, '!').unwrap();

    assert!(matches!(handle.submit(id_a, op_h.clone()).await, SubmitOutcome::Ack));
    assert!(matches!(handle.submit(id_a, op_i.clone()).await, SubmitOutcome::Ack));
    assert!(matches!(handle.submit(id_b, op_bang.clone()).await, SubmitOutcome::Ack));

    // B must see A's ops broadcast to it, and vice versa, to build its
    // own converged replica (the room only stores the string. We
    // instead assert via a fresh request_state against the room).
    let refreshed = handle.request_state(id_a).await.unwrap();
    let text = match refreshed {
        ServerMessage::InitialState { text, .. } => text,
        _ => panic!("unexpected message"),
    };
    assert!(text == "!Hi" || text == "Hi!");

    drop(rx_b);
}

/// Scenario 4: debounced save. Submitting a burst of ops followed by
/// quiescence results in exactly one write to the `DocumentStore`,
/// roughly `saveDelay` after the last op.
#[tokio::test(start_paused = true)]
async fn debounced_save_writes_once_after_quiescence() {
    let (retired_tx, _retired_rx) = tokio::sync::mpsc::unbounded_channel();
    let store = Arc::new(InMemoryDocumentStore::new());
    let store_dyn: Arc<dyn DocumentStore> = store.clone();
    let config = Arc::new(test_config());
    let save_delay = config.save_delay;
    let handle = room::spawn("d1".into(), "server".into(), config, store_dyn, retired_tx);

    let (conn, _rx) = Connection::new("d1".into(), Identity::Guest, "A".into());
    let id = conn.id;
    handle.subscribe(conn).await.unwrap();

    let mut replica = SequenceCRDT::new("A".to_string());
    for i in 0..20 {
        let op = replica.local_insert(i, 'x').unwrap();
        handle.submit(id, op).await;
        tokio::time::advance(Duration::from_millis(10)).await;
    }

    assert!(store.load_state("d1").await.unwrap().is_none());

    tokio::time::advance(save_delay + Duration::from_millis(20)).await;
    tokio::task::yield_now().await;

    let bytes = store.load_state("d1").await.unwrap().expect("debounced write should have landed");
    let restored = SequenceCRDT::restore(&bytes).unwrap();
    assert_eq!(restored.text(), "xxxxxxxxxxxxxxxxxxxx");
}

/// Scenario 5: capacity. With `maxConnectionsPerDocument = 2`, a third
/// connection to the same document is refused at admission while the
/// first two are unaffected.
#[tokio::test]
async fn per_document_capacity_refuses_third_connection() {
    let config = Config {
        max_connections_per_document: 2,
        ..test_config()
    };
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
    let auth = Arc::new(DevTokenResolver::new());
    let coordinator = SessionCoordinator::new(config, store, auth);

    let first = coordinator.admit("d1", None).await.unwrap();
    let (conn1, _rx1) = Connection::new("d1".into(), first.identity.clone(), first.site_id.clone());
    first.room.subscribe(conn1).await.unwrap();

    let second = coordinator.admit("d1", None).await.unwrap();
    let (conn2, _rx2) = Connection::new("d1".into(), second.identity.clone(), second.site_id.clone());
    second.room.subscribe(conn2).await.unwrap();

    let third = coordinator.admit("d1", None).await;
    assert_eq!(third.unwrap_err(), AdmissionError::DocumentCapacity);
}

/// Scenario 6: disconnect broadcast. With A, B, C connected, killing C's
/// connection delivers exactly one `user_left` to A and B, and a
/// subsequent op from A still reaches B.
#[tokio::test]
async fn disconnect_broadcasts_user_left_to_remaining_peers() {
    let (retired_tx, _retired_rx) = tokio::sync::mpsc::unbounded_channel();
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
    let config = Arc::new(test_config());
    let handle = room::spawn("d1".into(), "server".into(), config, store, retired_tx);

    let (conn_a, rx_a) = Connection::new("d1".into(), Identity::Guest, "A".into());
    let (conn_b, rx_b) = Connection::new("d1".into(), Identity::Guest, "B".into());
    let (conn_c, rx_c) = Connection::new("d1".into(), Identity::Guest, "C".into());
    let id_a = conn_a.id;
    let id_b = conn_b.id;
    let id_c = conn_c.id;
    let site_c = conn_c.site_id.clone();

    handle.subscribe(conn_a).await.unwrap();
    handle.subscribe(conn_b).await.unwrap();
    handle.subscribe(conn_c).await.unwrap();

    // Drain join broadcasts.
    while rx_a.try_recv().is_ok() {}
    while rx_b.try_recv().is_ok() {}

    handle.unsubscribe(id_c).await;
    // Give the actor a beat to process the unsubscribe.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut left_count_a = 0;
    while let Ok(msg) = rx_a.try_recv() {
        if let ServerMessage::UserLeft { site_id, .. } = msg {
            assert_eq!(site_id, site_c);
            left_count_a += 1;
        }
    }
    assert_eq!(left_count_a, 1);

    let mut left_count_b = 0;
    while let Ok(msg) = rx_b.try_recv() {
        if let ServerMessage::UserLeft { site_id, .. } = msg {
            assert_eq!(site_id, site_c);
            left_count_b += 1;
        }
    }
    assert_eq!(left_count_b, 1);

    let mut replica = SequenceCRDT::new("A".to_string());
    let op = replica.local_insert(0, 'x').unwrap();
    handle.submit(id_a, op).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(rx_b.try_recv(), Ok(ServerMessage::Operation { .. })));
    assert!(rx_c.try_recv().is_err());
    let _ = id_b;
}
