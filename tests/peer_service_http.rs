//! End-to-end handshake and message exchange between two [`PeerService`]s
//! talking over real HTTP listeners, rather than driving the handshake
//! functions directly as the in-crate unit tests do.

use async_trait::async_trait;
use meshcore::config::MeshConfig;
use meshcore::crypto::IdentityKeyPair;
use meshcore::peer_service::{self, MessageHandler, PeerService, SendOptions};
use meshcore::protocol::PeerId;
use meshcore::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

struct RecordingHandler {
    received: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, _from: PeerId, payload: serde_json::Value) -> Result<()> {
        self.received.lock().unwrap().push(payload);
        Ok(())
    }
}

async fn spawn_peer(identity: IdentityKeyPair, config: MeshConfig) -> (Arc<PeerService>, SocketAddr) {
    let service = PeerService::new(identity, config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = peer_service::transport::router(service.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (service, addr)
}

#[tokio::test]
async fn real_http_handshake_then_two_ordered_messages_reach_the_handler() {
    let (alice, _alice_addr) = spawn_peer(IdentityKeyPair::generate(), MeshConfig::default()).await;
    let (bob, bob_addr) = spawn_peer(IdentityKeyPair::generate(), MeshConfig::default()).await;

    alice.register_endpoint(bob.local_peer_id, bob_addr.ip().to_string(), bob_addr.port());

    let handler = Arc::new(RecordingHandler {
        received: Mutex::new(Vec::new()),
    });
    bob.register_handler("status_report", handler.clone()).unwrap();

    alice.connect(bob.local_peer_id).await.unwrap();

    alice
        .send_message(bob.local_peer_id, "status_report", serde_json::json!({"n": 1}), SendOptions::default())
        .await
        .unwrap();
    alice
        .send_message(bob.local_peer_id, "status_report", serde_json::json!({"n": 2}), SendOptions::default())
        .await
        .unwrap();

    let received = handler.received.lock().unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0]["n"], 1);
    assert_eq!(received[1]["n"], 2);
}

#[tokio::test]
async fn session_is_ready_and_tracked_on_both_sides_after_connect() {
    let (alice, _alice_addr) = spawn_peer(IdentityKeyPair::generate(), MeshConfig::default()).await;
    let (bob, bob_addr) = spawn_peer(IdentityKeyPair::generate(), MeshConfig::default()).await;
    alice.register_endpoint(bob.local_peer_id, bob_addr.ip().to_string(), bob_addr.port());

    alice.connect(bob.local_peer_id).await.unwrap();

    let alice_stats = alice.session_stats();
    let bob_stats = bob.session_stats();
    assert_eq!(alice_stats.ready, 1);
    assert_eq!(bob_stats.ready, 1);
    assert_eq!(alice.list_sessions().len(), 1);
    assert_eq!(bob.list_sessions().len(), 1);
}

#[tokio::test]
async fn sending_to_an_unregistered_peer_fails_without_reaching_the_network() {
    let (alice, _alice_addr) = spawn_peer(IdentityKeyPair::generate(), MeshConfig::default()).await;
    let result = alice
        .send_message([9u8; 32], "ping", serde_json::json!({}), SendOptions { encrypt: false, auto_chunk: false })
        .await;
    assert!(result.is_err());
}
