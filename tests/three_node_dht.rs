//! Three real nodes, each with its own HTTP listener, bootstrapping and
//! replicating a stored value across the network.

use meshcore::config::DhtConfig;
use meshcore::dht::{rpc, DhtNode};
use meshcore::node_id::NodeId;
use std::net::SocketAddr;
use std::sync::Arc;

async fn spawn_node(config: DhtConfig) -> (Arc<DhtNode>, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let node = DhtNode::new(NodeId::random(), addr.ip().to_string(), addr.port(), config);
    let app = rpc::router(node.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (node, addr)
}

#[tokio::test]
async fn value_stored_on_one_node_is_found_via_another_after_bootstrap() {
    let config = DhtConfig::default();
    let (node_a, addr_a) = spawn_node(config.clone()).await;
    let (node_b, addr_b) = spawn_node(config.clone()).await;
    let (node_c, addr_c) = spawn_node(config.clone()).await;
    let _ = addr_b;
    let _ = addr_c;

    let seed = vec![(addr_a.ip().to_string(), addr_a.port())];
    assert_eq!(node_b.bootstrap(&seed).await, 0);
    assert_eq!(node_c.bootstrap(&seed).await, 0);

    // A now knows both B and C via their inbound pings during bootstrap.
    assert_eq!(node_a.routing_table.all_nodes().len(), 2);

    let key = [42u8; meshcore::dht::KEY_LEN];
    let value = b"hello mesh".to_vec();
    assert!(node_a.store(key, value.clone(), None).await);

    // The value replicated out to B and C as part of the store call; a find
    // from C (which never talked to B or A beyond its own bootstrap ping)
    // resolves it without any further network round trip.
    assert_eq!(node_c.find_value(key).await, Some(value));
}

#[tokio::test]
async fn bootstrap_against_unreachable_seed_reports_full_failure() {
    let config = DhtConfig::default();
    let (node, _addr) = spawn_node(config).await;
    let unreachable = node.bootstrap(&[("127.0.0.1".to_string(), 1)]).await;
    assert_eq!(unreachable, 1);
}
