//! HTTP RPC surface for the DHT, matching the five endpoints named in §6
//! plus the `/dht/nodes` diagnostic retained from `dht_node.py` (SPEC_FULL
//! §10.6). Built on `axum`; every handler is a thin adapter translating
//! query-string parameters into calls on [`super::DhtNode`].

use super::DhtNode;
use crate::kbucket::NodeInfo;
use crate::node_id::NodeId;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub fn router(node: Arc<DhtNode>) -> Router {
    Router::new()
        .route("/dht/ping", get(handle_ping))
        .route("/dht/store", get(handle_store))
        .route("/dht/find_node", get(handle_find_node))
        .route("/dht/find_value", get(handle_find_value))
        .route("/dht/stats", get(handle_stats))
        .route("/dht/nodes", get(handle_nodes))
        .with_state(node)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(msg: impl Into<String>) -> (axum::http::StatusCode, Json<ErrorBody>) {
    (
        axum::http::StatusCode::BAD_REQUEST,
        Json(ErrorBody { error: msg.into() }),
    )
}

#[derive(Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
    pub node_id: String,
    pub timestamp: String,
}

async fn handle_ping(
    State(node): State<Arc<DhtNode>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PingResponse>, (axum::http::StatusCode, Json<ErrorBody>)> {
    if let (Some(id), Some(host), Some(port)) =
        (params.get("node_id"), params.get("host"), params.get("port"))
    {
        let Some(node_id) = NodeId::from_hex(id) else {
            return Err(bad_request("bad node_id"));
        };
        let Ok(port) = port.parse::<u16>() else {
            return Err(bad_request("bad port"));
        };
        node.routing_table.add(NodeInfo::new(node_id, host.clone(), port));
    }
    Ok(Json(PingResponse {
        status: "ok".to_string(),
        node_id: node.node_id.to_hex(),
        timestamp: crate::protocol::now_rfc3339(),
    }))
}

#[derive(Serialize)]
struct StoreResponse {
    status: &'static str,
    key: String,
}

async fn handle_store(
    State(node): State<Arc<DhtNode>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<StoreResponse>, (axum::http::StatusCode, Json<ErrorBody>)> {
    let (Some(key_hex), Some(value_hex)) = (params.get("key"), params.get("value")) else {
        return Err(bad_request("missing key or value"));
    };
    let Ok(key_bytes) = hex::decode(key_hex) else {
        return Err(bad_request("bad key"));
    };
    if key_bytes.len() != super::KEY_LEN {
        return Err(bad_request("key must be 20 bytes"));
    }
    let mut key = [0u8; super::KEY_LEN];
    key.copy_from_slice(&key_bytes);
    let Ok(value) = hex::decode(value_hex) else {
        return Err(bad_request("bad value"));
    };
    let publisher = params.get("publisher_id").and_then(|s| NodeId::from_hex(s));

    node.store(key, value, publisher).await;
    Ok(Json(StoreResponse {
        status: "stored",
        key: key_hex.clone(),
    }))
}

#[derive(Serialize, Deserialize)]
pub struct FindNodeResponse {
    pub nodes: Vec<NodeInfo>,
}

async fn handle_find_node(
    State(node): State<Arc<DhtNode>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<FindNodeResponse>, (axum::http::StatusCode, Json<ErrorBody>)> {
    let Some(target_hex) = params.get("target_id") else {
        return Err(bad_request("missing target_id"));
    };
    let Some(target) = NodeId::from_hex(target_hex) else {
        return Err(bad_request("bad target_id"));
    };
    add_sender(&node, &params);

    let closest = node.routing_table.find_closest(&target, node_k(&node));
    Ok(Json(FindNodeResponse { nodes: closest }))
}

#[derive(Serialize, Deserialize)]
pub struct FindValueResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeInfo>>,
}

async fn handle_find_value(
    State(node): State<Arc<DhtNode>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<FindValueResponse>, (axum::http::StatusCode, Json<ErrorBody>)> {
    let Some(key_hex) = params.get("key") else {
        return Err(bad_request("missing key"));
    };
    let Ok(key_bytes) = hex::decode(key_hex) else {
        return Err(bad_request("bad key"));
    };
    if key_bytes.len() != super::KEY_LEN {
        return Err(bad_request("key must be 20 bytes"));
    }
    let mut key = [0u8; super::KEY_LEN];
    key.copy_from_slice(&key_bytes);
    add_sender(&node, &params);

    if let Some(value) = node.local_value(key) {
        return Ok(Json(FindValueResponse {
            value: Some(hex::encode(value)),
            publisher_id: None,
            timestamp: Some(crate::protocol::now_rfc3339()),
            nodes: None,
        }));
    }

    let target = NodeId::from_bytes(&key);
    let closest = node.routing_table.find_closest(&target, node_k(&node));
    Ok(Json(FindValueResponse {
        value: None,
        publisher_id: None,
        timestamp: None,
        nodes: Some(closest),
    }))
}

#[derive(Serialize)]
struct StatsResponse {
    node_id: String,
    bucket_count: usize,
    stored_keys: usize,
}

async fn handle_stats(State(node): State<Arc<DhtNode>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        node_id: node.node_id.to_hex(),
        bucket_count: node.routing_table.bucket_count(),
        stored_keys: node.stored_key_count(),
    })
}

async fn handle_nodes(State(node): State<Arc<DhtNode>>) -> Json<FindNodeResponse> {
    Json(FindNodeResponse {
        nodes: node.routing_table.all_nodes(),
    })
}

fn add_sender(node: &DhtNode, params: &HashMap<String, String>) {
    if let (Some(id), Some(host), Some(port)) = (
        params.get("sender_id"),
        params.get("sender_host"),
        params.get("sender_port"),
    ) {
        if let (Some(node_id), Ok(port)) = (NodeId::from_hex(id), port.parse::<u16>()) {
            node.routing_table.add(NodeInfo::new(node_id, host.clone(), port));
        }
    }
}

fn node_k(node: &DhtNode) -> usize {
    node.k()
}
