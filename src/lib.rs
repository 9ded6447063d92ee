//! Peer-to-peer communication core for a decentralized agent mesh.
//!
//! Provides a Kademlia distributed hash table for peer discovery and a
//! session protocol giving authenticated, end-to-end encrypted, ordered,
//! replay-resistant channels between entities identified by long-lived
//! signing keys.

pub mod config;
pub mod error;

pub mod node_id;
pub mod kbucket;
pub mod routing_table;
pub mod dht;

pub mod crypto;
pub mod replay;
pub mod session;
pub mod handshake;

pub mod protocol;
pub mod chunked;
pub mod rate_limit;
pub mod retry;
pub mod heartbeat;

pub mod persistence;
pub mod discovery;
pub mod peer_service;

pub use config::MeshConfig;
pub use error::{Error, ProtocolErrorCode, Result};
pub use node_id::NodeId;
pub use peer_service::PeerService;
