//! Wire envelope (`SecureMessage`) and message codec.
//!
//! The envelope is UTF-8 JSON with a fixed field set. Canonical form for
//! signing and AEAD associated data is the same JSON object with its
//! `signature` field cleared and members ordered lexicographically by
//! `serde_json`'s default `BTreeMap`-backed `Value` serialization.

use crate::crypto;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as b64, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Long-lived entity identity key, 32 bytes (Ed25519-sized).
pub type PeerId = [u8; 32];

pub const PROTOCOL_VERSION: &str = "1.1";

pub mod msg_type {
    pub const HANDSHAKE_INIT: &str = "handshake_init";
    pub const HANDSHAKE_INIT_ACK: &str = "handshake_init_ack";
    pub const CHALLENGE_RESPONSE: &str = "challenge_response";
    pub const SESSION_ESTABLISHED: &str = "session_established";
    pub const SESSION_CONFIRM: &str = "session_confirm";
    pub const READY: &str = "ready";
    pub const CHUNK: &str = "chunk";
    pub const PING: &str = "ping";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const STATUS_REPORT: &str = "status_report";
    pub const TASK_DELEGATE: &str = "task_delegate";
    pub const CAPABILITY_QUERY: &str = "capability_query";
    pub const ERROR: &str = "error";

    /// Tags used only by the legacy three-step handshake. The handshake
    /// engine recognizes these just far enough to answer
    /// `UNSUPPORTED_VERSION` cleanly; it never processes them.
    pub const LEGACY_HANDSHAKE: &[&str] = &["hello", "hello_ack", "finished"];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureMessage {
    pub version: String,
    pub msg_type: String,
    #[serde(with = "hex_peer_id")]
    pub sender_id: PeerId,
    #[serde(with = "hex_peer_id")]
    pub recipient_id: PeerId,
    pub payload: serde_json::Value,
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_num: Option<u64>,
}

mod hex_peer_id {
    use super::PeerId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &PeerId, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(id))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<PeerId, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let mut out = [0u8; 32];
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("peer id must be 32 bytes"));
        }
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

impl SecureMessage {
    pub fn builder(msg_type: &str, sender_id: PeerId, recipient_id: PeerId) -> SecureMessageBuilder {
        SecureMessageBuilder {
            msg_type: msg_type.to_string(),
            sender_id,
            recipient_id,
            payload: serde_json::json!({}),
            session_id: None,
            sequence_num: None,
        }
    }

    /// The canonical byte form used for both signing and as AEAD associated
    /// data: this envelope with `signature` cleared, serialized as
    /// compact JSON with lexicographically sorted keys.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut cleared = self.clone();
        cleared.signature = String::new();
        let value = serde_json::to_value(&cleared).expect("envelope always serializes");
        let sorted = sort_json(value);
        serde_json::to_vec(&sorted).expect("sorted value always serializes")
    }

    pub fn sign(&mut self, identity: &crate::crypto::IdentityKeyPair) {
        self.signature = String::new();
        let bytes = self.canonical_bytes();
        let sig = identity.sign(&bytes);
        self.signature = b64.encode(sig);
    }

    pub fn verify_signature(&self, sender_public_key: &PeerId) -> bool {
        let Ok(sig_bytes) = b64.decode(&self.signature) else {
            return false;
        };
        if sig_bytes.len() != 64 {
            return false;
        }
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&sig_bytes);
        let canonical = self.canonical_bytes();
        crypto::verify(sender_public_key, &canonical, &sig)
    }

    pub fn timestamp_secs(&self) -> Result<u64> {
        chrono::DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|dt| dt.timestamp().max(0) as u64)
            .map_err(|e| Error::InvalidInput(format!("bad timestamp: {e}")))
    }
}

pub struct SecureMessageBuilder {
    msg_type: String,
    sender_id: PeerId,
    recipient_id: PeerId,
    payload: serde_json::Value,
    session_id: Option<String>,
    sequence_num: Option<u64>,
}

impl SecureMessageBuilder {
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn sequence_num(mut self, n: u64) -> Self {
        self.sequence_num = Some(n);
        self
    }

    pub fn build(self) -> SecureMessage {
        let mut nonce_bytes = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce_bytes);
        SecureMessage {
            version: PROTOCOL_VERSION.to_string(),
            msg_type: self.msg_type,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            payload: self.payload,
            timestamp: chrono::Utc::now().to_rfc3339(),
            nonce: hex::encode(nonce_bytes),
            signature: String::new(),
            session_id: self.session_id,
            sequence_num: self.sequence_num,
        }
    }
}

/// AEAD associated data per §4.5: the canonicalized
/// `{version, msg_type, sender_id, recipient_id, session_id, sequence_num}`
/// tuple, binding the ciphertext to its envelope metadata.
pub fn associated_data(
    version: &str,
    msg_type: &str,
    sender_id: &PeerId,
    recipient_id: &PeerId,
    session_id: &str,
    sequence_num: u64,
) -> Vec<u8> {
    let value = serde_json::json!({
        "version": version,
        "msg_type": msg_type,
        "sender_id": hex::encode(sender_id),
        "recipient_id": hex::encode(recipient_id),
        "session_id": session_id,
        "sequence_num": sequence_num,
    });
    let sorted = sort_json(value);
    serde_json::to_vec(&sorted).expect("sorted value always serializes")
}

fn sort_json(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_json(v))).collect();
            serde_json::to_value(sorted).expect("BTreeMap always serializes to an object")
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_json).collect())
        }
        other => other,
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let identity = crate::crypto::IdentityKeyPair::generate();
        let mut msg = SecureMessage::builder(msg_type::PING, identity.public_key(), [1u8; 32])
            .payload(serde_json::json!({"hello": "world"}))
            .build();
        msg.sign(&identity);
        assert!(msg.verify_signature(&identity.public_key()));
    }

    #[test]
    fn tampering_with_payload_breaks_verification() {
        let identity = crate::crypto::IdentityKeyPair::generate();
        let mut msg = SecureMessage::builder(msg_type::PING, identity.public_key(), [1u8; 32]).build();
        msg.sign(&identity);
        msg.payload = serde_json::json!({"tampered": true});
        assert!(!msg.verify_signature(&identity.public_key()));
    }

    #[test]
    fn canonical_bytes_are_stable_regardless_of_field_insertion_order() {
        let identity = crate::crypto::IdentityKeyPair::generate();
        let msg = SecureMessage::builder(msg_type::PING, identity.public_key(), [1u8; 32])
            .payload(serde_json::json!({"b": 1, "a": 2}))
            .build();
        let bytes1 = msg.canonical_bytes();
        let bytes2 = msg.canonical_bytes();
        assert_eq!(bytes1, bytes2);
    }
}
