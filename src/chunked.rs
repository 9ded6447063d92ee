//! Chunked transfer: splits an oversized envelope into ordered, checksummed
//! chunks on send, reassembles them on receive.

use crate::config::ChunkingConfig;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as b64, Engine as _};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub transfer_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub data: String, // base64
    pub checksum: String,
}

/// First 16 hex characters of SHA-256 of the raw (pre-base64) chunk bytes.
/// A duplicate-detection aid only, not a cryptographic integrity check —
/// authenticity comes from the envelope signature on the reassembled
/// inner message.
fn checksum(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(digest)[..16].to_string()
}

/// Splits `data` into chunks of at most `chunk_size` bytes.
pub fn split(data: &[u8], chunk_size: usize) -> (String, Vec<ChunkPayload>) {
    let transfer_id = Uuid::new_v4().to_string();
    let total_chunks = data.len().div_ceil(chunk_size).max(1);
    let chunks = data
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(i, piece)| ChunkPayload {
            transfer_id: transfer_id.clone(),
            chunk_index: i,
            total_chunks,
            data: b64.encode(piece),
            checksum: checksum(piece),
        })
        .collect();
    (transfer_id, chunks)
}

struct PendingTransfer {
    sender: crate::protocol::PeerId,
    recipient: crate::protocol::PeerId,
    total_chunks: usize,
    chunks: std::collections::HashMap<usize, Vec<u8>>,
    created_at: u64,
}

/// Receive-side reassembly buffer, keyed by `transfer_id`.
pub struct ChunkReassembler {
    config: ChunkingConfig,
    pending: DashMap<String, PendingTransfer>,
}

impl ChunkReassembler {
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            config,
            pending: DashMap::new(),
        }
    }

    /// Feeds one chunk in. Returns `Some(reassembled_bytes)` once every
    /// chunk for its transfer has arrived, `None` otherwise (including on
    /// duplicate chunk indices, which are ignored).
    pub fn receive(
        &self,
        sender: crate::protocol::PeerId,
        recipient: crate::protocol::PeerId,
        chunk: ChunkPayload,
    ) -> Result<Option<Vec<u8>>> {
        let raw = b64
            .decode(&chunk.data)
            .map_err(|e| Error::InvalidInput(format!("bad chunk base64: {e}")))?;
        if checksum(&raw) != chunk.checksum {
            return Err(Error::ChecksumFailed);
        }

        let mut entry = self.pending.entry(chunk.transfer_id.clone()).or_insert_with(|| {
            PendingTransfer {
                sender,
                recipient,
                total_chunks: chunk.total_chunks,
                chunks: std::collections::HashMap::new(),
                created_at: now_secs(),
            }
        });
        entry.chunks.entry(chunk.chunk_index).or_insert(raw);

        if entry.chunks.len() == entry.total_chunks {
            let total = entry.total_chunks;
            let mut out = Vec::new();
            for i in 0..total {
                match entry.chunks.get(&i) {
                    Some(piece) => out.extend_from_slice(piece),
                    None => return Ok(None),
                }
            }
            drop(entry);
            self.pending.remove(&chunk.transfer_id);
            return Ok(Some(out));
        }

        Ok(None)
    }

    /// Removes transfers whose `created_at` is older than the configured
    /// stale TTL; they are dropped silently per the chunked-transfer spec.
    pub fn prune_stale(&self) {
        let now = now_secs();
        let ttl = self.config.stale_transfer_ttl_secs;
        self.pending
            .retain(|_, t| now.saturating_sub(t.created_at) < ttl);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
