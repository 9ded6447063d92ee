//! Persistence port (§6): a narrow abstraction the DHT, session manager,
//! and rate limiter hydrate/snapshot their state through. The in-memory
//! implementation is authoritative and holds no external resource;
//! [`FilePersistence`] is an opt-in JSON-snapshot-to-disk adapter.
//!
//! The teacher's `persistence.rs` was a concrete file-blob store
//! (`PersistenceManager::save_string`/`load_string`), not an abstract port.
//! Its save/load shape is kept here as the body of [`FilePersistence`],
//! behind the new [`PersistencePort`] trait the spec calls for.

use crate::error::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;

/// Abstract snapshot storage for routing-table and DHT-value state. Keys
/// are opaque strings chosen by the caller (e.g. `"routing_table"`,
/// `"dht_values"`); values are JSON-serializable snapshots.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn save_routing_table(&self, snapshot: &serde_json::Value) -> Result<()>;
    async fn load_routing_table(&self) -> Result<Option<serde_json::Value>>;
    async fn save_dht_values(&self, snapshot: &serde_json::Value) -> Result<()>;
    async fn load_dht_values(&self) -> Result<Option<serde_json::Value>>;
}

/// Serializes `value` and calls the port's save method for its kind; a
/// small convenience so callers don't hand-roll `serde_json::to_value`.
pub async fn save_routing_table<T: Serialize + Sync>(port: &dyn PersistencePort, value: &T) -> Result<()> {
    let snapshot = serde_json::to_value(value)?;
    port.save_routing_table(&snapshot).await
}

pub async fn load_routing_table<T: DeserializeOwned>(port: &dyn PersistencePort) -> Result<Option<T>> {
    match port.load_routing_table().await? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

/// Default, purely in-memory [`PersistencePort`]: durability is optional per
/// §6, and this implementation provides none -- snapshots live only as long
/// as the process does.
#[derive(Default)]
pub struct InMemoryPersistence {
    routing_table: RwLock<Option<serde_json::Value>>,
    dht_values: RwLock<Option<serde_json::Value>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistencePort for InMemoryPersistence {
    async fn save_routing_table(&self, snapshot: &serde_json::Value) -> Result<()> {
        *self.routing_table.write().expect("lock poisoned") = Some(snapshot.clone());
        Ok(())
    }

    async fn load_routing_table(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.routing_table.read().expect("lock poisoned").clone())
    }

    async fn save_dht_values(&self, snapshot: &serde_json::Value) -> Result<()> {
        *self.dht_values.write().expect("lock poisoned") = Some(snapshot.clone());
        Ok(())
    }

    async fn load_dht_values(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.dht_values.read().expect("lock poisoned").clone())
    }
}

/// Opt-in adapter that snapshots to two JSON files under a data directory,
/// grounded in the teacher's `PersistenceManager::save_string`/
/// `load_string` file-write shape.
pub struct FilePersistence {
    data_dir: PathBuf,
}

const ROUTING_TABLE_FILE: &str = "routing_table.json";
const DHT_VALUES_FILE: &str = "dht_values.json";

impl FilePersistence {
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).await?;
        }
        Ok(Self { data_dir })
    }

    async fn write_json(&self, filename: &str, value: &serde_json::Value) -> Result<()> {
        let path = self.data_dir.join(filename);
        let body = serde_json::to_vec_pretty(value)?;
        fs::write(path, body).await?;
        Ok(())
    }

    async fn read_json(&self, filename: &str) -> Result<Option<serde_json::Value>> {
        let path = self.data_dir.join(filename);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[async_trait]
impl PersistencePort for FilePersistence {
    async fn save_routing_table(&self, snapshot: &serde_json::Value) -> Result<()> {
        self.write_json(ROUTING_TABLE_FILE, snapshot).await
    }

    async fn load_routing_table(&self) -> Result<Option<serde_json::Value>> {
        self.read_json(ROUTING_TABLE_FILE).await
    }

    async fn save_dht_values(&self, snapshot: &serde_json::Value) -> Result<()> {
        self.write_json(DHT_VALUES_FILE, snapshot).await
    }

    async fn load_dht_values(&self) -> Result<Option<serde_json::Value>> {
        self.read_json(DHT_VALUES_FILE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_round_trips_a_snapshot() {
        let port = InMemoryPersistence::new();
        let snapshot = serde_json::json!({"nodes": ["a", "b"]});
        port.save_routing_table(&snapshot).await.unwrap();
        assert_eq!(port.load_routing_table().await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn in_memory_starts_empty() {
        let port = InMemoryPersistence::new();
        assert_eq!(port.load_dht_values().await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_persistence_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("meshcore-persist-test-{}", std::process::id()));
        let port = FilePersistence::new(&dir).await.unwrap();
        let snapshot = serde_json::json!({"values": [1, 2, 3]});
        port.save_dht_values(&snapshot).await.unwrap();
        assert_eq!(port.load_dht_values().await.unwrap(), Some(snapshot));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
