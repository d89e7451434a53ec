//! Record storage plugin: `get`/`set` plus a changefeed stream, the only
//! cross-process write signal `RecordHandler` consumes. Two
//! implementations are provided: an in-memory map for tests and
//! non-durable deployments, and a `sled`-backed store for durable ones.

use async_trait::async_trait;
use meshsync_core::Version;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub name: String,
    pub version: Version,
    pub body: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// A change notification emitted after a successful `set`, consumed by
/// every `RecordHandler` on the process (including the one that issued
/// the write, since the merge path is idempotent against a version it
/// already holds).
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub name: String,
    pub version: Version,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, name: &str) -> Result<StoredRecord, StorageError>;
    async fn set(&self, record: StoredRecord) -> Result<(), StorageError>;
    fn changes(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// Non-durable `Storage` backed by a `HashMap`. Default for deployments
/// that don't configure a database path, and for tests.
pub struct MemoryStorage {
    records: Mutex<HashMap<String, StoredRecord>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            changes: tx,
        })
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, name: &str) -> Result<StoredRecord, StorageError> {
        self.records
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn set(&self, record: StoredRecord) -> Result<(), StorageError> {
        let name = record.name.clone();
        let version = record.version.clone();
        self.records.lock().unwrap().insert(name.clone(), record);
        let _ = self.changes.send(ChangeEvent { name, version });
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

const TREE_RECORDS: &str = "records";

#[derive(serde::Serialize, serde::Deserialize)]
struct SledRecord {
    version: String,
    body: String,
}

/// Durable `Storage` backed by an embedded `sled` database. Records are
/// serialized as `bincode(SledRecord)`; the body is kept as a JSON string
/// rather than parsed into `sled`'s own types, mirroring how the message
/// log this is adapted from stored its payload.
pub struct SledStorage {
    tree: sled::Tree,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SledStorage {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Arc<Self>, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        let tree = db
            .open_tree(TREE_RECORDS)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let (tx, _rx) = broadcast::channel(1024);
        Ok(Arc::new(Self { tree, changes: tx }))
    }
}

#[async_trait]
impl Storage for SledStorage {
    async fn get(&self, name: &str) -> Result<StoredRecord, StorageError> {
        let bytes = self
            .tree
            .get(name)
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        let stored: SledRecord =
            bincode::deserialize(&bytes).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(StoredRecord {
            name: name.to_string(),
            version: Version::parse(&stored.version)
                .map_err(|e| StorageError::Backend(e.to_string()))?,
            body: serde_json::from_str(&stored.body)
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        })
    }

    async fn set(&self, record: StoredRecord) -> Result<(), StorageError> {
        let sled_record = SledRecord {
            version: record.version.to_string(),
            body: record.body.to_string(),
        };
        let bytes =
            bincode::serialize(&sled_record).map_err(|e| StorageError::Backend(e.to_string()))?;
        self.tree
            .insert(record.name.as_bytes(), bytes)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.tree
            .flush_async()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let _ = self.changes.send(ChangeEvent {
            name: record.name,
            version: record.version,
        });
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage
            .set(StoredRecord {
                name: "foo".into(),
                version: Version::new(1, "aaa"),
                body: serde_json::json!({"x": 1}),
            })
            .await
            .unwrap();

        let got = storage.get("foo").await.unwrap();
        assert_eq!(got.version.to_string(), "1-aaa");
    }

    #[tokio::test]
    async fn memory_storage_emits_change_event() {
        let storage = MemoryStorage::new();
        let mut rx = storage.changes();
        storage
            .set(StoredRecord {
                name: "foo".into(),
                version: Version::new(1, "aaa"),
                body: serde_json::json!(null),
            })
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "foo");
    }

    #[tokio::test]
    async fn get_missing_record_errors() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.get("missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn sled_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SledStorage::open(dir.path()).unwrap();
        storage
            .set(StoredRecord {
                name: "foo".into(),
                version: Version::new(3, "zzz"),
                body: serde_json::json!({"y": 2}),
            })
            .await
            .unwrap();
        let got = storage.get("foo").await.unwrap();
        assert_eq!(got.version.to_string(), "3-zzz");
        assert_eq!(got.body, serde_json::json!({"y": 2}));
    }
}
