use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use sled::Db;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// A set of writes applied all-or-nothing by [`KvStore::apply_batch`].
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

#[derive(Debug)]
enum BatchOp {
    Insert(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Insert(key, value));
    }

    pub fn remove(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Remove(key));
    }
}

/// Ordered byte-keyed store backing the chain and the UTXO index.
///
/// Multi-step mutations (tip advance, index maintenance, reindex) go through
/// [`apply_batch`](KvStore::apply_batch) so that a failure never leaves a
/// partial write visible.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError>;

    fn remove(&self, key: &[u8]) -> Result<(), StorageError>;

    /// Every entry whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    fn apply_batch(&self, batch: WriteBatch) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Persistent store backed by sled
pub struct SledStore {
    db: Db,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens (or creates) the database directory at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A throwaway instance deleted on drop, used by tests.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|value| value.to_vec()))
    }

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.db
            .scan_prefix(prefix)
            .map(|entry| {
                let (key, value) = entry?;
                Ok((key.to_vec(), value.to_vec()))
            })
            .collect()
    }

    fn apply_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                BatchOp::Insert(key, value) => sled_batch.insert(key, value),
                BatchOp::Remove(key) => sled_batch.remove(key),
            }
        }
        self.db.apply_batch(sled_batch)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory store used by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.lock().unwrap().insert(key.to_vec(), value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn apply_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap();
        for op in batch.ops {
            match op {
                BatchOp::Insert(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Remove(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();

        store.insert(b"key", b"value".to_vec()).unwrap();
        assert_eq!(store.get(b"key").unwrap(), Some(b"value".to_vec()));

        store.remove(b"key").unwrap();
        assert_eq!(store.get(b"key").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_is_ordered() {
        let store = MemoryStore::new();

        store.insert(b"utxo-bb", b"2".to_vec()).unwrap();
        store.insert(b"utxo-aa", b"1".to_vec()).unwrap();
        store.insert(b"other", b"x".to_vec()).unwrap();

        let entries = store.scan_prefix(b"utxo-").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"utxo-aa".to_vec());
        assert_eq!(entries[1].0, b"utxo-bb".to_vec());
    }

    #[test]
    fn test_apply_batch() {
        let store = MemoryStore::new();
        store.insert(b"stale", b"x".to_vec()).unwrap();

        let mut batch = WriteBatch::new();
        batch.insert(b"fresh".to_vec(), b"y".to_vec());
        batch.remove(b"stale".to_vec());
        store.apply_batch(batch).unwrap();

        assert_eq!(store.get(b"stale").unwrap(), None);
        assert_eq!(store.get(b"fresh").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn test_sled_store_scan_prefix() {
        let store = SledStore::temporary().unwrap();

        store.insert(b"utxo-01", b"1".to_vec()).unwrap();
        store.insert(b"utxo-02", b"2".to_vec()).unwrap();
        store.insert(b"lh", b"tip".to_vec()).unwrap();

        let entries = store.scan_prefix(b"utxo-").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"utxo-01".to_vec());
    }
}
