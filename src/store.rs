//! # Persistent Store
//!
//! Byte-keyed storage shared by the routing table (bucket records and the
//! node-list backup) and the KV protocols. Two backends:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`MemoryStore`] | tests and ephemeral nodes |
//! | [`SledStore`] | durable deployments |
//!
//! Every call is atomic on its own key. No cross-key transactions are offered.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::RwLock;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Key-value storage consumed by the node.
pub trait Store: Send + Sync + Debug + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Write `value` only if `key` is absent. Returns whether the write happened.
    fn insert_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, StoreError>;

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Build a namespaced key: `prefix` followed by `suffix`.
pub fn prefixed(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn insert_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }
}

// ============================================================================
// Sled backend
// ============================================================================

/// Durable backend on a sled database (internally reference counted).
#[derive(Clone, Debug)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::Config::default()
            .path(path.as_ref())
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Ok(Self { db })
    }

    /// A database removed when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::default().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl Store for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.db
            .scan_prefix(prefix)
            .map(|item| {
                let (k, v) = item?;
                Ok((k.to_vec(), v.to_vec()))
            })
            .collect()
    }

    fn insert_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let swapped = self
            .db
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?;
        Ok(swapped.is_ok())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn Store) {
        assert_eq!(store.get(b"missing").unwrap(), None);

        store.set(b"a:1", b"one").unwrap();
        store.set(b"a:2", b"two").unwrap();
        store.set(b"b:1", b"other").unwrap();
        assert_eq!(store.get(b"a:1").unwrap().as_deref(), Some(&b"one"[..]));

        let scanned = store.scan_prefix(b"a:").unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, b"a:1".to_vec());
        assert_eq!(scanned[1].1, b"two".to_vec());

        store.delete(b"a:1").unwrap();
        assert_eq!(store.get(b"a:1").unwrap(), None);
        store.delete(b"never-existed").unwrap();

        assert!(store.insert_if_absent(b"g:k", b"first").unwrap());
        assert!(!store.insert_if_absent(b"g:k", b"second").unwrap());
        assert_eq!(store.get(b"g:k").unwrap().as_deref(), Some(&b"first"[..]));
        store.flush().unwrap();
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn sled_store_contract() {
        let store = SledStore::temporary().expect("temporary sled");
        exercise(&store);
    }

    #[test]
    fn prefixed_concatenates() {
        assert_eq!(prefixed(b"kv:", b"key"), b"kv:key".to_vec());
    }
}
