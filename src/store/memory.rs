//! In-memory store.
//!
//! Entries live in a `BTreeMap` behind a data mutex; a second, async mutex
//! serializes transactions. A transaction owns that second lock from
//! `begin_transaction` until commit, rollback or drop.

use super::{KeyIterator, KeyValueAccess, Store, StoreError, StoreResult, Transaction};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

struct Shared {
    namespace: String,
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Shared {
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.data
            .lock()
            .get(&self.full_key(key))
            .cloned()
            .ok_or_else(|| StoreError::ValueUnset {
                key: key.to_string(),
            })
    }

    /// Keys under `prefix` with the namespace stripped.
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let full_prefix = self.full_key(prefix);
        let data = self.data.lock();
        data.range(full_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&full_prefix))
            .map(|(k, _)| k[self.namespace.len()..].to_string())
            .collect()
    }

    fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
        let data = self.data.lock();
        data.iter()
            .filter(|(k, _)| k.starts_with(&self.namespace))
            .map(|(k, v)| (k[self.namespace.len()..].to_string(), v.clone()))
            .collect()
    }
}

/// Process-local [`Store`].
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("namespace", &self.shared.namespace)
            .field("entries", &self.len())
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store using the default namespace.
    pub fn new() -> Self {
        Self::with_namespace(super::DEFAULT_NAMESPACE)
    }

    /// Create an empty store prefixing keys with `namespace`.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                namespace: namespace.into(),
                data: Mutex::new(BTreeMap::new()),
                tx_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// Number of stored entries, across all namespaces.
    pub fn len(&self) -> usize {
        self.shared.data.lock().len()
    }

    /// Check whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw backend keys including the namespace.
    pub fn raw_keys(&self) -> Vec<String> {
        self.shared.data.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl KeyValueAccess for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.shared.get(key)
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let full_key = self.shared.full_key(key);
        self.shared.data.lock().insert(full_key, value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let full_key = self.shared.full_key(key);
        self.shared.data.lock().remove(&full_key);
        Ok(())
    }

    async fn iterator(&self, prefix: &str) -> StoreResult<KeyIterator> {
        Ok(KeyIterator::new(self.shared.keys_with_prefix(prefix)))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin_transaction(&self) -> StoreResult<Box<dyn Transaction>> {
        let guard = Arc::clone(&self.shared.tx_lock).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            inner: Mutex::new(TxInner {
                status: TxStatus::Open,
                inserts: HashMap::new(),
                deletes: HashSet::new(),
                guard: Some(guard),
            }),
        }))
    }

    async fn transfer(&self, target: &dyn Store) -> StoreResult<()> {
        let _serialized = self.shared.tx_lock.lock().await;
        let entries = self.shared.snapshot();

        let tx = target.begin_transaction().await?;
        for (key, value) in &entries {
            if let Err(e) = tx.put(key, value).await {
                tx.rollback().await;
                return Err(e);
            }
        }
        tx.commit().await?;

        tracing::debug!(entries = entries.len(), "transferred in-memory store");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Open,
    Committed,
    RolledBack,
}

struct TxInner {
    status: TxStatus,
    inserts: HashMap<String, Vec<u8>>,
    deletes: HashSet<String>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl TxInner {
    fn ensure_open(&self) -> StoreResult<()> {
        match self.status {
            TxStatus::Open => Ok(()),
            TxStatus::Committed => Err(StoreError::TransactionAlreadyCommitted),
            TxStatus::RolledBack => Err(StoreError::TransactionClosed),
        }
    }
}

/// Transaction on a [`MemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    inner: Mutex<TxInner>,
}

#[async_trait]
impl KeyValueAccess for MemoryTransaction {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        if let Some(value) = inner.inserts.get(key) {
            return Ok(value.clone());
        }
        if inner.deletes.contains(key) {
            return Err(StoreError::ValueUnset {
                key: key.to_string(),
            });
        }
        self.shared.get(key)
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.deletes.remove(key);
        inner.inserts.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.inserts.remove(key);
        inner.deletes.insert(key.to_string());
        Ok(())
    }

    async fn iterator(&self, prefix: &str) -> StoreResult<KeyIterator> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        let mut keys: Vec<String> = self
            .shared
            .keys_with_prefix(prefix)
            .into_iter()
            .filter(|k| !inner.deletes.contains(k))
            .collect();
        keys.extend(
            inner
                .inserts
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned(),
        );
        Ok(KeyIterator::new(keys))
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        {
            let mut data = self.shared.data.lock();
            for key in inner.deletes.drain() {
                data.remove(&self.shared.full_key(&key));
            }
            for (key, value) in inner.inserts.drain() {
                data.insert(self.shared.full_key(&key), value);
            }
        }
        inner.status = TxStatus::Committed;
        inner.guard.take();
        Ok(())
    }

    async fn rollback(&self) {
        let mut inner = self.inner.lock();
        if inner.status != TxStatus::Open {
            return;
        }
        inner.inserts.clear();
        inner.deletes.clear();
        inner.status = TxStatus::RolledBack;
        inner.guard.take();
    }
}
