//! Key/value store abstraction.
//!
//! The control plane keeps all shared state in a string-keyed byte store with
//! prefix iteration and serializable transactions. Two implementations exist:
//!
//! - [`memory::MemoryStore`] - process-local store used until the cluster's
//!   replicated store is reachable
//! - [`etcd::EtcdStore`] - replicated store backed by an etcd v3 endpoint
//!   (feature `grpc`)
//!
//! Both prefix every key with a fixed namespace so unrelated datasets can share
//! a backend. [`wrapper::StoreWrapper`] layers typed accessors on top.

pub mod memory;
pub mod wrapper;

#[cfg(feature = "grpc")]
pub mod etcd;

use async_trait::async_trait;
use std::collections::VecDeque;
use thiserror::Error;

/// Namespace prepended to every stored key.
pub const DEFAULT_NAMESPACE: &str = "constellationRegion";

/// Store error conditions.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Requested key holds no value.
    #[error("requested value not set: {key}")]
    ValueUnset { key: String },

    /// Operation on a transaction that was already committed.
    #[error("transaction has already been committed")]
    TransactionAlreadyCommitted,

    /// Operation on a transaction that was rolled back.
    #[error("transaction has been rolled back")]
    TransactionClosed,

    /// Iterator advanced past its last key.
    #[error("iterator exhausted after {returned} keys")]
    IteratorExhausted { returned: usize },

    /// Stored bytes could not be interpreted.
    #[error("corrupted value at {key}: {reason}")]
    Corrupted { key: String, reason: String },

    /// Backend failure.
    #[error("store backend: {message}")]
    Backend { message: String },
}

impl StoreError {
    /// Create a Backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Result type using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

/// Read/write access shared by stores and transactions.
#[async_trait]
pub trait KeyValueAccess: Send + Sync {
    /// Get the value stored under `key`.
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Store a copy of `value` under `key`.
    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Delete `key`. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Snapshot of all keys beginning with `prefix`.
    async fn iterator(&self, prefix: &str) -> StoreResult<KeyIterator>;
}

/// A key/value store with transactions.
#[async_trait]
pub trait Store: KeyValueAccess {
    /// Begin a transaction, waiting until any in-flight transaction finishes.
    async fn begin_transaction(&self) -> StoreResult<Box<dyn Transaction>>;

    /// Copy every entry into `target` inside a single target transaction.
    ///
    /// Holds this store's transaction lock for the duration, so the copy
    /// reflects exactly one committed state.
    async fn transfer(&self, target: &dyn Store) -> StoreResult<()>;
}

/// A serializable transaction.
///
/// Reads observe the transaction's own writes; nothing is visible outside
/// until [`Transaction::commit`]. Dropping an open transaction rolls it back.
#[async_trait]
pub trait Transaction: KeyValueAccess {
    /// Atomically publish all writes.
    async fn commit(&self) -> StoreResult<()>;

    /// Discard all writes. Idempotent; no-op after commit.
    async fn rollback(&self);
}

/// Creates the replicated store the Core switches to after bootstrap.
#[async_trait]
pub trait PersistentStoreFactory: Send + Sync {
    async fn create(&self) -> StoreResult<Box<dyn Store>>;
}

/// Iterator over a snapshot of keys.
#[derive(Debug, Default, Clone)]
pub struct KeyIterator {
    keys: VecDeque<String>,
    returned: usize,
}

impl KeyIterator {
    /// Create an iterator over `keys`, sorted for stable output.
    pub fn new(mut keys: Vec<String>) -> Self {
        keys.sort();
        keys.dedup();
        Self {
            keys: keys.into(),
            returned: 0,
        }
    }

    /// Check whether another key is available.
    pub fn has_next(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Return the next key.
    pub fn get_next(&mut self) -> StoreResult<String> {
        match self.keys.pop_front() {
            Some(key) => {
                self.returned += 1;
                Ok(key)
            }
            None => Err(StoreError::IteratorExhausted {
                returned: self.returned,
            }),
        }
    }

    /// Number of keys not yet returned.
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }
}

impl Iterator for KeyIterator {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next().ok()
    }
}

/// Upper bound of the key range that shares `prefix`.
///
/// Used by backends that express prefix scans as `[prefix, range_end)`.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All bytes were 0xff: scan to the end of the keyspace.
    vec![0]
}
