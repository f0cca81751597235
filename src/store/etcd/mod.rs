//! Replicated [`Store`] on an etcd v3 endpoint.
//!
//! Transactions are serialized cluster-wide by an etcd lock held under a
//! per-transaction lease. Writes are buffered locally and applied as one
//! etcd Txn on commit; rollback just releases the lock.

pub mod client;
pub mod proto;

use self::client::EtcdClient;
use self::proto::RequestOp;
use super::{
    prefix_range_end, KeyIterator, KeyValueAccess, PersistentStoreFactory, Store, StoreError,
    StoreResult, Transaction,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub use self::client::{EtcdOptions, EtcdTls};

/// Lock names live under this prefix, outside every namespace's data range.
const LOCK_PREFIX: &str = "lock/";

fn lock_name(namespace: &str) -> Vec<u8> {
    format!("{}{}", LOCK_PREFIX, namespace).into_bytes()
}

/// `[start, end)` of the data keys under `prefix` in `namespace`.
fn data_range(namespace: &str, prefix: &str) -> (Vec<u8>, Vec<u8>) {
    let start = format!("{}{}", namespace, prefix).into_bytes();
    let end = prefix_range_end(&start);
    (start, end)
}

#[derive(Debug)]
struct Shared {
    client: EtcdClient,
    namespace: String,
    lease_ttl: i64,
}

impl Shared {
    fn full_key(&self, key: &str) -> Vec<u8> {
        format!("{}{}", self.namespace, key).into_bytes()
    }

    fn strip(&self, raw: &[u8]) -> String {
        let key = String::from_utf8_lossy(raw);
        key.strip_prefix(self.namespace.as_str())
            .unwrap_or(&key)
            .to_string()
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let resp = self.client.range(self.full_key(key), Vec::new(), false).await?;
        let mut kvs = resp.kvs;
        match kvs.len() {
            0 => Err(StoreError::ValueUnset {
                key: key.to_string(),
            }),
            1 => Ok(kvs.remove(0).value),
            n => Err(StoreError::Corrupted {
                key: key.to_string(),
                reason: format!("got {} entries for a single key", n),
            }),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let (start, end) = data_range(&self.namespace, prefix);
        let resp = self.client.range(start, end, true).await?;
        Ok(resp.kvs.iter().map(|kv| self.strip(&kv.key)).collect())
    }

    async fn entries(&self) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let (start, end) = data_range(&self.namespace, "");
        let resp = self.client.range(start, end, false).await?;
        Ok(resp
            .kvs
            .into_iter()
            .map(|kv| (self.strip(&kv.key), kv.value))
            .collect())
    }

    /// Grant a lease and take the namespace lock under it.
    async fn acquire(&self) -> StoreResult<Held> {
        let lease = self.client.lease_grant(self.lease_ttl).await?;
        match self.client.lock(&lock_name(&self.namespace), lease).await {
            Ok(key) => Ok(Held { lease, key }),
            Err(e) => {
                if let Err(revoke) = self.client.lease_revoke(lease).await {
                    tracing::warn!(lease, error = %revoke, "revoking lease after failed lock");
                }
                Err(e)
            }
        }
    }

    async fn release(&self, held: Held) {
        if let Err(e) = self.client.unlock(held.key).await {
            tracing::warn!(lease = held.lease, error = %e, "etcd unlock failed");
        }
        // Revoking also drops the lock if unlock did not reach the server.
        if let Err(e) = self.client.lease_revoke(held.lease).await {
            tracing::warn!(lease = held.lease, error = %e, "etcd lease revoke failed");
        }
    }
}

/// Lock ownership of an open transaction.
#[derive(Debug)]
struct Held {
    lease: i64,
    key: Vec<u8>,
}

/// [`Store`] backed by etcd.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    shared: Arc<Shared>,
}

impl EtcdStore {
    /// Connect using the default namespace.
    pub async fn connect(options: &EtcdOptions) -> StoreResult<Self> {
        Self::connect_with_namespace(options, super::DEFAULT_NAMESPACE).await
    }

    pub async fn connect_with_namespace(options: &EtcdOptions, namespace: impl Into<String>) -> StoreResult<Self> {
        let client = EtcdClient::connect(options).await?;
        Ok(Self {
            shared: Arc::new(Shared {
                client,
                namespace: namespace.into(),
                lease_ttl: options.lease_ttl,
            }),
        })
    }
}

#[async_trait]
impl KeyValueAccess for EtcdStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.shared.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.shared
            .client
            .put(self.shared.full_key(key), value.to_vec())
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.shared.client.delete(self.shared.full_key(key)).await?;
        Ok(())
    }

    async fn iterator(&self, prefix: &str) -> StoreResult<KeyIterator> {
        Ok(KeyIterator::new(self.shared.keys_with_prefix(prefix).await?))
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn begin_transaction(&self) -> StoreResult<Box<dyn Transaction>> {
        let held = self.shared.acquire().await?;
        Ok(Box::new(EtcdTransaction {
            shared: Arc::clone(&self.shared),
            inner: Mutex::new(TxInner {
                status: TxStatus::Open,
                writes: PendingWrites::default(),
                held: Some(held),
            }),
        }))
    }

    async fn transfer(&self, target: &dyn Store) -> StoreResult<()> {
        let held = self.shared.acquire().await?;
        let result: StoreResult<usize> = async {
            let entries = self.shared.entries().await?;
            let tx = target.begin_transaction().await?;
            for (key, value) in &entries {
                if let Err(e) = tx.put(key, value).await {
                    tx.rollback().await;
                    return Err(e);
                }
            }
            tx.commit().await?;
            Ok(entries.len())
        }
        .await;
        self.shared.release(held).await;

        let copied = result?;
        tracing::debug!(entries = copied, "transferred etcd store");
        Ok(())
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Writes buffered by an open transaction.
#[derive(Debug, Default)]
struct PendingWrites {
    inserts: BTreeMap<String, Vec<u8>>,
    deletes: BTreeSet<String>,
}

impl PendingWrites {
    fn put(&mut self, key: &str, value: &[u8]) {
        self.deletes.remove(key);
        self.inserts.insert(key.to_string(), value.to_vec());
    }

    fn delete(&mut self, key: &str) {
        self.inserts.remove(key);
        self.deletes.insert(key.to_string());
    }

    /// `Some(Some(v))` if written, `Some(None)` if deleted, `None` if untouched.
    fn lookup(&self, key: &str) -> Option<Option<Vec<u8>>> {
        if let Some(value) = self.inserts.get(key) {
            return Some(Some(value.clone()));
        }
        if self.deletes.contains(key) {
            return Some(None);
        }
        None
    }

    /// Overlay pending writes on `committed` keys under `prefix`.
    fn overlay(&self, committed: Vec<String>, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = committed
            .into_iter()
            .filter(|k| !self.deletes.contains(k))
            .collect();
        keys.extend(self.inserts.keys().filter(|k| k.starts_with(prefix)).cloned());
        keys
    }

    /// One etcd op per key; a key never appears twice.
    fn ops(&self, full_key: impl Fn(&str) -> Vec<u8>) -> Vec<RequestOp> {
        let mut ops = Vec::with_capacity(self.inserts.len() + self.deletes.len());
        for (key, value) in &self.inserts {
            ops.push(RequestOp::put(full_key(key), value.clone()));
        }
        for key in &self.deletes {
            ops.push(RequestOp::delete(full_key(key)));
        }
        ops
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
    writes: PendingWrites,
    held: Option<Held>,
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

/// Transaction on an [`EtcdStore`].
pub struct EtcdTransaction {
    shared: Arc<Shared>,
    inner: Mutex<TxInner>,
}

#[async_trait]
impl KeyValueAccess for EtcdTransaction {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let pending = {
            let inner = self.inner.lock();
            inner.ensure_open()?;
            inner.writes.lookup(key)
        };
        match pending {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(StoreError::ValueUnset {
                key: key.to_string(),
            }),
            None => self.shared.get(key).await,
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.writes.put(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.writes.delete(key);
        Ok(())
    }

    async fn iterator(&self, prefix: &str) -> StoreResult<KeyIterator> {
        self.inner.lock().ensure_open()?;
        let committed = self.shared.keys_with_prefix(prefix).await?;
        let inner = self.inner.lock();
        inner.ensure_open()?;
        Ok(KeyIterator::new(inner.writes.overlay(committed, prefix)))
    }
}

#[async_trait]
impl Transaction for EtcdTransaction {
    async fn commit(&self) -> StoreResult<()> {
        let ops = {
            let inner = self.inner.lock();
            inner.ensure_open()?;
            inner.writes.ops(|k| self.shared.full_key(k))
        };
        if !ops.is_empty() {
            // On failure the writes and the lock stay with the open
            // transaction until a retried commit, rollback or drop.
            self.shared.client.txn(ops).await?;
        }

        let held = {
            let mut inner = self.inner.lock();
            inner.status = TxStatus::Committed;
            inner.writes = PendingWrites::default();
            inner.held.take()
        };
        if let Some(held) = held {
            self.shared.release(held).await;
        }
        Ok(())
    }

    async fn rollback(&self) {
        let held = {
            let mut inner = self.inner.lock();
            if inner.status == TxStatus::Open {
                inner.status = TxStatus::RolledBack;
            }
            inner.writes = PendingWrites::default();
            inner.held.take()
        };
        if let Some(held) = held {
            self.shared.release(held).await;
        }
    }
}

impl Drop for EtcdTransaction {
    fn drop(&mut self) {
        let Some(held) = self.inner.get_mut().held.take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { shared.release(held).await });
            }
            Err(_) => tracing::warn!(
                lease = held.lease,
                "etcd transaction dropped outside a runtime; lock expires with its lease"
            ),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Connects a fresh [`EtcdStore`] on demand.
#[derive(Debug, Clone)]
pub struct EtcdStoreFactory {
    options: EtcdOptions,
    namespace: String,
}

impl EtcdStoreFactory {
    pub fn new(options: EtcdOptions) -> Self {
        Self {
            options,
            namespace: super::DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

#[async_trait]
impl PersistentStoreFactory for EtcdStoreFactory {
    async fn create(&self) -> StoreResult<Box<dyn Store>> {
        let store = EtcdStore::connect_with_namespace(&self.options, self.namespace.clone()).await?;
        Ok(Box::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::proto::request_op::Request;
    use super::*;

    #[test]
    fn test_pending_writes_delete_after_put() {
        let mut writes = PendingWrites::default();
        writes.put("a", b"1");
        writes.delete("a");
        assert_eq!(writes.lookup("a"), Some(None));
        writes.put("a", b"2");
        assert_eq!(writes.lookup("a"), Some(Some(b"2".to_vec())));
        assert_eq!(writes.lookup("b"), None);
    }

    #[test]
    fn test_pending_writes_overlay() {
        let mut writes = PendingWrites::default();
        writes.put("PeerPrefix10.118.0.12", b"p");
        writes.put("other", b"x");
        writes.delete("PeerPrefix10.118.0.11");

        let keys = writes.overlay(
            vec!["PeerPrefix10.118.0.11".into(), "PeerPrefix10.118.0.1".into()],
            "PeerPrefix",
        );
        let keys: Vec<String> = KeyIterator::new(keys).collect();
        assert_eq!(keys, vec!["PeerPrefix10.118.0.1", "PeerPrefix10.118.0.12"]);
    }

    #[test]
    fn test_ops_one_op_per_key() {
        let mut writes = PendingWrites::default();
        writes.put("a", b"1");
        writes.delete("a");
        writes.put("b", b"2");
        writes.delete("c");

        let ops = writes.ops(|k| format!("ns{}", k).into_bytes());
        assert_eq!(ops.len(), 3);
        let mut puts = 0;
        let mut deletes = Vec::new();
        for op in ops {
            match op.request {
                Some(Request::RequestPut(put)) => {
                    assert_eq!(put.key, b"nsb".to_vec());
                    puts += 1;
                }
                Some(Request::RequestDeleteRange(del)) => deletes.push(del.key),
                other => panic!("unexpected op {:?}", other),
            }
        }
        assert_eq!(puts, 1);
        assert_eq!(deletes, vec![b"nsa".to_vec(), b"nsc".to_vec()]);
    }

    #[test]
    fn test_lock_keys_fall_outside_the_data_range() {
        let namespace = crate::store::DEFAULT_NAMESPACE;
        let (start, end) = data_range(namespace, "");
        let in_range = |key: &[u8]| key >= start.as_slice() && key < end.as_slice();

        // etcd names lock ownership keys `<name>/<lease id in hex>`
        let mut lock_key = lock_name(namespace);
        lock_key.extend_from_slice(b"/694d8a7b3c2e1f00");
        assert!(!in_range(&lock_key));

        assert!(in_range(format!("{}peerPrefix10.118.0.11", namespace).as_bytes()));
        assert!(in_range(format!("{}/694d8a7b3c2e1f00", namespace).as_bytes()));
    }

    async fn unreachable_transaction() -> EtcdTransaction {
        let options = EtcdOptions {
            endpoint: "127.0.0.1:1".to_string(),
            dial_timeout: std::time::Duration::from_millis(200),
            retry_attempts: 1,
            ..Default::default()
        };
        let client = EtcdClient::connect_lazy(&options).await.unwrap();
        EtcdTransaction {
            shared: Arc::new(Shared {
                client,
                namespace: crate::store::DEFAULT_NAMESPACE.to_string(),
                lease_ttl: options.lease_ttl,
            }),
            inner: Mutex::new(TxInner {
                status: TxStatus::Open,
                writes: PendingWrites::default(),
                held: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_pending_writes() {
        let tx = unreachable_transaction().await;
        tx.put("k", b"v").await.unwrap();

        assert!(tx.commit().await.is_err());
        assert_eq!(tx.get("k").await.unwrap(), b"v".to_vec());

        // a retry still carries the write instead of committing nothing
        assert!(tx.commit().await.is_err());
        assert_eq!(tx.inner.lock().status, TxStatus::Open);

        tx.rollback().await;
        assert!(matches!(tx.get("k").await, Err(StoreError::TransactionClosed)));
    }
}
