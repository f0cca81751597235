//! KMS wrapping random data keys with an external key encryption key.
//!
//! The KEK never leaves the backend. A DEK is generated once, wrapped, and
//! persisted through a [`DekStorage`]; later lookups unwrap the stored copy.

use super::{check_dek_length, CloudKms, KmsProvider, KmsUri, StorageUri};
use crate::core::error::{CoordinatorError, CoordinatorResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

/// Operations a cloud key service provides.
#[async_trait]
pub trait KekBackend: Send + Sync {
    /// Create the KEK, or import `material` when non-empty.
    async fn create_kek(&self, kek_id: &str, material: &[u8]) -> CoordinatorResult<()>;
    async fn wrap(&self, kek_id: &str, plaintext: &[u8]) -> CoordinatorResult<Vec<u8>>;
    async fn unwrap(&self, kek_id: &str, wrapped: &[u8]) -> CoordinatorResult<Vec<u8>>;
}

/// Persistence for wrapped DEKs.
#[async_trait]
pub trait DekStorage: Send + Sync {
    async fn get(&self, dek_id: &str) -> CoordinatorResult<Option<Vec<u8>>>;
    async fn put(&self, dek_id: &str, wrapped: &[u8]) -> CoordinatorResult<()>;
}

#[async_trait]
impl<T: KekBackend + ?Sized> KekBackend for Arc<T> {
    async fn create_kek(&self, kek_id: &str, material: &[u8]) -> CoordinatorResult<()> {
        (**self).create_kek(kek_id, material).await
    }

    async fn wrap(&self, kek_id: &str, plaintext: &[u8]) -> CoordinatorResult<Vec<u8>> {
        (**self).wrap(kek_id, plaintext).await
    }

    async fn unwrap(&self, kek_id: &str, wrapped: &[u8]) -> CoordinatorResult<Vec<u8>> {
        (**self).unwrap(kek_id, wrapped).await
    }
}

#[async_trait]
impl<T: DekStorage + ?Sized> DekStorage for Arc<T> {
    async fn get(&self, dek_id: &str) -> CoordinatorResult<Option<Vec<u8>>> {
        (**self).get(dek_id).await
    }

    async fn put(&self, dek_id: &str, wrapped: &[u8]) -> CoordinatorResult<()> {
        (**self).put(dek_id, wrapped).await
    }
}

/// Storage that keeps nothing; every lookup is a miss.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStore;

#[async_trait]
impl DekStorage for NoStore {
    async fn get(&self, _dek_id: &str) -> CoordinatorResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn put(&self, _dek_id: &str, _wrapped: &[u8]) -> CoordinatorResult<()> {
        Ok(())
    }
}

/// Process-local storage.
#[derive(Debug, Default)]
pub struct MemoryDekStorage {
    keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDekStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DekStorage for MemoryDekStorage {
    async fn get(&self, dek_id: &str) -> CoordinatorResult<Option<Vec<u8>>> {
        Ok(self.keys.lock().get(dek_id).cloned())
    }

    async fn put(&self, dek_id: &str, wrapped: &[u8]) -> CoordinatorResult<()> {
        self.keys.lock().insert(dek_id.to_string(), wrapped.to_vec());
        Ok(())
    }
}

pub struct RemoteKms<B, D> {
    backend: B,
    storage: D,
}

impl<B: KekBackend, D: DekStorage> RemoteKms<B, D> {
    pub fn new(backend: B, storage: D) -> Self {
        Self { backend, storage }
    }
}

#[async_trait]
impl<B: KekBackend, D: DekStorage> CloudKms for RemoteKms<B, D> {
    async fn create_kek(&self, kek_id: &str, kek: &[u8]) -> CoordinatorResult<()> {
        self.backend.create_kek(kek_id, kek).await
    }

    async fn get_dek(&self, kek_id: &str, dek_id: &str, length: usize) -> CoordinatorResult<Vec<u8>> {
        check_dek_length(length)?;
        if let Some(wrapped) = self.storage.get(dek_id).await? {
            let dek = self.backend.unwrap(kek_id, &wrapped).await?;
            if dek.len() != length {
                return Err(CoordinatorError::kms(format!(
                    "stored key {} has length {}, requested {}",
                    dek_id,
                    dek.len(),
                    length
                )));
            }
            return Ok(dek);
        }

        let mut dek = vec![0u8; length];
        rand::thread_rng().fill_bytes(&mut dek);
        let wrapped = self.backend.wrap(kek_id, &dek).await?;
        self.storage.put(dek_id, &wrapped).await?;
        tracing::debug!(dek_id, "generated new data key");
        Ok(dek)
    }
}

/// [`KmsProvider`] for cloud KMS URIs.
///
/// The KEK backend is injected. Wrapped DEKs go to [`NoStore`] for
/// `storage://no-store` and to the configured blob storage for every other
/// storage URI. Cluster KMS URIs are handled by [`super::setup`].
pub struct RemoteKmsProvider {
    backend: Arc<dyn KekBackend>,
    blob_storage: Option<Arc<dyn DekStorage>>,
}

impl RemoteKmsProvider {
    pub fn new(backend: Arc<dyn KekBackend>) -> Self {
        Self {
            backend,
            blob_storage: None,
        }
    }

    pub fn with_dek_storage(mut self, storage: Arc<dyn DekStorage>) -> Self {
        self.blob_storage = Some(storage);
        self
    }
}

#[async_trait]
impl KmsProvider for RemoteKmsProvider {
    async fn setup(&self, storage_uri: &str, kms_uri: &str) -> CoordinatorResult<Arc<dyn CloudKms>> {
        let kms = KmsUri::parse(kms_uri)?;
        if matches!(kms, KmsUri::Cluster { .. }) {
            return super::setup(storage_uri, kms_uri);
        }

        let storage = StorageUri::parse(storage_uri)?;
        let dek_storage: Arc<dyn DekStorage> = match &storage {
            StorageUri::NoStore => Arc::new(NoStore),
            other => self.blob_storage.clone().ok_or_else(|| {
                CoordinatorError::kms(format!("no DEK storage configured for {}", other.provider()))
            })?,
        };
        tracing::info!(
            kms = kms.provider(),
            storage = storage.provider(),
            "using remote KMS"
        );
        Ok(Arc::new(RemoteKms::new(self.backend.clone(), dek_storage)))
    }
}
