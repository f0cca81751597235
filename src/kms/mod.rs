//! Key management.
//!
//! The core only ever asks for data encryption keys (DEKs) by ID. Where the
//! keys come from is decided once, at activation, by two URIs:
//!
//! - a KMS URI (`kms://<provider>?...`) selecting the key encryption key
//!   (KEK) backend
//! - a storage URI (`storage://<provider>?...`) selecting where wrapped DEKs
//!   are persisted, with `storage://no-store` meaning nowhere
//!
//! [`cluster::ClusterKms`] derives DEKs from the master secret with
//! HKDF-SHA256. [`remote::RemoteKms`] wraps random DEKs with an external KEK.

pub mod cluster;
pub mod remote;
pub mod uri;

use crate::core::error::{CoordinatorError, CoordinatorResult};
use async_trait::async_trait;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

pub use remote::RemoteKmsProvider;
pub use uri::{KmsUri, StorageUri};

/// A key management service handing out data keys.
#[async_trait]
pub trait CloudKms: Send + Sync {
    /// Import or create the key encryption key `kek_id`.
    async fn create_kek(&self, kek_id: &str, kek: &[u8]) -> CoordinatorResult<()>;

    /// Data key `dek_id` of `length` bytes, protected by `kek_id`.
    async fn get_dek(&self, kek_id: &str, dek_id: &str, length: usize) -> CoordinatorResult<Vec<u8>>;
}

/// Builds a [`CloudKms`] from URIs.
#[async_trait]
pub trait KmsProvider: Send + Sync {
    async fn setup(&self, storage_uri: &str, kms_uri: &str) -> CoordinatorResult<Arc<dyn CloudKms>>;
}

/// Default provider dispatching on the URI schemes.
#[derive(Debug, Default, Clone, Copy)]
pub struct UriKmsProvider;

#[async_trait]
impl KmsProvider for UriKmsProvider {
    async fn setup(&self, storage_uri: &str, kms_uri: &str) -> CoordinatorResult<Arc<dyn CloudKms>> {
        setup(storage_uri, kms_uri)
    }
}

/// Create a KMS from a storage URI and a KMS URI.
pub fn setup(storage_uri: &str, kms_uri: &str) -> CoordinatorResult<Arc<dyn CloudKms>> {
    let storage = StorageUri::parse(storage_uri)?;
    let kms = KmsUri::parse(kms_uri)?;

    match (kms, storage) {
        (KmsUri::Cluster { key, salt }, _) => {
            let kms = cluster::ClusterKms::new(salt);
            if let Some(key) = key {
                kms.set_master_key(key);
            }
            tracing::info!("using cluster KMS");
            Ok(Arc::new(kms))
        }
        (other, _) => Err(CoordinatorError::kms(format!(
            "KMS backend {} is not supported in this build",
            other.provider()
        ))),
    }
}

/// KMS configuration persisted so additional coordinators can reattach it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KmsInfo {
    #[serde(rename = "KMSURI")]
    pub kms_uri: String,
    #[serde(rename = "StorageURI")]
    pub storage_uri: String,
    #[serde(rename = "KeyEncryptionKeyID")]
    pub key_encryption_key_id: String,
}

/// Largest data key HKDF-SHA256 can expand to.
pub const MAX_DEK_LENGTH: usize = 255 * 32;

/// Reject key lengths outside `1..=MAX_DEK_LENGTH` before anything is allocated.
pub fn check_dek_length(length: usize) -> CoordinatorResult<()> {
    if length == 0 || length > MAX_DEK_LENGTH {
        return Err(CoordinatorError::invalid_argument(format!(
            "data key length must be between 1 and {} bytes, got {}",
            MAX_DEK_LENGTH, length
        )));
    }
    Ok(())
}

/// HKDF-SHA256 of `secret`.
///
/// Deterministic for fixed inputs; `info` is compared byte-wise, so key IDs
/// are case-sensitive.
pub fn derive_key(secret: &[u8], salt: &[u8], info: &[u8], length: usize) -> CoordinatorResult<Vec<u8>> {
    check_dek_length(length)?;
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|e| CoordinatorError::kms(format!("hkdf expand failed for {} bytes: {:?}", length, e)))?;
    Ok(okm)
}
