//! KMS deriving every data key from the cluster master secret.

use super::{derive_key, CloudKms};
use crate::core::error::{CoordinatorError, CoordinatorResult};
use async_trait::async_trait;
use parking_lot::RwLock;

/// HKDF-backed KMS. The key encryption key *is* the master secret; DEKs are
/// `HKDF(master, salt, dek_id)`.
pub struct ClusterKms {
    salt: Vec<u8>,
    master_key: RwLock<Option<Vec<u8>>>,
}

impl ClusterKms {
    pub fn new(salt: Vec<u8>) -> Self {
        Self {
            salt,
            master_key: RwLock::new(None),
        }
    }

    pub fn set_master_key(&self, key: Vec<u8>) {
        *self.master_key.write() = Some(key);
    }

    pub fn has_master_key(&self) -> bool {
        self.master_key.read().is_some()
    }
}

impl std::fmt::Debug for ClusterKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterKms")
            .field("salt_len", &self.salt.len())
            .field("master_key_set", &self.has_master_key())
            .finish()
    }
}

#[async_trait]
impl CloudKms for ClusterKms {
    async fn create_kek(&self, _kek_id: &str, kek: &[u8]) -> CoordinatorResult<()> {
        if kek.is_empty() {
            return Err(CoordinatorError::kms("empty master key"));
        }
        self.set_master_key(kek.to_vec());
        Ok(())
    }

    async fn get_dek(&self, _kek_id: &str, dek_id: &str, length: usize) -> CoordinatorResult<Vec<u8>> {
        let guard = self.master_key.read();
        let master = guard
            .as_deref()
            .ok_or_else(|| CoordinatorError::kms("master key not set for cluster KMS"))?;
        derive_key(master, &self.salt, dek_id.as_bytes(), length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_dek_requires_master_key() {
        let kms = ClusterKms::new(b"salt".to_vec());
        assert!(kms.get_dek("kek", "disk", 32).await.is_err());
    }

    #[tokio::test]
    async fn test_get_dek_matches_derive_key() {
        let kms = ClusterKms::new(b"salt".to_vec());
        kms.create_kek("kek", b"master").await.unwrap();
        let dek = kms.get_dek("kek", "disk-uuid", 32).await.unwrap();
        assert_eq!(dek, derive_key(b"master", b"salt", b"disk-uuid", 32).unwrap());
    }

    #[tokio::test]
    async fn test_same_secret_same_keys() {
        let a = ClusterKms::new(Vec::new());
        let b = ClusterKms::new(Vec::new());
        a.create_kek("kek", b"shared").await.unwrap();
        b.set_master_key(b"shared".to_vec());
        assert_eq!(
            a.get_dek("kek", "volume", 16).await.unwrap(),
            b.get_dek("other-kek", "volume", 16).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_rejects_empty_master() {
        let kms = ClusterKms::new(Vec::new());
        assert!(kms.create_kek("kek", b"").await.is_err());
        assert!(!kms.has_master_key());
    }
}
