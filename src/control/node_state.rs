//! On-disk record of an activated peer.
//!
//! Written once activation has assigned the peer its role and VPN address so a
//! restarted process can rejoin the VPN with the same identity.

use crate::core::error::{CoordinatorError, CoordinatorResult};
use crate::peer::Role;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub role: Role,
    pub vpn_ip: String,
    #[serde(with = "hex_bytes")]
    pub vpn_private_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub owner_id: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub cluster_id: Vec<u8>,
}

impl NodeState {
    pub fn from_file(path: &Path) -> CoordinatorResult<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Write the state to `path`, creating parent directories.
    pub fn to_file(&self, path: &Path) -> CoordinatorResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, raw).map_err(|e| {
            CoordinatorError::internal(format!("writing node state to {}: {}", path.display(), e))
        })
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}
