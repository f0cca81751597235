//! KMS and storage URI parsing.
//!
//! ```text
//! kms://cluster-kms?key=<b64url>&salt=<b64url>
//! kms://aws?keyPolicy=<policy>&kekID=<b64url>
//! kms://azure-kms?name=<vault>&type=<suffix>&kekID=<b64url>
//! kms://azure-hsm?name=<vault>&kekID=<b64url>
//! kms://gcp?project=..&location=..&keyRing=..&protectionLvl=<int>&kekID=<b64url>
//! storage://aws?bucket=..
//! storage://azure?container=..&connectionString=..
//! storage://gcp?project=..&bucket=..
//! storage://no-store
//! ```

use crate::core::error::{CoordinatorError, CoordinatorResult};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use std::collections::HashMap;
use url::Url;

/// Parsed KMS URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KmsUri {
    Cluster {
        key: Option<Vec<u8>>,
        salt: Vec<u8>,
    },
    Aws {
        key_policy: String,
        kek_id: String,
    },
    AzureKms {
        vault_name: String,
        vault_type: String,
        kek_id: String,
    },
    AzureHsm {
        vault_name: String,
        kek_id: String,
    },
    Gcp {
        project: String,
        location: String,
        key_ring: String,
        protection_level: i32,
        kek_id: String,
    },
}

impl KmsUri {
    pub fn parse(raw: &str) -> CoordinatorResult<Self> {
        let (host, query) = split(raw, "kms")?;
        match host.as_str() {
            "cluster-kms" => Ok(Self::Cluster {
                key: optional_b64(&query, "key")?,
                salt: optional_b64(&query, "salt")?.unwrap_or_default(),
            }),
            "aws" => Ok(Self::Aws {
                key_policy: required(&query, "keyPolicy")?,
                kek_id: required_b64_string(&query, "kekID")?,
            }),
            "azure-kms" => Ok(Self::AzureKms {
                vault_name: required(&query, "name")?,
                vault_type: required(&query, "type")?,
                kek_id: required_b64_string(&query, "kekID")?,
            }),
            "azure-hsm" => Ok(Self::AzureHsm {
                vault_name: required(&query, "name")?,
                kek_id: required_b64_string(&query, "kekID")?,
            }),
            "gcp" => {
                let level = required(&query, "protectionLvl")?;
                Ok(Self::Gcp {
                    project: required(&query, "project")?,
                    location: required(&query, "location")?,
                    key_ring: required(&query, "keyRing")?,
                    protection_level: level.parse().map_err(|_| {
                        CoordinatorError::kms(format!("invalid protectionLvl {:?}", level))
                    })?,
                    kek_id: required_b64_string(&query, "kekID")?,
                })
            }
            other => Err(CoordinatorError::kms(format!("unknown KMS type: {}", other))),
        }
    }

    /// Provider name as it appears in the URI host.
    pub fn provider(&self) -> &'static str {
        match self {
            Self::Cluster { .. } => "cluster-kms",
            Self::Aws { .. } => "aws",
            Self::AzureKms { .. } => "azure-kms",
            Self::AzureHsm { .. } => "azure-hsm",
            Self::Gcp { .. } => "gcp",
        }
    }

    /// Encode a cluster KMS URI carrying `key` and `salt`.
    pub fn cluster(key: &[u8], salt: &[u8]) -> String {
        format!(
            "kms://cluster-kms?key={}&salt={}",
            URL_SAFE.encode(key),
            URL_SAFE.encode(salt)
        )
    }
}

/// Parsed storage URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUri {
    NoStore,
    Aws {
        bucket: String,
    },
    Azure {
        container: String,
        connection_string: String,
    },
    Gcp {
        project: String,
        bucket: String,
    },
}

impl StorageUri {
    pub const NO_STORE: &'static str = "storage://no-store";

    pub fn provider(&self) -> &'static str {
        match self {
            Self::NoStore => "no-store",
            Self::Aws { .. } => "aws",
            Self::Azure { .. } => "azure",
            Self::Gcp { .. } => "gcp",
        }
    }

    pub fn parse(raw: &str) -> CoordinatorResult<Self> {
        let (host, query) = split(raw, "storage")?;
        match host.as_str() {
            "no-store" => Ok(Self::NoStore),
            "aws" => Ok(Self::Aws {
                bucket: required(&query, "bucket")?,
            }),
            "azure" => Ok(Self::Azure {
                container: required(&query, "container")?,
                connection_string: required(&query, "connectionString")?,
            }),
            "gcp" => Ok(Self::Gcp {
                project: required(&query, "project")?,
                bucket: required(&query, "bucket")?,
            }),
            other => Err(CoordinatorError::kms(format!("unknown storage type: {}", other))),
        }
    }
}

fn split(raw: &str, scheme: &str) -> CoordinatorResult<(String, HashMap<String, String>)> {
    let url = Url::parse(raw).map_err(|e| CoordinatorError::kms(format!("invalid URI {:?}: {}", raw, e)))?;
    if url.scheme() != scheme {
        return Err(CoordinatorError::kms(format!(
            "invalid {} URI: invalid scheme: {}",
            scheme,
            url.scheme()
        )));
    }
    let host = url.host_str().unwrap_or_default().to_string();
    let query = url.query_pairs().into_owned().collect();
    Ok((host, query))
}

fn required(query: &HashMap<String, String>, key: &str) -> CoordinatorResult<String> {
    match query.get(key) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(CoordinatorError::kms(format!("missing value for key: {:?}", key))),
    }
}

fn optional_b64(query: &HashMap<String, String>, key: &str) -> CoordinatorResult<Option<Vec<u8>>> {
    match query.get(key) {
        Some(value) if !value.is_empty() => URL_SAFE
            .decode(value)
            .map(Some)
            .map_err(|e| CoordinatorError::kms(format!("parsing {} from URI: {}", key, e))),
        _ => Ok(None),
    }
}

fn required_b64_string(query: &HashMap<String, String>, key: &str) -> CoordinatorResult<String> {
    let raw = required(query, key)?;
    let decoded = URL_SAFE
        .decode(&raw)
        .map_err(|e| CoordinatorError::kms(format!("parsing {} from URI: {}", key, e)))?;
    String::from_utf8(decoded).map_err(|e| CoordinatorError::kms(format!("parsing {} from URI: {}", key, e)))
}
