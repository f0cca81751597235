//! Interfaces to the host facilities the Core drives.
//!
//! None of these are implemented here: the VPN driver, the Kubernetes
//! bootstrap helper and the encrypted state disk live outside the control
//! plane. Production binaries plug in real drivers; tests plug in fakes.

use crate::core::error::CoordinatorResult;
use crate::peer::{Peer, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Bootstrap-token discovery data a joining Kubernetes node needs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JoinArgs {
    #[serde(rename = "apiServerEndpoint")]
    pub api_server_endpoint: String,
    #[serde(rename = "token")]
    pub token: String,
    #[serde(rename = "caCertHashes", default)]
    pub ca_cert_hashes: Vec<String>,
}

impl JoinArgs {
    /// First CA certificate hash, the only one carried on the wire.
    pub fn discovery_hash(&self) -> &str {
        self.ca_cert_hashes.first().map(String::as_str).unwrap_or_default()
    }
}

/// Parameters of the first control-plane initialization.
#[derive(Debug, Clone, Default)]
pub struct InitClusterRequest {
    pub autoscaling_node_groups: Vec<String>,
    pub cloud_service_account_uri: String,
    pub vpn_ip: String,
    pub node_name: String,
}

/// Parameters of a Kubernetes join.
#[derive(Debug, Clone)]
pub struct JoinClusterRequest {
    pub args: JoinArgs,
    pub node_name: String,
    pub vpn_ip: String,
    /// Present when joining as an additional control-plane node.
    pub certificate_key: Option<String>,
    pub role: Role,
}

/// WireGuard-style VPN driver.
#[async_trait]
pub trait Vpn: Send + Sync {
    async fn setup(&self, private_key: &[u8]) -> CoordinatorResult<()>;
    async fn get_private_key(&self) -> CoordinatorResult<Vec<u8>>;
    async fn get_public_key(&self) -> CoordinatorResult<Vec<u8>>;
    async fn get_interface_ip(&self) -> CoordinatorResult<String>;
    async fn set_interface_ip(&self, ip: &str) -> CoordinatorResult<()>;
    async fn add_peer(&self, pub_key: &[u8], public_ip: &str, vpn_ip: &str) -> CoordinatorResult<()>;
    async fn remove_peer(&self, pub_key: &[u8]) -> CoordinatorResult<()>;
    /// Replace the driver's peer list with `peers`.
    async fn update_peers(&self, peers: &[Peer]) -> CoordinatorResult<()>;
}

/// Kubernetes bootstrap helper (kubeadm or equivalent).
#[async_trait]
pub trait ClusterBootstrap: Send + Sync {
    /// Initialize the first control-plane node and return the admin kubeconfig.
    async fn init_cluster(&self, request: InitClusterRequest) -> CoordinatorResult<Vec<u8>>;

    async fn join_cluster(&self, request: JoinClusterRequest) -> CoordinatorResult<()>;

    /// Mint a fresh bootstrap token for a joining node.
    async fn get_join_args(&self) -> CoordinatorResult<JoinArgs>;

    /// Key additional control-plane nodes use to fetch the cluster certificates.
    async fn get_certificate_key(&self) -> CoordinatorResult<String>;
}

/// The peer's encrypted state disk.
#[async_trait]
pub trait EncryptedDisk: Send + Sync {
    async fn uuid(&self) -> CoordinatorResult<String>;
    async fn update_passphrase(&self, passphrase: &[u8]) -> CoordinatorResult<()>;
}
