//! Host drivers for development clusters.
//!
//! Used with the `dummy` attestation variant, where no confidential VM, VPN
//! kernel module or kubeadm is available. They behave like the real drivers
//! from the control plane's point of view but only record what they are told.

use super::collaborators::{
    ClusterBootstrap, EncryptedDisk, InitClusterRequest, JoinArgs, JoinClusterRequest, Vpn,
};
use crate::core::error::{CoordinatorError, CoordinatorResult};
use crate::peer::Peer;
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Default)]
struct VpnState {
    private_key: Vec<u8>,
    interface_ip: String,
    /// Public key (hex) to (public IP, VPN IP).
    peers: HashMap<String, (String, String)>,
}

/// VPN driver that keeps its configuration in memory.
///
/// The public key is the SHA-256 of the private key.
#[derive(Debug, Default)]
pub struct DevVpn {
    state: Mutex<VpnState>,
}

impl DevVpn {
    pub fn new() -> Self {
        Self::default()
    }

    /// VPN IPs of the configured peers, sorted.
    pub fn peer_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self
            .state
            .lock()
            .peers
            .values()
            .map(|(_, vpn_ip)| vpn_ip.clone())
            .collect();
        ips.sort();
        ips
    }
}

#[async_trait]
impl Vpn for DevVpn {
    async fn setup(&self, private_key: &[u8]) -> CoordinatorResult<()> {
        self.state.lock().private_key = private_key.to_vec();
        Ok(())
    }

    async fn get_private_key(&self) -> CoordinatorResult<Vec<u8>> {
        Ok(self.state.lock().private_key.clone())
    }

    async fn get_public_key(&self) -> CoordinatorResult<Vec<u8>> {
        let state = self.state.lock();
        if state.private_key.is_empty() {
            return Err(CoordinatorError::internal("VPN is not set up"));
        }
        Ok(Sha256::digest(&state.private_key).to_vec())
    }

    async fn get_interface_ip(&self) -> CoordinatorResult<String> {
        let state = self.state.lock();
        if state.interface_ip.is_empty() {
            return Err(CoordinatorError::internal("VPN interface has no address"));
        }
        Ok(state.interface_ip.clone())
    }

    async fn set_interface_ip(&self, ip: &str) -> CoordinatorResult<()> {
        tracing::info!(vpn_ip = %ip, "dev VPN: interface address set");
        self.state.lock().interface_ip = ip.to_string();
        Ok(())
    }

    async fn add_peer(&self, pub_key: &[u8], public_ip: &str, vpn_ip: &str) -> CoordinatorResult<()> {
        tracing::debug!(%vpn_ip, %public_ip, "dev VPN: peer added");
        self.state
            .lock()
            .peers
            .insert(hex::encode(pub_key), (public_ip.to_string(), vpn_ip.to_string()));
        Ok(())
    }

    async fn remove_peer(&self, pub_key: &[u8]) -> CoordinatorResult<()> {
        self.state.lock().peers.remove(&hex::encode(pub_key));
        Ok(())
    }

    async fn update_peers(&self, peers: &[Peer]) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        state.peers = peers
            .iter()
            .map(|p| {
                (
                    hex::encode(&p.vpn_pub_key),
                    (
                        crate::net::tcp::host_of(&p.public_endpoint).to_string(),
                        p.vpn_ip.clone(),
                    ),
                )
            })
            .collect();
        tracing::debug!(peers = state.peers.len(), "dev VPN: peers replaced");
        Ok(())
    }
}

/// Cluster bootstrap that initializes and joins nothing.
#[derive(Debug, Default)]
pub struct DevCluster;

#[async_trait]
impl ClusterBootstrap for DevCluster {
    async fn init_cluster(&self, request: InitClusterRequest) -> CoordinatorResult<Vec<u8>> {
        tracing::info!(node = %request.node_name, vpn_ip = %request.vpn_ip, "dev cluster: init");
        Ok(b"kubeconfig".to_vec())
    }

    async fn join_cluster(&self, request: JoinClusterRequest) -> CoordinatorResult<()> {
        tracing::info!(
            node = %request.node_name,
            role = %request.role,
            api_server = %request.args.api_server_endpoint,
            "dev cluster: join"
        );
        Ok(())
    }

    async fn get_join_args(&self) -> CoordinatorResult<JoinArgs> {
        Ok(JoinArgs {
            api_server_endpoint: "0.0.0.0".to_string(),
            token: "kube-fake-token".to_string(),
            ca_cert_hashes: vec![
                "sha256:a60ebe9b0879090edd83b40a4df4bebb20506bac1e51d518ff8f4505a721930f".to_string(),
            ],
        })
    }

    async fn get_certificate_key(&self) -> CoordinatorResult<String> {
        Ok("controlPlaneCertficateKey".to_string())
    }
}

/// State disk with a fixed UUID whose passphrase is only remembered.
#[derive(Debug)]
pub struct DevDisk {
    uuid: String,
    passphrase: Mutex<Vec<u8>>,
}

impl DevDisk {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            passphrase: Mutex::new(Vec::new()),
        }
    }

    pub fn passphrase(&self) -> Vec<u8> {
        self.passphrase.lock().clone()
    }
}

impl Default for DevDisk {
    fn default() -> Self {
        Self::new("8b7d2a0c-5e1f-4c3d-9a6b-2f4e8d1c7b90")
    }
}

#[async_trait]
impl EncryptedDisk for DevDisk {
    async fn uuid(&self) -> CoordinatorResult<String> {
        Ok(self.uuid.clone())
    }

    async fn update_passphrase(&self, passphrase: &[u8]) -> CoordinatorResult<()> {
        *self.passphrase.lock() = passphrase.to_vec();
        Ok(())
    }
}
