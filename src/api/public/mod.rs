//! Public API, served over attested TLS on every peer.
//!
//! - [`coordinator`] - first-coordinator activation and the node fan-out
//! - [`node`] - node activation, cluster join and the update loop
//! - [`multicoord`] - additional coordinators
//!
//! State-dependent operations run under one API mutex. Once an activation
//! has advanced the lifecycle, any later failure moves the peer to `Failed`
//! and nothing is rolled back.

mod coordinator;
mod multicoord;
mod node;

use super::client::{PublicClient, VpnClient};
use super::proto::{
    self, activate_as_coordinator_response, methods, ActivateAdditionalNodesResponse,
    ActivateAsCoordinatorResponse, LogMessage,
};
use super::rpc::{decode, unimplemented, RpcService, ServerStream};
use super::vpn::VpnApiServer;
use crate::control::Core;
use crate::core::error::{internal, CoordinatorResult};
use crate::net::tcp::is_host_port;
use crate::net::{DialMode, Dialer};
use crate::peer::{Peer, Role};
use crate::state::State;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use node::UpdateLoop;

/// Ports, deadlines and the endpoint this peer advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiOptions {
    /// `host:port` other peers reach this peer's public API on.
    pub public_endpoint: String,
    /// Port assumed for endpoints given without one.
    pub public_port: u16,
    pub vpn_api_port: u16,
    /// Deadline of every outbound call.
    pub rpc_deadline: Duration,
    pub kms_deadline: Duration,
    pub update_interval: Duration,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            public_endpoint: String::new(),
            public_port: 9000,
            vpn_api_port: 9027,
            rpc_deadline: Duration::from_secs(60),
            kms_deadline: Duration::from_secs(20),
            update_interval: Duration::from_secs(10),
        }
    }
}

/// Append `port` to `endpoint` unless it already carries one.
pub fn endpoint_with_port(endpoint: &str, port: u16) -> String {
    if is_host_port(endpoint) {
        endpoint.to_string()
    } else {
        format!("{}:{}", endpoint, port)
    }
}

/// The public API service.
pub struct PublicApi {
    inner: Arc<ApiInner>,
}

struct ApiInner {
    core: Arc<Core>,
    dialer: Dialer,
    vpn_server: Arc<dyn VpnApiServer>,
    options: ApiOptions,
    /// Serializes the state-dependent operations.
    api_lock: tokio::sync::Mutex<()>,
    /// Last peers resource version applied to the VPN driver.
    resource_version: AtomicU64,
    update_loop: Mutex<Option<UpdateLoop>>,
}

impl PublicApi {
    pub fn new(
        core: Arc<Core>,
        dialer: Dialer,
        vpn_server: Arc<dyn VpnApiServer>,
        options: ApiOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ApiInner {
                core,
                dialer,
                vpn_server,
                options,
                api_lock: tokio::sync::Mutex::new(()),
                resource_version: AtomicU64::new(0),
                update_loop: Mutex::new(None),
            }),
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    /// Last peers resource version this peer applied.
    pub fn resource_version(&self) -> u64 {
        self.inner.resource_version.load(Ordering::SeqCst)
    }

    pub fn update_loop_running(&self) -> bool {
        self.inner.update_loop.lock().is_some()
    }

    /// Stop the update loop and the in-VPN server and wait for both.
    pub async fn close(&self) {
        let update_loop = self.inner.update_loop.lock().take();
        if let Some(update_loop) = update_loop {
            update_loop.stop().await;
        }
        self.inner.vpn_server.close().await;
        tracing::debug!("public API closed");
    }
}

#[async_trait]
impl RpcService for PublicApi {
    async fn call(&self, method: &str, payload: Bytes, stream: &mut ServerStream) -> CoordinatorResult<()> {
        let api = &self.inner;
        match method {
            methods::ACTIVATE_AS_COORDINATOR => {
                api.activate_as_coordinator(decode(payload)?, stream).await
            }
            methods::ACTIVATE_AS_NODE => api.activate_as_node(payload, stream).await,
            methods::ACTIVATE_ADDITIONAL_NODES => {
                api.activate_additional_nodes(decode(payload)?, stream).await
            }
            methods::ACTIVATE_AS_ADDITIONAL_COORDINATOR => {
                let resp = api.activate_as_additional_coordinator(decode(payload)?).await?;
                stream.send(&resp).await
            }
            methods::ACTIVATE_ADDITIONAL_COORDINATOR => {
                let resp = api.activate_additional_coordinator(decode(payload)?).await?;
                stream.send(&resp).await
            }
            methods::JOIN_CLUSTER => {
                let resp = api.join_cluster(decode(payload)?).await?;
                stream.send(&resp).await
            }
            methods::TRIGGER_NODE_UPDATE => {
                let resp = api.trigger_node_update().await?;
                stream.send(&resp).await
            }
            methods::TRIGGER_COORDINATOR_UPDATE => {
                let resp = api.trigger_coordinator_update().await?;
                stream.send(&resp).await
            }
            methods::GET_STATE => {
                let resp = proto::GetStateResponse {
                    state: api.core.get_state().as_u32(),
                };
                stream.send(&resp).await
            }
            methods::GET_VPN_PEERS => {
                let resp = api.get_vpn_peers().await?;
                stream.send(&resp).await
            }
            methods::GET_PEER_VPN_PUBLIC_KEY => {
                let resp = api.get_peer_vpn_public_key().await?;
                stream.send(&resp).await
            }
            other => Err(unimplemented(other)),
        }
    }
}

// ============================================================================
// Progress logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum ProgressKind {
    ActivateAsCoordinator,
    ActivateAdditionalNodes,
}

/// Sink for progress messages of a streaming activation.
struct Progress<'a> {
    stream: &'a mut ServerStream,
    kind: ProgressKind,
}

impl<'a> Progress<'a> {
    fn new(stream: &'a mut ServerStream, kind: ProgressKind) -> Self {
        Self { stream, kind }
    }

    /// Send `message` to the caller. Failing to deliver it is logged only.
    async fn log(&mut self, message: String) {
        tracing::info!(%message, "activation progress");
        let log = Some(LogMessage { message });
        let sent = match self.kind {
            ProgressKind::ActivateAsCoordinator => {
                self.stream
                    .send(&ActivateAsCoordinatorResponse {
                        content: log.map(activate_as_coordinator_response::Content::Log),
                    })
                    .await
            }
            ProgressKind::ActivateAdditionalNodes => {
                self.stream
                    .send(&ActivateAdditionalNodesResponse { log })
                    .await
            }
        };
        if let Err(e) = sent {
            tracing::error!(error = %e, "logging to CLI failed");
        }
    }

    fn stream(&mut self) -> &mut ServerStream {
        self.stream
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

impl ApiInner {
    fn public_client(&self, endpoint: &str, mode: DialMode) -> PublicClient {
        PublicClient::new(
            self.dialer.clone(),
            endpoint_with_port(endpoint, self.options.public_port),
            mode,
            self.options.rpc_deadline,
        )
    }

    fn vpn_client(&self, vpn_ip: &str) -> VpnClient {
        VpnClient::new(
            self.dialer.clone(),
            format!("{}:{}", vpn_ip, self.options.vpn_api_port),
            self.options.rpc_deadline,
        )
    }

    /// This peer as a coordinator record.
    async fn own_coordinator_peer(&self, vpn_ip: &str) -> CoordinatorResult<Peer> {
        Ok(Peer {
            public_endpoint: self.options.public_endpoint.clone(),
            vpn_ip: vpn_ip.to_string(),
            vpn_pub_key: self.core.get_vpn_pub_key().await?,
            role: Role::Coordinator,
        })
    }

    /// Move to `Failed` if `result` is an error. Used once an activation
    /// advanced the state.
    fn fail_on_error<T>(&self, result: CoordinatorResult<T>) -> CoordinatorResult<T> {
        if let Err(e) = &result {
            tracing::error!(error = %e, "activation step failed, marking peer as failed");
            if let Err(advance) = self.core.advance_state(State::Failed, None, None) {
                tracing::error!(error = %advance, "could not mark peer as failed");
            }
        }
        result
    }

    /// Ask peers to pull the current peer set.
    ///
    /// Coordinators other than `own_vpn_ip` are always asked; nodes only if
    /// `include_nodes`. Failures are logged and otherwise ignored.
    async fn trigger_updates(&self, peers: &[Peer], own_vpn_ip: &str, include_nodes: bool) {
        for peer in peers {
            let result = match peer.role {
                Role::Node if include_nodes => {
                    self.public_client(&peer.public_endpoint, DialMode::Unverified)
                        .trigger_node_update()
                        .await
                }
                Role::Coordinator if peer.vpn_ip != own_vpn_ip => {
                    tracing::info!(vpn_ip = %peer.vpn_ip, "update coordinator");
                    self.public_client(&peer.public_endpoint, DialMode::Unverified)
                        .trigger_coordinator_update()
                        .await
                }
                _ => continue,
            };
            if let Err(e) = result {
                tracing::error!(
                    error = %e,
                    endpoint = %peer.public_endpoint,
                    vpn_ip = %peer.vpn_ip,
                    role = %peer.role,
                    "triggering peer update failed"
                );
            }
        }
    }

    /// Re-key the local state disk with a key from the KMS.
    async fn rekey_own_disk(&self) -> CoordinatorResult<()> {
        let disk_uuid = self.core.get_disk_uuid().await.map_err(internal("getting disk uuid"))?;
        let disk_key = self
            .core
            .get_data_key(&disk_uuid, 32)
            .await
            .map_err(internal("getting disk key"))?;
        self.core
            .update_disk_passphrase(&disk_key)
            .await
            .map_err(internal("updating disk key"))
    }

    async fn get_vpn_peers(&self) -> CoordinatorResult<proto::GetVpnPeersResponse> {
        let (_, peers) = self.core.get_peers(0).await.map_err(internal("get peers"))?;
        Ok(proto::GetVpnPeersResponse {
            peers: Peer::to_public_proto(&peers),
        })
    }

    async fn get_peer_vpn_public_key(&self) -> CoordinatorResult<proto::GetPeerVpnPublicKeyResponse> {
        let key = self
            .core
            .get_vpn_pub_key()
            .await
            .map_err(internal("could not obtain VPN public key"))?;
        Ok(proto::GetPeerVpnPublicKeyResponse {
            coordinator_pub_key: key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_with_port() {
        assert_eq!(endpoint_with_port("192.0.2.1", 9000), "192.0.2.1:9000");
        assert_eq!(endpoint_with_port("192.0.2.1:9100", 9000), "192.0.2.1:9100");
        assert_eq!(endpoint_with_port("node-1", 9000), "node-1:9000");
    }

    #[test]
    fn test_default_options() {
        let options = ApiOptions::default();
        assert_eq!(options.public_port, 9000);
        assert_eq!(options.vpn_api_port, 9027);
        assert_eq!(options.update_interval, Duration::from_secs(10));
        assert_eq!(options.kms_deadline, Duration::from_secs(20));
    }
}
