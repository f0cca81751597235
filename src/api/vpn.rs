//! In-VPN API.
//!
//! Served in plaintext on the coordinator's VPN address: the VPN is the
//! authentication boundary. Nodes poll [`methods::GET_UPDATE`] for peer
//! changes and fetch Kubernetes join material and data keys here.

use super::proto::{self, methods};
use super::rpc::{decode, unimplemented, RpcServer, RpcService, ServerStream};
use crate::control::Core;
use crate::core::error::{internal, CoordinatorError, CoordinatorResult};
use crate::kms::check_dek_length;
use crate::net::Network;
use crate::peer::Peer;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct VpnApi {
    core: Arc<Core>,
}

impl VpnApi {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    async fn get_update(&self, req: proto::GetUpdateRequest, caller: &str) -> CoordinatorResult<proto::GetUpdateResponse> {
        self.core.notify_node_heartbeat(caller);
        let (resource_version, peers) = self
            .core
            .get_peers(req.resource_version)
            .await
            .map_err(internal("get peers"))?;
        Ok(proto::GetUpdateResponse {
            resource_version,
            peers: Peer::to_vpn_proto(&peers),
        })
    }

    async fn get_k8s_join_args(&self) -> CoordinatorResult<proto::GetK8sJoinArgsResponse> {
        let args = self
            .core
            .get_k8s_join_args()
            .await
            .map_err(internal("get kubernetes join args"))?;
        Ok(proto::GetK8sJoinArgsResponse {
            discovery_token_ca_cert_hash: args.discovery_hash().to_string(),
            api_server_endpoint: args.api_server_endpoint,
            token: args.token,
        })
    }

    async fn get_k8s_certificate_key(&self) -> CoordinatorResult<proto::GetK8sCertificateKeyResponse> {
        let certificate_key = self
            .core
            .get_k8s_certificate_key()
            .await
            .map_err(internal("get kubernetes certificate key"))?;
        Ok(proto::GetK8sCertificateKeyResponse { certificate_key })
    }

    async fn get_data_key(&self, req: proto::GetDataKeyRequest) -> CoordinatorResult<proto::GetDataKeyResponse> {
        if req.data_key_id.is_empty() {
            return Err(CoordinatorError::invalid_argument("missing data key ID"));
        }
        let length = req.length as usize;
        check_dek_length(length)?;
        let data_key = self
            .core
            .get_data_key(&req.data_key_id, length)
            .await
            .map_err(internal("get data key"))?;
        Ok(proto::GetDataKeyResponse { data_key })
    }
}

#[async_trait]
impl RpcService for VpnApi {
    async fn call(&self, method: &str, payload: Bytes, stream: &mut ServerStream) -> CoordinatorResult<()> {
        match method {
            methods::GET_UPDATE => {
                let caller = stream.peer_addr().to_string();
                let resp = self.get_update(decode(payload)?, &caller).await?;
                stream.send(&resp).await
            }
            methods::GET_K8S_JOIN_ARGS => {
                let resp = self.get_k8s_join_args().await?;
                stream.send(&resp).await
            }
            methods::GET_K8S_CERTIFICATE_KEY => {
                let resp = self.get_k8s_certificate_key().await?;
                stream.send(&resp).await
            }
            methods::GET_DATA_KEY => {
                let resp = self.get_data_key(decode(payload)?).await?;
                stream.send(&resp).await
            }
            other => Err(unimplemented(other)),
        }
    }
}

/// Lifecycle of the in-VPN server as seen by the public API.
#[async_trait]
pub trait VpnApiServer: Send + Sync {
    /// Bind `addr` and start serving in the background.
    async fn listen(&self, addr: &str) -> CoordinatorResult<()>;

    /// Stop serving and wait for the accept loop to exit.
    async fn close(&self);
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// [`VpnApiServer`] serving a [`VpnApi`] on a [`Network`].
pub struct VpnApiServerHandle {
    api: Arc<VpnApi>,
    network: Arc<dyn Network>,
    running: Mutex<Option<Running>>,
}

impl VpnApiServerHandle {
    pub fn new(core: Arc<Core>, network: Arc<dyn Network>) -> Self {
        Self {
            api: Arc::new(VpnApi::new(core)),
            network,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

#[async_trait]
impl VpnApiServer for VpnApiServerHandle {
    async fn listen(&self, addr: &str) -> CoordinatorResult<()> {
        if self.is_running() {
            return Err(CoordinatorError::failed_precondition(
                "in-VPN API server already running",
            ));
        }
        let listener = self.network.listen(addr).await?;
        let server = Arc::new(RpcServer::new("vpnapi", self.api.clone()));
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Err(e) = server.serve(listener, rx).await {
                tracing::error!(error = %e, "in-VPN API server failed");
            }
        });
        *self.running.lock() = Some(Running { shutdown, task });
        Ok(())
    }

    async fn close(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(e) = running.task.await {
                tracing::warn!(error = %e, "in-VPN API server task panicked");
            }
        }
    }
}
