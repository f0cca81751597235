//! Typed clients for both APIs.
//!
//! Every call dials a fresh connection and runs under the client's deadline.

use super::proto::{
    self, activate_as_coordinator_response, activate_as_node_request, activate_as_node_response,
    methods, ActivateAsCoordinatorRequest, ActivateAsCoordinatorResponse, AdminConfig,
};
use super::rpc::{unary, with_deadline, ClientStream};
use crate::control::JoinArgs;
use crate::core::error::{CoordinatorError, CoordinatorResult};
use crate::net::{DialMode, Dialer};
use crate::peer::Peer;
use crate::state::State;
use std::time::Duration;

/// Client of a peer's public API.
pub struct PublicClient {
    dialer: Dialer,
    endpoint: String,
    mode: DialMode,
    deadline: Duration,
}

impl PublicClient {
    pub fn new(dialer: Dialer, endpoint: impl Into<String>, mode: DialMode, deadline: Duration) -> Self {
        Self {
            dialer,
            endpoint: endpoint.into(),
            mode,
            deadline,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn unary<Req, Resp>(&self, method: &'static str, request: &Req) -> CoordinatorResult<Resp>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        with_deadline(self.deadline, method, async {
            let stream = self.dialer.dial(&self.endpoint, self.mode).await?;
            unary(stream, method, request).await
        })
        .await
    }

    pub async fn get_state(&self) -> CoordinatorResult<State> {
        let resp: proto::GetStateResponse = self
            .unary(methods::GET_STATE, &proto::GetStateRequest {})
            .await?;
        State::from_u32(resp.state)
            .ok_or_else(|| CoordinatorError::internal(format!("unknown state {}", resp.state)))
    }

    pub async fn get_vpn_peers(&self) -> CoordinatorResult<Vec<Peer>> {
        let resp: proto::GetVpnPeersResponse = self
            .unary(methods::GET_VPN_PEERS, &proto::GetVpnPeersRequest {})
            .await?;
        Ok(Peer::from_public_proto(&resp.peers))
    }

    pub async fn get_peer_vpn_public_key(&self) -> CoordinatorResult<Vec<u8>> {
        let resp: proto::GetPeerVpnPublicKeyResponse = self
            .unary(
                methods::GET_PEER_VPN_PUBLIC_KEY,
                &proto::GetPeerVpnPublicKeyRequest {},
            )
            .await?;
        Ok(resp.coordinator_pub_key)
    }

    pub async fn join_cluster(&self, coordinator_vpn_ip: &str) -> CoordinatorResult<()> {
        let _: proto::JoinClusterResponse = self
            .unary(
                methods::JOIN_CLUSTER,
                &proto::JoinClusterRequest {
                    coordinator_vpn_ip: coordinator_vpn_ip.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn trigger_node_update(&self) -> CoordinatorResult<()> {
        let _: proto::TriggerNodeUpdateResponse = self
            .unary(methods::TRIGGER_NODE_UPDATE, &proto::TriggerNodeUpdateRequest {})
            .await?;
        Ok(())
    }

    pub async fn trigger_coordinator_update(&self) -> CoordinatorResult<()> {
        let _: proto::TriggerCoordinatorUpdateResponse = self
            .unary(
                methods::TRIGGER_COORDINATOR_UPDATE,
                &proto::TriggerCoordinatorUpdateRequest {},
            )
            .await?;
        Ok(())
    }

    pub async fn activate_as_additional_coordinator(
        &self,
        request: &proto::ActivateAsAdditionalCoordinatorRequest,
    ) -> CoordinatorResult<()> {
        let _: proto::ActivateAsAdditionalCoordinatorResponse = self
            .unary(methods::ACTIVATE_AS_ADDITIONAL_COORDINATOR, request)
            .await?;
        Ok(())
    }

    pub async fn activate_additional_coordinator(&self, coordinator_endpoint: &str) -> CoordinatorResult<()> {
        let _: proto::ActivateAdditionalCoordinatorResponse = self
            .unary(
                methods::ACTIVATE_ADDITIONAL_COORDINATOR,
                &proto::ActivateAdditionalCoordinatorRequest {
                    coordinator_public_endpoint: coordinator_endpoint.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Activate the first coordinator.
    ///
    /// Progress messages are handed to `on_log` as they arrive; the final
    /// admin configuration is returned.
    pub async fn activate_as_coordinator<F>(
        &self,
        request: &ActivateAsCoordinatorRequest,
        mut on_log: F,
    ) -> CoordinatorResult<AdminConfig>
    where
        F: FnMut(&str) + Send,
    {
        let method = methods::ACTIVATE_AS_COORDINATOR;
        with_deadline(self.deadline, method, async {
            let stream = self.dialer.dial(&self.endpoint, self.mode).await?;
            let mut call = ClientStream::open(stream, method, request).await?;
            let mut admin_config = None;
            while let Some(msg) = call.recv::<ActivateAsCoordinatorResponse>().await? {
                match msg.content {
                    Some(activate_as_coordinator_response::Content::Log(log)) => on_log(&log.message),
                    Some(activate_as_coordinator_response::Content::AdminConfig(config)) => {
                        admin_config = Some(config)
                    }
                    None => {}
                }
            }
            admin_config.ok_or_else(|| {
                CoordinatorError::internal("activation finished without an admin config")
            })
        })
        .await
    }

    /// Activate more nodes through an active coordinator; progress goes to
    /// `on_log`.
    pub async fn activate_additional_nodes<F>(&self, node_endpoints: &[String], mut on_log: F) -> CoordinatorResult<()>
    where
        F: FnMut(&str) + Send,
    {
        let method = methods::ACTIVATE_ADDITIONAL_NODES;
        let request = proto::ActivateAdditionalNodesRequest {
            node_public_endpoints: node_endpoints.to_vec(),
        };
        with_deadline(self.deadline, method, async {
            let stream = self.dialer.dial(&self.endpoint, self.mode).await?;
            let mut call = ClientStream::open(stream, method, &request).await?;
            while let Some(msg) = call.recv::<proto::ActivateAdditionalNodesResponse>().await? {
                if let Some(log) = msg.log {
                    on_log(&log.message);
                }
            }
            Ok(())
        })
        .await
    }

    /// Start the node activation exchange.
    ///
    /// Sends the initial request and waits for the node's state disk UUID.
    /// The returned handle finishes the exchange with
    /// [`NodeActivation::send_disk_key`].
    pub async fn activate_as_node(
        &self,
        initial: proto::ActivateAsNodeInitialRequest,
    ) -> CoordinatorResult<NodeActivation> {
        let method = methods::ACTIVATE_AS_NODE;
        let request = proto::ActivateAsNodeRequest {
            request: Some(activate_as_node_request::Request::InitialRequest(initial)),
        };
        with_deadline(self.deadline, method, async {
            let stream = self.dialer.dial(&self.endpoint, self.mode).await?;
            let mut call = ClientStream::open(stream, method, &request).await?;
            let disk_uuid = match call.recv_message::<proto::ActivateAsNodeResponse>().await?.response {
                Some(activate_as_node_response::Response::StateDiskUuid(uuid)) => uuid,
                _ => {
                    return Err(CoordinatorError::internal(
                        "expected state disk UUID but got different message type",
                    ))
                }
            };
            Ok(NodeActivation {
                call,
                disk_uuid,
                deadline: self.deadline,
            })
        })
        .await
    }
}

/// A node activation waiting for its state disk key.
pub struct NodeActivation {
    call: ClientStream,
    disk_uuid: String,
    deadline: Duration,
}

impl NodeActivation {
    pub fn disk_uuid(&self) -> &str {
        &self.disk_uuid
    }

    /// Deliver the state disk key and return the node's VPN public key.
    pub async fn send_disk_key(mut self, key: Vec<u8>) -> CoordinatorResult<Vec<u8>> {
        with_deadline(self.deadline, methods::ACTIVATE_AS_NODE, async move {
            self.call
                .send(&proto::ActivateAsNodeRequest {
                    request: Some(activate_as_node_request::Request::StateDiskKey(key)),
                })
                .await?;
            let pub_key = match self.call.recv_message::<proto::ActivateAsNodeResponse>().await?.response {
                Some(activate_as_node_response::Response::NodeVpnPubKey(key)) => key,
                _ => {
                    return Err(CoordinatorError::internal(
                        "expected node VPN public key but got different message type",
                    ))
                }
            };
            self.call.finish().await?;
            Ok(pub_key)
        })
        .await
    }
}

/// Client of a coordinator's in-VPN API. Always plaintext.
pub struct VpnClient {
    dialer: Dialer,
    endpoint: String,
    deadline: Duration,
}

impl VpnClient {
    pub fn new(dialer: Dialer, endpoint: impl Into<String>, deadline: Duration) -> Self {
        Self {
            dialer,
            endpoint: endpoint.into(),
            deadline,
        }
    }

    async fn unary<Req, Resp>(&self, method: &'static str, request: &Req) -> CoordinatorResult<Resp>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        with_deadline(self.deadline, method, async {
            let stream = self
                .dialer
                .dial(&self.endpoint, DialMode::Insecure)
                .await?;
            unary(stream, method, request).await
        })
        .await
    }

    /// Resource version and, if it moved past `resource_version`, all peers.
    pub async fn get_update(&self, resource_version: u64) -> CoordinatorResult<(u64, Vec<Peer>)> {
        let resp: proto::GetUpdateResponse = self
            .unary(methods::GET_UPDATE, &proto::GetUpdateRequest { resource_version })
            .await?;
        Ok((resp.resource_version, Peer::from_vpn_proto(&resp.peers)))
    }

    pub async fn get_k8s_join_args(&self) -> CoordinatorResult<JoinArgs> {
        let resp: proto::GetK8sJoinArgsResponse = self
            .unary(methods::GET_K8S_JOIN_ARGS, &proto::GetK8sJoinArgsRequest {})
            .await?;
        Ok(JoinArgs {
            api_server_endpoint: resp.api_server_endpoint,
            token: resp.token,
            ca_cert_hashes: vec![resp.discovery_token_ca_cert_hash],
        })
    }

    pub async fn get_k8s_certificate_key(&self) -> CoordinatorResult<String> {
        let resp: proto::GetK8sCertificateKeyResponse = self
            .unary(
                methods::GET_K8S_CERTIFICATE_KEY,
                &proto::GetK8sCertificateKeyRequest {},
            )
            .await?;
        Ok(resp.certificate_key)
    }

    pub async fn get_data_key(&self, data_key_id: &str, length: u32) -> CoordinatorResult<Vec<u8>> {
        let resp: proto::GetDataKeyResponse = self
            .unary(
                methods::GET_DATA_KEY,
                &proto::GetDataKeyRequest {
                    data_key_id: data_key_id.to_string(),
                    length,
                },
            )
            .await?;
        Ok(resp.data_key)
    }
}
