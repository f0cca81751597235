//! First-coordinator activation and node fan-out.

use super::{ApiInner, Progress, ProgressKind};
use crate::api::proto::{
    activate_as_coordinator_response, ActivateAdditionalNodesRequest,
    ActivateAdditionalNodesResponse, ActivateAsCoordinatorRequest, ActivateAsCoordinatorResponse,
    ActivateAsNodeInitialRequest, AdminConfig, LogMessage, PublicPeer,
};
use crate::api::rpc::{with_deadline, ServerStream};
use crate::core::error::{internal, CoordinatorError, CoordinatorResult};
use crate::net::DialMode;
use crate::peer::{Peer, Role};
use crate::state::State;

impl ApiInner {
    /// Activate this peer as the first coordinator of a new cluster.
    pub(super) async fn activate_as_coordinator(
        &self,
        req: ActivateAsCoordinatorRequest,
        stream: &mut ServerStream,
    ) -> CoordinatorResult<()> {
        let _guard = self.api_lock.lock().await;
        tracing::info!("ActivateAsCoordinator called");

        self.core.require_state(&[State::AcceptingInit]).map_err(|e| {
            CoordinatorError::failed_precondition(format!("node is not in required state: {}", e))
        })?;
        if req.master_secret.is_empty() {
            tracing::error!("missing master secret");
            return Err(CoordinatorError::invalid_argument("missing master secret"));
        }

        let mut progress = Progress::new(stream, ProgressKind::ActivateAsCoordinator);
        progress
            .log("Initializing first control-plane node ...".to_string())
            .await;

        let result = self.bootstrap_cluster(&req, &mut progress).await;
        let admin_config = self.fail_on_error(result)?;
        progress
            .stream()
            .send(&ActivateAsCoordinatorResponse {
                content: Some(activate_as_coordinator_response::Content::AdminConfig(
                    admin_config,
                )),
            })
            .await
    }

    async fn bootstrap_cluster(
        &self,
        req: &ActivateAsCoordinatorRequest,
        progress: &mut Progress<'_>,
    ) -> CoordinatorResult<AdminConfig> {
        let core = &self.core;
        core.initialize_store_ips()
            .await
            .map_err(internal("initialize store IPs"))?;
        let (owner_id, cluster_id) = core
            .get_ids(Some(&req.master_secret))
            .await
            .map_err(internal("get IDs"))?;

        // Nothing that executes on behalf of the caller may run before this.
        core.advance_state(State::ActivatingNodes, Some(&owner_id), Some(&cluster_id))
            .map_err(internal("advance state to ActivatingNodes"))?;

        with_deadline(
            self.options.kms_deadline,
            "KMS setup",
            core.set_up_kms(
                &req.storage_uri,
                &req.kms_uri,
                &req.key_encryption_key_id,
                req.use_existing_kek,
            ),
        )
        .await
        .map_err(internal("setting up KMS"))?;

        let vpn_ip = core
            .get_next_coordinator_ip()
            .await
            .map_err(internal("get coordinator VPN IP address"))?;
        let own_peer = self
            .own_coordinator_peer(&vpn_ip)
            .await
            .map_err(internal("assembling the coordinator peer"))?;
        core.set_vpn_ip(&vpn_ip)
            .await
            .map_err(internal("set the VPN IP address"))?;
        core.add_peer(&own_peer)
            .await
            .map_err(internal("adding the coordinator to store/vpn"))?;

        progress.log("Initializing Kubernetes ...".to_string()).await;
        let kubeconfig = core
            .init_cluster(&req.autoscaling_node_groups, &req.cloud_service_account_uri)
            .await
            .map_err(internal("initializing Kubernetes cluster failed"))?;

        self.vpn_server
            .listen(&format!("{}:{}", vpn_ip, self.options.vpn_api_port))
            .await
            .map_err(internal("start in-VPN API server"))?;

        self.activate_nodes(progress, &req.node_public_endpoints)
            .await
            .map_err(internal("node initialization"))?;

        core.switch_to_persistent_store()
            .await
            .map_err(internal("switch to persistent store"))?;

        self.activate_coordinators(progress, &req.coordinator_public_endpoints)
            .await
            .map_err(internal("coordinator initialization"))?;

        core.persist_node_state(Role::Coordinator, &owner_id, &cluster_id)
            .await
            .map_err(internal("persist node state"))?;
        self.rekey_own_disk().await?;

        // Grants the admin access to the VPN, so it comes last.
        let admin_vpn_ip = core
            .add_admin(&req.admin_vpn_pub_key)
            .await
            .map_err(internal("add admin to store/vpn"))?;

        Ok(AdminConfig {
            admin_vpn_ip,
            coordinator_vpn_pub_key: own_peer.vpn_pub_key,
            kubeconfig,
            owner_id,
            cluster_id,
        })
    }

    /// Activate more nodes on an already active coordinator.
    pub(super) async fn activate_additional_nodes(
        &self,
        req: ActivateAdditionalNodesRequest,
        stream: &mut ServerStream,
    ) -> CoordinatorResult<()> {
        let _guard = self.api_lock.lock().await;
        tracing::info!("ActivateAdditionalNodes called");
        self.core
            .require_state(&[State::ActivatingNodes])
            .map_err(|e| CoordinatorError::failed_precondition(e.to_string()))?;

        let mut progress = Progress::new(stream, ProgressKind::ActivateAdditionalNodes);
        if let Err(e) = self
            .activate_nodes(&mut progress, &req.node_public_endpoints)
            .await
        {
            tracing::error!(error = %e, "node activation failed");
            return Err(CoordinatorError::internal(format!("activating nodes: {}", e)));
        }
        progress
            .stream()
            .send(&ActivateAdditionalNodesResponse {
                log: Some(LogMessage {
                    message: "success".to_string(),
                }),
            })
            .await
    }

    /// Activate every node in `endpoints`, one after another.
    ///
    /// Any failing node aborts the whole fan-out.
    async fn activate_nodes(&self, progress: &mut Progress<'_>, endpoints: &[String]) -> CoordinatorResult<()> {
        let (_, peers) = self.core.get_peers(0).await?;
        // Every node needs at least all coordinators.
        let initial_peers = Peer::to_public_proto(&peers);
        let (owner_id, cluster_id) = self.core.get_ids(None).await?;
        let own_vpn_ip = self.core.get_interface_ip().await?;

        for (num, endpoint) in endpoints.iter().enumerate() {
            progress
                .log(format!(
                    "Activating worker node {:3} out of {:3} ...",
                    num + 1,
                    endpoints.len()
                ))
                .await;
            let node_vpn_ip = self.core.get_next_node_ip().await.map_err(|e| {
                tracing::error!(error = %e, "generation of VPN IPs failed");
                e
            })?;
            let endpoint = super::endpoint_with_port(endpoint, self.options.public_port);
            let vpn_pub_key = self
                .activate_node(&endpoint, &node_vpn_ip, &initial_peers, &owner_id, &cluster_id)
                .await?;
            self.core
                .add_peer(&Peer {
                    public_endpoint: endpoint.clone(),
                    vpn_ip: node_vpn_ip,
                    vpn_pub_key,
                    role: Role::Node,
                })
                .await?;

            let (_, peers) = self.core.get_peers(0).await?;
            self.trigger_updates(&peers, &own_vpn_ip, false).await;

            self.public_client(&endpoint, DialMode::Unverified)
                .join_cluster(&own_vpn_ip)
                .await?;
        }

        // Spread the final peer set without waiting for the update loops.
        let (_, peers) = self.core.get_peers(0).await?;
        self.trigger_updates(&peers, &own_vpn_ip, true).await;
        Ok(())
    }

    /// Run the activation exchange with one node; returns its VPN public key.
    async fn activate_node(
        &self,
        endpoint: &str,
        node_vpn_ip: &str,
        initial_peers: &[PublicPeer],
        owner_id: &[u8],
        cluster_id: &[u8],
    ) -> CoordinatorResult<Vec<u8>> {
        let activation = self
            .public_client(endpoint, DialMode::Verified)
            .activate_as_node(ActivateAsNodeInitialRequest {
                node_vpn_ip: node_vpn_ip.to_string(),
                peers: initial_peers.to_vec(),
                owner_id: owner_id.to_vec(),
                cluster_id: cluster_id.to_vec(),
            })
            .await
            .map_err(|e| {
                tracing::error!(%endpoint, error = %e, "connecting to node for activation failed");
                e
            })?;

        let disk_key = self
            .core
            .get_data_key(activation.disk_uuid(), 32)
            .await
            .map_err(|e| {
                tracing::error!(%endpoint, error = %e, "failed to derive node's disk key");
                e
            })?;
        activation.send_disk_key(disk_key).await
    }
}
