//! Additional coordinators.

use super::{ApiInner, Progress};
use crate::api::proto::{
    ActivateAdditionalCoordinatorRequest, ActivateAdditionalCoordinatorResponse,
    ActivateAsAdditionalCoordinatorRequest, ActivateAsAdditionalCoordinatorResponse, PublicPeer,
    TriggerCoordinatorUpdateResponse,
};
use crate::core::error::{internal, CoordinatorError, CoordinatorResult};
use crate::net::DialMode;
use crate::peer::{Peer, Role};
use crate::state::State;
use std::sync::atomic::Ordering;

impl ApiInner {
    /// Activate this peer as an additional coordinator of a running cluster.
    pub(super) async fn activate_as_additional_coordinator(
        &self,
        req: ActivateAsAdditionalCoordinatorRequest,
    ) -> CoordinatorResult<ActivateAsAdditionalCoordinatorResponse> {
        let _guard = self.api_lock.lock().await;
        tracing::info!("ActivateAsAdditionalCoordinator called");
        self.core.require_state(&[State::AcceptingInit]).map_err(|e| {
            CoordinatorError::failed_precondition(format!("node is not in required state: {}", e))
        })?;
        let activating = req.activating_coordinator_data.clone().ok_or_else(|| {
            CoordinatorError::invalid_argument("missing activating coordinator data")
        })?;

        let result = self.join_as_coordinator(&req, &activating).await;
        self.fail_on_error(result)?;
        Ok(ActivateAsAdditionalCoordinatorResponse {})
    }

    async fn join_as_coordinator(
        &self,
        req: &ActivateAsAdditionalCoordinatorRequest,
        activating: &PublicPeer,
    ) -> CoordinatorResult<()> {
        let core = &self.core;
        // Nothing that executes on behalf of the caller may run before this.
        core.advance_state(State::ActivatingNodes, Some(&req.owner_id), Some(&req.cluster_id))
            .map_err(internal("advance state to ActivatingNodes"))?;

        core.set_vpn_ip(&req.assigned_vpn_ip)
            .await
            .map_err(internal("set VPN IP address"))?;
        core.add_peer_to_vpn(&Peer::from(activating))
            .await
            .map_err(internal("adding activating coordinator to VPN"))?;
        self.vpn_server
            .listen(&format!("{}:{}", req.assigned_vpn_ip, self.options.vpn_api_port))
            .await
            .map_err(internal("start in-VPN API server"))?;

        tracing::info!("retrieving Kubernetes join information");
        let vpn_client = self.vpn_client(&activating.vpn_ip);
        let certificate_key = vpn_client
            .get_k8s_certificate_key()
            .await
            .map_err(internal("get Kubernetes certificate key"))?;
        let join_args = vpn_client
            .get_k8s_join_args()
            .await
            .map_err(internal("get Kubernetes join args"))?;

        // Every other control-plane node must be reachable before the join.
        core.update_peers(&Peer::from_public_proto(&req.peers))
            .await
            .map_err(internal("add peers to VPN"))?;
        tracing::info!("joining the Kubernetes cluster");
        core.join_cluster(join_args, Some(certificate_key), Role::Coordinator)
            .await
            .map_err(internal("joining Kubernetes cluster"))?;

        core.switch_to_persistent_store()
            .await
            .map_err(internal("switch to persistent store"))?;
        tracing::info!("transition to persistent store successful");

        let kms_info = core.get_kms_info().await.map_err(internal("get KMS info"))?;
        core.set_up_kms(
            &kms_info.storage_uri,
            &kms_info.kms_uri,
            &kms_info.key_encryption_key_id,
            false,
        )
        .await
        .map_err(internal("setting up KMS"))?;

        core.persist_node_state(Role::Coordinator, &req.owner_id, &req.cluster_id)
            .await
            .map_err(internal("persist node state"))?;
        self.rekey_own_disk().await?;

        let own_peer = self
            .own_coordinator_peer(&req.assigned_vpn_ip)
            .await
            .map_err(internal("assembling coordinator peer"))?;
        core.add_peer_to_store(&own_peer)
            .await
            .map_err(internal("adding new coordinator to persistent store"))?;

        let (resource_version, peers) = core.get_peers(0).await.map_err(internal("get peers from store"))?;
        core.update_vpn_peers(&peers)
            .await
            .map_err(internal("synchronizing peers with VPN state"))?;
        self.resource_version.store(resource_version, Ordering::SeqCst);

        self.trigger_updates(&peers, &own_peer.vpn_ip, true).await;
        Ok(())
    }

    /// Bring up another coordinator at `coordinator_public_endpoint`.
    pub(super) async fn activate_additional_coordinator(
        &self,
        req: ActivateAdditionalCoordinatorRequest,
    ) -> CoordinatorResult<ActivateAdditionalCoordinatorResponse> {
        let _guard = self.api_lock.lock().await;
        if let Err(e) = self.activate_coordinator(&req.coordinator_public_endpoint).await {
            tracing::error!(error = %e, "coordinator activation failed");
            return Err(CoordinatorError::internal(format!("activate new coordinator: {}", e)));
        }
        Ok(ActivateAdditionalCoordinatorResponse {})
    }

    pub(super) async fn activate_coordinators(
        &self,
        progress: &mut Progress<'_>,
        endpoints: &[String],
    ) -> CoordinatorResult<()> {
        for (num, endpoint) in endpoints.iter().enumerate() {
            progress
                .log(format!(
                    "Activating control-plane node {:3} out of {:3} ...",
                    num + 2,
                    endpoints.len() + 1
                ))
                .await;
            self.activate_coordinator(endpoint).await?;
        }
        Ok(())
    }

    async fn activate_coordinator(&self, endpoint: &str) -> CoordinatorResult<()> {
        self.core
            .require_state(&[State::ActivatingNodes])
            .map_err(|e| CoordinatorError::failed_precondition(format!("coordinator is not in required state: {}", e)))?;
        let assigned_vpn_ip = self.core.get_next_coordinator_ip().await?;
        let own_vpn_ip = self.core.get_interface_ip().await?;
        let own_peer = self.own_coordinator_peer(&own_vpn_ip).await?;
        let (owner_id, cluster_id) = self.core.get_ids(None).await?;
        let (_, peers) = self.core.get_peers(0).await?;

        let client = self.public_client(endpoint, DialMode::Verified);
        let vpn_pub_key = client.get_peer_vpn_public_key().await.map_err(|e| {
            tracing::error!(error = %e, %endpoint, "failed to get VPN public key from new coordinator");
            e
        })?;
        self.core
            .add_peer(&Peer {
                public_endpoint: client.endpoint().to_string(),
                vpn_ip: assigned_vpn_ip.clone(),
                vpn_pub_key,
                role: Role::Coordinator,
            })
            .await?;
        self.trigger_updates(&peers, &own_vpn_ip, false).await;

        client
            .activate_as_additional_coordinator(&ActivateAsAdditionalCoordinatorRequest {
                assigned_vpn_ip,
                activating_coordinator_data: Some(PublicPeer::from(&own_peer)),
                peers: Peer::to_public_proto(&peers),
                owner_id,
                cluster_id,
            })
            .await
    }

    /// Apply the persisted peer set to the local VPN driver if it changed.
    pub(super) async fn trigger_coordinator_update(&self) -> CoordinatorResult<TriggerCoordinatorUpdateResponse> {
        self.core.require_state(&[State::ActivatingNodes]).map_err(|e| {
            CoordinatorError::failed_precondition(format!(
                "coordinator is not in required state for updating state: {}",
                e
            ))
        })?;
        let applied = self.resource_version.load(Ordering::SeqCst);
        let (resource_version, peers) = self
            .core
            .get_peers(applied)
            .await
            .map_err(internal("get peers from store"))?;
        if resource_version == applied {
            tracing::info!("resource version identical, no need to update");
            return Ok(TriggerCoordinatorUpdateResponse {});
        }
        self.core
            .update_vpn_peers(&peers)
            .await
            .map_err(internal("synchronizing peers with VPN state"))?;
        self.resource_version.store(resource_version, Ordering::SeqCst);
        Ok(TriggerCoordinatorUpdateResponse {})
    }
}
