//! Node side: activation, cluster join and peer updates.
//!
//! ```text
//! coordinator                         node
//!     | initial request  ------------>  |  advance to NodeWaitingForClusterJoin,
//!     |                                 |  set VPN IP, seed peers, persist state
//!     |   <------------  state disk UUID |
//!     | state disk key   ------------>  |  update disk passphrase, start update loop
//!     |   <------------  VPN public key  |
//! ```

use super::ApiInner;
use crate::api::proto::{
    activate_as_node_request, activate_as_node_response, ActivateAsNodeInitialRequest,
    ActivateAsNodeRequest, ActivateAsNodeResponse, JoinClusterRequest, JoinClusterResponse,
    TriggerNodeUpdateResponse,
};
use crate::api::rpc::{decode, ServerStream};
use crate::core::error::{internal, CoordinatorError, CoordinatorResult};
use crate::peer::{Peer, Role};
use crate::state::State;
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle of the periodic peer update worker.
pub struct UpdateLoop {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl UpdateLoop {
    /// Signal the worker and wait until it has exited.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "update loop task panicked");
        }
    }
}

impl ApiInner {
    /// Activate this peer as a node.
    pub(super) async fn activate_as_node(
        self: &Arc<Self>,
        payload: Bytes,
        stream: &mut ServerStream,
    ) -> CoordinatorResult<()> {
        let _guard = self.api_lock.lock().await;

        self.core.require_state(&[State::AcceptingInit]).map_err(|e| {
            CoordinatorError::failed_precondition(format!(
                "node is not in required state for activation: {}",
                e
            ))
        })?;

        let initial = match decode::<ActivateAsNodeRequest>(payload)?.request {
            Some(activate_as_node_request::Request::InitialRequest(initial)) => initial,
            _ => {
                return Err(CoordinatorError::internal(
                    "expected initial request but got different message type",
                ))
            }
        };
        if initial.owner_id.is_empty() || initial.cluster_id.is_empty() {
            tracing::error!("missing data to taint worker node as initialized");
            return Err(CoordinatorError::invalid_argument(
                "missing data to taint worker node as initialized",
            ));
        }

        let result = self.run_node_activation(initial, stream).await;
        self.fail_on_error(result)
    }

    async fn run_node_activation(
        self: &Arc<Self>,
        initial: ActivateAsNodeInitialRequest,
        stream: &mut ServerStream,
    ) -> CoordinatorResult<()> {
        let core = &self.core;
        // Nothing that executes on behalf of the caller may run before this.
        core.advance_state(
            State::NodeWaitingForClusterJoin,
            Some(&initial.owner_id),
            Some(&initial.cluster_id),
        )
        .map_err(internal("advance node state"))?;

        let vpn_pub_key = core.get_vpn_pub_key().await.map_err(internal("get VPN public key"))?;
        core.set_vpn_ip(&initial.node_vpn_ip)
            .await
            .map_err(internal("setting node VPN IP address"))?;
        core.update_peers(&Peer::from_public_proto(&initial.peers))
            .await
            .map_err(internal("synchronizing peers with VPN state"))?;
        core.persist_node_state(Role::Node, &initial.owner_id, &initial.cluster_id)
            .await
            .map_err(internal("persist node state"))?;

        let disk_uuid = core.get_disk_uuid().await.map_err(internal("get disk uuid"))?;
        stream
            .send(&ActivateAsNodeResponse {
                response: Some(activate_as_node_response::Response::StateDiskUuid(disk_uuid)),
            })
            .await
            .map_err(internal("send state disk uuid"))?;

        let disk_key = match stream
            .recv::<ActivateAsNodeRequest>()
            .await
            .map_err(internal("could not receive state disk key from coordinator"))?
            .request
        {
            Some(activate_as_node_request::Request::StateDiskKey(key)) => key,
            _ => {
                return Err(CoordinatorError::internal(
                    "expected state disk key but got different message type",
                ))
            }
        };
        if disk_key.is_empty() {
            return Err(CoordinatorError::internal(
                "empty state disk key message from coordinator",
            ));
        }
        core.update_disk_passphrase(&disk_key)
            .await
            .map_err(internal("update disk passphrase"))?;

        self.start_update_loop();

        stream
            .send(&ActivateAsNodeResponse {
                response: Some(activate_as_node_response::Response::NodeVpnPubKey(vpn_pub_key)),
            })
            .await
            .map_err(internal("send VPN public key"))
    }

    /// Join the Kubernetes cluster using arguments from the coordinator.
    pub(super) async fn join_cluster(&self, req: JoinClusterRequest) -> CoordinatorResult<JoinClusterResponse> {
        let _guard = self.api_lock.lock().await;
        self.core
            .require_state(&[State::NodeWaitingForClusterJoin])
            .map_err(|e| {
                CoordinatorError::failed_precondition(format!(
                    "node is not in required state for cluster join: {}",
                    e
                ))
            })?;

        let args = self
            .vpn_client(&req.coordinator_vpn_ip)
            .get_k8s_join_args()
            .await
            .map_err(|e| match e {
                CoordinatorError::Unavailable { message } => {
                    CoordinatorError::unavailable(format!("dial coordinator: {}", message))
                }
                other => CoordinatorError::internal(format!("request K8s join string: {}", other)),
            })?;

        if let Err(e) = self.core.join_cluster(args, None, Role::Node).await {
            let e = CoordinatorError::internal(format!("joining Kubernetes cluster: {}", e));
            return self.fail_on_error(Err(e));
        }
        self.core
            .advance_state(State::IsNode, None, None)
            .map_err(internal("advance state to IsNode"))?;
        Ok(JoinClusterResponse {})
    }

    /// Pull peers from the coordinator once.
    pub(super) async fn trigger_node_update(&self) -> CoordinatorResult<TriggerNodeUpdateResponse> {
        self.core.require_state(&[State::IsNode]).map_err(|e| {
            CoordinatorError::failed_precondition(format!(
                "node is not in required state for receiving update command: {}",
                e
            ))
        })?;
        self.update().await.map_err(internal("node update"))?;
        Ok(TriggerNodeUpdateResponse {})
    }

    /// One update step: fetch peers newer than the applied resource version
    /// and hand them to the Core.
    async fn update(&self) -> CoordinatorResult<()> {
        let _guard = self.api_lock.lock().await;
        let coordinator_ip = self.core.get_coordinator_vpn_ip().await?;
        let applied = self.resource_version.load(Ordering::SeqCst);
        let (resource_version, peers) = self.vpn_client(&coordinator_ip).get_update(applied).await?;
        if resource_version == applied {
            return Ok(());
        }
        self.core.update_peers(&peers).await?;
        self.resource_version.store(resource_version, Ordering::SeqCst);
        tracing::debug!(resource_version, peers = peers.len(), "applied peer update");
        Ok(())
    }

    /// Start the periodic update worker unless it is already running.
    fn start_update_loop(self: &Arc<Self>) {
        let mut slot = self.update_loop.lock();
        if slot.is_some() {
            return;
        }
        let (stop, mut stopped) = watch::channel(false);
        let api = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(api.options.update_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    result = api.update() => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "update loop: update failed");
                        }
                    }
                }
            }
            tracing::debug!("update loop stopped");
        });
        *slot = Some(UpdateLoop { stop, task });
    }
}
