//! The Core: sole owner of the store, the VPN driver and the KMS handle.
//!
//! Both API servers act on the peer exclusively through this type. Every
//! mutation of the peer set runs in a store transaction that also bumps the
//! peers resource version, so readers can ask "anything new since version N?"
//! and get a consistent answer.

use super::collaborators::{
    ClusterBootstrap, EncryptedDisk, InitClusterRequest, JoinArgs, JoinClusterRequest, Vpn,
};
use super::node_state::NodeState;
use crate::core::error::{CoordinatorError, CoordinatorResult};
use crate::kms::{derive_key, CloudKms, KmsInfo, KmsProvider};
use crate::net::tcp::{host_of, is_host_port};
use crate::peer::{Peer, Role};
use crate::state::{State, StateMachine};
use crate::store::wrapper::{StoreWrapper, VpnIpRanges};
use crate::store::{PersistentStoreFactory, Store};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const OWNER_ID_SALT: &[u8] = b"Constellation";
const OWNER_ID_INFO: &[u8] = b"id";
const ID_LEN: usize = 32;
const VPN_PRIVATE_KEY_LEN: usize = 32;

/// Collaborators handed to [`Core::new`].
pub struct CoreDeps {
    pub vpn: Arc<dyn Vpn>,
    pub cluster: Arc<dyn ClusterBootstrap>,
    pub disk: Arc<dyn EncryptedDisk>,
    pub kms_provider: Arc<dyn KmsProvider>,
    /// Store used until [`Core::switch_to_persistent_store`].
    pub store: Arc<dyn Store>,
    pub persistent_store: Arc<dyn PersistentStoreFactory>,
}

#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub ranges: VpnIpRanges,
    pub node_state_path: PathBuf,
    /// Used when no coordinator is known from the peer registry.
    pub coordinator_vpn_ip_fallback: String,
    /// Kubernetes node name; derived from the VPN IP when empty.
    pub node_name: String,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            ranges: VpnIpRanges::default(),
            node_state_path: PathBuf::from("/run/state/constellation/node_state.json"),
            coordinator_vpn_ip_fallback: "10.118.0.1".to_string(),
            node_name: String::new(),
        }
    }
}

/// Lowercase `name` and replace underscores so Kubernetes accepts it.
pub fn k8s_compliant_hostname(name: &str) -> String {
    name.replace('_', "-").to_lowercase()
}

pub struct Core {
    state: StateMachine,
    store: RwLock<Arc<dyn Store>>,
    /// Writers hold it shared; the store switch holds it exclusively.
    store_gate: tokio::sync::RwLock<()>,
    switched: AtomicBool,
    persistent_store: Arc<dyn PersistentStoreFactory>,
    vpn: Arc<dyn Vpn>,
    cluster: Arc<dyn ClusterBootstrap>,
    disk: Arc<dyn EncryptedDisk>,
    kms_provider: Arc<dyn KmsProvider>,
    kms: RwLock<Option<Arc<dyn CloudKms>>>,
    cluster_ids: RwLock<Option<(Vec<u8>, Vec<u8>)>>,
    heartbeats: Mutex<HashMap<String, DateTime<Utc>>>,
    options: CoreOptions,
}

impl Core {
    /// Build the Core, bump the peers resource version and bring up the VPN
    /// with a fresh private key.
    pub async fn new(deps: CoreDeps, options: CoreOptions) -> CoordinatorResult<Self> {
        let core = Self {
            state: StateMachine::new(),
            store: RwLock::new(deps.store),
            store_gate: tokio::sync::RwLock::new(()),
            switched: AtomicBool::new(false),
            persistent_store: deps.persistent_store,
            vpn: deps.vpn,
            cluster: deps.cluster,
            disk: deps.disk,
            kms_provider: deps.kms_provider,
            kms: RwLock::new(None),
            cluster_ids: RwLock::new(None),
            heartbeats: Mutex::new(HashMap::new()),
            options,
        };

        {
            let store = core.store();
            core.wrap(store.as_ref())
                .increment_peers_resource_version()
                .await?;
        }

        let mut private_key = vec![0u8; VPN_PRIVATE_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut private_key);
        core.vpn.setup(&private_key).await?;
        Ok(core)
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    /// Current store handle.
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.read().clone()
    }

    pub fn is_persistent(&self) -> bool {
        self.switched.load(Ordering::SeqCst)
    }

    fn wrap<'a, S: crate::store::KeyValueAccess + ?Sized>(&self, store: &'a S) -> StoreWrapper<'a, S> {
        StoreWrapper::new(store).with_ranges(self.options.ranges)
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn get_state(&self) -> State {
        self.state.get()
    }

    pub fn require_state(&self, allowed: &[State]) -> CoordinatorResult<()> {
        self.state.require(allowed)
    }

    /// Advance the lifecycle. Leaving `AcceptingInit` for anything but
    /// `Failed` binds the peer to the given cluster identity.
    pub fn advance_state(
        &self,
        next: State,
        owner_id: Option<&[u8]>,
        cluster_id: Option<&[u8]>,
    ) -> CoordinatorResult<()> {
        if next != State::Failed && self.state.get() == State::AcceptingInit {
            if let (Some(owner), Some(cluster)) = (owner_id, cluster_id) {
                *self.cluster_ids.write() = Some((owner.to_vec(), cluster.to_vec()));
            }
        }
        self.state.advance(next)?;
        tracing::info!(state = %next, "advanced state");
        Ok(())
    }

    /// Owner and cluster ID this peer was activated with.
    pub fn cluster_ids(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.cluster_ids.read().clone()
    }

    // ========================================================================
    // VPN
    // ========================================================================

    pub async fn get_vpn_pub_key(&self) -> CoordinatorResult<Vec<u8>> {
        self.vpn.get_public_key().await
    }

    pub async fn set_vpn_ip(&self, ip: &str) -> CoordinatorResult<()> {
        self.vpn.set_interface_ip(ip).await
    }

    pub async fn get_interface_ip(&self) -> CoordinatorResult<String> {
        self.vpn.get_interface_ip().await
    }

    /// VPN IP of a coordinator to pull updates from.
    ///
    /// Taken from the peer registry; the configured fallback applies until a
    /// coordinator peer is known.
    pub async fn get_coordinator_vpn_ip(&self) -> CoordinatorResult<String> {
        let store = self.store();
        let peers = self.wrap(store.as_ref()).get_peers().await?;
        let mut coordinators: Vec<Ipv4Addr> = peers
            .iter()
            .filter(|p| p.role == Role::Coordinator)
            .filter_map(|p| p.vpn_ip.parse().ok())
            .collect();
        coordinators.sort();
        Ok(coordinators
            .first()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| self.options.coordinator_vpn_ip_fallback.clone()))
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Prime the VPN IP cursors of a fresh cluster.
    pub async fn initialize_store_ips(&self) -> CoordinatorResult<()> {
        let _gate = self.store_gate.read().await;
        let store = self.store();
        let tx = store.begin_transaction().await?;
        self.wrap(tx.as_ref()).initialize_store_ips().await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_next_node_ip(&self) -> CoordinatorResult<String> {
        let _gate = self.store_gate.read().await;
        let store = self.store();
        let tx = store.begin_transaction().await?;
        let ip = self.wrap(tx.as_ref()).pop_next_free_node_ip().await?;
        tx.commit().await?;
        Ok(ip.to_string())
    }

    pub async fn get_next_coordinator_ip(&self) -> CoordinatorResult<String> {
        let _gate = self.store_gate.read().await;
        let store = self.store();
        let tx = store.begin_transaction().await?;
        let ip = self.wrap(tx.as_ref()).pop_next_free_coordinator_ip().await?;
        tx.commit().await?;
        Ok(ip.to_string())
    }

    /// Register an admin key and return its VPN IP.
    ///
    /// The address is popped and the admin stored in one transaction; on
    /// failure the address stays free.
    pub async fn add_admin(&self, pub_key: &[u8]) -> CoordinatorResult<String> {
        let _gate = self.store_gate.read().await;
        let store = self.store();
        let tx = store.begin_transaction().await?;
        let result: CoordinatorResult<String> = async {
            let data = self.wrap(tx.as_ref());
            let admin = Peer {
                public_endpoint: String::new(),
                vpn_ip: data.pop_next_free_node_ip().await?.to_string(),
                vpn_pub_key: pub_key.to_vec(),
                role: Role::Admin,
            };
            self.add_peer_to_vpn(&admin).await?;
            data.put_peer(&admin).await?;
            data.increment_peers_resource_version().await?;
            Ok(admin.vpn_ip)
        }
        .await;

        match result {
            Ok(vpn_ip) => {
                tx.commit().await?;
                tracing::debug!(%vpn_ip, "stored admin");
                Ok(vpn_ip)
            }
            Err(e) => {
                tx.rollback().await;
                Err(e)
            }
        }
    }

    pub async fn add_peer(&self, peer: &Peer) -> CoordinatorResult<()> {
        self.add_peer_to_vpn(peer).await?;
        self.add_peer_to_store(peer).await
    }

    /// Add `peer` to the VPN driver unless it is this peer.
    pub async fn add_peer_to_vpn(&self, peer: &Peer) -> CoordinatorResult<()> {
        let is_admin = peer.role == Role::Admin && peer.public_endpoint.is_empty();
        if !is_admin && !is_host_port(&peer.public_endpoint) {
            return Err(CoordinatorError::invalid_argument(format!(
                "peer {} has invalid public endpoint {:?}",
                peer.vpn_ip, peer.public_endpoint
            )));
        }
        let own_ip = self.vpn.get_interface_ip().await?;
        if own_ip == peer.vpn_ip {
            return Ok(());
        }
        self.vpn
            .add_peer(&peer.vpn_pub_key, host_of(&peer.public_endpoint), &peer.vpn_ip)
            .await
    }

    pub async fn add_peer_to_store(&self, peer: &Peer) -> CoordinatorResult<()> {
        let _gate = self.store_gate.read().await;
        let store = self.store();
        let tx = store.begin_transaction().await?;
        let data = self.wrap(tx.as_ref());
        data.put_peer(peer).await?;
        let version = data.increment_peers_resource_version().await?;
        tx.commit().await?;
        tracing::debug!(vpn_ip = %peer.vpn_ip, role = %peer.role, version, "stored peer");
        Ok(())
    }

    /// Make the stored peer set and the VPN driver match `peers`.
    ///
    /// This peer is excluded. Nothing changes, and the resource version stays,
    /// when the set is already current; a VPN failure leaves the store as it
    /// was.
    pub async fn update_peers(&self, peers: &[Peer]) -> CoordinatorResult<()> {
        let own_ip = self.vpn.get_interface_ip().await?;
        let peers: Vec<Peer> = peers.iter().filter(|p| p.vpn_ip != own_ip).cloned().collect();

        let _gate = self.store_gate.read().await;
        let store = self.store();
        let tx = store.begin_transaction().await?;
        let data = self.wrap(tx.as_ref());
        let (added, removed) = data.update_peers(&peers).await?;
        if added.is_empty() && removed.is_empty() {
            tx.rollback().await;
            return Ok(());
        }

        if let Err(e) = self.vpn.update_peers(&peers).await {
            tx.rollback().await;
            return Err(e);
        }
        let version = data.increment_peers_resource_version().await?;
        tx.commit().await?;
        tracing::info!(
            added = added.len(),
            removed = removed.len(),
            version,
            "updated peers"
        );
        Ok(())
    }

    /// Point the VPN driver at `peers` without touching the store.
    pub async fn update_vpn_peers(&self, peers: &[Peer]) -> CoordinatorResult<()> {
        let own_ip = self.vpn.get_interface_ip().await?;
        let peers: Vec<Peer> = peers.iter().filter(|p| p.vpn_ip != own_ip).cloned().collect();
        self.vpn.update_peers(&peers).await
    }

    /// Decommission `peer`: drop its record, free its VPN IP, remove it from
    /// the VPN driver.
    pub async fn remove_peer(&self, peer: &Peer) -> CoordinatorResult<()> {
        {
            let _gate = self.store_gate.read().await;
            let store = self.store();
            let tx = store.begin_transaction().await?;
            let data = self.wrap(tx.as_ref());
            data.remove_peer(peer).await?;
            data.increment_peers_resource_version().await?;
            if let Some(pool) = peer.vpn_ip.parse().ok().and_then(|ip| data.pool_of(ip)) {
                data.put_freed_ip(pool, &peer.vpn_ip).await?;
            }
            tx.commit().await?;
        }
        self.vpn.remove_peer(&peer.vpn_pub_key).await?;
        tracing::info!(vpn_ip = %peer.vpn_ip, "removed peer");
        Ok(())
    }

    /// Current resource version and, if it differs from `resource_version`,
    /// all peers. Both come from one transaction.
    pub async fn get_peers(&self, resource_version: u64) -> CoordinatorResult<(u64, Vec<Peer>)> {
        let store = self.store();
        let tx = store.begin_transaction().await?;
        let data = self.wrap(tx.as_ref());
        let current = data.get_peers_resource_version().await?;
        if current == resource_version {
            tx.rollback().await;
            return Ok((current, Vec::new()));
        }
        let peers = data.get_peers().await?;
        tx.rollback().await;
        Ok((current, peers))
    }

    // ========================================================================
    // Identity and keys
    // ========================================================================

    /// Owner and cluster ID.
    ///
    /// With a master secret, stores it together with a fresh random cluster
    /// ID; without one, reads both back. The owner ID is derived from the
    /// secret.
    pub async fn get_ids(&self, master_secret: Option<&[u8]>) -> CoordinatorResult<(Vec<u8>, Vec<u8>)> {
        let store = self.store();
        let data = self.wrap(store.as_ref());
        let (secret, cluster_id) = match master_secret {
            Some(secret) => {
                let _gate = self.store_gate.read().await;
                let mut cluster_id = vec![0u8; ID_LEN];
                rand::thread_rng().fill_bytes(&mut cluster_id);
                data.put_master_secret(secret).await?;
                data.put_cluster_id(&cluster_id).await?;
                (secret.to_vec(), cluster_id)
            }
            None => (data.get_master_secret().await?, data.get_cluster_id().await?),
        };
        let owner_id = derive_key(&secret, OWNER_ID_SALT, OWNER_ID_INFO, ID_LEN)?;
        Ok((owner_id, cluster_id))
    }

    /// Select the KMS by URI and, unless reusing an existing KEK, import the
    /// master secret as KEK and persist the KMS configuration.
    pub async fn set_up_kms(
        &self,
        storage_uri: &str,
        kms_uri: &str,
        kek_id: &str,
        use_existing_kek: bool,
    ) -> CoordinatorResult<()> {
        let kms = self.kms_provider.setup(storage_uri, kms_uri).await?;
        *self.kms.write() = Some(kms.clone());
        if use_existing_kek {
            return Ok(());
        }

        let store = self.store();
        let data = self.wrap(store.as_ref());
        let master_secret = data.get_master_secret().await?;
        kms.create_kek(kek_id, &master_secret).await?;

        let _gate = self.store_gate.read().await;
        data.put_kek_id(kek_id).await?;
        data.put_kms_data(&KmsInfo {
            kms_uri: kms_uri.to_string(),
            storage_uri: storage_uri.to_string(),
            key_encryption_key_id: kek_id.to_string(),
        })
        .await?;
        tracing::info!(kek_id, "KMS set up");
        Ok(())
    }

    pub async fn get_kms_info(&self) -> CoordinatorResult<KmsInfo> {
        let store = self.store();
        self.wrap(store.as_ref()).get_kms_data().await
    }

    pub async fn get_data_key(&self, key_id: &str, length: usize) -> CoordinatorResult<Vec<u8>> {
        let kms = self
            .kms
            .read()
            .clone()
            .ok_or_else(|| CoordinatorError::kms("KMS not set up"))?;
        let store = self.store();
        let kek_id = self.wrap(store.as_ref()).get_kek_id().await?;
        kms.get_dek(&kek_id, key_id, length).await
    }

    // ========================================================================
    // Store promotion
    // ========================================================================

    /// Replace the in-memory store with the replicated one.
    ///
    /// All Core writers are held off while the committed state is copied, so
    /// the new store starts with exactly the old store's contents. Allowed
    /// once.
    pub async fn switch_to_persistent_store(&self) -> CoordinatorResult<()> {
        let _gate = self.store_gate.write().await;
        if self.switched.load(Ordering::SeqCst) {
            return Err(CoordinatorError::failed_precondition(
                "already switched to the persistent store",
            ));
        }
        let target: Arc<dyn Store> = Arc::from(self.persistent_store.create().await?);
        let prior = self.resource_version_or_zero(target.as_ref()).await?;
        let source = self.store();
        source.transfer(target.as_ref()).await?;

        // The copied version may be older than the one already replicated.
        let tx = target.begin_transaction().await?;
        let copied = self.resource_version_or_zero(tx.as_ref()).await?;
        let data = self.wrap(tx.as_ref());
        data.put_peers_resource_version(copied.max(prior)).await?;
        data.increment_peers_resource_version().await?;
        tx.commit().await?;

        *self.store.write() = target;
        self.switched.store(true, Ordering::SeqCst);
        tracing::info!("switched to persistent store");
        Ok(())
    }

    async fn resource_version_or_zero<S: crate::store::KeyValueAccess + ?Sized>(
        &self,
        store: &S,
    ) -> CoordinatorResult<u64> {
        match self.wrap(store).get_peers_resource_version().await {
            Ok(version) => Ok(version),
            Err(e) if e.is_value_unset() => Ok(0),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Kubernetes
    // ========================================================================

    /// Kubernetes node name of this peer.
    pub async fn k8s_node_name(&self) -> CoordinatorResult<String> {
        if !self.options.node_name.is_empty() {
            return Ok(k8s_compliant_hostname(&self.options.node_name));
        }
        let ip = self.vpn.get_interface_ip().await?;
        Ok(k8s_compliant_hostname(&format!("peer-{}", ip.replace('.', "-"))))
    }

    /// Initialize the first control-plane node; returns and stores the
    /// kubeconfig.
    pub async fn init_cluster(
        &self,
        autoscaling_node_groups: &[String],
        cloud_service_account_uri: &str,
    ) -> CoordinatorResult<Vec<u8>> {
        let request = InitClusterRequest {
            autoscaling_node_groups: autoscaling_node_groups.to_vec(),
            cloud_service_account_uri: cloud_service_account_uri.to_string(),
            vpn_ip: self.vpn.get_interface_ip().await?,
            node_name: self.k8s_node_name().await?,
        };
        let kubeconfig = self.cluster.init_cluster(request).await?;
        let _gate = self.store_gate.read().await;
        let store = self.store();
        self.wrap(store.as_ref()).put_kubeconfig(&kubeconfig).await?;
        Ok(kubeconfig)
    }

    pub async fn join_cluster(
        &self,
        args: JoinArgs,
        certificate_key: Option<String>,
        role: Role,
    ) -> CoordinatorResult<()> {
        let request = JoinClusterRequest {
            args,
            node_name: self.k8s_node_name().await?,
            vpn_ip: self.vpn.get_interface_ip().await?,
            certificate_key,
            role,
        };
        self.cluster.join_cluster(request).await
    }

    /// Fresh join arguments; the latest are kept in the store.
    pub async fn get_k8s_join_args(&self) -> CoordinatorResult<JoinArgs> {
        let args = self.cluster.get_join_args().await?;
        let _gate = self.store_gate.read().await;
        let store = self.store();
        self.wrap(store.as_ref()).put_kubernetes_join_args(&args).await?;
        Ok(args)
    }

    pub async fn get_k8s_certificate_key(&self) -> CoordinatorResult<String> {
        self.cluster.get_certificate_key().await
    }

    // ========================================================================
    // Local node
    // ========================================================================

    pub async fn persist_node_state(
        &self,
        role: Role,
        owner_id: &[u8],
        cluster_id: &[u8],
    ) -> CoordinatorResult<()> {
        let state = NodeState {
            role,
            vpn_ip: self.vpn.get_interface_ip().await?,
            vpn_private_key: self.vpn.get_private_key().await?,
            owner_id: owner_id.to_vec(),
            cluster_id: cluster_id.to_vec(),
        };
        state.to_file(&self.options.node_state_path)?;
        tracing::debug!(path = %self.options.node_state_path.display(), "persisted node state");
        Ok(())
    }

    pub async fn get_disk_uuid(&self) -> CoordinatorResult<String> {
        self.disk.uuid().await
    }

    pub async fn update_disk_passphrase(&self, passphrase: &[u8]) -> CoordinatorResult<()> {
        self.disk.update_passphrase(passphrase).await
    }

    // ========================================================================
    // Heartbeats
    // ========================================================================

    pub fn notify_node_heartbeat(&self, addr: &str) {
        self.heartbeats.lock().insert(addr.to_string(), Utc::now());
    }

    /// Last contact time per caller address.
    pub fn last_heartbeats(&self) -> HashMap<String, DateTime<Utc>> {
        self.heartbeats.lock().clone()
    }
}
