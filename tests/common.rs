//! Common test utilities.
//!
//! Peers run inside one process on an in-memory network. Public endpoints
//! are reachable by everyone; VPN addresses only between peers whose fake VPN
//! drivers list each other. Import with `mod common;` in test files.

#![allow(dead_code)]

use async_trait::async_trait;
use coordinator::api::proto::ActivateAsCoordinatorRequest;
use coordinator::api::{ApiOptions, PublicApi, PublicClient, RpcServer, VpnApiServerHandle, VpnClient};
use coordinator::control::collaborators::{
    ClusterBootstrap, InitClusterRequest, JoinArgs, JoinClusterRequest, Vpn,
};
use coordinator::control::dev::DevDisk;
use coordinator::control::{Core, CoreDeps, CoreOptions};
use coordinator::core::error::{CoordinatorError, CoordinatorResult};
use coordinator::kms::UriKmsProvider;
use coordinator::net::attestation::{DummyIssuer, DummyValidator};
use coordinator::net::tcp::host_of;
use coordinator::net::{atls, BoxedStream, DialMode, Dialer, NetListener, Network};
use coordinator::peer::Peer;
use coordinator::state::State;
use coordinator::store::memory::MemoryStore;
use coordinator::store::{PersistentStoreFactory, Store, StoreResult};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const MASTER_SECRET: &[u8] = b"Constellation";
pub const ADMIN_VPN_PUB_KEY: &[u8] = b"admin-vpn-public-key-32-bytes-ok";

// ============================================================================
// Fake VPN
// ============================================================================

/// A packet delivered through the fake VPN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub from: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct VpnState {
    private_key: Vec<u8>,
    interface_ip: String,
    /// VPN IP to (public key, public IP).
    peers: HashMap<String, (Vec<u8>, String)>,
}

/// VPN driver recording its configuration and received packets.
#[derive(Debug, Default)]
pub struct FakeVpn {
    state: Mutex<VpnState>,
    update_calls: AtomicUsize,
    fail_updates: AtomicBool,
    inbox: Mutex<Vec<Packet>>,
}

impl FakeVpn {
    pub fn interface_ip(&self) -> String {
        self.state.lock().interface_ip.clone()
    }

    pub fn has_peer(&self, vpn_ip: &str) -> bool {
        self.state.lock().peers.contains_key(vpn_ip)
    }

    /// VPN IPs of all configured peers, sorted.
    pub fn peer_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self.state.lock().peers.keys().cloned().collect();
        ips.sort();
        ips
    }

    pub fn peer_key(&self, vpn_ip: &str) -> Option<Vec<u8>> {
        self.state.lock().peers.get(vpn_ip).map(|(key, _)| key.clone())
    }

    /// Number of `update_peers` calls so far.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Packet> {
        self.inbox.lock().clone()
    }

    /// Make every later `update_peers` call fail.
    pub fn fail_peer_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Vpn for FakeVpn {
    async fn setup(&self, private_key: &[u8]) -> CoordinatorResult<()> {
        self.state.lock().private_key = private_key.to_vec();
        Ok(())
    }

    async fn get_private_key(&self) -> CoordinatorResult<Vec<u8>> {
        Ok(self.state.lock().private_key.clone())
    }

    async fn get_public_key(&self) -> CoordinatorResult<Vec<u8>> {
        Ok(Sha256::digest(&self.state.lock().private_key).to_vec())
    }

    async fn get_interface_ip(&self) -> CoordinatorResult<String> {
        let ip = self.interface_ip();
        if ip.is_empty() {
            return Err(CoordinatorError::internal("interface has no address"));
        }
        Ok(ip)
    }

    async fn set_interface_ip(&self, ip: &str) -> CoordinatorResult<()> {
        self.state.lock().interface_ip = ip.to_string();
        Ok(())
    }

    async fn add_peer(&self, pub_key: &[u8], public_ip: &str, vpn_ip: &str) -> CoordinatorResult<()> {
        self.state
            .lock()
            .peers
            .insert(vpn_ip.to_string(), (pub_key.to_vec(), public_ip.to_string()));
        Ok(())
    }

    async fn remove_peer(&self, pub_key: &[u8]) -> CoordinatorResult<()> {
        self.state.lock().peers.retain(|_, (key, _)| key.as_slice() != pub_key);
        Ok(())
    }

    async fn update_peers(&self, peers: &[Peer]) -> CoordinatorResult<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(CoordinatorError::internal("wireguard: device busy"));
        }
        self.state.lock().peers = peers
            .iter()
            .map(|p| {
                (
                    p.vpn_ip.clone(),
                    (p.vpn_pub_key.clone(), host_of(&p.public_endpoint).to_string()),
                )
            })
            .collect();
        Ok(())
    }
}

// ============================================================================
// Fake cluster bootstrap
// ============================================================================

/// Cluster bootstrap recording every init and join.
#[derive(Debug, Default)]
pub struct FakeCluster {
    inits: Mutex<Vec<InitClusterRequest>>,
    joins: Mutex<Vec<JoinClusterRequest>>,
    fail_joins: AtomicBool,
}

impl FakeCluster {
    pub fn inits(&self) -> Vec<InitClusterRequest> {
        self.inits.lock().clone()
    }

    pub fn joins(&self) -> Vec<JoinClusterRequest> {
        self.joins.lock().clone()
    }

    /// Make every later `join_cluster` call fail.
    pub fn fail_joins(&self) {
        self.fail_joins.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterBootstrap for FakeCluster {
    async fn init_cluster(&self, request: InitClusterRequest) -> CoordinatorResult<Vec<u8>> {
        self.inits.lock().push(request);
        Ok(b"kubeconfig".to_vec())
    }

    async fn join_cluster(&self, request: JoinClusterRequest) -> CoordinatorResult<()> {
        self.joins.lock().push(request);
        if self.fail_joins.load(Ordering::SeqCst) {
            return Err(CoordinatorError::internal("kubeadm join: preflight checks failed"));
        }
        Ok(())
    }

    async fn get_join_args(&self) -> CoordinatorResult<JoinArgs> {
        Ok(JoinArgs {
            api_server_endpoint: "10.118.0.1:6443".to_string(),
            token: "kube-fake-token".to_string(),
            ca_cert_hashes: vec!["sha256:0123456789abcdef".to_string()],
        })
    }

    async fn get_certificate_key(&self) -> CoordinatorResult<String> {
        Ok("controlPlaneCertificateKey".to_string())
    }
}

// ============================================================================
// In-memory network
// ============================================================================

type Incoming = (BoxedStream, String);

/// Listener registry and VPN routing shared by all peers of a test.
#[derive(Default)]
pub struct Fabric {
    listeners: Mutex<HashMap<String, (u64, mpsc::UnboundedSender<Incoming>)>>,
    vpns: Mutex<Vec<Arc<FakeVpn>>>,
    next_id: AtomicU64,
}

impl Fabric {
    fn add_vpn(&self, vpn: Arc<FakeVpn>) {
        self.vpns.lock().push(vpn);
    }

    fn vpn_at(&self, ip: &str) -> Option<Arc<FakeVpn>> {
        self.vpns
            .lock()
            .iter()
            .find(|vpn| vpn.interface_ip() == ip)
            .cloned()
    }

    /// Both ends must list each other for traffic to flow.
    pub fn reachable(&self, from: &FakeVpn, to: &FakeVpn) -> bool {
        let from_ip = from.interface_ip();
        let to_ip = to.interface_ip();
        !from_ip.is_empty() && from.has_peer(&to_ip) && to.has_peer(&from_ip)
    }

    /// Send a packet from `from` to `to_ip` over the VPN. Returns whether it
    /// was delivered.
    pub fn send_packet(&self, from: &FakeVpn, to_ip: &str, payload: &[u8]) -> bool {
        let Some(target) = self.vpn_at(to_ip) else {
            return false;
        };
        if !self.reachable(from, &target) {
            return false;
        }
        target.inbox.lock().push(Packet {
            from: from.interface_ip(),
            payload: payload.to_vec(),
        });
        true
    }

    fn register(self: &Arc<Self>, addr: &str) -> CoordinatorResult<MemListener> {
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(addr) {
            return Err(CoordinatorError::internal(format!("address {} in use", addr)));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr.to_string(), (id, tx));
        Ok(MemListener {
            fabric: self.clone(),
            addr: addr.to_string(),
            id,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn connect(&self, addr: &str, source_host: &str) -> CoordinatorResult<BoxedStream> {
        let tx = self
            .listeners
            .lock()
            .get(addr)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| CoordinatorError::unavailable(format!("dial {}: connection refused", addr)))?;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let port = 40000 + self.next_id.fetch_add(1, Ordering::Relaxed) % 20000;
        let server: BoxedStream = Box::new(server);
        tx.send((server, format!("{}:{}", source_host, port)))
            .map_err(|_| CoordinatorError::unavailable(format!("dial {}: connection refused", addr)))?;
        Ok(Box::new(client))
    }
}

fn is_vpn_address(host: &str) -> bool {
    host.parse::<Ipv4Addr>()
        .map(|ip| matches!(ip.octets(), [10, 118, _, _]))
        .unwrap_or(false)
}

struct MemListener {
    fabric: Arc<Fabric>,
    addr: String,
    id: u64,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
}

#[async_trait]
impl NetListener for MemListener {
    async fn accept(&self) -> CoordinatorResult<(BoxedStream, String)> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| CoordinatorError::unavailable("listener closed"))
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

impl Drop for MemListener {
    fn drop(&mut self) {
        let mut listeners = self.fabric.listeners.lock();
        if listeners.get(&self.addr).map(|(id, _)| *id) == Some(self.id) {
            listeners.remove(&self.addr);
        }
    }
}

/// One peer's view of the fabric.
pub struct PeerNetwork {
    fabric: Arc<Fabric>,
    vpn: Arc<FakeVpn>,
    public_host: String,
}

#[async_trait]
impl Network for PeerNetwork {
    async fn listen(&self, addr: &str) -> CoordinatorResult<Box<dyn NetListener>> {
        Ok(Box::new(self.fabric.register(addr)?))
    }

    async fn dial(&self, addr: &str) -> CoordinatorResult<BoxedStream> {
        let host = host_of(addr);
        if !is_vpn_address(host) {
            return self.fabric.connect(addr, &self.public_host);
        }
        let own_ip = self.vpn.interface_ip();
        if own_ip != host {
            let target = self
                .fabric
                .vpn_at(host)
                .ok_or_else(|| CoordinatorError::unavailable(format!("dial {}: no route", addr)))?;
            if !self.fabric.reachable(&self.vpn, &target) {
                return Err(CoordinatorError::unavailable(format!(
                    "dial {}: no VPN route",
                    addr
                )));
            }
        }
        self.fabric.connect(addr, &own_ip)
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Persistent store factory handing out one shared in-memory store.
pub struct SharedStoreFactory(pub MemoryStore);

#[async_trait]
impl PersistentStoreFactory for SharedStoreFactory {
    async fn create(&self) -> StoreResult<Box<dyn Store>> {
        Ok(Box::new(self.0.clone()))
    }
}

// ============================================================================
// Peers
// ============================================================================

/// A running peer: Core, public API server and fakes.
pub struct TestPeer {
    pub endpoint: String,
    pub core: Arc<Core>,
    pub api: Arc<PublicApi>,
    pub vpn: Arc<FakeVpn>,
    pub cluster: Arc<FakeCluster>,
    pub disk: Arc<DevDisk>,
    pub node_state_path: PathBuf,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<CoordinatorResult<()>>,
}

impl TestPeer {
    pub fn state(&self) -> State {
        self.core.get_state()
    }

    pub fn vpn_ip(&self) -> String {
        self.vpn.interface_ip()
    }

    /// Stop the public API server, the update loop and the in-VPN server.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.server.await;
        self.api.close().await;
    }
}

/// A set of peers sharing one fabric and one replicated store.
pub struct TestCluster {
    pub fabric: Arc<Fabric>,
    pub persistent: MemoryStore,
    admin_vpn: Arc<FakeVpn>,
    dir: TempDir,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            fabric: Arc::new(Fabric::default()),
            persistent: MemoryStore::new(),
            admin_vpn: Arc::new(FakeVpn::default()),
            dir: TempDir::new().unwrap(),
        }
    }

    /// Start a peer in AcceptingInit serving its public API on
    /// `<public_ip>:9000`.
    pub async fn spawn_peer(&self, public_ip: &str) -> TestPeer {
        let vpn = Arc::new(FakeVpn::default());
        self.fabric.add_vpn(vpn.clone());
        let network: Arc<dyn Network> = Arc::new(PeerNetwork {
            fabric: self.fabric.clone(),
            vpn: vpn.clone(),
            public_host: public_ip.to_string(),
        });
        let cluster = Arc::new(FakeCluster::default());
        let disk = Arc::new(DevDisk::new(format!("disk-{}", public_ip)));
        let node_state_path = self.dir.path().join(public_ip).join("node_state.json");

        let core = Core::new(
            CoreDeps {
                vpn: vpn.clone(),
                cluster: cluster.clone(),
                disk: disk.clone(),
                kms_provider: Arc::new(UriKmsProvider),
                store: Arc::new(MemoryStore::new()),
                persistent_store: Arc::new(SharedStoreFactory(self.persistent.clone())),
            },
            CoreOptions {
                node_state_path: node_state_path.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        core.advance_state(State::AcceptingInit, None, None).unwrap();
        let core = Arc::new(core);

        let endpoint = format!("{}:9000", public_ip);
        let dialer = Dialer::new(network.clone(), Arc::new(DummyValidator));
        let vpn_server = Arc::new(VpnApiServerHandle::new(core.clone(), network.clone()));
        let api = Arc::new(PublicApi::new(
            core.clone(),
            dialer,
            vpn_server,
            ApiOptions {
                public_endpoint: endpoint.clone(),
                rpc_deadline: Duration::from_secs(10),
                kms_deadline: Duration::from_secs(5),
                // Tests trigger updates explicitly.
                update_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        ));

        let acceptor = atls::server_acceptor(Arc::new(DummyIssuer)).unwrap();
        let server = Arc::new(RpcServer::new("pubapi", api.clone()).with_tls(acceptor));
        let listener = network.listen(&endpoint).await.unwrap();
        let (shutdown, rx) = watch::channel(false);
        let server = tokio::spawn(server.serve(listener, rx));

        TestPeer {
            endpoint,
            core,
            api,
            vpn,
            cluster,
            disk,
            node_state_path,
            shutdown,
            server,
        }
    }

    /// Dialer of an admin machine outside the cluster.
    pub fn admin_dialer(&self) -> Dialer {
        let network: Arc<dyn Network> = Arc::new(PeerNetwork {
            fabric: self.fabric.clone(),
            vpn: self.admin_vpn.clone(),
            public_host: "192.0.2.200".to_string(),
        });
        Dialer::new(network, Arc::new(DummyValidator))
    }

    /// Public API client as the admin sees it.
    pub fn client(&self, endpoint: &str, mode: DialMode) -> PublicClient {
        PublicClient::new(self.admin_dialer(), endpoint, mode, Duration::from_secs(10))
    }

    /// In-VPN client dialing from `peer`.
    pub fn vpn_client_from(&self, peer: &TestPeer, vpn_ip: &str) -> VpnClient {
        let network: Arc<dyn Network> = Arc::new(PeerNetwork {
            fabric: self.fabric.clone(),
            vpn: peer.vpn.clone(),
            public_host: host_of(&peer.endpoint).to_string(),
        });
        VpnClient::new(
            Dialer::new(network, Arc::new(DummyValidator)),
            format!("{}:9027", vpn_ip),
            Duration::from_secs(10),
        )
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Activation request with a cluster KMS and no DEK storage.
pub fn activation_request(nodes: &[&TestPeer], coordinators: &[&TestPeer]) -> ActivateAsCoordinatorRequest {
    ActivateAsCoordinatorRequest {
        admin_vpn_pub_key: ADMIN_VPN_PUB_KEY.to_vec(),
        node_public_endpoints: nodes.iter().map(|p| host_of(&p.endpoint).to_string()).collect(),
        coordinator_public_endpoints: coordinators.iter().map(|p| p.endpoint.clone()).collect(),
        master_secret: MASTER_SECRET.to_vec(),
        kms_uri: "kms://cluster-kms".to_string(),
        storage_uri: "storage://no-store".to_string(),
        key_encryption_key_id: "key-encryption-key".to_string(),
        use_existing_kek: false,
        autoscaling_node_groups: Vec::new(),
        cloud_service_account_uri: String::new(),
    }
}

/// Activate `coordinator` with `nodes` and `coordinators`, collecting the
/// progress log.
pub async fn activate(
    cluster: &TestCluster,
    coordinator: &TestPeer,
    nodes: &[&TestPeer],
    coordinators: &[&TestPeer],
) -> CoordinatorResult<(coordinator::api::proto::AdminConfig, Vec<String>)> {
    let mut log = Vec::new();
    let config = cluster
        .client(&coordinator.endpoint, DialMode::Verified)
        .activate_as_coordinator(&activation_request(nodes, coordinators), |m| log.push(m.to_string()))
        .await?;
    Ok((config, log))
}
