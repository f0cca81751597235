//! Typed accessors over a [`KeyValueAccess`] handle.
//!
//! A `StoreWrapper` borrows either a store or an open transaction. Every
//! multi-key mutation (peer set + resource version, IP pop) must be issued
//! through a wrapper over a transaction so it commits atomically.

use super::{KeyValueAccess, StoreError};
use crate::control::collaborators::JoinArgs;
use crate::core::error::{CoordinatorError, CoordinatorResult};
use crate::kms::KmsInfo;
use crate::peer::Peer;
use crate::state::State;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

const KEY_MASTER_SECRET: &str = "masterSecret";
const KEY_CLUSTER_ID: &str = "clusterID";
const KEY_KUBERNETES_JOIN_ARGS: &str = "kubeJoin";
const KEY_KUBECONFIG: &str = "kubeConfig";
const KEY_KEK_ID: &str = "kekID";
const KEY_KMS_DATA: &str = "KMSData";
const KEY_STATE: &str = "state";
const PEER_PREFIX: &str = "PeerPrefix";
const KEY_PEERS_RESOURCE_VERSION: &str = "peersResourceVersion";
const FREE_NODE_IP_PREFIX: &str = "freeNodeVPNIPs";
const FREE_COORDINATOR_IP_PREFIX: &str = "freeCoordinatorVPNIPs";
const KEY_LAST_NODE_IP: &str = "LastNodeIPPrefix";
const KEY_LAST_COORDINATOR_IP: &str = "LastCoordinatorIPPrefix";

/// Inclusive range of VPN addresses handed out to one peer role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl IpRange {
    pub const fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { start, end }
    }

    /// Check whether `ip` lies within the range.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(self.start) <= u32::from(ip) && u32::from(ip) <= u32::from(self.end)
    }

    /// Cursor value that makes `start` the first allocated address.
    fn initial_cursor(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.start).saturating_sub(1))
    }
}

/// The two disjoint VPN address pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpnIpRanges {
    pub coordinator: IpRange,
    pub node: IpRange,
}

impl Default for VpnIpRanges {
    fn default() -> Self {
        Self {
            coordinator: IpRange::new(Ipv4Addr::new(10, 118, 0, 1), Ipv4Addr::new(10, 118, 0, 10)),
            node: IpRange::new(
                Ipv4Addr::new(10, 118, 0, 11),
                Ipv4Addr::new(10, 118, 255, 254),
            ),
        }
    }
}

/// Which pool an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpPool {
    Coordinator,
    Node,
}

impl IpPool {
    fn cursor_key(self) -> &'static str {
        match self {
            Self::Coordinator => KEY_LAST_COORDINATOR_IP,
            Self::Node => KEY_LAST_NODE_IP,
        }
    }

    fn free_prefix(self) -> &'static str {
        match self {
            Self::Coordinator => FREE_COORDINATOR_IP_PREFIX,
            Self::Node => FREE_NODE_IP_PREFIX,
        }
    }
}

impl std::fmt::Display for IpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coordinator => f.write_str("coordinator"),
            Self::Node => f.write_str("node"),
        }
    }
}

/// Successor of `ip` inside a /16.
///
/// The last octet runs through 0..=255 before the third octet is bumped, so
/// `.0` and `.255` host parts are handed out as well. Within the final /24 the
/// walk stops at `.254`.
fn next_ip(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    let [a, b, c, d] = ip.octets();
    if (d < 255 && c < 255) || d < 254 {
        Some(Ipv4Addr::new(a, b, c, d + 1))
    } else if c < 255 {
        Some(Ipv4Addr::new(a, b, c + 1, 0))
    } else {
        None
    }
}

/// Typed view of a store or transaction.
pub struct StoreWrapper<'a, S: KeyValueAccess + ?Sized> {
    store: &'a S,
    ranges: VpnIpRanges,
}

impl<'a, S: KeyValueAccess + ?Sized> StoreWrapper<'a, S> {
    /// Wrap `store` using the default VPN ranges.
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            ranges: VpnIpRanges::default(),
        }
    }

    /// Override the VPN ranges used by the allocator.
    pub fn with_ranges(mut self, ranges: VpnIpRanges) -> Self {
        self.ranges = ranges;
        self
    }

    // ========================================================================
    // Encoding helpers
    // ========================================================================

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CoordinatorResult<T> {
        let raw = self.store.get(key).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            StoreError::Corrupted {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> CoordinatorResult<()> {
        let raw = serde_json::to_vec(value)?;
        self.store.put(key, &raw).await?;
        Ok(())
    }

    async fn get_ip(&self, key: &str) -> CoordinatorResult<Ipv4Addr> {
        let raw = self.store.get(key).await?;
        let octets: [u8; 4] = raw.as_slice().try_into().map_err(|_| StoreError::Corrupted {
            key: key.to_string(),
            reason: format!("expected 4 bytes, got {}", raw.len()),
        })?;
        Ok(Ipv4Addr::from(octets))
    }

    async fn put_ip(&self, key: &str, ip: Ipv4Addr) -> CoordinatorResult<()> {
        self.store.put(key, &ip.octets()).await?;
        Ok(())
    }

    // ========================================================================
    // Scalars
    // ========================================================================

    pub async fn get_state(&self) -> CoordinatorResult<State> {
        self.get_json(KEY_STATE).await
    }

    pub async fn put_state(&self, state: State) -> CoordinatorResult<()> {
        self.put_json(KEY_STATE, &state).await
    }

    pub async fn get_master_secret(&self) -> CoordinatorResult<Vec<u8>> {
        Ok(self.store.get(KEY_MASTER_SECRET).await?)
    }

    pub async fn put_master_secret(&self, secret: &[u8]) -> CoordinatorResult<()> {
        Ok(self.store.put(KEY_MASTER_SECRET, secret).await?)
    }

    pub async fn get_cluster_id(&self) -> CoordinatorResult<Vec<u8>> {
        Ok(self.store.get(KEY_CLUSTER_ID).await?)
    }

    pub async fn put_cluster_id(&self, cluster_id: &[u8]) -> CoordinatorResult<()> {
        Ok(self.store.put(KEY_CLUSTER_ID, cluster_id).await?)
    }

    pub async fn get_kek_id(&self) -> CoordinatorResult<String> {
        let raw = self.store.get(KEY_KEK_ID).await?;
        String::from_utf8(raw).map_err(|e| {
            StoreError::Corrupted {
                key: KEY_KEK_ID.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub async fn put_kek_id(&self, kek_id: &str) -> CoordinatorResult<()> {
        Ok(self.store.put(KEY_KEK_ID, kek_id.as_bytes()).await?)
    }

    pub async fn get_kms_data(&self) -> CoordinatorResult<KmsInfo> {
        self.get_json(KEY_KMS_DATA).await
    }

    pub async fn put_kms_data(&self, info: &KmsInfo) -> CoordinatorResult<()> {
        self.put_json(KEY_KMS_DATA, info).await
    }

    pub async fn get_kubeconfig(&self) -> CoordinatorResult<Vec<u8>> {
        Ok(self.store.get(KEY_KUBECONFIG).await?)
    }

    pub async fn put_kubeconfig(&self, kubeconfig: &[u8]) -> CoordinatorResult<()> {
        Ok(self.store.put(KEY_KUBECONFIG, kubeconfig).await?)
    }

    pub async fn get_kubernetes_join_args(&self) -> CoordinatorResult<JoinArgs> {
        self.get_json(KEY_KUBERNETES_JOIN_ARGS).await
    }

    pub async fn put_kubernetes_join_args(&self, args: &JoinArgs) -> CoordinatorResult<()> {
        self.put_json(KEY_KUBERNETES_JOIN_ARGS, args).await
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Store `peer` under its VPN IP.
    pub async fn put_peer(&self, peer: &Peer) -> CoordinatorResult<()> {
        if peer.vpn_ip.is_empty() {
            return Err(CoordinatorError::invalid_argument("unique ID of peer not set"));
        }
        self.put_json(&format!("{}{}", PEER_PREFIX, peer.vpn_ip), peer)
            .await
    }

    pub async fn remove_peer(&self, peer: &Peer) -> CoordinatorResult<()> {
        Ok(self
            .store
            .delete(&format!("{}{}", PEER_PREFIX, peer.vpn_ip))
            .await?)
    }

    pub async fn get_peer(&self, vpn_ip: &str) -> CoordinatorResult<Peer> {
        self.get_json(&format!("{}{}", PEER_PREFIX, vpn_ip)).await
    }

    /// All stored peers, ordered by key.
    pub async fn get_peers(&self) -> CoordinatorResult<Vec<Peer>> {
        let mut peers = Vec::new();
        let mut keys = self.store.iterator(PEER_PREFIX).await?;
        while keys.has_next() {
            let key = keys.get_next()?;
            peers.push(self.get_json(&key).await?);
        }
        Ok(peers)
    }

    /// Current peers resource version; unset reads as 0 only through
    /// [`Self::increment_peers_resource_version`].
    pub async fn get_peers_resource_version(&self) -> CoordinatorResult<u64> {
        let raw = self.store.get(KEY_PEERS_RESOURCE_VERSION).await?;
        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                StoreError::Corrupted {
                    key: KEY_PEERS_RESOURCE_VERSION.to_string(),
                    reason: "not a decimal integer".to_string(),
                }
                .into()
            })
    }

    pub async fn put_peers_resource_version(&self, version: u64) -> CoordinatorResult<()> {
        Ok(self
            .store
            .put(KEY_PEERS_RESOURCE_VERSION, version.to_string().as_bytes())
            .await?)
    }

    /// Bump the resource version. Must share a transaction with the peer
    /// mutation it labels.
    pub async fn increment_peers_resource_version(&self) -> CoordinatorResult<u64> {
        let current = match self.get_peers_resource_version().await {
            Ok(v) => v,
            Err(e) if e.is_value_unset() => 0,
            Err(e) => return Err(e),
        };
        let next = current + 1;
        self.store
            .put(KEY_PEERS_RESOURCE_VERSION, next.to_string().as_bytes())
            .await?;
        Ok(next)
    }

    /// Make the stored peer set equal to `peers`.
    ///
    /// Returns `(added, removed)`. A peer whose endpoint or key changed is
    /// reported in both lists.
    pub async fn update_peers(&self, peers: &[Peer]) -> CoordinatorResult<(Vec<Peer>, Vec<Peer>)> {
        let mut wanted: BTreeMap<&str, &Peer> =
            peers.iter().map(|p| (p.vpn_ip.as_str(), p)).collect();
        let mut added = Vec::new();
        let mut removed = Vec::new();

        for stored in self.get_peers().await? {
            match wanted.remove(stored.vpn_ip.as_str()) {
                Some(updated) => {
                    if updated.public_endpoint != stored.public_endpoint
                        || updated.vpn_pub_key != stored.vpn_pub_key
                    {
                        added.push(updated.clone());
                        removed.push(stored);
                    }
                }
                None => removed.push(stored),
            }
        }
        added.extend(wanted.into_values().cloned());

        for peer in &removed {
            self.remove_peer(peer).await?;
        }
        for peer in &added {
            self.put_peer(peer).await?;
        }
        Ok((added, removed))
    }

    // ========================================================================
    // VPN IP allocation
    // ========================================================================

    /// Prime both cursors so the first allocations return the range starts.
    pub async fn initialize_store_ips(&self) -> CoordinatorResult<()> {
        self.put_ip(KEY_LAST_NODE_IP, self.ranges.node.initial_cursor())
            .await?;
        self.put_ip(
            KEY_LAST_COORDINATOR_IP,
            self.ranges.coordinator.initial_cursor(),
        )
        .await
    }

    pub async fn get_last_node_ip(&self) -> CoordinatorResult<Ipv4Addr> {
        self.get_ip(KEY_LAST_NODE_IP).await
    }

    pub async fn put_last_node_ip(&self, ip: Ipv4Addr) -> CoordinatorResult<()> {
        self.put_ip(KEY_LAST_NODE_IP, ip).await
    }

    pub async fn get_last_coordinator_ip(&self) -> CoordinatorResult<Ipv4Addr> {
        self.get_ip(KEY_LAST_COORDINATOR_IP).await
    }

    pub async fn put_last_coordinator_ip(&self, ip: Ipv4Addr) -> CoordinatorResult<()> {
        self.put_ip(KEY_LAST_COORDINATOR_IP, ip).await
    }

    pub async fn put_freed_node_vpn_ip(&self, ip: &str) -> CoordinatorResult<()> {
        self.put_freed_ip(IpPool::Node, ip).await
    }

    pub async fn put_freed_coordinator_vpn_ip(&self, ip: &str) -> CoordinatorResult<()> {
        self.put_freed_ip(IpPool::Coordinator, ip).await
    }

    /// Next node address: a freed one if available, otherwise the cursor's
    /// successor.
    pub async fn pop_next_free_node_ip(&self) -> CoordinatorResult<Ipv4Addr> {
        self.pop_next_free_ip(IpPool::Node).await
    }

    pub async fn pop_next_free_coordinator_ip(&self) -> CoordinatorResult<Ipv4Addr> {
        self.pop_next_free_ip(IpPool::Coordinator).await
    }

    /// Pool that owns `ip`, if any.
    pub fn pool_of(&self, ip: Ipv4Addr) -> Option<IpPool> {
        if self.ranges.coordinator.contains(ip) {
            Some(IpPool::Coordinator)
        } else if self.ranges.node.contains(ip) {
            Some(IpPool::Node)
        } else {
            None
        }
    }

    pub async fn put_freed_ip(&self, pool: IpPool, ip: &str) -> CoordinatorResult<()> {
        let parsed: Ipv4Addr = ip
            .parse()
            .map_err(|_| CoordinatorError::invalid_argument(format!("invalid VPN IP {:?}", ip)))?;
        Ok(self
            .store
            .put(&format!("{}{}", pool.free_prefix(), parsed), &[])
            .await?)
    }

    async fn pop_freed_ip(&self, pool: IpPool) -> CoordinatorResult<Option<Ipv4Addr>> {
        let mut keys = self.store.iterator(pool.free_prefix()).await?;
        if !keys.has_next() {
            return Ok(None);
        }
        let key = keys.get_next()?;
        let ip = key[pool.free_prefix().len()..]
            .parse()
            .map_err(|_| StoreError::Corrupted {
                key: key.clone(),
                reason: "freed entry is not an IPv4 address".to_string(),
            })?;
        self.store.delete(&key).await?;
        Ok(Some(ip))
    }

    async fn pop_next_free_ip(&self, pool: IpPool) -> CoordinatorResult<Ipv4Addr> {
        if let Some(ip) = self.pop_freed_ip(pool).await? {
            tracing::debug!(%pool, %ip, "reusing freed VPN IP");
            return Ok(ip);
        }

        let range = match pool {
            IpPool::Coordinator => self.ranges.coordinator,
            IpPool::Node => self.ranges.node,
        };
        let cursor = self.get_ip(pool.cursor_key()).await?;
        let next = next_ip(cursor)
            .filter(|ip| u32::from(*ip) <= u32::from(range.end))
            .ok_or(CoordinatorError::IpExhausted { pool })?;
        self.put_ip(pool.cursor_key(), next).await?;
        Ok(next)
    }
}
