//! Store, transactions and the typed wrapper.

mod common;

use common::SharedStoreFactory;
use coordinator::control::collaborators::JoinArgs;
use coordinator::core::error::CoordinatorError;
use coordinator::peer::{Peer, Role};
use coordinator::store::memory::MemoryStore;
use coordinator::store::wrapper::{IpPool, StoreWrapper};
use coordinator::store::{KeyValueAccess, PersistentStoreFactory, Store, StoreError};
use std::collections::HashSet;
use std::net::Ipv4Addr;

fn node(vpn_ip: &str, key: &[u8]) -> Peer {
    Peer {
        public_endpoint: format!("192.0.2.{}:9000", vpn_ip.rsplit('.').next().unwrap_or("1")),
        vpn_ip: vpn_ip.to_string(),
        vpn_pub_key: key.to_vec(),
        role: Role::Node,
    }
}

// ============================================================================
// IP allocation
// ============================================================================

#[tokio::test]
async fn node_pool_runs_to_the_last_usable_address() {
    let store = MemoryStore::new();
    let data = StoreWrapper::new(&store);
    data.put_last_node_ip(Ipv4Addr::new(10, 118, 0, 1)).await.unwrap();

    let mut handed_out = 0usize;
    let mut last_three = Vec::new();
    loop {
        match data.pop_next_free_node_ip().await {
            Ok(ip) => {
                handed_out += 1;
                last_three.push(ip);
                if last_three.len() > 3 {
                    last_three.remove(0);
                }
            }
            Err(CoordinatorError::IpExhausted { pool }) => {
                assert_eq!(pool, IpPool::Node);
                break;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(
        last_three,
        vec![
            Ipv4Addr::new(10, 118, 255, 252),
            Ipv4Addr::new(10, 118, 255, 253),
            Ipv4Addr::new(10, 118, 255, 254),
        ]
    );
    // 10.118.0.2 through 10.118.255.254
    assert_eq!(handed_out, 256 * 256 - 3);

    // exhaustion is sticky
    assert!(matches!(
        data.pop_next_free_node_ip().await,
        Err(CoordinatorError::IpExhausted { .. })
    ));
}

#[tokio::test]
async fn freed_addresses_are_reused_first() {
    let store = MemoryStore::new();
    let data = StoreWrapper::new(&store);
    data.put_last_node_ip(Ipv4Addr::new(10, 118, 0, 1)).await.unwrap();

    assert_eq!(data.pop_next_free_node_ip().await.unwrap(), Ipv4Addr::new(10, 118, 0, 2));
    assert_eq!(data.pop_next_free_node_ip().await.unwrap(), Ipv4Addr::new(10, 118, 0, 3));
    data.put_freed_node_vpn_ip("10.118.0.3").await.unwrap();
    data.put_freed_node_vpn_ip("10.118.0.2").await.unwrap();

    let reused: HashSet<Ipv4Addr> = [
        data.pop_next_free_node_ip().await.unwrap(),
        data.pop_next_free_node_ip().await.unwrap(),
    ]
    .into_iter()
    .collect();
    assert_eq!(
        reused,
        [Ipv4Addr::new(10, 118, 0, 2), Ipv4Addr::new(10, 118, 0, 3)]
            .into_iter()
            .collect()
    );
    assert_eq!(data.pop_next_free_node_ip().await.unwrap(), Ipv4Addr::new(10, 118, 0, 4));
}

#[tokio::test]
async fn pools_stay_inside_their_ranges() {
    let store = MemoryStore::new();
    let data = StoreWrapper::new(&store);
    data.initialize_store_ips().await.unwrap();

    let ranges = coordinator::store::wrapper::VpnIpRanges::default();
    for _ in 0..10 {
        let ip = data.pop_next_free_coordinator_ip().await.unwrap();
        assert!(ranges.coordinator.contains(ip));
    }
    assert!(data.pop_next_free_coordinator_ip().await.is_err());
    for _ in 0..50 {
        let ip = data.pop_next_free_node_ip().await.unwrap();
        assert!(ranges.node.contains(ip));
        assert!(!ranges.coordinator.contains(ip));
    }
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn delete_then_put_inside_transaction() {
    let store = MemoryStore::new();
    store.put("k", &[0x00, 0x00]).await.unwrap();

    let tx = store.begin_transaction().await.unwrap();
    tx.put("k", &[0x00, 0x11]).await.unwrap();
    tx.delete("k").await.unwrap();
    tx.put("k", &[0x07, 0x08]).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(store.get("k").await.unwrap(), vec![0x07, 0x08]);
}

#[tokio::test]
async fn committed_transaction_rejects_reads() {
    let store = MemoryStore::new();
    let tx = store.begin_transaction().await.unwrap();
    tx.put("k", b"v").await.unwrap();
    tx.commit().await.unwrap();

    let err = tx.get("k").await.unwrap_err();
    assert!(matches!(err, StoreError::TransactionAlreadyCommitted));
    assert_eq!(store.get("k").await.unwrap(), b"v".to_vec());
}

#[tokio::test]
async fn rolled_back_writes_are_invisible() {
    let store = MemoryStore::new();
    let tx = store.begin_transaction().await.unwrap();
    tx.put("k", b"v").await.unwrap();
    tx.rollback().await;
    tx.rollback().await;

    assert!(matches!(
        store.get("k").await,
        Err(StoreError::ValueUnset { .. })
    ));
}

#[tokio::test]
async fn stored_values_are_copies() {
    let store = MemoryStore::new();
    let mut value = vec![1u8, 2, 3];
    store.put("k", &value).await.unwrap();
    value[0] = 9;
    assert_eq!(store.get("k").await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn transfer_copies_every_entry() {
    let source = MemoryStore::new();
    let data = StoreWrapper::new(&source);
    data.put_master_secret(b"secret").await.unwrap();
    data.put_peer(&node("10.118.0.11", b"key-1")).await.unwrap();
    data.put_kubernetes_join_args(&JoinArgs {
        api_server_endpoint: "10.118.0.1:6443".into(),
        token: "token".into(),
        ca_cert_hashes: vec!["sha256:abcd".into()],
    })
    .await
    .unwrap();

    let target = SharedStoreFactory(MemoryStore::new()).create().await.unwrap();
    source.transfer(target.as_ref()).await.unwrap();

    let copied = StoreWrapper::new(target.as_ref());
    assert_eq!(copied.get_master_secret().await.unwrap(), b"secret".to_vec());
    assert_eq!(copied.get_peers().await.unwrap().len(), 1);
    assert_eq!(copied.get_kubernetes_join_args().await.unwrap().token, "token");
}

// ============================================================================
// Peers
// ============================================================================

#[tokio::test]
async fn resource_version_strictly_increases() {
    let store = MemoryStore::new();
    let data = StoreWrapper::new(&store);

    let mut versions = vec![data.increment_peers_resource_version().await.unwrap()];
    data.put_peer(&node("10.118.0.11", b"a")).await.unwrap();
    versions.push(data.increment_peers_resource_version().await.unwrap());
    data.put_peer(&node("10.118.0.12", b"b")).await.unwrap();
    versions.push(data.increment_peers_resource_version().await.unwrap());
    data.remove_peer(&node("10.118.0.11", b"a")).await.unwrap();
    versions.push(data.increment_peers_resource_version().await.unwrap());

    assert!(versions.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn peers_are_keyed_by_vpn_ip() {
    let store = MemoryStore::new();
    let data = StoreWrapper::new(&store);
    data.put_peer(&node("10.118.0.11", b"old-key")).await.unwrap();
    data.put_peer(&node("10.118.0.11", b"new-key")).await.unwrap();
    data.put_peer(&node("10.118.0.12", b"other")).await.unwrap();

    let peers = data.get_peers().await.unwrap();
    assert_eq!(peers.len(), 2);
    let ips: HashSet<&str> = peers.iter().map(|p| p.vpn_ip.as_str()).collect();
    assert_eq!(ips.len(), peers.len());
    assert_eq!(
        data.get_peer("10.118.0.11").await.unwrap().vpn_pub_key,
        b"new-key".to_vec()
    );
}
