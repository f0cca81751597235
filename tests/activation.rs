//! End-to-end activation tests over the in-memory network.

mod common;

use common::{activate, activation_request, TestCluster, ADMIN_VPN_PUB_KEY, MASTER_SECRET};
use coordinator::api::proto::ActivateAsNodeInitialRequest;
use coordinator::control::NodeState;
use coordinator::core::error::{CoordinatorError, RpcCode};
use coordinator::kms::derive_key;
use coordinator::net::DialMode;
use coordinator::peer::{Peer, Role};
use coordinator::state::State;
use std::collections::HashSet;

fn rpc_code(err: &CoordinatorError) -> RpcCode {
    err.rpc_code()
}

// ============================================================================
// First coordinator with three nodes
// ============================================================================

#[tokio::test]
async fn three_node_activation_builds_a_routed_vpn() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node1 = cluster.spawn_peer("192.0.2.11").await;
    let node2 = cluster.spawn_peer("192.0.2.12").await;
    let node3 = cluster.spawn_peer("192.0.2.13").await;

    let (admin_config, log) = activate(&cluster, &coordinator, &[&node1, &node2, &node3], &[])
        .await
        .unwrap();

    assert_eq!(admin_config.kubeconfig, b"kubeconfig".to_vec());
    assert!(!admin_config.owner_id.is_empty());
    assert_eq!(admin_config.cluster_id.len(), 32);
    assert_eq!(
        admin_config.coordinator_vpn_pub_key,
        coordinator.core.get_vpn_pub_key().await.unwrap()
    );
    assert!(log.iter().any(|m| m.contains("Activating worker node   3 out of   3")));

    assert_eq!(coordinator.state(), State::ActivatingNodes);
    assert_eq!(coordinator.vpn_ip(), "10.118.0.1");
    for node in [&node1, &node2, &node3] {
        assert_eq!(node.state(), State::IsNode);
    }

    let ips: Vec<String> = [&node1, &node2, &node3].iter().map(|n| n.vpn_ip()).collect();
    assert!(ips.iter().all(|ip| !ip.is_empty()));
    assert_eq!(ips.iter().collect::<HashSet<_>>().len(), 3);

    assert!(cluster.fabric.send_packet(&node1.vpn, &node2.vpn_ip(), b"ping"));
    let received = node2.vpn.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].from, node1.vpn_ip());
    assert_eq!(received[0].payload, b"ping".to_vec());
    assert!(node3.vpn.received().is_empty());

    for peer in [coordinator, node1, node2, node3] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn activation_assigns_addresses_from_the_pools() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node1 = cluster.spawn_peer("192.0.2.11").await;
    let node2 = cluster.spawn_peer("192.0.2.12").await;

    let (admin_config, _) = activate(&cluster, &coordinator, &[&node1, &node2], &[])
        .await
        .unwrap();

    assert_eq!(node1.vpn_ip(), "10.118.0.11");
    assert_eq!(node2.vpn_ip(), "10.118.0.12");
    // the admin is registered last
    assert_eq!(admin_config.admin_vpn_ip, "10.118.0.13");

    let (_, peers) = coordinator.core.get_peers(0).await.unwrap();
    let admin = peers.iter().find(|p| p.role == Role::Admin).unwrap();
    assert_eq!(admin.vpn_pub_key, ADMIN_VPN_PUB_KEY.to_vec());
    assert!(admin.public_endpoint.is_empty());
    assert!(coordinator.vpn.has_peer("10.118.0.13"));

    for peer in [coordinator, node1, node2] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn activation_switches_to_the_persistent_store() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node = cluster.spawn_peer("192.0.2.11").await;

    activate(&cluster, &coordinator, &[&node], &[]).await.unwrap();

    assert!(coordinator.core.is_persistent());
    assert!(!cluster.persistent.is_empty());
    let (_, peers) = coordinator.core.get_peers(0).await.unwrap();
    let roles: Vec<Role> = peers.iter().map(|p| p.role).collect();
    assert!(roles.contains(&Role::Coordinator));
    assert!(roles.contains(&Role::Node));
    assert!(roles.contains(&Role::Admin));

    for peer in [coordinator, node] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn nodes_receive_kms_derived_disk_keys() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node = cluster.spawn_peer("192.0.2.11").await;

    activate(&cluster, &coordinator, &[&node], &[]).await.unwrap();

    let expected = derive_key(MASTER_SECRET, b"", b"disk-192.0.2.11", 32).unwrap();
    assert_eq!(node.disk.passphrase(), expected);
    // the coordinator re-keys its own disk too
    let own = derive_key(MASTER_SECRET, b"", b"disk-192.0.2.1", 32).unwrap();
    assert_eq!(coordinator.disk.passphrase(), own);

    for peer in [coordinator, node] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn activation_persists_node_state_files() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node = cluster.spawn_peer("192.0.2.11").await;

    let (admin_config, _) = activate(&cluster, &coordinator, &[&node], &[]).await.unwrap();

    let node_state = NodeState::from_file(&node.node_state_path).unwrap();
    assert_eq!(node_state.role, Role::Node);
    assert_eq!(node_state.vpn_ip, "10.118.0.11");
    assert_eq!(node_state.owner_id, admin_config.owner_id);
    assert_eq!(node_state.cluster_id, admin_config.cluster_id);
    assert_eq!(node_state.vpn_private_key.len(), 32);

    let coordinator_state = NodeState::from_file(&coordinator.node_state_path).unwrap();
    assert_eq!(coordinator_state.role, Role::Coordinator);
    assert_eq!(coordinator_state.vpn_ip, "10.118.0.1");

    for peer in [coordinator, node] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn nodes_join_kubernetes_with_coordinator_join_args() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node = cluster.spawn_peer("192.0.2.11").await;

    activate(&cluster, &coordinator, &[&node], &[]).await.unwrap();

    assert_eq!(coordinator.cluster.inits().len(), 1);
    assert_eq!(coordinator.cluster.inits()[0].vpn_ip, "10.118.0.1");
    let joins = node.cluster.joins();
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].role, Role::Node);
    assert_eq!(joins[0].args.token, "kube-fake-token");
    assert_eq!(joins[0].vpn_ip, "10.118.0.11");
    assert!(joins[0].certificate_key.is_none());

    for peer in [coordinator, node] {
        peer.stop().await;
    }
}

// ============================================================================
// Peer updates
// ============================================================================

#[tokio::test]
async fn node_update_propagates_peers_once() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node1 = cluster.spawn_peer("192.0.2.11").await;
    let node2 = cluster.spawn_peer("192.0.2.12").await;

    activate(&cluster, &coordinator, &[&node1, &node2], &[]).await.unwrap();
    let (_, all_peers) = coordinator.core.get_peers(0).await.unwrap();

    for node in [&node1, &node2] {
        let client = cluster.client(&node.endpoint, DialMode::Unverified);
        client.trigger_node_update().await.unwrap();

        let mut expected: Vec<String> = all_peers
            .iter()
            .filter(|p| p.vpn_ip != node.vpn_ip())
            .map(|p| p.vpn_ip.clone())
            .collect();
        expected.sort();
        assert_eq!(node.vpn.peer_ips(), expected);

        // nothing changed since: no driver call
        let calls = node.vpn.update_calls();
        client.trigger_node_update().await.unwrap();
        assert_eq!(node.vpn.update_calls(), calls);
    }

    for peer in [coordinator, node1, node2] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn additional_nodes_reach_existing_ones() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node1 = cluster.spawn_peer("192.0.2.11").await;
    activate(&cluster, &coordinator, &[&node1], &[]).await.unwrap();

    let node2 = cluster.spawn_peer("192.0.2.12").await;
    let mut log = Vec::new();
    cluster
        .client(&coordinator.endpoint, DialMode::Verified)
        .activate_additional_nodes(&[node2.endpoint.clone()], |m| log.push(m.to_string()))
        .await
        .unwrap();

    assert_eq!(log.last().map(String::as_str), Some("success"));
    assert_eq!(node2.state(), State::IsNode);
    assert!(cluster.fabric.send_packet(&node1.vpn, &node2.vpn_ip(), b"hello"));
    assert!(cluster.fabric.send_packet(&node2.vpn, &node1.vpn_ip(), b"hello"));

    for peer in [coordinator, node1, node2] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn get_vpn_peers_lists_the_registry() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node = cluster.spawn_peer("192.0.2.11").await;
    activate(&cluster, &coordinator, &[&node], &[]).await.unwrap();

    let peers = cluster
        .client(&coordinator.endpoint, DialMode::Unverified)
        .get_vpn_peers()
        .await
        .unwrap();
    let node_peer = peers.iter().find(|p| p.role == Role::Node).unwrap();
    assert_eq!(node_peer.public_endpoint, "192.0.2.11:9000");
    assert_eq!(node_peer.vpn_ip, "10.118.0.11");
    assert_eq!(node_peer.vpn_pub_key, node.core.get_vpn_pub_key().await.unwrap());

    for peer in [coordinator, node] {
        peer.stop().await;
    }
}

// ============================================================================
// Wrong state and failures
// ============================================================================

#[tokio::test]
async fn activated_node_rejects_second_activation() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node = cluster.spawn_peer("192.0.2.11").await;
    activate(&cluster, &coordinator, &[&node], &[]).await.unwrap();
    assert_eq!(node.state(), State::IsNode);

    let err = match cluster
        .client(&node.endpoint, DialMode::Verified)
        .activate_as_node(ActivateAsNodeInitialRequest {
            node_vpn_ip: "10.118.0.99".to_string(),
            peers: Vec::new(),
            owner_id: b"owner".to_vec(),
            cluster_id: b"cluster".to_vec(),
        })
        .await
    {
        Ok(_) => panic!("activation of an active node must fail"),
        Err(e) => e,
    };
    assert_eq!(rpc_code(&err), RpcCode::FailedPrecondition);
    assert_eq!(node.state(), State::IsNode);
    assert_eq!(node.vpn_ip(), "10.118.0.11");

    for peer in [coordinator, node] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn coordinator_activation_requires_master_secret() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;

    let mut request = activation_request(&[], &[]);
    request.master_secret.clear();
    let err = cluster
        .client(&coordinator.endpoint, DialMode::Verified)
        .activate_as_coordinator(&request, |_| {})
        .await
        .unwrap_err();
    assert_eq!(rpc_code(&err), RpcCode::InvalidArgument);
    assert_eq!(coordinator.state(), State::AcceptingInit);

    coordinator.stop().await;
}

#[tokio::test]
async fn second_coordinator_activation_is_rejected() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    activate(&cluster, &coordinator, &[], &[]).await.unwrap();

    let err = activate(&cluster, &coordinator, &[], &[]).await.unwrap_err();
    assert_eq!(rpc_code(&err), RpcCode::FailedPrecondition);
    assert_eq!(coordinator.state(), State::ActivatingNodes);

    coordinator.stop().await;
}

#[tokio::test]
async fn unreachable_node_fails_the_coordinator() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;

    let mut request = activation_request(&[], &[]);
    request.node_public_endpoints = vec!["192.0.2.99".to_string()];
    let err = cluster
        .client(&coordinator.endpoint, DialMode::Verified)
        .activate_as_coordinator(&request, |_| {})
        .await
        .unwrap_err();
    assert_eq!(rpc_code(&err), RpcCode::Internal);
    assert_eq!(coordinator.state(), State::Failed);

    coordinator.stop().await;
}

#[tokio::test]
async fn failed_kubernetes_join_fails_the_node() {
    let cluster = TestCluster::new();
    let coordinator = cluster.spawn_peer("192.0.2.1").await;
    let node = cluster.spawn_peer("192.0.2.11").await;
    node.cluster.fail_joins();

    let err = activate(&cluster, &coordinator, &[&node], &[]).await.unwrap_err();
    assert_eq!(rpc_code(&err), RpcCode::Internal);
    assert_eq!(node.cluster.joins().len(), 1);
    assert_eq!(node.state(), State::Failed);
    assert_eq!(coordinator.state(), State::Failed);

    for peer in [coordinator, node] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn vpn_failure_during_activation_fails_the_node() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_peer("192.0.2.11").await;
    node.vpn.fail_peer_updates();

    let coordinator_peer = Peer {
        public_endpoint: "192.0.2.1:9000".to_string(),
        vpn_ip: "10.118.0.1".to_string(),
        vpn_pub_key: vec![7; 32],
        role: Role::Coordinator,
    };
    let err = match cluster
        .client(&node.endpoint, DialMode::Verified)
        .activate_as_node(ActivateAsNodeInitialRequest {
            node_vpn_ip: "10.118.0.11".to_string(),
            peers: Peer::to_public_proto(&[coordinator_peer]),
            owner_id: b"owner".to_vec(),
            cluster_id: b"cluster".to_vec(),
        })
        .await
    {
        Ok(_) => panic!("activation must fail when the VPN rejects the peers"),
        Err(e) => e,
    };
    assert_eq!(rpc_code(&err), RpcCode::Internal);
    assert_eq!(node.state(), State::Failed);
    assert!(node.vpn.peer_ips().is_empty());
    assert!(!node.node_state_path.exists());

    node.stop().await;
}

#[tokio::test]
async fn unactivated_peer_rejects_update_triggers() {
    let cluster = TestCluster::new();
    let peer = cluster.spawn_peer("192.0.2.11").await;
    let client = cluster.client(&peer.endpoint, DialMode::Unverified);

    let err = client.trigger_node_update().await.unwrap_err();
    assert_eq!(rpc_code(&err), RpcCode::FailedPrecondition);
    let err = client.trigger_coordinator_update().await.unwrap_err();
    assert_eq!(rpc_code(&err), RpcCode::FailedPrecondition);
    let err = client.join_cluster("10.118.0.1").await.unwrap_err();
    assert_eq!(rpc_code(&err), RpcCode::FailedPrecondition);

    assert_eq!(client.get_state().await.unwrap(), State::AcceptingInit);
    assert_eq!(peer.state(), State::AcceptingInit);

    peer.stop().await;
}
