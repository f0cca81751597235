//! Lifecycle, key derivation and peer encoding properties.

mod common;

use coordinator::api::proto::{PublicPeer, VpnPeer};
use coordinator::core::error::CoordinatorError;
use coordinator::kms::cluster::ClusterKms;
use coordinator::kms::{CloudKms, KmsUri};
use coordinator::peer::{Peer, Role};
use coordinator::state::{State, StateMachine};

const ALL_STATES: [State; 6] = [
    State::Uninitialized,
    State::AcceptingInit,
    State::ActivatingNodes,
    State::NodeWaitingForClusterJoin,
    State::IsNode,
    State::Failed,
];

/// A machine sitting in `state`.
fn machine_in(state: State) -> StateMachine {
    let machine = StateMachine::new();
    if state != State::Uninitialized {
        machine.advance(state).unwrap();
    }
    machine
}

// ============================================================================
// State machine
// ============================================================================

#[test]
fn require_succeeds_exactly_for_members() {
    let subsets: [&[State]; 4] = [
        &[],
        &[State::AcceptingInit],
        &[State::ActivatingNodes, State::IsNode],
        &ALL_STATES,
    ];
    for state in ALL_STATES {
        let machine = machine_in(state);
        for allowed in subsets {
            assert_eq!(
                machine.require(allowed).is_ok(),
                allowed.contains(&state),
                "state {} against {:?}",
                state,
                allowed
            );
        }
    }
}

#[test]
fn advance_only_moves_forward() {
    for from in ALL_STATES {
        for to in ALL_STATES {
            let machine = machine_in(from);
            let result = machine.advance(to);
            if to > from {
                assert!(result.is_ok(), "{} -> {}", from, to);
                assert_eq!(machine.get(), to);
            } else {
                assert!(
                    matches!(result, Err(CoordinatorError::InvalidStateTransition { .. })),
                    "{} -> {}",
                    from,
                    to
                );
                assert_eq!(machine.get(), from);
            }
        }
    }
}

#[test]
fn failed_is_reachable_from_every_other_state() {
    for state in ALL_STATES.into_iter().filter(|s| *s != State::Failed) {
        let machine = machine_in(state);
        machine.advance(State::Failed).unwrap();
        assert_eq!(machine.get(), State::Failed);
    }
}

// ============================================================================
// Cluster KMS
// ============================================================================

#[tokio::test]
async fn data_keys_are_deterministic_and_sized() {
    let uri = KmsUri::cluster(b"master-secret", b"salt");
    let KmsUri::Cluster { key, salt } = KmsUri::parse(&uri).unwrap() else {
        panic!("expected a cluster KMS URI");
    };

    let first = ClusterKms::new(salt.clone());
    first.set_master_key(key.clone().unwrap());
    let second = ClusterKms::new(salt);
    second.set_master_key(key.unwrap());

    for length in [1usize, 16, 32, 64] {
        let a = first.get_dek("kek", "volume", length).await.unwrap();
        let b = second.get_dek("kek", "volume", length).await.unwrap();
        assert_eq!(a.len(), length);
        assert_eq!(a, b);
    }
    assert_ne!(
        first.get_dek("kek", "volume-a", 32).await.unwrap(),
        first.get_dek("kek", "volume-b", 32).await.unwrap()
    );
}

#[tokio::test]
async fn different_salts_give_different_keys() {
    let a = ClusterKms::new(b"salt-a".to_vec());
    let b = ClusterKms::new(b"salt-b".to_vec());
    a.create_kek("kek", b"master").await.unwrap();
    b.create_kek("kek", b"master").await.unwrap();
    assert_ne!(
        a.get_dek("kek", "disk", 32).await.unwrap(),
        b.get_dek("kek", "disk", 32).await.unwrap()
    );
}

// ============================================================================
// Peer encodings
// ============================================================================

fn sample_peers() -> Vec<Peer> {
    vec![
        Peer {
            public_endpoint: "192.0.2.1:9000".into(),
            vpn_ip: "10.118.0.1".into(),
            vpn_pub_key: vec![1; 32],
            role: Role::Coordinator,
        },
        Peer {
            public_endpoint: "192.0.2.11:9000".into(),
            vpn_ip: "10.118.0.11".into(),
            vpn_pub_key: vec![2; 32],
            role: Role::Node,
        },
        Peer {
            public_endpoint: String::new(),
            vpn_ip: "10.118.0.12".into(),
            vpn_pub_key: vec![3; 32],
            role: Role::Admin,
        },
    ]
}

#[test]
fn peers_survive_both_wire_forms() {
    let peers = sample_peers();

    let public: Vec<PublicPeer> = Peer::to_public_proto(&peers);
    assert_eq!(Peer::from_public_proto(&public), peers);

    let vpn: Vec<VpnPeer> = Peer::to_vpn_proto(&peers);
    assert_eq!(Peer::from_vpn_proto(&vpn), peers);
}
