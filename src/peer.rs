//! Peer records.
//!
//! A [`Peer`] is keyed by its VPN IP. The same record travels in three
//! shapes: JSON in the store, [`PublicPeer`] on the public API and
//! [`VpnPeer`] on the in-VPN API. Conversions between them are field for
//! field.

use crate::api::proto::{PublicPeer, VpnPeer};
use serde::{Deserialize, Serialize};

/// Role of a peer in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Role {
    #[default]
    Unknown = 0,
    Coordinator = 1,
    Node = 2,
    Admin = 3,
}

impl Role {
    /// Decode the numeric wire form; unknown values map to `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Coordinator,
            2 => Self::Node,
            3 => Self::Admin,
            _ => Self::Unknown,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl From<Role> for u32 {
    fn from(role: Role) -> Self {
        role.as_u32()
    }
}

impl TryFrom<u32> for Role {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0..=3 => Ok(Role::from_u32(value)),
            other => Err(format!("unknown role {}", other)),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Coordinator => "Coordinator",
            Self::Node => "Node",
            Self::Admin => "Admin",
        };
        f.write_str(name)
    }
}

/// A member of the VPN.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Peer {
    /// `host:port` reachable outside the VPN. Empty for admins.
    #[serde(rename = "PublicEndpoint")]
    pub public_endpoint: String,
    #[serde(rename = "VPNIP")]
    pub vpn_ip: String,
    #[serde(rename = "VPNPubKey", with = "base64_bytes")]
    pub vpn_pub_key: Vec<u8>,
    #[serde(rename = "Role")]
    pub role: Role,
}

impl Peer {
    pub fn from_public_proto(peers: &[PublicPeer]) -> Vec<Peer> {
        peers.iter().map(Peer::from).collect()
    }

    pub fn to_public_proto(peers: &[Peer]) -> Vec<PublicPeer> {
        peers.iter().map(PublicPeer::from).collect()
    }

    pub fn from_vpn_proto(peers: &[VpnPeer]) -> Vec<Peer> {
        peers.iter().map(Peer::from).collect()
    }

    pub fn to_vpn_proto(peers: &[Peer]) -> Vec<VpnPeer> {
        peers.iter().map(VpnPeer::from).collect()
    }
}

impl From<&PublicPeer> for Peer {
    fn from(p: &PublicPeer) -> Self {
        Self {
            public_endpoint: p.public_endpoint.clone(),
            vpn_ip: p.vpn_ip.clone(),
            vpn_pub_key: p.vpn_pub_key.clone(),
            role: Role::from_u32(p.role),
        }
    }
}

impl From<&Peer> for PublicPeer {
    fn from(p: &Peer) -> Self {
        Self {
            public_endpoint: p.public_endpoint.clone(),
            vpn_ip: p.vpn_ip.clone(),
            vpn_pub_key: p.vpn_pub_key.clone(),
            role: p.role.as_u32(),
        }
    }
}

impl From<&VpnPeer> for Peer {
    fn from(p: &VpnPeer) -> Self {
        Self {
            public_endpoint: p.public_endpoint.clone(),
            vpn_ip: p.vpn_ip.clone(),
            vpn_pub_key: p.vpn_pub_key.clone(),
            role: Role::from_u32(p.role),
        }
    }
}

impl From<&Peer> for VpnPeer {
    fn from(p: &Peer) -> Self {
        Self {
            public_endpoint: p.public_endpoint.clone(),
            vpn_ip: p.vpn_ip.clone(),
            vpn_pub_key: p.vpn_pub_key.clone(),
            role: p.role.as_u32(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Peer> {
        vec![
            Peer {
                public_endpoint: "192.0.2.1:9000".into(),
                vpn_ip: "10.118.0.1".into(),
                vpn_pub_key: vec![1, 2, 3],
                role: Role::Coordinator,
            },
            Peer {
                public_endpoint: "192.0.2.11:9000".into(),
                vpn_ip: "10.118.0.11".into(),
                vpn_pub_key: vec![4, 5, 6],
                role: Role::Node,
            },
            Peer {
                public_endpoint: String::new(),
                vpn_ip: "10.118.0.12".into(),
                vpn_pub_key: vec![7],
                role: Role::Admin,
            },
        ]
    }

    #[test]
    fn test_public_proto_identity() {
        let peers = sample();
        assert_eq!(Peer::from_public_proto(&Peer::to_public_proto(&peers)), peers);
    }

    #[test]
    fn test_vpn_proto_identity() {
        let peers = sample();
        assert_eq!(Peer::from_vpn_proto(&Peer::to_vpn_proto(&peers)), peers);
    }

    #[test]
    fn test_role_on_wire_is_integer() {
        let wire = Peer::to_public_proto(&sample());
        assert_eq!(wire[0].role, 1);
        assert_eq!(wire[1].role, 2);
        assert_eq!(wire[2].role, 3);
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(&sample()[0]).unwrap();
        assert_eq!(json["PublicEndpoint"], "192.0.2.1:9000");
        assert_eq!(json["VPNIP"], "10.118.0.1");
        assert_eq!(json["VPNPubKey"], "AQID");
        assert_eq!(json["Role"], 1);

        let back: Peer = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample()[0]);
    }

    #[test]
    fn test_json_rejects_unknown_role() {
        let raw = r#"{"PublicEndpoint":"","VPNIP":"10.118.0.2","VPNPubKey":"","Role":7}"#;
        assert!(serde_json::from_str::<Peer>(raw).is_err());
    }
}
