//! Wire messages of the public and in-VPN APIs.
//!
//! Every RPC exchanges these messages inside [`RpcFrame`] envelopes. Field
//! tags are part of the wire contract; never renumber them.

/// Method names, one per RPC.
pub mod methods {
    pub const ACTIVATE_AS_COORDINATOR: &str = "/pubapi.API/ActivateAsCoordinator";
    pub const ACTIVATE_AS_NODE: &str = "/pubapi.API/ActivateAsNode";
    pub const ACTIVATE_AS_ADDITIONAL_COORDINATOR: &str = "/pubapi.API/ActivateAsAdditionalCoordinator";
    pub const ACTIVATE_ADDITIONAL_NODES: &str = "/pubapi.API/ActivateAdditionalNodes";
    pub const ACTIVATE_ADDITIONAL_COORDINATOR: &str = "/pubapi.API/ActivateAdditionalCoordinator";
    pub const JOIN_CLUSTER: &str = "/pubapi.API/JoinCluster";
    pub const TRIGGER_NODE_UPDATE: &str = "/pubapi.API/TriggerNodeUpdate";
    pub const TRIGGER_COORDINATOR_UPDATE: &str = "/pubapi.API/TriggerCoordinatorUpdate";
    pub const GET_STATE: &str = "/pubapi.API/GetState";
    pub const GET_VPN_PEERS: &str = "/pubapi.API/GetVPNPeers";
    pub const GET_PEER_VPN_PUBLIC_KEY: &str = "/pubapi.API/GetPeerVPNPublicKey";

    pub const GET_UPDATE: &str = "/vpnapi.API/GetUpdate";
    pub const GET_K8S_JOIN_ARGS: &str = "/vpnapi.API/GetK8SJoinArgs";
    pub const GET_K8S_CERTIFICATE_KEY: &str = "/vpnapi.API/GetK8SCertificateKey";
    pub const GET_DATA_KEY: &str = "/vpnapi.API/GetDataKey";
}

/// Envelope of every frame on an RPC connection.
///
/// The client's first frame names the method. Message frames carry a payload;
/// the server's last frame sets `end_of_stream` with the status.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcFrame {
    #[prost(string, tag = "1")]
    pub method: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub code: u32,
    #[prost(string, tag = "4")]
    pub message: ::prost::alloc::string::String,
    #[prost(bool, tag = "5")]
    pub end_of_stream: bool,
}

// ============================================================================
// Shared
// ============================================================================

/// Peer as seen on the public API.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublicPeer {
    #[prost(string, tag = "1")]
    pub public_endpoint: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub vpn_ip: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub vpn_pub_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub role: u32,
}

/// Peer as seen on the in-VPN API.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VpnPeer {
    #[prost(string, tag = "1")]
    pub public_endpoint: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub vpn_ip: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub vpn_pub_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub role: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogMessage {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
}

// ============================================================================
// Public API
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAsCoordinatorRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub admin_vpn_pub_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, repeated, tag = "2")]
    pub node_public_endpoints: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "3")]
    pub coordinator_public_endpoints: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(bytes = "vec", tag = "4")]
    pub master_secret: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "5")]
    pub kms_uri: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub storage_uri: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub key_encryption_key_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "8")]
    pub use_existing_kek: bool,
    #[prost(string, repeated, tag = "9")]
    pub autoscaling_node_groups: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "10")]
    pub cloud_service_account_uri: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAsCoordinatorResponse {
    #[prost(oneof = "activate_as_coordinator_response::Content", tags = "1, 2")]
    pub content: ::core::option::Option<activate_as_coordinator_response::Content>,
}

pub mod activate_as_coordinator_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "1")]
        AdminConfig(super::AdminConfig),
        #[prost(message, tag = "2")]
        Log(super::LogMessage),
    }
}

/// Everything the admin needs to reach the new cluster.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminConfig {
    #[prost(string, tag = "1")]
    pub admin_vpn_ip: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub coordinator_vpn_pub_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub kubeconfig: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub owner_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub cluster_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAsNodeRequest {
    #[prost(oneof = "activate_as_node_request::Request", tags = "1, 2")]
    pub request: ::core::option::Option<activate_as_node_request::Request>,
}

pub mod activate_as_node_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        InitialRequest(super::ActivateAsNodeInitialRequest),
        #[prost(bytes, tag = "2")]
        StateDiskKey(::prost::alloc::vec::Vec<u8>),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAsNodeInitialRequest {
    #[prost(string, tag = "1")]
    pub node_vpn_ip: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub peers: ::prost::alloc::vec::Vec<PublicPeer>,
    #[prost(bytes = "vec", tag = "3")]
    pub owner_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub cluster_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAsNodeResponse {
    #[prost(oneof = "activate_as_node_response::Response", tags = "1, 2")]
    pub response: ::core::option::Option<activate_as_node_response::Response>,
}

pub mod activate_as_node_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(bytes, tag = "1")]
        NodeVpnPubKey(::prost::alloc::vec::Vec<u8>),
        #[prost(string, tag = "2")]
        StateDiskUuid(::prost::alloc::string::String),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinClusterRequest {
    #[prost(string, tag = "1")]
    pub coordinator_vpn_ip: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinClusterResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAsAdditionalCoordinatorRequest {
    #[prost(string, tag = "1")]
    pub assigned_vpn_ip: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub activating_coordinator_data: ::core::option::Option<PublicPeer>,
    #[prost(message, repeated, tag = "3")]
    pub peers: ::prost::alloc::vec::Vec<PublicPeer>,
    #[prost(bytes = "vec", tag = "4")]
    pub owner_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub cluster_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAsAdditionalCoordinatorResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAdditionalNodesRequest {
    #[prost(string, repeated, tag = "1")]
    pub node_public_endpoints: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAdditionalNodesResponse {
    #[prost(message, optional, tag = "1")]
    pub log: ::core::option::Option<LogMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAdditionalCoordinatorRequest {
    #[prost(string, tag = "1")]
    pub coordinator_public_endpoint: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActivateAdditionalCoordinatorResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TriggerNodeUpdateRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TriggerNodeUpdateResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TriggerCoordinatorUpdateRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TriggerCoordinatorUpdateResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStateRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStateResponse {
    #[prost(uint32, tag = "1")]
    pub state: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetVpnPeersRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetVpnPeersResponse {
    #[prost(message, repeated, tag = "1")]
    pub peers: ::prost::alloc::vec::Vec<PublicPeer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPeerVpnPublicKeyRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPeerVpnPublicKeyResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub coordinator_pub_key: ::prost::alloc::vec::Vec<u8>,
}

// ============================================================================
// In-VPN API
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUpdateRequest {
    #[prost(uint64, tag = "1")]
    pub resource_version: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUpdateResponse {
    #[prost(uint64, tag = "1")]
    pub resource_version: u64,
    #[prost(message, repeated, tag = "2")]
    pub peers: ::prost::alloc::vec::Vec<VpnPeer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetK8sJoinArgsRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetK8sJoinArgsResponse {
    #[prost(string, tag = "1")]
    pub api_server_endpoint: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub token: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub discovery_token_ca_cert_hash: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetK8sCertificateKeyRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetK8sCertificateKeyResponse {
    #[prost(string, tag = "1")]
    pub certificate_key: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDataKeyRequest {
    #[prost(string, tag = "1")]
    pub data_key_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub length: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDataKeyResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub data_key: ::prost::alloc::vec::Vec<u8>,
}
