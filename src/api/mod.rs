//! RPC surface of a peer.
//!
//! - [`proto`] - wire messages
//! - [`rpc`] - call envelope, server loop and client streams
//! - [`public`] - the public API (attested TLS, port 9000)
//! - [`vpn`] - the in-VPN API (plaintext, port 9027)
//! - [`client`] - typed clients for both

pub mod client;
pub mod proto;
pub mod public;
pub mod rpc;
pub mod vpn;

pub use client::{PublicClient, VpnClient};
pub use public::{ApiOptions, PublicApi};
pub use rpc::{RpcServer, RpcService};
pub use vpn::{VpnApi, VpnApiServer, VpnApiServerHandle};
