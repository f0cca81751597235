//! State command: read a peer's lifecycle state and VPN peers.

use crate::api::PublicClient;
use crate::net::attestation::DummyValidator;
use crate::net::{DialMode, Dialer, TcpNetwork};
use crate::peer::Peer;
use crate::state::State;
use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;

/// Query a peer's public API.
#[derive(Args, Debug)]
pub struct StateArgs {
    /// Public API endpoint of the peer, `host[:port]`.
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    pub endpoint: String,

    /// Output format (text, json).
    #[arg(long, default_value = "text")]
    pub format: String,

    /// Call deadline in seconds.
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
}

/// Run the state command.
pub async fn run_state(args: StateArgs) -> Result<()> {
    let deadline = Duration::from_secs(args.timeout);
    // Unverified dials never consult the validator.
    let dialer = Dialer::new(TcpNetwork::new(deadline).shared(), Arc::new(DummyValidator));
    let client = PublicClient::new(
        dialer,
        crate::api::public::endpoint_with_port(&args.endpoint, 9000),
        DialMode::Unverified,
        deadline,
    );

    let state = client
        .get_state()
        .await
        .with_context(|| format!("GetState on {}", client.endpoint()))?;
    // Only activated peers keep a peer registry.
    let peers = if matches!(state, State::ActivatingNodes | State::IsNode) {
        client
            .get_vpn_peers()
            .await
            .with_context(|| format!("GetVPNPeers on {}", client.endpoint()))?
    } else {
        Vec::new()
    };

    match args.format.as_str() {
        "json" => println!("{}", render_json(client.endpoint(), state, &peers)?),
        _ => print!("{}", render_text(client.endpoint(), state, &peers)),
    }
    Ok(())
}

fn render_text(endpoint: &str, state: State, peers: &[Peer]) -> String {
    let mut out = String::new();
    out.push_str(&format!("Endpoint: {}\n", endpoint));
    out.push_str(&format!("State:    {}\n", state));
    if !peers.is_empty() {
        out.push_str("\nVPN peers:\n");
        for peer in peers {
            out.push_str(&format!(
                "  {:<16} {:<12} {:<24} {}\n",
                peer.vpn_ip,
                peer.role.to_string(),
                peer.public_endpoint,
                hex::encode(&peer.vpn_pub_key)
            ));
        }
    }
    out
}

fn render_json(endpoint: &str, state: State, peers: &[Peer]) -> Result<String> {
    let value = serde_json::json!({
        "endpoint": endpoint,
        "state": state.to_string(),
        "peers": peers,
    });
    Ok(serde_json::to_string_pretty(&value)?)
}
