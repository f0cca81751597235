//! Configuration parsing and validation.
//!
//! The coordinator reads one TOML file. Every field has a default, so an empty
//! file is a valid development configuration; CLI overrides are applied on
//! top before validation.

use crate::control::CoreOptions;
use crate::net::attestation::Variant;
use crate::net::tcp::is_host_port;
use crate::store::wrapper::{IpRange, VpnIpRanges};
use crate::api::ApiOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listeners, ports and deadlines.
    #[serde(default)]
    pub network: NetworkConfig,

    /// VPN address pools.
    #[serde(default)]
    pub vpn: VpnConfig,

    #[serde(default)]
    pub attestation: AttestationConfig,

    /// Replicated store the Core switches to after bootstrap.
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub paths: PathConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind address of the public API.
    #[serde(default = "default_public_bind")]
    pub public_bind: String,

    /// Host (or `host:port`) other peers use to reach this peer. Empty means
    /// `public_bind`.
    #[serde(default)]
    pub public_endpoint: String,

    /// Port appended to endpoints given without one.
    #[serde(default = "default_public_port")]
    pub public_port: u16,

    /// Port of the in-VPN API.
    #[serde(default = "default_vpn_api_port")]
    pub vpn_api_port: u16,

    /// Coordinator VPN IP used when the peer registry names none.
    #[serde(default = "default_coordinator_vpn_ip")]
    pub coordinator_vpn_ip: String,

    #[serde(default = "default_rpc_deadline_secs")]
    pub rpc_deadline_secs: u64,

    #[serde(default = "default_kms_deadline_secs")]
    pub kms_deadline_secs: u64,

    /// Period of the node update loop.
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    /// TCP connect timeout for outbound calls.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            public_bind: default_public_bind(),
            public_endpoint: String::new(),
            public_port: default_public_port(),
            vpn_api_port: default_vpn_api_port(),
            coordinator_vpn_ip: default_coordinator_vpn_ip(),
            rpc_deadline_secs: default_rpc_deadline_secs(),
            kms_deadline_secs: default_kms_deadline_secs(),
            update_interval_secs: default_update_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// VPN address pools. Both ranges are inclusive and must not overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    #[serde(default = "default_coordinator_range_start")]
    pub coordinator_range_start: String,
    #[serde(default = "default_coordinator_range_end")]
    pub coordinator_range_end: String,
    #[serde(default = "default_node_range_start")]
    pub node_range_start: String,
    #[serde(default = "default_node_range_end")]
    pub node_range_end: String,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            coordinator_range_start: default_coordinator_range_start(),
            coordinator_range_end: default_coordinator_range_end(),
            node_range_start: default_node_range_start(),
            node_range_end: default_node_range_end(),
        }
    }
}

/// Attestation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationConfig {
    /// Platform variant name, e.g. `dummy`.
    #[serde(default = "default_variant")]
    pub variant: String,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            variant: default_variant(),
        }
    }
}

/// Replicated store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// etcd endpoint, `host:port`.
    #[serde(default = "default_store_endpoint")]
    pub endpoint: String,

    /// CA certificate path. TLS is used when all three paths are set.
    pub ca_cert_path: Option<String>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,

    /// Prefix of every stored key.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Attempts per call on transient errors, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// TTL of the lease behind each transaction lock.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_store_endpoint(),
            ca_cert_path: None,
            cert_path: None,
            key_path: None,
            namespace: default_namespace(),
            retry_attempts: default_retry_attempts(),
            dial_timeout_secs: default_dial_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

/// Filesystem path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Where the activated peer records its role, VPN identity and IDs.
    #[serde(default = "default_node_state_path")]
    pub node_state: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            node_state: default_node_state_path(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_public_bind() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_public_port() -> u16 {
    9000
}

fn default_vpn_api_port() -> u16 {
    9027
}

fn default_coordinator_vpn_ip() -> String {
    "10.118.0.1".to_string()
}

fn default_rpc_deadline_secs() -> u64 {
    60
}

fn default_kms_deadline_secs() -> u64 {
    20
}

fn default_update_interval_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_coordinator_range_start() -> String {
    "10.118.0.1".to_string()
}

fn default_coordinator_range_end() -> String {
    "10.118.0.10".to_string()
}

fn default_node_range_start() -> String {
    "10.118.0.11".to_string()
}

fn default_node_range_end() -> String {
    "10.118.255.254".to_string()
}

fn default_variant() -> String {
    "dummy".to_string()
}

fn default_store_endpoint() -> String {
    "127.0.0.1:2379".to_string()
}

fn default_namespace() -> String {
    crate::store::DEFAULT_NAMESPACE.to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_node_state_path() -> String {
    "/run/state/constellation/node_state.json".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref public_bind) = overrides.public_bind {
            self.network.public_bind = public_bind.clone();
        }
        if let Some(ref public_endpoint) = overrides.public_endpoint {
            self.network.public_endpoint = public_endpoint.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_network()?;
        self.validate_vpn()?;
        self.validate_attestation()?;
        self.validate_store()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_network(&self) -> Result<()> {
        let network = &self.network;
        self.public_bind_addr()?;

        if network.public_port == 0 || network.vpn_api_port == 0 {
            anyhow::bail!("network.public_port and network.vpn_api_port must be > 0");
        }
        if network.public_port == network.vpn_api_port {
            anyhow::bail!(
                "network.public_port and network.vpn_api_port must differ, both are {}",
                network.public_port
            );
        }
        if network.rpc_deadline_secs == 0
            || network.kms_deadline_secs == 0
            || network.update_interval_secs == 0
            || network.connect_timeout_secs == 0
        {
            anyhow::bail!("network deadlines and intervals must be > 0");
        }
        if network.public_endpoint.contains("://") {
            anyhow::bail!(
                "network.public_endpoint must be a host or host:port, got: {}",
                network.public_endpoint
            );
        }
        Ok(())
    }

    fn validate_vpn(&self) -> Result<()> {
        let ranges = self.vpn_ranges()?;
        for (name, range) in [("coordinator", ranges.coordinator), ("node", ranges.node)] {
            if u32::from(range.start) > u32::from(range.end) {
                anyhow::bail!("vpn.{}_range start {} is after end {}", name, range.start, range.end);
            }
        }
        let overlap = ranges.coordinator.contains(ranges.node.start)
            || ranges.coordinator.contains(ranges.node.end)
            || ranges.node.contains(ranges.coordinator.start);
        if overlap {
            anyhow::bail!("vpn coordinator and node ranges overlap");
        }

        let fallback = parse_ip("network.coordinator_vpn_ip", &self.network.coordinator_vpn_ip)?;
        if !ranges.coordinator.contains(fallback) {
            anyhow::bail!(
                "network.coordinator_vpn_ip {} is outside the coordinator range",
                fallback
            );
        }
        Ok(())
    }

    fn validate_attestation(&self) -> Result<()> {
        self.variant()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        let store = &self.store;
        if !is_host_port(&store.endpoint) && !store.endpoint.contains("://") {
            anyhow::bail!("store.endpoint must be host:port, got: {}", store.endpoint);
        }
        if store.retry_attempts == 0 {
            anyhow::bail!("store.retry_attempts must be > 0");
        }
        if store.lease_ttl_secs == 0 || store.dial_timeout_secs == 0 {
            anyhow::bail!("store.lease_ttl_secs and store.dial_timeout_secs must be > 0");
        }
        let set = [&store.ca_cert_path, &store.cert_path, &store.key_path]
            .iter()
            .filter(|p| p.is_some())
            .count();
        if set != 0 && set != 3 {
            anyhow::bail!("store TLS requires ca_cert_path, cert_path and key_path together");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    pub fn public_bind_addr(&self) -> Result<SocketAddr> {
        self.network
            .public_bind
            .parse()
            .with_context(|| format!("invalid network.public_bind: {}", self.network.public_bind))
    }

    pub fn variant(&self) -> Result<Variant> {
        Variant::from_name(&self.attestation.variant).with_context(|| {
            format!("unknown attestation.variant: {}", self.attestation.variant)
        })
    }

    pub fn vpn_ranges(&self) -> Result<VpnIpRanges> {
        let vpn = &self.vpn;
        Ok(VpnIpRanges {
            coordinator: IpRange::new(
                parse_ip("vpn.coordinator_range_start", &vpn.coordinator_range_start)?,
                parse_ip("vpn.coordinator_range_end", &vpn.coordinator_range_end)?,
            ),
            node: IpRange::new(
                parse_ip("vpn.node_range_start", &vpn.node_range_start)?,
                parse_ip("vpn.node_range_end", &vpn.node_range_end)?,
            ),
        })
    }

    /// The `host:port` this peer advertises on the public API.
    pub fn advertised_endpoint(&self) -> Result<String> {
        if self.network.public_endpoint.is_empty() {
            return Ok(self.public_bind_addr()?.to_string());
        }
        Ok(crate::api::public::endpoint_with_port(
            &self.network.public_endpoint,
            self.network.public_port,
        ))
    }

    pub fn api_options(&self) -> Result<ApiOptions> {
        let network = &self.network;
        Ok(ApiOptions {
            public_endpoint: self.advertised_endpoint()?,
            public_port: network.public_port,
            vpn_api_port: network.vpn_api_port,
            rpc_deadline: Duration::from_secs(network.rpc_deadline_secs),
            kms_deadline: Duration::from_secs(network.kms_deadline_secs),
            update_interval: Duration::from_secs(network.update_interval_secs),
        })
    }

    pub fn core_options(&self) -> Result<CoreOptions> {
        Ok(CoreOptions {
            ranges: self.vpn_ranges()?,
            node_state_path: PathBuf::from(&self.paths.node_state),
            coordinator_vpn_ip_fallback: self.network.coordinator_vpn_ip.clone(),
            node_name: String::new(),
        })
    }

    #[cfg(feature = "grpc")]
    pub fn etcd_options(&self) -> crate::store::etcd::EtcdOptions {
        use crate::store::etcd::{EtcdOptions, EtcdTls};

        let store = &self.store;
        let tls = match (&store.ca_cert_path, &store.cert_path, &store.key_path) {
            (Some(ca), Some(cert), Some(key)) => Some(EtcdTls {
                ca_cert: PathBuf::from(ca),
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
            }),
            _ => None,
        };
        EtcdOptions {
            endpoint: store.endpoint.clone(),
            tls,
            dial_timeout: Duration::from_secs(store.dial_timeout_secs),
            retry_attempts: store.retry_attempts,
            retry_backoff: EtcdOptions::default().retry_backoff,
            lease_ttl: store.lease_ttl_secs as i64,
        }
    }
}

fn parse_ip(field: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .with_context(|| format!("{} is not an IPv4 address: {}", field, value))
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override the public API bind address.
    pub public_bind: Option<String>,
    /// Override the advertised public endpoint.
    pub public_endpoint: Option<String>,
}
