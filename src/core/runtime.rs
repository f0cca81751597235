//! Process lifecycle.
//!
//! The runtime wires a peer together and runs it:
//! - Start order: attestation → Core (advanced to AcceptingInit) → in-VPN
//!   server handle → public API listener
//! - Shutdown order: public API listener → update loop and in-VPN server
//!
//! The in-VPN API is not started here; activation brings it up on the peer's
//! VPN address once one is assigned.

use crate::api::{PublicApi, RpcServer, VpnApiServerHandle};
use crate::control::dev::{DevCluster, DevDisk, DevVpn};
use crate::control::{ClusterBootstrap, Core, CoreDeps, EncryptedDisk, Vpn};
use crate::core::config::Config;
use crate::core::error::CoordinatorResult;
use crate::kms::UriKmsProvider;
use crate::net::attestation::{self, Variant};
use crate::net::tcp::TcpNetwork;
use crate::net::{atls, Dialer, Network};
use crate::state::State;
use crate::store::memory::MemoryStore;
use crate::store::PersistentStoreFactory;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Host facilities the Core drives.
#[derive(Clone)]
pub struct HostDrivers {
    pub vpn: Arc<dyn Vpn>,
    pub cluster: Arc<dyn ClusterBootstrap>,
    pub disk: Arc<dyn EncryptedDisk>,
}

impl HostDrivers {
    /// Built-in drivers for `variant`. Only development clusters have any.
    pub fn for_variant(variant: Variant) -> Result<Self> {
        match variant {
            Variant::Dummy => Ok(Self {
                vpn: Arc::new(DevVpn::new()),
                cluster: Arc::new(DevCluster),
                disk: Arc::new(DevDisk::default()),
            }),
            other => anyhow::bail!("no built-in host drivers for attestation variant {}", other),
        }
    }
}

/// Coordinator runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    network: Arc<dyn Network>,
    drivers: HostDrivers,
    persistent_store: Arc<dyn PersistentStoreFactory>,

    /// Public API, present once started.
    api: Option<Arc<PublicApi>>,

    /// Address the public API listener is bound to.
    local_addr: Option<String>,

    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    server_handle: Option<JoinHandle<CoordinatorResult<()>>>,
}

impl Runtime {
    /// Create a runtime with the production transport, the built-in host
    /// drivers and the etcd-backed replicated store.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let network =
            TcpNetwork::new(Duration::from_secs(config.network.connect_timeout_secs)).shared();
        let drivers = HostDrivers::for_variant(config.variant()?)?;
        let persistent_store = replicated_store(&config)?;
        Self::with_parts(config, network, drivers, persistent_store)
    }

    /// Create a runtime from explicit parts.
    pub fn with_parts(
        config: Config,
        network: Arc<dyn Network>,
        drivers: HostDrivers,
        persistent_store: Arc<dyn PersistentStoreFactory>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            network,
            drivers,
            persistent_store,
            api: None,
            local_addr: None,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            server_handle: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn api(&self) -> Option<&Arc<PublicApi>> {
        self.api.as_ref()
    }

    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Build the peer and start serving the public API.
    pub async fn start(&mut self) -> Result<()> {
        let variant = self.config.variant()?;
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            %variant,
            bind = %self.config.network.public_bind,
            "starting coordinator"
        );

        let (issuer, validator) =
            attestation::for_variant(variant).context("attestation setup failed")?;
        let dialer = Dialer::new(self.network.clone(), validator);

        let core = Core::new(
            CoreDeps {
                vpn: self.drivers.vpn.clone(),
                cluster: self.drivers.cluster.clone(),
                disk: self.drivers.disk.clone(),
                kms_provider: Arc::new(UriKmsProvider),
                store: Arc::new(MemoryStore::new()),
                persistent_store: self.persistent_store.clone(),
            },
            self.config.core_options()?,
        )
        .await
        .context("failed to create core")?;
        core.advance_state(State::AcceptingInit, None, None)
            .context("failed to initialize core")?;
        let core = Arc::new(core);

        let vpn_server = Arc::new(VpnApiServerHandle::new(core.clone(), self.network.clone()));
        let api = Arc::new(PublicApi::new(
            core,
            dialer,
            vpn_server,
            self.config.api_options()?,
        ));

        let acceptor =
            atls::server_acceptor(issuer).context("failed to create server TLS config")?;
        let server = Arc::new(RpcServer::new("pubapi", api.clone()).with_tls(acceptor));
        let listener = self
            .network
            .listen(&self.config.network.public_bind)
            .await
            .context("failed to create listener")?;
        let local_addr = listener.local_addr();
        tracing::info!(address = %local_addr, "server listener created");

        let shutdown_rx = self.shutdown_rx.clone();
        self.server_handle = Some(tokio::spawn(server.serve(listener, shutdown_rx)));
        self.api = Some(api);
        self.local_addr = Some(local_addr);
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until SIGINT, a shutdown request or a server failure.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        if let Some(handle) = self.server_handle.take() {
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("shutdown signal received (SIGINT)");
                }
                _ = async {
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                } => {
                    tracing::info!("shutdown requested by component");
                }
                result = handle => {
                    match result {
                        Ok(Ok(())) => tracing::info!("public API server stopped normally"),
                        Ok(Err(e)) => tracing::error!(error = %e, "public API server failed"),
                        Err(e) => tracing::error!(error = %e, "public API server task panicked"),
                    }
                }
            }
        }

        self.stop().await
    }

    /// Stop the listener, then the update loop and the in-VPN server.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping coordinator");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.server_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(Ok(()))) => tracing::info!("public API server stopped"),
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "public API server stopped with error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "public API server task panicked"),
                Err(_) => tracing::warn!("public API server stop timed out"),
            }
        }
        if let Some(api) = &self.api {
            api.close().await;
        }

        tracing::info!("coordinator stopped");
        Ok(())
    }
}

#[cfg(feature = "grpc")]
fn replicated_store(config: &Config) -> Result<Arc<dyn PersistentStoreFactory>> {
    use crate::store::etcd::EtcdStoreFactory;

    Ok(Arc::new(
        EtcdStoreFactory::new(config.etcd_options()).with_namespace(config.store.namespace.clone()),
    ))
}

#[cfg(not(feature = "grpc"))]
fn replicated_store(_config: &Config) -> Result<Arc<dyn PersistentStoreFactory>> {
    anyhow::bail!("built without the `grpc` feature; no replicated store is available")
}
