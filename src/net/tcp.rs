//! Transport seams.
//!
//! Everything above this module talks to a [`Network`]: listen on an address,
//! dial an address, move bytes. [`TcpNetwork`] is the production
//! implementation; tests substitute an in-memory network so several peers can
//! run inside one process with their real addresses.

use crate::core::error::{CoordinatorError, CoordinatorResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream, plain or TLS.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Accepting side of a transport.
#[async_trait]
pub trait NetListener: Send + Sync {
    /// Wait for the next connection. Returns the stream and the remote
    /// address as `host:port`.
    async fn accept(&self) -> CoordinatorResult<(BoxedStream, String)>;

    fn local_addr(&self) -> String;
}

/// A transport that can listen and dial.
#[async_trait]
pub trait Network: Send + Sync {
    async fn listen(&self, addr: &str) -> CoordinatorResult<Box<dyn NetListener>>;
    async fn dial(&self, addr: &str) -> CoordinatorResult<BoxedStream>;
}

/// Connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-server connection counters.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    next_id: AtomicU64,
    /// Total connections accepted.
    pub connections_total: AtomicU64,
    /// Currently open connections.
    pub connections_active: AtomicU64,
    /// Connections dropped during the TLS handshake.
    pub handshake_failures: AtomicU64,
}

impl ConnectionMetrics {
    /// Record a new connection and hand out its ID.
    pub fn connection_accepted(&self) -> ConnectionId {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// TCP transport.
#[derive(Debug, Clone)]
pub struct TcpNetwork {
    connect_timeout: Duration,
    nodelay: bool,
}

impl Default for TcpNetwork {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
        }
    }
}

impl TcpNetwork {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Default::default()
        }
    }

    pub fn shared(self) -> Arc<dyn Network> {
        Arc::new(self)
    }
}

#[async_trait]
impl Network for TcpNetwork {
    async fn listen(&self, addr: &str) -> CoordinatorResult<Box<dyn NetListener>> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| CoordinatorError::internal(format!("failed to bind to {}: {}", addr, e)))?;
        Ok(Box::new(TcpNetListener {
            listener,
            nodelay: self.nodelay,
        }))
    }

    async fn dial(&self, addr: &str) -> CoordinatorResult<BoxedStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CoordinatorError::unavailable(format!("dial {}: connect timed out", addr)))?
            .map_err(|e| CoordinatorError::unavailable(format!("dial {}: {}", addr, e)))?;
        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok(Box::new(stream))
    }
}

struct TcpNetListener {
    listener: TokioTcpListener,
    nodelay: bool,
}

#[async_trait]
impl NetListener for TcpNetListener {
    async fn accept(&self) -> CoordinatorResult<(BoxedStream, String)> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| CoordinatorError::internal(format!("accept failed: {}", e)))?;
        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok((Box::new(stream), addr.to_string()))
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

/// Host part of a `host:port` address.
pub fn host_of(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            host.trim_start_matches('[').trim_end_matches(']')
        }
        _ => addr,
    }
}

/// Check that `endpoint` is `host:port` with a non-empty host.
pub fn is_host_port(endpoint: &str) -> bool {
    matches!(endpoint.rsplit_once(':'), Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok())
}
