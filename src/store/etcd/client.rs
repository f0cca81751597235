//! Minimal etcd v3 gRPC client.
//!
//! Calls go through `tonic::client::Grpc` with the prost codec; no generated
//! service stubs. Transient failures (`Unavailable`) are retried with a
//! linear backoff up to the configured attempt count.

use super::proto::{
    paths, DeleteRangeRequest, DeleteRangeResponse, LeaseGrantRequest, LeaseGrantResponse,
    LeaseRevokeRequest, LeaseRevokeResponse, LockRequest, LockResponse, PutRequest, PutResponse,
    RangeRequest, RangeResponse, RequestOp, TxnRequest, TxnResponse, UnlockRequest,
    UnlockResponse,
};
use crate::store::{StoreError, StoreResult};
use http::uri::PathAndQuery;
use std::path::PathBuf;
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

/// Client certificate material for mutual TLS.
#[derive(Debug, Clone)]
pub struct EtcdTls {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct EtcdOptions {
    /// `host:port`, or a full `http(s)://` URI.
    pub endpoint: String,
    pub tls: Option<EtcdTls>,
    pub dial_timeout: Duration,
    /// Total attempts per call, including the first.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    /// TTL of the lease backing a transaction lock, in seconds.
    pub lease_ttl: i64,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:2379".to_string(),
            tls: None,
            dial_timeout: Duration::from_secs(10),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            lease_ttl: 60,
        }
    }
}

impl EtcdOptions {
    fn uri(&self) -> String {
        if self.endpoint.contains("://") {
            return self.endpoint.clone();
        }
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

/// Connected client.
#[derive(Debug, Clone)]
pub struct EtcdClient {
    channel: Channel,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl EtcdClient {
    /// Connect, waiting up to the dial timeout for the channel to come up.
    pub async fn connect(options: &EtcdOptions) -> StoreResult<Self> {
        let uri = options.uri();
        let channel = endpoint(options)
            .await?
            .connect()
            .await
            .map_err(|e| StoreError::backend(format!("connect to etcd at {}: {}", uri, e)))?;
        tracing::info!(endpoint = %uri, tls = options.tls.is_some(), "connected to etcd");
        Ok(Self::with_channel(channel, options))
    }

    /// Build a client whose channel connects on first use.
    pub async fn connect_lazy(options: &EtcdOptions) -> StoreResult<Self> {
        let channel = endpoint(options).await?.connect_lazy();
        Ok(Self::with_channel(channel, options))
    }

    fn with_channel(channel: Channel, options: &EtcdOptions) -> Self {
        Self {
            channel,
            retry_attempts: options.retry_attempts.max(1),
            retry_backoff: options.retry_backoff,
        }
    }

    pub async fn range(&self, key: Vec<u8>, range_end: Vec<u8>, keys_only: bool) -> StoreResult<RangeResponse> {
        self.call(
            paths::RANGE,
            RangeRequest {
                key,
                range_end,
                keys_only,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> StoreResult<PutResponse> {
        self.call(paths::PUT, PutRequest { key, value, lease: 0 }).await
    }

    pub async fn delete(&self, key: Vec<u8>) -> StoreResult<DeleteRangeResponse> {
        self.call(
            paths::DELETE_RANGE,
            DeleteRangeRequest {
                key,
                range_end: Vec::new(),
            },
        )
        .await
    }

    /// Apply `ops` atomically.
    pub async fn txn(&self, ops: Vec<RequestOp>) -> StoreResult<TxnResponse> {
        let resp: TxnResponse = self
            .call(
                paths::TXN,
                TxnRequest {
                    success: ops,
                    failure: Vec::new(),
                },
            )
            .await?;
        if !resp.succeeded {
            return Err(StoreError::backend("etcd transaction was not applied"));
        }
        Ok(resp)
    }

    /// Grant a lease; returns its ID.
    pub async fn lease_grant(&self, ttl: i64) -> StoreResult<i64> {
        let resp: LeaseGrantResponse = self
            .call(paths::LEASE_GRANT, LeaseGrantRequest { ttl, id: 0 })
            .await?;
        if !resp.error.is_empty() {
            return Err(StoreError::backend(format!("lease grant: {}", resp.error)));
        }
        Ok(resp.id)
    }

    pub async fn lease_revoke(&self, id: i64) -> StoreResult<()> {
        let _: LeaseRevokeResponse = self.call(paths::LEASE_REVOKE, LeaseRevokeRequest { id }).await?;
        Ok(())
    }

    /// Block until the lock `name` is held under `lease`; returns the
    /// ownership key.
    pub async fn lock(&self, name: &[u8], lease: i64) -> StoreResult<Vec<u8>> {
        let resp: LockResponse = self
            .call(
                paths::LOCK,
                LockRequest {
                    name: name.to_vec(),
                    lease,
                },
            )
            .await?;
        Ok(resp.key)
    }

    pub async fn unlock(&self, key: Vec<u8>) -> StoreResult<()> {
        let _: UnlockResponse = self.call(paths::UNLOCK, UnlockRequest { key }).await?;
        Ok(())
    }

    async fn call<Req, Resp>(&self, path: &'static str, req: Req) -> StoreResult<Resp>
    where
        Req: prost::Message + Clone + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call_once(path, req.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(status) if is_transient(&status) && attempt < self.retry_attempts => {
                    tracing::warn!(
                        path,
                        attempt,
                        error = %status.message(),
                        "etcd unavailable, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(status) => {
                    return Err(StoreError::backend(format!(
                        "{} ({:?}): {}",
                        path,
                        status.code(),
                        status.message()
                    )))
                }
            }
        }
    }

    async fn call_once<Req, Resp>(&self, path: &'static str, req: Req) -> Result<Resp, tonic::Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("etcd channel not ready: {}", e)))?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let resp = grpc
            .unary(tonic::Request::new(req), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(resp.into_inner())
    }
}

async fn endpoint(options: &EtcdOptions) -> StoreResult<Endpoint> {
    let uri = options.uri();
    let mut endpoint = Endpoint::from_shared(uri.clone())
        .map_err(|e| StoreError::backend(format!("invalid etcd endpoint {}: {}", uri, e)))?
        .connect_timeout(options.dial_timeout);

    if let Some(tls) = &options.tls {
        let ca = read_pem(&tls.ca_cert).await?;
        let cert = read_pem(&tls.cert).await?;
        let key = read_pem(&tls.key).await?;
        let config = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key));
        endpoint = endpoint
            .tls_config(config)
            .map_err(|e| StoreError::backend(format!("etcd TLS config: {}", e)))?;
    }
    Ok(endpoint)
}

fn is_transient(status: &tonic::Status) -> bool {
    status.code() == tonic::Code::Unavailable
}

async fn read_pem(path: &PathBuf) -> StoreResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| StoreError::backend(format!("read {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_scheme_follows_tls() {
        let mut options = EtcdOptions {
            endpoint: "10.118.0.1:2379".to_string(),
            ..Default::default()
        };
        assert_eq!(options.uri(), "http://10.118.0.1:2379");

        options.tls = Some(EtcdTls {
            ca_cert: "/ca.crt".into(),
            cert: "/peer.crt".into(),
            key: "/peer.key".into(),
        });
        assert_eq!(options.uri(), "https://10.118.0.1:2379");

        options.endpoint = "http://etcd:2379".to_string();
        assert_eq!(options.uri(), "http://etcd:2379");
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(is_transient(&tonic::Status::unavailable("down")));
        assert!(!is_transient(&tonic::Status::not_found("gone")));
        assert!(!is_transient(&tonic::Status::deadline_exceeded("slow")));
    }

    #[tokio::test]
    async fn test_missing_tls_files_fail_before_dialing() {
        let options = EtcdOptions {
            tls: Some(EtcdTls {
                ca_cert: "/nonexistent/ca.crt".into(),
                cert: "/nonexistent/peer.crt".into(),
                key: "/nonexistent/peer.key".into(),
            }),
            ..Default::default()
        };
        let err = EtcdClient::connect(&options).await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.crt"));
    }
}
