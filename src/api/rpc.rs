//! RPC envelope and dispatch.
//!
//! One connection carries one call. The client opens with a frame naming the
//! method and carrying the request; both sides may then exchange further
//! message frames; the server closes with a terminal frame holding the status.
//!
//! ```text
//! client                                server
//!   | RpcFrame{method, payload}  ------>  |
//!   |   <------  RpcFrame{payload}         |  (0..n)
//!   | RpcFrame{payload}          ------>  |  (0..n, bidi calls)
//!   |   <------  RpcFrame{end_of_stream, code, message}
//! ```

use super::proto::RpcFrame;
use crate::core::error::{CoordinatorError, CoordinatorResult, RpcCode};
use crate::net::framing::FramedStream;
use crate::net::tcp::{BoxedStream, ConnectionId, ConnectionMetrics, NetListener};
use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

/// Decode a request payload; malformed input is the caller's fault.
pub fn decode<M: Message + Default>(payload: Bytes) -> CoordinatorResult<M> {
    M::decode(payload).map_err(|e| CoordinatorError::invalid_argument(format!("decode request: {}", e)))
}

/// Error for a method the service does not know.
pub fn unimplemented(method: &str) -> CoordinatorError {
    CoordinatorError::from_status(RpcCode::Unimplemented, format!("unknown method {}", method))
}

/// Apply a deadline to an outbound call.
pub async fn with_deadline<T, F>(deadline: Duration, what: &str, fut: F) -> CoordinatorResult<T>
where
    F: std::future::Future<Output = CoordinatorResult<T>>,
{
    tokio::time::timeout(deadline, fut).await.map_err(|_| {
        CoordinatorError::from_status(
            RpcCode::DeadlineExceeded,
            format!("{} exceeded deadline of {:?}", what, deadline),
        )
    })?
}

// ============================================================================
// Server
// ============================================================================

/// Server half of a call.
pub struct ServerStream {
    framed: FramedStream,
    peer_addr: String,
}

impl ServerStream {
    /// Address the call came from, as `host:port`.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub async fn send<M: Message>(&mut self, msg: &M) -> CoordinatorResult<()> {
        self.framed
            .send(&RpcFrame {
                payload: msg.encode_to_vec(),
                ..Default::default()
            })
            .await
    }

    /// Next client message of a bidirectional call.
    pub async fn recv<M: Message + Default>(&mut self) -> CoordinatorResult<M> {
        match self.framed.recv::<RpcFrame>().await? {
            Some(frame) if !frame.end_of_stream => decode(Bytes::from(frame.payload)),
            _ => Err(CoordinatorError::from_status(
                RpcCode::Cancelled,
                "client closed the stream",
            )),
        }
    }

    async fn finish(&mut self, result: &CoordinatorResult<()>) -> CoordinatorResult<()> {
        let (code, message) = match result {
            Ok(()) => (RpcCode::Ok, String::new()),
            Err(e) => (e.rpc_code(), e.rpc_message()),
        };
        self.framed
            .send(&RpcFrame {
                code: code.as_u32(),
                message,
                end_of_stream: true,
                ..Default::default()
            })
            .await?;
        self.framed.shutdown().await
    }
}

/// A set of RPC handlers.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle `method`. Responses go out through `stream`; the returned status
    /// becomes the terminal frame.
    async fn call(&self, method: &str, payload: Bytes, stream: &mut ServerStream) -> CoordinatorResult<()>;
}

/// Accept loop serving one [`RpcService`].
pub struct RpcServer {
    name: &'static str,
    service: Arc<dyn RpcService>,
    acceptor: Option<TlsAcceptor>,
    metrics: Arc<ConnectionMetrics>,
}

impl RpcServer {
    /// Plaintext server.
    pub fn new(name: &'static str, service: Arc<dyn RpcService>) -> Self {
        Self {
            name,
            service,
            acceptor: None,
            metrics: Arc::new(ConnectionMetrics::default()),
        }
    }

    /// Server performing a TLS handshake on every connection.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    /// Serve until `shutdown` flips to true.
    pub async fn serve(
        self: Arc<Self>,
        listener: Box<dyn NetListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> CoordinatorResult<()> {
        tracing::info!(server = self.name, addr = %listener.local_addr(), "serving");
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let id = self.metrics.connection_accepted();
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle(id, stream, remote).await;
                            server.metrics.connection_closed();
                        });
                    }
                    Err(e) => {
                        tracing::warn!(server = self.name, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(server = self.name, "stopped serving");
        Ok(())
    }

    async fn handle(&self, id: ConnectionId, stream: BoxedStream, remote: String) {
        let stream: BoxedStream = match &self.acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => Box::new(tls),
                Err(e) => {
                    self.metrics.handshake_failed();
                    tracing::debug!(server = self.name, %id, %remote, error = %e, "TLS handshake failed");
                    return;
                }
            },
            None => stream,
        };

        let mut framed = FramedStream::new(stream);
        let opening = match framed.recv::<RpcFrame>().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(server = self.name, %id, error = %e, "bad opening frame");
                return;
            }
        };

        let method = opening.method;
        let mut call = ServerStream {
            framed,
            peer_addr: remote,
        };
        tracing::debug!(server = self.name, %id, %method, peer = %call.peer_addr, "call");
        let result = self
            .service
            .call(&method, Bytes::from(opening.payload), &mut call)
            .await;
        if let Err(e) = &result {
            tracing::info!(server = self.name, %method, code = %e.rpc_code(), error = %e, "call failed");
        }
        if let Err(e) = call.finish(&result).await {
            tracing::debug!(server = self.name, %id, error = %e, "failed to send status");
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client half of a call.
pub struct ClientStream {
    framed: FramedStream,
    method: &'static str,
    finished: bool,
}

impl ClientStream {
    /// Start `method` over an established connection.
    pub async fn open<M: Message>(
        stream: BoxedStream,
        method: &'static str,
        request: &M,
    ) -> CoordinatorResult<Self> {
        let mut framed = FramedStream::new(stream);
        framed
            .send(&RpcFrame {
                method: method.to_string(),
                payload: request.encode_to_vec(),
                ..Default::default()
            })
            .await?;
        Ok(Self {
            framed,
            method,
            finished: false,
        })
    }

    /// Send a further message on a bidirectional call.
    pub async fn send<M: Message>(&mut self, msg: &M) -> CoordinatorResult<()> {
        self.framed
            .send(&RpcFrame {
                payload: msg.encode_to_vec(),
                ..Default::default()
            })
            .await
    }

    /// Next server message; `None` once the server finished successfully.
    pub async fn recv<M: Message + Default>(&mut self) -> CoordinatorResult<Option<M>> {
        if self.finished {
            return Ok(None);
        }
        let frame = self.framed.recv::<RpcFrame>().await?.ok_or_else(|| {
            CoordinatorError::unavailable(format!("{}: connection closed before status", self.method))
        })?;
        if frame.end_of_stream {
            self.finished = true;
            let code = RpcCode::from_u32(frame.code);
            if code == RpcCode::Ok {
                return Ok(None);
            }
            return Err(CoordinatorError::from_status(code, frame.message));
        }
        Ok(Some(M::decode(Bytes::from(frame.payload))?))
    }

    /// Like [`Self::recv`], but a missing message is an error.
    pub async fn recv_message<M: Message + Default>(&mut self) -> CoordinatorResult<M> {
        self.recv().await?.ok_or_else(|| {
            CoordinatorError::internal(format!("{}: stream ended without a response", self.method))
        })
    }

    /// Wait for the terminal status.
    pub async fn finish(&mut self) -> CoordinatorResult<()> {
        while !self.finished {
            if self.recv::<RpcFrame>().await?.is_some() {
                return Err(CoordinatorError::internal(format!(
                    "{}: unexpected message after response",
                    self.method
                )));
            }
        }
        Ok(())
    }
}

/// Single request, single response.
pub async fn unary<Req: Message, Resp: Message + Default>(
    stream: BoxedStream,
    method: &'static str,
    request: &Req,
) -> CoordinatorResult<Resp> {
    let mut call = ClientStream::open(stream, method, request).await?;
    let response = call.recv_message().await?;
    call.finish().await?;
    Ok(response)
}
