//! Outbound connections in the three trust modes.

use super::atls;
use super::attestation::Validator;
use super::tcp::{BoxedStream, Network};
use crate::core::error::CoordinatorResult;
use std::sync::Arc;

/// How much a dialed peer must prove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialMode {
    /// TLS; the server must present a valid attestation.
    Verified,
    /// TLS; any server certificate is accepted.
    Unverified,
    /// Plaintext. Only for endpoints inside the VPN.
    Insecure,
}

#[derive(Clone)]
pub struct Dialer {
    network: Arc<dyn Network>,
    validator: Arc<dyn Validator>,
}

impl Dialer {
    pub fn new(network: Arc<dyn Network>, validator: Arc<dyn Validator>) -> Self {
        Self { network, validator }
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    pub async fn dial(&self, addr: &str, mode: DialMode) -> CoordinatorResult<BoxedStream> {
        let stream = self.network.dial(addr).await?;
        tracing::trace!(addr, ?mode, "dialed peer");
        match mode {
            DialMode::Verified => atls::connect(stream, Some(self.validator.clone())).await,
            DialMode::Unverified => atls::connect(stream, None).await,
            DialMode::Insecure => Ok(stream),
        }
    }
}
