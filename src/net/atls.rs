//! Attested TLS.
//!
//! The client picks a fresh 32-byte nonce per connection and sends it as the
//! SNI (`<hex[..32]>.<hex[32..]>.atls`). The server answers with a freshly
//! generated self-signed certificate carrying an attestation document in an
//! extension; the document's user data is the SHA-256 of the certificate's
//! public key and its nonce is the client's. A verifying client validates the
//! document and checks the key binding, so a completed handshake proves the
//! server's platform state.

use super::attestation::{Issuer, Validator};
use super::tcp::BoxedStream;
use crate::core::error::{CoordinatorError, CoordinatorResult};
use rand::RngCore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Lazily-initialized crypto provider for rustls, backed by ring.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

const NONCE_LEN: usize = 32;
const SNI_SUFFIX: &str = "atls";

fn nonce_to_sni(nonce: &[u8]) -> String {
    let hex = hex::encode(nonce);
    format!("{}.{}.{}", &hex[..32], &hex[32..], SNI_SUFFIX)
}

fn nonce_from_sni(sni: &str) -> Option<Vec<u8>> {
    let hex_str: String = sni
        .strip_suffix(SNI_SUFFIX)?
        .split('.')
        .collect();
    let bytes = hex::decode(hex_str).ok()?;
    (bytes.len() == NONCE_LEN).then_some(bytes)
}

fn public_key_digest(public_key: &[u8]) -> Vec<u8> {
    Sha256::digest(public_key).to_vec()
}

// ============================================================================
// Server
// ============================================================================

/// Issues a certificate per handshake, bound to the client's nonce.
struct AttestingCertResolver {
    issuer: Arc<dyn Issuer>,
}

impl std::fmt::Debug for AttestingCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestingCertResolver")
            .field("variant", &self.issuer.variant())
            .finish()
    }
}

impl AttestingCertResolver {
    fn certify(&self, nonce: &[u8]) -> CoordinatorResult<Arc<CertifiedKey>> {
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| CoordinatorError::attestation(format!("generating key: {}", e)))?;
        let user_data = public_key_digest(key_pair.public_key_raw());
        let doc = self.issuer.issue(&user_data, nonce)?;

        let mut params = rcgen::CertificateParams::new(vec!["atls".to_string()])
            .map_err(|e| CoordinatorError::attestation(format!("certificate params: {}", e)))?;
        params
            .custom_extensions
            .push(rcgen::CustomExtension::from_oid_content(
                self.issuer.variant().oid(),
                doc,
            ));
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CoordinatorError::attestation(format!("self-signing: {}", e)))?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = CRYPTO_PROVIDER
            .key_provider
            .load_private_key(key_der)
            .map_err(|e| CoordinatorError::attestation(format!("loading key: {}", e)))?;
        Ok(Arc::new(CertifiedKey::new(
            vec![cert.der().clone()],
            signing_key,
        )))
    }
}

impl ResolvesServerCert for AttestingCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let nonce = client_hello
            .server_name()
            .and_then(nonce_from_sni)
            .unwrap_or_default();
        match self.certify(&nonce) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, "failed to issue attested certificate");
                None
            }
        }
    }
}

/// TLS acceptor that attests with `issuer` on every handshake.
pub fn server_acceptor(issuer: Arc<dyn Issuer>) -> CoordinatorResult<TlsAcceptor> {
    let config = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| CoordinatorError::internal(format!("TLS config: {}", e)))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(AttestingCertResolver { issuer }));
    Ok(TlsAcceptor::from(Arc::new(config)))
}

// ============================================================================
// Client
// ============================================================================

/// Verifies the attestation extension, or accepts anything without a
/// validator. Handshake signatures are checked either way.
struct AttestationVerifier {
    validator: Option<Arc<dyn Validator>>,
    nonce: Vec<u8>,
}

impl std::fmt::Debug for AttestationVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationVerifier")
            .field("variant", &self.validator.as_ref().map(|v| v.variant()))
            .finish()
    }
}

impl AttestationVerifier {
    fn check(&self, validator: &dyn Validator, end_entity: &[u8]) -> Result<(), rustls::Error> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(end_entity)
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        let oid = validator.variant().oid_string();
        let doc = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == oid)
            .map(|ext| ext.value)
            .ok_or_else(|| {
                tracing::debug!(%oid, "certificate carries no attestation extension");
                rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
            })?;

        let user_data = validator.validate(doc, &self.nonce).map_err(|e| {
            tracing::warn!(error = %e, "attestation validation failed");
            rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
        })?;

        let expected = public_key_digest(&cert.public_key().subject_public_key.data);
        if user_data != expected {
            tracing::warn!("attestation document is not bound to the certificate key");
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(())
    }
}

impl ServerCertVerifier for AttestationVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(validator) = &self.validator {
            self.check(validator.as_ref(), end_entity.as_ref())?;
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Run the client handshake over `stream`.
///
/// With a validator the server must present a valid attestation for a fresh
/// nonce; without one any certificate is accepted.
pub async fn connect(
    stream: BoxedStream,
    validator: Option<Arc<dyn Validator>>,
) -> CoordinatorResult<BoxedStream> {
    let mut nonce = vec![0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let server_name = ServerName::try_from(nonce_to_sni(&nonce))
        .map_err(|e| CoordinatorError::internal(format!("nonce SNI: {}", e)))?;

    let config = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| CoordinatorError::internal(format!("TLS config: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AttestationVerifier { validator, nonce }))
        .with_no_client_auth();

    let tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|e| CoordinatorError::unavailable(format!("attested TLS handshake: {}", e)))?;
    Ok(Box::new(tls))
}
