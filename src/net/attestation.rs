//! Attestation document issuing and validation.
//!
//! An [`Issuer`] produces a document binding `user_data` and a verifier
//! supplied `nonce` to the platform's measured state; a [`Validator`] checks a
//! document against an expected nonce and returns the bound `user_data`.
//! Documents travel inside a certificate extension whose OID names the
//! platform variant.

use crate::core::error::{CoordinatorError, CoordinatorResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Platform variant, identified by the certificate extension OID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Dummy,
    AwsNitroTpm,
    GcpSevEs,
    AzureSevSnp,
    AzureTrustedLaunch,
    QemuVtpm,
    QemuTdx,
}

impl Variant {
    pub const ALL: [Variant; 7] = [
        Variant::Dummy,
        Variant::AwsNitroTpm,
        Variant::GcpSevEs,
        Variant::AzureSevSnp,
        Variant::AzureTrustedLaunch,
        Variant::QemuVtpm,
        Variant::QemuTdx,
    ];

    pub fn oid(self) -> &'static [u64] {
        match self {
            Variant::Dummy => &[1, 3, 9900, 1, 1],
            Variant::AwsNitroTpm => &[1, 3, 9900, 2, 1],
            Variant::GcpSevEs => &[1, 3, 9900, 3, 1],
            Variant::AzureSevSnp => &[1, 3, 9900, 4, 1],
            Variant::AzureTrustedLaunch => &[1, 3, 9900, 4, 2],
            Variant::QemuVtpm => &[1, 3, 9900, 5, 1],
            Variant::QemuTdx => &[1, 3, 9900, 5, 99],
        }
    }

    /// Dotted form, as printed by x509 tooling.
    pub fn oid_string(self) -> String {
        self.oid()
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn name(self) -> &'static str {
        match self {
            Variant::Dummy => "dummy",
            Variant::AwsNitroTpm => "aws-nitro-tpm",
            Variant::GcpSevEs => "gcp-sev-es",
            Variant::AzureSevSnp => "azure-sev-snp",
            Variant::AzureTrustedLaunch => "azure-trustedlaunch",
            Variant::QemuVtpm => "qemu-vtpm",
            Variant::QemuTdx => "qemu-tdx",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Produces attestation documents.
pub trait Issuer: Send + Sync {
    fn variant(&self) -> Variant;
    fn issue(&self, user_data: &[u8], nonce: &[u8]) -> CoordinatorResult<Vec<u8>>;
}

/// Checks attestation documents.
pub trait Validator: Send + Sync {
    fn variant(&self) -> Variant;
    /// Validate `doc` against `nonce`, returning the bound user data.
    fn validate(&self, doc: &[u8], nonce: &[u8]) -> CoordinatorResult<Vec<u8>>;
}

#[derive(Serialize, Deserialize)]
struct DummyDocument {
    user_data: String,
    nonce: String,
}

/// Issuer that attests nothing. For test and development clusters.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyIssuer;

impl Issuer for DummyIssuer {
    fn variant(&self) -> Variant {
        Variant::Dummy
    }

    fn issue(&self, user_data: &[u8], nonce: &[u8]) -> CoordinatorResult<Vec<u8>> {
        Ok(serde_json::to_vec(&DummyDocument {
            user_data: hex::encode(user_data),
            nonce: hex::encode(nonce),
        })?)
    }
}

/// Accepts documents from [`DummyIssuer`] whose nonce matches.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyValidator;

impl Validator for DummyValidator {
    fn variant(&self) -> Variant {
        Variant::Dummy
    }

    fn validate(&self, doc: &[u8], nonce: &[u8]) -> CoordinatorResult<Vec<u8>> {
        let parsed: DummyDocument = serde_json::from_slice(doc)
            .map_err(|e| CoordinatorError::attestation(format!("malformed document: {}", e)))?;
        let doc_nonce = hex::decode(&parsed.nonce)
            .map_err(|e| CoordinatorError::attestation(format!("malformed nonce: {}", e)))?;
        if doc_nonce != nonce {
            return Err(CoordinatorError::attestation("nonce does not match"));
        }
        hex::decode(&parsed.user_data)
            .map_err(|e| CoordinatorError::attestation(format!("malformed user data: {}", e)))
    }
}

/// Issuer and validator for a configured variant.
pub fn for_variant(variant: Variant) -> CoordinatorResult<(Arc<dyn Issuer>, Arc<dyn Validator>)> {
    match variant {
        Variant::Dummy => Ok((Arc::new(DummyIssuer), Arc::new(DummyValidator))),
        other => Err(CoordinatorError::attestation(format!(
            "attestation variant {} has no built-in issuer",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_round_trip() {
        let doc = DummyIssuer.issue(b"user", b"nonce").unwrap();
        assert_eq!(DummyValidator.validate(&doc, b"nonce").unwrap(), b"user");
    }

    #[test]
    fn test_dummy_rejects_wrong_nonce() {
        let doc = DummyIssuer.issue(b"user", b"nonce").unwrap();
        assert!(DummyValidator.validate(&doc, b"other").is_err());
        assert!(DummyValidator.validate(b"not json", b"nonce").is_err());
    }

    #[test]
    fn test_variant_oids_unique() {
        let mut seen = std::collections::HashSet::new();
        for v in Variant::ALL {
            assert!(seen.insert(v.oid()), "{}", v);
            assert_eq!(Variant::from_name(v.name()), Some(v));
        }
        assert_eq!(Variant::QemuTdx.oid_string(), "1.3.9900.5.99");
    }

    #[test]
    fn test_only_dummy_is_built_in() {
        assert!(for_variant(Variant::Dummy).is_ok());
        assert!(for_variant(Variant::AzureSevSnp).is_err());
    }
}
