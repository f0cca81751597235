//! Networking layer.
//!
//! - [`tcp`] - transport seams and the TCP transport
//! - [`framing`] - length-delimited protobuf frames
//! - [`attestation`] - attestation issuer/validator traits and variants
//! - [`atls`] - attested TLS handshake
//! - [`dialer`] - outbound connections in verified, unverified and insecure mode

pub mod atls;
pub mod attestation;
pub mod dialer;
pub mod framing;
pub mod tcp;

pub use dialer::{DialMode, Dialer};
pub use tcp::{BoxedStream, NetListener, Network, TcpNetwork};
