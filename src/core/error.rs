//! Error types and RPC status mapping.
//!
//! Every fallible operation of the control plane returns [`CoordinatorError`].
//! The RPC layer reduces it to a numeric [`RpcCode`] plus message, which is
//! what a remote caller observes.

use crate::state::State;
use crate::store::wrapper::IpPool;
use crate::store::StoreError;
use thiserror::Error;

/// Common coordinator error conditions.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Request carried missing or malformed arguments.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Request arrived in the wrong lifecycle phase.
    #[error("failed precondition: {message}")]
    FailedPrecondition { message: String },

    /// Attempted non-monotone state advance.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: State, to: State },

    /// A collaborator or remote peer could not be reached.
    #[error("unavailable: {message}")]
    Unavailable { message: String },

    /// Any other backend failure.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Key management failure.
    #[error("kms: {message}")]
    Kms { message: String },

    /// Allocator ran past the end of a VPN range.
    #[error("no IPs left to assign in {pool} range")]
    IpExhausted { pool: IpPool },

    /// Attestation issuance or validation failure.
    #[error("attestation: {message}")]
    Attestation { message: String },

    /// Error status returned by a remote peer.
    #[error("rpc failed ({code}): {message}")]
    Rpc { code: RpcCode, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Create an InvalidArgument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a FailedPrecondition error.
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    /// Create an Unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a Kms error.
    pub fn kms(message: impl Into<String>) -> Self {
        Self::Kms {
            message: message.into(),
        }
    }

    /// Create an Attestation error.
    pub fn attestation(message: impl Into<String>) -> Self {
        Self::Attestation {
            message: message.into(),
        }
    }

    /// Status code a remote caller observes for this error.
    pub fn rpc_code(&self) -> RpcCode {
        match self {
            Self::InvalidArgument { .. } => RpcCode::InvalidArgument,
            Self::FailedPrecondition { .. } => RpcCode::FailedPrecondition,
            Self::Unavailable { .. } => RpcCode::Unavailable,
            Self::Rpc { code, .. } => *code,
            _ => RpcCode::Internal,
        }
    }

    /// Message sent alongside the status code.
    pub fn rpc_message(&self) -> String {
        match self {
            Self::InvalidArgument { message }
            | Self::FailedPrecondition { message }
            | Self::Unavailable { message }
            | Self::Internal { message }
            | Self::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a status received on the wire.
    pub fn from_status(code: RpcCode, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Check whether the store reported the requested key as unset.
    pub fn is_value_unset(&self) -> bool {
        matches!(self, Self::Store(StoreError::ValueUnset { .. }))
    }
}

/// Result type using CoordinatorError.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Wrap any displayable error as Internal with a context prefix.
///
/// Used by the RPC handlers, which surface every non-argument,
/// non-precondition failure as Internal.
pub fn internal<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> CoordinatorError {
    move |e| CoordinatorError::internal(format!("{}: {}", context, e))
}

// ============================================================================
// RPC status codes
// ============================================================================

/// Status codes carried in the terminal frame of every RPC.
///
/// Numeric values follow the gRPC status code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl RpcCode {
    /// Decode a wire value; unknown values map to Unknown.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// Wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for RpcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "Ok",
            Self::Cancelled => "Cancelled",
            Self::Unknown => "Unknown",
            Self::InvalidArgument => "InvalidArgument",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::PermissionDenied => "PermissionDenied",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::Aborted => "Aborted",
            Self::OutOfRange => "OutOfRange",
            Self::Unimplemented => "Unimplemented",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
            Self::DataLoss => "DataLoss",
            Self::Unauthenticated => "Unauthenticated",
        };
        f.write_str(name)
    }
}
