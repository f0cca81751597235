//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Process lifecycle
//! - [`error`] - Error types and RPC status mapping

pub mod config;
pub mod error;
pub mod runtime;
