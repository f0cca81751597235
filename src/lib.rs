//! Coordinator - control plane of a confidential-computing cluster.
//!
//! Every peer of the cluster runs the same binary. An administrator activates
//! one peer as the first coordinator; that coordinator then activates the
//! other peers as nodes or additional coordinators, assigns each a VPN
//! address, and keeps the VPN peer set of the whole cluster in sync.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │        Public API (attested TLS, :9000)  │  In-VPN API (:9027)  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                             Core                                │
//! │   state machine │ peer registry │ KMS │ VPN │ cluster bootstrap │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Store                                │
//! │        in-memory until bootstrap │ replicated (etcd) after      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Process lifecycle
//! - [`core::error`] - Error types and RPC status codes
//!
//! ## State
//! - [`state`] - Peer lifecycle state machine
//! - [`peer`] - Peer records and roles
//! - [`store`] - Key/value store, transactions and typed accessors
//! - [`kms`] - Data key derivation
//!
//! ## Control Plane
//! - [`control::core`] - The Core
//! - [`control::collaborators`] - VPN driver, Kubernetes bootstrap and state disk
//!
//! ## Networking and RPC
//! - [`net`] - Transport seams, framing and attested TLS
//! - [`api`] - Wire messages, public and in-VPN APIs, clients
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - Lifecycle states only move forward; `Failed` is terminal.
//! - VPN addresses come from two disjoint pools and are never handed out twice.
//! - The peers resource version never decreases.
//! - Activation advances the state before acting on the caller's behalf.

// Core infrastructure
pub mod core;

// Lifecycle, peers and storage
pub mod kms;
pub mod peer;
pub mod state;
pub mod store;

// Control plane
pub mod control;

// Networking and RPC
pub mod api;
pub mod net;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
pub use control::{Core, CoreDeps, CoreOptions};
pub use peer::{Peer, Role};
pub use state::State;
