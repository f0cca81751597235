//! Control plane core.
//!
//! - [`core`] - the Core: store, VPN driver, KMS and lifecycle state behind one API
//! - [`collaborators`] - traits for the VPN driver, Kubernetes bootstrap and state disk
//! - [`node_state`] - the node-state file written after activation
//! - [`dev`] - in-memory host drivers for development clusters

pub mod collaborators;
pub mod core;
pub mod dev;
pub mod node_state;

pub use self::core::{Core, CoreDeps, CoreOptions};
pub use collaborators::{ClusterBootstrap, EncryptedDisk, JoinArgs, Vpn};
pub use node_state::NodeState;
