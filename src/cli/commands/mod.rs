//! CLI command implementations.

mod config;
mod start;
mod state;

pub use config::{run_config, ConfigArgs};
pub use start::{run_start_with_config, StartArgs};
pub use state::{run_state, StateArgs};
