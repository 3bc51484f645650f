//! Configuration types and loading
//!
//! The connection core reads a small, read-only view of the server
//! configuration: the announced server name, the bind address policy and
//! the per-connection packet budget.

mod loader;
mod types;

pub use loader::{load_config, load_config_str, load_config_with_env};
pub use types::ServerConfig;
