//! Connection management
//!
//! This module holds the per-socket state machine ([`Connection`]), the
//! process-wide registry ([`ConnectionManager`]) and the lifecycle
//! counters ([`ConnectionStats`]).

mod manager;
mod stats;
mod tcp;

pub use manager::ConnectionManager;
pub use stats::{ConnectionStats, StatsSnapshot};
pub use tcp::{
    format_ip, Connection, ConnectionState, CONNECTION_READ_TIMEOUT, CONNECTION_WRITE_TIMEOUT,
};
