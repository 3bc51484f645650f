//! Configuration types for gatecore
//!
//! This module defines the configuration consumed by the connection core.
//! Configuration is loaded from JSON files and validated at startup.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Server configuration consumed by the connection core
///
/// Only the networking subset lives here; game-side settings belong to
/// their own sections in the embedding application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server name announced to clients and matched against the proxy
    /// identification prelude
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// IPv4 address used when `bind_only_global_address` is set
    #[serde(default = "default_ip")]
    pub ip: Ipv4Addr,

    /// Bind acceptors to `ip` instead of all interfaces
    #[serde(default)]
    pub bind_only_global_address: bool,

    /// Per-connection inbound packet budget, in packets per second
    #[serde(default = "default_max_packets_per_second")]
    pub max_packets_per_second: u32,

    /// TCP accept backlog for every service port
    #[serde(default = "default_backlog")]
    pub tcp_backlog: u32,
}

fn default_server_name() -> String {
    "Valoria".into()
}

const fn default_ip() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

const fn default_max_packets_per_second() -> u32 {
    25
}

const fn default_backlog() -> u32 {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            ip: default_ip(),
            bind_only_global_address: false,
            max_packets_per_second: default_max_packets_per_second(),
            tcp_backlog: default_backlog(),
        }
    }
}

impl ServerConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "server_name must not be empty".into(),
            ));
        }

        // The identification prelude is `server_name` + a line feed; a name
        // containing control characters can never match it on the wire.
        if self.server_name.chars().any(char::is_control) {
            return Err(ConfigError::ValidationError(
                "server_name must not contain control characters".into(),
            ));
        }

        if self.max_packets_per_second == 0 {
            return Err(ConfigError::ValidationError(
                "max_packets_per_second must be greater than zero".into(),
            ));
        }

        if self.tcp_backlog == 0 {
            return Err(ConfigError::ValidationError(
                "tcp_backlog must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
