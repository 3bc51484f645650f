//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment
//! variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::ServerConfig;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<ServerConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: ServerConfig = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        server_name = %config.server_name,
        max_packets_per_second = config.max_packets_per_second,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `GATECORE_SERVER_NAME`: Override the announced server name
/// - `GATECORE_IP`: Override the bind address
/// - `GATECORE_MAX_PACKETS_PER_SECOND`: Override the packet budget
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(name) = std::env::var("GATECORE_SERVER_NAME") {
        config.server_name = name;
        debug!("Server name overridden to {}", config.server_name);
    }

    if let Ok(ip) = std::env::var("GATECORE_IP") {
        config.ip = ip.parse().map_err(|_| ConfigError::EnvError {
            name: "GATECORE_IP".into(),
            reason: format!("Invalid IPv4 address: {ip}"),
        })?;
        debug!("Bind address overridden to {}", config.ip);
    }

    if let Ok(max) = std::env::var("GATECORE_MAX_PACKETS_PER_SECOND") {
        config.max_packets_per_second = max.parse().map_err(|_| ConfigError::EnvError {
            name: "GATECORE_MAX_PACKETS_PER_SECOND".into(),
            reason: format!("Invalid number: {max}"),
        })?;
        debug!(
            "Packet budget overridden to {}",
            config.max_packets_per_second
        );
    }

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}
