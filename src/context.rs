//! Shared runtime handles
//!
//! One [`NetContext`] is constructed at process start and passed to every
//! network component. It replaces ambient singletons with an explicit
//! bundle: the configuration view, the connection registry, the
//! acceptance policy and the event dispatcher.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::connection::ConnectionManager;
use crate::dispatcher::EventDispatcher;
use crate::policy::{AcceptancePolicy, AllowAllPolicy};

/// Handle bundle shared by ports, connections and managers
pub struct NetContext {
    /// Read-only server configuration
    pub config: Arc<ServerConfig>,
    /// Registry of live connections
    pub connections: Arc<ConnectionManager>,
    /// Decides which remote addresses may connect
    pub ban: Arc<dyn AcceptancePolicy>,
    /// Runs deferred protocol lifecycle hooks
    pub dispatcher: Arc<EventDispatcher>,
}

impl NetContext {
    /// Build a context with an explicit acceptance policy
    #[must_use]
    pub fn new(config: ServerConfig, ban: Arc<dyn AcceptancePolicy>) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            connections: ConnectionManager::new(),
            ban,
            dispatcher: Arc::new(EventDispatcher::new()),
        })
    }

    /// Build a context that accepts every connection
    #[must_use]
    pub fn with_defaults(config: ServerConfig) -> Arc<Self> {
        Self::new(config, Arc::new(AllowAllPolicy))
    }
}

impl std::fmt::Debug for NetContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetContext")
            .field("server_name", &self.config.server_name)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
