//! Connection registry
//!
//! Every live connection is tracked here so the server can force-close
//! the lot on shutdown. Insertion happens at accept time, removal when a
//! connection closes; in-flight tasks keep their own shared references,
//! so removal never destroys a connection that is still being serviced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tracing::debug;

use super::stats::ConnectionStats;
use super::tcp::Connection;
use crate::context::NetContext;
use crate::service::ServicePort;

/// Registry of live connections
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<u64, Arc<Connection>>,
    next_id: AtomicU64,
    stats: ConnectionStats,
}

impl ConnectionManager {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build and register a connection for an accepted socket
    pub(crate) fn create_connection(
        &self,
        stream: TcpStream,
        service_port: Arc<ServicePort>,
        ctx: Arc<NetContext>,
    ) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, stream, service_port, ctx);
        self.connections.insert(id, Arc::clone(&connection));
        self.stats.record_accepted();
        debug!(id, live = self.connections.len(), "Connection registered");
        connection
    }

    /// Remove a connection from the registry
    ///
    /// Safe to call more than once for the same connection.
    pub fn release(&self, connection: &Connection) {
        if self.connections.remove(&connection.id()).is_some() {
            self.stats.record_released();
        }
    }

    /// Force-close every live connection and clear the registry
    pub fn close_all(&self) {
        let live: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        debug!(count = live.len(), "Closing all connections");
        for connection in live {
            connection.close(true);
        }

        self.connections.clear();
    }

    /// Number of live connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Lifecycle counters
    #[must_use]
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}
