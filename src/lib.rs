//! gatecore: asynchronous TCP connection core for a game server
//!
//! This crate implements the network front of an MMORPG-style server:
//! accepting TCP connections, demultiplexing them to application
//! protocols, validating first-packet checksums, enforcing per-connection
//! timeouts and packet-rate limits, and driving the shutdown sequence.
//!
//! # Architecture
//!
//! ```text
//! Client ── TCP ──> ServicePort ──> Connection ──> Protocol handler
//!                       |               |
//!                  service list    header/body loop,
//!                  (protocol id)   write queue, timers
//!                       |               |
//!                ServiceManager   ConnectionManager
//! ```
//!
//! A [`service::ServicePort`] accepts sockets and either binds a protocol
//! immediately (single-socket services, where the server talks first) or
//! defers the choice to the first packet byte. Each
//! [`connection::Connection`] runs a read task and a write task against
//! the shared runtime; complete frames are handed to the bound
//! [`protocol::Protocol`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use gatecore::config::ServerConfig;
//! use gatecore::connection::Connection;
//! use gatecore::context::NetContext;
//! use gatecore::message::NetworkMessage;
//! use gatecore::protocol::{Protocol, ProtocolKind};
//! use gatecore::service::ServiceManager;
//!
//! struct Echo {
//!     connection: Arc<Connection>,
//! }
//!
//! impl Protocol for Echo {
//!     fn on_recv_first_message(&self, msg: &mut NetworkMessage) {
//!         let mut reply = gatecore::message::OutputMessage::new();
//!         reply.add_bytes(msg.payload());
//!         reply.write_message_length();
//!         self.connection.send(reply);
//!     }
//! }
//!
//! impl ProtocolKind for Echo {
//!     const PROTOCOL_ID: u8 = 0x01;
//!     const NAME: &'static str = "echo";
//!     const USES_CHECKSUM: bool = false;
//!     const SERVER_SENDS_FIRST: bool = false;
//!
//!     fn new(connection: Arc<Connection>) -> Self {
//!         Self { connection }
//!     }
//! }
//!
//! # async fn example() {
//! let ctx = NetContext::with_defaults(ServerConfig::default());
//! let services = ServiceManager::new(Arc::clone(&ctx));
//! services.add::<Echo>(7171);
//! services.run().await;
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: configuration types and loading
//! - [`connection`]: per-socket state machine and registry
//! - [`context`]: shared runtime handles
//! - [`checksum`]: first-packet Adler-32
//! - [`dispatcher`]: deferred protocol lifecycle events
//! - [`error`]: error types
//! - [`message`]: wire message buffers
//! - [`policy`]: connection acceptance policy
//! - [`protocol`]: protocol handler traits
//! - [`service`]: service ports and their manager

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod checksum;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod policy;
pub mod protocol;
pub mod service;

// Re-export commonly used types at the crate root
pub use checksum::adler32;
pub use config::{load_config, load_config_str, load_config_with_env, ServerConfig};
pub use connection::{
    format_ip, Connection, ConnectionManager, ConnectionState, ConnectionStats, StatsSnapshot,
    CONNECTION_READ_TIMEOUT, CONNECTION_WRITE_TIMEOUT,
};
pub use context::NetContext;
pub use dispatcher::EventDispatcher;
pub use error::{ConfigError, ConnectionError, GateError, Result, ServiceError};
pub use message::{
    NetworkMessage, OutputMessage, CHECKSUM_LENGTH, HEADER_LENGTH, INPUTMESSAGE_MAXSIZE,
    OUTPUTMESSAGE_MAXSIZE,
};
pub use policy::{AcceptancePolicy, AllowAllPolicy};
pub use protocol::{Protocol, ProtocolKind, Service, ServiceDef};
pub use service::{ServiceManager, ServicePort, BIND_RETRY_DELAY, DEATH_TIMER_DELAY};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
