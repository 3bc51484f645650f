//! Listening service port
//!
//! A [`ServicePort`] owns one TCP acceptor and the list of services
//! reachable through it. A port either hosts exactly one single-socket
//! service (protocol bound at accept time) or any number of multiplexed
//! services (protocol chosen from the first packet byte); mixing the two
//! is rejected.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{Connection, CONNECTION_READ_TIMEOUT};
use crate::context::NetContext;
use crate::error::ServiceError;
use crate::message::NetworkMessage;
use crate::protocol::{Protocol, Service};

/// Delay before a failed bind is retried
pub const BIND_RETRY_DELAY: Duration = Duration::from_secs(15);

/// One listening port and its services
pub struct ServicePort {
    ctx: Arc<NetContext>,
    port: AtomicU16,
    services: RwLock<Vec<Arc<dyn Service>>>,
    pending_start: AtomicBool,
    acceptor: Mutex<Option<broadcast::Sender<()>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl ServicePort {
    /// Create a port with no acceptor and no services
    #[must_use]
    pub fn new(ctx: Arc<NetContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            port: AtomicU16::new(0),
            services: RwLock::new(Vec::new()),
            pending_start: AtomicBool::new(false),
            acceptor: Mutex::new(None),
            bound_addr: Mutex::new(None),
        })
    }

    /// Whether the hosted service owns the port exclusively
    #[must_use]
    pub fn is_single_socket(&self) -> bool {
        self.services
            .read()
            .first()
            .is_some_and(|svc| svc.is_single_socket())
    }

    /// Comma-separated service names, for logs
    #[must_use]
    pub fn protocol_names(&self) -> String {
        self.services
            .read()
            .iter()
            .map(|svc| svc.protocol_name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Register a service on this port
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::SingleSocketConflict` when the port already
    /// hosts a single-socket service.
    pub fn add_service(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let mut services = self.services.write();
        if services.iter().any(|svc| svc.is_single_socket()) {
            return Err(ServiceError::SingleSocketConflict {
                port: self.port.load(Ordering::Relaxed),
            });
        }
        services.push(service);
        Ok(())
    }

    /// Bind the acceptor and start accepting
    ///
    /// Any previous acceptor is closed first. On bind failure the port
    /// enters the pending-start state and retries after
    /// [`BIND_RETRY_DELAY`].
    ///
    /// # Errors
    ///
    /// Returns the bind failure; the retry is already scheduled when it
    /// does.
    pub fn open(self: &Arc<Self>, port: u16) -> Result<SocketAddr, ServiceError> {
        self.close();

        self.port.store(port, Ordering::Relaxed);
        self.pending_start.store(false, Ordering::SeqCst);

        match self.bind(port) {
            Ok(listener) => {
                let addr = listener
                    .local_addr()
                    .map_err(|e| ServiceError::socket_option("local_addr", e.to_string()))?;
                *self.bound_addr.lock() = Some(addr);

                let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
                *self.acceptor.lock() = Some(shutdown_tx);

                info!(
                    %addr,
                    services = %self.protocol_names(),
                    "Service port open"
                );

                tokio::spawn(Arc::clone(self).accept_loop(listener, shutdown_rx));
                Ok(addr)
            }
            Err(err) => {
                warn!(
                    port,
                    error = %err,
                    retry_secs = BIND_RETRY_DELAY.as_secs(),
                    "Failed to open service port"
                );
                self.pending_start.store(true, Ordering::SeqCst);
                self.schedule_reopen(port, BIND_RETRY_DELAY);
                Err(err)
            }
        }
    }

    fn bind(&self, port: u16) -> Result<TcpListener, ServiceError> {
        let ip = if self.ctx.config.bind_only_global_address {
            IpAddr::V4(self.ctx.config.ip)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let addr = SocketAddr::new(ip, port);

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(SockProtocol::TCP))
            .map_err(|e| ServiceError::socket_option("socket", e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ServiceError::socket_option("SO_REUSEADDR", e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServiceError::socket_option("O_NONBLOCK", e.to_string()))?;
        socket
            .bind(&addr.into())
            .map_err(|e| ServiceError::bind(addr, e.to_string()))?;
        socket
            .listen(self.ctx.config.tcp_backlog as i32)
            .map_err(|e| ServiceError::socket_option("listen", e.to_string()))?;

        TcpListener::from_std(socket.into())
            .map_err(|e| ServiceError::socket_option("nonblocking listener", e.to_string()))
    }

    fn schedule_reopen(self: &Arc<Self>, port: u16, delay: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(service_port) = weak.upgrade() {
                let _ = service_port.open(port);
            }
        });
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        trace!(%peer, "Accepted connection");
                        self.on_accept(stream);
                    }
                    Err(err) => {
                        error!(error = %err, "Accept error on service port");
                        let port = self.port.load(Ordering::Relaxed);
                        self.close();
                        if !self.pending_start.swap(true, Ordering::SeqCst) {
                            self.schedule_reopen(port, CONNECTION_READ_TIMEOUT);
                        }
                        return;
                    }
                },
                _ = shutdown_rx.recv() => {
                    debug!("Service port acceptor stopped");
                    return;
                }
            }
        }
    }

    fn on_accept(self: &Arc<Self>, stream: TcpStream) {
        if let Err(err) = stream.set_nodelay(true) {
            warn!(error = %err, "Failed to set TCP_NODELAY");
        }

        let connection =
            self.ctx
                .connections
                .create_connection(stream, Arc::clone(self), Arc::clone(&self.ctx));

        let first_service = self.services.read().first().cloned();
        let Some(first_service) = first_service else {
            connection.close(true);
            return;
        };

        let remote_ip = connection.ip();
        if remote_ip != 0 && self.ctx.ban.accept_connection(remote_ip) {
            if first_service.is_single_socket() {
                let protocol = first_service.make_protocol(&connection);
                connection.accept(Some(protocol));
            } else {
                connection.accept(None);
            }
        } else {
            self.ctx.connections.stats().record_rejected();
            connection.close(true);
        }
    }

    /// Select a protocol for a first packet on a multiplexed port
    ///
    /// Consumes the protocol id byte from `msg`. The first service whose
    /// id matches wins, provided it either takes unchecksummed packets or
    /// the packet's checksum validated.
    pub fn make_protocol(
        &self,
        checksummed: bool,
        msg: &mut NetworkMessage,
        connection: &Arc<Connection>,
    ) -> Option<Arc<dyn Protocol>> {
        let protocol_id = msg.get_u8();
        let services = self.services.read();
        for service in services.iter() {
            if service.protocol_id() != protocol_id {
                continue;
            }
            if !service.is_checksummed() || checksummed {
                return Some(service.make_protocol(connection));
            }
        }
        None
    }

    /// Stop accepting; idempotent
    pub fn close(&self) {
        if let Some(shutdown_tx) = self.acceptor.lock().take() {
            let _ = shutdown_tx.send(());
        }
        *self.bound_addr.lock() = None;
    }

    /// Server shutdown notification
    pub fn on_stop_server(&self) {
        self.close();
    }

    /// Address of the live acceptor, if any
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    /// Whether a bind retry is pending
    #[must_use]
    pub fn is_pending_start(&self) -> bool {
        self.pending_start.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ServicePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePort")
            .field("port", &self.port.load(Ordering::Relaxed))
            .field("services", &self.protocol_names())
            .field("bound", &self.local_addr())
            .finish_non_exhaustive()
    }
}
