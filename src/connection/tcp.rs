//! TCP connection state machine
//!
//! One [`Connection`] exists per accepted socket. A read task drives the
//! inbound state machine (optional proxy identification, then a
//! header/body loop that hands complete frames to the bound protocol)
//! and a write task drains the outbound queue, so at most one read and
//! one write are ever outstanding. Both tasks watch a close signal that
//! plays the role of cancelling in-flight socket operations.
//!
//! ```text
//!  accept(Some(protocol))                accept(None)
//!        |                                    |
//!  [Identifying] --2 bytes--+                 |
//!        |                  | prefix match    |
//!        | not a prelude    v                 |
//!        |        [ReadingServerName]         |
//!        |                  | suffix match    |
//!        v                  v                 v
//!      [Open] <-------------+----------> header -> body -> dispatch
//!        |
//!        +-- error / timeout / rate limit --> [Closed]
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::checksum::adler32;
use crate::context::NetContext;
use crate::error::ConnectionError;
use crate::message::{
    NetworkMessage, OutputMessage, CHECKSUM_LENGTH, HEADER_LENGTH, INPUTMESSAGE_MAXSIZE,
};
use crate::protocol::Protocol;
use crate::service::ServicePort;

/// Deadline for every inbound read, including the suspended-read wait
pub const CONNECTION_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for every outbound write; also the delay before a closed
/// connection's protocol is released
pub const CONNECTION_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// The remote address has not been resolved yet
const IP_UNRESOLVED: u32 = 1;

/// The remote address could not be resolved
const IP_UNKNOWN: u32 = 0;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Normal framed traffic
    Open = 0,
    /// Waiting for the first two bytes, which may open an identification
    /// prelude instead of a frame
    Identifying = 1,
    /// Consuming the remainder of the announced server name
    ReadingServerName = 2,
    /// Terminal; no further protocol callbacks occur
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Identifying,
            2 => Self::ReadingServerName,
            3 => Self::Closed,
            _ => Self::Open,
        }
    }
}

/// Render a cached network-byte-order IPv4 value as dotted decimal
#[must_use]
pub fn format_ip(ip: u32) -> String {
    let b = ip.to_le_bytes();
    format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct ConnectionInner {
    protocol: Option<Arc<dyn Protocol>>,
    queue: VecDeque<OutputMessage>,
    read_half: Option<OwnedReadHalf>,
    write_half: Option<OwnedWriteHalf>,
}

/// One live TCP connection
///
/// Created by its [`ServicePort`] at accept time and registered with the
/// [`ConnectionManager`](super::ConnectionManager); the registration and
/// any in-flight task hold shared references, so the connection lives
/// until the last of them completes.
pub struct Connection {
    id: u64,
    ctx: Arc<NetContext>,
    service_port: Arc<ServicePort>,
    peer_addr: Option<SocketAddr>,

    state: AtomicU8,
    ip: AtomicU32,
    received_first: AtomicBool,
    packets_sent: AtomicU32,
    time_connected: AtomicU64,
    socket_closed: AtomicBool,

    inner: Mutex<ConnectionInner>,
    close_tx: broadcast::Sender<()>,
    resume: Notify,
    queue_wake: Notify,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        stream: TcpStream,
        service_port: Arc<ServicePort>,
        ctx: Arc<NetContext>,
    ) -> Arc<Self> {
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (close_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            id,
            ctx,
            service_port,
            peer_addr,
            state: AtomicU8::new(ConnectionState::Open as u8),
            ip: AtomicU32::new(IP_UNRESOLVED),
            received_first: AtomicBool::new(false),
            packets_sent: AtomicU32::new(0),
            time_connected: AtomicU64::new(unix_now()),
            socket_closed: AtomicBool::new(false),
            inner: Mutex::new(ConnectionInner {
                protocol: None,
                queue: VecDeque::new(),
                read_half: Some(read_half),
                write_half: Some(write_half),
            }),
            close_tx,
            resume: Notify::new(),
            queue_wake: Notify::new(),
        })
    }

    /// Registry id of this connection
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The port this connection was accepted on
    #[must_use]
    pub fn service_port(&self) -> &Arc<ServicePort> {
        &self.service_port
    }

    /// Cached remote IPv4 address in network byte order
    ///
    /// Resolved from the socket on first call; `0` means the address is
    /// unknown (resolution failed, or the connection already closed).
    pub fn ip(&self) -> u32 {
        if self.ip.load(Ordering::Relaxed) == IP_UNRESOLVED {
            let resolved = match self.peer_addr {
                Some(SocketAddr::V4(v4)) => u32::from_le_bytes(v4.ip().octets()),
                Some(SocketAddr::V6(v6)) => v6
                    .ip()
                    .to_ipv4_mapped()
                    .map_or(IP_UNKNOWN, |v4| u32::from_le_bytes(v4.octets())),
                None => {
                    error!("Failed to resolve remote endpoint");
                    IP_UNKNOWN
                }
            };
            self.ip.store(resolved, Ordering::Relaxed);
        }
        self.ip.load(Ordering::Relaxed)
    }

    /// Start servicing the socket
    ///
    /// With a protocol the connection enters the identification state:
    /// the handler is bound immediately, its `on_connect` is dispatched,
    /// and the first two bytes may be a proxy identification prelude.
    /// Without one, protocol selection waits for the first frame.
    pub fn accept(self: &Arc<Self>, protocol: Option<Arc<dyn Protocol>>) {
        if let Some(protocol) = protocol {
            self.state
                .store(ConnectionState::Identifying as u8, Ordering::SeqCst);
            self.inner.lock().protocol = Some(Arc::clone(&protocol));
            self.ctx.dispatcher.add_event(
                move || protocol.on_connect(),
                "protocol::on_connect",
                Duration::ZERO,
            );
        }

        tokio::spawn(Arc::clone(self).read_loop());
        tokio::spawn(Arc::clone(self).write_loop());
    }

    /// Queue an outbound message
    ///
    /// Silently absorbed when the connection is closed. The write task is
    /// woken on the empty-to-non-empty transition; messages are written
    /// in enqueue order, one at a time.
    pub fn send(&self, msg: OutputMessage) {
        if self.state() == ConnectionState::Closed {
            return;
        }

        if self.socket_closed.load(Ordering::SeqCst) {
            error!(id = self.id, "Socket is not open for writing");
            self.inner.lock().queue.clear();
            self.close(true);
            return;
        }

        let was_empty = {
            let mut inner = self.inner.lock();
            let was_empty = inner.queue.is_empty();
            inner.queue.push_back(msg);
            was_empty
        };

        if was_empty {
            self.queue_wake.notify_one();
        }
    }

    /// Close the connection
    ///
    /// Unregisters it, transitions to `Closed` (idempotent) and schedules
    /// the protocol release. With `force` the socket is torn down at
    /// once, aborting any in-flight write; otherwise queued messages are
    /// drained first and the write task closes the socket when the queue
    /// empties.
    pub fn close(&self, force: bool) {
        self.ctx.connections.release(self);
        self.ip.store(IP_UNKNOWN, Ordering::Relaxed);

        if self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst)
            == ConnectionState::Closed as u8
        {
            return;
        }

        let protocol = self.inner.lock().protocol.clone();
        if let Some(protocol) = protocol {
            self.ctx.dispatcher.add_event(
                move || protocol.release(),
                "protocol::release",
                CONNECTION_WRITE_TIMEOUT,
            );
        }

        if force || self.inner.lock().queue.is_empty() {
            self.close_socket();
        }
    }

    /// Re-arm the next header read after a protocol suspended reading
    pub fn resume_work(&self) {
        self.resume.notify_one();
    }

    /// Whether the underlying socket is still open
    ///
    /// Flips to `false` once the socket teardown has run: immediately on
    /// a forced close, or when the write queue drains after a non-forced
    /// one.
    #[must_use]
    pub fn is_socket_open(&self) -> bool {
        !self.socket_closed.load(Ordering::SeqCst)
    }

    fn close_socket(&self) {
        if self.socket_closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Wake both tasks; dropping the halves closes the descriptor once
        // the tasks let go of theirs.
        let _ = self.close_tx.send(());

        let mut inner = self.inner.lock();
        inner.read_half = None;
        inner.write_half = None;
    }

    /// Map a terminal read/write error to its log line and close mode
    fn fail(&self, err: ConnectionError) {
        match &err {
            ConnectionError::RateLimited { ip } => {
                warn!(ip = %ip, "Disconnecting peer for exceeding the packet per second limit");
                self.ctx.connections.stats().record_rate_limited();
                self.close(false);
                return;
            }
            ConnectionError::Timeout => {
                debug!(ip = %format_ip(self.ip()), "Connection timed out");
                self.ctx.connections.stats().record_timeout();
            }
            ConnectionError::IdentificationMismatch => {
                warn!(ip = %format_ip(self.ip()), "Invalid client identification, server name mismatch");
            }
            ConnectionError::BadFrame { size } => {
                debug!(size = *size, "Dropping connection with invalid frame length");
            }
            ConnectionError::NoProtocol { id } => {
                debug!(id = *id, "No service for the requested protocol");
            }
            ConnectionError::Io(io_err) => {
                if err.is_expected() {
                    debug!(error = %io_err, "Connection ended");
                } else {
                    error!(error = %io_err, "Connection read error");
                }
            }
            ConnectionError::Closed => return,
        }
        self.close(true);
    }

    async fn read_loop(self: Arc<Self>) {
        let mut close_rx = self.close_tx.subscribe();
        let read_half = self.inner.lock().read_half.take();
        let Some(mut read_half) = read_half else {
            return;
        };
        let mut msg = NetworkMessage::new();

        match self.drive_reads(&mut read_half, &mut msg, &mut close_rx).await {
            Ok(()) | Err(ConnectionError::Closed) => {}
            Err(err) => self.fail(err),
        }
    }

    async fn drive_reads(
        self: &Arc<Self>,
        read_half: &mut OwnedReadHalf,
        msg: &mut NetworkMessage,
        close_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        let mut pending_header = false;

        if self.state() == ConnectionState::Identifying {
            pending_header = self.identify_proxy(read_half, msg, close_rx).await?;
        }

        loop {
            if self.state() == ConnectionState::Closed {
                return Ok(());
            }

            if !pending_header {
                msg.reset();
                self.read_exact_timed(read_half, msg.header_buffer(), close_rx)
                    .await?;
            }
            pending_header = false;

            let size = self.parse_header(msg)?;

            msg.set_length(HEADER_LENGTH + usize::from(size));
            self.read_exact_timed(read_half, msg.body_buffer(usize::from(size)), close_rx)
                .await?;

            if self.state() == ConnectionState::Closed {
                return Ok(());
            }

            let suspend = self.dispatch_packet(msg)?;
            if suspend {
                self.await_resume(close_rx).await?;
            }
        }
    }

    /// Read the two-byte prelude and decide whether it is a proxy
    /// identification or a real length header
    ///
    /// Returns `true` when the bytes turned out to be a header that the
    /// main loop should parse as-is.
    async fn identify_proxy(
        &self,
        read_half: &mut OwnedReadHalf,
        msg: &mut NetworkMessage,
        close_rx: &mut broadcast::Receiver<()>,
    ) -> Result<bool, ConnectionError> {
        self.read_exact_timed(read_half, msg.header_buffer(), close_rx)
            .await?;

        let ident = msg.header_bytes();
        let server_name = format!("{}\n", self.ctx.config.server_name);
        let name = server_name.as_bytes();

        let prefix_matches = name.len() >= 2 && ident.eq_ignore_ascii_case(&name[..2]);
        if ident[1] == 0x00 || !prefix_matches {
            // Not an identification prelude; the bytes are a length header
            self.state
                .store(ConnectionState::Open as u8, Ordering::SeqCst);
            return Ok(true);
        }

        let remainder = name.len() - 2;
        if remainder > 0 {
            self.state
                .store(ConnectionState::ReadingServerName as u8, Ordering::SeqCst);

            let mut rest = vec![0u8; remainder];
            self.read_exact_timed(read_half, &mut rest, close_rx).await?;
            if !rest.eq_ignore_ascii_case(&name[2..]) {
                return Err(ConnectionError::IdentificationMismatch);
            }
        }

        self.state
            .store(ConnectionState::Open as u8, Ordering::SeqCst);
        Ok(false)
    }

    /// Account the packet against the rate budget and validate the
    /// length header
    fn parse_header(&self, msg: &NetworkMessage) -> Result<u16, ConnectionError> {
        let now = unix_now();
        let time_passed = now
            .saturating_sub(self.time_connected.load(Ordering::Relaxed))
            .saturating_add(1)
            .max(1);
        let sent = self.packets_sent.fetch_add(1, Ordering::Relaxed) + 1;

        if u64::from(sent) / time_passed > u64::from(self.ctx.config.max_packets_per_second) {
            return Err(ConnectionError::RateLimited {
                ip: format_ip(self.ip()),
            });
        }

        // Sliding window with two-second granularity
        if time_passed > 2 {
            self.time_connected.store(now, Ordering::Relaxed);
            self.packets_sent.store(0, Ordering::Relaxed);
        }

        let size = msg.length_header();
        if size == 0 || usize::from(size) > INPUTMESSAGE_MAXSIZE {
            return Err(ConnectionError::BadFrame { size });
        }

        Ok(size)
    }

    /// Hand a complete frame to the protocol layer
    ///
    /// Returns `true` when the protocol suspended reading.
    fn dispatch_packet(self: &Arc<Self>, msg: &mut NetworkMessage) -> Result<bool, ConnectionError> {
        if !self.received_first.swap(true, Ordering::AcqRel) {
            let bound = self.inner.lock().protocol.clone();
            let protocol = match bound {
                Some(protocol) => {
                    // Single-socket service: the sequence field and the
                    // protocol byte are present but never validated.
                    let _ = msg.get_u32();
                    msg.skip_bytes(1);
                    protocol
                }
                None => {
                    let payload_len = msg.length() as i64
                        - msg.position() as i64
                        - CHECKSUM_LENGTH as i64;
                    let computed = if payload_len > 0 {
                        adler32(&msg.frame()[msg.position() + CHECKSUM_LENGTH..])
                    } else {
                        0
                    };

                    let recv_checksum = msg.get_u32();
                    if recv_checksum != computed {
                        // Not a checksum after all; those bytes are payload
                        msg.skip_bytes(-(CHECKSUM_LENGTH as i32));
                    }

                    let requested_id = msg.frame().get(msg.position()).copied().unwrap_or(0);
                    let made = self
                        .service_port
                        .make_protocol(recv_checksum == computed, msg, self);
                    let Some(protocol) = made else {
                        return Err(ConnectionError::NoProtocol { id: requested_id });
                    };
                    self.inner.lock().protocol = Some(Arc::clone(&protocol));
                    protocol
                }
            };

            protocol.on_recv_first_message(msg);
            Ok(false)
        } else {
            let protocol = self.inner.lock().protocol.clone();
            match protocol {
                Some(protocol) => Ok(protocol.on_recv_message(msg)),
                None => Err(ConnectionError::Closed),
            }
        }
    }

    async fn await_resume(
        &self,
        close_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        tokio::select! {
            res = timeout(CONNECTION_READ_TIMEOUT, self.resume.notified()) => {
                res.map_err(|_| ConnectionError::Timeout)
            }
            _ = close_rx.recv() => Err(ConnectionError::Closed),
        }
    }

    async fn read_exact_timed(
        &self,
        read_half: &mut OwnedReadHalf,
        buf: &mut [u8],
        close_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        tokio::select! {
            res = timeout(CONNECTION_READ_TIMEOUT, read_half.read_exact(buf)) => match res {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(ConnectionError::Io(e)),
                Err(_) => Err(ConnectionError::Timeout),
            },
            _ = close_rx.recv() => Err(ConnectionError::Closed),
        }
    }

    async fn write_loop(self: Arc<Self>) {
        let mut close_rx = self.close_tx.subscribe();
        let write_half = self.inner.lock().write_half.take();
        let Some(mut write_half) = write_half else {
            return;
        };

        loop {
            let front = self.inner.lock().queue.pop_front();
            let Some(mut msg) = front else {
                if self.state() == ConnectionState::Closed {
                    // Queue drained after a non-forced close; run the
                    // full teardown so the read task is woken too
                    self.close_socket();
                    return;
                }
                tokio::select! {
                    _ = self.queue_wake.notified() => continue,
                    _ = close_rx.recv() => {
                        let _ = write_half.shutdown().await;
                        return;
                    }
                }
            };

            // The protocol frames the message (length header, sequence,
            // encryption) outside the connection lock so it may call back
            // into send.
            let protocol = self.inner.lock().protocol.clone();
            if let Some(protocol) = &protocol {
                protocol.on_send_message(&mut msg);
            }

            let result = tokio::select! {
                res = timeout(CONNECTION_WRITE_TIMEOUT, write_half.write_all(msg.output_buffer())) => res,
                _ = close_rx.recv() => return,
            };

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Connection write error");
                    self.inner.lock().queue.clear();
                    self.close(true);
                    return;
                }
                Err(_) => {
                    debug!(ip = %format_ip(self.ip()), "Write timed out");
                    self.ctx.connections.stats().record_timeout();
                    self.close(true);
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer", &self.peer_addr)
            .finish_non_exhaustive()
    }
}
