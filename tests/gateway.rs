//! End-to-end tests for the connection core
//!
//! Each test opens a real service port on an ephemeral loopback address,
//! drives it with a plain `TcpStream` client and observes protocol events
//! through an unbounded channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use gatecore::{
    adler32, AcceptancePolicy, Connection, ConnectionState, NetContext, NetworkMessage,
    OutputMessage, Protocol, ProtocolKind, ServerConfig, Service, ServiceManager, ServicePort,
    INPUTMESSAGE_MAXSIZE,
};

#[derive(Debug)]
enum Event {
    Connected,
    First {
        payload: Vec<u8>,
        connection: Arc<Connection>,
    },
    Message {
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Behavior {
    Record,
    ReplyThenClose,
    SuspendAfterFirst,
}

struct TestService {
    id: u8,
    checksummed: bool,
    single_socket: bool,
    behavior: Behavior,
    events: mpsc::UnboundedSender<Event>,
}

impl Service for TestService {
    fn protocol_id(&self) -> u8 {
        self.id
    }

    fn protocol_name(&self) -> &'static str {
        "test"
    }

    fn is_checksummed(&self) -> bool {
        self.checksummed
    }

    fn is_single_socket(&self) -> bool {
        self.single_socket
    }

    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol> {
        Arc::new(TestProtocol {
            connection: Arc::clone(connection),
            behavior: self.behavior,
            events: self.events.clone(),
        })
    }
}

struct TestProtocol {
    connection: Arc<Connection>,
    behavior: Behavior,
    events: mpsc::UnboundedSender<Event>,
}

impl Protocol for TestProtocol {
    fn on_connect(&self) {
        let _ = self.events.send(Event::Connected);
    }

    fn on_recv_first_message(&self, msg: &mut NetworkMessage) {
        let _ = self.events.send(Event::First {
            payload: msg.payload().to_vec(),
            connection: Arc::clone(&self.connection),
        });

        if self.behavior == Behavior::ReplyThenClose {
            let mut reply = OutputMessage::new();
            reply.add_bytes(b"goodbye");
            reply.write_message_length();
            self.connection.send(reply);
            self.connection.close(false);
        }
    }

    fn on_recv_message(&self, msg: &mut NetworkMessage) -> bool {
        let _ = self.events.send(Event::Message {
            payload: msg.payload().to_vec(),
        });
        self.behavior == Behavior::SuspendAfterFirst
    }
}

struct ServiceSpec {
    id: u8,
    checksummed: bool,
    single_socket: bool,
    behavior: Behavior,
}

/// Route test logs through `RUST_LOG`; repeated calls are no-ops
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn open_test_port(
    config: ServerConfig,
    ban: Option<Arc<dyn AcceptancePolicy>>,
    specs: &[ServiceSpec],
) -> (
    Arc<NetContext>,
    Arc<ServicePort>,
    std::net::SocketAddr,
    mpsc::UnboundedReceiver<Event>,
) {
    init_tracing();
    let ctx = match ban {
        Some(ban) => NetContext::new(config, ban),
        None => NetContext::with_defaults(config),
    };
    let port = ServicePort::new(Arc::clone(&ctx));
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    for spec in specs {
        port.add_service(Arc::new(TestService {
            id: spec.id,
            checksummed: spec.checksummed,
            single_socket: spec.single_socket,
            behavior: spec.behavior,
            events: events_tx.clone(),
        }))
        .unwrap();
    }

    let addr = port.open(0).unwrap();
    (ctx, port, addr, events_rx)
}

/// Connectable loopback address for a port bound on the wildcard address
fn connect_addr(addr: std::net::SocketAddr) -> std::net::SocketAddr {
    std::net::SocketAddr::new("127.0.0.1".parse().unwrap(), addr.port())
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn checksummed_body(protocol_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(1 + payload.len());
    inner.push(protocol_id);
    inner.extend_from_slice(payload);

    let mut body = Vec::with_capacity(4 + inner.len());
    body.extend_from_slice(&adler32(&inner).to_le_bytes());
    body.extend_from_slice(&inner);
    body
}

async fn recv_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a protocol event")
        .expect("event channel closed")
}

/// Skip any deferred `on_connect` events and return the next data event
async fn recv_data_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    loop {
        match recv_event(rx).await {
            Event::Connected => continue,
            other => return other,
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

async fn assert_eof(client: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("expected EOF, read {n} bytes"),
        Err(_) => panic!("timed out waiting for EOF"),
    }
}

#[tokio::test]
async fn checksummed_first_packet_selects_protocol() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: true,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (ctx, _port, addr, mut events) = open_test_port(ServerConfig::default(), None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    client
        .write_all(&frame(&checksummed_body(0x0A, b"hello")))
        .await
        .unwrap();

    match recv_data_event(&mut events).await {
        Event::First { payload, connection } => {
            assert_eq!(payload, b"hello");
            assert_eq!(connection.state(), ConnectionState::Open);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(ctx.connections.len(), 1);

    drop(client);
    wait_until(|| ctx.connections.is_empty()).await;
}

#[tokio::test]
async fn unchecksummed_first_packet_rewinds_cursor() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (_ctx, _port, addr, mut events) = open_test_port(ServerConfig::default(), None, &specs);

    // No checksum field at all: the first body byte is the protocol id
    let mut body = vec![0x0A];
    body.extend_from_slice(b"world");

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    client.write_all(&frame(&body)).await.unwrap();

    match recv_data_event(&mut events).await {
        Event::First { payload, .. } => assert_eq!(payload, b"world"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn subsequent_packets_reach_on_recv_message() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (_ctx, _port, addr, mut events) = open_test_port(ServerConfig::default(), None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    client.write_all(&frame(&[0x0A])).await.unwrap();
    client.write_all(&frame(b"again")).await.unwrap();

    assert!(matches!(
        recv_data_event(&mut events).await,
        Event::First { .. }
    ));
    match recv_data_event(&mut events).await {
        Event::Message { payload } => assert_eq!(payload, b"again"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn single_socket_skips_checksum_and_protocol_byte() {
    let specs = [ServiceSpec {
        id: 0x01,
        checksummed: true,
        single_socket: true,
        behavior: Behavior::Record,
    }];
    let (_ctx, _port, addr, mut events) = open_test_port(ServerConfig::default(), None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    // Header byte[1] is zero, so this cannot be an identification prelude
    let mut body = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x99];
    body.extend_from_slice(b"sub");
    client.write_all(&frame(&body)).await.unwrap();

    match recv_data_event(&mut events).await {
        Event::First { payload, .. } => assert_eq!(payload, b"sub"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn proxy_identification_prelude_is_consumed() {
    let config = ServerConfig {
        server_name: "OT".into(),
        ..ServerConfig::default()
    };
    let specs = [ServiceSpec {
        id: 0x01,
        checksummed: false,
        single_socket: true,
        behavior: Behavior::Record,
    }];
    let (_ctx, _port, addr, mut events) = open_test_port(config, None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    // Case-insensitive prelude, then a normal frame
    client.write_all(b"ot\n").await.unwrap();
    let mut body = vec![0, 0, 0, 0, 0];
    body.extend_from_slice(b"after");
    client.write_all(&frame(&body)).await.unwrap();

    match recv_data_event(&mut events).await {
        Event::First { payload, .. } => assert_eq!(payload, b"after"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn proxy_identification_mismatch_closes() {
    let config = ServerConfig {
        server_name: "Valoria".into(),
        ..ServerConfig::default()
    };
    let specs = [ServiceSpec {
        id: 0x01,
        checksummed: false,
        single_socket: true,
        behavior: Behavior::Record,
    }];
    let (ctx, _port, addr, _events) = open_test_port(config, None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    // Prefix matches "Va", the remainder does not match "loria\n"
    client.write_all(b"Vanished!").await.unwrap();

    assert_eof(&mut client).await;
    wait_until(|| ctx.connections.is_empty()).await;
}

#[tokio::test]
async fn oversize_frame_closes_connection() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (ctx, _port, addr, _events) = open_test_port(ServerConfig::default(), None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    wait_until(|| ctx.connections.len() == 1).await;

    let oversize = (INPUTMESSAGE_MAXSIZE + 1) as u16;
    client.write_all(&oversize.to_le_bytes()).await.unwrap();

    assert_eof(&mut client).await;
    wait_until(|| ctx.connections.is_empty()).await;
}

#[tokio::test]
async fn zero_length_frame_closes_connection() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (ctx, _port, addr, _events) = open_test_port(ServerConfig::default(), None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    client.write_all(&0u16.to_le_bytes()).await.unwrap();

    assert_eof(&mut client).await;
    wait_until(|| ctx.connections.is_empty()).await;
}

#[tokio::test]
async fn unknown_protocol_id_closes_connection() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (ctx, _port, addr, _events) = open_test_port(ServerConfig::default(), None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    client.write_all(&frame(&[0x0B, 1, 2, 3])).await.unwrap();

    assert_eof(&mut client).await;
    wait_until(|| ctx.connections.is_empty()).await;
}

#[tokio::test]
async fn packet_rate_limit_disconnects() {
    let config = ServerConfig {
        max_packets_per_second: 3,
        ..ServerConfig::default()
    };
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (ctx, _port, addr, _events) = open_test_port(config, None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    let mut burst = frame(&[0x0A]);
    for _ in 0..20 {
        burst.extend_from_slice(&frame(b"spam"));
    }
    // The peer may already be gone by the tail of the burst
    let _ = client.write_all(&burst).await;

    assert_eof(&mut client).await;
    wait_until(|| ctx.connections.stats().rate_limited() == 1).await;
    wait_until(|| ctx.connections.is_empty()).await;
}

#[tokio::test]
async fn queued_write_drains_after_close() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::ReplyThenClose,
    }];
    let (ctx, _port, addr, mut events) = open_test_port(ServerConfig::default(), None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    client.write_all(&frame(&[0x0A])).await.unwrap();

    let connection = match recv_data_event(&mut events).await {
        Event::First { connection, .. } => connection,
        other => panic!("unexpected event: {other:?}"),
    };

    // The reply queued before close(false) still arrives in full
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await.unwrap();
    let len = u16::from_le_bytes(header) as usize;
    let mut body = vec![0u8; len];
    client.read_exact(&mut body).await.unwrap();
    assert_eq!(body, b"goodbye");

    assert_eof(&mut client).await;
    // Draining the queue must finish the whole teardown, not just the
    // write side
    wait_until(|| !connection.is_socket_open()).await;
    wait_until(|| ctx.connections.is_empty()).await;
}

#[tokio::test]
async fn deferred_close_releases_parked_read_task() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (ctx, _port, addr, mut events) = open_test_port(ServerConfig::default(), None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    client.write_all(&frame(&[0x0A])).await.unwrap();

    let connection = match recv_data_event(&mut events).await {
        Event::First { connection, .. } => connection,
        other => panic!("unexpected event: {other:?}"),
    };

    // The read task is now parked waiting for the next header; queue a
    // message and close without force while it waits
    let mut reply = OutputMessage::new();
    reply.add_bytes(b"goodbye");
    reply.write_message_length();
    connection.send(reply);
    connection.close(false);

    let mut header = [0u8; 2];
    client.read_exact(&mut header).await.unwrap();
    let len = u16::from_le_bytes(header) as usize;
    let mut body = vec![0u8; len];
    client.read_exact(&mut body).await.unwrap();
    assert_eq!(body, b"goodbye");
    assert_eof(&mut client).await;

    // The writer finishing the drain must wake the parked read task and
    // close the socket well before the read deadline, with no further
    // client input
    wait_until(|| !connection.is_socket_open()).await;
    wait_until(|| ctx.connections.is_empty()).await;
}

#[tokio::test]
async fn suspended_read_resumes_on_demand() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::SuspendAfterFirst,
    }];
    let (_ctx, _port, addr, mut events) = open_test_port(ServerConfig::default(), None, &specs);

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    client.write_all(&frame(&[0x0A])).await.unwrap();
    client.write_all(&frame(b"two")).await.unwrap();
    client.write_all(&frame(b"three")).await.unwrap();

    let connection = match recv_data_event(&mut events).await {
        Event::First { connection, .. } => connection,
        other => panic!("unexpected event: {other:?}"),
    };
    match recv_data_event(&mut events).await {
        Event::Message { payload } => assert_eq!(payload, b"two"),
        other => panic!("unexpected event: {other:?}"),
    }

    // Reading is suspended; the third frame must not be delivered yet
    let quiet = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(quiet.is_err(), "read was not suspended");

    connection.resume_work();
    match recv_data_event(&mut events).await {
        Event::Message { payload } => assert_eq!(payload, b"three"),
        other => panic!("unexpected event: {other:?}"),
    }
}

struct DenyAllPolicy;

impl AcceptancePolicy for DenyAllPolicy {
    fn accept_connection(&self, _ip: u32) -> bool {
        false
    }
}

#[tokio::test]
async fn banned_connection_is_rejected() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (ctx, _port, addr, _events) = open_test_port(
        ServerConfig::default(),
        Some(Arc::new(DenyAllPolicy)),
        &specs,
    );

    let mut client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    assert_eof(&mut client).await;

    wait_until(|| ctx.connections.stats().rejected() == 1).await;
    wait_until(|| ctx.connections.is_empty()).await;
}

#[tokio::test]
async fn close_all_tears_down_every_connection() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (ctx, _port, addr, _events) = open_test_port(ServerConfig::default(), None, &specs);

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(connect_addr(addr)).await.unwrap());
    }
    wait_until(|| ctx.connections.len() == 3).await;

    ctx.connections.close_all();
    assert!(ctx.connections.is_empty());

    for client in &mut clients {
        assert_eof(client).await;
    }
}

#[tokio::test]
async fn single_socket_service_refuses_company() {
    let ctx = NetContext::with_defaults(ServerConfig::default());
    let port = ServicePort::new(ctx);
    let (events_tx, _events_rx) = mpsc::unbounded_channel();

    port.add_service(Arc::new(TestService {
        id: 0x01,
        checksummed: false,
        single_socket: true,
        behavior: Behavior::Record,
        events: events_tx.clone(),
    }))
    .unwrap();

    let result = port.add_service(Arc::new(TestService {
        id: 0x02,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
        events: events_tx,
    }));
    assert!(result.is_err());
    assert!(port.is_single_socket());
}

#[tokio::test]
async fn bind_failure_enters_pending_start() {
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (ctx, first, addr, _events) = open_test_port(ServerConfig::default(), None, &specs);

    let second = ServicePort::new(ctx);
    let result = second.open(addr.port());
    assert!(result.is_err());
    assert!(second.is_pending_start());
    assert!(second.local_addr().is_none());

    // The original port keeps accepting
    let _client = TcpStream::connect(connect_addr(addr)).await.unwrap();
    assert!(first.local_addr().is_some());
}

#[tokio::test]
async fn bind_only_global_address_uses_configured_ip() {
    let config = ServerConfig {
        bind_only_global_address: true,
        ip: "127.0.0.1".parse().unwrap(),
        ..ServerConfig::default()
    };
    let specs = [ServiceSpec {
        id: 0x0A,
        checksummed: false,
        single_socket: false,
        behavior: Behavior::Record,
    }];
    let (_ctx, _port, addr, _events) = open_test_port(config, None, &specs);

    assert_eq!(addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
}

struct NullProtocol;

impl Protocol for NullProtocol {
    fn on_recv_first_message(&self, _msg: &mut NetworkMessage) {}
}

impl ProtocolKind for NullProtocol {
    const PROTOCOL_ID: u8 = 0x0F;
    const NAME: &'static str = "null";
    const USES_CHECKSUM: bool = false;
    const SERVER_SENDS_FIRST: bool = false;

    fn new(_connection: Arc<Connection>) -> Self {
        NullProtocol
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test(start_paused = true)]
async fn service_manager_lifecycle() {
    let ctx = NetContext::with_defaults(ServerConfig::default());
    let manager = ServiceManager::new(ctx);

    assert!(!manager.add::<NullProtocol>(0));

    let port = free_port();
    assert!(manager.add::<NullProtocol>(port));
    assert_eq!(manager.port_count(), 1);
    assert!(manager.find(port).is_some());

    let runner = Arc::clone(&manager);
    let run_handle = tokio::spawn(async move { runner.run().await });

    wait_until(|| manager.is_running()).await;

    manager.stop();
    assert!(!manager.is_running());
    assert_eq!(manager.port_count(), 0);

    // Idempotent
    manager.stop();

    // The death timer releases run()
    tokio::time::timeout(Duration::from_secs(10), run_handle)
        .await
        .expect("run did not return after stop")
        .unwrap();
}
