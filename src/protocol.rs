//! Protocol handler traits
//!
//! The connection core never interprets packet bodies. It hands complete
//! frames to a [`Protocol`] chosen either at accept time (single-socket
//! services) or from the first byte of the first packet (multiplexed
//! services). Concrete handlers live in the embedding server.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::connection::Connection;
use crate::message::{NetworkMessage, OutputMessage};

/// Capability set of one bound protocol handler
///
/// All hooks run on connection tasks; implementations must synchronize
/// their own state. The connection lock is never held across a hook, so a
/// hook may freely call back into `Connection::send`, `close` or
/// `resume_work`.
pub trait Protocol: Send + Sync {
    /// The connection finished acceptance; dispatched, never inline
    fn on_connect(&self) {}

    /// First complete frame of the connection
    fn on_recv_first_message(&self, msg: &mut NetworkMessage);

    /// Any subsequent frame
    ///
    /// Return `true` to suspend reading; the protocol must later call
    /// [`Connection::resume_work`] to re-arm the next header read.
    fn on_recv_message(&self, _msg: &mut NetworkMessage) -> bool {
        false
    }

    /// A queued message is about to be written; last chance to frame it
    /// (length header, sequence numbers, encryption)
    fn on_send_message(&self, _msg: &mut OutputMessage) {}

    /// The connection closed; drop references, dispatched with a delay so
    /// queued writes can drain first
    fn release(&self) {}
}

/// Static description of a protocol, used to register it as a service
pub trait ProtocolKind: Protocol + Sized + 'static {
    /// First-packet byte selecting this protocol on a multiplexed port
    const PROTOCOL_ID: u8;

    /// Human-readable name for logs
    const NAME: &'static str;

    /// Whether first packets of this protocol carry an Adler-32 checksum
    const USES_CHECKSUM: bool;

    /// Whether the server talks first; such a protocol owns its port
    /// exclusively and is bound at accept time
    const SERVER_SENDS_FIRST: bool;

    /// Build a handler bound to `connection`
    fn new(connection: Arc<Connection>) -> Self;
}

/// One service hosted by a `ServicePort`
///
/// Object-safe view over a [`ProtocolKind`], so ports can hold a
/// heterogeneous service list.
pub trait Service: Send + Sync {
    /// Protocol id matched against the first packet
    fn protocol_id(&self) -> u8;

    /// Name for diagnostics
    fn protocol_name(&self) -> &'static str;

    /// Whether the service expects checksummed first packets
    fn is_checksummed(&self) -> bool;

    /// Whether the service owns its port exclusively
    fn is_single_socket(&self) -> bool;

    /// Instantiate the handler for a connection
    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol>;
}

/// [`Service`] implementation derived from a [`ProtocolKind`]
pub struct ServiceDef<P> {
    _marker: PhantomData<fn() -> P>,
}

impl<P> ServiceDef<P> {
    /// Create the service record
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<P> Default for ServiceDef<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ProtocolKind> Service for ServiceDef<P> {
    fn protocol_id(&self) -> u8 {
        P::PROTOCOL_ID
    }

    fn protocol_name(&self) -> &'static str {
        P::NAME
    }

    fn is_checksummed(&self) -> bool {
        P::USES_CHECKSUM
    }

    fn is_single_socket(&self) -> bool {
        P::SERVER_SENDS_FIRST
    }

    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol> {
        Arc::new(P::new(Arc::clone(connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub;

    impl Protocol for Stub {
        fn on_recv_first_message(&self, _msg: &mut NetworkMessage) {}
    }

    impl ProtocolKind for Stub {
        const PROTOCOL_ID: u8 = 0x42;
        const NAME: &'static str = "stub";
        const USES_CHECKSUM: bool = true;
        const SERVER_SENDS_FIRST: bool = false;

        fn new(_connection: Arc<Connection>) -> Self {
            Stub
        }
    }

    #[test]
    fn test_service_def_statics() {
        let svc = ServiceDef::<Stub>::new();
        assert_eq!(svc.protocol_id(), 0x42);
        assert_eq!(svc.protocol_name(), "stub");
        assert!(svc.is_checksummed());
        assert!(!svc.is_single_socket());
    }
}
