//! Wire message buffers
//!
//! Every client packet is framed as a 2-byte little-endian length header
//! followed by that many body bytes. [`NetworkMessage`] holds one inbound
//! frame and a read cursor; [`OutputMessage`] accumulates an outbound
//! frame with a reserved header area so the length prefix can be written
//! after the body.

mod network;
mod output;

pub use network::NetworkMessage;
pub use output::OutputMessage;

/// Length of the frame header, in bytes
pub const HEADER_LENGTH: usize = 2;

/// Length of the first-packet checksum field, in bytes
pub const CHECKSUM_LENGTH: usize = 4;

/// Largest accepted inbound frame body
pub const INPUTMESSAGE_MAXSIZE: usize = 4096;

/// Largest outbound frame, header area included
pub const OUTPUTMESSAGE_MAXSIZE: usize = 65500;

/// Bytes reserved in front of an outbound body for late-written headers
pub const MAX_HEADER_RESERVE: usize = 8;
