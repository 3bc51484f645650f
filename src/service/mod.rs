//! Service ports and their manager
//!
//! A service is a protocol made reachable on a TCP port. [`ServicePort`]
//! owns one acceptor and selects the protocol for each connection;
//! [`ServiceManager`] tracks every open port and drives graceful
//! teardown.

mod manager;
mod port;

pub use manager::{ServiceManager, DEATH_TIMER_DELAY};
pub use port::{ServicePort, BIND_RETRY_DELAY};
