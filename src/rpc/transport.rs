//! Pluggable transports carrying opaque payloads between contacts.

mod memory;
mod tcp;
mod udp;

use std::fmt::Debug;
use std::net::SocketAddr;

use bytes::Bytes;
use flume::Sender;

use crate::common::Contact;
use crate::error::TransportError;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// A payload accepted by a transport.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub payload: Bytes,
    /// Observed source address, if the transport knows it.
    pub from: Option<SocketAddr>,
}

/// What the RPC layer needs from a transport.
///
/// Delivery is best effort: a payload that never arrives only surfaces as a
/// request timeout. `open` and `close` must be idempotent.
pub trait Transport: Debug + Send {
    /// Start listening. Every accepted payload is pushed to `inbound`.
    ///
    /// Returns once the transport is ready to send and receive.
    fn open(&mut self, inbound: Sender<Inbound>) -> Result<(), TransportError>;

    /// Send a payload to the contact's address.
    fn send(&mut self, payload: &[u8], to: &Contact) -> Result<(), TransportError>;

    /// Release all resources. Inbound delivery stops.
    fn close(&mut self);

    /// Address other contacts can reach this transport at.
    fn local_addr(&self) -> SocketAddr;
}
