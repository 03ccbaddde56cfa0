//! In-process transport for tests and simulations.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use flume::Sender;
use tracing::trace;

use super::{Inbound, Transport};
use crate::common::Contact;
use crate::error::TransportError;

const PORT: u16 = 6881;

/// Registry of live [MemoryTransport]s, keyed by their address.
///
/// Each network is isolated, tests create their own and pass it around.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    next_address: u32,
    connections: HashMap<SocketAddr, Sender<Inbound>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport with a fresh address on this network.
    pub fn transport(&self) -> MemoryTransport {
        let mut inner = self.lock();

        inner.next_address = inner.next_address.wrapping_add(1);
        let [_, a, b, c] = inner.next_address.to_be_bytes();

        MemoryTransport {
            network: self.clone(),
            address: SocketAddr::from((Ipv4Addr::new(127, a, b, c), PORT)),
            state: State::Idle,
        }
    }

    /// Number of open transports.
    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Open,
    Closed,
}

/// [Transport] delivering payloads through a [MemoryNetwork].
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: SocketAddr,
    state: State,
}

impl Transport for MemoryTransport {
    fn open(&mut self, inbound: Sender<Inbound>) -> Result<(), TransportError> {
        match self.state {
            State::Open => Ok(()),
            State::Closed => Err(TransportError::Closed),
            State::Idle => {
                self.network.lock().connections.insert(self.address, inbound);
                self.state = State::Open;

                Ok(())
            }
        }
    }

    fn send(&mut self, payload: &[u8], to: &Contact) -> Result<(), TransportError> {
        match self.state {
            State::Idle => return Err(TransportError::NotOpen),
            State::Closed => return Err(TransportError::Closed),
            State::Open => {}
        }

        let address = to.address();

        let sender = self
            .network
            .lock()
            .connections
            .get(&address)
            .cloned()
            .ok_or(TransportError::Unreachable(address))?;

        trace!(from = ?self.address, to = ?address, size = payload.len(), "Memory transport send");

        sender
            .send(Inbound {
                payload: Bytes::copy_from_slice(payload),
                from: Some(self.address),
            })
            .map_err(|_| TransportError::Unreachable(address))
    }

    fn close(&mut self) {
        if self.state == State::Open {
            self.network.lock().connections.remove(&self.address);
        }

        self.state = State::Closed;
    }

    fn local_addr(&self) -> SocketAddr {
        self.address
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use crate::common::Id;

    use super::*;

    #[test]
    fn deliver_between_transports() {
        let network = MemoryNetwork::new();

        let mut a = network.transport();
        let mut b = network.transport();

        assert_ne!(a.local_addr(), b.local_addr());

        let (a_tx, _a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();

        a.open(a_tx.clone()).unwrap();
        // Idempotent
        a.open(a_tx).unwrap();
        b.open(b_tx).unwrap();

        assert_eq!(network.len(), 2);

        a.send(b"hello", &Contact::new(Id::random(), b.local_addr()))
            .unwrap();

        let inbound = b_rx.recv().unwrap();
        assert_eq!(inbound.payload, Bytes::from_static(b"hello"));
        assert_eq!(inbound.from, Some(a.local_addr()));
    }

    #[test]
    fn closed_transport_is_unreachable() {
        let network = MemoryNetwork::new();

        let mut a = network.transport();
        let mut b = network.transport();

        assert!(matches!(
            a.send(b"x", &Contact::new(Id::random(), b.local_addr())),
            Err(TransportError::NotOpen)
        ));

        a.open(flume::unbounded().0).unwrap();
        b.open(flume::unbounded().0).unwrap();

        b.close();
        b.close();

        assert!(matches!(
            a.send(b"x", &Contact::new(Id::random(), b.local_addr())),
            Err(TransportError::Unreachable(_))
        ));
        assert_eq!(network.len(), 1);
    }

    #[test]
    fn networks_are_isolated() {
        let first = MemoryNetwork::new();
        let second = MemoryNetwork::new();

        let mut a = first.transport();
        let mut b = second.transport();

        a.open(flume::unbounded().0).unwrap();
        b.open(flume::unbounded().0).unwrap();

        // Both networks hand out the same first address.
        assert_eq!(a.local_addr(), b.local_addr());
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
