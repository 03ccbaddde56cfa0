//! UDP transport, one datagram per message.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use flume::Sender;
use tracing::{debug, trace};

use super::{Inbound, Transport};
use crate::common::Contact;
use crate::error::TransportError;

const MTU: usize = 2048;
/// How often the receiving thread checks whether it was closed.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// [Transport] over a [UdpSocket].
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Bind a socket to `address`, use port `0` for any free port.
    pub fn bind(address: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(address)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            closed: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }
}

impl Transport for UdpTransport {
    fn open(&mut self, inbound: Sender<Inbound>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if self.handle.is_some() {
            return Ok(());
        }

        let socket = self.socket.try_clone()?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let closed = self.closed.clone();

        let handle = thread::Builder::new()
            .name("kademlia-udp".to_string())
            .spawn(move || receive_loop(socket, inbound, closed))?;

        self.handle = Some(handle);

        Ok(())
    }

    fn send(&mut self, payload: &[u8], to: &Contact) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if self.handle.is_none() {
            return Err(TransportError::NotOpen);
        }
        if payload.len() > MTU {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }

        self.socket.send_to(payload, to.address())?;

        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(socket: UdpSocket, inbound: Sender<Inbound>, closed: Arc<AtomicBool>) {
    let mut buf = [0u8; MTU];

    while !closed.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((amt, from)) => {
                if from.port() == 0 {
                    trace!(context = "udp_validation", "Datagram from port 0");
                    continue;
                }

                let message = Inbound {
                    payload: Bytes::copy_from_slice(&buf[..amt]),
                    from: Some(from),
                };

                if inbound.send(message).is_err() {
                    debug!("Udp inbound receiver dropped, stopping");
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(error) => {
                trace!(context = "udp_error", ?error, "recv_from failed unexpectedly");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::common::Id;

    use super::*;

    #[test]
    fn send_and_receive() {
        let mut a = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let mut b = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();

        let (a_tx, _a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();

        a.open(a_tx).unwrap();
        b.open(b_tx).unwrap();

        a.send(b"hello", &Contact::new(Id::random(), b.local_addr()))
            .unwrap();

        let inbound = b_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(inbound.payload, Bytes::from_static(b"hello"));
        assert_eq!(inbound.from, Some(a.local_addr()));

        a.close();
        a.close();

        assert!(matches!(
            a.send(b"x", &Contact::new(Id::random(), b.local_addr())),
            Err(TransportError::Closed)
        ));
    }
}
