//! TCP transport with length-prefixed frames.
//!
//! Each frame is a big-endian `u32` length followed by the payload. Every
//! destination gets a writer thread owning its outbound connection, so
//! [Transport::send] only enqueues and never waits on the network.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, trace};

use super::{Inbound, Transport};
use crate::common::Contact;
use crate::error::TransportError;

/// Largest accepted frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const LENGTH_PREFIX: usize = 4;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
/// A writer with nothing to send for this long closes its connection and exits.
const WRITER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Frames queued per destination before new ones are dropped.
const WRITER_QUEUE_SIZE: usize = 256;

/// [Transport] over TCP streams.
#[derive(Debug)]
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    writers: HashMap<SocketAddr, Sender<Bytes>>,
}

impl TcpTransport {
    /// Bind a listener to `address`, use port `0` for any free port.
    pub fn bind(address: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            closed: Arc::new(AtomicBool::new(false)),
            handle: None,
            writers: HashMap::new(),
        })
    }

    /// Hand the frame to the writer of `address`, spawning one if needed.
    fn enqueue(&mut self, frame: Bytes, address: SocketAddr) -> Result<(), TransportError> {
        let frame = match self.writers.get(&address) {
            Some(writer) => match writer.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => {
                    debug!(?address, "Tcp writer queue is full, dropping frame");
                    return Ok(());
                }
                // The writer went idle and exited.
                Err(TrySendError::Disconnected(frame)) => frame,
            },
            None => frame,
        };

        let (sender, receiver) = flume::bounded(WRITER_QUEUE_SIZE);
        let closed = self.closed.clone();

        thread::Builder::new()
            .name(format!("kademlia-tcp-writer {}", address))
            .spawn(move || write_loop(address, receiver, closed))?;

        // Fresh and empty, this can't fail.
        let _ = sender.try_send(frame);
        self.writers.insert(address, sender);

        Ok(())
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, inbound: Sender<Inbound>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if self.handle.is_some() {
            return Ok(());
        }

        let listener = self.listener.try_clone()?;
        listener.set_nonblocking(true)?;

        let closed = self.closed.clone();

        let handle = thread::Builder::new()
            .name("kademlia-tcp".to_string())
            .spawn(move || accept_loop(listener, inbound, closed))?;

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
        if payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(payload);

        self.enqueue(frame.freeze(), to.address())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);

        // Writers exit once their queue disconnects.
        self.writers.clear();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write every queued frame to `address`, connecting lazily.
///
/// Frames that can't be delivered are dropped, the request they carry times out.
fn write_loop(address: SocketAddr, frames: Receiver<Bytes>, closed: Arc<AtomicBool>) {
    let mut stream: Option<TcpStream> = None;

    while !closed.load(Ordering::Relaxed) {
        let frame = match frames.recv_timeout(WRITER_IDLE_TIMEOUT) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => {
                trace!(?address, "Tcp writer idle");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        // One retry with a fresh connection, the cached one may have been closed by the peer.
        for _ in 0..2 {
            if stream.is_none() {
                match connect(address) {
                    Ok(connected) => stream = Some(connected),
                    Err(error) => {
                        debug!(?address, ?error, "Failed to connect, dropping frame");
                        break;
                    }
                }
            }

            let written = match stream.as_mut() {
                Some(connected) => connected.write_all(&frame),
                None => break,
            };

            match written {
                Ok(()) => break,
                Err(error) => {
                    debug!(?address, ?error, "Dropping broken tcp stream");
                    stream = None;
                }
            }
        }
    }

    if let Some(stream) = stream {
        let _ = stream.shutdown(Shutdown::Both);
    }
}

fn connect(address: SocketAddr) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;

    Ok(stream)
}

fn accept_loop(listener: TcpListener, inbound: Sender<Inbound>, closed: Arc<AtomicBool>) {
    while !closed.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, from)) => {
                let inbound = inbound.clone();
                let closed = closed.clone();

                let spawned = thread::Builder::new()
                    .name("kademlia-tcp-conn".to_string())
                    .spawn(move || {
                        if let Err(error) = read_loop(stream, from, inbound, closed) {
                            trace!(?from, ?error, "Tcp connection closed with error");
                        }
                    });

                if let Err(error) = spawned {
                    debug!(?error, "Failed to spawn tcp connection reader");
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(error) => {
                trace!(context = "tcp_error", ?error, "accept failed unexpectedly");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn read_loop(
    mut stream: TcpStream,
    from: SocketAddr,
    inbound: Sender<Inbound>,
    closed: Arc<AtomicBool>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;

    let mut buffer = BytesMut::with_capacity(MAX_FRAME_SIZE);
    let mut chunk = [0u8; 4096];

    while !closed.load(Ordering::Relaxed) {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(amt) => buffer.extend_from_slice(&chunk[..amt]),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue
            }
            Err(error) => return Err(error),
        }

        while let Some(payload) = next_frame(&mut buffer)? {
            if inbound
                .send(Inbound {
                    payload,
                    from: Some(from),
                })
                .is_err()
            {
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Split the next complete frame off the buffer.
fn next_frame(buffer: &mut BytesMut) -> std::io::Result<Option<Bytes>> {
    if buffer.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {length} bytes is too large"),
        ));
    }

    if buffer.len() < LENGTH_PREFIX + length {
        return Ok(None);
    }

    buffer.advance(LENGTH_PREFIX);

    Ok(Some(buffer.split_to(length).freeze()))
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use crate::common::Id;

    use super::*;

    #[test]
    fn frames() {
        let mut buffer = BytesMut::new();

        buffer.extend_from_slice(&[0, 0, 0, 3, b'a', b'b']);
        assert_eq!(next_frame(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(&[b'c', 0, 0]);
        assert_eq!(
            next_frame(&mut buffer).unwrap(),
            Some(Bytes::from_static(b"abc"))
        );
        assert_eq!(next_frame(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(&[0, 0]);
        assert_eq!(next_frame(&mut buffer).unwrap(), Some(Bytes::new()));

        let mut oversized = BytesMut::new();
        oversized.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(next_frame(&mut oversized).is_err());
    }

    #[test]
    fn send_and_receive() {
        let mut a = TcpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let mut b = TcpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();

        let (a_tx, _a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();

        a.open(a_tx).unwrap();
        b.open(b_tx).unwrap();

        let to = Contact::new(Id::random(), b.local_addr());

        a.send(b"first", &to).unwrap();
        a.send(b"second", &to).unwrap();

        let timeout = Duration::from_secs(5);

        assert_eq!(
            b_rx.recv_timeout(timeout).unwrap().payload,
            Bytes::from_static(b"first")
        );
        assert_eq!(
            b_rx.recv_timeout(timeout).unwrap().payload,
            Bytes::from_static(b"second")
        );

        b.close();
        a.close();
    }

    #[test]
    fn send_does_not_wait_on_unreachable_destination() {
        let mut a = TcpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let mut b = TcpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();

        let (a_tx, _a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();

        a.open(a_tx).unwrap();
        b.open(b_tx).unwrap();

        // Non routable, a connect would hang until its timeout.
        let blackhole = Contact::new(Id::random(), "10.255.255.1:6881".parse().unwrap());
        let to = Contact::new(Id::random(), b.local_addr());

        let start = Instant::now();
        for _ in 0..20 {
            a.send(b"lost", &blackhole).unwrap();
        }
        a.send(b"delivered", &to).unwrap();
        assert!(start.elapsed() < CONNECT_TIMEOUT);

        assert_eq!(
            b_rx.recv_timeout(Duration::from_secs(5)).unwrap().payload,
            Bytes::from_static(b"delivered")
        );

        b.close();
        a.close();
    }
}
