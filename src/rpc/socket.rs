//! Socket layer managing outgoing requests and responses over a [Transport].

mod inflight_requests;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::common::{
    Contact, ErrorSpecific, Id, Message, MessageType, RequestSpecific, ResponseSpecific,
};
use crate::error::TransportError;
use crate::rpc::transport::{Inbound, Transport};

pub use inflight_requests::{InflightRequest, Purpose};
use inflight_requests::InflightRequests;

/// The maximum duration to block waiting for inbound messages in one tick.
/// Lower values increase CPU usage, but reduce latency of handle messages.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A [Transport] wrapper that formats and correlates requests and responses.
#[derive(Debug)]
pub struct RpcSocket {
    transport: Box<dyn Transport>,
    inbound_sender: Sender<Inbound>,
    inbound: Receiver<Inbound>,
    contact: Contact,
    next_token: u32,
    request_timeout: Duration,
    inflight_requests: InflightRequests,
}

impl RpcSocket {
    pub fn new(id: Id, transport: Box<dyn Transport>, request_timeout: Duration) -> Self {
        let (inbound_sender, inbound) = flume::unbounded();
        let contact = Contact::new(id, transport.local_addr());

        Self {
            transport,
            inbound_sender,
            inbound,
            contact,
            next_token: rand::random(),
            request_timeout,
            inflight_requests: InflightRequests::new(),
        }
    }

    // === Getters ===

    /// The contact advertised as sender of every message.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Returns true if a request with this token is waiting for a response.
    #[cfg(test)]
    pub fn inflight(&self, token: u32) -> bool {
        self.inflight_requests.contains(token)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight_requests.len()
    }

    // === Public Methods ===

    pub fn open(&mut self) -> Result<(), TransportError> {
        self.transport.open(self.inbound_sender.clone())
    }

    pub fn close(&mut self) {
        self.transport.close()
    }

    /// Send a request to the contact and return its token.
    ///
    /// The request stays inflight until [Self::take] or [Self::expired]
    /// return it, even if the transport failed to send it.
    pub fn request(
        &mut self,
        to: Contact,
        request: RequestSpecific,
        purpose: Purpose,
        timeout: Option<Duration>,
    ) -> u32 {
        let token = self.token();

        self.inflight_requests.add(InflightRequest {
            token,
            to,
            sent_at: Instant::now(),
            timeout: timeout.unwrap_or(self.request_timeout),
            purpose,
        });

        let message = Message {
            token,
            sender: self.contact,
            message_type: MessageType::Request(request),
        };

        if let Err(error) = self.send(&to, &message) {
            debug!(?error, to = %to, "Error sending request message");
        }

        token
    }

    /// Send a response to the given contact.
    pub fn response(&mut self, to: &Contact, token: u32, response: ResponseSpecific) {
        let message = Message {
            token,
            sender: self.contact,
            message_type: MessageType::Response(response),
        };

        if let Err(error) = self.send(to, &message) {
            debug!(?error, to = %to, "Error sending response message");
        }
    }

    /// Send an error to the given contact.
    pub fn error(&mut self, to: &Contact, token: u32, error: ErrorSpecific) {
        let message = Message {
            token,
            sender: self.contact,
            message_type: MessageType::Error(error),
        };

        if let Err(error) = self.send(to, &message) {
            debug!(?error, to = %to, "Error sending error message");
        }
    }

    /// Wait up to `timeout` for the next inbound payload.
    pub fn recv(&self, timeout: Duration) -> Option<Inbound> {
        match self.inbound.recv_timeout(timeout) {
            Ok(inbound) => Some(inbound),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<Inbound> {
        self.inbound.try_recv().ok()
    }

    /// Decode an inbound payload, dropping it if it is malformed.
    ///
    /// A sender advertising an unspecified ip is reachable at the observed ip
    /// and its advertised port.
    pub fn decode(&self, payload: &[u8], from: Option<SocketAddr>) -> Option<Message> {
        let mut message = match Message::from_bytes(payload) {
            Ok(message) => message,
            Err(error) => {
                debug!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(payload),
                    "Received invalid message."
                );
                return None;
            }
        };

        let advertised = message.sender.address();

        if let Some(observed) = from {
            if advertised.ip().is_unspecified() {
                message.sender = message
                    .sender
                    .with_address(SocketAddr::new(observed.ip(), advertised.port()));
            }
        }

        trace!(context = "socket_message_receiving", ?message, ?from);

        Some(message)
    }

    /// Take the inflight request answered by a response with this token.
    pub fn take(&mut self, token: u32, sender: &Contact) -> Option<InflightRequest> {
        let request = self.inflight_requests.remove(token, sender.id());

        if request.is_none() {
            trace!(
                context = "socket_validation",
                token,
                sender = %sender,
                "Unexpected response token"
            );
        }

        request
    }

    /// Remove and return the requests whose deadline passed.
    pub fn expired(&mut self) -> Vec<InflightRequest> {
        self.inflight_requests.expired()
    }

    /// Remove and return every inflight request.
    pub fn drain(&mut self) -> Vec<InflightRequest> {
        self.inflight_requests.drain()
    }

    // === Private Methods ===

    /// Increments self.next_token and returns the previous value, skipping
    /// tokens that are still inflight.
    fn token(&mut self) -> u32 {
        loop {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);

            if !self.inflight_requests.contains(token) {
                return token;
            }
        }
    }

    fn send(&mut self, to: &Contact, message: &Message) -> Result<(), crate::Error> {
        let bytes = message.to_bytes()?;

        trace!(context = "socket_message_sending", ?message, to = %to);

        self.transport.send(&bytes, to)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::rpc::transport::MemoryNetwork;

    use super::*;

    fn socket(network: &MemoryNetwork) -> RpcSocket {
        let mut socket = RpcSocket::new(
            Id::random(),
            Box::new(network.transport()),
            Duration::from_millis(50),
        );
        socket.open().unwrap();
        socket
    }

    #[test]
    fn tokens_skip_inflight() {
        let network = MemoryNetwork::new();
        let mut socket = socket(&network);

        socket.next_token = u32::MAX;

        let to = Contact::random();

        assert_eq!(
            socket.request(to, RequestSpecific::Ping, Purpose::Request, None),
            u32::MAX
        );
        assert_eq!(
            socket.request(to, RequestSpecific::Ping, Purpose::Request, None),
            0
        );

        socket.next_token = u32::MAX;
        assert_eq!(socket.token(), 1);
    }

    #[test]
    fn request_response() {
        let network = MemoryNetwork::new();

        let mut client = socket(&network);
        let mut server = socket(&network);

        let server_contact = *server.contact();
        let token = client.request(server_contact, RequestSpecific::Ping, Purpose::Request, None);

        let inbound = server.recv(Duration::from_secs(1)).unwrap();
        let request = server.decode(&inbound.payload, inbound.from).unwrap();

        assert_eq!(request.token, token);
        assert_eq!(request.sender, *client.contact());
        assert_eq!(
            request.message_type,
            MessageType::Request(RequestSpecific::Ping)
        );

        server.response(&request.sender, request.token, ResponseSpecific::Ack);

        let inbound = client.recv(Duration::from_secs(1)).unwrap();
        let response = client.decode(&inbound.payload, inbound.from).unwrap();

        // Unknown sender does not resolve the request.
        assert!(client.take(token, &Contact::random()).is_none());

        let inflight = client.take(response.token, &response.sender).unwrap();
        assert_eq!(inflight.to, server_contact);
        assert!(!client.inflight(token));
    }

    #[test]
    fn unspecified_sender_ip_uses_observed_ip() {
        let network = MemoryNetwork::new();
        let socket = socket(&network);

        let message = Message {
            token: 1,
            sender: Contact::new(Id::random(), "0.0.0.0:7000".parse().unwrap()),
            message_type: MessageType::Request(RequestSpecific::Ping),
        };

        let decoded = socket
            .decode(
                &message.to_bytes().unwrap(),
                Some("10.0.0.7:4000".parse().unwrap()),
            )
            .unwrap();

        assert_eq!(decoded.sender.address(), "10.0.0.7:7000".parse().unwrap());
    }

    #[test]
    fn malformed_is_dropped() {
        let network = MemoryNetwork::new();
        let socket = socket(&network);

        assert!(socket.decode(b"garbage", None).is_none());
    }

    #[test]
    fn requests_expire() {
        let network = MemoryNetwork::new();
        let mut socket = socket(&network);

        let token = socket.request(
            Contact::random(),
            RequestSpecific::Ping,
            Purpose::Request,
            Some(Duration::ZERO),
        );

        let expired = socket.expired();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].token, token);
        assert!(!socket.inflight(token));
    }
}
