//! Main Crate Error

use std::net::SocketAddr;

#[derive(thiserror::Error, Debug)]
/// Kademlia crate error enum.
pub enum Error {
    /// No response arrived within the request deadline.
    #[error("Request timed out")]
    Timeout,

    /// A lookup was attempted without any seed contacts in the routing table.
    #[error("Routing table is empty, connect to a bootstrapping contact first")]
    EmptyTable,

    /// The node was shut down while the request was pending.
    #[error("Request cancelled by node shutdown")]
    Cancelled,

    #[error(transparent)]
    /// Transparent [TransportError]
    Transport(#[from] TransportError),

    #[error(transparent)]
    /// Transparent [DecodeError]
    MalformedMessage(#[from] DecodeError),

    /// The remote peer answered with an error message.
    #[error("Remote error {code}: {description}")]
    Remote { code: i32, description: String },
}

#[derive(thiserror::Error, Debug)]
/// Errors signaled by a [crate::rpc::transport::Transport].
pub enum TransportError {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// Sending before [crate::rpc::transport::Transport::open] was called.
    #[error("Transport is not open")]
    NotOpen,

    /// Sending after [crate::rpc::transport::Transport::close] was called.
    #[error("Transport is closed")]
    Closed,

    /// Nothing is listening on the destination address.
    #[error("Destination {0} is unreachable")]
    Unreachable(SocketAddr),

    /// Payload does not fit in a single frame of this transport.
    #[error("Payload of {0} bytes is too large")]
    PayloadTooLarge(usize),
}

#[derive(thiserror::Error, Debug)]
/// Errors decoding an inbound message.
pub enum DecodeError {
    /// Errors related to parsing DHT messages.
    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    #[error("Invalid hex encoded Id: {0}")]
    InvalidHex(String),

    /// Compact addresses are either 6 (IPv4) or 18 (IPv6) bytes.
    #[error("Wrong number of bytes for a compact address: {0}")]
    InvalidAddress(usize),

    /// Indicates that the message token is not four bytes.
    #[error("Invalid token: {0:?}")]
    InvalidToken(Vec<u8>),

    #[error("Invalid contact: {0}")]
    InvalidContact(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors returned by a [crate::common::Storage] implementation.
pub enum StorageError {
    #[error("Value of {0} bytes exceeds the maximum value size")]
    ValueTooLarge(usize),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The node was shutdown")]
/// The node's actor thread is no longer running.
pub struct NodeWasShutdown;

impl From<NodeWasShutdown> for Error {
    fn from(_: NodeWasShutdown) -> Self {
        Error::Cancelled
    }
}
