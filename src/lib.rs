#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod error;

#[cfg(feature = "async")]
pub mod async_node;
mod node;
pub mod rpc;

pub use crate::common::{
    messages, Contact, Id, KBucket, MemoryStorage, RoutingTable, Storage, ID_BITS, ID_SIZE,
    MAX_BUCKET_SIZE_K, MAX_VALUE_SIZE,
};
pub use bytes::Bytes;
pub use node::{Node, NodeBuilder, Testnet};

pub use error::{DecodeError, Error, NodeWasShutdown, StorageError, TransportError};
