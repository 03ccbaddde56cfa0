//! Key/value store answering STORE and FIND_VALUE requests.

use std::fmt::Debug;
use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;

use crate::error::StorageError;

/// Maximum size of a stored value in bytes.
pub const MAX_VALUE_SIZE: usize = 1000;
/// Default number of values kept by [MemoryStorage].
pub const DEFAULT_MAX_VALUES: usize = 1000;

/// Storage collaborator of a node. Keys and values are opaque bytes.
pub trait Storage: Debug + Send {
    fn get(&mut self, key: &[u8]) -> Option<Bytes>;

    fn put(&mut self, key: &[u8], value: Bytes) -> Result<(), StorageError>;
}

#[derive(Debug)]
/// Bounded in-memory [Storage] evicting the least recently used value.
pub struct MemoryStorage {
    values: LruCache<Box<[u8]>, Bytes>,
}

impl MemoryStorage {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            values: LruCache::new(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_MAX_VALUES).unwrap_or(NonZeroUsize::MIN))
    }
}

impl Storage for MemoryStorage {
    fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        self.values.get(key).cloned()
    }

    fn put(&mut self, key: &[u8], value: Bytes) -> Result<(), StorageError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(StorageError::ValueTooLarge(value.len()));
        }

        self.values.put(key.into(), value);

        Ok(())
    }
}
