use std::collections::HashSet;

use bytes::Bytes;
use tracing::debug;

use super::socket::{Purpose, RpcSocket};
use crate::common::{Contact, Id, RequestSpecific, StoreRequestArguments};

/// Once an iterative FIND_NODE finds the closest contacts to a target, send
/// them a STORE and count the acknowledgments.
#[derive(Debug)]
pub struct PutQuery {
    target: Id,
    value: Bytes,
    inflight: HashSet<u32>,
    stored_at: usize,
    failed: usize,
}

impl PutQuery {
    pub fn new(target: Id, value: Bytes) -> Self {
        Self {
            target,
            value,
            inflight: HashSet::new(),
            stored_at: 0,
            failed: 0,
        }
    }

    /// Number of contacts that acknowledged the STORE.
    pub fn stored_at(&self) -> usize {
        self.stored_at
    }

    pub fn start(&mut self, socket: &mut RpcSocket, contacts: &[Contact]) {
        for contact in contacts {
            let token = socket.request(
                *contact,
                RequestSpecific::Store(StoreRequestArguments {
                    key: self.target,
                    value: self.value.clone(),
                }),
                Purpose::Store(self.target),
                None,
            );

            self.inflight.insert(token);
        }
    }

    /// Record the outcome of one STORE request.
    pub fn on_response(&mut self, token: u32, stored: bool) {
        if !self.inflight.remove(&token) {
            return;
        }

        if stored {
            self.stored_at += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Returns true once every STORE was answered or timed out.
    pub fn is_done(&self) -> bool {
        let done = self.inflight.is_empty();

        if done {
            debug!(target = ?self.target, stored_at = self.stored_at, failed = self.failed, "Done put query");
        }

        done
    }
}
