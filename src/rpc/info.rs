use std::net::SocketAddr;

use crate::common::Id;

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddr,
    routing_table_size: usize,
    inflight_requests: usize,
    running_queries: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Address the transport is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// Number of contacts in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Requests waiting for a response or a timeout.
    pub fn inflight_requests(&self) -> usize {
        self.inflight_requests
    }
    /// Iterative lookups currently in progress.
    pub fn running_queries(&self) -> usize {
        self.running_queries
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            routing_table_size: rpc.routing_table().size(),
            inflight_requests: rpc.inflight_requests(),
            running_queries: rpc.running_queries(),
        }
    }
}
