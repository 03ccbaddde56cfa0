//! Routing table maintenance: ping-before-evict and bucket refresh planning.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{AddOutcome, Contact, Id, RequestSpecific, RoutingTable};

use super::socket::{Purpose, RpcSocket};

/// Owns the [RoutingTable] of a node, every mutation goes through here.
#[derive(Debug)]
pub struct Router {
    table: RoutingTable,
    /// Least recently seen contacts currently being probed before eviction.
    probing: HashSet<Id>,
}

impl Router {
    pub fn new(id: Id, k: usize) -> Self {
        Self {
            table: RoutingTable::with_bucket_size(id, k),
            probing: HashSet::new(),
        }
    }

    // === Getters ===

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Number of eviction probes waiting for an answer.
    #[cfg(test)]
    pub fn probing(&self) -> usize {
        self.probing.len()
    }

    // === Public Methods ===

    /// Insert or refresh a contact.
    ///
    /// If its bucket is full, the least recently seen contact is pinged with
    /// `ping_ttl` as timeout. The newcomer only takes its slot if the ping
    /// times out. While a bucket's head is being probed, more newcomers to
    /// that bucket are dropped.
    pub fn add_contact(&mut self, contact: Contact, socket: &mut RpcSocket, ping_ttl: Duration) {
        match self.table.add(contact) {
            AddOutcome::Inserted => trace!(contact = %contact, "Inserted contact"),
            AddOutcome::Updated | AddOutcome::Rejected => {}
            AddOutcome::Full {
                least_recently_seen,
            } => {
                if !self.probing.insert(*least_recently_seen.id()) {
                    trace!(contact = %contact, "Bucket full and already probing, dropping contact");
                    return;
                }

                debug!(
                    stale = %least_recently_seen,
                    replacement = %contact,
                    "Bucket full, pinging least recently seen contact"
                );

                socket.request(
                    least_recently_seen,
                    RequestSpecific::Ping,
                    Purpose::Eviction {
                        replacement: contact,
                    },
                    Some(ping_ttl),
                );
            }
        }
    }

    /// The probed contact answered, it was already refreshed by the inbound
    /// message and the replacement is dropped.
    pub fn on_eviction_response(&mut self, stale: &Id) {
        self.probing.remove(stale);
    }

    /// The probed contact did not answer within its ping ttl.
    pub fn on_eviction_timeout(&mut self, stale: &Id, replacement: Contact) {
        self.probing.remove(stale);

        if self.table.evict(stale, replacement) {
            debug!(?stale, replacement = %replacement, "Evicted unresponsive contact");
        }
    }

    pub fn remove_contact(&mut self, id: &Id) -> Option<Contact> {
        self.table.remove(id)
    }

    /// Up to `count` contacts nearest to `target`, never including `excluded`.
    pub fn get_contacts(&self, target: &Id, count: usize, excluded: Option<&Id>) -> Vec<Contact> {
        self.table.closest_excluding(target, count, excluded)
    }

    /// Lookup targets for every stale bucket at or beyond the closest
    /// non-empty bucket, or beyond `from_index` if given.
    ///
    /// Each target is a random id inside the distance range of its bucket.
    pub fn refresh_targets(&self, from_index: Option<usize>, interval: Duration) -> Vec<(usize, Id)> {
        let up_to = match from_index.or_else(|| self.table.closest_bucket_index()) {
            Some(index) => index,
            None => return Vec::new(),
        };

        let id = *self.table.id();

        self.table
            .stale_buckets(up_to, interval)
            .into_iter()
            .map(|index| (index, id.random_in_bucket(index)))
            .collect()
    }

    pub fn touch_bucket(&mut self, index: usize) {
        self.table.touch_bucket(index)
    }
}
