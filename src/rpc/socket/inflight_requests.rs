use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::{Contact, Id};
use crate::rpc::iterative_query::QueryKey;

/// Why a request was sent, decides who handles its response or timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Purpose {
    /// Issued through [crate::rpc::Rpc::request], reported by token.
    Request,
    /// A probe of an iterative lookup.
    Query(QueryKey),
    /// Liveness probe of the least recently seen contact of a full bucket.
    Eviction { replacement: Contact },
    /// STORE sent by a put to the closest contacts of the target.
    Store(Id),
}

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub token: u32,
    pub to: Contact,
    pub sent_at: Instant,
    pub timeout: Duration,
    pub purpose: Purpose,
}

impl InflightRequest {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.sent_at) >= self.timeout
    }
}

/// Pending requests keyed by their correlation token.
#[derive(Debug, Default)]
pub struct InflightRequests {
    requests: HashMap<u32, InflightRequest>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, request: InflightRequest) {
        self.requests.insert(request.token, request);
    }

    /// Check if a token is still inflight.
    pub fn contains(&self, token: u32) -> bool {
        self.requests.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Remove the request with this token if it was sent to `from`.
    ///
    /// A response carrying a known token from another id is ignored and the
    /// request stays pending.
    pub fn remove(&mut self, token: u32, from: &Id) -> Option<InflightRequest> {
        match self.requests.get(&token) {
            Some(request) if request.to.id() == from => self.requests.remove(&token),
            _ => None,
        }
    }

    /// Remove and return every request whose deadline passed.
    pub fn expired(&mut self) -> Vec<InflightRequest> {
        let now = Instant::now();

        let tokens: Vec<u32> = self
            .requests
            .values()
            .filter(|request| request.is_expired(now))
            .map(|request| request.token)
            .collect();

        let mut expired: Vec<InflightRequest> = tokens
            .iter()
            .filter_map(|token| self.requests.remove(token))
            .collect();

        expired.sort_by_key(|request| request.sent_at);

        expired
    }

    /// Remove and return every pending request.
    pub fn drain(&mut self) -> Vec<InflightRequest> {
        self.requests.drain().map(|(_, request)| request).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(token: u32, to: Contact, timeout: Duration) -> InflightRequest {
        InflightRequest {
            token,
            to,
            sent_at: Instant::now(),
            timeout,
            purpose: Purpose::Request,
        }
    }

    #[test]
    fn remove_checks_sender() {
        let mut requests = InflightRequests::new();
        let to = Contact::random();

        requests.add(request(1, to, Duration::from_secs(1)));

        assert!(requests.remove(1, &Id::random()).is_none());
        assert!(requests.contains(1));

        assert!(requests.remove(1, to.id()).is_some());
        assert!(!requests.contains(1));
        assert!(requests.remove(1, to.id()).is_none());
    }

    #[test]
    fn expired_are_removed_once() {
        let mut requests = InflightRequests::new();

        requests.add(request(1, Contact::random(), Duration::ZERO));
        requests.add(request(2, Contact::random(), Duration::from_secs(60)));

        let expired = requests.expired();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].token, 1);
        assert!(requests.expired().is_empty());
        assert_eq!(requests.len(), 1);
    }
}
