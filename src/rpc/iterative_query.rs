//! Manage iterative queries and their corresponding request/response.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tracing::{debug, trace};

use super::closest_contacts::ClosestContacts;
use super::socket::{Purpose, RpcSocket};
use crate::common::{
    Contact, FindNodeRequestArguments, FindValueRequestArguments, Id, RequestSpecific,
    ResponseSpecific,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    FindNode,
    FindValue,
}

/// Identifies a running lookup, concurrent callers of the same key join it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub target: Id,
    pub kind: QueryKind,
}

impl QueryKey {
    pub fn find_node(target: Id) -> Self {
        Self {
            target,
            kind: QueryKind::FindNode,
        }
    }

    pub fn find_value(target: Id) -> Self {
        Self {
            target,
            kind: QueryKind::FindValue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Rounds of `alpha` probes to the closest uncontacted contacts.
    Probing,
    /// A round brought nothing closer, probing the `k` closest uncontacted once more.
    Converged,
    /// Nothing left to probe and never improved beyond the seeds.
    Exhausted,
    Done,
}

/// An iterative process of concurrently probing the closest known contacts to
/// the target, merging the closer contacts they return, and repeating until a
/// round finds nothing closer.
#[derive(Debug)]
pub struct IterativeQuery {
    key: QueryKey,
    local_id: Id,
    k: usize,
    alpha: usize,

    shortlist: ClosestContacts,
    contacted: HashSet<Id>,
    /// Contacts that timed out or answered with an error, never merged back.
    failed: HashSet<Id>,
    /// Tokens of this query's inflight probes, and who they went to.
    inflight: HashMap<u32, Id>,

    closest_so_far: Option<Id>,
    round_best: Option<Id>,
    rounds: usize,
    improved: bool,
    responders: usize,

    state: QueryState,
    value: Option<Bytes>,
}

impl IterativeQuery {
    pub fn new(local_id: Id, key: QueryKey, seeds: Vec<Contact>, k: usize, alpha: usize) -> Self {
        let mut shortlist = ClosestContacts::new(key.target);

        for contact in seeds {
            if contact.id() != &local_id {
                shortlist.add(contact);
            }
        }

        trace!(?key, seeds = shortlist.len(), "New query");

        Self {
            key,
            local_id,
            k,
            alpha: alpha.max(1),

            closest_so_far: shortlist.closest_distance(),
            shortlist,
            contacted: HashSet::new(),
            failed: HashSet::new(),
            inflight: HashMap::new(),

            round_best: None,
            rounds: 0,
            improved: false,
            responders: 0,

            state: QueryState::Probing,
            value: None,
        }
    }

    // === Getters ===

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    #[cfg(test)]
    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, QueryState::Done | QueryState::Exhausted)
    }

    /// The `k` closest known contacts, nearest first.
    pub fn closest(&self) -> Vec<Contact> {
        self.shortlist.take(self.k)
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Number of probes that got a response.
    pub fn responders(&self) -> usize {
        self.responders
    }

    // === Public Methods ===

    /// Start the first round.
    pub fn start(&mut self, socket: &mut RpcSocket) -> bool {
        self.advance(socket)
    }

    /// Merge a response to one of this query's probes.
    pub fn on_response(&mut self, token: u32, response: &ResponseSpecific) {
        if self.inflight.remove(&token).is_none() {
            return;
        }

        self.responders += 1;

        match response {
            ResponseSpecific::Value(arguments) if self.key.kind == QueryKind::FindValue => {
                debug!(target = ?self.key.target, "Query found value");

                self.value = Some(arguments.value.clone());
                self.state = QueryState::Done;
            }
            ResponseSpecific::Nodes(arguments) => {
                for contact in &arguments.contacts {
                    if contact.id() == &self.local_id || self.failed.contains(contact.id()) {
                        continue;
                    }

                    let distance = contact.id().xor(&self.key.target);

                    if self.round_best.map_or(true, |best| distance < best) {
                        self.round_best = Some(distance);
                    }

                    self.shortlist.add(*contact);
                }
            }
            _ => {}
        }
    }

    /// A probe timed out or answered with an error, it no longer counts as
    /// known, even if another contact returns it later.
    pub fn on_failure(&mut self, token: u32) {
        if let Some(id) = self.inflight.remove(&token) {
            self.shortlist.remove(&id);
            self.failed.insert(id);
        }
    }

    /// Start the next round once every probe of the current one resolved.
    ///
    /// Returns true if the query is done.
    pub fn advance(&mut self, socket: &mut RpcSocket) -> bool {
        if self.is_done() {
            return true;
        }

        if !self.inflight.is_empty() {
            return false;
        }

        match self.state {
            QueryState::Probing => {
                if self.rounds > 0 {
                    let closer = match (self.round_best, self.closest_so_far) {
                        (Some(best), Some(so_far)) => best < so_far,
                        (Some(_), None) => true,
                        _ => false,
                    };

                    self.round_best = None;

                    if closer {
                        self.closest_so_far = self.shortlist.closest_distance();
                        self.improved = true;
                    } else {
                        self.state = QueryState::Converged;

                        if self.visit_closest(socket, self.k) == 0 {
                            self.finish();
                        }

                        return self.is_done();
                    }
                }

                if self.visit_closest(socket, self.alpha) == 0 {
                    self.finish();
                }
            }
            QueryState::Converged => self.finish(),
            QueryState::Exhausted | QueryState::Done => {}
        }

        self.is_done()
    }

    // === Private Methods ===

    /// Probe up to `count` of the closest uncontacted contacts, returns how many.
    fn visit_closest(&mut self, socket: &mut RpcSocket, count: usize) -> usize {
        let to_visit: Vec<Contact> = self
            .shortlist
            .contacts()
            .iter()
            .filter(|contact| !self.contacted.contains(contact.id()))
            .take(count)
            .copied()
            .collect();

        for contact in &to_visit {
            let request = match self.key.kind {
                QueryKind::FindNode => RequestSpecific::FindNode(FindNodeRequestArguments {
                    target: self.key.target,
                }),
                QueryKind::FindValue => RequestSpecific::FindValue(FindValueRequestArguments {
                    key: self.key.target,
                }),
            };

            let token = socket.request(*contact, request, Purpose::Query(self.key), None);

            self.inflight.insert(token, *contact.id());
            self.contacted.insert(*contact.id());
        }

        if !to_visit.is_empty() {
            self.rounds += 1;
        }

        to_visit.len()
    }

    /// Terminate without a value, [QueryState::Exhausted] if no round ever
    /// brought anything closer than the seeds.
    fn finish(&mut self) {
        self.state = if self.improved {
            QueryState::Done
        } else {
            QueryState::Exhausted
        };

        debug!(
            target = ?self.key.target,
            kind = ?self.key.kind,
            state = ?self.state,
            rounds = self.rounds,
            contacted = self.contacted.len(),
            responders = self.responders,
            "Done query"
        );
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::common::{NodesResponseArguments, ValueResponseArguments};
    use crate::rpc::transport::MemoryNetwork;

    use super::*;

    fn socket(network: &MemoryNetwork, id: Id) -> RpcSocket {
        let mut socket = RpcSocket::new(id, Box::new(network.transport()), Duration::from_secs(5));
        socket.open().unwrap();
        socket
    }

    fn contact(id: Id, port: u16) -> Contact {
        Contact::new(id, std::net::SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn tokens_to(socket: &mut RpcSocket) -> Vec<(u32, Contact)> {
        socket
            .drain()
            .into_iter()
            .map(|request| (request.token, request.to))
            .collect()
    }

    #[test]
    fn converges_when_nothing_closer() {
        let network = MemoryNetwork::new();
        let local = Id::random();
        let mut socket = socket(&network, local);

        let target = Id::random();
        let seeds: Vec<Contact> = (0..5).map(|i| contact(Id::random(), i)).collect();

        let mut query = IterativeQuery::new(local, QueryKey::find_node(target), seeds, 20, 3);

        assert!(!query.start(&mut socket));
        assert_eq!(query.state(), QueryState::Probing);

        let first_round = tokens_to(&mut socket);
        assert_eq!(first_round.len(), 3);

        // Nobody knows anything closer.
        for (token, _) in &first_round {
            query.on_response(
                *token,
                &ResponseSpecific::Nodes(NodesResponseArguments { contacts: vec![] }),
            );
        }

        // Final round to the remaining uncontacted contacts.
        assert!(!query.advance(&mut socket));
        assert_eq!(query.state(), QueryState::Converged);

        let final_round = tokens_to(&mut socket);
        assert_eq!(final_round.len(), 2);

        for (token, _) in &final_round {
            query.on_failure(*token);
        }

        assert!(query.advance(&mut socket));
        // Nothing closer than the seeds was ever found.
        assert_eq!(query.state(), QueryState::Exhausted);

        // Failed contacts are not part of the result.
        assert_eq!(query.closest().len(), 3);
    }

    #[test]
    fn failed_contact_is_not_merged_back() {
        let network = MemoryNetwork::new();
        let local = Id::random();
        let mut socket = socket(&network, local);

        let target = Id::random();
        let dead = contact(target.random_in_bucket(40), 1);
        let live = contact(target.random_in_bucket(10), 2);

        let mut query =
            IterativeQuery::new(local, QueryKey::find_node(target), vec![dead, live], 20, 3);
        query.start(&mut socket);

        let round = tokens_to(&mut socket);
        assert_eq!(round.len(), 2);

        for (token, to) in &round {
            if to == &dead {
                query.on_failure(*token);
            }
        }
        for (token, to) in &round {
            if to == &live {
                query.on_response(
                    *token,
                    &ResponseSpecific::Nodes(NodesResponseArguments {
                        contacts: vec![dead],
                    }),
                );
            }
        }

        while !query.advance(&mut socket) {
            for (token, _) in tokens_to(&mut socket) {
                query.on_failure(token);
            }
        }

        assert!(!query.closest().contains(&dead));
        assert_eq!(query.closest(), vec![live]);
    }

    #[test]
    fn exhausted_when_every_seed_times_out() {
        let network = MemoryNetwork::new();
        let local = Id::random();
        let mut socket = socket(&network, local);

        let seeds: Vec<Contact> = (0..2).map(|i| contact(Id::random(), i)).collect();

        let mut query =
            IterativeQuery::new(local, QueryKey::find_node(Id::random()), seeds, 20, 3);
        query.start(&mut socket);

        for (token, _) in tokens_to(&mut socket) {
            query.on_failure(token);
        }

        assert!(query.advance(&mut socket));
        assert_eq!(query.state(), QueryState::Exhausted);
        assert_eq!(query.responders(), 0);
        assert!(query.closest().is_empty());
    }

    #[test]
    fn closer_contacts_start_new_round() {
        let network = MemoryNetwork::new();
        let local = Id::random();
        let mut socket = socket(&network, local);

        let target = Id::random();
        let far = contact(target.random_in_bucket(0), 1);
        let closer = contact(target.random_in_bucket(50), 2);

        let mut query =
            IterativeQuery::new(local, QueryKey::find_node(target), vec![far], 20, 3);

        query.start(&mut socket);
        let (token, to) = tokens_to(&mut socket)[0];
        assert_eq!(to, far);

        query.on_response(
            token,
            &ResponseSpecific::Nodes(NodesResponseArguments {
                contacts: vec![closer, contact(local, 3)],
            }),
        );

        assert!(!query.advance(&mut socket));
        assert_eq!(query.state(), QueryState::Probing);

        let second_round = tokens_to(&mut socket);
        assert_eq!(second_round.len(), 1);
        assert_eq!(second_round[0].1, closer);

        // Our own id is never added to the shortlist.
        assert_eq!(query.closest(), vec![closer, far]);
    }

    #[test]
    fn value_short_circuits() {
        let network = MemoryNetwork::new();
        let local = Id::random();
        let mut socket = socket(&network, local);

        let target = Id::random();
        let seeds: Vec<Contact> = (0..5).map(|i| contact(Id::random(), i)).collect();

        let mut query = IterativeQuery::new(local, QueryKey::find_value(target), seeds, 20, 3);
        query.start(&mut socket);

        let round = tokens_to(&mut socket);

        query.on_response(
            round[0].0,
            &ResponseSpecific::Value(ValueResponseArguments {
                value: Bytes::from_static(b"hello"),
            }),
        );

        // Done without waiting for the other probes.
        assert!(query.is_done());
        assert!(query.advance(&mut socket));
        assert_eq!(query.value(), Some(&Bytes::from_static(b"hello")));
    }

    #[test]
    fn exhausted_without_seeds() {
        let network = MemoryNetwork::new();
        let local = Id::random();
        let mut socket = socket(&network, local);

        let mut query =
            IterativeQuery::new(local, QueryKey::find_node(Id::random()), vec![], 20, 3);

        assert!(query.start(&mut socket));
        assert_eq!(query.state(), QueryState::Exhausted);
        assert!(query.closest().is_empty());
    }
}
