//! Kademlia RPC engine: request correlation, routing and lookups of one node.

mod closest_contacts;
pub mod config;
mod info;
pub(crate) mod iterative_query;
mod put_query;
mod refresh;
mod router;
mod socket;
pub mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::common::{
    Contact, ErrorSpecific, FindNodeRequestArguments, FindValueRequestArguments, Id, Message,
    MessageType, NodesResponseArguments, RequestSpecific, ResponseSpecific, RoutingTable,
    Storage, StoreRequestArguments, ValueResponseArguments, SERVER_ERROR_CODE,
};
use crate::Error;

pub use config::Config;
pub use info::Info;
pub use iterative_query::{QueryKey, QueryKind};
pub use socket::MAX_THREAD_BLOCK_DURATION;

use iterative_query::IterativeQuery;
use put_query::PutQuery;
use refresh::BucketRefresh;
use router::Router;
use socket::{InflightRequest, Purpose, RpcSocket};
use transport::Transport;

/// Inbound payloads handled per tick after the first one arrived.
const MAX_INBOUND_BATCH: usize = 64;

/// Internal Rpc called in the Node's actor thread.
///
/// Owns the socket, the router and every running lookup. Nothing in here
/// blocks except [Rpc::tick], for at most [MAX_THREAD_BLOCK_DURATION].
#[derive(Debug)]
pub struct Rpc {
    socket: RpcSocket,
    router: Router,
    storage: Box<dyn Storage>,

    queries: HashMap<QueryKey, IterativeQuery>,
    put_queries: HashMap<Id, PutQuery>,
    /// Values waiting for their FIND_NODE lookup to finish before the STORE.
    pending_puts: HashMap<Id, Bytes>,
    refresh: BucketRefresh,

    config: Config,
    report: RpcTickReport,
    closed: bool,
}

impl Rpc {
    /// Create a new Rpc bound to `transport`. Call [Rpc::open] before ticking.
    pub fn new(config: Config, transport: Box<dyn Transport>, storage: Box<dyn Storage>) -> Self {
        let id = config.id.unwrap_or_else(Id::random);
        let k = config.k.max(1);

        Rpc {
            socket: RpcSocket::new(id, transport, config.request_timeout),
            router: Router::new(id, k),
            storage,

            queries: HashMap::new(),
            put_queries: HashMap::new(),
            pending_puts: HashMap::new(),
            refresh: BucketRefresh::new(config.refresh_interval),

            config: Config { k, ..config },
            report: RpcTickReport::default(),
            closed: false,
        }
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        self.socket.contact().id()
    }

    /// The contact other nodes know this node as.
    pub fn contact(&self) -> Contact {
        *self.socket.contact()
    }

    /// Returns the address the transport is listening to.
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        self.router.table()
    }

    /// Number of requests waiting for a response or a timeout.
    pub fn inflight_requests(&self) -> usize {
        self.socket.inflight_count()
    }

    /// Number of iterative lookups in progress.
    pub fn running_queries(&self) -> usize {
        self.queries.len()
    }

    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Open the underlying transport. Idempotent.
    pub fn open(&mut self) -> Result<(), Error> {
        self.socket.open()?;

        info!(id = ?self.id(), address = ?self.local_addr(), "Kademlia node listening");

        Ok(())
    }

    /// Close the transport and fail every pending request with [Error::Cancelled].
    ///
    /// Running lookups are dropped. Calling it again is a no-op.
    pub fn close(&mut self) -> RpcTickReport {
        if self.closed {
            return RpcTickReport::default();
        }
        self.closed = true;

        self.socket.close();

        for request in self.socket.drain() {
            if request.purpose == Purpose::Request {
                self.report
                    .done_requests
                    .push((request.token, Err(Error::Cancelled)));
            }
        }

        self.queries.clear();
        self.put_queries.clear();
        self.pending_puts.clear();
        self.refresh.clear();

        debug!(id = ?self.id(), "Closed rpc");

        std::mem::take(&mut self.report)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send a request, its outcome is reported by token in a later [RpcTickReport].
    pub fn request(&mut self, contact: Contact, request: RequestSpecific) -> u32 {
        self.socket
            .request(contact, request, Purpose::Request, None)
    }

    pub fn ping(&mut self, contact: Contact) -> u32 {
        self.request(contact, RequestSpecific::Ping)
    }

    /// Start an iterative FIND_NODE lookup, or join the running one.
    pub fn find_node(&mut self, target: Id) -> Result<(), Error> {
        self.start_query(QueryKey::find_node(target))
    }

    /// Start an iterative FIND_VALUE lookup, or join the running one.
    pub fn get(&mut self, target: Id) -> Result<(), Error> {
        self.start_query(QueryKey::find_value(target))
    }

    /// Find the closest contacts to `target` and send them a STORE.
    ///
    /// A put to a target whose lookup is still running replaces the pending value.
    pub fn put(&mut self, target: Id, value: Bytes) -> Result<(), Error> {
        self.pending_puts.insert(target, value);

        if let Err(error) = self.find_node(target) {
            self.pending_puts.remove(&target);
            return Err(error);
        }

        Ok(())
    }

    /// Insert or refresh a contact, see [Router::add_contact].
    pub fn add_contact(&mut self, contact: Contact) {
        if contact.id() == self.id() {
            return;
        }

        self.router
            .add_contact(contact, &mut self.socket, self.config.ping_ttl);
    }

    pub fn remove_contact(&mut self, id: &Id) -> Option<Contact> {
        self.router.remove_contact(id)
    }

    /// Up to `count` known contacts nearest to `target`.
    pub fn get_contacts(&self, target: &Id, count: usize) -> Vec<Contact> {
        self.router.get_contacts(target, count, None)
    }

    /// Queue a FIND_NODE lookup for a random id in every stale bucket at or
    /// beyond the closest non-empty bucket (or `from_index`), run one at a time.
    ///
    /// Returns true if a refresh is running, its end is reported by
    /// [RpcTickReport::refresh_done].
    pub fn refresh_buckets_beyond_closest(&mut self, from_index: Option<usize>) -> bool {
        let targets = self
            .router
            .refresh_targets(from_index, self.config.refresh_interval);

        debug!(buckets = targets.len(), ?from_index, "Refreshing buckets");

        self.refresh.extend(targets);
        self.advance_refresh();

        if self.refresh.take_finished() {
            return false;
        }

        self.refresh.is_running()
    }

    /// Handle one inbound payload, `from` is the address it was observed from.
    pub fn receive(&mut self, payload: &[u8], from: Option<SocketAddr>) {
        let message = match self.socket.decode(payload, from) {
            Some(message) => message,
            None => return,
        };

        if message.sender.id() == self.id() {
            debug!(?from, "Dropping message from our own id");
            return;
        }

        let Message {
            token,
            sender,
            message_type,
        } = message;

        match message_type {
            MessageType::Request(request) => {
                self.add_contact(sender);
                self.handle_request(sender, token, request);
            }
            MessageType::Response(response) => {
                self.handle_response(sender, token, Ok(response));
            }
            MessageType::Error(error) => {
                debug!(?error, sender = %sender, "RPC Error response");

                self.handle_response(
                    sender,
                    token,
                    Err(Error::Remote {
                        code: error.code,
                        description: error.description,
                    }),
                );
            }
        }
    }

    /// Advance every timer, handle inbound messages and lookups, and return
    /// what finished since the last tick.
    pub fn tick(&mut self) -> RpcTickReport {
        if self.closed {
            return std::mem::take(&mut self.report);
        }

        // === Timeouts ===
        for request in self.socket.expired() {
            self.on_timeout(request);
        }

        // === Inbound ===
        if let Some(inbound) = self.socket.recv(MAX_THREAD_BLOCK_DURATION) {
            self.receive(&inbound.payload, inbound.from);

            for _ in 0..MAX_INBOUND_BATCH {
                match self.socket.try_recv() {
                    Some(inbound) => self.receive(&inbound.payload, inbound.from),
                    None => break,
                }
            }
        }

        // === Queries ===
        self.advance_queries();
        self.advance_put_queries();

        // === Refresh ===
        self.advance_refresh();

        if !self.router.table().is_empty() && self.refresh.is_due() {
            self.refresh_buckets_beyond_closest(None);
        }

        if self.refresh.take_finished() {
            self.report.refresh_done = true;
        }

        std::mem::take(&mut self.report)
    }

    // === Private Methods ===

    fn start_query(&mut self, key: QueryKey) -> Result<(), Error> {
        if self.queries.contains_key(&key) {
            return Ok(());
        }

        let seeds = self
            .router
            .get_contacts(&key.target, self.config.k, None);

        if seeds.is_empty() {
            return Err(Error::EmptyTable);
        }

        let mut query = IterativeQuery::new(
            *self.id(),
            key,
            seeds,
            self.config.k,
            self.config.alpha,
        );
        query.start(&mut self.socket);

        self.queries.insert(key, query);

        Ok(())
    }

    fn handle_request(&mut self, sender: Contact, token: u32, request: RequestSpecific) {
        trace!(method = request.method(), sender = %sender, token, "Handling request");

        let response = match request {
            RequestSpecific::Ping => ResponseSpecific::Ack,
            RequestSpecific::FindNode(FindNodeRequestArguments { target }) => {
                ResponseSpecific::Nodes(NodesResponseArguments {
                    contacts: self
                        .router
                        .get_contacts(&target, self.config.k, Some(sender.id())),
                })
            }
            RequestSpecific::FindValue(FindValueRequestArguments { key }) => {
                match self.storage.get(key.as_bytes()) {
                    Some(value) => ResponseSpecific::Value(ValueResponseArguments { value }),
                    None => ResponseSpecific::Nodes(NodesResponseArguments {
                        contacts: self
                            .router
                            .get_contacts(&key, self.config.k, Some(sender.id())),
                    }),
                }
            }
            RequestSpecific::Store(StoreRequestArguments { key, value }) => {
                match self.storage.put(key.as_bytes(), value) {
                    Ok(()) => ResponseSpecific::Ack,
                    Err(error) => {
                        debug!(?error, sender = %sender, "Rejected STORE");

                        self.socket.error(
                            &sender,
                            token,
                            ErrorSpecific {
                                code: SERVER_ERROR_CODE,
                                description: error.to_string(),
                            },
                        );
                        return;
                    }
                }
            }
        };

        self.socket.response(&sender, token, response);
    }

    fn handle_response(
        &mut self,
        sender: Contact,
        token: u32,
        result: Result<ResponseSpecific, Error>,
    ) {
        // Late or unsolicited responses still prove the sender is alive.
        self.add_contact(sender);

        let request = match self.socket.take(token, &sender) {
            Some(request) => request,
            None => return,
        };

        if let Ok(ResponseSpecific::Nodes(arguments)) = &result {
            for contact in &arguments.contacts {
                self.add_contact(*contact);
            }
        }

        match request.purpose {
            Purpose::Request => self.report.done_requests.push((token, result)),
            Purpose::Query(key) => {
                if let Some(query) = self.queries.get_mut(&key) {
                    match &result {
                        Ok(response) => query.on_response(token, response),
                        Err(_) => query.on_failure(token),
                    }
                }
            }
            Purpose::Eviction { .. } => self.router.on_eviction_response(request.to.id()),
            Purpose::Store(target) => {
                if let Some(query) = self.put_queries.get_mut(&target) {
                    query.on_response(token, matches!(result, Ok(ResponseSpecific::Ack)));
                }
            }
        }
    }

    /// A request got no response in time. The contact stays in the table,
    /// only an eviction probe can remove it.
    fn on_timeout(&mut self, request: InflightRequest) {
        debug!(token = request.token, to = %request.to, purpose = ?request.purpose, "Request timed out");

        match request.purpose {
            Purpose::Request => self
                .report
                .done_requests
                .push((request.token, Err(Error::Timeout))),
            Purpose::Query(key) => {
                if let Some(query) = self.queries.get_mut(&key) {
                    query.on_failure(request.token);
                }
            }
            Purpose::Eviction { replacement } => self
                .router
                .on_eviction_timeout(request.to.id(), replacement),
            Purpose::Store(target) => {
                if let Some(query) = self.put_queries.get_mut(&target) {
                    query.on_response(request.token, false);
                }
            }
        }
    }

    fn advance_queries(&mut self) {
        let mut done = Vec::new();

        for (key, query) in self.queries.iter_mut() {
            if query.advance(&mut self.socket) {
                done.push(*key);
            }
        }

        for key in done {
            if let Some(query) = self.queries.remove(&key) {
                self.finish_query(query);
            }
        }
    }

    fn finish_query(&mut self, query: IterativeQuery) {
        let key = *query.key();
        let closest = query.closest();

        if key.kind == QueryKind::FindNode {
            if key.target == *self.id() {
                let table_size = self.router.table().size();

                if table_size == 0 {
                    warn!("Could not bootstrap the routing table");
                } else {
                    info!(table_size, "Populated the routing table");
                }
            }

            if let Some(value) = self.pending_puts.remove(&key.target) {
                if closest.is_empty() {
                    debug!(target = ?key.target, "No contacts to store at");

                    self.report.done_put_queries.push((key.target, None));
                } else {
                    let mut put = PutQuery::new(key.target, value);
                    put.start(&mut self.socket, &closest);

                    self.put_queries.insert(key.target, put);
                }
            }
        }

        if let Some(index) = self.refresh.on_query_done(&key) {
            self.router.touch_bucket(index);

            if query.responders() == 0 {
                warn!(index, "Bucket refresh lookup got no responses");
            }
        }

        self.report.done_queries.push(DoneQuery {
            key,
            closest,
            value: query.value().cloned(),
            responders: query.responders(),
        });
    }

    fn advance_put_queries(&mut self) {
        let report = &mut self.report;

        self.put_queries.retain(|target, query| {
            if query.is_done() {
                report
                    .done_put_queries
                    .push((*target, Some(query.stored_at())));
                return false;
            }

            true
        });
    }

    /// Start the next queued refresh lookup if none is running.
    fn advance_refresh(&mut self) {
        while let Some((index, target)) = self.refresh.next() {
            let key = QueryKey::find_node(target);

            match self.start_query(key) {
                Ok(()) => {
                    self.refresh.set_current(index, key);
                    break;
                }
                Err(error) => warn!(index, ?error, "Failed to refresh bucket"),
            }
        }
    }
}

/// A finished iterative lookup.
#[derive(Debug, Clone)]
pub struct DoneQuery {
    pub key: QueryKey,
    /// The `k` closest contacts found, nearest first.
    pub closest: Vec<Contact>,
    /// First value found by a FIND_VALUE lookup.
    pub value: Option<Bytes>,
    /// Number of probes that got a response.
    pub responders: usize,
}

/// Everything that finished during one [Rpc::tick].
#[derive(Debug, Default)]
pub struct RpcTickReport {
    /// Requests sent with [Rpc::request], by token.
    pub done_requests: Vec<(u32, Result<ResponseSpecific, Error>)>,
    pub done_queries: Vec<DoneQuery>,
    /// Number of contacts that acknowledged each put, by target. `None` if
    /// the lookup found no contacts to store at.
    pub done_put_queries: Vec<(Id, Option<usize>)>,
    /// The last queued bucket refresh lookup finished.
    pub refresh_done: bool,
}

impl RpcTickReport {
    pub fn is_empty(&self) -> bool {
        self.done_requests.is_empty()
            && self.done_queries.is_empty()
            && self.done_put_queries.is_empty()
            && !self.refresh_done
    }
}
