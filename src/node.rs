//! Kademlia node.

mod actor;

use std::net::{Ipv4Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use flume::Sender;
use tracing::debug;

use crate::common::{Contact, Id, MemoryStorage, RoutingTable, Storage};
use crate::error::{NodeWasShutdown, TransportError};
use crate::rpc::transport::{MemoryNetwork, Transport, UdpTransport};
use crate::rpc::{Config, Info, Rpc};
use crate::Error;

use actor::Actor;
pub(crate) use actor::ActorMessage;

#[derive(Debug, Clone)]
/// Kademlia node.
///
/// A handle to an actor thread owning the routing table and every running
/// lookup. Cloning it is cheap, the node runs until [Node::shutdown] is
/// called or every clone is dropped.
pub struct Node(pub(crate) Sender<ActorMessage>);

#[derive(Debug, Default)]
/// A builder for [Node].
pub struct NodeBuilder {
    config: Config,
    port: Option<u16>,
    transport: Option<Box<dyn Transport>>,
    storage: Option<Box<dyn Storage>>,
}

impl NodeBuilder {
    /// Set this node's [Id], random by default.
    pub fn id(mut self, id: Id) -> Self {
        self.config.id = Some(id);
        self
    }

    /// Set the bucket size and replication factor.
    pub fn k(mut self, k: usize) -> Self {
        self.config.k = k;
        self
    }

    /// Set the number of concurrent probes per lookup round.
    pub fn alpha(mut self, alpha: usize) -> Self {
        self.config.alpha = alpha;
        self
    }

    /// Set the request timeout.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.config.request_timeout = request_timeout;
        self
    }

    /// Set how long a contact has to answer before a newcomer replaces it.
    pub fn ping_ttl(mut self, ping_ttl: Duration) -> Self {
        self.config.ping_ttl = ping_ttl;
        self
    }

    /// Set the bucket staleness interval, also the period of automatic refresh.
    pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.config.refresh_interval = refresh_interval;
        self
    }

    /// Replace the whole [Config].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// UDP port to listen on when no transport is set, random by default.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Use a custom [Transport] instead of UDP.
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom [Storage] instead of a bounded [MemoryStorage].
    pub fn storage(mut self, storage: Box<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Open the transport and start the node's actor thread.
    pub fn build(self) -> Result<Node, Error> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Box::new(UdpTransport::bind(SocketAddr::from((
                Ipv4Addr::UNSPECIFIED,
                self.port.unwrap_or(0),
            )))?),
        };

        let storage = self
            .storage
            .unwrap_or_else(|| Box::new(MemoryStorage::default()));

        Node::start(self.config, transport, storage)
    }
}

impl Node {
    /// Returns a builder to edit settings before creating a Node.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// Create a new node listening on a random UDP port with default settings.
    pub fn new() -> Result<Self, Error> {
        Node::builder().build()
    }

    fn start(
        config: Config,
        transport: Box<dyn Transport>,
        storage: Box<dyn Storage>,
    ) -> Result<Self, Error> {
        let (sender, receiver) = flume::unbounded();

        let mut rpc = Rpc::new(config, transport, storage);
        rpc.open()?;

        let name = format!("kademlia node {}", rpc.id());
        let actor = Actor::new(rpc, receiver);

        thread::Builder::new()
            .name(name)
            .spawn(move || run(actor))
            .map_err(TransportError::from)?;

        Ok(Node(sender))
    }

    // === Getters ===

    /// Information and statistics about this node.
    pub fn info(&self) -> Result<Info, NodeWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv().map_err(|_| NodeWasShutdown)
    }

    /// The contact other nodes can reach this node at.
    pub fn contact(&self) -> Result<Contact, NodeWasShutdown> {
        let info = self.info()?;

        Ok(Contact::new(*info.id(), info.local_addr()))
    }

    /// A snapshot of this node's routing table.
    pub fn routing_table(&self) -> Result<RoutingTable, NodeWasShutdown> {
        let (sender, receiver) = flume::bounded::<RoutingTable>(1);

        self.send(ActorMessage::RoutingTable(sender))?;

        receiver.recv().map_err(|_| NodeWasShutdown)
    }

    // === Public Methods ===

    /// Join the network through a bootstrap contact.
    ///
    /// Pings it, then looks up this node's own id. Fails with
    /// [Error::EmptyTable] if the lookup found no contacts.
    pub fn connect(&self, contact: Contact) -> Result<(), Error> {
        self.ask(|sender| ActorMessage::Connect(contact, sender))
    }

    /// Liveness probe, returns once the contact answered.
    pub fn ping(&self, contact: Contact) -> Result<(), Error> {
        self.ask(|sender| ActorMessage::Ping(contact, sender))
    }

    /// The `k` closest contacts to `target` found by an iterative lookup.
    pub fn find_node(&self, target: Id) -> Result<Vec<Contact>, Error> {
        self.ask(|sender| ActorMessage::FindNode(target, sender))
    }

    /// Look up the value stored under `key`.
    ///
    /// Returns `None` if the lookup ended without finding it.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        let target = Id::from_key(key);

        self.ask(|sender| ActorMessage::Get(target, sender))
    }

    /// Store `value` at the `k` closest contacts to `key`.
    ///
    /// Returns the number of contacts that acknowledged the STORE.
    pub fn put(&self, key: &[u8], value: Bytes) -> Result<usize, Error> {
        let target = Id::from_key(key);

        self.ask(|sender| ActorMessage::Put(target, value, sender))
    }

    /// Refresh stale buckets at or beyond the closest non-empty bucket, or
    /// beyond `from_index` if given. Returns once the last lookup finished.
    pub fn refresh(&self, from_index: Option<usize>) -> Result<(), Error> {
        self.ask(|sender| ActorMessage::Refresh(from_index, sender))
    }

    /// Shutdown the actor thread loop, pending calls fail with [Error::Cancelled].
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        if self.0.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv();
        }
    }

    // === Private Methods ===

    fn send(&self, message: ActorMessage) -> Result<(), NodeWasShutdown> {
        self.0.send(message).map_err(|_| NodeWasShutdown)
    }

    fn ask<T>(
        &self,
        message: impl FnOnce(Sender<Result<T, Error>>) -> ActorMessage,
    ) -> Result<T, Error> {
        let (sender, receiver) = flume::bounded::<Result<T, Error>>(1);

        self.send(message(sender))?;

        receiver.recv().map_err(|_| NodeWasShutdown)?
    }
}

fn run(mut actor: Actor) {
    while actor.tick().is_ok() {}

    debug!("Node actor thread stopped");
}

/// Create a testnet of Kademlia nodes over an in-memory network.
#[derive(Debug)]
pub struct Testnet {
    pub network: MemoryNetwork,
    pub nodes: Vec<Node>,
}

impl Testnet {
    /// `count` nodes with default settings, every node after the first
    /// connected through the first.
    pub fn new(count: usize) -> Result<Testnet, Error> {
        Testnet::with_config(count, Config::default())
    }

    /// Like [Testnet::new], every node built with `config` and a random id.
    pub fn with_config(count: usize, config: Config) -> Result<Testnet, Error> {
        let mut testnet = Testnet {
            network: MemoryNetwork::new(),
            nodes: Vec::with_capacity(count),
        };

        for i in 0..count {
            let builder = Node::builder().config(Config {
                id: None,
                ..config.clone()
            });

            let node = testnet.build(builder)?;

            if i > 0 {
                node.connect(testnet.bootstrap()?)?;
            }

            testnet.nodes.push(node);
        }

        Ok(testnet)
    }

    /// Build a node on this testnet's network, without connecting it.
    pub fn build(&self, builder: NodeBuilder) -> Result<Node, Error> {
        builder.transport(Box::new(self.network.transport())).build()
    }

    /// The first node's contact.
    pub fn bootstrap(&self) -> Result<Contact, Error> {
        match self.nodes.first() {
            Some(node) => Ok(node.contact()?),
            None => Err(Error::EmptyTable),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn testnet_config() -> Config {
        Config {
            request_timeout: Duration::from_millis(200),
            ping_ttl: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn shutdown() {
        let testnet = Testnet::new(1).unwrap();
        let node = testnet.nodes[0].clone();

        let clone = node.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));

            clone.shutdown();
        });

        handle.join().unwrap();

        assert!(node.info().is_err());
        assert!(matches!(
            node.find_node(Id::random()),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn shutdown_cancels_pending_requests() {
        let testnet = Testnet::with_config(1, testnet_config()).unwrap();

        let node = testnet
            .build(Node::builder().request_timeout(Duration::from_secs(30)))
            .unwrap();

        let pinger = node.clone();
        let handle = thread::spawn(move || {
            // Nobody listens there, only the shutdown resolves it.
            pinger.ping(Contact::new(
                Id::random(),
                "10.0.0.1:6881".parse().unwrap(),
            ))
        });

        thread::sleep(Duration::from_millis(100));
        node.shutdown();

        assert!(matches!(handle.join().unwrap(), Err(Error::Cancelled)));
    }

    #[test]
    fn connect_and_ping() {
        let testnet = Testnet::with_config(2, testnet_config()).unwrap();

        let a = &testnet.nodes[0];
        let b = &testnet.nodes[1];

        b.ping(a.contact().unwrap()).unwrap();

        let table = a.routing_table().unwrap();
        assert!(table.contains(b.info().unwrap().id()));

        let info = b.info().unwrap();
        assert_eq!(info.routing_table_size(), 1);
        assert_eq!(info.running_queries(), 0);
    }

    #[test]
    fn connect_to_dead_contact() {
        let testnet = Testnet::with_config(1, testnet_config()).unwrap();
        let node = &testnet.nodes[0];

        let result = node.connect(Contact::new(
            Id::random(),
            "10.0.0.1:6881".parse().unwrap(),
        ));

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(matches!(node.get(b"key"), Err(Error::EmptyTable)));
    }

    #[test]
    fn put_get() {
        let testnet = Testnet::with_config(10, testnet_config()).unwrap();

        let stored_at = testnet.nodes[3]
            .put(b"key", Bytes::from_static(b"value"))
            .unwrap();

        // Everyone but the writer.
        assert_eq!(stored_at, 9);

        for (i, node) in testnet.nodes.iter().enumerate() {
            if i == 3 {
                continue;
            }

            assert_eq!(
                node.get(b"key").unwrap(),
                Some(Bytes::from_static(b"value"))
            );
        }

        assert_eq!(testnet.nodes[5].get(b"missing").unwrap(), None);
    }
}
