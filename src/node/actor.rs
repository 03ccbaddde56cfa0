use std::collections::HashMap;

use bytes::Bytes;
use flume::{Receiver, RecvError, Sender, TryRecvError};
use tracing::{debug, info};

use crate::common::{Contact, Id, ResponseSpecific, RoutingTable};
use crate::rpc::{Info, QueryKind, Rpc, RpcTickReport};
use crate::Error;

/// Owns the [Rpc] of a node and answers the [crate::Node] handles.
#[derive(Debug)]
pub struct Actor {
    rpc: Rpc,
    receiver: Receiver<ActorMessage>,

    request_senders: HashMap<u32, RequestSender>,
    /// Waiting for the lookup of our own id that ends `connect`.
    connect_senders: Vec<Sender<Result<(), Error>>>,
    find_node_senders: HashMap<Id, Vec<Sender<Result<Vec<Contact>, Error>>>>,
    get_senders: HashMap<Id, Vec<Sender<Result<Option<Bytes>, Error>>>>,
    put_senders: HashMap<Id, Vec<Sender<Result<usize, Error>>>>,
    refresh_senders: Vec<Sender<Result<(), Error>>>,
}

impl Actor {
    pub fn new(rpc: Rpc, receiver: Receiver<ActorMessage>) -> Self {
        Self {
            rpc,
            receiver,

            request_senders: HashMap::new(),
            connect_senders: Vec::new(),
            find_node_senders: HashMap::new(),
            get_senders: HashMap::new(),
            put_senders: HashMap::new(),
            refresh_senders: Vec::new(),
        }
    }

    /// Returns an error if the actor should stop, either because every
    /// handle was dropped or because of an explicit shutdown.
    pub fn tick(&mut self) -> Result<(), RecvError> {
        loop {
            match self.receiver.try_recv() {
                Ok(actor_message) => {
                    if !self.handle_message(actor_message) {
                        return Err(RecvError::Disconnected);
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    // Node was dropped, kill this thread.
                    debug!("kademlia::Node's actor thread was shutdown after Drop.");
                    self.shutdown();

                    return Err(RecvError::Disconnected);
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let report = self.rpc.tick();
        self.handle_report(report);

        Ok(())
    }

    // === Private Methods ===

    /// Returns false after a shutdown.
    fn handle_message(&mut self, actor_message: ActorMessage) -> bool {
        match actor_message {
            ActorMessage::Info(sender) => {
                let _ = sender.send(self.rpc.info());
            }
            ActorMessage::RoutingTable(sender) => {
                let _ = sender.send(self.rpc.routing_table().clone());
            }
            ActorMessage::Ping(contact, sender) => {
                let token = self.rpc.ping(contact);
                self.request_senders
                    .insert(token, RequestSender::Ping(sender));
            }
            ActorMessage::Connect(contact, sender) => {
                info!(bootstrap = %contact, "Connecting");

                let token = self.rpc.ping(contact);
                self.request_senders
                    .insert(token, RequestSender::Connect(sender));
            }
            ActorMessage::FindNode(target, sender) => match self.rpc.find_node(target) {
                Ok(()) => self
                    .find_node_senders
                    .entry(target)
                    .or_default()
                    .push(sender),
                Err(error) => {
                    let _ = sender.send(Err(error));
                }
            },
            ActorMessage::Get(target, sender) => match self.rpc.get(target) {
                Ok(()) => self.get_senders.entry(target).or_default().push(sender),
                Err(error) => {
                    let _ = sender.send(Err(error));
                }
            },
            ActorMessage::Put(target, value, sender) => match self.rpc.put(target, value) {
                Ok(()) => self.put_senders.entry(target).or_default().push(sender),
                Err(error) => {
                    let _ = sender.send(Err(error));
                }
            },
            ActorMessage::Refresh(from_index, sender) => {
                if self.rpc.refresh_buckets_beyond_closest(from_index) {
                    self.refresh_senders.push(sender);
                } else {
                    let _ = sender.send(Ok(()));
                }
            }
            ActorMessage::Shutdown(sender) => {
                self.shutdown();
                let _ = sender.send(());

                return false;
            }
        }

        true
    }

    fn handle_report(&mut self, report: RpcTickReport) {
        for (token, result) in report.done_requests {
            match self.request_senders.remove(&token) {
                Some(RequestSender::Ping(sender)) => {
                    let _ = sender.send(result.map(|_| ()));
                }
                Some(RequestSender::Connect(sender)) => self.on_bootstrap_ping(result, sender),
                None => {}
            }
        }

        for query in report.done_queries {
            let target = query.key.target;

            match query.key.kind {
                QueryKind::FindNode => {
                    if target == *self.rpc.id() {
                        for sender in self.connect_senders.drain(..) {
                            let result = if query.closest.is_empty() {
                                Err(Error::EmptyTable)
                            } else {
                                Ok(())
                            };

                            let _ = sender.send(result);
                        }
                    }

                    if let Some(senders) = self.find_node_senders.remove(&target) {
                        for sender in senders {
                            let _ = sender.send(Ok(query.closest.clone()));
                        }
                    }
                }
                QueryKind::FindValue => {
                    if let Some(senders) = self.get_senders.remove(&target) {
                        for sender in senders {
                            let _ = sender.send(Ok(query.value.clone()));
                        }
                    }
                }
            }
        }

        for (target, stored_at) in report.done_put_queries {
            if let Some(senders) = self.put_senders.remove(&target) {
                for sender in senders {
                    let _ = sender.send(stored_at.ok_or(Error::EmptyTable));
                }
            }
        }

        if report.refresh_done {
            for sender in self.refresh_senders.drain(..) {
                let _ = sender.send(Ok(()));
            }
        }
    }

    /// The bootstrap contact answered, it is in the routing table by now, so
    /// look up our own id to populate the closest buckets.
    fn on_bootstrap_ping(
        &mut self,
        result: Result<ResponseSpecific, Error>,
        sender: Sender<Result<(), Error>>,
    ) {
        if let Err(error) = result {
            debug!(?error, "Bootstrap contact did not answer");
            let _ = sender.send(Err(error));
            return;
        }

        let id = *self.rpc.id();

        match self.rpc.find_node(id) {
            Ok(()) => self.connect_senders.push(sender),
            Err(error) => {
                let _ = sender.send(Err(error));
            }
        }
    }

    /// Close the rpc and fail everyone still waiting with [Error::Cancelled].
    fn shutdown(&mut self) {
        let report = self.rpc.close();
        self.handle_report(report);

        for (_, sender) in self.request_senders.drain() {
            match sender {
                RequestSender::Ping(sender) | RequestSender::Connect(sender) => {
                    let _ = sender.send(Err(Error::Cancelled));
                }
            }
        }
        for sender in self.connect_senders.drain(..) {
            let _ = sender.send(Err(Error::Cancelled));
        }
        for sender in self.find_node_senders.drain().flat_map(|(_, s)| s) {
            let _ = sender.send(Err(Error::Cancelled));
        }
        for sender in self.get_senders.drain().flat_map(|(_, s)| s) {
            let _ = sender.send(Err(Error::Cancelled));
        }
        for sender in self.put_senders.drain().flat_map(|(_, s)| s) {
            let _ = sender.send(Err(Error::Cancelled));
        }
        for sender in self.refresh_senders.drain(..) {
            let _ = sender.send(Err(Error::Cancelled));
        }
    }
}

#[derive(Debug)]
enum RequestSender {
    Ping(Sender<Result<(), Error>>),
    Connect(Sender<Result<(), Error>>),
}

#[derive(Debug)]
pub enum ActorMessage {
    Info(Sender<Info>),
    RoutingTable(Sender<RoutingTable>),
    Ping(Contact, Sender<Result<(), Error>>),
    Connect(Contact, Sender<Result<(), Error>>),
    FindNode(Id, Sender<Result<Vec<Contact>, Error>>),
    Get(Id, Sender<Result<Option<Bytes>, Error>>),
    Put(Id, Bytes, Sender<Result<usize, Error>>),
    Refresh(Option<usize>, Sender<Result<(), Error>>),
    Shutdown(Sender<()>),
}
