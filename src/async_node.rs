//! AsyncNode node.

use bytes::Bytes;
use flume::Sender;

use crate::common::{Contact, Id, RoutingTable};
use crate::error::NodeWasShutdown;
use crate::node::{ActorMessage, Node};
use crate::rpc::Info;
use crate::Error;

impl Node {
    /// Return an async version of the Node client.
    pub fn as_async(self) -> AsyncNode {
        AsyncNode(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Kademlia node.
pub struct AsyncNode(Node);

impl AsyncNode {
    // === Getters ===

    /// Information and statistics about this node.
    pub async fn info(&self) -> Result<Info, NodeWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv_async().await.map_err(|_| NodeWasShutdown)
    }

    /// The contact other nodes can reach this node at.
    pub async fn contact(&self) -> Result<Contact, NodeWasShutdown> {
        let info = self.info().await?;

        Ok(Contact::new(*info.id(), info.local_addr()))
    }

    /// A snapshot of this node's routing table.
    pub async fn routing_table(&self) -> Result<RoutingTable, NodeWasShutdown> {
        let (sender, receiver) = flume::bounded::<RoutingTable>(1);

        self.send(ActorMessage::RoutingTable(sender))?;

        receiver.recv_async().await.map_err(|_| NodeWasShutdown)
    }

    // === Public Methods ===

    /// See [Node::connect].
    pub async fn connect(&self, contact: Contact) -> Result<(), Error> {
        self.ask(|sender| ActorMessage::Connect(contact, sender))
            .await
    }

    pub async fn ping(&self, contact: Contact) -> Result<(), Error> {
        self.ask(|sender| ActorMessage::Ping(contact, sender)).await
    }

    pub async fn find_node(&self, target: Id) -> Result<Vec<Contact>, Error> {
        self.ask(|sender| ActorMessage::FindNode(target, sender))
            .await
    }

    /// See [Node::get].
    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        let target = Id::from_key(key);

        self.ask(|sender| ActorMessage::Get(target, sender)).await
    }

    /// See [Node::put].
    pub async fn put(&self, key: &[u8], value: Bytes) -> Result<usize, Error> {
        let target = Id::from_key(key);

        self.ask(|sender| ActorMessage::Put(target, value, sender))
            .await
    }

    pub async fn refresh(&self, from_index: Option<usize>) -> Result<(), Error> {
        self.ask(|sender| ActorMessage::Refresh(from_index, sender))
            .await
    }

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        if self.0 .0.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv_async().await;
        }
    }

    // === Private Methods ===

    fn send(&self, message: ActorMessage) -> Result<(), NodeWasShutdown> {
        self.0 .0.send(message).map_err(|_| NodeWasShutdown)
    }

    async fn ask<T>(
        &self,
        message: impl FnOnce(Sender<Result<T, Error>>) -> ActorMessage,
    ) -> Result<T, Error> {
        let (sender, receiver) = flume::bounded::<Result<T, Error>>(1);

        self.send(message(sender))?;

        receiver.recv_async().await.map_err(|_| NodeWasShutdown)?
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use futures::executor;

    use crate::rpc::Config;
    use crate::Testnet;

    use super::*;

    #[test]
    fn put_get() {
        let testnet = Testnet::with_config(
            4,
            Config {
                request_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .unwrap();

        let a = testnet.nodes[1].clone().as_async();
        let b = testnet.nodes[2].clone().as_async();

        executor::block_on(async {
            let stored_at = a.put(b"key", Bytes::from_static(b"value")).await.unwrap();
            assert_eq!(stored_at, 3);

            assert_eq!(
                b.get(b"key").await.unwrap(),
                Some(Bytes::from_static(b"value"))
            );

            b.shutdown().await;

            assert!(b.info().await.is_err());
        });
    }
}
