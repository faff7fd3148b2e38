use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use crossbeam_channel::{self as channel, RecvTimeoutError};
use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{CollageError, Result};
use crate::network::{Message, Transport};
use crate::types::NodeId;

/// What the network does with one message handed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Deliver,
    Drop,
    Duplicate,
}

/// Decides the fate of a message, given its sender and the message addressed to its destination.
type LinkFilter = Box<dyn Fn(&NodeId, &Message) -> Delivery + Send + Sync>;

#[derive(Default)]
struct Routes {
    inboxes: HashMap<NodeId, channel::Sender<Message>>,
    offline: HashSet<NodeId>,
}

#[derive(Default)]
struct Inner {
    routes: RwLock<Routes>,
    filter: RwLock<Option<LinkFilter>>,
}

/// In-process messaging substrate built on crossbeam channels.
///
/// Every endpoint owns an unbounded inbox. Delivery can be perturbed with a
/// link filter (drop or duplicate individual messages) and by taking nodes
/// offline, which drops everything sent to or from them.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an endpoint under `addr`.
    ///
    /// Attaching the same address again replaces the previous inbox, which is
    /// how a restarted process rejoins the network. Messages queued for the
    /// old inbox are lost, as they would be for a crashed process.
    pub fn endpoint(&self, addr: impl Into<NodeId>) -> MemoryEndpoint {
        let addr = addr.into();
        let (sender, inbox) = channel::unbounded();
        self.inner.routes.write().inboxes.insert(addr.clone(), sender);
        debug!("Attached endpoint {} to memory network", addr);
        MemoryEndpoint {
            addr,
            network: self.clone(),
            inbox,
        }
    }

    /// Installs a filter consulted for every message sent on the network.
    pub fn set_link_filter<F>(&self, filter: F)
    where
        F: Fn(&NodeId, &Message) -> Delivery + Send + Sync + 'static,
    {
        *self.inner.filter.write() = Some(Box::new(filter));
    }

    pub fn clear_link_filter(&self) {
        *self.inner.filter.write() = None;
    }

    /// Takes a node off the network, or brings it back.
    pub fn set_offline(&self, addr: &str, offline: bool) {
        let mut routes = self.inner.routes.write();
        if offline {
            routes.offline.insert(addr.to_string());
        } else {
            routes.offline.remove(addr);
        }
    }

    fn route(&self, from: &NodeId, msg: Message) {
        let delivery = match self.inner.filter.read().as_ref() {
            Some(filter) => filter(from, &msg),
            None => Delivery::Deliver,
        };
        let copies = match delivery {
            Delivery::Deliver => 1,
            Delivery::Drop => 0,
            Delivery::Duplicate => 2,
        };

        let routes = self.inner.routes.read();
        if routes.offline.contains(from) || routes.offline.contains(&msg.addr) {
            debug!("Dropping message {} -> {}: node offline", from, msg.addr);
            return;
        }
        let Some(inbox) = routes.inboxes.get(&msg.addr) else {
            debug!("Dropping message {} -> {}: no such endpoint", from, msg.addr);
            return;
        };
        for _ in 0..copies {
            // A closed inbox belongs to a stopped process; the message is lost.
            let _ = inbox.send(Message::new(from.clone(), msg.body.clone()));
        }
    }
}

/// A node's attachment point on a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    addr: NodeId,
    network: MemoryNetwork,
    inbox: channel::Receiver<Message>,
}

impl MemoryEndpoint {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Transport for MemoryEndpoint {
    fn local_addr(&self) -> &NodeId {
        &self.addr
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.network.route(&self.addr, msg);
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CollageError::Transport(format!(
                "inbox of {} is disconnected",
                self.addr
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[test]
    fn delivers_with_sender_address() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("a");
        let b = network.endpoint("b");

        a.send(Message::new("b", b"hello".to_vec())).unwrap();
        let received = b.receive(WAIT).unwrap().unwrap();
        assert_eq!(received, Message::new("a", b"hello".to_vec()));
        assert!(b.receive(WAIT).unwrap().is_none());
    }

    #[test]
    fn unknown_destination_is_silently_dropped() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("a");
        assert!(a.send(Message::new("nowhere", vec![1])).is_ok());
    }

    #[test]
    fn filter_can_drop_and_duplicate() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("a");
        let b = network.endpoint("b");
        network.set_link_filter(|_, msg| match msg.body.as_slice() {
            b"drop" => Delivery::Drop,
            b"dup" => Delivery::Duplicate,
            _ => Delivery::Deliver,
        });

        a.send(Message::new("b", b"drop".to_vec())).unwrap();
        a.send(Message::new("b", b"dup".to_vec())).unwrap();
        assert_eq!(b.receive(WAIT).unwrap().unwrap().body, b"dup");
        assert_eq!(b.receive(WAIT).unwrap().unwrap().body, b"dup");
        assert!(b.receive(WAIT).unwrap().is_none());

        network.clear_link_filter();
        a.send(Message::new("b", b"drop".to_vec())).unwrap();
        assert_eq!(b.receive(WAIT).unwrap().unwrap().body, b"drop");
    }

    #[test]
    fn offline_nodes_neither_send_nor_receive() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("a");
        let b = network.endpoint("b");

        network.set_offline("b", true);
        a.send(Message::new("b", vec![1])).unwrap();
        b.send(Message::new("a", vec![2])).unwrap();
        assert!(b.receive(WAIT).unwrap().is_none());
        assert!(a.receive(WAIT).unwrap().is_none());

        network.set_offline("b", false);
        a.send(Message::new("b", vec![3])).unwrap();
        assert_eq!(b.receive(WAIT).unwrap().unwrap().body, vec![3u8]);
    }

    #[test]
    fn reattaching_replaces_the_inbox() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("a");
        let old = network.endpoint("b");
        a.send(Message::new("b", vec![1])).unwrap();

        let new = network.endpoint("b");
        a.send(Message::new("b", vec![2])).unwrap();
        assert_eq!(new.receive(WAIT).unwrap().unwrap().body, vec![2u8]);
        assert_eq!(old.receive(WAIT).unwrap().unwrap().body, vec![1u8]);
    }
}
