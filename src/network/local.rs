//! In-process network: every joined peer gets an unbounded queue and the hub
//! routes messages between them. Used by tests and the single-process
//! binary.

use super::{Envelope, Inbox, Message, PeerId, Transport};
use crate::error::{ChainError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::debug;

#[derive(Default)]
pub struct LocalNetwork {
    peers: RwLock<BTreeMap<PeerId, UnboundedSender<Envelope>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork::default())
    }

    /// Registers `id` and returns its transport and inbox. Joining again
    /// with the same id replaces the previous queue.
    pub fn join(self: &Arc<Self>, id: PeerId) -> (Arc<LocalTransport>, Inbox) {
        let (tx, rx) = unbounded_channel();
        self.peers.write().insert(id, tx);
        let transport = Arc::new(LocalTransport {
            id,
            network: Arc::clone(self),
        });
        (transport, rx)
    }

    pub fn leave(&self, id: &PeerId) {
        self.peers.write().remove(id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn deliver(&self, from: PeerId, to: &PeerId, message: Message) -> Result<()> {
        let peers = self.peers.read();
        let queue = peers
            .get(to)
            .ok_or_else(|| ChainError::Network(format!("Unknown peer {}", to)))?;
        queue
            .send(Envelope { from, message })
            .map_err(|_| ChainError::Network(format!("Peer {} has shut down", to)))
    }

    fn deliver_all(&self, from: PeerId, message: Message) {
        let peers = self.peers.read();
        for (id, queue) in peers.iter().filter(|(id, _)| **id != from) {
            let envelope = Envelope {
                from,
                message: message.clone(),
            };
            if queue.send(envelope).is_err() {
                debug!(peer = %id, "Dropping message for closed peer");
            }
        }
    }
}

pub struct LocalTransport {
    id: PeerId,
    network: Arc<LocalNetwork>,
}

impl Transport for LocalTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn broadcast(&self, message: Message) -> Result<()> {
        self.network.deliver_all(self.id, message);
        Ok(())
    }

    fn send(&self, peer: &PeerId, message: Message) -> Result<()> {
        self.network.deliver(self.id, peer, message)
    }
}
