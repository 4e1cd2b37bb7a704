//! Catch-up helpers: blocks waiting for their parent, epoch blocks waiting
//! for the local shard head, and the request/wait loop used while a node
//! bootstraps from its peers.

use crate::network::{Envelope, Inbox, Message, Transport};
use crate::protocol::{short_hex, Block, EpochBlock, Hash};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::debug;

/// Blocks whose parent is not known yet, keyed by that parent. Bounded; the
/// oldest entry is evicted first.
#[derive(Debug)]
pub struct OrphanPool {
    by_parent: HashMap<Hash, Vec<Block>>,
    known: HashSet<Hash>,
    arrival: VecDeque<(Hash, Hash)>,
    max_orphans: usize,
}

impl OrphanPool {
    pub fn new(max_orphans: usize) -> Self {
        OrphanPool {
            by_parent: HashMap::new(),
            known: HashSet::new(),
            arrival: VecDeque::new(),
            max_orphans,
        }
    }

    /// Parks `block`. Returns false when it was already parked or the pool
    /// has no room at all.
    pub fn insert(&mut self, block: Block) -> bool {
        if self.max_orphans == 0 || self.known.contains(&block.hash) {
            return false;
        }
        while self.known.len() >= self.max_orphans && !self.arrival.is_empty() {
            self.evict_oldest();
        }
        debug!(
            hash = %short_hex(&block.hash),
            parent = %short_hex(&block.prev_hash),
            "Parking orphan block"
        );
        self.known.insert(block.hash);
        self.arrival.push_back((block.prev_hash, block.hash));
        self.by_parent.entry(block.prev_hash).or_default().push(block);
        true
    }

    fn evict_oldest(&mut self) {
        let Some((parent, hash)) = self.arrival.pop_front() else {
            return;
        };
        if let Some(children) = self.by_parent.get_mut(&parent) {
            children.retain(|child| child.hash != hash);
            if children.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        self.known.remove(&hash);
    }

    /// Removes and returns every parked child of `parent`.
    pub fn take_children(&mut self, parent: &Hash) -> Vec<Block> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        for child in &children {
            self.known.remove(&child.hash);
        }
        self.arrival.retain(|(p, _)| p != parent);
        children
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.known.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// Epoch blocks that arrived before this node's shard head matched them.
#[derive(Debug)]
pub struct ParkedEpochs {
    by_height: BTreeMap<(u32, Hash), EpochBlock>,
    max_parked: usize,
}

impl ParkedEpochs {
    pub fn new(max_parked: usize) -> Self {
        ParkedEpochs {
            by_height: BTreeMap::new(),
            max_parked,
        }
    }

    /// Returns false when the block is already parked or there is no room.
    pub fn park(&mut self, epoch: EpochBlock) -> bool {
        let key = (epoch.height, epoch.hash);
        if self.by_height.contains_key(&key) || self.by_height.len() >= self.max_parked {
            return false;
        }
        debug!(
            height = epoch.height,
            hash = %short_hex(&epoch.hash),
            "Parking epoch block"
        );
        self.by_height.insert(key, epoch);
        true
    }

    /// All parked epoch blocks, lowest height first.
    pub fn take_all(&mut self) -> Vec<EpochBlock> {
        std::mem::take(&mut self.by_height).into_values().collect()
    }

    /// Drops everything at or below an already committed epoch height.
    pub fn prune(&mut self, committed_height: u32) {
        self.by_height
            .retain(|(height, _), _| *height > committed_height);
    }

    pub fn len(&self) -> usize {
        self.by_height.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_height.is_empty()
    }
}

/// Sends `request` every `retry_every` until `accept` recognizes an answer
/// or `timeout` expires. Unrelated traffic is kept in `backlog`, in arrival
/// order, for the dispatcher to replay later. Returns `None` on timeout or
/// when the inbox closes.
pub async fn request_and_wait<T>(
    transport: &dyn Transport,
    inbox: &mut Inbox,
    request: Message,
    timeout: Duration,
    retry_every: Duration,
    backlog: &mut VecDeque<Envelope>,
    mut accept: impl FnMut(&Message) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    let mut retry = interval(retry_every);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = sleep_until(deadline) => return None,
            _ = retry.tick() => {
                if let Err(e) = transport.request(request.clone()) {
                    debug!(request = request.name(), "Request failed: {}", e);
                }
            }
            received = inbox.recv() => {
                let envelope = received?;
                if let Some(answer) = accept(&envelope.message) {
                    return Some(answer);
                }
                backlog.push_back(envelope);
            }
        }
    }
}
