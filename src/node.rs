//! Validator node: startup, inbound dispatch and the shared context the
//! dispatcher and the miner work on.

use crate::blockchain::{BlockOutcome, Ledger};
use crate::config::NodeConfig;
use crate::consensus::{ChainHead, Clock, ConsensusEngine, SystemClock, Tip};
use crate::crypto::{Address, KeyPair};
use crate::error::{ChainError, Result};
use crate::miner::{BlockMiner, MiningState};
use crate::network::{Envelope, Inbox, Message, PeerId, Transport};
use crate::persistence::Store;
use crate::protocol::{
    short_hex, Account, Block, Codec, EpochBlock, Genesis, Hash, StateTransition, Transaction,
    TransactionPayload, ValidatorShardMapping,
};
use crate::shard::mapping_for_epoch;
use crate::sync::{request_and_wait, OrphanPool, ParkedEpochs};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Stopped,
}

struct Pending {
    orphans: OrphanPool,
    epochs: ParkedEpochs,
}

/// Everything the dispatcher and the miner share. The ledger mutex is only
/// ever held for synchronous work.
pub struct NodeContext {
    pub(crate) config: NodeConfig,
    pub(crate) identity: KeyPair,
    pub(crate) commitment: KeyPair,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) ledger: Mutex<Ledger>,
    /// Head of this node's shard.
    pub(crate) head: ChainHead,
    pub(crate) epoch_head: ChainHead,
    pub(crate) engine: ConsensusEngine,
    pending: Mutex<Pending>,
    pub(crate) mining: watch::Sender<MiningState>,
    status: watch::Sender<NodeState>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl NodeContext {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn head(&self) -> Tip {
        self.head.tip()
    }

    pub fn epoch_head(&self) -> Tip {
        self.epoch_head.tip()
    }

    pub fn shard_id(&self) -> u32 {
        self.ledger.lock().shard_id()
    }

    pub fn mapping(&self) -> ValidatorShardMapping {
        self.ledger.lock().mapping().clone()
    }

    pub fn global_block_count(&self) -> u32 {
        self.ledger.lock().global_block_count()
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.ledger.lock().state().balance(address)
    }

    pub fn account(&self, address: &Address) -> Option<Account> {
        self.ledger.lock().state().get(address).cloned()
    }

    pub fn mempool_len(&self) -> usize {
        self.ledger.lock().mempool().len()
    }

    /// Admits a locally created transaction and gossips it.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<bool> {
        let payload = tx.encode()?;
        let kind = tx.kind();
        let added = self.ledger.lock().add_transaction(tx)?;
        if added {
            self.transport
                .broadcast(Message::Transaction { kind, payload })?;
        }
        Ok(added)
    }

    fn is_known_parent(&self, ledger: &Ledger, block: &Block) -> Result<bool> {
        Ok(block.prev_hash == ledger.shard_head(block.shard_id).hash
            || self.store.contains_block(&block.prev_hash)?
            || self.store.read_closed_epoch_block(&block.prev_hash)?.is_some())
    }

    /// Validates and commits one block. Returns false when the block was a
    /// duplicate or had to be parked until its parent shows up.
    fn accept_block(&self, block: &Block, gossip: bool) -> Result<bool> {
        let outcome = {
            let mut ledger = self.ledger.lock();
            if self.store.contains_block(&block.hash)? {
                debug!(hash = %short_hex(&block.hash), "Block already committed");
                return Ok(false);
            }
            if block.height <= ledger.last_epoch().height {
                debug!(height = block.height, "Block predates the last epoch block");
                return Ok(false);
            }
            if !self.is_known_parent(&ledger, block)? {
                drop(ledger);
                if self.pending.lock().orphans.insert(block.clone()) {
                    self.transport
                        .request(Message::BlockRequest(block.prev_hash))?;
                }
                return Ok(false);
            }
            let outcome = ledger.validate_block(block, self.store.as_ref(), &self.config)?;
            if let BlockOutcome::Committed(committed) = &outcome {
                self.head
                    .publish(committed.block.hash, committed.block.height);
            }
            outcome
        };

        if gossip {
            self.transport.broadcast(Message::Block(block.encode()?))?;
        }
        if let BlockOutcome::Committed(committed) = outcome {
            self.transport
                .broadcast(Message::StateTransition(committed.transition.encode()?))?;
            self.transport
                .broadcast(Message::TransactionPayload(committed.payload.encode()?))?;
            self.retry_parked_epochs();
        }
        Ok(true)
    }

    /// Processes a block and everything that was parked waiting for it.
    pub fn process_block(&self, block: Block, gossip: bool) -> Result<bool> {
        let accepted = self.accept_block(&block, gossip)?;
        if accepted {
            self.release_children(block.hash);
        }
        Ok(accepted)
    }

    fn release_children(&self, parent: Hash) {
        let mut parents = VecDeque::from([parent]);
        while let Some(parent) = parents.pop_front() {
            let children = self.pending.lock().orphans.take_children(&parent);
            for child in children {
                match self.accept_block(&child, true) {
                    Ok(true) => parents.push_back(child.hash),
                    Ok(false) => {}
                    Err(e) => debug!(
                        hash = %short_hex(&child.hash),
                        "Dropping parked block: {}", e
                    ),
                }
            }
        }
    }

    /// Commits an epoch block. One that does not match the local shard head
    /// yet is parked and retried after the next commit of this shard.
    pub fn process_epoch_block(&self, epoch: EpochBlock, gossip: bool) -> Result<bool> {
        let commit = {
            let mut ledger = self.ledger.lock();
            let next_height = ledger
                .last_epoch()
                .height
                .checked_add(self.config.sharding.epoch_length);
            match ledger.commit_epoch_block(&epoch, self.store.as_ref(), &self.config) {
                Ok(Some(commit)) => {
                    self.epoch_head.publish(epoch.hash, epoch.height);
                    self.head.publish(epoch.hash, epoch.height);
                    commit
                }
                Ok(None) => return Ok(false),
                Err(ChainError::Validation(reason)) if next_height == Some(epoch.height) => {
                    debug!(height = epoch.height, "Epoch block not applicable yet: {}", reason);
                    self.pending.lock().epochs.park(epoch);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        };

        self.pending.lock().epochs.prune(commit.height);
        if gossip {
            self.transport
                .broadcast(Message::EpochBlock(epoch.encode()?))?;
        }
        info!(
            epoch_height = commit.height,
            shard = commit.shard_id,
            validators = commit.mapping.mapping.len(),
            "Entered new epoch"
        );
        self.release_children(epoch.hash);
        Ok(true)
    }

    fn retry_parked_epochs(&self) {
        let parked = self.pending.lock().epochs.take_all();
        for epoch in parked {
            if let Err(e) = self.process_epoch_block(epoch, true) {
                debug!("Dropping parked epoch block: {}", e);
            }
        }
    }

    fn handle(&self, envelope: Envelope) {
        let name = envelope.message.name();
        let from = envelope.from;
        if let Err(e) = self.handle_message(envelope) {
            match e {
                ChainError::Decode(_) => warn!(peer = %from, message = name, "Dropping undecodable message: {}", e),
                ChainError::Validation(_) => info!(peer = %from, message = name, "Rejected: {}", e),
                _ => warn!(peer = %from, message = name, "Failed to handle message: {}", e),
            }
        }
    }

    fn handle_message(&self, envelope: Envelope) -> Result<()> {
        let from = envelope.from;
        match envelope.message {
            Message::Block(bytes) => {
                self.process_block(Block::decode(&bytes)?, true)?;
            }
            Message::EpochBlock(bytes) => {
                self.process_epoch_block(EpochBlock::decode(&bytes)?, true)?;
            }
            Message::Transaction { kind, payload } => {
                let tx = Transaction::decode(kind, &payload)?;
                if self.ledger.lock().add_transaction(tx)? {
                    self.transport
                        .broadcast(Message::Transaction { kind, payload })?;
                }
            }
            Message::StateTransition(bytes) => {
                let transition = StateTransition::decode(&bytes)?;
                self.ledger
                    .lock()
                    .apply_state_transition(transition, self.store.as_ref())?;
            }
            Message::TransactionPayload(bytes) => {
                let payload = TransactionPayload::decode(&bytes)?;
                let purged = self.ledger.lock().purge_payload(&payload);
                if purged > 0 {
                    debug!(shard = payload.shard_id, purged, "Purged sibling shard transactions");
                }
            }
            Message::ValidatorShardMapping(_) | Message::Genesis(_) => {
                debug!(peer = %from, "Ignoring unsolicited bootstrap data");
            }
            Message::BlockRequest(hash) => self.answer_block_request(&from, &hash)?,
            Message::ValidatorShardMapRequest => {
                let mapping = self.mapping();
                if !mapping.mapping.is_empty() {
                    self.transport
                        .send(&from, Message::ValidatorShardMapping(mapping.encode()?))?;
                }
            }
            Message::EpochBlockRequest(hash) => {
                let epoch = match hash {
                    Some(hash) => self.store.read_closed_epoch_block(&hash)?,
                    None => self.store.read_last_epoch_block()?,
                };
                if let Some(epoch) = epoch {
                    self.transport
                        .send(&from, Message::EpochBlock(epoch.encode()?))?;
                }
            }
            Message::GenesisRequest => {
                if let Some(genesis) = self.store.read_genesis()? {
                    self.transport
                        .send(&from, Message::Genesis(genesis.encode()?))?;
                }
            }
        }
        Ok(())
    }

    fn answer_block_request(&self, from: &PeerId, hash: &Hash) -> Result<()> {
        if let Some(block) = self.store.read_closed_block(hash)? {
            return self.transport.send(from, Message::Block(block.encode()?));
        }
        if let Some(epoch) = self.store.read_closed_epoch_block(hash)? {
            return self.transport.send(from, Message::EpochBlock(epoch.encode()?));
        }
        debug!(peer = %from, hash = %short_hex(hash), "Requested block unknown");
        Ok(())
    }
}

/// Where the local chain starts after bootstrapping.
struct ChainStart {
    genesis: Genesis,
    last_epoch: EpochBlock,
    state: BTreeMap<Address, Account>,
    tip: Option<Block>,
    mapping: ValidatorShardMapping,
    /// Applied transition height per sibling shard.
    applied: BTreeMap<u32, u32>,
}

pub struct Node {
    config: NodeConfig,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    inbox: Inbox,
    clock: Arc<dyn Clock>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
    ) -> Self {
        Node {
            config,
            store,
            transport,
            inbox,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Brings the node up: restores or creates the chain (the bootstrap node
    /// creates genesis, everyone else fetches it), obtains the validator
    /// shard mapping, then starts the dispatcher and the miner.
    pub async fn start(self, identity: KeyPair, commitment: KeyPair) -> Result<NodeHandle> {
        self.config.validate()?;
        let (status, _) = watch::channel(NodeState::Booting);
        let Node {
            config,
            store,
            transport,
            mut inbox,
            clock,
        } = self;

        let mut backlog = VecDeque::new();
        status.send_replace(NodeState::Syncing);
        let start = if store.read_genesis()?.is_some() {
            restore_chain(&config, store.as_ref())?
        } else if config.node.bootstrap {
            create_chain(&config, store.as_ref(), &identity, &commitment, clock.as_ref())?
        } else {
            join_chain(&config, store.as_ref(), transport.as_ref(), &mut inbox, &mut backlog)
                .await?
        };

        info!(
            address = %short_hex(&identity.address()),
            epoch_height = start.last_epoch.height,
            accounts = start.state.len(),
            shards = start.mapping.number_of_shards(),
            "Chain initialized"
        );

        let mut ledger = Ledger::new(
            identity.address(),
            start.genesis,
            start.state,
            &start.last_epoch,
            start.mapping,
            config.sharding.max_pending_transitions,
        );
        if let Some(tip) = &start.tip {
            ledger.restore_tip(tip);
        }
        ledger.restore_transitions(&start.applied);
        let head = ledger.head();
        let max_orphans = config.sharding.max_orphans;
        let engine = ConsensusEngine::new(config.tick_interval(), clock);
        let (mining, _) = watch::channel(MiningState::Idle);
        let (shutdown, _) = watch::channel(false);

        let ctx = Arc::new(NodeContext {
            config,
            identity,
            commitment,
            store,
            transport,
            ledger: Mutex::new(ledger),
            head: ChainHead::new(head.hash, head.height),
            epoch_head: ChainHead::new(start.last_epoch.hash, start.last_epoch.height),
            engine,
            pending: Mutex::new(Pending {
                orphans: OrphanPool::new(max_orphans),
                epochs: ParkedEpochs::new(max_orphans),
            }),
            mining,
            status,
            shutdown,
        });

        if ctx.config.node.bootstrap {
            let mapping = ctx.mapping();
            ctx.transport
                .broadcast(Message::ValidatorShardMapping(mapping.encode()?))?;
        }

        let mut tasks = vec![tokio::spawn(dispatch(Arc::clone(&ctx), inbox, backlog))];
        if ctx.config.miner.enabled {
            tasks.push(tokio::spawn(BlockMiner::new(Arc::clone(&ctx)).run()));
        }
        ctx.status.send_replace(NodeState::Ready);
        info!(shard = ctx.shard_id(), height = head.height, "Node ready");

        Ok(NodeHandle { ctx, tasks })
    }
}

fn restore_chain(config: &NodeConfig, store: &dyn Store) -> Result<ChainStart> {
    let genesis = store
        .read_genesis()?
        .ok_or_else(|| ChainError::Store("genesis missing".to_string()))?;
    let last_epoch = store
        .read_last_epoch_block()?
        .ok_or_else(|| ChainError::Store("no epoch block stored".to_string()))?;
    let state = store.load_state()?;
    let tip = match store.read_chain_tip()? {
        Some(hash) => store.read_closed_block(&hash)?,
        None => None,
    };
    let mapping = mapping_for_epoch(&last_epoch, &state, config.sharding.validators_per_shard);
    let applied = store.read_applied_transitions()?;
    Ok(ChainStart {
        genesis,
        last_epoch,
        state,
        tip,
        mapping,
        applied,
    })
}

fn create_chain(
    config: &NodeConfig,
    store: &dyn Store,
    identity: &KeyPair,
    commitment: &KeyPair,
    clock: &dyn Clock,
) -> Result<ChainStart> {
    let root = identity.address();
    let genesis = Genesis::new(root, commitment.address());

    let mut root_account = Account::new(root, root, config.genesis.root_balance);
    root_account.is_staking = true;
    root_account.commitment_key = commitment.address();
    let mut state = BTreeMap::new();
    state.insert(root, root_account);
    for account in config.genesis_accounts(&root)? {
        state.insert(account.address, account);
    }

    let mut epoch = EpochBlock::new(vec![genesis.hash()], 0);
    epoch.seal(clock.now(), root, commitment.commitment_proof(0));
    epoch.state = Some(state.clone());

    let accounts: Vec<Account> = state.values().cloned().collect();
    store.write_genesis(&genesis)?;
    store.write_accounts(&accounts)?;
    store.write_closed_epoch_block(&epoch)?;
    store.write_chain_tip(&epoch.hash)?;

    let mapping = mapping_for_epoch(&epoch, &state, config.sharding.validators_per_shard);
    info!(genesis = %short_hex(&genesis.hash()), "Created genesis");
    Ok(ChainStart {
        genesis,
        last_epoch: epoch,
        state,
        tip: None,
        mapping,
        applied: BTreeMap::new(),
    })
}

async fn join_chain(
    config: &NodeConfig,
    store: &dyn Store,
    transport: &dyn Transport,
    inbox: &mut Inbox,
    backlog: &mut VecDeque<Envelope>,
) -> Result<ChainStart> {
    let timeout = config.mapping_timeout();
    let retry = config.tick_interval();

    let genesis = request_and_wait(
        transport,
        inbox,
        Message::GenesisRequest,
        timeout,
        retry,
        backlog,
        |message| match message {
            Message::Genesis(bytes) => Genesis::decode(bytes).ok(),
            _ => None,
        },
    )
    .await
    .ok_or_else(|| ChainError::SyncTimeout("no genesis received".to_string()))?;

    let (last_epoch, state) = request_and_wait(
        transport,
        inbox,
        Message::EpochBlockRequest(None),
        timeout,
        retry,
        backlog,
        |message| match message {
            Message::EpochBlock(bytes) => EpochBlock::decode(bytes)
                .ok()
                .filter(EpochBlock::is_hash_valid)
                .and_then(|epoch| epoch.state.clone().map(|state| (epoch, state))),
            _ => None,
        },
    )
    .await
    .ok_or_else(|| {
        ChainError::SyncTimeout("no epoch block with a state snapshot received".to_string())
    })?;

    let epoch_height = last_epoch.height;
    let mapping = request_and_wait(
        transport,
        inbox,
        Message::ValidatorShardMapRequest,
        timeout,
        retry,
        backlog,
        |message| match message {
            Message::ValidatorShardMapping(bytes) => ValidatorShardMapping::decode(bytes)
                .ok()
                .filter(|mapping| mapping.epoch_height == epoch_height),
            _ => None,
        },
    )
    .await
    .ok_or(ChainError::MappingTimeout(config.sharding.mapping_timeout_secs))?;

    let accounts: Vec<Account> = state.values().cloned().collect();
    store.write_genesis(&genesis)?;
    store.write_accounts(&accounts)?;
    store.write_closed_epoch_block(&last_epoch)?;
    store.write_chain_tip(&last_epoch.hash)?;
    info!(
        epoch_height,
        backlog = backlog.len(),
        "Joined chain from peers"
    );

    Ok(ChainStart {
        genesis,
        last_epoch,
        state,
        tip: None,
        mapping,
        applied: BTreeMap::new(),
    })
}

async fn dispatch(ctx: Arc<NodeContext>, mut inbox: Inbox, backlog: VecDeque<Envelope>) {
    for envelope in backlog {
        ctx.handle(envelope);
    }

    let mut shutdown = ctx.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            received = inbox.recv() => match received {
                Some(envelope) => ctx.handle(envelope),
                None => {
                    error!("Transport closed, stopping dispatcher");
                    break;
                }
            },
        }
    }
    debug!("Dispatcher stopped");
}

/// Running node. Dropping the handle leaves the tasks running; call
/// [`NodeHandle::shutdown`] to stop them.
pub struct NodeHandle {
    ctx: Arc<NodeContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn mining_state(&self) -> watch::Receiver<MiningState> {
        self.ctx.mining.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<NodeState> {
        self.ctx.status.subscribe()
    }

    pub async fn shutdown(self) {
        self.ctx.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Node task ended abnormally: {}", e);
            }
        }
        self.ctx.status.send_replace(NodeState::Stopped);
        info!("Node stopped");
    }
}
