//! Integration tests for validators talking to each other: competing
//! proposers, cross-shard reconciliation and node startup over the local
//! network.

use epochchain::blockchain::{BlockOutcome, CommittedBlock, Ledger};
use epochchain::config::NodeConfig;
use epochchain::consensus::SteppingClock;
use epochchain::crypto::KeyPair;
use epochchain::error::{ChainError, Result};
use epochchain::network::{LocalNetwork, Message, PeerId, Transport};
use epochchain::node::{Node, NodeHandle, NodeState};
use epochchain::persistence::{InMemoryStore, Store};
use epochchain::protocol::{
    Account, Codec, EpochBlock, Genesis, RelativeAccount, StateTransition, ValidatorShardMapping,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn key(seed: u8) -> KeyPair {
    KeyPair::from_secret_bytes(&[seed; 32]).unwrap()
}

fn staking_account(identity: &KeyPair, commitment: &KeyPair, issuer: &KeyPair) -> Account {
    let mut account = Account::new(identity.address(), issuer.address(), 10_000);
    account.is_staking = true;
    account.commitment_key = commitment.address();
    account
}

fn test_config(bootstrap: bool) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.bootstrap = bootstrap;
    config.consensus.difficulty = 0;
    config.consensus.tick_interval_ms = 10;
    config.consensus.zero_balance_backoff_ms = 50;
    config.sharding.epoch_length = 4;
    config.sharding.mapping_timeout_secs = 2;
    config
}

struct Validator {
    identity: KeyPair,
    commitment: KeyPair,
    ledger: Ledger,
    store: InMemoryStore,
}

impl Validator {
    fn mine(&mut self, config: &NodeConfig) -> CommittedBlock {
        let candidate = self.ledger.prepare_block(&self.store, config).unwrap();
        let mut block = candidate.block;
        let proof = self.commitment.commitment_proof(block.height);
        block.seal(1_700_000_000 + block.height as i64, proof);
        match self.ledger.validate_block(&block, &self.store, config).unwrap() {
            BlockOutcome::Committed(committed) => committed,
            BlockOutcome::Recorded => panic!("own block recorded as a sibling block"),
        }
    }
}

/// Two staking validators sharing one genesis; `shard_of_b` places the
/// second one in the same or a different shard.
fn validator_pair(shard_of_b: u32) -> (Validator, Validator) {
    let (a_id, a_commit) = (key(1), key(2));
    let (b_id, b_commit) = (key(3), key(4));

    let mut state = BTreeMap::new();
    state.insert(a_id.address(), staking_account(&a_id, &a_commit, &a_id));
    state.insert(b_id.address(), staking_account(&b_id, &b_commit, &a_id));
    let genesis = Genesis::new(a_id.address(), a_commit.address());
    let epoch = EpochBlock::new(vec![genesis.hash()], 0);
    let mut mapping = ValidatorShardMapping::new(0);
    mapping.mapping.insert(a_id.address(), 1);
    mapping.mapping.insert(b_id.address(), shard_of_b);

    let build = |identity: KeyPair, commitment: KeyPair| Validator {
        ledger: Ledger::new(
            identity.address(),
            genesis.clone(),
            state.clone(),
            &epoch,
            mapping.clone(),
            16,
        ),
        identity,
        commitment,
        store: InMemoryStore::new(),
    };
    (build(a_id, a_commit), build(b_id, b_commit))
}

#[test]
fn test_competing_proposers_keep_their_own_head() {
    let config = test_config(false);
    let (mut a, mut b) = validator_pair(1);

    let a1 = a.mine(&config).block;
    let b1 = b.mine(&config).block;
    assert_eq!(a1.height, 1);
    assert_eq!(b1.height, 1);
    assert_eq!(a1.prev_hash, b1.prev_hash);
    assert_ne!(a1.hash, b1.hash);

    let err = a.ledger.validate_block(&b1, &a.store, &config).unwrap_err();
    assert!(matches!(err, ChainError::Validation(_)));
    assert_eq!(a.ledger.head().hash, a1.hash);

    let err = b.ledger.validate_block(&a1, &b.store, &config).unwrap_err();
    assert!(matches!(err, ChainError::Validation(_)));
    assert_eq!(b.ledger.head().hash, b1.hash);

    // Each node keeps extending its own branch.
    let a2 = a.mine(&config).block;
    assert_eq!(a2.prev_hash, a1.hash);
}

#[test]
fn test_proposer_outside_its_shard_is_rejected() {
    let config = test_config(false);
    let (mut a, mut b) = validator_pair(2);

    let mut forged = a.mine(&config).block;
    forged.shard_id = 2;
    forged.seal(forged.timestamp, forged.commitment_proof);

    let err = b.ledger.validate_block(&forged, &b.store, &config).unwrap_err();
    assert!(err.to_string().contains("belongs to shard 1"));
    assert_eq!(b.ledger.head().height, 0);
    b.mine(&config);
}

#[test]
fn test_two_shards_reconcile_and_agree_on_epoch() {
    let mut config = test_config(false);
    config.sharding.validators_per_shard = 1;
    let (mut a, mut b) = validator_pair(2);
    let (a_addr, b_addr) = (a.identity.address(), b.identity.address());

    let mut from_a = Vec::new();
    let mut from_b = Vec::new();
    for _ in 0..3 {
        let mined_a = a.mine(&config);
        let mined_b = b.mine(&config);

        assert!(matches!(
            b.ledger.validate_block(&mined_a.block, &b.store, &config).unwrap(),
            BlockOutcome::Recorded
        ));
        assert!(matches!(
            a.ledger.validate_block(&mined_b.block, &a.store, &config).unwrap(),
            BlockOutcome::Recorded
        ));
        assert_eq!(b.ledger.shard_head(1).hash, mined_a.block.hash);
        assert_eq!(a.ledger.shard_head(2).hash, mined_b.block.hash);
        from_a.push(mined_a.transition);
        from_b.push(mined_b.transition);
    }
    assert_eq!(a.ledger.state().balance(&a_addr), 10_150);
    assert_eq!(b.ledger.state().balance(&a_addr), 10_000);

    // Shard 1 arrives in reverse; shard 2 in order.
    from_a.reverse();
    let applied: Vec<usize> = from_a
        .into_iter()
        .map(|t| b.ledger.apply_state_transition(t, &b.store).unwrap())
        .collect();
    assert_eq!(applied, vec![0, 0, 3]);
    for transition in from_b {
        assert_eq!(a.ledger.apply_state_transition(transition, &a.store).unwrap(), 1);
    }
    assert_eq!(a.ledger.state(), b.ledger.state());
    assert_eq!(b.ledger.state().balance(&a_addr), 10_150);
    assert_eq!(a.ledger.state().balance(&b_addr), 10_150);

    assert!(a.ledger.is_epoch_due(config.sharding.epoch_length));
    let mut epoch = a.ledger.epoch_candidate(&config).unwrap();
    let from_b_view = b.ledger.epoch_candidate(&config).unwrap();
    assert_eq!(epoch.hash, from_b_view.hash);
    assert_eq!(epoch.number_of_shards(), 2);
    epoch.seal(1_700_000_100, a_addr, a.commitment.commitment_proof(epoch.height));

    let commit_a = a
        .ledger
        .commit_epoch_block(&epoch, &a.store, &config)
        .unwrap()
        .unwrap();
    let commit_b = b
        .ledger
        .commit_epoch_block(&epoch, &b.store, &config)
        .unwrap()
        .unwrap();
    assert_eq!(commit_a.mapping, commit_b.mapping);
    assert_eq!(commit_a.mapping.epoch_height, 4);
    assert_ne!(commit_a.shard_id, commit_b.shard_id);
    assert_eq!(a.ledger.head().hash, epoch.hash);
    assert_eq!(b.ledger.head().hash, epoch.hash);

    let next = b.mine(&config).block;
    assert_eq!(next.height, 5);
    assert_eq!(next.prev_hash, epoch.hash);
}

async fn start_node(
    network: &Arc<LocalNetwork>,
    config: NodeConfig,
    store: Arc<InMemoryStore>,
    identity: KeyPair,
    commitment: KeyPair,
) -> Result<NodeHandle> {
    let (transport, inbox) = network.join(PeerId(identity.address()));
    Node::new(config, store, transport, inbox)
        .with_clock(Arc::new(SteppingClock::new(1_700_000_000, 1)))
        .start(identity, commitment)
        .await
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = timeout(Duration::from_secs(60), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_node_mines_through_epoch() {
    let network = LocalNetwork::new();
    let store = Arc::new(InMemoryStore::new());
    let identity = key(1);
    let address = identity.address();

    let handle = start_node(&network, test_config(true), store.clone(), identity, key(2))
        .await
        .unwrap();
    assert_eq!(*handle.status().borrow(), NodeState::Ready);
    let ctx = Arc::clone(handle.context());
    wait_until("height 6", || ctx.head().height >= 6).await;

    let epoch = store.read_last_epoch_block().unwrap().unwrap();
    assert!(epoch.height >= 4 && epoch.height % 4 == 0);
    assert!(epoch.state.is_some());
    assert_eq!(ctx.epoch_head().height, epoch.height);
    assert!(ctx.balance(&address) > 1_000_000);
    assert_eq!(ctx.shard_id(), 1);
    assert!(store.read_genesis().unwrap().is_some());

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_from_store() {
    let network = LocalNetwork::new();
    let store = Arc::new(InMemoryStore::new());

    let handle = start_node(&network, test_config(true), store.clone(), key(1), key(2))
        .await
        .unwrap();
    let ctx = Arc::clone(handle.context());
    wait_until("height 2", || ctx.head().height >= 2).await;
    handle.shutdown().await;
    let tip = ctx.head();
    let balance = ctx.balance(&key(1).address());

    let mut config = test_config(true);
    config.miner.enabled = false;
    let restarted = start_node(&network, config, store, key(1), key(2))
        .await
        .unwrap();
    let resumed = restarted.context();
    assert_eq!(resumed.head(), tip);
    assert_eq!(resumed.balance(&key(1).address()), balance);
    restarted.shutdown().await;
}

fn credit(address: [u8; 32], amount: i64, height: u32, shard_id: u32) -> StateTransition {
    let mut change = BTreeMap::new();
    change.insert(
        address,
        RelativeAccount {
            address,
            issuer: key(1).address(),
            balance: amount,
            tx_cnt: 0,
            is_staking: false,
            commitment_key: [0u8; 32],
            staking_block_height: 0,
            contract: Vec::new(),
            contract_variables: Vec::new(),
        },
    );
    StateTransition::new(change, height, shard_id, height - 1)
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_sibling_transitions() {
    let network = LocalNetwork::new();
    let store = Arc::new(InMemoryStore::new());
    let (sibling, _sibling_inbox) = network.join(PeerId(key(9).address()));
    let stranger = [0x42u8; 32];
    let mut config = test_config(true);
    config.miner.enabled = false;

    let handle = start_node(&network, config.clone(), store.clone(), key(1), key(2))
        .await
        .unwrap();
    let ctx = Arc::clone(handle.context());
    sibling
        .broadcast(Message::StateTransition(credit(stranger, 30, 1, 2).encode().unwrap()))
        .unwrap();
    wait_until("first credit", || ctx.balance(&stranger) == 30).await;
    handle.shutdown().await;
    assert_eq!(store.read_applied_transitions().unwrap().get(&2), Some(&1));

    let restarted = start_node(&network, config, store.clone(), key(1), key(2))
        .await
        .unwrap();
    let resumed = Arc::clone(restarted.context());
    assert_eq!(resumed.balance(&stranger), 30);
    sibling
        .broadcast(Message::StateTransition(credit(stranger, 12, 2, 2).encode().unwrap()))
        .unwrap();
    wait_until("credit after restart", || resumed.balance(&stranger) == 42).await;
    assert_eq!(store.read_applied_transitions().unwrap().get(&2), Some(&2));
    restarted.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_follower_tracks_bootstrap_chain() {
    let network = LocalNetwork::new();
    let bootstrap_store = Arc::new(InMemoryStore::new());
    let follower_store = Arc::new(InMemoryStore::new());

    let mut follower_config = test_config(false);
    follower_config.miner.enabled = false;
    let (transport, inbox) = network.join(PeerId(key(3).address()));
    let follower = tokio::spawn(
        Node::new(follower_config, follower_store.clone(), transport, inbox).start(key(3), key(4)),
    );

    let bootstrap = start_node(
        &network,
        test_config(true),
        bootstrap_store.clone(),
        key(1),
        key(2),
    )
    .await
    .unwrap();
    let follower = follower.await.unwrap().unwrap();
    let ctx = Arc::clone(follower.context());
    wait_until("follower height 6", || ctx.head().height >= 6).await;

    let tip = ctx.head();
    assert!(
        bootstrap_store.contains_block(&tip.hash).unwrap()
            || bootstrap_store.read_closed_epoch_block(&tip.hash).unwrap().is_some()
    );
    assert!(ctx.epoch_head().height >= 4);
    assert_eq!(ctx.shard_id(), 1);
    assert_eq!(
        follower_store.read_genesis().unwrap(),
        bootstrap_store.read_genesis().unwrap()
    );

    follower.shutdown().await;
    bootstrap.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_joiner_without_peers_times_out() {
    let network = LocalNetwork::new();
    let result = start_node(
        &network,
        test_config(false),
        Arc::new(InMemoryStore::new()),
        key(5),
        key(6),
    )
    .await;
    assert!(matches!(result, Err(ChainError::SyncTimeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_missing_mapping_fails_startup() {
    let network = LocalNetwork::new();
    let (root, commitment) = (key(1), key(2));
    let genesis = Genesis::new(root.address(), commitment.address());
    let mut epoch = EpochBlock::new(vec![genesis.hash()], 0);
    epoch.seal(1, root.address(), commitment.commitment_proof(0));
    let mut state = BTreeMap::new();
    state.insert(root.address(), staking_account(&root, &commitment, &root));
    epoch.state = Some(state);

    // Answers everything a joiner asks for except the shard mapping.
    let genesis_bytes = genesis.encode().unwrap();
    let epoch_bytes = epoch.encode().unwrap();
    let (peer, mut peer_inbox) = network.join(PeerId([0x99; 32]));
    tokio::spawn(async move {
        while let Some(envelope) = peer_inbox.recv().await {
            let reply = match envelope.message {
                Message::GenesisRequest => Message::Genesis(genesis_bytes.clone()),
                Message::EpochBlockRequest(_) => Message::EpochBlock(epoch_bytes.clone()),
                _ => continue,
            };
            let _ = peer.send(&envelope.from, reply);
        }
    });

    let store = Arc::new(InMemoryStore::new());
    let result = start_node(&network, test_config(false), store.clone(), key(5), key(6)).await;
    assert!(matches!(result, Err(ChainError::MappingTimeout(2))));
    assert!(store.read_genesis().unwrap().is_none());
}
