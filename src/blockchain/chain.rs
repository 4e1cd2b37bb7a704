use super::mempool::{partition_hashes, Mempool};
use super::state::{AccountState, TxRules};
use super::validation::{
    check_epoch_block, check_linkage, check_not_committed_and_intact, check_proposer,
    resolve_transactions,
};
use crate::config::NodeConfig;
use crate::consensus::{self, Tip};
use crate::crypto::{Address, CommitmentProof};
use crate::error::{ChainError, Result};
use crate::persistence::Store;
use crate::protocol::{
    short_hex, Account, Block, EpochBlock, Genesis, StateTransition, Transaction,
    TransactionPayload, ValidatorShardMapping,
};
use crate::shard::reconcile::Offer;
use crate::shard::{
    apply_relative_state, build_epoch_block, is_epoch_boundary, mapping_for_epoch,
    relative_state, ShardHeads, TransitionSequencer,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Everything the miner needs to search for the next block.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Unsealed block carrying the selected transaction hashes.
    pub block: Block,
    pub prev_proofs: Vec<CommitmentProof>,
    pub balance: u64,
}

/// Result of committing a block of this node's shard.
#[derive(Debug, Clone)]
pub struct CommittedBlock {
    pub block: Block,
    pub transition: StateTransition,
    pub payload: TransactionPayload,
}

#[derive(Debug, Clone)]
pub enum BlockOutcome {
    Committed(CommittedBlock),
    /// A sibling shard's block, checked and recorded as that shard's head.
    Recorded,
}

#[derive(Debug, Clone)]
pub struct EpochCommit {
    pub height: u32,
    pub mapping: ValidatorShardMapping,
    pub shard_id: u32,
}

/// The node's view of the sharded chain: account replica, mempool, shard
/// heads and reconciliation progress. Guarded by a single mutex in the node.
pub struct Ledger {
    identity: Address,
    genesis: Genesis,
    state: AccountState,
    mempool: Mempool,
    heads: ShardHeads,
    sequencer: TransitionSequencer,
    mapping: ValidatorShardMapping,
    shard_id: u32,
    global_block_count: u32,
    last_epoch: EpochBlock,
}

impl Ledger {
    pub fn new(
        identity: Address,
        genesis: Genesis,
        state: BTreeMap<Address, Account>,
        last_epoch: &EpochBlock,
        mapping: ValidatorShardMapping,
        max_pending_transitions: usize,
    ) -> Self {
        let shard_id = mapping.shard_of(&identity).unwrap_or(1);
        Ledger {
            identity,
            genesis,
            state: AccountState::new(state),
            mempool: Mempool::default(),
            heads: ShardHeads::new(last_epoch.hash, last_epoch.height),
            sequencer: TransitionSequencer::new(
                shard_id,
                last_epoch.height,
                max_pending_transitions,
            ),
            mapping,
            shard_id,
            global_block_count: last_epoch.height,
            last_epoch: last_epoch.header_only(),
        }
    }

    /// Resumes from a persisted chain tip of this node's shard.
    pub fn restore_tip(&mut self, tip: &Block) {
        if tip.height > self.last_epoch.height {
            self.heads.record(tip.shard_id, tip.hash, tip.height);
            self.sequencer.record_local(tip.shard_id, tip.height);
            self.global_block_count = tip.height;
        }
    }

    /// Resumes sibling shards at their persisted applied heights.
    pub fn restore_transitions(&mut self, applied: &BTreeMap<u32, u32>) {
        for (&shard_id, &height) in applied {
            self.sequencer.restore_applied(shard_id, height);
        }
    }

    pub fn set_mapping(&mut self, mapping: ValidatorShardMapping) {
        self.shard_id = mapping.shard_of(&self.identity).unwrap_or(1);
        self.sequencer.set_own_shard(self.shard_id);
        self.mapping = mapping;
    }

    pub fn identity(&self) -> &Address {
        &self.identity
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub fn state(&self) -> &AccountState {
        &self.state
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn mapping(&self) -> &ValidatorShardMapping {
        &self.mapping
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn number_of_shards(&self) -> u32 {
        self.mapping.number_of_shards().max(1)
    }

    /// Head of this node's shard.
    pub fn head(&self) -> Tip {
        self.heads.head(self.shard_id)
    }

    pub fn shard_head(&self, shard_id: u32) -> Tip {
        self.heads.head(shard_id)
    }

    pub fn global_block_count(&self) -> u32 {
        self.global_block_count
    }

    pub fn last_epoch(&self) -> &EpochBlock {
        &self.last_epoch
    }

    pub fn last_applied_transition(&self, shard_id: u32) -> Option<u32> {
        self.sequencer.last_applied(shard_id)
    }

    pub fn rules(&self, config: &NodeConfig) -> TxRules {
        TxRules {
            root: self.genesis.root_address,
            staking_minimum: config.consensus.staking_minimum,
            block_reward: config.consensus.block_reward,
        }
    }

    /// Admits a signed transaction to the mempool. Returns whether it was new.
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<bool> {
        tx.verify_signature()?;
        Ok(self.mempool.insert(tx))
    }

    pub fn is_epoch_due(&self, epoch_length: u32) -> bool {
        is_epoch_boundary(self.global_block_count, epoch_length)
    }

    /// Assembles the next block of this shard for `self.identity`.
    pub fn prepare_block(&self, store: &dyn Store, config: &NodeConfig) -> Result<Candidate> {
        let own = self
            .state
            .get(&self.identity)
            .ok_or_else(|| ChainError::ZeroBalance(short_hex(&self.identity)))?;
        if !own.is_staking {
            return Err(ChainError::Validation(format!(
                "validator {} is not staking",
                short_hex(&self.identity)
            )));
        }

        if self.mapping.shard_of(&self.identity).is_none() {
            return Err(ChainError::Validation(format!(
                "validator {} is not assigned to a shard",
                short_hex(&self.identity)
            )));
        }

        let head = self.head();
        let height = head.height + 1;
        let rules = self.rules(config);
        let transactions = self.mempool.select(
            self.shard_id,
            self.number_of_shards(),
            config.consensus.max_block_transactions,
            &self.state,
            &rules,
            height,
        );

        let mut block = Block::new(head.hash, height, self.shard_id, self.identity);
        let [acc, funds, stake, iot] = partition_hashes(&transactions);
        block.acc_tx_data = acc;
        block.funds_tx_data = funds;
        block.stake_tx_data = stake;
        block.iot_tx_data = iot;

        let prev_proofs = consensus::latest_proofs(
            store,
            config.consensus.num_included_prev_proofs,
            &head.hash,
            self.last_epoch.height,
        )?;

        Ok(Candidate {
            block,
            prev_proofs,
            balance: own.balance,
        })
    }

    /// Validates `block` and, when it passes, commits it.
    ///
    /// Blocks of this shard are executed against the account replica and
    /// persisted with the accounts they touched. Blocks of sibling shards are
    /// checked for integrity, linkage and proposer eligibility only.
    pub fn validate_block(
        &mut self,
        block: &Block,
        store: &dyn Store,
        config: &NodeConfig,
    ) -> Result<BlockOutcome> {
        if block.shard_id != self.shard_id {
            return self.record_foreign_block(block, store, config);
        }

        let epoch_length = config.sharding.epoch_length;
        check_not_committed_and_intact(block, store)?;
        check_linkage(block, &self.head(), epoch_length)?;
        self.check_assignment(block)?;

        let transactions = resolve_transactions(block, &self.mempool, self.number_of_shards())?;
        let rules = self.rules(config);
        let after = self
            .state
            .apply_block(&transactions, &block.beneficiary, &rules, block.height)?;

        let prev_proofs = consensus::latest_proofs(
            store,
            config.consensus.num_included_prev_proofs,
            &block.prev_hash,
            self.last_epoch.height,
        )?;
        check_proposer(
            &block.beneficiary,
            block.height,
            &block.commitment_proof,
            block.timestamp,
            &prev_proofs,
            &self.state,
            config.consensus.difficulty,
        )?;

        let delta = relative_state(&self.state.accounts, &after.accounts)?;
        let touched: Vec<Account> = delta
            .keys()
            .filter_map(|address| after.get(address).cloned())
            .collect();
        store.commit_block(block, &touched, &block.hash)?;

        let prev_height = self
            .heads
            .last_regular_height(self.shard_id)
            .unwrap_or(self.last_epoch.height);
        self.state = after;
        self.heads.record(self.shard_id, block.hash, block.height);
        self.sequencer.record_local(self.shard_id, block.height);
        self.global_block_count = block.height;
        let removed = self.mempool.remove(block.tx_hashes());
        self.retry_held(store);

        info!(
            height = block.height,
            shard = self.shard_id,
            hash = %short_hex(&block.hash),
            txs = removed,
            "Committed block"
        );

        Ok(BlockOutcome::Committed(CommittedBlock {
            block: block.clone(),
            transition: StateTransition::new(delta, block.height, self.shard_id, prev_height),
            payload: TransactionPayload::from_block(block),
        }))
    }

    fn record_foreign_block(
        &mut self,
        block: &Block,
        store: &dyn Store,
        config: &NodeConfig,
    ) -> Result<BlockOutcome> {
        let number_of_shards = self.number_of_shards();
        if block.shard_id == 0 || block.shard_id > number_of_shards {
            return Err(ChainError::Validation(format!(
                "Block for shard {} but only {} shards are active",
                block.shard_id, number_of_shards
            )));
        }
        check_not_committed_and_intact(block, store)?;
        check_linkage(block, &self.heads.head(block.shard_id), config.sharding.epoch_length)?;
        self.check_assignment(block)?;
        let prev_proofs = consensus::latest_proofs(
            store,
            config.consensus.num_included_prev_proofs,
            &block.prev_hash,
            self.last_epoch.height,
        )?;
        check_proposer(
            &block.beneficiary,
            block.height,
            &block.commitment_proof,
            block.timestamp,
            &prev_proofs,
            &self.state,
            config.consensus.difficulty,
        )?;

        store.write_closed_block(block)?;
        self.heads.record(block.shard_id, block.hash, block.height);
        debug!(
            height = block.height,
            shard = block.shard_id,
            hash = %short_hex(&block.hash),
            "Recorded sibling shard block"
        );
        Ok(BlockOutcome::Recorded)
    }

    fn check_assignment(&self, block: &Block) -> Result<()> {
        match self.mapping.shard_of(&block.beneficiary) {
            Some(shard_id) if shard_id == block.shard_id => Ok(()),
            Some(shard_id) => Err(ChainError::Validation(format!(
                "Proposer {} belongs to shard {}, block is for shard {}",
                short_hex(&block.beneficiary),
                shard_id,
                block.shard_id
            ))),
            None => Err(ChainError::Validation(format!(
                "Proposer {} is not assigned to a shard",
                short_hex(&block.beneficiary)
            ))),
        }
    }

    /// The epoch block due next, once every shard has reached the boundary.
    pub fn epoch_candidate(&self, config: &NodeConfig) -> Option<EpochBlock> {
        let epoch_length = config.sharding.epoch_length;
        let height = self.last_epoch.height.checked_add(epoch_length)?;
        let number_of_shards = self.number_of_shards();
        if !self.heads.all_reached(number_of_shards, height - 1) {
            return None;
        }
        let mut epoch = build_epoch_block(self.heads.collect(number_of_shards), height);
        if config.sharding.state_snapshot {
            epoch.state = Some(self.state.accounts.clone());
        }
        Some(epoch)
    }

    /// Validates and commits an epoch block. Returns `None` for an epoch
    /// block that is already committed.
    pub fn commit_epoch_block(
        &mut self,
        epoch: &EpochBlock,
        store: &dyn Store,
        config: &NodeConfig,
    ) -> Result<Option<EpochCommit>> {
        if epoch.height <= self.last_epoch.height
            || store.read_closed_epoch_block(&epoch.hash)?.is_some()
        {
            return Ok(None);
        }
        check_epoch_block(
            epoch,
            self.last_epoch.height,
            config.sharding.epoch_length,
            self.number_of_shards(),
            self.shard_id,
            &self.head().hash,
        )?;
        check_proposer(
            &epoch.beneficiary,
            epoch.height,
            &epoch.commitment_proof,
            epoch.timestamp,
            &[],
            &self.state,
            config.consensus.difficulty,
        )?;

        store.write_closed_epoch_block(epoch)?;
        store.write_chain_tip(&epoch.hash)?;
        self.heads.reset_to_epoch(epoch.hash, epoch.height);
        self.global_block_count = epoch.height;
        self.last_epoch = epoch.header_only();

        let released = self.sequencer.advance_floor(epoch.height);
        self.apply_in_order(released, store);

        let mapping = mapping_for_epoch(
            epoch,
            &self.state.accounts,
            config.sharding.validators_per_shard,
        );
        if !mapping.mapping.is_empty() {
            self.set_mapping(mapping);
        }

        info!(
            height = epoch.height,
            hash = %short_hex(&epoch.hash),
            shards = self.number_of_shards(),
            shard = self.shard_id,
            "Committed epoch block"
        );
        Ok(Some(EpochCommit {
            height: epoch.height,
            mapping: self.mapping.clone(),
            shard_id: self.shard_id,
        }))
    }

    /// Feeds a sibling shard's transition through the sequencer and applies
    /// whatever became due. Returns how many transitions were applied.
    pub fn apply_state_transition(
        &mut self,
        transition: StateTransition,
        store: &dyn Store,
    ) -> Result<usize> {
        let shard_id = transition.shard_id;
        let height = transition.height;
        match self.sequencer.offer(transition)? {
            Offer::Ready(ready) => Ok(self.apply_in_order(ready, store)),
            Offer::Buffered => Ok(0),
            Offer::Stale => {
                debug!(shard_id, height, "Ignoring stale state transition");
                Ok(0)
            }
            Offer::Ignored => Ok(0),
        }
    }

    /// Number of released transitions the replica has not absorbed yet.
    pub fn held_transitions(&self) -> usize {
        self.sequencer.held_len()
    }

    fn apply_in_order(&mut self, ready: Vec<StateTransition>, store: &dyn Store) -> usize {
        let mut applied = 0;
        for transition in ready {
            if self.sequencer.is_held(transition.shard_id) {
                self.sequencer.hold(transition);
                continue;
            }
            match self.apply_ready_transition(&transition, store) {
                Ok(()) => applied += 1,
                Err(e) => {
                    debug!(
                        shard = transition.shard_id,
                        height = transition.height,
                        "State transition not applicable yet: {}",
                        e
                    );
                    self.sequencer.hold(transition);
                }
            }
        }
        if applied > 0 {
            applied += self.retry_held(store);
        }
        applied
    }

    /// Retries held transitions until none of them makes progress.
    fn retry_held(&mut self, store: &dyn Store) -> usize {
        let mut applied = 0;
        loop {
            let before = applied;
            for shard_id in self.sequencer.held_shards() {
                while let Some(next) = self.sequencer.next_held(shard_id).cloned() {
                    if self.apply_ready_transition(&next, store).is_err() {
                        break;
                    }
                    self.sequencer.release_held(shard_id);
                    applied += 1;
                }
            }
            if applied == before {
                return applied;
            }
        }
    }

    /// Applies one transition to the replica and persists it. On error the
    /// replica is unchanged.
    fn apply_ready_transition(
        &mut self,
        transition: &StateTransition,
        store: &dyn Store,
    ) -> Result<()> {
        let touched = apply_relative_state(
            &mut self.state.accounts,
            &transition.relative_state_change,
        )?;
        self.sequencer.mark_applied(transition);

        let accounts: Vec<Account> = touched
            .iter()
            .filter_map(|address| self.state.get(address).cloned())
            .collect();
        if let Err(e) = store.commit_transition(&accounts, transition.shard_id, transition.height) {
            warn!(
                shard = transition.shard_id,
                height = transition.height,
                "Failed to persist state transition: {}",
                e
            );
        }
        debug!(
            shard = transition.shard_id,
            height = transition.height,
            accounts = transition.relative_state_change.len(),
            "Applied state transition"
        );
        Ok(())
    }

    /// Drops transactions a sibling shard already included.
    pub fn purge_payload(&mut self, payload: &TransactionPayload) -> usize {
        if payload.shard_id == self.shard_id {
            return 0;
        }
        self.mempool.remove(payload.tx_hashes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::persistence::InMemoryStore;
    use crate::protocol::{FundsTx, RelativeAccount};

    struct Fixture {
        ledger: Ledger,
        store: InMemoryStore,
        config: NodeConfig,
        validator: KeyPair,
        commitment: KeyPair,
    }

    fn fixture() -> Fixture {
        let validator = KeyPair::from_secret_bytes(&[1u8; 32]).unwrap();
        let commitment = KeyPair::from_secret_bytes(&[2u8; 32]).unwrap();
        let mut root = Account::new(validator.address(), validator.address(), 10_000);
        root.is_staking = true;
        root.commitment_key = commitment.address();

        let mut state = BTreeMap::new();
        state.insert(root.address, root);
        let genesis = Genesis::new(validator.address(), commitment.address());
        let epoch = EpochBlock::new(vec![genesis.hash()], 0);
        let mut mapping = ValidatorShardMapping::new(0);
        mapping.mapping.insert(validator.address(), 1);

        let mut config = NodeConfig::default();
        config.consensus.difficulty = 0;
        config.sharding.epoch_length = 4;

        Fixture {
            ledger: Ledger::new(validator.address(), genesis, state, &epoch, mapping, 16),
            store: InMemoryStore::new(),
            config,
            validator,
            commitment,
        }
    }

    fn mine(f: &mut Fixture) -> CommittedBlock {
        let candidate = f.ledger.prepare_block(&f.store, &f.config).unwrap();
        let mut block = candidate.block;
        let proof = f.commitment.commitment_proof(block.height);
        block.seal(1_700_000_000 + block.height as i64, proof);
        match f.ledger.validate_block(&block, &f.store, &f.config).unwrap() {
            BlockOutcome::Committed(committed) => committed,
            BlockOutcome::Recorded => panic!("own block recorded as foreign"),
        }
    }

    #[test]
    fn test_commit_pays_reward_and_links_transitions() {
        let mut f = fixture();
        let first = mine(&mut f);
        assert_eq!(first.transition.prev_height, 0);
        assert_eq!(first.transition.height, 1);
        assert_eq!(f.ledger.state().balance(&f.validator.address()), 10_050);
        assert_eq!(f.store.read_chain_tip().unwrap(), Some(first.block.hash));

        let second = mine(&mut f);
        assert_eq!(second.transition.prev_height, 1);
        assert_eq!(f.ledger.global_block_count(), 2);
    }

    #[test]
    fn test_block_includes_mempool_transactions() {
        let mut f = fixture();
        let bob = KeyPair::from_secret_bytes(&[3u8; 32]).unwrap();
        f.ledger
            .state
            .insert(Account::new(bob.address(), f.validator.address(), 0));
        let tx = Transaction::Funds(FundsTx::new(0, 100, 2, 0, &f.validator, bob.address()));
        assert!(f.ledger.add_transaction(tx.clone()).unwrap());

        let committed = mine(&mut f);
        assert_eq!(committed.block.funds_tx_data, vec![tx.hash()]);
        assert!(f.ledger.mempool().is_empty());
        assert_eq!(f.ledger.state().balance(&bob.address()), 100);
        assert_eq!(committed.payload.funds_tx_data, vec![tx.hash()]);
        assert_eq!(committed.transition.relative_state_change.len(), 2);
    }

    #[test]
    fn test_rejected_block_leaves_ledger_untouched() {
        let mut f = fixture();
        let candidate = f.ledger.prepare_block(&f.store, &f.config).unwrap();
        let mut block = candidate.block;
        block.seal(1, [0u8; 64]);
        let before = f.ledger.state().clone();
        let err = f.ledger.validate_block(&block, &f.store, &f.config).unwrap_err();
        assert!(err.to_string().contains("Commitment proof"));
        assert_eq!(f.ledger.state(), &before);
        assert_eq!(f.ledger.global_block_count(), 0);
    }

    #[test]
    fn test_epoch_cycle() {
        let mut f = fixture();
        for _ in 0..3 {
            mine(&mut f);
        }
        assert!(f.ledger.is_epoch_due(4));
        let mut epoch = f.ledger.epoch_candidate(&f.config).unwrap();
        assert_eq!(epoch.height, 4);
        assert_eq!(epoch.prev_shard_hashes, vec![f.ledger.head().hash]);
        epoch.seal(99, f.validator.address(), f.commitment.commitment_proof(4));

        let commit = f
            .ledger
            .commit_epoch_block(&epoch, &f.store, &f.config)
            .unwrap()
            .unwrap();
        assert_eq!(commit.height, 4);
        assert_eq!(commit.shard_id, 1);
        assert_eq!(f.ledger.head().hash, epoch.hash);
        assert!(f
            .ledger
            .commit_epoch_block(&epoch, &f.store, &f.config)
            .unwrap()
            .is_none());

        let next = mine(&mut f);
        assert_eq!(next.block.prev_hash, epoch.hash);
        assert_eq!(next.block.height, 5);
        assert_eq!(next.transition.prev_height, 3);
    }

    fn delta_for(address: Address, balance: i64) -> BTreeMap<Address, RelativeAccount> {
        let mut change = BTreeMap::new();
        change.insert(
            address,
            RelativeAccount {
                address,
                issuer: [0u8; 32],
                balance,
                tx_cnt: 0,
                is_staking: false,
                commitment_key: [0u8; 32],
                staking_block_height: 0,
                contract: Vec::new(),
                contract_variables: Vec::new(),
            },
        );
        change
    }

    #[test]
    fn test_sibling_transition_applied_in_order() {
        let mut f = fixture();
        let stranger = [7u8; 32];

        let second = StateTransition::new(delta_for(stranger, -5), 2, 2, 1);
        let first = StateTransition::new(delta_for(stranger, 20), 1, 2, 0);
        assert_eq!(f.ledger.apply_state_transition(second, &f.store).unwrap(), 0);
        assert_eq!(f.ledger.apply_state_transition(first, &f.store).unwrap(), 2);
        assert_eq!(f.ledger.state().balance(&stranger), 15);
        assert_eq!(f.store.read_account(&stranger).unwrap().unwrap().balance, 15);
        assert_eq!(f.ledger.last_applied_transition(2), Some(2));
    }

    #[test]
    fn test_debit_waits_for_credit_from_another_shard() {
        let mut f = fixture();
        let stranger = [7u8; 32];
        let seed = StateTransition::new(delta_for(stranger, 20), 1, 3, 0);
        assert_eq!(f.ledger.apply_state_transition(seed, &f.store).unwrap(), 1);

        let spend = StateTransition::new(delta_for(stranger, -80), 1, 2, 0);
        assert_eq!(f.ledger.apply_state_transition(spend.clone(), &f.store).unwrap(), 0);
        assert_eq!(f.ledger.last_applied_transition(2), None);
        assert_eq!(f.ledger.state().balance(&stranger), 20);

        let follow_up = StateTransition::new(delta_for(stranger, 1), 2, 2, 1);
        assert_eq!(f.ledger.apply_state_transition(follow_up, &f.store).unwrap(), 0);
        assert_eq!(f.ledger.held_transitions(), 2);

        let credit = StateTransition::new(delta_for(stranger, 100), 2, 3, 1);
        assert_eq!(f.ledger.apply_state_transition(credit, &f.store).unwrap(), 3);
        assert_eq!(f.ledger.held_transitions(), 0);
        assert_eq!(f.ledger.state().balance(&stranger), 41);
        assert_eq!(f.ledger.last_applied_transition(2), Some(2));

        assert_eq!(f.ledger.apply_state_transition(spend, &f.store).unwrap(), 0);
        assert_eq!(f.ledger.state().balance(&stranger), 41);
        assert_eq!(f.store.read_account(&stranger).unwrap().unwrap().balance, 41);
        let applied = f.store.read_applied_transitions().unwrap();
        assert_eq!(applied.get(&2), Some(&2));
        assert_eq!(applied.get(&3), Some(&2));
    }
}
