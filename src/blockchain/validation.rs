//! Block and epoch block checks. Each check either passes or names what
//! failed; none of them mutates anything.

use super::mempool::Mempool;
use super::state::AccountState;
use crate::consensus::{self, Tip};
use crate::crypto;
use crate::error::{ChainError, Result};
use crate::persistence::Store;
use crate::protocol::{short_hex, Block, EpochBlock, Hash, Transaction, TxKind};
use crate::shard::{is_epoch_height, shard_for_address};

fn invalid(message: String) -> ChainError {
    ChainError::Validation(message)
}

/// (a) not yet committed and internally consistent.
pub fn check_not_committed_and_intact(block: &Block, store: &dyn Store) -> Result<()> {
    if store.contains_block(&block.hash)? {
        return Err(invalid(format!(
            "Block {} is already committed",
            short_hex(&block.hash)
        )));
    }
    block.check_integrity()
}

/// (b) extends `head` by exactly one and does not sit on an epoch height.
pub fn check_linkage(block: &Block, head: &Tip, epoch_length: u32) -> Result<()> {
    if block.prev_hash != head.hash {
        return Err(invalid(format!(
            "Block {} builds on {}, but the shard {} head is {}",
            short_hex(&block.hash),
            short_hex(&block.prev_hash),
            block.shard_id,
            short_hex(&head.hash)
        )));
    }
    if block.height != head.height + 1 {
        return Err(invalid(format!(
            "Block height {} does not follow head height {}",
            block.height, head.height
        )));
    }
    if is_epoch_height(block.height, epoch_length) {
        return Err(invalid(format!(
            "Height {} is reserved for an epoch block",
            block.height
        )));
    }
    Ok(())
}

/// (c) every referenced transaction is known, of the listed kind, belongs to
/// the block's shard and carries a valid signature. Returns them in
/// application order.
pub fn resolve_transactions(
    block: &Block,
    mempool: &Mempool,
    number_of_shards: u32,
) -> Result<Vec<Transaction>> {
    let lists = [
        (TxKind::Acc, &block.acc_tx_data),
        (TxKind::Funds, &block.funds_tx_data),
        (TxKind::Stake, &block.stake_tx_data),
        (TxKind::Iot, &block.iot_tx_data),
    ];

    let mut resolved = Vec::with_capacity(block.tx_count());
    for (kind, hashes) in lists {
        for hash in hashes {
            let tx = mempool.get(hash).ok_or_else(|| {
                invalid(format!("Unknown {:?} transaction {}", kind, short_hex(hash)))
            })?;
            if tx.kind() != kind {
                return Err(invalid(format!(
                    "Transaction {} listed as {:?} but is {:?}",
                    short_hex(hash),
                    kind,
                    tx.kind()
                )));
            }
            let shard = shard_for_address(&tx.sender(), number_of_shards);
            if shard != block.shard_id {
                return Err(invalid(format!(
                    "Transaction {} belongs to shard {}, not {}",
                    short_hex(hash),
                    shard,
                    block.shard_id
                )));
            }
            tx.verify_signature()
                .map_err(|e| invalid(format!("Transaction {}: {}", short_hex(hash), e)))?;
            resolved.push(tx.clone());
        }
    }
    Ok(resolved)
}

/// (d) the proposer is staking, its commitment proof is valid for the
/// height, and the proof-of-stake holds for its balance.
pub fn check_proposer(
    beneficiary: &crypto::Address,
    height: u32,
    commitment_proof: &crypto::CommitmentProof,
    timestamp: i64,
    prev_proofs: &[crypto::CommitmentProof],
    state: &AccountState,
    difficulty: u8,
) -> Result<()> {
    let proposer = state.get(beneficiary).ok_or_else(|| {
        invalid(format!("Proposer {} has no account", short_hex(beneficiary)))
    })?;
    if !proposer.is_staking {
        return Err(invalid(format!(
            "Proposer {} is not staking",
            short_hex(beneficiary)
        )));
    }
    crypto::verify_commitment_proof(&proposer.commitment_key, height, commitment_proof)
        .map_err(|e| invalid(format!("Commitment proof rejected: {}", e)))?;
    if !consensus::verify_proof_of_stake(
        difficulty,
        prev_proofs,
        height,
        proposer.balance,
        commitment_proof,
        timestamp,
    ) {
        return Err(invalid(format!(
            "Proof of stake does not hold for height {} at timestamp {}",
            height, timestamp
        )));
    }
    Ok(())
}

/// Structural checks of an epoch block against the local view: the expected
/// height, a matching hash, one entry per shard and our own shard head.
pub fn check_epoch_block(
    epoch: &EpochBlock,
    last_epoch_height: u32,
    epoch_length: u32,
    number_of_shards: u32,
    own_shard: u32,
    own_head: &Hash,
) -> Result<()> {
    let expected = last_epoch_height as u64 + epoch_length as u64;
    if epoch.height as u64 != expected || !is_epoch_height(epoch.height, epoch_length) {
        return Err(invalid(format!(
            "Epoch block height {} where {} was expected",
            epoch.height, expected
        )));
    }
    if !epoch.is_hash_valid() {
        return Err(invalid(format!(
            "Epoch block hash {} does not match its content",
            short_hex(&epoch.hash)
        )));
    }
    if epoch.number_of_shards() != number_of_shards.max(1) as usize {
        return Err(invalid(format!(
            "Epoch block lists {} shards, {} are active",
            epoch.number_of_shards(),
            number_of_shards
        )));
    }
    let own_entry = epoch
        .prev_shard_hashes
        .get(own_shard.saturating_sub(1) as usize)
        .ok_or_else(|| invalid(format!("Epoch block has no entry for shard {}", own_shard)))?;
    if own_entry != own_head {
        return Err(invalid(format!(
            "Epoch block records {} for shard {}, local head is {}",
            short_hex(own_entry),
            own_shard,
            short_hex(own_head)
        )));
    }
    Ok(())
}
