use super::{short_hex, Block, Codec, FieldHasher, Hash, RelativeAccount};
use crate::crypto::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Account deltas caused by one regular block, broadcast to sibling shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub relative_state_change: BTreeMap<Address, RelativeAccount>,
    pub height: u32,
    pub shard_id: u32,
    /// Height of the previous regular block of the same shard, or of the
    /// epoch block it was chained to.
    pub prev_height: u32,
}

impl StateTransition {
    pub fn new(
        relative_state_change: BTreeMap<Address, RelativeAccount>,
        height: u32,
        shard_id: u32,
        prev_height: u32,
    ) -> Self {
        StateTransition {
            relative_state_change,
            height,
            shard_id,
            prev_height,
        }
    }

    pub fn hash(&self) -> Hash {
        let mut hasher =
            FieldHasher::new("state_transition").u64(self.relative_state_change.len() as u64);
        for (address, delta) in &self.relative_state_change {
            hasher = hasher
                .bytes(address)
                .i64(delta.balance)
                .i64(delta.tx_cnt as i64)
                .u8(delta.is_staking as u8)
                .bytes(&delta.commitment_key)
                .i64(delta.staking_block_height as i64);
        }
        hasher
            .u32(self.height)
            .u32(self.shard_id)
            .u32(self.prev_height)
            .finish()
    }
}

impl Codec for StateTransition {}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StateTransition {{ shard: {}, height: {} (after {}), accounts: {} }}",
            self.shard_id,
            self.height,
            self.prev_height,
            self.relative_state_change.len()
        )
    }
}

/// Hashes of the transactions a shard included in one block, so siblings can
/// purge them from their mempools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub shard_id: u32,
    pub height: u32,
    pub acc_tx_data: Vec<Hash>,
    pub funds_tx_data: Vec<Hash>,
    pub stake_tx_data: Vec<Hash>,
    pub iot_tx_data: Vec<Hash>,
}

impl TransactionPayload {
    pub fn from_block(block: &Block) -> Self {
        TransactionPayload {
            shard_id: block.shard_id,
            height: block.height,
            acc_tx_data: block.acc_tx_data.clone(),
            funds_tx_data: block.funds_tx_data.clone(),
            stake_tx_data: block.stake_tx_data.clone(),
            iot_tx_data: block.iot_tx_data.clone(),
        }
    }

    pub fn tx_hashes(&self) -> impl Iterator<Item = &Hash> {
        self.acc_tx_data
            .iter()
            .chain(self.funds_tx_data.iter())
            .chain(self.stake_tx_data.iter())
            .chain(self.iot_tx_data.iter())
    }

    pub fn hash(&self) -> Hash {
        FieldHasher::new("tx_payload")
            .u32(self.shard_id)
            .u32(self.height)
            .hashes(&self.acc_tx_data)
            .hashes(&self.funds_tx_data)
            .hashes(&self.stake_tx_data)
            .hashes(&self.iot_tx_data)
            .finish()
    }
}

impl Codec for TransactionPayload {}

impl fmt::Display for TransactionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = self.tx_hashes().next().map(|h| short_hex(h));
        write!(
            f,
            "TransactionPayload {{ shard: {}, height: {}, txs: {}, first: {} }}",
            self.shard_id,
            self.height,
            self.tx_hashes().count(),
            first.unwrap_or_else(|| "-".to_string())
        )
    }
}
