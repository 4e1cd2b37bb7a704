use super::state::{AccountState, TxRules};
use crate::protocol::{Hash, Transaction, TxKind};
use crate::shard::shard_for_address;
use std::collections::HashMap;
use tracing::debug;

/// Pending transactions, keyed by hash.
#[derive(Debug, Clone)]
pub struct Mempool {
    transactions: HashMap<Hash, Transaction>,
    max_size: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl Mempool {
    pub fn new(max_size: usize) -> Self {
        Mempool {
            transactions: HashMap::new(),
            max_size,
        }
    }

    /// Adds a transaction whose signature has already been checked. Returns
    /// false when it was known or the pool is full.
    pub fn insert(&mut self, tx: Transaction) -> bool {
        if self.transactions.len() >= self.max_size {
            debug!(max = self.max_size, "Mempool full, dropping transaction");
            return false;
        }
        let hash = tx.hash();
        if self.transactions.contains_key(&hash) {
            return false;
        }
        self.transactions.insert(hash, tx);
        true
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.transactions.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.transactions.contains_key(hash)
    }

    pub fn remove<'a>(&mut self, hashes: impl IntoIterator<Item = &'a Hash>) -> usize {
        hashes
            .into_iter()
            .filter(|hash| self.transactions.remove(*hash).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Picks up to `max` transactions of `shard_id` that apply cleanly, in
    /// application order: account creations, transfers, stake changes, data.
    /// Within a kind, transactions of one sender are ordered by counter.
    pub fn select(
        &self,
        shard_id: u32,
        number_of_shards: u32,
        max: usize,
        state: &AccountState,
        rules: &TxRules,
        height: u32,
    ) -> Vec<Transaction> {
        let mut candidates: Vec<&Transaction> = self
            .transactions
            .values()
            .filter(|tx| shard_for_address(&tx.sender(), number_of_shards) == shard_id)
            .collect();
        candidates.sort_by_key(|tx| (tx.kind(), tx.sender(), counter(tx), tx.hash()));

        let mut scratch = state.clone();
        let mut selected = Vec::new();
        for tx in candidates {
            if selected.len() >= max {
                break;
            }
            let mut attempt = scratch.clone();
            match attempt.apply_transaction(tx, rules, height) {
                Ok(_) => {
                    scratch = attempt;
                    selected.push(tx.clone());
                }
                Err(e) => debug!(tx = %hex::encode(tx.hash()), "Skipping transaction: {}", e),
            }
        }
        selected
    }
}

fn counter(tx: &Transaction) -> u32 {
    match tx {
        Transaction::Funds(tx) => tx.tx_cnt,
        Transaction::Iot(tx) => tx.tx_cnt,
        _ => 0,
    }
}

/// Splits transactions into the per-kind hash lists carried by a block.
pub fn partition_hashes(transactions: &[Transaction]) -> [Vec<Hash>; 4] {
    let mut lists: [Vec<Hash>; 4] = Default::default();
    for tx in transactions {
        let slot = match tx.kind() {
            TxKind::Acc => 0,
            TxKind::Funds => 1,
            TxKind::Stake => 2,
            TxKind::Iot => 3,
        };
        lists[slot].push(tx.hash());
    }
    lists
}
