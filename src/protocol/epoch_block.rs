use super::{short_hex, Account, Codec, FieldHasher, Hash};
use crate::crypto::{Address, CommitmentProof};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::collections::BTreeMap;
use std::fmt;

/// Aggregates one head hash per shard. Index `i` of `prev_shard_hashes`
/// belongs to shard `i + 1`.
///
/// The hash covers only `header`, `prev_shard_hashes` and `height`, so every
/// node that builds the epoch block for the same shard heads arrives at the
/// same hash regardless of who stamped it.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochBlock {
    pub header: u8,
    pub hash: Hash,
    pub prev_shard_hashes: Vec<Hash>,
    pub height: u32,
    pub timestamp: i64,
    pub beneficiary: Address,
    #[serde_as(as = "Bytes")]
    pub commitment_proof: CommitmentProof,
    /// Full account state at this epoch, for nodes joining later.
    pub state: Option<BTreeMap<Address, Account>>,
}

impl EpochBlock {
    pub fn new(prev_shard_hashes: Vec<Hash>, height: u32) -> Self {
        let mut block = EpochBlock {
            header: 0,
            hash: [0u8; 32],
            prev_shard_hashes,
            height,
            timestamp: 0,
            beneficiary: [0u8; 32],
            commitment_proof: [0u8; 64],
            state: None,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn compute_hash(&self) -> Hash {
        FieldHasher::new("epoch_block")
            .u8(self.header)
            .hashes(&self.prev_shard_hashes)
            .u32(self.height)
            .finish()
    }

    pub fn is_hash_valid(&self) -> bool {
        self.hash == self.compute_hash()
    }

    pub fn seal(&mut self, timestamp: i64, beneficiary: Address, commitment_proof: CommitmentProof) {
        self.timestamp = timestamp;
        self.beneficiary = beneficiary;
        self.commitment_proof = commitment_proof;
        self.hash = self.compute_hash();
    }

    pub fn number_of_shards(&self) -> usize {
        self.prev_shard_hashes.len()
    }

    /// The same block without its state snapshot, for gossip.
    pub fn header_only(&self) -> EpochBlock {
        EpochBlock {
            state: None,
            ..self.clone()
        }
    }
}

impl Codec for EpochBlock {}

impl fmt::Display for EpochBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shards: Vec<String> = self
            .prev_shard_hashes
            .iter()
            .map(|h| short_hex(h))
            .collect();
        write!(
            f,
            "EpochBlock {{ hash: {}, height: {}, shards: [{}], snapshot: {} }}",
            short_hex(&self.hash),
            self.height,
            shards.join(", "),
            self.state.as_ref().map_or(0, |s| s.len())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_stamp_and_state() {
        let mut a = EpochBlock::new(vec![[1u8; 32], [2u8; 32]], 200);
        let b = a.clone();
        a.seal(99, [5u8; 32], [6u8; 64]);
        let mut state = BTreeMap::new();
        state.insert([1u8; 32], Account::new([1u8; 32], [1u8; 32], 10));
        a.state = Some(state);
        assert_eq!(a.compute_hash(), b.hash);
        assert!(a.is_hash_valid());
    }

    #[test]
    fn test_hash_covers_shard_order() {
        let a = EpochBlock::new(vec![[1u8; 32], [2u8; 32]], 200);
        let b = EpochBlock::new(vec![[2u8; 32], [1u8; 32]], 200);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_round_trip_with_snapshot() {
        let mut block = EpochBlock::new(vec![[1u8; 32]; 3], 300);
        let mut state = BTreeMap::new();
        for i in 1..=3u8 {
            state.insert([i; 32], Account::new([i; 32], [0u8; 32], 1000 * i as u64));
        }
        block.state = Some(state);
        let decoded = EpochBlock::decode(&block.encode().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.header_only().state.is_none());
        assert_eq!(decoded.header_only().hash, block.hash);
    }
}
