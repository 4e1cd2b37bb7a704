use super::{merkle_root, short_hex, Codec, FieldHasher, Hash, ZERO_HASH};
use crate::crypto::{Address, CommitmentProof};
use crate::error::{ChainError, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::fmt;

/// A regular shard block. Transactions are referenced by hash and resolved
/// from the mempool when the block is validated.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: u8,
    pub hash: Hash,
    pub prev_hash: Hash,
    pub height: u32,
    pub shard_id: u32,
    pub timestamp: i64,
    pub beneficiary: Address,
    #[serde_as(as = "Bytes")]
    pub commitment_proof: CommitmentProof,
    pub merkle_root: Hash,
    pub acc_tx_data: Vec<Hash>,
    pub funds_tx_data: Vec<Hash>,
    pub stake_tx_data: Vec<Hash>,
    pub iot_tx_data: Vec<Hash>,
}

impl Block {
    /// An unsealed block on top of `prev_hash`.
    pub fn new(prev_hash: Hash, height: u32, shard_id: u32, beneficiary: Address) -> Self {
        Block {
            header: 0,
            hash: ZERO_HASH,
            prev_hash,
            height,
            shard_id,
            timestamp: 0,
            beneficiary,
            commitment_proof: [0u8; 64],
            merkle_root: ZERO_HASH,
            acc_tx_data: Vec::new(),
            funds_tx_data: Vec::new(),
            stake_tx_data: Vec::new(),
            iot_tx_data: Vec::new(),
        }
    }

    /// All referenced transaction hashes in application order.
    pub fn tx_hashes(&self) -> impl Iterator<Item = &Hash> {
        self.acc_tx_data
            .iter()
            .chain(self.funds_tx_data.iter())
            .chain(self.stake_tx_data.iter())
            .chain(self.iot_tx_data.iter())
    }

    pub fn tx_count(&self) -> usize {
        self.acc_tx_data.len()
            + self.funds_tx_data.len()
            + self.stake_tx_data.len()
            + self.iot_tx_data.len()
    }

    pub fn compute_merkle_root(&self) -> Hash {
        let hashes: Vec<Hash> = self.tx_hashes().copied().collect();
        merkle_root(&hashes)
    }

    pub fn compute_hash(&self) -> Hash {
        FieldHasher::new("block")
            .u8(self.header)
            .bytes(&self.prev_hash)
            .u32(self.height)
            .u32(self.shard_id)
            .i64(self.timestamp)
            .bytes(&self.beneficiary)
            .bytes(&self.commitment_proof)
            .bytes(&self.merkle_root)
            .finish()
    }

    /// Stamps the PoS result into the block and fixes its merkle root and hash.
    pub fn seal(&mut self, timestamp: i64, commitment_proof: CommitmentProof) {
        self.timestamp = timestamp;
        self.commitment_proof = commitment_proof;
        self.merkle_root = self.compute_merkle_root();
        self.hash = self.compute_hash();
    }

    /// Checks that the stored merkle root and hash match the content.
    pub fn check_integrity(&self) -> Result<()> {
        if self.merkle_root != self.compute_merkle_root() {
            return Err(ChainError::Validation(format!(
                "Block {} has an invalid merkle root",
                short_hex(&self.hash)
            )));
        }
        let expected = self.compute_hash();
        if self.hash != expected {
            return Err(ChainError::Validation(format!(
                "Block hash mismatch: claimed {}, computed {}",
                short_hex(&self.hash),
                short_hex(&expected)
            )));
        }
        Ok(())
    }
}

impl Codec for Block {}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block {{ hash: {}, prev: {}, height: {}, shard: {}, ts: {}, beneficiary: {}, txs: {}/{}/{}/{} }}",
            short_hex(&self.hash),
            short_hex(&self.prev_hash),
            self.height,
            self.shard_id,
            self.timestamp,
            short_hex(&self.beneficiary),
            self.acc_tx_data.len(),
            self.funds_tx_data.len(),
            self.stake_tx_data.len(),
            self.iot_tx_data.len()
        )
    }
}
