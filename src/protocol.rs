//! Canonical data model: accounts, blocks, epoch blocks, transactions and the
//! cross-shard payloads, with their encode/decode/hash contracts.
//!
//! Fixed-size transactions (`StakeTx`, `FundsTx`) use explicit byte offsets.
//! Everything else is encoded with bincode using fixed-width integers, a size
//! limit, and rejection of trailing bytes. Hashes are SHA-256 over an explicit
//! field sequence so they stay stable across releases of the serializer.

pub mod account;
pub mod block;
pub mod epoch_block;
pub mod genesis;
pub mod payload;
pub mod shard_mapping;
pub mod transaction;

pub use account::{Account, RelativeAccount};
pub use block::Block;
pub use epoch_block::EpochBlock;
pub use genesis::Genesis;
pub use payload::{StateTransition, TransactionPayload};
pub use shard_mapping::ValidatorShardMapping;
pub use transaction::{
    AccTx, FundsTx, IotTx, StakeTx, Transaction, TxKind, FUNDSTX_SIZE, STAKETX_SIZE,
};

use crate::error::{ChainError, Result};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// A SHA-256 digest.
pub type Hash = [u8; 32];

pub const ZERO_HASH: Hash = [0u8; 32];

/// Upper bound for any structured encoding, epoch state snapshots included.
pub const MAX_ENCODED_SIZE: u64 = 16 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_ENCODED_SIZE)
        .reject_trailing_bytes()
}

/// Wire and storage encoding.
///
/// The provided methods use the structured bincode encoding; fixed layout
/// types override both.
pub trait Codec: Serialize + DeserializeOwned {
    fn encode(&self) -> Result<Vec<u8>> {
        codec().serialize(self).map_err(ChainError::from)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        codec().deserialize(bytes).map_err(ChainError::from)
    }
}

/// Hex form of a digest, for logs and `Display`.
pub fn short_hex(bytes: &[u8]) -> String {
    let full = hex::encode(bytes);
    full[..full.len().min(16)].to_string()
}

/// Incremental digest over explicitly ordered fields.
pub(crate) struct FieldHasher(Sha256);

impl FieldHasher {
    pub(crate) fn new(domain: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        FieldHasher(hasher)
    }

    pub(crate) fn bytes(mut self, value: &[u8]) -> Self {
        self.0.update(value);
        self
    }

    /// Length prefixed, so adjacent variable fields cannot alias.
    pub(crate) fn var_bytes(mut self, value: &[u8]) -> Self {
        self.0.update((value.len() as u64).to_be_bytes());
        self.0.update(value);
        self
    }

    pub(crate) fn hashes(mut self, values: &[Hash]) -> Self {
        self.0.update((values.len() as u64).to_be_bytes());
        for value in values {
            self.0.update(value);
        }
        self
    }

    pub(crate) fn u8(self, value: u8) -> Self {
        self.bytes(&[value])
    }

    pub(crate) fn u32(self, value: u32) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    pub(crate) fn u64(self, value: u64) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    pub(crate) fn i64(self, value: i64) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    pub(crate) fn finish(self) -> Hash {
        self.0.finalize().into()
    }
}

/// Merkle root over `hashes`; the last node of an odd level is paired with
/// itself. An empty list has the zero root.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return ZERO_HASH;
    }
    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                hasher.finalize().into()
            })
            .collect();
    }
    level[0]
}

/// Copies `N` bytes starting at `offset` out of a fixed-layout buffer whose
/// length has already been checked.
pub(crate) fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    bytes
        .get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| ChainError::Decode(format!("Truncated field at offset {}", offset)))
}

pub(crate) fn expect_len(bytes: &[u8], expected: usize, type_name: &str) -> Result<()> {
    if bytes.len() != expected {
        return Err(ChainError::Decode(format!(
            "{} must be {} bytes, got {}",
            type_name,
            expected,
            bytes.len()
        )));
    }
    Ok(())
}

pub(crate) fn decode_flag(byte: u8) -> Result<bool> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ChainError::Decode(format!("Invalid boolean flag {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_root_empty_and_single() {
        assert_eq!(merkle_root(&[]), ZERO_HASH);
        assert_eq!(merkle_root(&[[1u8; 32]]), [1u8; 32]);
    }

    #[test]
    fn test_merkle_root_order_sensitive() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        assert_ne!(merkle_root(&[a, b, c]), merkle_root(&[b, a, c]));
        assert_eq!(merkle_root(&[a, b, c]), merkle_root(&[a, b, c]));
    }

    #[test]
    fn test_field_hasher_length_prefix() {
        let left = FieldHasher::new("t").var_bytes(b"ab").var_bytes(b"c").finish();
        let right = FieldHasher::new("t").var_bytes(b"a").var_bytes(b"bc").finish();
        assert_ne!(left, right);
    }

    #[test]
    fn test_expect_len_error() {
        let err = expect_len(&[0u8; 3], 4, "Thing").unwrap_err();
        assert_eq!(err.to_string(), "Decode error: Thing must be 4 bytes, got 3");
    }
}
