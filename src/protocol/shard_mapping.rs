use super::{short_hex, Codec, FieldHasher, Hash};
use crate::crypto::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Validator to shard assignment for one epoch. Shard ids start at 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorShardMapping {
    pub mapping: BTreeMap<Address, u32>,
    pub epoch_height: u32,
}

impl ValidatorShardMapping {
    pub fn new(epoch_height: u32) -> Self {
        ValidatorShardMapping {
            mapping: BTreeMap::new(),
            epoch_height,
        }
    }

    pub fn shard_of(&self, validator: &Address) -> Option<u32> {
        self.mapping.get(validator).copied()
    }

    pub fn number_of_shards(&self) -> u32 {
        self.mapping.values().copied().max().unwrap_or(0)
    }

    pub fn validators_in(&self, shard_id: u32) -> Vec<Address> {
        self.mapping
            .iter()
            .filter(|(_, shard)| **shard == shard_id)
            .map(|(address, _)| *address)
            .collect()
    }

    pub fn hash(&self) -> Hash {
        let mut hasher = FieldHasher::new("shard_mapping").u64(self.mapping.len() as u64);
        for (address, shard) in &self.mapping {
            hasher = hasher.bytes(address).u32(*shard);
        }
        hasher.u32(self.epoch_height).finish()
    }
}

impl Codec for ValidatorShardMapping {}

impl fmt::Display for ValidatorShardMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorShardMapping {{ epoch: {}, ", self.epoch_height)?;
        for (i, (address, shard)) in self.mapping.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} -> {}", short_hex(address), shard)?;
        }
        write!(f, " }}")
    }
}
