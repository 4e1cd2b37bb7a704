//! Validator partitioning, epoch block construction and cross-shard
//! reconciliation.

pub mod assignment;
pub mod epoch;
pub mod reconcile;

pub use assignment::{
    assign_validators_to_shards, mapping_for_epoch, number_of_shards, staking_validators,
};
pub use epoch::{build_epoch_block, is_epoch_boundary, is_epoch_height, ShardHeads};
pub use reconcile::{apply_relative_state, relative_state, TransitionSequencer};

use crate::crypto::Address;

/// Shard a transaction sender belongs to: `(u64_be(addr[0..8]) % n) + 1`.
/// With no shards everything lands in shard 1.
pub fn shard_for_address(address: &Address, number_of_shards: u32) -> u32 {
    if number_of_shards == 0 {
        return 1;
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&address[..8]);
    (u64::from_be_bytes(prefix) % number_of_shards as u64) as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_for_address_range() {
        let mut address = [0u8; 32];
        address[7] = 7;
        assert_eq!(shard_for_address(&address, 3), 2);
        assert_eq!(shard_for_address(&address, 1), 1);
        assert_eq!(shard_for_address(&address, 0), 1);
        for byte in 0..=255u8 {
            let shard = shard_for_address(&[byte; 32], 4);
            assert!((1..=4).contains(&shard));
        }
    }
}
