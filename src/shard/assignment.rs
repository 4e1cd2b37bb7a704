use crate::crypto::Address;
use crate::protocol::{Account, EpochBlock, Hash, ValidatorShardMapping};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use tracing::debug;

/// `ceil(active / validators_per_shard)`; no validators means no shards.
pub fn number_of_shards(active_validators: usize, validators_per_shard: usize) -> u32 {
    if active_validators == 0 || validators_per_shard == 0 {
        return 0;
    }
    active_validators.div_ceil(validators_per_shard) as u32
}

/// Addresses of all staking accounts, in address order.
pub fn staking_validators(state: &BTreeMap<Address, Account>) -> Vec<Address> {
    state
        .values()
        .filter(|account| account.is_staking)
        .map(|account| account.address)
        .collect()
}

/// Partitions `validators` into shards of at most `validators_per_shard`.
///
/// The validators are sorted, shuffled with a generator seeded from `seed`,
/// and chunked; chunk `i` becomes shard `i + 1`. Every node that feeds the
/// same validator set and seed obtains the same mapping.
pub fn assign_validators_to_shards(
    validators: &[Address],
    validators_per_shard: usize,
    seed: &Hash,
    epoch_height: u32,
) -> ValidatorShardMapping {
    let mut mapping = ValidatorShardMapping::new(epoch_height);
    if validators.is_empty() || validators_per_shard == 0 {
        return mapping;
    }

    let mut ordered = validators.to_vec();
    ordered.sort_unstable();
    ordered.dedup();
    let mut rng = StdRng::from_seed(*seed);
    ordered.shuffle(&mut rng);

    for (index, chunk) in ordered.chunks(validators_per_shard).enumerate() {
        for validator in chunk {
            mapping.mapping.insert(*validator, index as u32 + 1);
        }
    }
    debug!(
        validators = ordered.len(),
        shards = mapping.number_of_shards(),
        epoch_height,
        "Assigned validators to shards"
    );
    mapping
}

/// The mapping in force after `epoch`: its staking validators (from the
/// embedded snapshot when present, else from `state`) shuffled with the
/// epoch hash as seed.
pub fn mapping_for_epoch(
    epoch: &EpochBlock,
    state: &BTreeMap<Address, Account>,
    validators_per_shard: usize,
) -> ValidatorShardMapping {
    let validators = staking_validators(epoch.state.as_ref().unwrap_or(state));
    assign_validators_to_shards(&validators, validators_per_shard, &epoch.hash, epoch.height)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validators(n: u8) -> Vec<Address> {
        (1..=n).map(|i| [i; 32]).collect()
    }

    #[test]
    fn test_number_of_shards() {
        assert_eq!(number_of_shards(0, 4), 0);
        assert_eq!(number_of_shards(1, 4), 1);
        assert_eq!(number_of_shards(4, 4), 1);
        assert_eq!(number_of_shards(5, 4), 2);
        assert_eq!(number_of_shards(9, 2), 5);
    }

    #[test]
    fn test_partition_is_complete_and_bounded() {
        let all = validators(11);
        let mapping = assign_validators_to_shards(&all, 3, &[42u8; 32], 0);
        assert_eq!(mapping.mapping.len(), 11);
        assert_eq!(mapping.number_of_shards(), number_of_shards(11, 3));
        for shard in 1..=mapping.number_of_shards() {
            let members = mapping.validators_in(shard);
            assert!(!members.is_empty() && members.len() <= 3);
        }
    }

    #[test]
    fn test_deterministic_for_seed_and_order() {
        let all = validators(8);
        let mut reversed = all.clone();
        reversed.reverse();
        let a = assign_validators_to_shards(&all, 2, &[1u8; 32], 100);
        let b = assign_validators_to_shards(&reversed, 2, &[1u8; 32], 100);
        assert_eq!(a, b);
        assert_eq!(a.epoch_height, 100);
    }

    #[test]
    fn test_staking_validators_filter() {
        let mut state = BTreeMap::new();
        let mut staker = Account::new([2u8; 32], [0u8; 32], 10);
        staker.is_staking = true;
        state.insert(staker.address, staker);
        state.insert([1u8; 32], Account::new([1u8; 32], [0u8; 32], 10));
        assert_eq!(staking_validators(&state), vec![[2u8; 32]]);
    }
}
