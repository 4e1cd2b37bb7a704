use crate::consensus::Tip;
use crate::protocol::{EpochBlock, Hash};
use std::collections::BTreeMap;

/// True when the next block would sit on an epoch height, i.e. regular
/// mining stops and the epoch block is due.
pub fn is_epoch_boundary(global_block_count: u32, epoch_length: u32) -> bool {
    epoch_length != 0 && (global_block_count as u64 + 1) % epoch_length as u64 == 0
}

pub fn is_epoch_height(height: u32, epoch_length: u32) -> bool {
    epoch_length != 0 && height % epoch_length == 0
}

/// An unsealed epoch block over the given shard heads.
pub fn build_epoch_block(prev_shard_hashes: Vec<Hash>, height: u32) -> EpochBlock {
    EpochBlock::new(prev_shard_hashes, height)
}

/// Latest known block of every shard since the last epoch block.
#[derive(Debug, Clone)]
pub struct ShardHeads {
    heads: BTreeMap<u32, Tip>,
    last_regular: BTreeMap<u32, u32>,
    last_epoch: Tip,
}

impl ShardHeads {
    pub fn new(epoch_hash: Hash, epoch_height: u32) -> Self {
        ShardHeads {
            heads: BTreeMap::new(),
            last_regular: BTreeMap::new(),
            last_epoch: Tip {
                hash: epoch_hash,
                height: epoch_height,
            },
        }
    }

    /// Records a committed regular block of `shard_id`.
    pub fn record(&mut self, shard_id: u32, hash: Hash, height: u32) {
        self.heads.insert(shard_id, Tip { hash, height });
        self.last_regular.insert(shard_id, height);
    }

    /// Head of `shard_id`; the last epoch block when the shard has produced
    /// nothing since.
    pub fn head(&self, shard_id: u32) -> Tip {
        self.heads.get(&shard_id).copied().unwrap_or(self.last_epoch)
    }

    /// Height of the most recent regular block of `shard_id`, across epochs.
    pub fn last_regular_height(&self, shard_id: u32) -> Option<u32> {
        self.last_regular.get(&shard_id).copied()
    }

    pub fn last_epoch(&self) -> Tip {
        self.last_epoch
    }

    pub fn reset_to_epoch(&mut self, epoch_hash: Hash, epoch_height: u32) {
        self.heads.clear();
        self.last_epoch = Tip {
            hash: epoch_hash,
            height: epoch_height,
        };
    }

    /// One hash per shard `1..=n`, in shard order.
    pub fn collect(&self, number_of_shards: u32) -> Vec<Hash> {
        (1..=number_of_shards)
            .map(|shard_id| self.head(shard_id).hash)
            .collect()
    }

    /// Whether every shard `1..=n` has a head at `height` or above.
    pub fn all_reached(&self, number_of_shards: u32, height: u32) -> bool {
        (1..=number_of_shards).all(|shard_id| {
            self.heads
                .get(&shard_id)
                .is_some_and(|tip| tip.height >= height)
        })
    }
}
