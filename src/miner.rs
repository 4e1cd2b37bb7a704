//! Block production for this node's shard.
//!
//! One round walks `Preparing → Searching → Finalizing` and ends in
//! `Committed`, `Aborted` (the head moved during the search) or `Rejected`
//! (the sealed block failed local validation). When the epoch boundary is
//! reached the round produces the epoch block instead.

use crate::error::{ChainError, Result};
use crate::network::Message;
use crate::node::NodeContext;
use crate::protocol::Codec;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningState {
    Idle,
    Preparing,
    Searching { height: u32 },
    Finalizing { height: u32 },
    Committed { height: u32 },
    Aborted { height: u32 },
    Rejected { height: u32 },
}

pub struct BlockMiner {
    ctx: Arc<NodeContext>,
}

impl BlockMiner {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        BlockMiner { ctx }
    }

    fn set_state(&self, state: MiningState) {
        self.ctx.mining.send_replace(state);
    }

    /// Runs one mining round. `Idle` means nothing could be attempted yet,
    /// e.g. the epoch block is due but not every shard has reached it.
    pub async fn mine_once(&self) -> Result<MiningState> {
        self.set_state(MiningState::Preparing);
        let config = &self.ctx.config;

        let prepared = {
            let ledger = self.ctx.ledger.lock();
            if ledger.is_epoch_due(config.sharding.epoch_length) {
                None
            } else {
                let guard = self.ctx.head.guard();
                let candidate = ledger.prepare_block(self.ctx.store.as_ref(), config)?;
                Some((guard, candidate))
            }
        };
        let Some((guard, candidate)) = prepared else {
            return self.epoch_round().await;
        };

        let height = candidate.block.height;
        let proof = self.ctx.commitment.commitment_proof(height);
        self.set_state(MiningState::Searching { height });
        let search = self
            .ctx
            .engine
            .search(
                config.consensus.difficulty,
                &guard,
                &candidate.prev_proofs,
                height,
                candidate.balance,
                &proof,
            )
            .await;
        let timestamp = match search {
            Ok(timestamp) => timestamp,
            Err(ChainError::Superseded(reason)) => {
                debug!(height, "Abandoning block: {}", reason);
                return Ok(self.finish(MiningState::Aborted { height }));
            }
            Err(e) => return Err(e),
        };

        self.set_state(MiningState::Finalizing { height });
        let mut block = candidate.block;
        block.seal(timestamp, proof);
        if !guard.is_current() {
            return Ok(self.finish(MiningState::Aborted { height }));
        }

        self.ctx.transport.broadcast(Message::Block(block.encode()?))?;
        let txs = block.tx_count();
        let state = match self.ctx.process_block(block, false) {
            Ok(true) => {
                info!(height, txs, "Mined block");
                MiningState::Committed { height }
            }
            Ok(false) => MiningState::Rejected { height },
            Err(e) => {
                warn!(height, "Own block rejected: {}", e);
                MiningState::Rejected { height }
            }
        };
        Ok(self.finish(state))
    }

    async fn epoch_round(&self) -> Result<MiningState> {
        let config = &self.ctx.config;
        let address = self.ctx.identity.address();

        let prepared = {
            let ledger = self.ctx.ledger.lock();
            let guard = self.ctx.epoch_head.guard();
            match ledger.epoch_candidate(config) {
                None => None,
                Some(epoch) => {
                    let balance = ledger
                        .state()
                        .get(&address)
                        .filter(|account| account.is_staking)
                        .map(|account| account.balance)
                        .ok_or_else(|| {
                            ChainError::Validation(
                                "only staking validators propose epoch blocks".to_string(),
                            )
                        })?;
                    Some((guard, epoch, balance))
                }
            }
        };
        let Some((guard, mut epoch, balance)) = prepared else {
            return Ok(self.finish(MiningState::Idle));
        };

        let height = epoch.height;
        let proof = self.ctx.commitment.commitment_proof(height);
        self.set_state(MiningState::Searching { height });
        let search = self
            .ctx
            .engine
            .search_epoch(config.consensus.difficulty, &guard, height, balance, &proof)
            .await;
        let timestamp = match search {
            Ok(timestamp) => timestamp,
            Err(ChainError::Superseded(reason)) => {
                debug!(height, "Abandoning epoch block: {}", reason);
                return Ok(self.finish(MiningState::Aborted { height }));
            }
            Err(e) => return Err(e),
        };

        self.set_state(MiningState::Finalizing { height });
        epoch.seal(timestamp, address, proof);
        if !guard.is_current() {
            return Ok(self.finish(MiningState::Aborted { height }));
        }

        self.ctx
            .transport
            .broadcast(Message::EpochBlock(epoch.encode()?))?;
        let state = match self.ctx.process_epoch_block(epoch, false) {
            Ok(true) => {
                info!(height, "Mined epoch block");
                MiningState::Committed { height }
            }
            Ok(false) => MiningState::Rejected { height },
            Err(e) => {
                warn!(height, "Own epoch block rejected: {}", e);
                MiningState::Rejected { height }
            }
        };
        Ok(self.finish(state))
    }

    fn finish(&self, state: MiningState) -> MiningState {
        self.set_state(state);
        state
    }

    /// Mines until shutdown. Failed preparation (no stake, no account, not
    /// assigned) backs off before retrying.
    pub async fn run(self) {
        let mut shutdown = self.ctx.shutdown.subscribe();
        let tick = self.ctx.config.tick_interval();
        let backoff = self.ctx.config.zero_balance_backoff();
        info!("Miner started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::task::yield_now().await;

            let pause = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.mine_once() => match outcome {
                    Ok(MiningState::Idle) | Ok(MiningState::Rejected { .. }) => Some(tick),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Mining paused for {:?}: {}", backoff, e);
                        Some(backoff)
                    }
                },
            };

            if let Some(pause) = pause {
                self.set_state(MiningState::Idle);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(pause) => {}
                }
            }
        }

        self.set_state(MiningState::Idle);
        info!("Miner stopped");
    }
}
