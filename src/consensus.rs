//! Proof-of-stake search and verification.
//!
//! A validator proves eligibility for height `h` by finding a timestamp for
//! which `sha256(prev_proofs ∥ commitment_proof ∥ h ∥ timestamp)`, with its
//! leading 8 bytes divided by the validator's balance, starts with
//! `difficulty` zero bits. One timestamp is tried per tick, the first one
//! after a full tick has elapsed.

pub mod head;

pub use head::{ChainHead, HeadGuard, Tip};

use crate::crypto::CommitmentProof;
use crate::error::{ChainError, Result};
use crate::persistence::Store;
use crate::protocol::{short_hex, Hash};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Source of candidate timestamps, in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Clock that advances by a fixed step on every read.
#[derive(Debug)]
pub struct SteppingClock {
    next: AtomicI64,
    step: i64,
}

impl SteppingClock {
    pub fn new(start: i64, step: i64) -> Self {
        SteppingClock {
            next: AtomicI64::new(start),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> i64 {
        self.next.fetch_add(self.step, Ordering::SeqCst)
    }
}

pub struct ConsensusEngine {
    tick: Duration,
    clock: Arc<dyn Clock>,
}

impl ConsensusEngine {
    pub fn new(tick: Duration, clock: Arc<dyn Clock>) -> Self {
        ConsensusEngine { tick, clock }
    }

    pub fn with_system_clock(tick: Duration) -> Self {
        Self::new(tick, Arc::new(SystemClock))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Searches for a timestamp that satisfies the PoS condition for a block
    /// on top of the head captured by `guard`.
    ///
    /// Fails with `ZeroBalance` before any hashing when `balance` is zero and
    /// with `Superseded` as soon as the guarded head moves.
    pub async fn search(
        &self,
        difficulty: u8,
        guard: &HeadGuard<'_>,
        prev_proofs: &[CommitmentProof],
        height: u32,
        balance: u64,
        commitment_proof: &CommitmentProof,
    ) -> Result<i64> {
        self.run_search(difficulty, guard, prev_proofs, height, balance, commitment_proof)
            .await
    }

    /// Epoch block search: no proof chain, aborts when another epoch block
    /// was committed.
    pub async fn search_epoch(
        &self,
        difficulty: u8,
        epoch_guard: &HeadGuard<'_>,
        height: u32,
        balance: u64,
        commitment_proof: &CommitmentProof,
    ) -> Result<i64> {
        self.run_search(difficulty, epoch_guard, &[], height, balance, commitment_proof)
            .await
    }

    async fn run_search(
        &self,
        difficulty: u8,
        guard: &HeadGuard<'_>,
        prev_proofs: &[CommitmentProof],
        height: u32,
        balance: u64,
        commitment_proof: &CommitmentProof,
    ) -> Result<i64> {
        if balance == 0 {
            return Err(ChainError::ZeroBalance(format!(
                "cannot search height {} without stake",
                height
            )));
        }

        let mut input = pos_input(prev_proofs, commitment_proof, height);
        let timestamp_at = input.len() - 8;
        let mut ticker = tokio::time::interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tried = None;
        let mut attempts: u64 = 0;

        loop {
            ticker.tick().await;
            if !guard.is_current() {
                debug!(height, attempts, "PoS search superseded");
                return Err(ChainError::Superseded(format!(
                    "head {} at height {} replaced",
                    short_hex(&guard.tip().hash),
                    guard.tip().height
                )));
            }

            let timestamp = self.clock.now();
            if last_tried == Some(timestamp) {
                continue;
            }
            last_tried = Some(timestamp);
            attempts += 1;

            input[timestamp_at..].copy_from_slice(&timestamp.to_be_bytes());
            if meets_difficulty(&adjusted_digest(&input, balance), difficulty) {
                debug!(height, timestamp, attempts, "PoS search succeeded");
                return Ok(timestamp);
            }
            trace!(height, timestamp, "PoS candidate rejected");
        }
    }

    /// Recomputes the PoS test for a claimed timestamp.
    pub fn verify(
        &self,
        difficulty: u8,
        prev_proofs: &[CommitmentProof],
        height: u32,
        balance: u64,
        commitment_proof: &CommitmentProof,
        timestamp: i64,
    ) -> bool {
        verify_proof_of_stake(difficulty, prev_proofs, height, balance, commitment_proof, timestamp)
    }
}

pub fn verify_proof_of_stake(
    difficulty: u8,
    prev_proofs: &[CommitmentProof],
    height: u32,
    balance: u64,
    commitment_proof: &CommitmentProof,
    timestamp: i64,
) -> bool {
    if balance == 0 {
        return false;
    }
    let mut input = pos_input(prev_proofs, commitment_proof, height);
    let timestamp_at = input.len() - 8;
    input[timestamp_at..].copy_from_slice(&timestamp.to_be_bytes());
    meets_difficulty(&adjusted_digest(&input, balance), difficulty)
}

/// `prev_proofs ∥ commitment_proof ∥ height`, followed by eight zero bytes
/// reserved for the timestamp.
fn pos_input(prev_proofs: &[CommitmentProof], commitment_proof: &CommitmentProof, height: u32) -> Vec<u8> {
    let mut input = Vec::with_capacity(prev_proofs.len() * 64 + 64 + 4 + 8);
    for proof in prev_proofs {
        input.extend_from_slice(proof);
    }
    input.extend_from_slice(commitment_proof);
    input.extend_from_slice(&height.to_be_bytes());
    input.extend_from_slice(&[0u8; 8]);
    input
}

/// SHA-256 of `input` with its leading 8 bytes replaced by themselves
/// divided by `balance`. `balance` must be non-zero.
fn adjusted_digest(input: &[u8], balance: u64) -> [u8; 32] {
    let mut digest: [u8; 32] = Sha256::digest(input).into();
    let mut leading = [0u8; 8];
    leading.copy_from_slice(&digest[..8]);
    let quotient = u64::from_be_bytes(leading) / balance;
    digest[..8].copy_from_slice(&quotient.to_be_bytes());
    digest
}

fn meets_difficulty(digest: &[u8; 32], difficulty: u8) -> bool {
    let full_bytes = (difficulty / 8) as usize;
    if digest[..full_bytes].iter().any(|b| *b != 0) {
        return false;
    }
    let remaining_bits = difficulty % 8;
    remaining_bits == 0 || digest[full_bytes] < (1u8 << (8 - remaining_bits))
}

/// Commitment proofs of up to `n` ancestors, newest first, starting at
/// `parent` and stopping at the last epoch block.
pub fn latest_proofs(
    store: &dyn Store,
    n: usize,
    parent: &Hash,
    last_epoch_height: u32,
) -> Result<Vec<CommitmentProof>> {
    let mut proofs = Vec::with_capacity(n);
    let mut cursor = *parent;
    while proofs.len() < n {
        let Some(block) = store.read_closed_block(&cursor)? else {
            break;
        };
        if block.height <= last_epoch_height {
            break;
        }
        proofs.push(block.commitment_proof);
        cursor = block.prev_hash;
    }
    Ok(proofs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use crate::protocol::Block;

    #[test]
    fn test_meets_difficulty_partial_bits() {
        let mut digest = [0xffu8; 32];
        assert!(meets_difficulty(&digest, 0));
        digest[0] = 0;
        digest[1] = 0b0001_1111;
        assert!(meets_difficulty(&digest, 8));
        assert!(meets_difficulty(&digest, 11));
        assert!(!meets_difficulty(&digest, 12));
        assert!(!meets_difficulty(&digest, 16));
    }

    #[test]
    fn test_max_difficulty_does_not_overrun() {
        assert!(!meets_difficulty(&[0xffu8; 32], u8::MAX));
        let mut digest = [0u8; 32];
        digest[31] = 1;
        assert!(meets_difficulty(&digest, u8::MAX));
    }

    #[test]
    fn test_higher_balance_never_hurts() {
        let proof = [7u8; 64];
        for timestamp in 0..200 {
            if verify_proof_of_stake(6, &[], 10, 1, &proof, timestamp) {
                assert!(verify_proof_of_stake(6, &[], 10, 1_000, &proof, timestamp));
            }
        }
    }

    #[test]
    fn test_verify_zero_balance_is_false() {
        assert!(!verify_proof_of_stake(0, &[], 1, 0, &[0u8; 64], 0));
    }

    #[test]
    fn test_latest_proofs_stops_at_epoch() {
        let store = InMemoryStore::new();
        let mut prev = [0xeeu8; 32];
        for height in 101..=104u32 {
            let mut block = Block::new(prev, height, 1, [1u8; 32]);
            block.seal(height as i64, [height as u8; 64]);
            store.write_closed_block(&block).unwrap();
            prev = block.hash;
        }

        let proofs = latest_proofs(&store, 10, &prev, 100).unwrap();
        assert_eq!(proofs, vec![[104u8; 64], [103u8; 64], [102u8; 64], [101u8; 64]]);

        let proofs = latest_proofs(&store, 2, &prev, 100).unwrap();
        assert_eq!(proofs, vec![[104u8; 64], [103u8; 64]]);

        let proofs = latest_proofs(&store, 10, &prev, 102).unwrap();
        assert_eq!(proofs.len(), 2);
    }
}
