//! Relative account deltas and their in-order application on sibling shards.

use crate::crypto::Address;
use crate::error::{ChainError, Result};
use crate::protocol::{short_hex, Account, RelativeAccount, StateTransition};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

fn checked<U: TryFrom<i128>>(value: i128, field: &str, address: &Address) -> Result<U> {
    U::try_from(value).map_err(|_| {
        ChainError::Reconciliation(format!(
            "{} delta {} out of range for account {}",
            field,
            value,
            short_hex(address)
        ))
    })
}

/// Deltas turning `before` into `after`. Accounts that did not change are
/// left out; accounts new in `after` appear as deltas from zero.
pub fn relative_state(
    before: &BTreeMap<Address, Account>,
    after: &BTreeMap<Address, Account>,
) -> Result<BTreeMap<Address, RelativeAccount>> {
    let mut changes = BTreeMap::new();
    for (address, new) in after {
        let (balance, tx_cnt, staking_height) = match before.get(address) {
            Some(old) => (
                new.balance as i128 - old.balance as i128,
                new.tx_cnt as i128 - old.tx_cnt as i128,
                new.staking_block_height as i128 - old.staking_block_height as i128,
            ),
            None => (
                new.balance as i128,
                new.tx_cnt as i128,
                new.staking_block_height as i128,
            ),
        };

        let relative = RelativeAccount {
            address: *address,
            issuer: new.issuer,
            balance: checked(balance, "balance", address)?,
            tx_cnt: checked(tx_cnt, "tx_cnt", address)?,
            is_staking: new.is_staking,
            commitment_key: new.commitment_key,
            staking_block_height: checked(staking_height, "staking_block_height", address)?,
            contract: new.contract.clone(),
            contract_variables: new.contract_variables.clone(),
        };

        let unchanged = before
            .get(address)
            .is_some_and(|old| relative.is_noop(old));
        if !unchanged {
            changes.insert(*address, relative);
        }
    }
    Ok(changes)
}

/// Applies `delta` to `state`. Unknown addresses are inserted as given,
/// known ones have the deltas added. Either every account is updated or,
/// on error, none is. Returns the touched addresses.
pub fn apply_relative_state(
    state: &mut BTreeMap<Address, Account>,
    delta: &BTreeMap<Address, RelativeAccount>,
) -> Result<Vec<Address>> {
    let mut updated = Vec::with_capacity(delta.len());
    for (address, relative) in delta {
        let (balance, tx_cnt, staking_height) = match state.get(address) {
            Some(current) => (
                current.balance as i128 + relative.balance as i128,
                current.tx_cnt as i128 + relative.tx_cnt as i128,
                current.staking_block_height as i128 + relative.staking_block_height as i128,
            ),
            None => (
                relative.balance as i128,
                relative.tx_cnt as i128,
                relative.staking_block_height as i128,
            ),
        };
        updated.push(Account {
            address: *address,
            issuer: relative.issuer,
            balance: checked(balance, "balance", address)?,
            tx_cnt: checked(tx_cnt, "tx_cnt", address)?,
            is_staking: relative.is_staking,
            commitment_key: relative.commitment_key,
            staking_block_height: checked(staking_height, "staking_block_height", address)?,
            contract: relative.contract.clone(),
            contract_variables: relative.contract_variables.clone(),
        });
    }

    let touched = updated.iter().map(|account| account.address).collect();
    for account in updated {
        state.insert(account.address, account);
    }
    Ok(touched)
}

/// What happened to an offered transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// These transitions, in order, are now due for application.
    Ready(Vec<StateTransition>),
    /// Waiting for a predecessor.
    Buffered,
    /// At or below the last linked height of its shard.
    Stale,
    /// From this node's own shard.
    Ignored,
}

/// Orders sibling-shard transitions by their `prev_height` links.
///
/// A transition is *linked* once its predecessor was released, and
/// *applied* once the replica absorbed it. A linked transition the replica
/// rejects (an intermediate balance that would go negative until another
/// shard's credit arrives) is held, in order, behind its shard's applied
/// height and retried later.
#[derive(Debug)]
pub struct TransitionSequencer {
    own_shard: u32,
    floor: u32,
    linked: BTreeMap<u32, u32>,
    applied: BTreeMap<u32, u32>,
    pending: BTreeMap<(u32, u32), StateTransition>,
    held: BTreeMap<u32, VecDeque<StateTransition>>,
    max_pending: usize,
}

impl TransitionSequencer {
    /// `floor` is the epoch height the local state starts from; shards with
    /// no linked transition accept a first transition linked at or below it.
    pub fn new(own_shard: u32, floor: u32, max_pending: usize) -> Self {
        TransitionSequencer {
            own_shard,
            floor,
            linked: BTreeMap::new(),
            applied: BTreeMap::new(),
            pending: BTreeMap::new(),
            held: BTreeMap::new(),
            max_pending,
        }
    }

    pub fn own_shard(&self) -> u32 {
        self.own_shard
    }

    pub fn set_own_shard(&mut self, shard_id: u32) {
        self.own_shard = shard_id;
    }

    /// Raises the floor after an epoch commit. Buffered first transitions of
    /// shards that now qualify are returned, ready for application; buffered
    /// ones that can no longer be linked are dropped.
    pub fn advance_floor(&mut self, epoch_height: u32) -> Vec<StateTransition> {
        self.floor = self.floor.max(epoch_height);
        let floor = self.floor;
        let before = self.pending.len();
        let linked = &self.linked;
        self.pending.retain(|(shard, _), t| {
            linked.contains_key(shard) || t.height > floor
        });
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(dropped, floor, "Dropped buffered transitions below the epoch floor");
        }

        let startable: Vec<(u32, u32)> = self
            .pending
            .iter()
            .filter(|((shard, prev), _)| !self.linked.contains_key(shard) && *prev <= floor)
            .map(|(key, _)| *key)
            .collect();

        let mut ready = Vec::new();
        for key in startable {
            if self.linked.contains_key(&key.0) {
                continue;
            }
            if let Some(first) = self.pending.remove(&key) {
                ready.extend(self.chain_from(first));
            }
        }
        ready
    }

    /// Marks a locally committed block so that its shard continues seamlessly
    /// if this node later moves to another shard.
    pub fn record_local(&mut self, shard_id: u32, height: u32) {
        self.linked.insert(shard_id, height);
        self.applied.insert(shard_id, height);
        self.held.remove(&shard_id);
        self.pending.retain(|(shard, prev), _| *shard != shard_id || *prev >= height);
    }

    /// Resumes a shard at a persisted applied height.
    pub fn restore_applied(&mut self, shard_id: u32, height: u32) {
        let linked = self.linked.entry(shard_id).or_insert(height);
        *linked = (*linked).max(height);
        let applied = self.applied.entry(shard_id).or_insert(height);
        *applied = (*applied).max(height);
    }

    /// Records that the replica absorbed `transition`.
    pub fn mark_applied(&mut self, transition: &StateTransition) {
        let applied = self
            .applied
            .entry(transition.shard_id)
            .or_insert(transition.height);
        *applied = (*applied).max(transition.height);
    }

    /// Height of the last transition of `shard_id` the replica absorbed.
    pub fn last_applied(&self, shard_id: u32) -> Option<u32> {
        self.applied.get(&shard_id).copied()
    }

    /// Height of the last transition of `shard_id` released in order,
    /// applied or held.
    pub fn last_linked(&self, shard_id: u32) -> Option<u32> {
        self.linked.get(&shard_id).copied()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Parks a released transition the replica could not absorb yet.
    pub fn hold(&mut self, transition: StateTransition) {
        debug!(
            shard_id = transition.shard_id,
            height = transition.height,
            "Holding state transition for a later retry"
        );
        self.held
            .entry(transition.shard_id)
            .or_default()
            .push_back(transition);
    }

    /// Whether later transitions of `shard_id` must queue behind a held one.
    pub fn is_held(&self, shard_id: u32) -> bool {
        self.held.get(&shard_id).is_some_and(|queue| !queue.is_empty())
    }

    pub fn held_len(&self) -> usize {
        self.held.values().map(VecDeque::len).sum()
    }

    pub fn held_shards(&self) -> Vec<u32> {
        self.held
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(shard, _)| *shard)
            .collect()
    }

    /// Oldest held transition of `shard_id`.
    pub fn next_held(&self, shard_id: u32) -> Option<&StateTransition> {
        self.held.get(&shard_id).and_then(VecDeque::front)
    }

    /// Removes the oldest held transition of `shard_id` after it applied.
    pub fn release_held(&mut self, shard_id: u32) -> Option<StateTransition> {
        let queue = self.held.get_mut(&shard_id)?;
        let released = queue.pop_front();
        if queue.is_empty() {
            self.held.remove(&shard_id);
        }
        released
    }

    pub fn offer(&mut self, transition: StateTransition) -> Result<Offer> {
        let shard_id = transition.shard_id;
        if shard_id == self.own_shard {
            return Ok(Offer::Ignored);
        }

        let in_order = match self.last_linked(shard_id) {
            Some(last) if transition.height <= last => return Ok(Offer::Stale),
            Some(last) if transition.prev_height == last => true,
            Some(last) if transition.prev_height < last => {
                return Err(ChainError::Reconciliation(format!(
                    "Shard {} transition {} links to {} but {} was already linked",
                    shard_id, transition.height, transition.prev_height, last
                )));
            }
            Some(_) => false,
            None if transition.height <= self.floor => return Ok(Offer::Stale),
            None => transition.prev_height <= self.floor,
        };

        if !in_order {
            if self.pending.len() + self.held_len() >= self.max_pending {
                return Err(ChainError::Reconciliation(format!(
                    "Pending transition buffer full ({}), dropping shard {} height {}",
                    self.max_pending, shard_id, transition.height
                )));
            }
            debug!(
                shard_id,
                height = transition.height,
                prev_height = transition.prev_height,
                "Buffering out-of-order state transition"
            );
            self.pending
                .insert((shard_id, transition.prev_height), transition);
            return Ok(Offer::Buffered);
        }

        Ok(Offer::Ready(self.chain_from(transition)))
    }

    /// `first` followed by every buffered successor; marks them linked.
    fn chain_from(&mut self, first: StateTransition) -> Vec<StateTransition> {
        let shard_id = first.shard_id;
        let mut last = first.height;
        let mut ready = vec![first];
        while let Some(next) = self.pending.remove(&(shard_id, last)) {
            last = next.height;
            ready.push(next);
        }
        self.linked.insert(shard_id, last);
        self.pending
            .retain(|(shard, prev), _| *shard != shard_id || *prev > last);
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: u8, balance: u64) -> Account {
        Account::new([id; 32], [0u8; 32], balance)
    }

    fn state(accounts: &[Account]) -> BTreeMap<Address, Account> {
        accounts.iter().map(|a| (a.address, a.clone())).collect()
    }

    fn transition(shard_id: u32, prev_height: u32, height: u32) -> StateTransition {
        StateTransition::new(BTreeMap::new(), height, shard_id, prev_height)
    }

    #[test]
    fn test_relative_state_skips_unchanged() {
        let before = state(&[account(1, 100), account(2, 50)]);
        let mut moved = account(1, 70);
        moved.tx_cnt = 1;
        let after = state(&[moved, account(2, 50), account(3, 30)]);

        let delta = relative_state(&before, &after).unwrap();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[&[1u8; 32]].balance, -30);
        assert_eq!(delta[&[1u8; 32]].tx_cnt, 1);
        assert_eq!(delta[&[3u8; 32]].balance, 30);
    }

    #[test]
    fn test_apply_matches_absolute_after() {
        let before = state(&[account(1, 100), account(2, 50)]);
        let mut staker = account(2, 80);
        staker.is_staking = true;
        staker.commitment_key = [7u8; 32];
        staker.staking_block_height = 12;
        let after = state(&[account(1, 60), staker, account(4, 10)]);

        let delta = relative_state(&before, &after).unwrap();
        let mut replica = before.clone();
        let touched = apply_relative_state(&mut replica, &delta).unwrap();
        assert_eq!(replica, after);
        assert_eq!(touched.len(), 3);
    }

    #[test]
    fn test_underflow_leaves_state_untouched() {
        let mut replica = state(&[account(1, 10), account(2, 10)]);
        let snapshot = replica.clone();
        let before = state(&[account(1, 100), account(2, 100)]);
        let after = state(&[account(1, 150), account(2, 0)]);
        let delta = relative_state(&before, &after).unwrap();

        let err = apply_relative_state(&mut replica, &delta).unwrap_err();
        assert!(matches!(err, ChainError::Reconciliation(_)));
        assert_eq!(replica, snapshot);
    }

    #[test]
    fn test_sequencer_in_order_and_buffered() {
        let mut sequencer = TransitionSequencer::new(1, 0, 8);
        assert_eq!(sequencer.offer(transition(2, 4, 5)).unwrap(), Offer::Buffered);
        assert_eq!(sequencer.offer(transition(2, 1, 4)).unwrap(), Offer::Buffered);

        match sequencer.offer(transition(2, 0, 1)).unwrap() {
            Offer::Ready(ready) => {
                let heights: Vec<u32> = ready.iter().map(|t| t.height).collect();
                assert_eq!(heights, vec![1, 4, 5]);
            }
            other => panic!("expected ready, got {:?}", other),
        }
        assert_eq!(sequencer.last_linked(2), Some(5));
        assert_eq!(sequencer.last_applied(2), None);
        assert_eq!(sequencer.pending_len(), 0);
        assert_eq!(sequencer.offer(transition(2, 1, 4)).unwrap(), Offer::Stale);
    }

    #[test]
    fn test_sequencer_ignores_own_shard() {
        let mut sequencer = TransitionSequencer::new(3, 0, 8);
        assert_eq!(sequencer.offer(transition(3, 0, 1)).unwrap(), Offer::Ignored);
        assert_eq!(sequencer.last_applied(3), None);
    }

    #[test]
    fn test_sequencer_bounded_buffer() {
        let mut sequencer = TransitionSequencer::new(1, 0, 1);
        assert_eq!(sequencer.offer(transition(2, 5, 6)).unwrap(), Offer::Buffered);
        assert!(sequencer.offer(transition(2, 6, 7)).is_err());
    }

    #[test]
    fn test_sequencer_floor_for_new_shards() {
        let mut sequencer = TransitionSequencer::new(1, 0, 8);
        assert_eq!(sequencer.offer(transition(4, 200, 201)).unwrap(), Offer::Buffered);
        assert_eq!(sequencer.offer(transition(4, 201, 202)).unwrap(), Offer::Buffered);
        let released = sequencer.advance_floor(200);
        let heights: Vec<u32> = released.iter().map(|t| t.height).collect();
        assert_eq!(heights, vec![201, 202]);
        assert_eq!(sequencer.last_linked(4), Some(202));
        assert!(matches!(
            sequencer.offer(transition(5, 200, 201)).unwrap(),
            Offer::Ready(_)
        ));
        assert_eq!(sequencer.offer(transition(6, 100, 150)).unwrap(), Offer::Stale);
    }

    #[test]
    fn test_record_local_continues_after_shard_change() {
        let mut sequencer = TransitionSequencer::new(1, 0, 8);
        sequencer.record_local(1, 42);
        sequencer.set_own_shard(2);
        assert!(matches!(
            sequencer.offer(transition(1, 42, 43)).unwrap(),
            Offer::Ready(_)
        ));
    }

    #[test]
    fn test_held_transitions_keep_shard_order() {
        let mut sequencer = TransitionSequencer::new(3, 0, 8);
        let first = match sequencer.offer(transition(2, 0, 1)).unwrap() {
            Offer::Ready(mut ready) => ready.remove(0),
            other => panic!("expected ready, got {:?}", other),
        };
        sequencer.hold(first);
        assert!(sequencer.is_held(2));
        assert_eq!(sequencer.last_applied(2), None);
        assert_eq!(sequencer.offer(transition(2, 0, 1)).unwrap(), Offer::Stale);

        match sequencer.offer(transition(2, 1, 2)).unwrap() {
            Offer::Ready(ready) => sequencer.hold(ready[0].clone()),
            other => panic!("expected ready, got {:?}", other),
        }
        assert_eq!(sequencer.held_shards(), vec![2]);
        assert_eq!(sequencer.held_len(), 2);

        let released = sequencer.release_held(2).unwrap();
        sequencer.mark_applied(&released);
        assert_eq!(sequencer.next_held(2).map(|t| t.height), Some(2));
        let released = sequencer.release_held(2).unwrap();
        sequencer.mark_applied(&released);
        assert!(!sequencer.is_held(2));
        assert_eq!(sequencer.last_applied(2), Some(2));
    }

    #[test]
    fn test_advance_floor_drops_unlinkable_buffered() {
        let mut sequencer = TransitionSequencer::new(1, 0, 2);
        assert_eq!(sequencer.offer(transition(2, 5, 6)).unwrap(), Offer::Buffered);
        assert_eq!(sequencer.offer(transition(3, 6, 7)).unwrap(), Offer::Buffered);
        assert!(sequencer.offer(transition(4, 1, 2)).is_err());

        assert!(sequencer.advance_floor(8).is_empty());
        assert_eq!(sequencer.pending_len(), 0);
        assert!(matches!(
            sequencer.offer(transition(4, 8, 9)).unwrap(),
            Offer::Ready(_)
        ));
    }

    #[test]
    fn test_restored_shard_continues_in_order() {
        let mut sequencer = TransitionSequencer::new(1, 0, 8);
        sequencer.restore_applied(2, 5);
        assert_eq!(sequencer.last_applied(2), Some(5));
        assert!(matches!(
            sequencer.offer(transition(2, 5, 6)).unwrap(),
            Offer::Ready(_)
        ));
        assert_eq!(sequencer.offer(transition(2, 3, 5)).unwrap(), Offer::Stale);
    }
}
