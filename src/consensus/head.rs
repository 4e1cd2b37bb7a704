//! Atomically published chain head markers.
//!
//! A search never locks the ledger. It snapshots a `HeadGuard` before it
//! starts and compares versions on every tick; committers publish a new tip
//! and then bump the version.

use crate::protocol::Hash;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tip {
    pub hash: Hash,
    pub height: u32,
}

#[derive(Debug)]
pub struct ChainHead {
    version: AtomicU64,
    tip: RwLock<Tip>,
}

impl ChainHead {
    pub fn new(hash: Hash, height: u32) -> Self {
        ChainHead {
            version: AtomicU64::new(0),
            tip: RwLock::new(Tip { hash, height }),
        }
    }

    /// Installs a new tip. Readers that observe the new version also
    /// observe the new tip.
    pub fn publish(&self, hash: Hash, height: u32) -> u64 {
        *self.tip.write() = Tip { hash, height };
        self.version.fetch_add(1, Ordering::Release) + 1
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn tip(&self) -> Tip {
        *self.tip.read()
    }

    pub fn guard(&self) -> HeadGuard<'_> {
        let version = self.version();
        HeadGuard {
            head: self,
            version,
            tip: self.tip(),
        }
    }
}

/// Snapshot of a `ChainHead` taken when work on top of it began.
#[derive(Debug, Clone, Copy)]
pub struct HeadGuard<'a> {
    head: &'a ChainHead,
    version: u64,
    tip: Tip,
}

impl<'a> HeadGuard<'a> {
    pub fn is_current(&self) -> bool {
        self.head.version() == self.version
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn tip(&self) -> Tip {
        self.tip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_goes_stale_on_publish() {
        let head = ChainHead::new([0u8; 32], 0);
        let guard = head.guard();
        assert!(guard.is_current());
        assert_eq!(head.publish([1u8; 32], 1), 1);
        assert!(!guard.is_current());
        assert_eq!(guard.tip().height, 0);
        assert_eq!(head.tip(), Tip { hash: [1u8; 32], height: 1 });
    }

    #[test]
    fn test_republishing_same_tip_still_bumps() {
        let head = ChainHead::new([0u8; 32], 0);
        let guard = head.guard();
        head.publish([0u8; 32], 0);
        assert!(!guard.is_current());
        assert_eq!(head.version(), 1);
    }
}
