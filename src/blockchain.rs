//! Ledger of a shard validator: account replica, mempool, block checks and
//! the commit paths for regular and epoch blocks.

pub mod chain;
pub mod mempool;
pub mod state;
pub mod validation;

pub use chain::{BlockOutcome, Candidate, CommittedBlock, EpochCommit, Ledger};
pub use mempool::Mempool;
pub use state::{AccountState, TxRules};
