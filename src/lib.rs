//! EpochChain - a sharded proof-of-stake validator core
//!
//! # Architecture
//!
//! ## Model
//! - [`protocol`] - Blocks, epoch blocks, transactions, accounts and their encodings
//! - [`crypto`] - Schnorr keys, signatures and commitment proofs (secp256k1)
//!
//! ## Consensus
//! - [`consensus`] - Proof-of-stake search and verification, head markers
//! - [`miner`] - Mining state machine
//!
//! ## Chain & Shards
//! - [`blockchain`] - Ledger, mempool, transaction rules and block checks
//! - [`shard`] - Validator assignment, epochs and cross-shard reconciliation
//! - [`persistence`] - Block, epoch and account storage (SQLite)
//!
//! ## Node
//! - [`network`] - Messages and the transport seam
//! - [`sync`] - Orphan handling and bootstrap requests
//! - [`node`] - Startup and inbound dispatch
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Model
// ============================================================================
pub mod crypto;
pub mod protocol;

// ============================================================================
// Consensus
// ============================================================================
pub mod consensus;
pub mod miner;

// ============================================================================
// Chain & Shards
// ============================================================================
pub mod blockchain;
pub mod persistence;
pub mod shard;

// ============================================================================
// Node
// ============================================================================
pub mod network;
pub mod node;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
