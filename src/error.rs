//! Error types for EpochChain

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The parent a search was working on is no longer the chain head.
    #[error("Search superseded: {0}")]
    Superseded(String),
    #[error("Zero balance: validator {0} owns no coins")]
    ZeroBalance(String),
    #[error("Validator shard mapping not received within {0} seconds")]
    MappingTimeout(u64),
    #[error("Bootstrap sync timed out: {0}")]
    SyncTimeout(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Cryptographic error: {0}")]
    Crypto(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl ChainError {
    /// Errors that abort the node instead of being logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainError::MappingTimeout(_)
                | ChainError::SyncTimeout(_)
                | ChainError::Config(_)
                | ChainError::Crypto(_)
        )
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::Decode(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::Store(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::Config(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
