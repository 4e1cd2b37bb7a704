//! Transaction types and the common view the ledger and mempool work with.

mod acc;
mod funds;
mod iot;
mod stake;

pub use acc::AccTx;
pub use funds::{FundsTx, FUNDSTX_SIZE};
pub use iot::IotTx;
pub use stake::{StakeTx, STAKETX_SIZE};

use super::{Codec, Hash};
use crate::crypto::{self, Address};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction family, used to route wire payloads and to order application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Acc,
    Funds,
    Stake,
    Iot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Acc(AccTx),
    Funds(FundsTx),
    Stake(StakeTx),
    Iot(IotTx),
}

impl Transaction {
    pub fn kind(&self) -> TxKind {
        match self {
            Transaction::Acc(_) => TxKind::Acc,
            Transaction::Funds(_) => TxKind::Funds,
            Transaction::Stake(_) => TxKind::Stake,
            Transaction::Iot(_) => TxKind::Iot,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            Transaction::Acc(tx) => tx.hash(),
            Transaction::Funds(tx) => tx.hash(),
            Transaction::Stake(tx) => tx.hash(),
            Transaction::Iot(tx) => tx.hash(),
        }
    }

    /// The account that signs the transaction and decides its shard.
    pub fn sender(&self) -> Address {
        match self {
            Transaction::Acc(tx) => tx.issuer,
            Transaction::Funds(tx) => tx.from,
            Transaction::Stake(tx) => tx.account,
            Transaction::Iot(tx) => tx.from,
        }
    }

    pub fn fee(&self) -> u64 {
        match self {
            Transaction::Acc(tx) => tx.fee,
            Transaction::Funds(tx) => tx.fee,
            Transaction::Stake(tx) => tx.fee,
            Transaction::Iot(_) => 0,
        }
    }

    pub fn signature(&self) -> &crypto::Signature {
        match self {
            Transaction::Acc(tx) => &tx.sig,
            Transaction::Funds(tx) => &tx.sig,
            Transaction::Stake(tx) => &tx.sig,
            Transaction::Iot(tx) => &tx.sig,
        }
    }

    /// Checks the signature of the sender over the transaction hash.
    pub fn verify_signature(&self) -> Result<()> {
        crypto::verify_signature(&self.sender(), &self.hash(), self.signature())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Transaction::Acc(tx) => tx.encode(),
            Transaction::Funds(tx) => tx.encode(),
            Transaction::Stake(tx) => tx.encode(),
            Transaction::Iot(tx) => tx.encode(),
        }
    }

    pub fn decode(kind: TxKind, bytes: &[u8]) -> Result<Self> {
        Ok(match kind {
            TxKind::Acc => Transaction::Acc(AccTx::decode(bytes)?),
            TxKind::Funds => Transaction::Funds(FundsTx::decode(bytes)?),
            TxKind::Stake => Transaction::Stake(StakeTx::decode(bytes)?),
            TxKind::Iot => Transaction::Iot(IotTx::decode(bytes)?),
        })
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transaction::Acc(tx) => fmt::Display::fmt(tx, f),
            Transaction::Funds(tx) => fmt::Display::fmt(tx, f),
            Transaction::Stake(tx) => fmt::Display::fmt(tx, f),
            Transaction::Iot(tx) => fmt::Display::fmt(tx, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_signature_excluded_from_hash() {
        let key = KeyPair::from_secret_bytes(&[1u8; 32]).unwrap();
        let tx = FundsTx::new(1, 10, 1, 0, &key, [5u8; 32]);
        let mut tampered = tx.clone();
        tampered.sig = [9u8; 64];
        assert_eq!(tx.hash(), tampered.hash());

        let tx = Transaction::Funds(tx);
        assert!(tx.verify_signature().is_ok());
        assert!(Transaction::Funds(tampered).verify_signature().is_err());
    }

    #[test]
    fn test_decode_by_kind() {
        let key = KeyPair::from_secret_bytes(&[2u8; 32]).unwrap();
        let tx = Transaction::Iot(IotTx::new(0, 3, &key, [7u8; 32], b"sensor".to_vec()));
        let bytes = tx.encode().unwrap();
        assert_eq!(Transaction::decode(TxKind::Iot, &bytes).unwrap(), tx);
        assert!(Transaction::decode(TxKind::Stake, &bytes).is_err());
    }
}
