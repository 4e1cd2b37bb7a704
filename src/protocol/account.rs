use super::{Codec, FieldHasher, Hash};
use crate::crypto::{Address, CommitmentKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A ledger entry. Mutated only by block commit or reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub issuer: Address,
    pub balance: u64,
    pub tx_cnt: u32,
    pub is_staking: bool,
    pub commitment_key: CommitmentKey,
    pub staking_block_height: u32,
    pub contract: Vec<u8>,
    pub contract_variables: Vec<Vec<u8>>,
}

impl Account {
    pub fn new(address: Address, issuer: Address, balance: u64) -> Self {
        Account {
            address,
            issuer,
            balance,
            tx_cnt: 0,
            is_staking: false,
            commitment_key: [0u8; 32],
            staking_block_height: 0,
            contract: Vec::new(),
            contract_variables: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash {
        let mut hasher = FieldHasher::new("account")
            .bytes(&self.address)
            .bytes(&self.issuer)
            .u64(self.balance)
            .u32(self.tx_cnt)
            .u8(self.is_staking as u8)
            .bytes(&self.commitment_key)
            .u32(self.staking_block_height)
            .var_bytes(&self.contract)
            .u64(self.contract_variables.len() as u64);
        for variable in &self.contract_variables {
            hasher = hasher.var_bytes(variable);
        }
        hasher.finish()
    }
}

impl Codec for Account {}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Account {{ address: {}, balance: {}, tx_cnt: {}, staking: {} (since {}) }}",
            super::short_hex(&self.address),
            self.balance,
            self.tx_cnt,
            self.is_staking,
            self.staking_block_height
        )
    }
}

/// Per-block change of one account, as shipped to sibling shards.
///
/// Numeric fields are signed deltas; the staking flag, commitment key and
/// contract fields carry the absolute value after the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativeAccount {
    pub address: Address,
    pub issuer: Address,
    pub balance: i64,
    pub tx_cnt: i32,
    pub is_staking: bool,
    pub commitment_key: CommitmentKey,
    pub staking_block_height: i32,
    pub contract: Vec<u8>,
    pub contract_variables: Vec<Vec<u8>>,
}

impl RelativeAccount {
    pub fn is_noop(&self, current: &Account) -> bool {
        self.balance == 0
            && self.tx_cnt == 0
            && self.staking_block_height == 0
            && self.is_staking == current.is_staking
            && self.commitment_key == current.commitment_key
            && self.contract == current.contract
            && self.contract_variables == current.contract_variables
    }
}

impl Codec for RelativeAccount {}

impl fmt::Display for RelativeAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RelativeAccount {{ address: {}, balance: {:+}, tx_cnt: {:+}, staking: {} }}",
            super::short_hex(&self.address),
            self.balance,
            self.tx_cnt,
            self.is_staking
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_hash_covers_balance() {
        let a = Account::new([1u8; 32], [2u8; 32], 100);
        let mut b = a.clone();
        assert_eq!(a.hash(), b.hash());
        b.balance = 101;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_account_round_trip_with_contract() {
        let mut account = Account::new([1u8; 32], [2u8; 32], 5);
        account.contract = vec![0xde, 0xad];
        account.contract_variables = vec![vec![1], vec![], vec![2, 3]];
        account.is_staking = true;
        let decoded = Account::decode(&account.encode().unwrap()).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = Account::new([1u8; 32], [2u8; 32], 5).encode().unwrap();
        bytes.push(0);
        assert!(Account::decode(&bytes).is_err());
    }
}
