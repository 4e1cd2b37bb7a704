use crate::crypto::{Address, KeyPair, Signature};
use crate::protocol::{short_hex, Codec, FieldHasher, Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::fmt;

/// Account creation. Only the genesis root may issue it.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccTx {
    pub header: u8,
    pub issuer: Address,
    pub fee: u64,
    pub pub_key: Address,
    #[serde_as(as = "Bytes")]
    pub sig: Signature,
    pub contract: Vec<u8>,
    pub contract_variables: Vec<Vec<u8>>,
}

impl AccTx {
    /// Builds an account creation for `pub_key`, signed by the root key.
    pub fn new(header: u8, fee: u64, pub_key: Address, root: &KeyPair) -> Self {
        Self::with_contract(header, fee, pub_key, root, Vec::new(), Vec::new())
    }

    pub fn with_contract(
        header: u8,
        fee: u64,
        pub_key: Address,
        root: &KeyPair,
        contract: Vec<u8>,
        contract_variables: Vec<Vec<u8>>,
    ) -> Self {
        let mut tx = AccTx {
            header,
            issuer: root.address(),
            fee,
            pub_key,
            sig: [0u8; 64],
            contract,
            contract_variables,
        };
        tx.sig = root.sign(&tx.hash());
        tx
    }

    pub fn hash(&self) -> Hash {
        let mut hasher = FieldHasher::new("acc_tx")
            .u8(self.header)
            .bytes(&self.issuer)
            .u64(self.fee)
            .bytes(&self.pub_key)
            .var_bytes(&self.contract)
            .u64(self.contract_variables.len() as u64);
        for variable in &self.contract_variables {
            hasher = hasher.var_bytes(variable);
        }
        hasher.finish()
    }
}

impl Codec for AccTx {}

impl fmt::Display for AccTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AccTx {{ issuer: {}, fee: {}, pub_key: {}, contract: {} bytes }}",
            short_hex(&self.issuer),
            self.fee,
            short_hex(&self.pub_key),
            self.contract.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_changes_hash() {
        let root = KeyPair::from_secret_bytes(&[1u8; 32]).unwrap();
        let plain = AccTx::new(0, 1, [3u8; 32], &root);
        let with_contract = AccTx::with_contract(0, 1, [3u8; 32], &root, vec![1], vec![]);
        assert_ne!(plain.hash(), with_contract.hash());
        assert_eq!(plain.issuer, root.address());
    }

    #[test]
    fn test_round_trip() {
        let root = KeyPair::from_secret_bytes(&[1u8; 32]).unwrap();
        let tx = AccTx::with_contract(2, 9, [3u8; 32], &root, vec![7, 7], vec![vec![1, 2]]);
        assert_eq!(AccTx::decode(&tx.encode().unwrap()).unwrap(), tx);
    }
}
