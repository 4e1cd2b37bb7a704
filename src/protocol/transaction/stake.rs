use crate::crypto::{Address, CommitmentKey, KeyPair, Signature};
use crate::error::Result;
use crate::protocol::{decode_flag, expect_len, read_array, short_hex, Codec, FieldHasher, Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::fmt;

/// Encoded size: header 0, fee 1..9, flag 9, account 10..42, sig 42..106,
/// commitment key 106..138.
pub const STAKETX_SIZE: usize = 138;

/// Joins or leaves the validator set.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeTx {
    pub header: u8,
    pub fee: u64,
    pub is_staking: bool,
    pub account: Address,
    #[serde_as(as = "Bytes")]
    pub sig: Signature,
    pub commitment_key: CommitmentKey,
}

impl StakeTx {
    /// Builds a stake transaction signed by `account`.
    pub fn new(
        header: u8,
        fee: u64,
        is_staking: bool,
        account: &KeyPair,
        commitment_key: CommitmentKey,
    ) -> Self {
        let mut tx = StakeTx {
            header,
            fee,
            is_staking,
            account: account.address(),
            sig: [0u8; 64],
            commitment_key,
        };
        tx.sig = account.sign(&tx.hash());
        tx
    }

    pub fn hash(&self) -> Hash {
        FieldHasher::new("stake_tx")
            .u8(self.header)
            .u64(self.fee)
            .u8(self.is_staking as u8)
            .bytes(&self.account)
            .bytes(&self.commitment_key)
            .finish()
    }
}

impl Codec for StakeTx {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut encoded = vec![0u8; STAKETX_SIZE];
        encoded[0] = self.header;
        encoded[1..9].copy_from_slice(&self.fee.to_be_bytes());
        encoded[9] = self.is_staking as u8;
        encoded[10..42].copy_from_slice(&self.account);
        encoded[42..106].copy_from_slice(&self.sig);
        encoded[106..138].copy_from_slice(&self.commitment_key);
        Ok(encoded)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, STAKETX_SIZE, "StakeTx")?;
        Ok(StakeTx {
            header: bytes[0],
            fee: u64::from_be_bytes(read_array(bytes, 1)?),
            is_staking: decode_flag(bytes[9])?,
            account: read_array(bytes, 10)?,
            sig: read_array(bytes, 42)?,
            commitment_key: read_array(bytes, 106)?,
        })
    }
}

impl fmt::Display for StakeTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StakeTx {{ header: {}, fee: {}, staking: {}, account: {}, commitment_key: {} }}",
            self.header,
            self.fee,
            self.is_staking,
            short_hex(&self.account),
            short_hex(&self.commitment_key)
        )
    }
}
