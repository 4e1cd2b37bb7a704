use crate::crypto::{Address, KeyPair, Signature};
use crate::error::Result;
use crate::protocol::{expect_len, read_array, short_hex, Codec, FieldHasher, Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::fmt;

/// Encoded size: header 0, amount 1..9, fee 9..17, tx_cnt 17..21, from 21..53,
/// to 53..85, sig 85..149.
pub const FUNDSTX_SIZE: usize = 149;

/// Value transfer between two existing accounts.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsTx {
    pub header: u8,
    pub amount: u64,
    pub fee: u64,
    pub tx_cnt: u32,
    pub from: Address,
    pub to: Address,
    #[serde_as(as = "Bytes")]
    pub sig: Signature,
}

impl FundsTx {
    /// Builds a transfer signed by `from`. `tx_cnt` must equal the sender's
    /// current transaction counter for the transfer to apply.
    pub fn new(header: u8, amount: u64, fee: u64, tx_cnt: u32, from: &KeyPair, to: Address) -> Self {
        let mut tx = FundsTx {
            header,
            amount,
            fee,
            tx_cnt,
            from: from.address(),
            to,
            sig: [0u8; 64],
        };
        tx.sig = from.sign(&tx.hash());
        tx
    }

    pub fn hash(&self) -> Hash {
        FieldHasher::new("funds_tx")
            .u8(self.header)
            .u64(self.amount)
            .u64(self.fee)
            .u32(self.tx_cnt)
            .bytes(&self.from)
            .bytes(&self.to)
            .finish()
    }
}

impl Codec for FundsTx {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut encoded = vec![0u8; FUNDSTX_SIZE];
        encoded[0] = self.header;
        encoded[1..9].copy_from_slice(&self.amount.to_be_bytes());
        encoded[9..17].copy_from_slice(&self.fee.to_be_bytes());
        encoded[17..21].copy_from_slice(&self.tx_cnt.to_be_bytes());
        encoded[21..53].copy_from_slice(&self.from);
        encoded[53..85].copy_from_slice(&self.to);
        encoded[85..149].copy_from_slice(&self.sig);
        Ok(encoded)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, FUNDSTX_SIZE, "FundsTx")?;
        Ok(FundsTx {
            header: bytes[0],
            amount: u64::from_be_bytes(read_array(bytes, 1)?),
            fee: u64::from_be_bytes(read_array(bytes, 9)?),
            tx_cnt: u32::from_be_bytes(read_array(bytes, 17)?),
            from: read_array(bytes, 21)?,
            to: read_array(bytes, 53)?,
            sig: read_array(bytes, 85)?,
        })
    }
}

impl fmt::Display for FundsTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FundsTx {{ amount: {}, fee: {}, tx_cnt: {}, from: {}, to: {} }}",
            self.amount,
            self.fee,
            self.tx_cnt,
            short_hex(&self.from),
            short_hex(&self.to)
        )
    }
}
