use crate::crypto::{Address, KeyPair, Signature};
use crate::protocol::{short_hex, Codec, FieldHasher, Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::fmt;

/// Data-carrying transaction. Carries no fee and moves no value.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IotTx {
    pub header: u8,
    pub tx_cnt: u32,
    pub from: Address,
    pub to: Address,
    #[serde_as(as = "Bytes")]
    pub sig: Signature,
    pub data: Vec<u8>,
}

impl IotTx {
    pub fn new(header: u8, tx_cnt: u32, from: &KeyPair, to: Address, data: Vec<u8>) -> Self {
        let mut tx = IotTx {
            header,
            tx_cnt,
            from: from.address(),
            to,
            sig: [0u8; 64],
            data,
        };
        tx.sig = from.sign(&tx.hash());
        tx
    }

    pub fn hash(&self) -> Hash {
        FieldHasher::new("iot_tx")
            .u8(self.header)
            .u32(self.tx_cnt)
            .bytes(&self.from)
            .bytes(&self.to)
            .var_bytes(&self.data)
            .finish()
    }
}

impl Codec for IotTx {}

impl fmt::Display for IotTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IotTx {{ tx_cnt: {}, from: {}, to: {}, data: {} bytes }}",
            self.tx_cnt,
            short_hex(&self.from),
            short_hex(&self.to),
            self.data.len()
        )
    }
}
