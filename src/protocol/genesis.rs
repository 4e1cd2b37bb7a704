use super::{short_hex, Codec, FieldHasher, Hash};
use crate::crypto::{Address, CommitmentKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Written once at first start; identifies the root account of the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub root_address: Address,
    pub root_commitment: CommitmentKey,
}

impl Genesis {
    pub fn new(root_address: Address, root_commitment: CommitmentKey) -> Self {
        Genesis {
            root_address,
            root_commitment,
        }
    }

    pub fn hash(&self) -> Hash {
        FieldHasher::new("genesis")
            .bytes(&self.root_address)
            .bytes(&self.root_commitment)
            .finish()
    }
}

impl Codec for Genesis {}

impl fmt::Display for Genesis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Genesis {{ root: {}, commitment: {} }}",
            short_hex(&self.root_address),
            short_hex(&self.root_commitment)
        )
    }
}
