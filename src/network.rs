//! Messages exchanged between validators and the transport seam that
//! carries them.
//!
//! Payloads travel as the model encodings (`Codec`, or the fixed layouts of
//! the transaction types); decoding happens in the node's dispatcher so a
//! malformed payload is dropped there with a log line.

pub mod local;

pub use local::{LocalNetwork, LocalTransport};

use crate::error::Result;
use crate::protocol::{Hash, TxKind};
use std::fmt;
use tokio::sync::mpsc::UnboundedReceiver;

/// Identity of a peer on the transport. Validators use their address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub [u8; 32]);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::protocol::short_hex(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Block(Vec<u8>),
    EpochBlock(Vec<u8>),
    Transaction { kind: TxKind, payload: Vec<u8> },
    StateTransition(Vec<u8>),
    TransactionPayload(Vec<u8>),
    ValidatorShardMapping(Vec<u8>),
    Genesis(Vec<u8>),
    BlockRequest(Hash),
    ValidatorShardMapRequest,
    /// `None` asks for the latest epoch block.
    EpochBlockRequest(Option<Hash>),
    GenesisRequest,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Block(_) => "block",
            Message::EpochBlock(_) => "epoch_block",
            Message::Transaction { .. } => "transaction",
            Message::StateTransition(_) => "state_transition",
            Message::TransactionPayload(_) => "transaction_payload",
            Message::ValidatorShardMapping(_) => "validator_shard_mapping",
            Message::Genesis(_) => "genesis",
            Message::BlockRequest(_) => "block_request",
            Message::ValidatorShardMapRequest => "validator_shard_map_request",
            Message::EpochBlockRequest(_) => "epoch_block_request",
            Message::GenesisRequest => "genesis_request",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::BlockRequest(_)
                | Message::ValidatorShardMapRequest
                | Message::EpochBlockRequest(_)
                | Message::GenesisRequest
        )
    }
}

/// An inbound message together with the peer that sent it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: PeerId,
    pub message: Message,
}

pub type Inbox = UnboundedReceiver<Envelope>;

/// Outbound side of the network. Sends never block; inbound traffic is
/// delivered through the [`Inbox`] handed out when the transport was created.
pub trait Transport: Send + Sync {
    fn local_id(&self) -> PeerId;

    /// Sends to every other peer.
    fn broadcast(&self, message: Message) -> Result<()>;

    fn send(&self, peer: &PeerId, message: Message) -> Result<()>;

    /// Asks the network for data; answers arrive in the inbox like any
    /// other message.
    fn request(&self, message: Message) -> Result<()> {
        self.broadcast(message)
    }
}
