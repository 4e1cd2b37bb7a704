//! Cryptographic primitives for EpochChain
//!
//! Validator identities, account addresses and commitment keys are all BIP-340
//! x-only public keys on secp256k1. Signatures and commitment proofs are the
//! 64-byte Schnorr signatures produced by those keys.

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{schnorr, All, Keypair, Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// An account address: the 32-byte x-only public key of the account.
pub type Address = [u8; 32];

/// Public half of a validator's commitment keypair.
pub type CommitmentKey = [u8; 32];

/// Proof mixed into the proof-of-stake input, bound to one block height.
pub type CommitmentProof = [u8; 64];

/// Transaction signature.
pub type Signature = [u8; 64];

pub const SIGNATURE_LENGTH: usize = 64;
pub const SECRET_KEY_LENGTH: usize = 32;

const COMMITMENT_DOMAIN: &[u8] = b"epochchain/commitment";

/// Convert an address to a hex string for display.
pub fn address_to_hex(addr: &Address) -> String {
    hex::encode(addr)
}

/// Convert a hex string to an address.
pub fn address_from_hex(hex_str: &str) -> Result<Address, ChainError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| ChainError::Crypto(format!("Invalid hex address: {}", e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ChainError::Crypto(format!("Address must be 32 bytes, got {}", b.len()))
    })
}

/// SHA-256 of arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    keypair: Keypair,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        KeyPair {
            keypair: Keypair::new(&SECP256K1_CONTEXT, &mut OsRng),
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() != SECRET_KEY_LENGTH {
            return Err(ChainError::Crypto(format!(
                "Secret key must be {} bytes, got {}",
                SECRET_KEY_LENGTH,
                bytes.len()
            )));
        }
        let keypair = Keypair::from_seckey_slice(&SECP256K1_CONTEXT, bytes)
            .map_err(|e| ChainError::Crypto(format!("Invalid secret key bytes: {}", e)))?;
        Ok(KeyPair { keypair })
    }

    /// Creates a KeyPair from a hex-encoded secret key.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| ChainError::Crypto(format!("Invalid hex secret key: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.keypair.secret_bytes()
    }

    /// The address of this key (its x-only public key).
    pub fn address(&self) -> Address {
        let (xonly, _parity) = self.keypair.x_only_public_key();
        xonly.serialize()
    }

    /// Signs the SHA-256 digest of `message`.
    ///
    /// Signing uses no auxiliary randomness, so the same key and message always
    /// produce the same signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let msg = Message::from_digest(sha256(message));
        SECP256K1_CONTEXT
            .sign_schnorr_no_aux_rand(&msg, &self.keypair)
            .serialize()
    }

    /// Commitment proof for `height`; only the holder of the commitment key
    /// can produce it and it is unique per height.
    pub fn commitment_proof(&self, height: u32) -> CommitmentProof {
        self.sign(&commitment_message(height))
    }
}

fn commitment_message(height: u32) -> Vec<u8> {
    let mut message = Vec::with_capacity(COMMITMENT_DOMAIN.len() + 4);
    message.extend_from_slice(COMMITMENT_DOMAIN);
    message.extend_from_slice(&height.to_be_bytes());
    message
}

/// Verifies a Schnorr signature over the SHA-256 digest of `message`.
pub fn verify_signature(
    public_key: &Address,
    message: &[u8],
    signature: &Signature,
) -> Result<(), ChainError> {
    let public_key = XOnlyPublicKey::from_slice(public_key)
        .map_err(|e| ChainError::Crypto(format!("Invalid public key: {}", e)))?;
    let signature = schnorr::Signature::from_slice(signature)
        .map_err(|e| ChainError::Crypto(format!("Invalid signature: {}", e)))?;
    let msg = Message::from_digest(sha256(message));

    SECP256K1_CONTEXT
        .verify_schnorr(&signature, &msg, &public_key)
        .map_err(|_| ChainError::Crypto("Signature verification failed".to_string()))
}

/// Checks that `proof` was produced by `commitment_key` for `height`.
pub fn verify_commitment_proof(
    commitment_key: &CommitmentKey,
    height: u32,
    proof: &CommitmentProof,
) -> Result<(), ChainError> {
    verify_signature(commitment_key, &commitment_message(height), proof)
}
