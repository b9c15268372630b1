//! Consensus logic for a federated two-way peg between a bitcoin-style UTXO
//! chain and an account-based chain.
//!
//! Every operation in this crate is deterministic: the same storage contents,
//! constants and inputs always produce the same state transitions, so that
//! independent validating nodes agree byte-for-byte.

pub mod bridge;
pub mod btc_chain;
pub mod classifier;
pub mod constants;
pub mod election;
pub mod events;
pub mod federation;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod pegin;
pub mod release;
pub mod storage;
pub mod wallet;

pub use bitcoin;
pub use ethers_core;

pub use bridge::{BridgeSupport, Collaborators, ExecutionBlock};
pub use constants::{ActivationConfig, BridgeConstants, ConsensusRule, ForBlock};
pub use federation::{Federation, FederationMember, PendingFederation};

use ethers_core::types::U256;
use thiserror::Error;

const WEI_PER_SATOSHI: u64 = 10_000_000_000;

pub fn wei_to_sats(wei: U256) -> u64 {
    // eth has 18 decimals, bitcoin 8 --> div by 10^10
    let sats = wei / U256::from(WEI_PER_SATOSHI);
    if sats > U256::from(u64::MAX) {
        u64::MAX
    } else {
        sats.low_u64()
    }
}

pub fn sats_to_wei(sats: u64) -> U256 {
    U256::from(sats) * U256::from(WEI_PER_SATOSHI)
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Invalid merkle proof: {0}")]
    InvalidMerkleProof(String),
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid federation: {0}")]
    InvalidFederation(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Encoding error: {0}")]
    Encoding(#[from] rmp_serde::encode::Error),
    #[error("Decoding error: {0}")]
    Decoding(#[from] rmp_serde::decode::Error),
    #[error("Config parsing error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Block store error: {0}")]
    BlockStore(String),
    #[error("Signature hash error: {0}")]
    Sighash(#[from] bitcoin::sighash::Error),
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}
