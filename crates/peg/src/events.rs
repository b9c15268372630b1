use crate::classifier::RejectedPeginReason;
use crate::federation::Federation;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, Transaction, Txid};
use ethers_core::types::{Address, H256};
use strum::IntoStaticStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RejectedPegoutReason {
    LowAmount,
    CallerContract,
}

/// Auditable trail of bridge state transitions.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum BridgeEvent {
    UpdateCollections {
        sender: Address,
    },
    CommitFederation {
        old_federation: Federation,
        new_federation: Federation,
        activation_height: u64,
    },
    AddSignature {
        federator: PublicKey,
        rsk_tx_hash: H256,
    },
    /// A release transaction collected enough signatures to be broadcast.
    ReleaseBtc {
        rsk_tx_hash: H256,
        transaction: Transaction,
    },
    ReleaseRequested {
        rsk_tx_hash: Option<H256>,
        btc_txid: Txid,
        amount: u64,
    },
    ReleaseRequestReceived {
        sender: Address,
        destination: ScriptBuf,
        amount: u64,
    },
    ReleaseRequestRejected {
        sender: Address,
        amount: u64,
        reason: RejectedPegoutReason,
    },
    PeginBtc {
        recipient: Address,
        btc_txid: Txid,
        amount: u64,
    },
    RejectedPegin {
        btc_txid: Txid,
        reason: RejectedPeginReason,
    },
    UnrefundablePegin {
        btc_txid: Txid,
        reason: RejectedPeginReason,
    },
    BatchPegoutCreated {
        btc_txid: Txid,
        rsk_tx_hashes: Vec<H256>,
    },
    PegoutConfirmed {
        btc_txid: Txid,
        creation_block_number: u64,
    },
}

pub trait BridgeEventLogger {
    fn log(&mut self, event: BridgeEvent);
}

/// Keeps every logged event in order.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventLogger {
    events: Vec<BridgeEvent>,
}

impl RecordingEventLogger {
    pub fn events(&self) -> &[BridgeEvent] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<BridgeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .iter()
            .filter(|event| <&'static str>::from(*event) == name)
            .count()
    }
}

impl BridgeEventLogger for RecordingEventLogger {
    fn log(&mut self, event: BridgeEvent) {
        self.events.push(event);
    }
}
