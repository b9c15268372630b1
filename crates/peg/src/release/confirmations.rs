use bitcoin::Transaction;
use ethers_core::types::H256;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PegoutConfirmationEntry {
    pub transaction: Transaction,
    /// Account-chain height at which the transaction was built.
    pub creation_block_number: u64,
    pub rsk_tx_hash: Option<H256>,
}

impl PegoutConfirmationEntry {
    pub fn confirmations_at(&self, height: u64) -> u64 {
        height.saturating_sub(self.creation_block_number)
    }
}

/// Built release transactions waiting for enough account-chain
/// confirmations, in the order they were built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PegoutsWaitingForConfirmations {
    entries: Vec<PegoutConfirmationEntry>,
}

impl PegoutsWaitingForConfirmations {
    /// Adding a transaction that is already waiting is a no-op.
    pub fn add(
        &mut self,
        transaction: Transaction,
        creation_block_number: u64,
        rsk_tx_hash: Option<H256>,
    ) -> bool {
        if self
            .entries
            .iter()
            .any(|entry| entry.transaction == transaction)
        {
            return false;
        }
        self.entries.push(PegoutConfirmationEntry {
            transaction,
            creation_block_number,
            rsk_tx_hash,
        });
        true
    }

    pub fn entries(&self) -> &[PegoutConfirmationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The earliest added entry with at least `min_confirmations` at `height`.
    pub fn next_pegout_with_enough_confirmations(
        &self,
        height: u64,
        min_confirmations: u64,
    ) -> Option<&PegoutConfirmationEntry> {
        self.entries
            .iter()
            .find(|entry| entry.confirmations_at(height) >= min_confirmations)
    }

    pub fn remove_entry(&mut self, entry: &PegoutConfirmationEntry) -> bool {
        let before = self.entries.len();
        self.entries.retain(|candidate| candidate != entry);
        self.entries.len() != before
    }
}
