//! Resolution of the active and retiring federation from the three
//! federation references.

use crate::constants::{BridgeConstants, ConsensusRule, ForBlock};
use crate::federation::Federation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederationReference {
    None,
    New,
    Old,
    Genesis,
}

/// The stored UTXO list backing a federation reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtxoSlot {
    New,
    Old,
}

pub fn federation_activation_age(constants: &BridgeConstants, activations: &ForBlock) -> u64 {
    if activations.is_active(ConsensusRule::FederationActivationAge) {
        constants.federation_activation_age
    } else {
        constants.legacy_federation_activation_age
    }
}

/// Borrowed view over the federation references at one height.
#[derive(Debug, Clone, Copy)]
pub struct FederationSlots<'a> {
    pub new: Option<&'a Federation>,
    pub old: Option<&'a Federation>,
    pub genesis: &'a Federation,
    pub height: u64,
    pub activation_age: u64,
}

impl<'a> FederationSlots<'a> {
    fn is_new_old_enough(&self, new: &Federation) -> bool {
        self.height >= new.creation_block_number().saturating_add(self.activation_age)
    }

    pub fn active_reference(&self) -> FederationReference {
        match (self.new, self.old) {
            (None, _) => FederationReference::Genesis,
            (Some(_), None) => FederationReference::New,
            (Some(new), Some(_)) if self.is_new_old_enough(new) => FederationReference::New,
            (Some(_), Some(_)) => FederationReference::Old,
        }
    }

    pub fn retiring_reference(&self) -> FederationReference {
        match (self.new, self.old) {
            (Some(new), Some(_)) if self.is_new_old_enough(new) => FederationReference::Old,
            _ => FederationReference::None,
        }
    }

    /// Both references exist and the new federation is still too young.
    pub fn is_awaiting_activation(&self) -> bool {
        matches!((self.new, self.old), (Some(new), Some(_)) if !self.is_new_old_enough(new))
    }

    pub fn active_federation(&self) -> &'a Federation {
        match self.active_reference() {
            FederationReference::Old => self.old.unwrap_or(self.genesis),
            FederationReference::New => self.new.unwrap_or(self.genesis),
            FederationReference::Genesis | FederationReference::None => self.genesis,
        }
    }

    pub fn retiring_federation(&self) -> Option<&'a Federation> {
        match self.retiring_reference() {
            FederationReference::Old => self.old,
            _ => None,
        }
    }

    /// The committed federation that is not active yet.
    pub fn proposed_federation(&self) -> Option<&'a Federation> {
        if self.is_awaiting_activation() {
            self.new
        } else {
            None
        }
    }

    /// Genesis funds live in the new slot until the first commit moves them.
    pub fn active_utxo_slot(&self) -> UtxoSlot {
        match self.active_reference() {
            FederationReference::Old => UtxoSlot::Old,
            _ => UtxoSlot::New,
        }
    }

    pub fn retiring_utxo_slot(&self) -> Option<UtxoSlot> {
        match self.retiring_reference() {
            FederationReference::Old => Some(UtxoSlot::Old),
            _ => None,
        }
    }

    pub fn live_federations(&self) -> Vec<&'a Federation> {
        std::iter::once(self.active_federation())
            .chain(self.retiring_federation())
            .collect()
    }
}
