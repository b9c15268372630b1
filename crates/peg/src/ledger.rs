//! Account-chain side of the peg: the bridge holds the locked balance that
//! backs every custodied satoshi.

use crate::Error;
use ethers_core::types::{Address, U256};
use std::collections::BTreeMap;
use tracing::trace;

pub trait AccountLedger {
    /// Credits a registered peg-in to `recipient` from the bridge balance.
    fn transfer_to(&mut self, recipient: Address, amount: U256) -> Result<(), Error>;
    /// Returns value received with a rejected release request.
    fn refund(&mut self, recipient: Address, amount: U256) -> Result<(), Error>;
    /// Destroys bridge balance no longer backed on the UTXO chain.
    fn burn(&mut self, amount: U256) -> Result<(), Error>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryLedger {
    bridge_balance: U256,
    balances: BTreeMap<Address, U256>,
    burned: U256,
}

impl InMemoryLedger {
    pub fn new(bridge_balance: U256) -> Self {
        Self {
            bridge_balance,
            ..Default::default()
        }
    }

    pub fn bridge_balance(&self) -> U256 {
        self.bridge_balance
    }

    pub fn balance_of(&self, account: &Address) -> U256 {
        self.balances.get(account).copied().unwrap_or_default()
    }

    pub fn burned(&self) -> U256 {
        self.burned
    }

    fn debit_bridge(&mut self, amount: U256) -> Result<(), Error> {
        self.bridge_balance = self
            .bridge_balance
            .checked_sub(amount)
            .ok_or_else(|| Error::InvalidArgument(format!("bridge balance below {amount}")))?;
        Ok(())
    }

    fn credit(&mut self, account: Address, amount: U256) {
        let balance = self.balances.entry(account).or_default();
        *balance = balance.saturating_add(amount);
    }
}

impl AccountLedger for InMemoryLedger {
    fn transfer_to(&mut self, recipient: Address, amount: U256) -> Result<(), Error> {
        trace!("transfer {amount} to {recipient:?}");
        self.debit_bridge(amount)?;
        self.credit(recipient, amount);
        Ok(())
    }

    fn refund(&mut self, recipient: Address, amount: U256) -> Result<(), Error> {
        trace!("refund {amount} to {recipient:?}");
        self.debit_bridge(amount)?;
        self.credit(recipient, amount);
        Ok(())
    }

    fn burn(&mut self, amount: U256) -> Result<(), Error> {
        self.debit_bridge(amount)?;
        self.burned = self.burned.saturating_add(amount);
        Ok(())
    }
}
