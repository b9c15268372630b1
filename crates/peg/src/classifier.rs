//! Classification of registered bitcoin transactions and evaluation of
//! peg-ins.
//!
//! Two classification paths exist. The legacy path matches input redeem
//! scripts against federation scripts. Once the pegout sighash index is
//! active and past its grace period, outbound transactions are recognized
//! by the recorded signature hash of their first input instead.

use crate::constants::{BridgeConstants, ConsensusRule, ForBlock};
use crate::federation::{strip_flyover_prefix, Federation};
use crate::pegin::{PeginInformation, PeginParseError};
use crate::release::signatures::{first_input_sighash, input_redeem_script};
use crate::storage::SighashKey;
use crate::wallet::{FederationWallet, ScriptStrategy, UtxoProvider};
use crate::Error;
use bitcoin::{ScriptBuf, Transaction, TxOut};
use serde_derive::{Deserialize, Serialize};
use strum::IntoStaticStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PegTxType {
    Pegin,
    PegoutOrMigration,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RejectedPeginReason {
    InvalidPayload,
    BelowMinimum,
    LockingCapExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeginProcessAction {
    CanBeRegistered(PeginInformation),
    CanBeRefunded {
        reason: RejectedPeginReason,
        refund_script: ScriptBuf,
    },
    CannotBeProcessed(RejectedPeginReason),
}

/// Federations and rules a transaction is classified against.
#[derive(Debug, Clone, Copy)]
pub struct PegContext<'a> {
    pub active_federation: &'a Federation,
    pub retiring_federation: Option<&'a Federation>,
    pub retired_p2sh_script: Option<&'a ScriptBuf>,
    pub constants: &'a BridgeConstants,
    pub activations: &'a ForBlock,
    /// Known flyover derivation hashes, honored once flyover scripts are active.
    pub flyover_derivation_hashes: &'a [[u8; 32]],
}

impl<'a> PegContext<'a> {
    pub fn live_federations(&self) -> Vec<&'a Federation> {
        std::iter::once(self.active_federation)
            .chain(self.retiring_federation)
            .collect()
    }

    pub fn minimum_pegin_value(&self) -> u64 {
        if self.activations.is_active(ConsensusRule::PerOutputMinimumPegin) {
            self.constants.minimum_pegin_value
        } else {
            self.constants.legacy_minimum_pegin_value
        }
    }

    /// Which federation scripts wallets built in this context recognize.
    pub fn script_strategy(&self) -> ScriptStrategy {
        if self.activations.is_active(ConsensusRule::FlyoverScripts)
            && !self.flyover_derivation_hashes.is_empty()
        {
            ScriptStrategy::FlyoverCompatible {
                derivation_hashes: self.flyover_derivation_hashes.to_vec(),
            }
        } else {
            ScriptStrategy::Standard
        }
    }

    /// Scripts whose funds only the federations (past or present) can move.
    fn custodial_scripts(&self) -> Vec<ScriptBuf> {
        self.live_federations()
            .into_iter()
            .map(|federation| federation.p2sh_script().clone())
            .chain(self.retired_p2sh_script.cloned())
            .collect()
    }

    fn retiring_scripts(&self) -> Vec<ScriptBuf> {
        self.retiring_federation
            .map(|federation| federation.p2sh_script().clone())
            .into_iter()
            .chain(self.retired_p2sh_script.cloned())
            .collect()
    }

    fn outputs_to_live_federations<'t>(&self, tx: &'t Transaction) -> Result<Vec<&'t TxOut>, Error> {
        let wallet = FederationWallet::new(
            &self.live_federations(),
            UtxoProvider::WatchOnly,
            self.script_strategy(),
        )?;
        Ok(wallet
            .outputs_to_me(tx)
            .into_iter()
            .map(|(_, txout)| txout)
            .collect())
    }
}

/// P2SH script of the redeem script spent by each input.
fn spent_scripts(tx: &Transaction, activations: &ForBlock) -> Vec<ScriptBuf> {
    tx.input
        .iter()
        .filter_map(input_redeem_script)
        .map(|redeem_script| {
            let standard = if activations.is_active(ConsensusRule::FlyoverScripts) {
                strip_flyover_prefix(&redeem_script).unwrap_or(redeem_script)
            } else {
                redeem_script
            };
            ScriptBuf::new_p2sh(&standard.script_hash())
        })
        .collect()
}

fn spends_from(tx: &Transaction, scripts: &[ScriptBuf], activations: &ForBlock) -> bool {
    spent_scripts(tx, activations)
        .iter()
        .any(|spent| scripts.contains(spent))
}

/// Some input spends funds of a live or retired federation.
pub fn is_pegout_tx(tx: &Transaction, ctx: &PegContext) -> bool {
    spends_from(tx, &ctx.custodial_scripts(), ctx.activations)
}

/// Funds of the retiring (or last retired) federation move to the active one.
pub fn is_migration_tx(tx: &Transaction, ctx: &PegContext) -> bool {
    let retiring = ctx.retiring_scripts();
    if retiring.is_empty() || !spends_from(tx, &retiring, ctx.activations) {
        return false;
    }
    tx.output
        .iter()
        .any(|txout| txout.script_pubkey == *ctx.active_federation.p2sh_script())
}

/// Sends enough to a live federation without spending federation funds.
pub fn is_valid_pegin_tx(tx: &Transaction, ctx: &PegContext) -> Result<bool, Error> {
    if is_pegout_tx(tx, ctx) {
        return Ok(false);
    }
    let outputs = ctx.outputs_to_live_federations(tx)?;
    if outputs.is_empty() {
        return Ok(false);
    }
    let minimum = ctx.minimum_pegin_value();
    Ok(if ctx.activations.is_active(ConsensusRule::PerOutputMinimumPegin) {
        outputs.iter().all(|txout| txout.value >= minimum)
    } else {
        outputs.iter().map(|txout| txout.value).sum::<u64>() >= minimum
    })
}

pub fn legacy_transaction_type(tx: &Transaction, ctx: &PegContext) -> Result<PegTxType, Error> {
    Ok(if is_valid_pegin_tx(tx, ctx)? {
        PegTxType::Pegin
    } else if is_migration_tx(tx, ctx) || is_pegout_tx(tx, ctx) {
        PegTxType::PegoutOrMigration
    } else {
        PegTxType::Unknown
    })
}

/// Whether transactions at `btc_height` are classified with the sighash index.
pub fn uses_pegout_tx_index(ctx: &PegContext, btc_height: u32) -> bool {
    let start = ctx
        .constants
        .pegout_tx_index_activation_btc_height
        .saturating_add(ctx.constants.pegout_tx_index_grace_period);
    ctx.activations.is_active(ConsensusRule::PegoutTxIndex) && btc_height >= start
}

pub fn transaction_type<F>(
    tx: &Transaction,
    btc_height: u32,
    ctx: &PegContext,
    mut is_known_pegout_sighash: F,
) -> Result<PegTxType, Error>
where
    F: FnMut(&SighashKey) -> Result<bool, Error>,
{
    if !uses_pegout_tx_index(ctx, btc_height) {
        let tx_type = legacy_transaction_type(tx, ctx)?;
        debug!("[btctx:{}] legacy classification {:?}", tx.txid(), tx_type);
        return Ok(tx_type);
    }

    if let Some(sighash) = first_input_sighash(tx) {
        if is_known_pegout_sighash(&sighash)? {
            return Ok(PegTxType::PegoutOrMigration);
        }
    }
    if ctx.outputs_to_live_federations(tx)?.is_empty() {
        return Ok(PegTxType::Unknown);
    }
    if spends_from(tx, &ctx.retiring_scripts(), ctx.activations) {
        return Ok(PegTxType::PegoutOrMigration);
    }
    Ok(PegTxType::Pegin)
}

fn reject(
    reason: RejectedPeginReason,
    refund_script: Option<ScriptBuf>,
    activations: &ForBlock,
) -> PeginProcessAction {
    match refund_script {
        Some(refund_script) if activations.is_active(ConsensusRule::PeginRefunds) => {
            PeginProcessAction::CanBeRefunded {
                reason,
                refund_script,
            }
        }
        _ => PeginProcessAction::CannotBeProcessed(reason),
    }
}

/// Decides what happens to the funds of a peg-in. `custodied_balance` is
/// what the live federations hold before this transaction.
pub fn evaluate_pegin(
    tx: &Transaction,
    ctx: &PegContext,
    information: Result<PeginInformation, PeginParseError>,
    sender_refund_script: Option<ScriptBuf>,
    locking_cap: u64,
    custodied_balance: u64,
) -> Result<PeginProcessAction, Error> {
    let information = match information {
        Ok(information) => information,
        Err(err) => {
            debug!("[btctx:{}] unparseable pegin: {err}", tx.txid());
            return Ok(reject(
                RejectedPeginReason::InvalidPayload,
                sender_refund_script,
                ctx.activations,
            ));
        }
    };
    let refund_script = information.refund_destination().cloned();

    let live = ctx.live_federations();
    let wallet = FederationWallet::new(&live, UtxoProvider::WatchOnly, ctx.script_strategy())?;
    let outputs = wallet.outputs_to_me(tx);
    let amount = wallet.value_sent_to_me(tx);
    let minimum = ctx.minimum_pegin_value();
    let below_minimum = if ctx.activations.is_active(ConsensusRule::PerOutputMinimumPegin) {
        outputs.is_empty() || outputs.iter().any(|(_, txout)| txout.value < minimum)
    } else {
        amount < minimum
    };
    if below_minimum {
        return Ok(reject(
            RejectedPeginReason::BelowMinimum,
            refund_script,
            ctx.activations,
        ));
    }

    if ctx.activations.is_active(ConsensusRule::LockingCap)
        && custodied_balance.saturating_add(amount) > locking_cap
    {
        return Ok(reject(
            RejectedPeginReason::LockingCapExceeded,
            refund_script,
            ctx.activations,
        ));
    }

    Ok(PeginProcessAction::CanBeRegistered(information))
}
