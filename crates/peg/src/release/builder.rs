use crate::constants::{ConsensusRule, ForBlock};
use crate::federation::{multisig_script_sig, Federation};
use crate::release::request_queue::ReleaseRequest;
use crate::wallet::{FederationWallet, SelectionError, Utxo};
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize;
use bitcoin::{ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use strum::IntoStaticStr;
use tracing::debug;

/// Outputs below this value are not relayed.
pub const MIN_NONDUST_OUTPUT: u64 = 546;
/// Version, counts and lock time of a small transaction.
const TX_OVERHEAD_SIZE: usize = 10;
/// Value, script length and a P2PKH/P2SH script.
const PEGOUT_OUTPUT_SIZE: usize = 34;

/// Why a release transaction could not be built this time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum BuildResponse {
    InsufficientMoney,
    CouldNotAdjustDownwards,
    DustySendRequested,
    ExceedMaxTransactionSize,
    UtxoProviderException,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// Unsigned; every input carries `OP_0` placeholders and its redeem script.
    pub transaction: Transaction,
    pub selected_utxos: Vec<Utxo>,
    pub fee: u64,
    /// Value of the change output, if any.
    pub change: Option<u64>,
    /// Value added to the change output to lift it over the dust limit.
    pub change_inflation: u64,
}

impl BuildResult {
    pub fn selected_value(&self) -> u64 {
        self.selected_utxos.iter().map(|utxo| utxo.value).sum()
    }
}

enum Spend {
    Target(u64),
    Everything,
}

pub fn estimate_pegout_size(federation: &Federation, inputs: usize, outputs: usize) -> usize {
    TX_OVERHEAD_SIZE + inputs * federation.spending_input_size() + outputs * PEGOUT_OUTPUT_SIZE
}

pub fn fee_for_size(fee_per_kb: u64, size: usize) -> u64 {
    fee_per_kb.saturating_mul(size as u64) / 1000
}

/// Builds unsigned release transactions from a federation wallet.
/// Recipients pay the fee, split evenly between them.
pub struct ReleaseTransactionBuilder<'w> {
    wallet: &'w FederationWallet,
    change_script: ScriptBuf,
    fee_per_kb: u64,
    max_transaction_size: usize,
    version: i32,
    migration_version: i32,
}

impl<'w> ReleaseTransactionBuilder<'w> {
    pub fn new(
        wallet: &'w FederationWallet,
        change_script: ScriptBuf,
        fee_per_kb: u64,
        max_transaction_size: usize,
        activations: &ForBlock,
    ) -> Self {
        let version = if activations.is_active(ConsensusRule::TransactionVersion2) {
            2
        } else {
            1
        };
        let migration_version = if activations.is_active(ConsensusRule::MigrationTransactionVersion2) {
            version
        } else {
            1
        };
        Self {
            wallet,
            change_script,
            fee_per_kb,
            max_transaction_size,
            version,
            migration_version,
        }
    }

    pub fn build_amount_to(
        &self,
        destination: &ScriptBuf,
        amount: u64,
    ) -> Result<BuildResult, BuildResponse> {
        let recipients = vec![TxOut {
            value: amount,
            script_pubkey: destination.clone(),
        }];
        self.build(recipients, Spend::Target(amount), &self.change_script, self.version)
    }

    pub fn build_batched_pegouts(
        &self,
        requests: &[ReleaseRequest],
    ) -> Result<BuildResult, BuildResponse> {
        let recipients = requests
            .iter()
            .map(|request| TxOut {
                value: request.amount,
                script_pubkey: request.destination.clone(),
            })
            .collect::<Vec<_>>();
        let total = recipients.iter().map(|txout| txout.value).sum();
        self.build(recipients, Spend::Target(total), &self.change_script, self.version)
    }

    /// Moves `value` to `destination`; any change goes there too.
    pub fn build_migration_transaction(
        &self,
        value: u64,
        destination: &ScriptBuf,
    ) -> Result<BuildResult, BuildResponse> {
        let recipients = vec![TxOut {
            value,
            script_pubkey: destination.clone(),
        }];
        self.build(recipients, Spend::Target(value), destination, self.migration_version)
    }

    /// Spends every UTXO of the wallet to `destination`.
    pub fn build_empty_wallet_to(&self, destination: &ScriptBuf) -> Result<BuildResult, BuildResponse> {
        let recipients = vec![TxOut {
            value: self.wallet.balance(),
            script_pubkey: destination.clone(),
        }];
        self.build(recipients, Spend::Everything, destination, self.version)
    }

    fn build(
        &self,
        mut recipients: Vec<TxOut>,
        spend: Spend,
        change_script: &ScriptBuf,
        version: i32,
    ) -> Result<BuildResult, BuildResponse> {
        if recipients.is_empty() {
            return Err(BuildResponse::InsufficientMoney);
        }
        if recipients.iter().any(|txout| txout.value < MIN_NONDUST_OUTPUT) {
            return Err(BuildResponse::DustySendRequested);
        }

        let (selected, remaining) = match spend {
            Spend::Target(target) => {
                let selection = self
                    .wallet
                    .select_coins(target, change_script)
                    .map_err(|err| match err {
                        SelectionError::InsufficientFunds { .. } => BuildResponse::InsufficientMoney,
                        SelectionError::Provider(_) => BuildResponse::UtxoProviderException,
                    })?;
                (selection.selected, selection.remaining)
            }
            Spend::Everything => (self.wallet.utxos().to_vec(), 0),
        };
        if selected.is_empty() {
            return Err(BuildResponse::InsufficientMoney);
        }

        // change below the dust limit is raised to it; the recipients cover the difference
        let (change, change_inflation) = match remaining {
            0 => (None, 0),
            dust if dust < MIN_NONDUST_OUTPUT => {
                (Some(MIN_NONDUST_OUTPUT), MIN_NONDUST_OUTPUT - dust)
            }
            change => (Some(change), 0),
        };

        let mut input = Vec::with_capacity(selected.len());
        let mut signed_inputs_size = 0;
        for utxo in &selected {
            let watched = self
                .wallet
                .watched_script(&utxo.script_pubkey)
                .ok_or(BuildResponse::UtxoProviderException)?;
            let placeholders = vec![vec![]; watched.threshold];
            let script_sig = multisig_script_sig(&placeholders, &watched.redeem_script)
                .map_err(|_| BuildResponse::UtxoProviderException)?;
            signed_inputs_size += watched.spending_input_size;
            input.push(TxIn {
                previous_output: utxo.outpoint,
                script_sig,
                sequence: Sequence::MAX,
                witness: Witness::default(),
            });
        }

        let num_recipients = recipients.len() as u64;
        let mut tx = Transaction {
            version,
            lock_time: LockTime::ZERO,
            input,
            output: recipients.clone(),
        };
        if let Some(value) = change {
            tx.output.push(TxOut {
                value,
                script_pubkey: change_script.clone(),
            });
        }

        let unsigned_inputs_size: usize = tx.input.iter().map(|txin| serialize(txin).len()).sum();
        let estimated_size = serialize(&tx).len() - unsigned_inputs_size + signed_inputs_size;
        if estimated_size > self.max_transaction_size {
            return Err(BuildResponse::ExceedMaxTransactionSize);
        }

        let fee = fee_for_size(self.fee_per_kb, estimated_size);
        let to_deduct = fee + change_inflation;
        // note: adding `num_recipients - 1` to get a rounded up division
        let per_recipient = (to_deduct + num_recipients - 1) / num_recipients;
        for recipient in recipients.iter_mut() {
            if recipient.value <= per_recipient {
                return Err(BuildResponse::CouldNotAdjustDownwards);
            }
            recipient.value -= per_recipient;
            if recipient.value < MIN_NONDUST_OUTPUT {
                return Err(BuildResponse::DustySendRequested);
            }
        }
        for (output, recipient) in tx.output.iter_mut().zip(recipients) {
            *output = recipient;
        }

        debug!(
            "built release {} spending {} inputs, fee {fee}, estimated size {estimated_size}",
            tx.txid(),
            selected.len()
        );

        Ok(BuildResult {
            transaction: tx,
            selected_utxos: selected,
            fee: per_recipient * num_recipients - change_inflation,
            change,
            change_inflation,
        })
    }
}
