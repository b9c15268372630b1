//! The peg engine. `BridgeSupport` wraps the storage provider for one
//! execution block and drives every state transition of the peg: the
//! per-block collection update, registration of bitcoin transactions,
//! release requests, federator signatures and the governance votes.

use crate::btc_chain::{BlockHashCache, BtcChainView, BtcHeaderChain};
use crate::classifier::{self, PegContext, PegTxType, PeginProcessAction, RejectedPeginReason};
use crate::constants::{BridgeConstants, ConsensusRule, ForBlock};
use crate::election::{Authorizer, CallSpec, Election};
use crate::events::{BridgeEvent, BridgeEventLogger, RejectedPegoutReason};
use crate::federation::{Federation, FederationMember, KeyType, PendingFederation};
use crate::ledger::AccountLedger;
use crate::lifecycle::{federation_activation_age, FederationSlots, UtxoSlot};
use crate::metrics::{
    FEDERATION_CHANGE_VOTES, PEGIN_REGISTERED_SATS, PEGIN_TOTALS,
    PEGOUTS_WAITING_FOR_CONFIRMATIONS, PEGOUTS_WAITING_FOR_SIGNATURES, RELEASE_BUILD_FAILURES,
    RELEASE_QUEUE_LENGTH, RELEASE_REQUEST_TOTALS, RELEASE_TRANSACTIONS_BUILT, SIGNATURE_TOTALS,
};
use crate::pegin::{self, PeginInformationParser};
use crate::release::builder::{
    estimate_pegout_size, fee_for_size, BuildResponse, BuildResult, ReleaseTransactionBuilder,
    MIN_NONDUST_OUTPUT,
};
use crate::release::request_queue::BatchAttempt;
use crate::release::signatures::{
    first_input_sighash, input_redeem_script, verify_federator_signatures, SignatureRejection,
};
use crate::storage::{BridgeStorageProvider, Storage};
use crate::wallet::{FederationWallet, ScriptStrategy, Utxo, UtxoProvider};
use crate::{sats_to_wei, wei_to_sats, Error};
use bitcoin::consensus::encode::deserialize;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::merkle_tree::PartialMerkleTree;
use bitcoin::secp256k1::{PublicKey, Secp256k1, VerifyOnly};
use bitcoin::{Address as BtcAddress, ScriptBuf, Transaction, Txid};
use ethers_core::types::{Address, H256, U256};
use strum::IntoStaticStr;
use tracing::{debug, info, trace, warn};

const CREATE_FUNCTION: &str = "create";
const ADD_FUNCTION: &str = "add";
const ADD_MULTI_FUNCTION: &str = "add-multi";
const COMMIT_FUNCTION: &str = "commit";
const ROLLBACK_FUNCTION: &str = "rollback";
const SET_FEE_PER_KB_FUNCTION: &str = "setFeePerKb";

/// The account-chain block the bridge is executing in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionBlock {
    pub number: u64,
    pub timestamp_millis: u64,
}

/// Everything the bridge reads from or writes to outside its own storage.
pub struct Collaborators<'a> {
    pub storage: &'a mut dyn Storage,
    pub btc_chain: &'a dyn BtcHeaderChain,
    pub block_hash_cache: &'a mut BlockHashCache,
    pub ledger: &'a mut dyn AccountLedger,
    pub events: &'a mut dyn BridgeEventLogger,
    pub pegin_parser: &'a dyn PeginInformationParser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Account(Address),
    Contract(Address),
}

impl Caller {
    pub fn address(&self) -> Address {
        match self {
            Caller::Account(address) | Caller::Contract(address) => *address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RegisterOutcome {
    AlreadyProcessed,
    NotInProof,
    NotEnoughConfirmations,
    MerkleRootMismatch,
    UnknownTransaction,
    PeginRegistered { amount: u64 },
    PeginRefunded(RejectedPeginReason),
    PeginUnrefundable(RejectedPeginReason),
    PegoutOrMigrationRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseRequestResult {
    Queued,
    Rejected(RejectedPegoutReason),
}

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum SignatureOutcome {
    NotFederationMember,
    UnknownTransaction,
    Rejected(SignatureRejection),
    AlreadySigned,
    Accepted,
    /// The last required signature arrived; carries the broadcastable transaction.
    Complete(Transaction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FederationChangeResult {
    Success,
    PendingFederationExists,
    AwaitingActivation,
    RetiringFederationExists,
    NoPendingFederation,
    KeyAlreadyPresent,
    IncompletePendingFederation,
    HashMismatch,
    GenericError,
}

impl FederationChangeResult {
    pub fn code(&self) -> i32 {
        match self {
            FederationChangeResult::Success => 1,
            FederationChangeResult::PendingFederationExists
            | FederationChangeResult::NoPendingFederation => -1,
            FederationChangeResult::AwaitingActivation
            | FederationChangeResult::KeyAlreadyPresent
            | FederationChangeResult::IncompletePendingFederation => -2,
            FederationChangeResult::RetiringFederationExists
            | FederationChangeResult::HashMismatch => -3,
            FederationChangeResult::GenericError => -10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeePerKbChangeResult {
    Success,
    Unauthorized,
    NonPositiveFee,
    ExcessiveFee,
    VoteRejected,
}

/// Owned copy of the federation references, so lookups can be borrowed
/// while the provider is mutated.
struct FederationRefs {
    new: Option<Federation>,
    old: Option<Federation>,
    genesis: Federation,
    retired_p2sh_script: Option<ScriptBuf>,
    height: u64,
    activation_age: u64,
    flyover_derivation_hashes: Vec<[u8; 32]>,
}

impl FederationRefs {
    fn slots(&self) -> FederationSlots<'_> {
        FederationSlots {
            new: self.new.as_ref(),
            old: self.old.as_ref(),
            genesis: &self.genesis,
            height: self.height,
            activation_age: self.activation_age,
        }
    }

    fn context<'c>(&'c self, constants: &'c BridgeConstants, activations: &'c ForBlock) -> PegContext<'c> {
        let slots = self.slots();
        PegContext {
            active_federation: slots.active_federation(),
            retiring_federation: slots.retiring_federation(),
            retired_p2sh_script: self.retired_p2sh_script.as_ref(),
            constants,
            activations,
            flyover_derivation_hashes: &self.flyover_derivation_hashes,
        }
    }

    fn script_strategy(&self, constants: &BridgeConstants, activations: &ForBlock) -> ScriptStrategy {
        self.context(constants, activations).script_strategy()
    }

    /// Active federation first, then the retiring one, with their UTXO slots.
    fn live_slots(&self) -> Vec<(&Federation, UtxoSlot)> {
        let slots = self.slots();
        std::iter::once((slots.active_federation(), slots.active_utxo_slot()))
            .chain(slots.retiring_federation().zip(slots.retiring_utxo_slot()))
            .collect()
    }
}

pub struct BridgeSupport<'a> {
    constants: &'a BridgeConstants,
    block: ExecutionBlock,
    activations: ForBlock,
    genesis: Federation,
    provider: BridgeStorageProvider<'a>,
    btc_chain: &'a dyn BtcHeaderChain,
    block_hash_cache: &'a mut BlockHashCache,
    ledger: &'a mut dyn AccountLedger,
    events: &'a mut dyn BridgeEventLogger,
    pegin_parser: &'a dyn PeginInformationParser,
    secp: Secp256k1<VerifyOnly>,
}

impl<'a> BridgeSupport<'a> {
    pub fn new(
        constants: &'a BridgeConstants,
        block: ExecutionBlock,
        collaborators: Collaborators<'a>,
    ) -> Result<Self, Error> {
        Ok(Self {
            constants,
            activations: constants.activations.for_block(block.number),
            genesis: constants.genesis_federation()?,
            block,
            provider: BridgeStorageProvider::new(collaborators.storage),
            btc_chain: collaborators.btc_chain,
            block_hash_cache: collaborators.block_hash_cache,
            ledger: collaborators.ledger,
            events: collaborators.events,
            pegin_parser: collaborators.pegin_parser,
            secp: Secp256k1::verification_only(),
        })
    }

    pub fn activations(&self) -> &ForBlock {
        &self.activations
    }

    fn federation_refs(&mut self) -> Result<FederationRefs, Error> {
        Ok(FederationRefs {
            new: self.provider.new_federation()?.cloned(),
            old: self.provider.old_federation()?.cloned(),
            genesis: self.genesis.clone(),
            retired_p2sh_script: self.provider.last_retired_federation_p2sh_script()?.cloned(),
            height: self.block.number,
            activation_age: federation_activation_age(self.constants, &self.activations),
            flyover_derivation_hashes: self.provider.flyover_derivation_hashes()?,
        })
    }

    /// Runs once per execution block: migrates retiring funds, turns queued
    /// release requests into transactions and promotes at most one
    /// confirmed release to the signing stage.
    pub fn update_collections(&mut self, sender: Address, rsk_tx_hash: H256) -> Result<(), Error> {
        trace!("update_collections at block {}", self.block.number);
        self.events.log(BridgeEvent::UpdateCollections { sender });
        self.process_funds_migration()?;
        self.process_release_requests(rsk_tx_hash)?;
        self.process_confirmed_pegouts(rsk_tx_hash)?;
        Ok(())
    }

    fn process_funds_migration(&mut self) -> Result<(), Error> {
        let refs = self.federation_refs()?;
        let slots = refs.slots();
        let Some(retiring) = slots.retiring_federation() else {
            return Ok(());
        };
        let active = slots.active_federation();

        let age = self
            .block
            .number
            .saturating_sub(active.creation_block_number());
        let window_begin = refs.activation_age + self.constants.funds_migration_age_since_activation_begin;
        let window_end = refs.activation_age + self.constants.funds_migration_age_since_activation_end;
        let in_window = age > window_begin && age < window_end;
        let past_window = age >= window_end;

        let fee_per_kb = self.fee_per_kb()?;
        let strategy = refs.script_strategy(self.constants, &self.activations);
        let wallet = FederationWallet::new(
            &[retiring],
            UtxoProvider::Storage(self.provider.federation_utxos(UtxoSlot::Old)?),
            strategy,
        )?;
        let balance = wallet.balance();

        if in_window {
            if balance > fee_per_kb / 2 {
                self.migrate_funds(&wallet, active, fee_per_kb)?;
            } else if balance == 0 {
                self.retire_federation(retiring);
            }
        } else if past_window {
            if balance > 0 {
                self.migrate_funds(&wallet, active, fee_per_kb)?;
            }
            self.retire_federation(retiring);
        }
        Ok(())
    }

    fn migrate_funds(
        &mut self,
        wallet: &FederationWallet,
        active: &Federation,
        fee_per_kb: u64,
    ) -> Result<(), Error> {
        let destination = active.p2sh_script();
        let builder = ReleaseTransactionBuilder::new(
            wallet,
            destination.clone(),
            fee_per_kb,
            self.constants.max_transaction_size,
            &self.activations,
        );

        let mut value = wallet.balance();
        let result = loop {
            match builder.build_migration_transaction(value, destination) {
                Ok(result) => break result,
                Err(
                    response @ (BuildResponse::InsufficientMoney
                    | BuildResponse::ExceedMaxTransactionSize
                    | BuildResponse::CouldNotAdjustDownwards),
                ) if value / 2 >= MIN_NONDUST_OUTPUT => {
                    debug!("migration of {value} sats failed with {response:?}, halving");
                    value /= 2;
                }
                Err(response) => {
                    warn!("Unable to build migration transaction: {response:?}");
                    RELEASE_BUILD_FAILURES
                        .with_label_values(&["migration", response.into()])
                        .inc();
                    return Ok(());
                }
            }
        };

        let txid = result.transaction.txid();
        self.provider
            .federation_utxos_mut(UtxoSlot::Old)?
            .retain(|utxo| !result.selected_utxos.contains(utxo));
        self.record_pegout_sighash(&result.transaction);
        // keyed by the block that promotes it to signing
        self.provider.pegouts_waiting_for_confirmations()?.add(
            result.transaction,
            self.block.number,
            None,
        );
        RELEASE_TRANSACTIONS_BUILT
            .with_label_values(&["migration"])
            .inc();
        info!("[btctx:{txid}] Migrating {value} sats to {}", active.address());
        Ok(())
    }

    fn retire_federation(&mut self, retiring: &Federation) {
        info!("Retiring federation {} has been cleared", retiring.address());
        self.provider.set_old_federation(None);
        self.provider
            .set_last_retired_federation_p2sh_script(Some(retiring.p2sh_script().clone()));
    }

    fn process_release_requests(&mut self, rsk_tx_hash: H256) -> Result<(), Error> {
        let refs = self.federation_refs()?;
        let slots = refs.slots();
        let active = slots.active_federation();
        let slot = slots.active_utxo_slot();
        let strategy = refs.script_strategy(self.constants, &self.activations);
        let wallet = FederationWallet::new(
            &[active],
            UtxoProvider::Storage(self.provider.federation_utxos(slot)?),
            strategy,
        )?;
        let fee_per_kb = self.fee_per_kb()?;

        if self.activations.is_active(ConsensusRule::BatchedPegouts) {
            self.process_batched_release_requests(&wallet, active, slot, fee_per_kb, rsk_tx_hash)
        } else {
            self.process_individual_release_requests(wallet, active, slot, fee_per_kb)
        }
    }

    fn process_individual_release_requests(
        &mut self,
        mut wallet: FederationWallet,
        active: &Federation,
        slot: UtxoSlot,
        fee_per_kb: u64,
    ) -> Result<(), Error> {
        let max_iterations = self.constants.max_release_iterations;
        let max_transaction_size = self.constants.max_transaction_size;
        let activations = &self.activations;
        let mut built = Vec::new();

        self.provider
            .release_request_queue()?
            .process(max_iterations, |request| {
                let builder = ReleaseTransactionBuilder::new(
                    &wallet,
                    active.p2sh_script().clone(),
                    fee_per_kb,
                    max_transaction_size,
                    activations,
                );
                match builder.build_amount_to(&request.destination, request.amount) {
                    Ok(result) => {
                        wallet.remove_utxos(&result.selected_utxos);
                        built.push((request.clone(), result));
                        true
                    }
                    Err(response) => {
                        debug!(
                            "Release of {} sats to {} not built: {response:?}",
                            request.amount, request.destination
                        );
                        RELEASE_BUILD_FAILURES
                            .with_label_values(&["individual", response.into()])
                            .inc();
                        false
                    }
                }
            });

        for (request, result) in built {
            let btc_txid = result.transaction.txid();
            self.commit_release(slot, &result, request.amount, request.rsk_tx_hash)?;
            self.events.log(BridgeEvent::ReleaseRequested {
                rsk_tx_hash: request.rsk_tx_hash,
                btc_txid,
                amount: request.amount,
            });
            RELEASE_TRANSACTIONS_BUILT
                .with_label_values(&["individual"])
                .inc();
            info!("[btctx:{btc_txid}] Release of {} sats built", request.amount);
        }
        Ok(())
    }

    fn process_batched_release_requests(
        &mut self,
        wallet: &FederationWallet,
        active: &Federation,
        slot: UtxoSlot,
        fee_per_kb: u64,
        rsk_tx_hash: H256,
    ) -> Result<(), Error> {
        let next_pegout_height = self.provider.next_pegout_height()?.unwrap_or_default();
        if self.block.number < next_pegout_height {
            return Ok(());
        }

        let queue = self.provider.release_request_queue()?;
        if queue.is_empty() {
            return Ok(());
        }
        let total = queue.total_amount();
        if wallet.balance() < total {
            warn!(
                "Federation balance {} does not cover {total} sats of queued releases",
                wallet.balance()
            );
            return Ok(());
        }

        let builder = ReleaseTransactionBuilder::new(
            wallet,
            active.p2sh_script().clone(),
            fee_per_kb,
            self.constants.max_transaction_size,
            &self.activations,
        );
        let built = queue.process_batched(|batch| match builder.build_batched_pegouts(batch) {
            Ok(result) => BatchAttempt::Built(result),
            Err(BuildResponse::ExceedMaxTransactionSize) => {
                debug!("Batch of {} releases too large, halving", batch.len());
                BatchAttempt::TooLarge
            }
            Err(response) => {
                warn!("Unable to build batch of {} releases: {response:?}", batch.len());
                RELEASE_BUILD_FAILURES
                    .with_label_values(&["batch", response.into()])
                    .inc();
                BatchAttempt::Failed
            }
        });
        let Some((result, requests)) = built else {
            return Ok(());
        };

        let btc_txid = result.transaction.txid();
        let sent = requests.iter().map(|request| request.amount).sum();
        self.commit_release(slot, &result, sent, Some(rsk_tx_hash))?;
        self.events.log(BridgeEvent::BatchPegoutCreated {
            btc_txid,
            rsk_tx_hashes: requests
                .iter()
                .filter_map(|request| request.rsk_tx_hash)
                .collect(),
        });
        RELEASE_TRANSACTIONS_BUILT.with_label_values(&["batch"]).inc();
        info!("[btctx:{btc_txid}] Batch of {} releases built", requests.len());

        // the cooldown starts once the queue is drained
        if self.provider.release_request_queue()?.is_empty() {
            let next_height = self.block.number + self.constants.number_of_blocks_between_pegouts;
            debug!("Release queue drained, next batch at {next_height}");
            self.provider.set_next_pegout_height(next_height);
        }
        Ok(())
    }

    /// Spends the selected UTXOs and queues the transaction for confirmations.
    fn commit_release(
        &mut self,
        slot: UtxoSlot,
        result: &BuildResult,
        sent_by_users: u64,
        rsk_tx_hash: Option<H256>,
    ) -> Result<(), Error> {
        self.provider
            .federation_utxos_mut(slot)?
            .retain(|utxo| !result.selected_utxos.contains(utxo));
        self.record_pegout_sighash(&result.transaction);
        self.provider.pegouts_waiting_for_confirmations()?.add(
            result.transaction.clone(),
            self.block.number,
            rsk_tx_hash,
        );
        self.adjust_balances_if_change_output_was_dust(result, sent_by_users)
    }

    /// A change output lifted over the dust limit is paid out of the
    /// recipients' outputs. The account-chain side then holds more than the
    /// federation and the difference is burned.
    fn adjust_balances_if_change_output_was_dust(
        &mut self,
        result: &BuildResult,
        sent_by_users: u64,
    ) -> Result<(), Error> {
        let spent_by_federation = result
            .selected_value()
            .saturating_sub(result.change.unwrap_or_default());
        let excess = sent_by_users.saturating_sub(spent_by_federation);
        if excess > 0 {
            debug!("Burning {excess} sats not backed after change inflation");
            self.ledger.burn(sats_to_wei(excess))?;
        }
        Ok(())
    }

    fn record_pegout_sighash(&mut self, tx: &Transaction) {
        if !self.activations.is_active(ConsensusRule::PegoutTxIndex) {
            return;
        }
        if let Some(sighash) = first_input_sighash(tx) {
            trace!("[btctx:{}] recording pegout sighash {sighash}", tx.txid());
            self.provider.set_pegout_tx_sighash(sighash);
        }
    }

    fn process_confirmed_pegouts(&mut self, rsk_tx_hash: H256) -> Result<(), Error> {
        let height = self.block.number;
        let min_confirmations = self.constants.account_to_btc_min_confirmations;
        let Some(entry) = self
            .provider
            .pegouts_waiting_for_confirmations()?
            .next_pegout_with_enough_confirmations(height, min_confirmations)
            .cloned()
        else {
            return Ok(());
        };

        let btc_txid = entry.transaction.txid();
        let key = match entry.rsk_tx_hash {
            Some(key) => key,
            None => {
                // a transaction built in this block may already carry this hash
                let reserved = self
                    .provider
                    .pegouts_waiting_for_confirmations()?
                    .entries()
                    .iter()
                    .any(|waiting| waiting.rsk_tx_hash == Some(rsk_tx_hash));
                if reserved {
                    debug!("[btctx:{btc_txid}] {rsk_tx_hash:?} is taken, promoting next block");
                    return Ok(());
                }
                rsk_tx_hash
            }
        };
        let waiting_for_signatures = self.provider.pegouts_waiting_for_signatures()?;
        if waiting_for_signatures.contains_key(&key) {
            return Err(Error::InvariantViolation(format!(
                "[btctx:{btc_txid}] signing entry {key:?} already exists"
            )));
        }
        waiting_for_signatures.insert(key, entry.transaction.clone())?;
        self.provider
            .pegouts_waiting_for_confirmations()?
            .remove_entry(&entry);
        self.events.log(BridgeEvent::PegoutConfirmed {
            btc_txid,
            creation_block_number: entry.creation_block_number,
        });
        info!("[btctx:{btc_txid}] Release confirmed, waiting for signatures under {key:?}");
        Ok(())
    }

    /// Registers a bitcoin transaction proven to be included at `height`.
    /// Policy rejections come back as an outcome; only malformed input and
    /// corrupted state are errors.
    pub fn register_btc_transaction(
        &mut self,
        rsk_tx_hash: H256,
        raw_tx: &[u8],
        height: u32,
        raw_pmt: &[u8],
    ) -> Result<RegisterOutcome, Error> {
        let tx: Transaction =
            deserialize(raw_tx).map_err(|err| Error::InvalidTransaction(err.to_string()))?;
        let txid = tx.txid();
        if let Some(processed_at) = self.provider.btc_tx_hash_processed_height(&txid)? {
            debug!("[btctx:{txid}] already processed at {processed_at}");
            return Ok(RegisterOutcome::AlreadyProcessed);
        }

        let pmt: PartialMerkleTree =
            deserialize(raw_pmt).map_err(|err| Error::InvalidMerkleProof(err.to_string()))?;
        let mut matches = Vec::new();
        let mut indexes = Vec::new();
        let merkle_root = pmt
            .extract_matches(&mut matches, &mut indexes)
            .map_err(|err| Error::InvalidMerkleProof(format!("{err:?}")))?;
        if !matches.contains(&txid) {
            debug!("[btctx:{txid}] not part of the supplied proof");
            return Ok(RegisterOutcome::NotInProof);
        }

        let mut chain = BtcChainView::new(
            self.btc_chain,
            &mut *self.block_hash_cache,
            self.constants.btc_header_max_depth,
        );
        let confirmations = chain.confirmations(height)?;
        if confirmations < self.constants.btc_to_account_min_confirmations {
            debug!("[btctx:{txid}] only {confirmations} confirmations");
            return Ok(RegisterOutcome::NotEnoughConfirmations);
        }
        if tx.input.is_empty() {
            return Err(Error::InvalidTransaction(format!("{txid} has no inputs")));
        }
        if chain.merkle_root_at_height(height)? != Some(merkle_root) {
            warn!("[btctx:{txid}] merkle root does not match the header at {height}");
            return Ok(RegisterOutcome::MerkleRootMismatch);
        }

        let refs = self.federation_refs()?;
        let tx_type = {
            let ctx = refs.context(self.constants, &self.activations);
            let provider = &mut self.provider;
            classifier::transaction_type(&tx, height, &ctx, |sighash| {
                provider.has_pegout_tx_sighash(sighash)
            })?
        };
        debug!("[btctx:{txid}] classified as {tx_type:?}");

        let outcome = match tx_type {
            PegTxType::Pegin => self.process_pegin(&tx, height, rsk_tx_hash, &refs)?,
            PegTxType::PegoutOrMigration => self.process_pegout_or_migration(&tx, height, &refs)?,
            PegTxType::Unknown => RegisterOutcome::UnknownTransaction,
        };
        Ok(outcome)
    }

    fn process_pegin(
        &mut self,
        tx: &Transaction,
        height: u32,
        rsk_tx_hash: H256,
        refs: &FederationRefs,
    ) -> Result<RegisterOutcome, Error> {
        let txid = tx.txid();
        let live = refs.live_slots();
        let mut custodied = 0;
        for (_, slot) in &live {
            custodied += self
                .provider
                .federation_utxos(*slot)?
                .iter()
                .map(|utxo| utxo.value)
                .sum::<u64>();
        }
        let locking_cap = self.locking_cap()?;

        let action = {
            let ctx = refs.context(self.constants, &self.activations);
            classifier::evaluate_pegin(
                tx,
                &ctx,
                self.pegin_parser.parse(tx),
                pegin::sender_script(tx),
                locking_cap,
                custodied,
            )?
        };

        match action {
            PeginProcessAction::CanBeRegistered(information) => {
                let strategy = refs.script_strategy(self.constants, &self.activations);
                let mut amount = 0;
                for (federation, slot) in &live {
                    let wallet = FederationWallet::new(
                        &[*federation],
                        UtxoProvider::WatchOnly,
                        strategy.clone(),
                    )?;
                    let utxos = wallet.utxos_from(tx, height);
                    amount += utxos.iter().map(|utxo| utxo.value).sum::<u64>();
                    self.provider.federation_utxos_mut(*slot)?.extend(utxos);
                }
                self.ledger
                    .transfer_to(information.account_destination, sats_to_wei(amount))?;
                self.mark_processed(txid);
                self.events.log(BridgeEvent::PeginBtc {
                    recipient: information.account_destination,
                    btc_txid: txid,
                    amount,
                });
                PEGIN_TOTALS.with_label_values(&["registered"]).inc();
                PEGIN_REGISTERED_SATS.inc_by(amount);
                info!(
                    "[btctx:{txid}] Peg-in of {amount} sats registered for {:?}",
                    information.account_destination
                );
                Ok(RegisterOutcome::PeginRegistered { amount })
            }
            PeginProcessAction::CanBeRefunded {
                reason,
                refund_script,
            } => self.refund_pegin(tx, height, rsk_tx_hash, refs, reason, &refund_script),
            PeginProcessAction::CannotBeProcessed(reason) => Ok(self.unrefundable_pegin(txid, reason)),
        }
    }

    /// Returns exactly the federation outputs of `tx` to `refund_script`.
    fn refund_pegin(
        &mut self,
        tx: &Transaction,
        height: u32,
        rsk_tx_hash: H256,
        refs: &FederationRefs,
        reason: RejectedPeginReason,
        refund_script: &ScriptBuf,
    ) -> Result<RegisterOutcome, Error> {
        let txid = tx.txid();
        let federations = refs
            .live_slots()
            .into_iter()
            .map(|(federation, _)| federation)
            .collect::<Vec<_>>();
        let strategy = refs.script_strategy(self.constants, &self.activations);
        let received = FederationWallet::new(
            &federations,
            UtxoProvider::WatchOnly,
            strategy.clone(),
        )?
        .utxos_from(tx, height);
        let wallet = FederationWallet::new(&federations, UtxoProvider::List(received), strategy)?;
        let fee_per_kb = self.fee_per_kb()?;
        let builder = ReleaseTransactionBuilder::new(
            &wallet,
            refs.slots().active_federation().p2sh_script().clone(),
            fee_per_kb,
            self.constants.max_transaction_size,
            &self.activations,
        );

        match builder.build_empty_wallet_to(refund_script) {
            Ok(result) => {
                self.record_pegout_sighash(&result.transaction);
                self.provider.pegouts_waiting_for_confirmations()?.add(
                    result.transaction,
                    self.block.number,
                    Some(rsk_tx_hash),
                );
                self.mark_processed(txid);
                self.events.log(BridgeEvent::RejectedPegin {
                    btc_txid: txid,
                    reason,
                });
                PEGIN_TOTALS.with_label_values(&["refunded"]).inc();
                info!("[btctx:{txid}] Peg-in rejected ({reason:?}), refunding to {refund_script}");
                Ok(RegisterOutcome::PeginRefunded(reason))
            }
            Err(response) => {
                warn!("[btctx:{txid}] Unable to build refund: {response:?}");
                RELEASE_BUILD_FAILURES
                    .with_label_values(&["refund", response.into()])
                    .inc();
                Ok(self.unrefundable_pegin(txid, reason))
            }
        }
    }

    fn unrefundable_pegin(&mut self, txid: Txid, reason: RejectedPeginReason) -> RegisterOutcome {
        self.mark_processed(txid);
        self.events.log(BridgeEvent::UnrefundablePegin {
            btc_txid: txid,
            reason,
        });
        PEGIN_TOTALS.with_label_values(&["unrefundable"]).inc();
        warn!("[btctx:{txid}] Peg-in rejected ({reason:?}) and cannot be refunded");
        RegisterOutcome::PeginUnrefundable(reason)
    }

    /// Change coming back to a live federation becomes spendable again.
    fn process_pegout_or_migration(
        &mut self,
        tx: &Transaction,
        height: u32,
        refs: &FederationRefs,
    ) -> Result<RegisterOutcome, Error> {
        let txid = tx.txid();
        let strategy = refs.script_strategy(self.constants, &self.activations);
        for (federation, slot) in refs.live_slots() {
            let wallet = FederationWallet::new(&[federation], UtxoProvider::WatchOnly, strategy.clone())?;
            let utxos = wallet.utxos_from(tx, height);
            if !utxos.is_empty() {
                debug!("[btctx:{txid}] {} outputs back to {}", utxos.len(), federation.address());
                self.provider.federation_utxos_mut(slot)?.extend(utxos);
            }
        }
        self.mark_processed(txid);
        info!("[btctx:{txid}] Peg-out or migration registered");
        Ok(RegisterOutcome::PegoutOrMigrationRegistered)
    }

    fn mark_processed(&mut self, txid: Txid) {
        self.provider
            .set_btc_tx_hash_processed_height(txid, self.block.number);
    }

    /// Queues a release of `value` wei to `destination`, or rejects it and,
    /// once refunds are active, returns the value to the sender.
    pub fn release_btc(
        &mut self,
        caller: Caller,
        destination: ScriptBuf,
        value: U256,
        rsk_tx_hash: H256,
    ) -> Result<ReleaseRequestResult, Error> {
        let sender = caller.address();
        let amount = wei_to_sats(value);

        let rejection = if matches!(caller, Caller::Contract(_)) {
            Some(RejectedPegoutReason::CallerContract)
        } else if !self.is_release_amount_allowed(amount)? {
            Some(RejectedPegoutReason::LowAmount)
        } else {
            None
        };

        if let Some(reason) = rejection {
            self.events.log(BridgeEvent::ReleaseRequestRejected {
                sender,
                amount,
                reason,
            });
            if self.activations.is_active(ConsensusRule::RefundRejectedPegouts) {
                self.ledger.refund(sender, value)?;
            }
            RELEASE_REQUEST_TOTALS.with_label_values(&["rejected"]).inc();
            info!("Release of {amount} sats from {sender:?} rejected: {reason:?}");
            return Ok(ReleaseRequestResult::Rejected(reason));
        }

        self.provider
            .release_request_queue()?
            .add(destination.clone(), amount, Some(rsk_tx_hash));
        self.events.log(BridgeEvent::ReleaseRequestReceived {
            sender,
            destination,
            amount,
        });
        RELEASE_REQUEST_TOTALS.with_label_values(&["queued"]).inc();
        debug!("Release of {amount} sats from {sender:?} queued");
        Ok(ReleaseRequestResult::Queued)
    }

    fn is_release_amount_allowed(&mut self, amount: u64) -> Result<bool, Error> {
        if !self.activations.is_active(ConsensusRule::FeeBasedMinimumPegout) {
            return Ok(amount > self.constants.legacy_minimum_pegout_value);
        }
        let fee = self.estimated_fee_for_outputs(2)?;
        let fee_with_margin =
            fee.saturating_mul(100 + self.constants.pegout_fee_safety_margin_percentage) / 100;
        Ok(amount >= self.constants.minimum_pegout_value.max(fee_with_margin))
    }

    fn estimated_fee_for_outputs(&mut self, outputs: usize) -> Result<u64, Error> {
        let fee_per_kb = self.fee_per_kb()?;
        let refs = self.federation_refs()?;
        let size = estimate_pegout_size(refs.slots().active_federation(), 2, outputs);
        Ok(fee_for_size(fee_per_kb, size))
    }

    /// Fee of a two input pegout paying every queued request plus change.
    pub fn estimated_fees_for_next_pegout(&mut self) -> Result<u64, Error> {
        let outputs = self.provider.release_request_queue()?.len() + 1;
        self.estimated_fee_for_outputs(outputs)
    }

    /// Adds one signature per input from `federator` to the release waiting
    /// under `rsk_tx_hash`. A bad signature leaves the entry untouched.
    pub fn add_signature(
        &mut self,
        federator: PublicKey,
        signatures: Vec<Vec<u8>>,
        rsk_tx_hash: H256,
    ) -> Result<SignatureOutcome, Error> {
        let outcome = self.try_add_signature(federator, &signatures, rsk_tx_hash)?;
        let label: &'static str = (&outcome).into();
        SIGNATURE_TOTALS.with_label_values(&[label]).inc();
        Ok(outcome)
    }

    fn try_add_signature(
        &mut self,
        federator: PublicKey,
        signatures: &[Vec<u8>],
        rsk_tx_hash: H256,
    ) -> Result<SignatureOutcome, Error> {
        let waiting = self.provider.pegouts_waiting_for_signatures()?;
        let Some(entry) = waiting.get_mut(&rsk_tx_hash) else {
            debug!("No release waiting for signatures under {rsk_tx_hash:?}");
            return Ok(SignatureOutcome::UnknownTransaction);
        };
        if entry.has_signatures_from(&federator) {
            debug!("{federator} already signed {rsk_tx_hash:?}");
            return Ok(SignatureOutcome::AlreadySigned);
        }

        // Signers are matched against the keys in each input's redeem script
        // only, so members of a retired federation can still sign its
        // migration. Active or retiring membership is not required.
        let verified = match verify_federator_signatures(
            &self.secp,
            entry.unsigned_transaction(),
            &federator,
            signatures,
        ) {
            Ok(verified) => verified,
            Err(SignatureRejection::NotFederationMember) => {
                warn!("{federator} is not a signer of {rsk_tx_hash:?}");
                return Ok(SignatureOutcome::NotFederationMember);
            }
            Err(rejection) => {
                warn!("Signatures from {federator} for {rsk_tx_hash:?} rejected: {rejection:?}");
                return Ok(SignatureOutcome::Rejected(rejection));
            }
        };

        entry.add_verified_signatures(federator, verified);
        let signed = if entry.is_complete() {
            Some(entry.finalize()?)
        } else {
            None
        };
        self.events.log(BridgeEvent::AddSignature {
            federator,
            rsk_tx_hash,
        });

        match signed {
            Some(transaction) => {
                waiting.remove(&rsk_tx_hash);
                info!(
                    "[btctx:{}] Release fully signed, ready to broadcast",
                    transaction.txid()
                );
                self.events.log(BridgeEvent::ReleaseBtc {
                    rsk_tx_hash,
                    transaction: transaction.clone(),
                });
                Ok(SignatureOutcome::Complete(transaction))
            }
            None => Ok(SignatureOutcome::Accepted),
        }
    }

    /// Votes for a federation change. The vote only counts if the change
    /// would currently succeed; the winning change is executed right away.
    pub fn vote_federation_change(
        &mut self,
        voter: Address,
        spec: CallSpec,
    ) -> Result<FederationChangeResult, Error> {
        let result = self.try_vote_federation_change(voter, &spec)?;
        let function = match spec.function() {
            CREATE_FUNCTION => CREATE_FUNCTION,
            ADD_FUNCTION => ADD_FUNCTION,
            ADD_MULTI_FUNCTION => ADD_MULTI_FUNCTION,
            COMMIT_FUNCTION => COMMIT_FUNCTION,
            ROLLBACK_FUNCTION => ROLLBACK_FUNCTION,
            _ => "unknown",
        };
        FEDERATION_CHANGE_VOTES
            .with_label_values(&[function, result.into()])
            .inc();
        Ok(result)
    }

    fn try_vote_federation_change(
        &mut self,
        voter: Address,
        spec: &CallSpec,
    ) -> Result<FederationChangeResult, Error> {
        let constants = self.constants;
        let authorizer = &constants.federation_change_authorizer;
        if !authorizer.is_authorized(&voter) {
            warn!("Unauthorized federation change vote from {voter:?}");
            return Ok(FederationChangeResult::GenericError);
        }

        let dry_run = self.execute_federation_change(spec, true)?;
        if dry_run != FederationChangeResult::Success {
            debug!("Federation change {} would fail: {dry_run:?}", spec.function());
            return Ok(dry_run);
        }

        let mut election = Election::new(authorizer.clone(), self.provider.federation_election()?)?;
        if !election.vote(spec.clone(), voter) {
            return Ok(FederationChangeResult::GenericError);
        }

        let mut result = FederationChangeResult::Success;
        if let Some(winner) = election.winner() {
            result = self.execute_federation_change(&winner, false)?;
            match winner.function() {
                CREATE_FUNCTION | COMMIT_FUNCTION | ROLLBACK_FUNCTION => election.clear(),
                _ => election.clear_winner_votes(),
            }
        }
        self.provider.set_federation_election(election.votes());
        Ok(result)
    }

    fn execute_federation_change(
        &mut self,
        spec: &CallSpec,
        dry_run: bool,
    ) -> Result<FederationChangeResult, Error> {
        match (spec.function(), spec.arguments()) {
            (CREATE_FUNCTION, []) => self.create_federation(dry_run),
            (ADD_FUNCTION, [key]) => match PublicKey::from_slice(key) {
                Ok(key) => self.add_federator(FederationMember::from_single_key(key), dry_run),
                Err(_) => Ok(FederationChangeResult::GenericError),
            },
            (ADD_MULTI_FUNCTION, [btc, account, mst]) => {
                let keys = (
                    PublicKey::from_slice(btc),
                    PublicKey::from_slice(account),
                    PublicKey::from_slice(mst),
                );
                match keys {
                    (Ok(btc), Ok(account), Ok(mst)) => {
                        self.add_federator(FederationMember::new(btc, account, mst), dry_run)
                    }
                    _ => Ok(FederationChangeResult::GenericError),
                }
            }
            (COMMIT_FUNCTION, [hash]) => match sha256d::Hash::from_slice(hash) {
                Ok(hash) => self.commit_federation(hash, dry_run),
                Err(_) => Ok(FederationChangeResult::GenericError),
            },
            (ROLLBACK_FUNCTION, []) => self.rollback_federation(dry_run),
            _ => Ok(FederationChangeResult::GenericError),
        }
    }

    fn create_federation(&mut self, dry_run: bool) -> Result<FederationChangeResult, Error> {
        if self.provider.pending_federation()?.is_some() {
            return Ok(FederationChangeResult::PendingFederationExists);
        }
        let refs = self.federation_refs()?;
        let slots = refs.slots();
        if slots.is_awaiting_activation() {
            return Ok(FederationChangeResult::AwaitingActivation);
        }
        if slots.retiring_federation().is_some() {
            return Ok(FederationChangeResult::RetiringFederationExists);
        }
        if dry_run {
            return Ok(FederationChangeResult::Success);
        }
        self.provider
            .set_pending_federation(Some(PendingFederation::default()));
        info!("Pending federation created");
        Ok(FederationChangeResult::Success)
    }

    fn add_federator(
        &mut self,
        member: FederationMember,
        dry_run: bool,
    ) -> Result<FederationChangeResult, Error> {
        let Some(pending) = self.provider.pending_federation()?.cloned() else {
            return Ok(FederationChangeResult::NoPendingFederation);
        };
        if pending.contains_btc_public_key(&member.btc_public_key()) {
            return Ok(FederationChangeResult::KeyAlreadyPresent);
        }
        let grown = match pending.add_member(member) {
            Ok(grown) => grown,
            Err(err) => {
                warn!("Unable to add federator: {err}");
                return Ok(FederationChangeResult::GenericError);
            }
        };
        if dry_run {
            return Ok(FederationChangeResult::Success);
        }
        info!("Pending federation now has {} members", grown.size());
        self.provider.set_pending_federation(Some(grown));
        Ok(FederationChangeResult::Success)
    }

    fn commit_federation(
        &mut self,
        hash: sha256d::Hash,
        dry_run: bool,
    ) -> Result<FederationChangeResult, Error> {
        let Some(pending) = self.provider.pending_federation()?.cloned() else {
            return Ok(FederationChangeResult::NoPendingFederation);
        };
        if !pending.is_complete() {
            return Ok(FederationChangeResult::IncompletePendingFederation);
        }
        if pending.hash() != hash {
            return Ok(FederationChangeResult::HashMismatch);
        }
        if dry_run {
            return Ok(FederationChangeResult::Success);
        }

        let refs = self.federation_refs()?;
        let active = refs.slots().active_federation().clone();
        let new_federation = pending.build_federation(
            self.block.timestamp_millis,
            self.block.number,
            self.constants.network,
        )?;

        let active_utxos = self.provider.federation_utxos(UtxoSlot::New)?;
        self.provider.set_federation_utxos(UtxoSlot::Old, active_utxos);
        self.provider.set_federation_utxos(UtxoSlot::New, Vec::new());
        // create is refused while a retiring federation exists, so OLD is empty here
        self.provider.set_old_federation(Some(active.clone()));
        self.provider
            .set_new_federation(Some(new_federation.clone()));
        self.provider.set_pending_federation(None);

        let activation_height = self.block.number + refs.activation_age;
        info!(
            "Federation {} committed, active from block {activation_height}",
            new_federation.address()
        );
        self.events.log(BridgeEvent::CommitFederation {
            old_federation: active,
            new_federation,
            activation_height,
        });
        Ok(FederationChangeResult::Success)
    }

    fn rollback_federation(&mut self, dry_run: bool) -> Result<FederationChangeResult, Error> {
        if self.provider.pending_federation()?.is_none() {
            return Ok(FederationChangeResult::NoPendingFederation);
        }
        if !dry_run {
            self.provider.set_pending_federation(None);
            info!("Pending federation rolled back");
        }
        Ok(FederationChangeResult::Success)
    }

    pub fn vote_fee_per_kb_change(
        &mut self,
        voter: Address,
        fee_per_kb: u64,
    ) -> Result<FeePerKbChangeResult, Error> {
        let constants = self.constants;
        let authorizer = &constants.fee_per_kb_change_authorizer;
        if !authorizer.is_authorized(&voter) {
            return Ok(FeePerKbChangeResult::Unauthorized);
        }
        if fee_per_kb == 0 {
            return Ok(FeePerKbChangeResult::NonPositiveFee);
        }
        if fee_per_kb > constants.max_fee_per_kb {
            return Ok(FeePerKbChangeResult::ExcessiveFee);
        }

        let mut election = Election::new(authorizer.clone(), self.provider.fee_per_kb_election()?)?;
        let spec = CallSpec::new(
            SET_FEE_PER_KB_FUNCTION,
            vec![fee_per_kb.to_be_bytes().to_vec()],
        );
        if !election.vote(spec, voter) {
            return Ok(FeePerKbChangeResult::VoteRejected);
        }

        if let Some(winner) = election.winner() {
            let fee_per_kb = winner
                .arguments()
                .first()
                .and_then(|argument| <[u8; 8]>::try_from(argument.as_slice()).ok())
                .map(u64::from_be_bytes)
                .ok_or_else(|| Error::InvariantViolation("malformed fee per kb vote".to_string()))?;
            info!("Fee per kb set to {fee_per_kb}");
            self.provider.set_fee_per_kb(fee_per_kb);
            election.clear();
        }
        self.provider.set_fee_per_kb_election(election.votes());
        Ok(FeePerKbChangeResult::Success)
    }

    /// Raises the locking cap. It never shrinks and grows by at most the
    /// configured multiplier per call.
    pub fn increase_locking_cap(&mut self, caller: Address, new_cap: u64) -> Result<bool, Error> {
        if !self.constants.locking_cap_authorizer.is_authorized(&caller) {
            warn!("Unauthorized locking cap change from {caller:?}");
            return Ok(false);
        }
        let current = self.locking_cap()?;
        let ceiling = current.saturating_mul(self.constants.locking_cap_increments_multiplier);
        if new_cap < current || new_cap > ceiling {
            debug!("Locking cap {new_cap} outside [{current}, {ceiling}]");
            return Ok(false);
        }
        info!("Locking cap increased from {current} to {new_cap}");
        self.provider.set_locking_cap(new_cap);
        Ok(true)
    }

    /// Binds a flyover derivation hash so the federation scripts derived from
    /// it are watched and spent. Ignored until flyover scripts are active.
    pub fn register_flyover_derivation_hash(&mut self, derivation_hash: [u8; 32]) -> Result<bool, Error> {
        if !self.activations.is_active(ConsensusRule::FlyoverScripts) {
            debug!("Flyover scripts are not active");
            return Ok(false);
        }
        let added = self.provider.add_flyover_derivation_hash(derivation_hash)?;
        if added {
            info!("Flyover derivation hash {} registered", hex::encode(derivation_hash));
        }
        Ok(added)
    }

    pub fn fee_per_kb(&mut self) -> Result<u64, Error> {
        Ok(self
            .provider
            .fee_per_kb()?
            .unwrap_or(self.constants.genesis_fee_per_kb))
    }

    pub fn locking_cap(&mut self) -> Result<u64, Error> {
        Ok(self
            .provider
            .locking_cap()?
            .unwrap_or(self.constants.initial_locking_cap))
    }

    pub fn active_federation(&mut self) -> Result<Federation, Error> {
        Ok(self.federation_refs()?.slots().active_federation().clone())
    }

    pub fn retiring_federation(&mut self) -> Result<Option<Federation>, Error> {
        Ok(self.federation_refs()?.slots().retiring_federation().cloned())
    }

    /// A committed federation that has not reached its activation height.
    pub fn proposed_federation(&mut self) -> Result<Option<Federation>, Error> {
        Ok(self.federation_refs()?.slots().proposed_federation().cloned())
    }

    pub fn pending_federation(&mut self) -> Result<Option<PendingFederation>, Error> {
        Ok(self.provider.pending_federation()?.cloned())
    }

    pub fn pending_federation_hash(&mut self) -> Result<Option<sha256d::Hash>, Error> {
        Ok(self.provider.pending_federation()?.map(PendingFederation::hash))
    }

    pub fn active_federation_address(&mut self) -> Result<BtcAddress, Error> {
        Ok(self.active_federation()?.address().clone())
    }

    pub fn active_federation_size(&mut self) -> Result<usize, Error> {
        Ok(self.active_federation()?.size())
    }

    pub fn active_federation_threshold(&mut self) -> Result<usize, Error> {
        Ok(self.active_federation()?.threshold())
    }

    pub fn active_federation_creation_time(&mut self) -> Result<u64, Error> {
        Ok(self.active_federation()?.creation_time())
    }

    pub fn active_federation_creation_block_number(&mut self) -> Result<u64, Error> {
        Ok(self.active_federation()?.creation_block_number())
    }

    pub fn active_federator_public_key(
        &mut self,
        index: usize,
        key_type: KeyType,
    ) -> Result<Option<PublicKey>, Error> {
        Ok(self.active_federation()?.member_public_key(index, key_type))
    }

    pub fn retiring_federation_address(&mut self) -> Result<Option<BtcAddress>, Error> {
        Ok(self
            .retiring_federation()?
            .map(|federation| federation.address().clone()))
    }

    pub fn retiring_federator_public_key(
        &mut self,
        index: usize,
        key_type: KeyType,
    ) -> Result<Option<PublicKey>, Error> {
        Ok(self
            .retiring_federation()?
            .and_then(|federation| federation.member_public_key(index, key_type)))
    }

    pub fn proposed_federation_address(&mut self) -> Result<Option<BtcAddress>, Error> {
        Ok(self
            .proposed_federation()?
            .map(|federation| federation.address().clone()))
    }

    pub fn pending_federator_public_key(
        &mut self,
        index: usize,
        key_type: KeyType,
    ) -> Result<Option<PublicKey>, Error> {
        Ok(self
            .provider
            .pending_federation()?
            .and_then(|pending| pending.members().get(index))
            .map(|member| member.public_key(key_type)))
    }

    pub fn active_federation_utxos(&mut self) -> Result<Vec<Utxo>, Error> {
        let slot = self.federation_refs()?.slots().active_utxo_slot();
        self.provider.federation_utxos(slot)
    }

    pub fn retiring_federation_utxos(&mut self) -> Result<Vec<Utxo>, Error> {
        match self.federation_refs()?.slots().retiring_utxo_slot() {
            Some(slot) => self.provider.federation_utxos(slot),
            None => Ok(Vec::new()),
        }
    }

    pub fn release_request_queue_size(&mut self) -> Result<usize, Error> {
        Ok(self.provider.release_request_queue()?.len())
    }

    pub fn pegouts_waiting_for_confirmations_size(&mut self) -> Result<usize, Error> {
        Ok(self.provider.pegouts_waiting_for_confirmations()?.len())
    }

    pub fn pegouts_waiting_for_signatures_size(&mut self) -> Result<usize, Error> {
        Ok(self.provider.pegouts_waiting_for_signatures()?.len())
    }

    /// Unsigned releases federators still have to sign, keyed as they are
    /// signed.
    pub fn state_for_btc_release_client(&mut self) -> Result<Vec<(H256, Transaction)>, Error> {
        Ok(self
            .provider
            .pegouts_waiting_for_signatures()?
            .iter()
            .map(|(key, entry)| (*key, entry.unsigned_transaction().clone()))
            .collect())
    }

    pub fn btc_tx_hash_processed_height(&mut self, txid: &Txid) -> Result<Option<u64>, Error> {
        self.provider.btc_tx_hash_processed_height(txid)
    }

    pub fn is_btc_tx_hash_already_processed(&mut self, txid: &Txid) -> Result<bool, Error> {
        Ok(self.btc_tx_hash_processed_height(txid)?.is_some())
    }

    /// Whether a pending release still spends from `federation`.
    pub fn has_pending_spends_from(&mut self, federation: &Federation) -> Result<bool, Error> {
        let spends = |tx: &Transaction| {
            tx.input
                .iter()
                .filter_map(input_redeem_script)
                .any(|script| script == *federation.redeem_script())
        };
        let waiting_confirmations = self
            .provider
            .pegouts_waiting_for_confirmations()?
            .entries()
            .iter()
            .any(|entry| spends(&entry.transaction));
        if waiting_confirmations {
            return Ok(true);
        }
        Ok(self
            .provider
            .pegouts_waiting_for_signatures()?
            .iter()
            .any(|(_, entry)| spends(entry.unsigned_transaction())))
    }

    /// Writes every modified collection back to storage.
    pub fn save(&mut self) -> Result<(), Error> {
        RELEASE_QUEUE_LENGTH.set(self.provider.release_request_queue()?.len() as i64);
        PEGOUTS_WAITING_FOR_CONFIRMATIONS
            .set(self.provider.pegouts_waiting_for_confirmations()?.len() as i64);
        PEGOUTS_WAITING_FOR_SIGNATURES
            .set(self.provider.pegouts_waiting_for_signatures()?.len() as i64);
        self.provider.save()
    }
}
