use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::merkle_tree::PartialMerkleTree;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{
    OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use ethers_core::types::{Address, H256, U256};
use peg::bridge::{
    Caller, FederationChangeResult, FeePerKbChangeResult, RegisterOutcome, ReleaseRequestResult,
    SignatureOutcome,
};
use peg::btc_chain::{BlockHashCache, BtcHeaderChain, InMemoryHeaderChain};
use peg::classifier::RejectedPeginReason;
use peg::election::CallSpec;
use peg::events::{BridgeEvent, RecordingEventLogger, RejectedPegoutReason};
use peg::ledger::InMemoryLedger;
use peg::pegin::OpReturnPeginParser;
use peg::release::signatures::{signature_hash, SignatureRejection};
use peg::storage::MemoryStorage;
use peg::{
    sats_to_wei, ActivationConfig, BridgeConstants, BridgeSupport, Collaborators, ConsensusRule,
    Error, ExecutionBlock, Federation, FederationMember,
};

fn secret_key(n: u8) -> SecretKey {
    let mut bytes = [0u8; 32];
    bytes[31] = n;
    SecretKey::from_slice(&bytes).unwrap()
}

fn public_key(n: u8) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::new(), &secret_key(n))
}

fn sign(tx: &Transaction, n: u8) -> Vec<Vec<u8>> {
    let secp = Secp256k1::new();
    (0..tx.input.len())
        .map(|index| {
            let message = signature_hash(tx, index).unwrap();
            secp.sign_ecdsa(&message, &secret_key(n))
                .serialize_der()
                .to_vec()
        })
        .collect()
}

fn push(data: Vec<u8>) -> PushBytesBuf {
    PushBytesBuf::try_from(data).unwrap()
}

/// A transfer of `value` to `federation`, optionally naming a recipient in
/// an OP_RETURN output and spending a P2PKH output of key `sender`.
fn pegin_tx(
    federation: &Federation,
    value: u64,
    recipient: Option<Address>,
    sender: Option<u8>,
    nonce: u8,
) -> Transaction {
    let script_sig = match sender {
        Some(n) => Builder::new()
            .push_slice(push(vec![0x30; 71]))
            .push_slice(push(public_key(n).serialize().to_vec()))
            .into_script(),
        None => ScriptBuf::new(),
    };
    let mut output = vec![TxOut {
        value,
        script_pubkey: federation.p2sh_script().clone(),
    }];
    if let Some(recipient) = recipient {
        output.push(TxOut {
            value: 0,
            script_pubkey: ScriptBuf::new_op_return(&push(recipient.as_bytes().to_vec())),
        });
    }
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([nonce; 32]),
                vout: 0,
            },
            script_sig,
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output,
    }
}

fn destination(n: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([n; 20]))
}

fn federation_voters() -> [Address; 2] {
    [Address::repeat_byte(0x11), Address::repeat_byte(0x12)]
}

struct Harness {
    constants: BridgeConstants,
    storage: MemoryStorage,
    chain: InMemoryHeaderChain,
    cache: BlockHashCache,
    ledger: InMemoryLedger,
    events: RecordingEventLogger,
}

impl Harness {
    fn new(constants: BridgeConstants) -> Self {
        Self {
            constants,
            storage: MemoryStorage::new(),
            chain: InMemoryHeaderChain::new(100),
            cache: BlockHashCache::new(100),
            ledger: InMemoryLedger::new(U256::MAX),
            events: RecordingEventLogger::default(),
        }
    }

    fn regtest() -> Self {
        Self::new(BridgeConstants::regtest().unwrap())
    }

    fn with_activations(activations: ActivationConfig) -> Self {
        let mut constants = BridgeConstants::regtest().unwrap();
        constants.activations = activations;
        Self::new(constants)
    }

    fn genesis(&self) -> Federation {
        self.constants.genesis_federation().unwrap()
    }

    /// Runs `f` against a bridge executing in `block` and saves on success.
    fn try_at<T>(
        &mut self,
        block: u64,
        f: impl FnOnce(&mut BridgeSupport<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let collaborators = Collaborators {
            storage: &mut self.storage,
            btc_chain: &self.chain,
            block_hash_cache: &mut self.cache,
            ledger: &mut self.ledger,
            events: &mut self.events,
            pegin_parser: &OpReturnPeginParser,
        };
        let mut bridge = BridgeSupport::new(
            &self.constants,
            ExecutionBlock {
                number: block,
                timestamp_millis: block * 30_000,
            },
            collaborators,
        )?;
        let result = f(&mut bridge)?;
        bridge.save()?;
        Ok(result)
    }

    fn at<T>(&mut self, block: u64, f: impl FnOnce(&mut BridgeSupport<'_>) -> Result<T, Error>) -> T {
        self.try_at(block, f).unwrap()
    }

    /// Mines `txs` into a block followed by enough empty blocks to give it
    /// `confirmations`. Returns its height and the serialized proof.
    fn mine(&mut self, txs: &[&Transaction], confirmations: u32) -> (u32, Vec<u8>) {
        let txids = txs.iter().map(|tx| tx.txid()).collect::<Vec<_>>();
        let pmt = PartialMerkleTree::from_txids(&txids, &vec![true; txids.len()]);
        let root = pmt.extract_matches(&mut vec![], &mut vec![]).unwrap();
        self.chain.push_block(root);
        let height = self.chain.best_chain_height().unwrap();
        self.chain.push_empty_blocks(confirmations - 1);
        (height, serialize(&pmt))
    }

    fn register(&mut self, block: u64, tx: &Transaction) -> RegisterOutcome {
        let (height, pmt) = self.mine(&[tx], 6);
        let raw_tx = serialize(tx);
        self.at(block, |bridge| {
            bridge.register_btc_transaction(H256::repeat_byte(block as u8), &raw_tx, height, &pmt)
        })
    }

    fn update(&mut self, block: u64, rsk_tx_hash: H256) {
        self.at(block, |bridge| bridge.update_collections(Address::zero(), rsk_tx_hash))
    }

    fn release(&mut self, block: u64, sender: Caller, amount: u64, rsk_tx_hash: H256) -> ReleaseRequestResult {
        self.at(block, |bridge| {
            bridge.release_btc(sender, destination(9), sats_to_wei(amount), rsk_tx_hash)
        })
    }

    fn vote_federation(&mut self, block: u64, voter: Address, spec: &CallSpec) -> FederationChangeResult {
        self.at(block, |bridge| bridge.vote_federation_change(voter, spec.clone()))
    }

    fn vote_federation_by_majority(&mut self, block: u64, spec: CallSpec) {
        for voter in federation_voters() {
            assert_eq!(
                self.vote_federation(block, voter, &spec),
                FederationChangeResult::Success
            );
        }
    }

    /// Creates, fills and commits a federation of `keys` in `block`.
    fn elect_federation(&mut self, block: u64, keys: &[u8]) {
        self.vote_federation_by_majority(block, CallSpec::new("create", vec![]));
        for key in keys {
            self.vote_federation_by_majority(
                block,
                CallSpec::new("add", vec![public_key(*key).serialize().to_vec()]),
            );
        }
        let hash = self
            .at(block, |bridge| bridge.pending_federation_hash())
            .unwrap();
        self.vote_federation_by_majority(
            block,
            CallSpec::new("commit", vec![hash.to_byte_array().to_vec()]),
        );
    }

    fn waiting_for_confirmations(&mut self, block: u64) -> usize {
        self.at(block, |bridge| bridge.pegouts_waiting_for_confirmations_size())
    }

    fn waiting_for_signatures(&mut self, block: u64) -> usize {
        self.at(block, |bridge| bridge.pegouts_waiting_for_signatures_size())
    }
}

#[test]
fn test_pegin_registration_is_idempotent() {
    let mut harness = Harness::regtest();
    let recipient = Address::repeat_byte(0xaa);
    let tx = pegin_tx(&harness.genesis(), 100_000, Some(recipient), Some(9), 1);

    assert_eq!(
        harness.register(1, &tx),
        RegisterOutcome::PeginRegistered { amount: 100_000 }
    );
    assert_eq!(harness.ledger.balance_of(&recipient), sats_to_wei(100_000));
    assert_eq!(harness.at(2, |bridge| bridge.active_federation_utxos()).len(), 1);
    assert_eq!(
        harness.at(2, |bridge| bridge.btc_tx_hash_processed_height(&tx.txid())),
        Some(1)
    );

    for block in 3..6 {
        assert_eq!(harness.register(block, &tx), RegisterOutcome::AlreadyProcessed);
    }
    assert_eq!(harness.events.count("pegin_btc"), 1);
    assert_eq!(harness.ledger.balance_of(&recipient), sats_to_wei(100_000));
}

#[test]
fn test_registration_checks_proof_and_depth() {
    let mut harness = Harness::regtest();
    let genesis = harness.genesis();
    let tx = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), None, 1);
    let raw_tx = serialize(&tx);

    let (height, pmt) = harness.mine(&[&tx], 2);
    assert_eq!(
        harness.at(1, |bridge| bridge.register_btc_transaction(H256::zero(), &raw_tx, height, &pmt)),
        RegisterOutcome::NotEnoughConfirmations
    );

    harness.chain.push_empty_blocks(3);
    assert_eq!(
        harness.at(1, |bridge| {
            bridge.register_btc_transaction(H256::zero(), &raw_tx, height + 1, &pmt)
        }),
        RegisterOutcome::MerkleRootMismatch
    );

    let other = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), None, 2);
    let (other_height, other_pmt) = harness.mine(&[&other], 3);
    assert_eq!(
        harness.at(1, |bridge| {
            bridge.register_btc_transaction(H256::zero(), &raw_tx, other_height, &other_pmt)
        }),
        RegisterOutcome::NotInProof
    );

    assert!(matches!(
        harness.try_at(1, |bridge| {
            bridge.register_btc_transaction(H256::zero(), &raw_tx, height, &[0u8; 3])
        }),
        Err(Error::InvalidMerkleProof(_))
    ));

    assert_eq!(
        harness.at(1, |bridge| bridge.register_btc_transaction(H256::zero(), &raw_tx, height, &pmt)),
        RegisterOutcome::PeginRegistered { amount: 100_000 }
    );
}

#[test]
fn test_pegin_below_minimum_is_refunded_when_sender_is_known() {
    let mut harness = Harness::regtest();
    let genesis = harness.genesis();
    let recipient = Address::repeat_byte(0xaa);

    let refundable = pegin_tx(&genesis, 10_000, Some(recipient), Some(9), 1);
    assert_eq!(
        harness.register(1, &refundable),
        RegisterOutcome::PeginRefunded(RejectedPeginReason::BelowMinimum)
    );
    assert_eq!(harness.waiting_for_confirmations(2), 1);
    assert_eq!(harness.events.count("rejected_pegin"), 1);
    assert!(harness.ledger.balance_of(&recipient).is_zero());
    assert!(harness.at(2, |bridge| bridge.active_federation_utxos()).is_empty());

    let anonymous = pegin_tx(&genesis, 10_000, Some(recipient), None, 2);
    assert_eq!(
        harness.register(3, &anonymous),
        RegisterOutcome::PeginUnrefundable(RejectedPeginReason::BelowMinimum)
    );
    assert_eq!(harness.waiting_for_confirmations(4), 1);
    assert_eq!(harness.events.count("unrefundable_pegin"), 1);
    assert_eq!(harness.register(5, &anonymous), RegisterOutcome::AlreadyProcessed);
}

#[test]
fn test_pegin_over_locking_cap_is_refunded() {
    let mut constants = BridgeConstants::regtest().unwrap();
    constants.initial_locking_cap = 150_000;
    let mut harness = Harness::new(constants);
    let genesis = harness.genesis();

    let first = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), 1);
    assert_eq!(
        harness.register(1, &first),
        RegisterOutcome::PeginRegistered { amount: 100_000 }
    );
    let second = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), 2);
    assert_eq!(
        harness.register(2, &second),
        RegisterOutcome::PeginRefunded(RejectedPeginReason::LockingCapExceeded)
    );

    let cap_owner = Address::repeat_byte(0x31);
    assert!(harness.at(3, |bridge| bridge.increase_locking_cap(cap_owner, 300_000)));
    let third = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), 3);
    assert_eq!(
        harness.register(4, &third),
        RegisterOutcome::PeginRegistered { amount: 100_000 }
    );
}

#[test]
fn test_release_minimum_follows_estimated_fee() {
    let mut harness = Harness::regtest();
    let sender = Address::repeat_byte(0xbb);

    assert_eq!(
        harness.release(1, Caller::Account(sender), 5_000, H256::repeat_byte(1)),
        ReleaseRequestResult::Rejected(RejectedPegoutReason::LowAmount)
    );
    assert_eq!(harness.ledger.balance_of(&sender), sats_to_wei(5_000));

    assert_eq!(
        harness.release(1, Caller::Account(sender), 50_000, H256::repeat_byte(2)),
        ReleaseRequestResult::Queued
    );
    assert_eq!(harness.at(1, |bridge| bridge.release_request_queue_size()), 1);

    assert_eq!(
        harness.release(1, Caller::Contract(sender), 50_000, H256::repeat_byte(3)),
        ReleaseRequestResult::Rejected(RejectedPegoutReason::CallerContract)
    );
    assert_eq!(harness.ledger.balance_of(&sender), sats_to_wei(55_000));
    assert_eq!(harness.events.count("release_request_rejected"), 2);
    assert_eq!(harness.events.count("release_request_received"), 1);
    assert!(harness.at(1, |bridge| bridge.estimated_fees_for_next_pegout()) > 0);
}

#[test]
fn test_legacy_release_minimum_is_exclusive() {
    let mut harness = Harness::with_activations(
        ActivationConfig::all_active_from(0)
            .with_rule(ConsensusRule::FeeBasedMinimumPegout, None)
            .with_rule(ConsensusRule::RefundRejectedPegouts, None),
    );
    let sender = Address::repeat_byte(0xbb);

    assert_eq!(
        harness.release(1, Caller::Account(sender), 25_000, H256::repeat_byte(1)),
        ReleaseRequestResult::Rejected(RejectedPegoutReason::LowAmount)
    );
    assert!(harness.ledger.balance_of(&sender).is_zero());
    assert_eq!(
        harness.release(1, Caller::Account(sender), 25_001, H256::repeat_byte(2)),
        ReleaseRequestResult::Queued
    );
}

#[test]
fn test_batched_release_through_signing() {
    let mut harness = Harness::regtest();
    let genesis = harness.genesis();
    let pegin = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), 1);
    harness.register(1, &pegin);

    let sender = Address::repeat_byte(0xbb);
    harness.release(2, Caller::Account(sender), 50_000, H256::repeat_byte(2));
    harness.update(3, H256::repeat_byte(3));

    assert_eq!(harness.at(3, |bridge| bridge.release_request_queue_size()), 0);
    assert_eq!(harness.waiting_for_confirmations(3), 1);
    assert!(harness.at(3, |bridge| bridge.active_federation_utxos()).is_empty());
    assert_eq!(harness.events.count("batch_pegout_created"), 1);

    // ten confirmations are needed
    harness.update(12, H256::repeat_byte(12));
    assert_eq!(harness.waiting_for_signatures(12), 0);
    harness.update(13, H256::repeat_byte(13));
    assert_eq!(harness.waiting_for_signatures(13), 1);
    assert_eq!(harness.waiting_for_confirmations(13), 0);
    assert_eq!(harness.events.count("pegout_confirmed"), 1);

    let release = harness.at(14, |bridge| bridge.state_for_btc_release_client());
    assert_eq!(release.len(), 1);
    let (key, unsigned) = release[0].clone();
    assert_eq!(key, H256::repeat_byte(3));

    let mut add = |federator: u8, signer: u8| {
        let signatures = sign(&unsigned, signer);
        harness.at(14, |bridge| bridge.add_signature(public_key(federator), signatures, key))
    };
    assert_eq!(add(1, 1), SignatureOutcome::Accepted);
    assert_eq!(add(1, 1), SignatureOutcome::AlreadySigned);
    assert_eq!(add(4, 4), SignatureOutcome::NotFederationMember);
    assert_eq!(
        add(3, 2),
        SignatureOutcome::Rejected(SignatureRejection::Invalid)
    );
    let SignatureOutcome::Complete(signed) = add(2, 2) else {
        panic!("release should be fully signed");
    };

    assert_eq!(harness.waiting_for_signatures(14), 0);
    assert_eq!(harness.events.count("release_btc"), 1);
    assert_eq!(signed.output[0].script_pubkey, destination(9));

    assert_eq!(
        harness.register(20, &signed),
        RegisterOutcome::PegoutOrMigrationRegistered
    );
    let utxos = harness.at(20, |bridge| bridge.active_federation_utxos());
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].value, 50_000);
}

#[test]
fn test_batches_respect_cooldown() {
    let mut harness = Harness::regtest();
    let genesis = harness.genesis();
    for nonce in 1..3 {
        let pegin = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), nonce);
        harness.register(nonce as u64, &pegin);
    }
    let sender = Caller::Account(Address::repeat_byte(0xbb));

    harness.release(3, sender, 50_000, H256::repeat_byte(3));
    harness.update(4, H256::repeat_byte(4));
    assert_eq!(harness.waiting_for_confirmations(4), 1);

    harness.release(5, sender, 50_000, H256::repeat_byte(5));
    harness.update(33, H256::repeat_byte(33));
    assert_eq!(harness.at(33, |bridge| bridge.release_request_queue_size()), 1);

    harness.update(34, H256::repeat_byte(34));
    assert_eq!(harness.at(34, |bridge| bridge.release_request_queue_size()), 0);
    assert_eq!(harness.events.count("batch_pegout_created"), 2);
}

#[test]
fn test_batch_waits_for_enough_balance() {
    let mut harness = Harness::regtest();
    harness.release(1, Caller::Account(Address::repeat_byte(0xbb)), 50_000, H256::repeat_byte(1));
    harness.update(2, H256::repeat_byte(2));
    assert_eq!(harness.at(2, |bridge| bridge.release_request_queue_size()), 1);
    assert_eq!(harness.waiting_for_confirmations(2), 0);
}

#[test]
fn test_individual_releases_promote_one_per_block() {
    let mut harness = Harness::with_activations(
        ActivationConfig::all_active_from(0).with_rule(ConsensusRule::BatchedPegouts, None),
    );
    let genesis = harness.genesis();
    for nonce in 1..3 {
        let pegin = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), nonce);
        harness.register(nonce as u64, &pegin);
    }
    let sender = Caller::Account(Address::repeat_byte(0xbb));
    harness.release(3, sender, 50_000, H256::repeat_byte(0x31));
    harness.release(3, sender, 60_000, H256::repeat_byte(0x32));

    harness.update(4, H256::repeat_byte(4));
    assert_eq!(harness.waiting_for_confirmations(4), 2);
    assert_eq!(harness.events.count("release_requested"), 2);
    assert!(harness.at(4, |bridge| bridge.active_federation_utxos()).is_empty());

    harness.update(13, H256::repeat_byte(13));
    assert_eq!(harness.waiting_for_signatures(13), 0);
    harness.update(14, H256::repeat_byte(14));
    assert_eq!(harness.waiting_for_signatures(14), 1);
    harness.update(15, H256::repeat_byte(15));
    assert_eq!(harness.waiting_for_signatures(15), 2);

    let mut keys = harness
        .at(15, |bridge| bridge.state_for_btc_release_client())
        .into_iter()
        .map(|(key, _)| key)
        .collect::<Vec<_>>();
    keys.sort();
    assert_eq!(keys, vec![H256::repeat_byte(0x31), H256::repeat_byte(0x32)]);
}

#[test]
fn test_duplicate_signing_key_stops_processing() {
    let mut harness = Harness::regtest();
    let genesis = harness.genesis();
    for nonce in 1..3 {
        let pegin = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), nonce);
        harness.register(nonce as u64, &pegin);
    }
    let sender = Caller::Account(Address::repeat_byte(0xbb));
    let update_hash = H256::repeat_byte(0xee);

    harness.release(3, sender, 50_000, H256::repeat_byte(3));
    harness.update(4, update_hash);
    harness.release(5, sender, 50_000, H256::repeat_byte(5));
    harness.update(34, update_hash);
    assert_eq!(harness.waiting_for_confirmations(34), 1);
    assert_eq!(harness.waiting_for_signatures(34), 1);

    assert!(matches!(
        harness.try_at(44, |bridge| bridge.update_collections(Address::zero(), H256::zero())),
        Err(Error::InvariantViolation(_))
    ));
}

#[test]
fn test_halved_batch_leftovers_skip_cooldown() {
    let mut constants = BridgeConstants::regtest().unwrap();
    constants.max_transaction_size = 390;
    let mut harness = Harness::new(constants);
    let genesis = harness.genesis();
    for nonce in 1..4 {
        let pegin = pegin_tx(&genesis, 200_000, Some(Address::repeat_byte(1)), Some(9), nonce);
        harness.register(nonce as u64, &pegin);
    }
    let sender = Caller::Account(Address::repeat_byte(0xbb));
    harness.release(4, sender, 50_000, H256::repeat_byte(0x41));
    harness.release(4, sender, 50_000, H256::repeat_byte(0x42));

    harness.update(5, H256::repeat_byte(5));
    assert_eq!(harness.at(5, |bridge| bridge.release_request_queue_size()), 1);
    harness.update(6, H256::repeat_byte(6));
    assert_eq!(harness.at(6, |bridge| bridge.release_request_queue_size()), 0);
    assert_eq!(harness.events.count("batch_pegout_created"), 2);

    // drained at 6, so the next batch waits until 36
    harness.release(7, sender, 50_000, H256::repeat_byte(0x43));
    harness.update(35, H256::repeat_byte(35));
    assert_eq!(harness.at(35, |bridge| bridge.release_request_queue_size()), 1);
    harness.update(36, H256::repeat_byte(36));
    assert_eq!(harness.at(36, |bridge| bridge.release_request_queue_size()), 0);
}

/// Genesis holds 100k, a federation of keys 4, 5 and 6 takes over at block
/// 25 and receives 200k in block 26.
fn harness_with_retiring_funds() -> Harness {
    let mut harness = Harness::regtest();
    let genesis = harness.genesis();
    let pegin = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), 1);
    harness.register(1, &pegin);
    harness.elect_federation(5, &[4, 5, 6]);

    let active = harness.at(26, |bridge| bridge.active_federation());
    let pegin = pegin_tx(&active, 200_000, Some(Address::repeat_byte(1)), Some(9), 2);
    assert_eq!(
        harness.register(26, &pegin),
        RegisterOutcome::PeginRegistered { amount: 200_000 }
    );
    harness
}

fn signing_keys(harness: &mut Harness, block: u64) -> Vec<H256> {
    let mut keys = harness
        .at(block, |bridge| bridge.state_for_btc_release_client())
        .into_iter()
        .map(|(key, _)| key)
        .collect::<Vec<_>>();
    keys.sort();
    keys
}

#[test]
fn test_migration_and_batch_built_in_one_block_are_both_signed() {
    let mut harness = harness_with_retiring_funds();
    harness.release(27, Caller::Account(Address::repeat_byte(0xbb)), 50_000, H256::repeat_byte(27));

    harness.update(41, H256::repeat_byte(41));
    assert_eq!(harness.waiting_for_confirmations(41), 2);

    harness.update(51, H256::repeat_byte(51));
    assert_eq!(harness.waiting_for_signatures(51), 1);
    harness.update(52, H256::repeat_byte(52));
    assert_eq!(harness.waiting_for_signatures(52), 2);
    assert_eq!(harness.waiting_for_confirmations(52), 0);
    assert_eq!(
        signing_keys(&mut harness, 52),
        vec![H256::repeat_byte(41), H256::repeat_byte(51)]
    );
}

#[test]
fn test_migration_promotion_skips_a_block_whose_hash_is_taken() {
    let mut harness = harness_with_retiring_funds();
    harness.update(41, H256::repeat_byte(41));
    assert_eq!(harness.waiting_for_confirmations(41), 1);

    // the batch built in 51 is keyed by 51, so the migration waits a block
    harness.release(50, Caller::Account(Address::repeat_byte(0xbb)), 50_000, H256::repeat_byte(50));
    harness.update(51, H256::repeat_byte(51));
    assert_eq!(harness.waiting_for_confirmations(51), 2);
    assert_eq!(harness.waiting_for_signatures(51), 0);

    harness.update(52, H256::repeat_byte(52));
    assert_eq!(harness.waiting_for_signatures(52), 1);
    harness.update(61, H256::repeat_byte(61));
    assert_eq!(harness.waiting_for_signatures(61), 2);
    assert_eq!(
        signing_keys(&mut harness, 61),
        vec![H256::repeat_byte(51), H256::repeat_byte(52)]
    );
}

#[test]
fn test_retired_federators_sign_their_migration() {
    let mut harness = harness_with_retiring_funds();
    harness.update(41, H256::repeat_byte(41));
    harness.update(42, H256::repeat_byte(42));
    assert_eq!(harness.at(42, |bridge| bridge.retiring_federation()), None);

    harness.update(51, H256::repeat_byte(51));
    let (key, unsigned) = harness.at(51, |bridge| bridge.state_for_btc_release_client())[0].clone();
    assert_eq!(key, H256::repeat_byte(51));

    let signatures = sign(&unsigned, 1);
    assert_eq!(
        harness.at(52, |bridge| bridge.add_signature(public_key(1), signatures, key)),
        SignatureOutcome::Accepted
    );
    let signatures = sign(&unsigned, 2);
    assert!(matches!(
        harness.at(52, |bridge| bridge.add_signature(public_key(2), signatures, key)),
        SignatureOutcome::Complete(_)
    ));
    assert_eq!(harness.waiting_for_signatures(52), 0);
}

#[test]
fn test_flyover_funds_are_registered_and_released() {
    let mut harness = Harness::regtest();
    let genesis = harness.genesis();
    let derivation_hash = [7; 32];
    let to_flyover = |nonce: u8| {
        let mut tx = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), nonce);
        tx.output[0].script_pubkey = genesis.flyover_p2sh_script(&derivation_hash).unwrap();
        tx
    };

    assert_eq!(harness.register(1, &to_flyover(1)), RegisterOutcome::UnknownTransaction);
    assert!(harness.at(1, |bridge| bridge.register_flyover_derivation_hash(derivation_hash)));
    assert!(!harness.at(1, |bridge| bridge.register_flyover_derivation_hash(derivation_hash)));

    assert_eq!(
        harness.register(2, &to_flyover(2)),
        RegisterOutcome::PeginRegistered { amount: 100_000 }
    );
    let utxos = harness.at(2, |bridge| bridge.active_federation_utxos());
    assert_eq!(utxos.len(), 1);
    assert_eq!(
        utxos[0].script_pubkey,
        genesis.flyover_p2sh_script(&derivation_hash).unwrap()
    );

    harness.release(3, Caller::Account(Address::repeat_byte(0xbb)), 50_000, H256::repeat_byte(3));
    harness.update(4, H256::repeat_byte(4));
    assert!(harness.at(4, |bridge| bridge.active_federation_utxos()).is_empty());
    harness.update(14, H256::repeat_byte(14));

    let (key, unsigned) = harness.at(14, |bridge| bridge.state_for_btc_release_client())[0].clone();
    assert_eq!(key, H256::repeat_byte(4));
    for federator in [1, 2] {
        let signatures = sign(&unsigned, federator);
        let outcome = harness.at(14, |bridge| {
            bridge.add_signature(public_key(federator), signatures, key)
        });
        assert_ne!(outcome, SignatureOutcome::NotFederationMember);
    }
    assert_eq!(harness.waiting_for_signatures(14), 0);
    assert_eq!(harness.events.count("release_btc"), 1);
}

#[test]
fn test_flyover_hashes_need_activation() {
    let mut harness = Harness::with_activations(
        ActivationConfig::all_active_from(0).with_rule(ConsensusRule::FlyoverScripts, None),
    );
    assert!(!harness.at(1, |bridge| bridge.register_flyover_derivation_hash([7; 32])));
}

#[test]
fn test_federation_change_lifecycle() {
    let mut harness = Harness::regtest();
    let genesis = harness.genesis();
    let [alice, bob] = federation_voters();
    let carol = Address::repeat_byte(0x13);
    let create = CallSpec::new("create", vec![]);

    assert_eq!(
        harness.vote_federation(5, Address::repeat_byte(0x99), &create),
        FederationChangeResult::GenericError
    );
    assert_eq!(
        harness.vote_federation(5, alice, &CallSpec::new("add", vec![public_key(4).serialize().to_vec()])),
        FederationChangeResult::NoPendingFederation
    );
    assert_eq!(harness.vote_federation(5, alice, &create), FederationChangeResult::Success);
    assert_eq!(harness.vote_federation(5, alice, &create), FederationChangeResult::GenericError);
    assert!(harness.at(5, |bridge| bridge.pending_federation()).is_none());
    assert_eq!(harness.vote_federation(5, bob, &create), FederationChangeResult::Success);
    assert!(harness.at(5, |bridge| bridge.pending_federation()).is_some());
    assert_eq!(
        harness.vote_federation(5, carol, &create),
        FederationChangeResult::PendingFederationExists
    );

    for key in [4, 5, 6] {
        harness.vote_federation_by_majority(
            5,
            CallSpec::new("add", vec![public_key(key).serialize().to_vec()]),
        );
    }
    assert_eq!(
        harness.vote_federation(5, alice, &CallSpec::new("add", vec![public_key(4).serialize().to_vec()])),
        FederationChangeResult::KeyAlreadyPresent
    );
    assert_eq!(
        harness.vote_federation(5, alice, &CallSpec::new("commit", vec![vec![0; 32]])),
        FederationChangeResult::HashMismatch
    );

    let hash = harness.at(5, |bridge| bridge.pending_federation_hash()).unwrap();
    harness.vote_federation_by_majority(5, CallSpec::new("commit", vec![hash.to_byte_array().to_vec()]));
    assert!(harness.at(5, |bridge| bridge.pending_federation()).is_none());

    let expected = Federation::new(
        [4, 5, 6]
            .into_iter()
            .map(|key| FederationMember::from_single_key(public_key(key)))
            .collect(),
        5 * 30_000,
        5,
        genesis.network(),
    )
    .unwrap();
    let committed = harness.events.events().iter().find_map(|event| match event {
        BridgeEvent::CommitFederation {
            old_federation,
            new_federation,
            activation_height,
        } => Some((old_federation.clone(), new_federation.clone(), *activation_height)),
        _ => None,
    });
    assert_eq!(committed, Some((genesis.clone(), expected.clone(), 25)));

    assert_eq!(harness.at(6, |bridge| bridge.active_federation()), genesis);
    assert_eq!(harness.at(6, |bridge| bridge.proposed_federation()), Some(expected.clone()));
    assert_eq!(
        harness.vote_federation(6, alice, &create),
        FederationChangeResult::AwaitingActivation
    );

    assert_eq!(harness.at(25, |bridge| bridge.active_federation()), expected);
    assert_eq!(harness.at(25, |bridge| bridge.retiring_federation()), Some(genesis));
    assert_eq!(harness.at(25, |bridge| bridge.proposed_federation()), None);
    assert_eq!(harness.at(25, |bridge| bridge.active_federation_size()), 3);
    assert_eq!(harness.at(25, |bridge| bridge.active_federation_threshold()), 2);
    assert_eq!(
        harness.vote_federation(25, alice, &create),
        FederationChangeResult::RetiringFederationExists
    );
}

#[test]
fn test_pending_federation_rollback() {
    let mut harness = Harness::regtest();
    harness.vote_federation_by_majority(1, CallSpec::new("create", vec![]));
    harness.vote_federation_by_majority(
        1,
        CallSpec::new("add", vec![public_key(4).serialize().to_vec()]),
    );
    assert_eq!(
        harness
            .at(1, |bridge| bridge.pending_federation())
            .map(|pending| pending.size()),
        Some(1)
    );
    harness.vote_federation_by_majority(1, CallSpec::new("rollback", vec![]));
    assert!(harness.at(1, |bridge| bridge.pending_federation()).is_none());
    assert_eq!(
        harness.vote_federation(1, Address::repeat_byte(0x11), &CallSpec::new("rollback", vec![])),
        FederationChangeResult::NoPendingFederation
    );
}

#[test]
fn test_retiring_funds_migrate_within_window() {
    let mut harness = Harness::regtest();
    let genesis = harness.genesis();
    let pegin = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), 1);
    harness.register(1, &pegin);
    harness.elect_federation(5, &[4, 5, 6]);

    // active from 25, migration window opens after age 35
    harness.update(30, H256::repeat_byte(30));
    assert_eq!(harness.waiting_for_confirmations(30), 0);
    assert_eq!(harness.at(30, |bridge| bridge.retiring_federation_utxos()).len(), 1);

    harness.update(41, H256::repeat_byte(41));
    assert_eq!(harness.waiting_for_confirmations(41), 1);
    assert!(harness.at(41, |bridge| bridge.retiring_federation_utxos()).is_empty());
    assert_eq!(harness.at(41, |bridge| bridge.retiring_federation()), Some(genesis));

    harness.update(42, H256::repeat_byte(42));
    assert_eq!(harness.at(42, |bridge| bridge.retiring_federation()), None);
    assert_eq!(harness.waiting_for_confirmations(42), 1);
}

#[test]
fn test_migration_needs_minimum_funds_until_window_closes() {
    let mut harness = Harness::regtest();
    let genesis = harness.genesis();
    let pegin = pegin_tx(&genesis, 100_000, Some(Address::repeat_byte(1)), Some(9), 1);
    harness.register(1, &pegin);

    for voter in [Address::repeat_byte(0x21), Address::repeat_byte(0x22)] {
        assert_eq!(
            harness.at(2, |bridge| bridge.vote_fee_per_kb_change(voter, 200_000)),
            FeePerKbChangeResult::Success
        );
    }
    assert_eq!(harness.at(2, |bridge| bridge.fee_per_kb()), 200_000);
    harness.elect_federation(5, &[4, 5, 6]);

    harness.update(41, H256::repeat_byte(41));
    assert_eq!(harness.waiting_for_confirmations(41), 0);
    assert_eq!(harness.at(41, |bridge| bridge.retiring_federation_utxos()).len(), 1);

    // past the window the remaining funds are moved and the federation retired
    harness.update(175, H256::repeat_byte(175));
    assert_eq!(harness.waiting_for_confirmations(175), 1);
    assert_eq!(harness.at(175, |bridge| bridge.retiring_federation()), None);
}

#[test]
fn test_fee_per_kb_votes() {
    let mut harness = Harness::regtest();
    let alice = Address::repeat_byte(0x21);
    let bob = Address::repeat_byte(0x22);

    assert_eq!(
        harness.at(1, |bridge| bridge.vote_fee_per_kb_change(Address::repeat_byte(0x99), 20_000)),
        FeePerKbChangeResult::Unauthorized
    );
    assert_eq!(
        harness.at(1, |bridge| bridge.vote_fee_per_kb_change(alice, 0)),
        FeePerKbChangeResult::NonPositiveFee
    );
    assert_eq!(
        harness.at(1, |bridge| bridge.vote_fee_per_kb_change(alice, 5_000_001)),
        FeePerKbChangeResult::ExcessiveFee
    );
    assert_eq!(
        harness.at(1, |bridge| bridge.vote_fee_per_kb_change(alice, 20_000)),
        FeePerKbChangeResult::Success
    );
    assert_eq!(
        harness.at(1, |bridge| bridge.vote_fee_per_kb_change(alice, 20_000)),
        FeePerKbChangeResult::VoteRejected
    );
    assert_eq!(harness.at(1, |bridge| bridge.fee_per_kb()), 10_000);
    harness.at(1, |bridge| bridge.vote_fee_per_kb_change(bob, 20_000));
    assert_eq!(harness.at(1, |bridge| bridge.fee_per_kb()), 20_000);
}

#[test]
fn test_locking_cap_only_grows_within_multiplier() {
    let mut harness = Harness::regtest();
    let owner = Address::repeat_byte(0x31);
    let initial = harness.constants.initial_locking_cap;

    assert!(!harness.at(1, |bridge| bridge.increase_locking_cap(Address::repeat_byte(0x99), initial + 1)));
    assert!(!harness.at(1, |bridge| bridge.increase_locking_cap(owner, initial - 1)));
    assert!(!harness.at(1, |bridge| bridge.increase_locking_cap(owner, initial * 2 + 1)));
    assert!(harness.at(1, |bridge| bridge.increase_locking_cap(owner, initial * 2)));
    assert_eq!(harness.at(1, |bridge| bridge.locking_cap()), initial * 2);
}
