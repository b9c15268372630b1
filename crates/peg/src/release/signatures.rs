use crate::federation::{multisig_script_sig, parse_multisig_redeem_script};
use crate::storage::SighashKey;
use crate::Error;
use bitcoin::hashes::Hash;
use bitcoin::script::{Instruction, ScriptBuf};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, Verification};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Transaction, TxIn};
use ethers_core::types::H256;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Redeem script carried as the last push of an input's scriptSig.
pub fn input_redeem_script(input: &TxIn) -> Option<ScriptBuf> {
    input
        .script_sig
        .instructions()
        .filter_map(Result::ok)
        .last()
        .and_then(|instruction| match instruction {
            Instruction::PushBytes(bytes) => Some(ScriptBuf::from(bytes.as_bytes().to_vec())),
            Instruction::Op(_) => None,
        })
}

/// Legacy SIGHASH_ALL digest for spending input `index` with its redeem script.
pub fn legacy_sighash(tx: &Transaction, index: usize) -> Result<[u8; 32], Error> {
    let input = tx
        .input
        .get(index)
        .ok_or_else(|| Error::InvalidTransaction(format!("no input {index}")))?;
    let redeem_script = input_redeem_script(input)
        .ok_or_else(|| Error::InvalidTransaction(format!("input {index} has no redeem script")))?;
    let sighash = SighashCache::new(tx).legacy_signature_hash(
        index,
        &redeem_script,
        EcdsaSighashType::All.to_u32(),
    )?;
    Ok(sighash.to_byte_array())
}

pub fn signature_hash(tx: &Transaction, index: usize) -> Result<Message, Error> {
    let sighash = legacy_sighash(tx, index)?;
    Message::from_slice(&sighash[..]).map_err(|e| Error::InvalidSignature(e.to_string()))
}

/// Identifies a release transaction before and after it is signed.
pub fn first_input_sighash(tx: &Transaction) -> Option<SighashKey> {
    legacy_sighash(tx, 0).ok().map(SighashKey)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRejection {
    CountMismatch,
    NotFederationMember,
    Malformed,
    NonCanonical,
    Invalid,
    UnsignableTransaction,
}

/// Parses a strict DER signature, rejecting high-S encodings.
pub fn parse_canonical_signature(der: &[u8]) -> Result<Signature, SignatureRejection> {
    let signature = Signature::from_der(der).map_err(|_| SignatureRejection::Malformed)?;
    let mut normalized = signature;
    normalized.normalize_s();
    if normalized != signature {
        return Err(SignatureRejection::NonCanonical);
    }
    Ok(signature)
}

/// Checks one signature per input from `federator` before anything is
/// recorded.
pub fn verify_federator_signatures<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    federator: &PublicKey,
    signatures: &[Vec<u8>],
) -> Result<Vec<Signature>, SignatureRejection> {
    if signatures.len() != tx.input.len() {
        return Err(SignatureRejection::CountMismatch);
    }
    tx.input
        .iter()
        .zip(signatures)
        .enumerate()
        .map(|(index, (input, der))| {
            let redeem_script =
                input_redeem_script(input).ok_or(SignatureRejection::UnsignableTransaction)?;
            let (_, keys) = parse_multisig_redeem_script(&redeem_script)
                .ok_or(SignatureRejection::UnsignableTransaction)?;
            if !keys.contains(federator) {
                return Err(SignatureRejection::NotFederationMember);
            }
            let signature = parse_canonical_signature(der)?;
            let message =
                signature_hash(tx, index).map_err(|_| SignatureRejection::UnsignableTransaction)?;
            secp.verify_ecdsa(&message, &signature, federator)
                .map_err(|_| SignatureRejection::Invalid)?;
            Ok(signature)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartiallySignedTransaction {
    unsigned_transaction: Transaction,
    verified_signatures: Vec<(PublicKey, Vec<Signature>)>,
}

impl PartiallySignedTransaction {
    pub fn new(unsigned_transaction: Transaction) -> Self {
        Self {
            unsigned_transaction,
            verified_signatures: Vec::new(),
        }
    }

    pub fn unsigned_transaction(&self) -> &Transaction {
        &self.unsigned_transaction
    }

    pub fn has_signatures_from(&self, federator: &PublicKey) -> bool {
        self.verified_signatures
            .iter()
            .any(|(key, _)| key == federator)
    }

    pub fn signer_count(&self) -> usize {
        self.verified_signatures.len()
    }

    pub fn add_verified_signatures(&mut self, federator: PublicKey, signatures: Vec<Signature>) {
        if !self.has_signatures_from(&federator) {
            self.verified_signatures.push((federator, signatures));
        }
    }

    fn signature_for(&self, federator: &PublicKey, input_index: usize) -> Option<&Signature> {
        self.verified_signatures
            .iter()
            .find(|(key, _)| key == federator)
            .and_then(|(_, signatures)| signatures.get(input_index))
    }

    /// Signatures for one input in redeem-script key order, at most `threshold`.
    fn input_signatures(&self, input_index: usize) -> Option<(ScriptBuf, Vec<Vec<u8>>, usize)> {
        let input = self.unsigned_transaction.input.get(input_index)?;
        let redeem_script = input_redeem_script(input)?;
        let (threshold, keys) = parse_multisig_redeem_script(&redeem_script)?;
        let signatures = keys
            .iter()
            .filter_map(|key| self.signature_for(key, input_index))
            .take(threshold)
            .map(|signature| {
                bitcoin::ecdsa::Signature {
                    sig: *signature,
                    hash_ty: EcdsaSighashType::All,
                }
                .to_vec()
            })
            .collect();
        Some((redeem_script, signatures, threshold))
    }

    pub fn is_complete(&self) -> bool {
        (0..self.unsigned_transaction.input.len()).all(|index| {
            self.input_signatures(index)
                .map(|(_, signatures, threshold)| signatures.len() >= threshold)
                .unwrap_or(false)
        })
    }

    /// Assembles `OP_0 <sig>... <redeem script>` for every input.
    pub fn finalize(&self) -> Result<Transaction, Error> {
        let mut transaction = self.unsigned_transaction.clone();
        for (index, input) in transaction.input.iter_mut().enumerate() {
            let (redeem_script, signatures, threshold) = self
                .input_signatures(index)
                .ok_or_else(|| Error::InvalidTransaction(format!("input {index} is not signable")))?;
            if signatures.len() < threshold {
                return Err(Error::InvalidSignature(format!(
                    "input {index} has {} of {threshold} signatures",
                    signatures.len()
                )));
            }
            input.script_sig = multisig_script_sig(&signatures, &redeem_script)?;
        }
        Ok(transaction)
    }
}

/// Release transactions waiting for federator signatures, keyed by the
/// account-chain hash that created them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PegoutsWaitingForSignatures {
    entries: BTreeMap<H256, PartiallySignedTransaction>,
}

impl PegoutsWaitingForSignatures {
    pub fn insert(&mut self, key: H256, transaction: Transaction) -> Result<(), Error> {
        if self.entries.contains_key(&key) {
            return Err(Error::InvariantViolation(format!(
                "pegout {key:?} is already waiting for signatures"
            )));
        }
        self.entries
            .insert(key, PartiallySignedTransaction::new(transaction));
        Ok(())
    }

    pub fn contains_key(&self, key: &H256) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &H256) -> Option<&PartiallySignedTransaction> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &H256) -> Option<&mut PartiallySignedTransaction> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &H256) -> Option<PartiallySignedTransaction> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&H256, &PartiallySignedTransaction)> {
        self.entries.iter()
    }
}
