//! Extraction of the sender, recipient and refund destination of an
//! incoming peg-in.

use crate::federation::account_address_of;
use bitcoin::hashes::Hash;
use bitcoin::script::Instruction;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{PubkeyHash, Script, ScriptBuf, ScriptHash, Transaction, TxOut};
use ethers_core::types::Address as AccountAddress;
use std::str::FromStr;
use thiserror::Error;

const ACCOUNT_ADDRESS_LEN: usize = 20;
const REFUND_ADDRESS_LEN: usize = 21;
const REFUND_P2PKH: u8 = 1;
const REFUND_P2SH: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeginInformation {
    /// Key of the first input when it spends a P2PKH output.
    pub sender_public_key: Option<PublicKey>,
    pub sender_script: Option<ScriptBuf>,
    pub account_destination: AccountAddress,
    /// Explicit refund destination carried by the payload.
    pub refund_script: Option<ScriptBuf>,
}

impl PeginInformation {
    /// Where rejected funds go: the payload's refund address, else the sender.
    pub fn refund_destination(&self) -> Option<&ScriptBuf> {
        self.refund_script.as_ref().or(self.sender_script.as_ref())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeginParseError {
    #[error("more than one output carries a peg-in payload")]
    AmbiguousPayload,
    #[error("malformed peg-in payload: {0}")]
    MalformedPayload(String),
    #[error("no recipient can be derived")]
    NoDestination,
}

pub trait PeginInformationParser {
    fn parse(&self, tx: &Transaction) -> Result<PeginInformation, PeginParseError>;
}

/// Reads the recipient from an OP_RETURN output. The payload is either the
/// raw 20 address bytes, optionally followed by a type byte and the 20 byte
/// hash of a refund address, or the address as a hex string. Without a
/// payload the recipient is derived from the sender's key.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpReturnPeginParser;

impl PeginInformationParser for OpReturnPeginParser {
    fn parse(&self, tx: &Transaction) -> Result<PeginInformation, PeginParseError> {
        let sender_public_key = sender_public_key(tx);
        let sender_script = sender_public_key.as_ref().map(p2pkh_script);

        let payloads = tx
            .output
            .iter()
            .filter_map(op_return_data)
            .collect::<Vec<_>>();
        let (account_destination, refund_script) = match payloads.as_slice() {
            [] => {
                let key = sender_public_key.ok_or(PeginParseError::NoDestination)?;
                (account_address_of(&key), None)
            }
            [payload] => parse_payload(payload)?,
            _ => return Err(PeginParseError::AmbiguousPayload),
        };

        Ok(PeginInformation {
            sender_public_key,
            sender_script,
            account_destination,
            refund_script,
        })
    }
}

fn p2pkh_script(key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::hash(&key.serialize()))
}

/// The key revealed by a P2PKH spend in the first input.
pub fn sender_public_key(tx: &Transaction) -> Option<PublicKey> {
    let input = tx.input.first()?;
    let pushes = input
        .script_sig
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    match pushes.as_slice() {
        [Instruction::PushBytes(_signature), Instruction::PushBytes(key)] => {
            PublicKey::from_slice(key.as_bytes()).ok()
        }
        _ => None,
    }
}

pub fn sender_script(tx: &Transaction) -> Option<ScriptBuf> {
    sender_public_key(tx).as_ref().map(p2pkh_script)
}

fn op_return_data(tx_out: &TxOut) -> Option<Vec<u8>> {
    let script: &Script = &tx_out.script_pubkey;
    if !script.is_op_return() {
        return None;
    }
    script
        .instructions()
        .filter_map(Result::ok)
        .last()
        .and_then(|instruction| match instruction {
            Instruction::PushBytes(bytes) if !bytes.as_bytes().is_empty() => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
}

fn parse_payload(payload: &[u8]) -> Result<(AccountAddress, Option<ScriptBuf>), PeginParseError> {
    match payload.len() {
        ACCOUNT_ADDRESS_LEN => Ok((AccountAddress::from_slice(payload), None)),
        len if len == ACCOUNT_ADDRESS_LEN + REFUND_ADDRESS_LEN => {
            let (address, refund) = payload.split_at(ACCOUNT_ADDRESS_LEN);
            Ok((AccountAddress::from_slice(address), Some(refund_script(refund)?)))
        }
        _ => {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|_| PeginParseError::MalformedPayload(hex::encode(payload)))?;
            let address = AccountAddress::from_str(text.trim())
                .map_err(|_| PeginParseError::MalformedPayload(text.clone()))?;
            Ok((address, None))
        }
    }
}

fn refund_script(refund: &[u8]) -> Result<ScriptBuf, PeginParseError> {
    let hash = <[u8; 20]>::try_from(&refund[1..])
        .map_err(|_| PeginParseError::MalformedPayload(hex::encode(refund)))?;
    match refund[0] {
        REFUND_P2PKH => Ok(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash))),
        REFUND_P2SH => Ok(ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash))),
        other => Err(PeginParseError::MalformedPayload(format!(
            "unknown refund address type {other}"
        ))),
    }
}
