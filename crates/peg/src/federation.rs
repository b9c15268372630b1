use crate::Error;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_DROP, OP_PUSHBYTES_0};
use bitcoin::script::{Builder, Instruction, PushBytesBuf, Script, ScriptBuf};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Network, OutPoint, Sequence, TxIn, Witness};
use ethers_core::types::Address as AccountAddress;
use ethers_core::utils::keccak256;
use serde_derive::{Deserialize, Serialize};

/// P2SH redeem scripts are limited to 520 bytes, which caps a standard
/// multisig at 15 keys.
pub const MAX_FEDERATION_SIZE: usize = 15;
pub const MIN_PENDING_FEDERATION_SIZE: usize = 2;
/// Upper bound of a DER signature plus its sighash byte.
const MAX_SIGNATURE_PUSH_LEN: usize = 73;
const FLYOVER_PREFIX_LEN: usize = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Btc,
    Account,
    Mst,
}

/// One custodian of a federation. A member holds a key for signing on the
/// UTXO chain, one for the account chain and one for maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationMember {
    btc_public_key: PublicKey,
    account_public_key: PublicKey,
    mst_public_key: PublicKey,
}

impl FederationMember {
    pub fn new(
        btc_public_key: PublicKey,
        account_public_key: PublicKey,
        mst_public_key: PublicKey,
    ) -> Self {
        Self {
            btc_public_key,
            account_public_key,
            mst_public_key,
        }
    }

    /// A member that uses the same key on every chain.
    pub fn from_single_key(key: PublicKey) -> Self {
        Self::new(key, key, key)
    }

    pub fn btc_public_key(&self) -> PublicKey {
        self.btc_public_key
    }

    pub fn account_public_key(&self) -> PublicKey {
        self.account_public_key
    }

    pub fn mst_public_key(&self) -> PublicKey {
        self.mst_public_key
    }

    pub fn public_key(&self, key_type: KeyType) -> PublicKey {
        match key_type {
            KeyType::Btc => self.btc_public_key,
            KeyType::Account => self.account_public_key,
            KeyType::Mst => self.mst_public_key,
        }
    }

    pub fn account_address(&self) -> AccountAddress {
        account_address_of(&self.account_public_key)
    }

    fn sort_key(&self) -> ([u8; 33], [u8; 33], [u8; 33]) {
        (
            self.btc_public_key.serialize(),
            self.account_public_key.serialize(),
            self.mst_public_key.serialize(),
        )
    }
}

pub fn account_address_of(key: &PublicKey) -> AccountAddress {
    let hash = keccak256(&key.serialize_uncompressed()[1..]);
    AccountAddress::from_slice(&hash[12..])
}

fn into_canonical_order(mut members: Vec<FederationMember>) -> Result<Vec<FederationMember>, Error> {
    members.sort_by_key(FederationMember::sort_key);
    let has_duplicates = members
        .windows(2)
        .any(|pair| pair[0].btc_public_key == pair[1].btc_public_key);
    if has_duplicates {
        return Err(Error::InvalidFederation(
            "duplicate btc public key".to_string(),
        ));
    }
    Ok(members)
}

pub(crate) fn push_bytes(data: &[u8]) -> Result<PushBytesBuf, Error> {
    PushBytesBuf::try_from(data.to_vec())
        .map_err(|_| Error::InvalidArgument(format!("push of {} bytes", data.len())))
}

/// Standard `OP_M <keys> OP_N OP_CHECKMULTISIG`, keys in the given order.
pub fn multisig_redeem_script(threshold: usize, keys: &[PublicKey]) -> ScriptBuf {
    keys.iter()
        .fold(Builder::new().push_int(threshold as i64), |builder, key| {
            builder.push_key(&bitcoin::PublicKey::new(*key))
        })
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// `OP_0 <sig>... <redeem script>`. Empty signatures become `OP_0`
/// placeholders.
pub fn multisig_script_sig(signatures: &[Vec<u8>], redeem_script: &Script) -> Result<ScriptBuf, Error> {
    let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
    for signature in signatures {
        builder = if signature.is_empty() {
            builder.push_opcode(OP_PUSHBYTES_0)
        } else {
            builder.push_slice(push_bytes(signature)?)
        };
    }
    Ok(builder
        .push_slice(push_bytes(redeem_script.as_bytes())?)
        .into_script())
}

/// Prefixes a redeem script with `<derivation hash> OP_DROP`.
pub fn flyover_redeem_script(derivation_hash: &[u8; 32], redeem_script: &Script) -> Result<ScriptBuf, Error> {
    let mut bytes = Builder::new()
        .push_slice(push_bytes(derivation_hash)?)
        .push_opcode(OP_DROP)
        .into_script()
        .to_bytes();
    bytes.extend_from_slice(redeem_script.as_bytes());
    Ok(ScriptBuf::from(bytes))
}

/// Returns the wrapped script if `script` carries a flyover prefix.
pub fn strip_flyover_prefix(script: &Script) -> Option<ScriptBuf> {
    let bytes = script.as_bytes();
    if bytes.len() > FLYOVER_PREFIX_LEN
        && bytes[0] == 32
        && bytes[FLYOVER_PREFIX_LEN - 1] == OP_DROP.to_u8()
    {
        Some(ScriptBuf::from(bytes[FLYOVER_PREFIX_LEN..].to_vec()))
    } else {
        None
    }
}

/// Threshold and keys of a standard multisig redeem script, with or
/// without a flyover prefix.
pub fn parse_multisig_redeem_script(script: &Script) -> Option<(usize, Vec<PublicKey>)> {
    let standard = strip_flyover_prefix(script);
    let script = standard.as_deref().unwrap_or(script);

    let instructions = script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let (first, rest) = instructions.split_first()?;
    let (last, rest) = rest.split_last()?;
    let (count, key_pushes) = rest.split_last()?;

    let small_int = |instruction: &Instruction| match instruction {
        Instruction::Op(op) if (0x51..=0x60).contains(&op.to_u8()) => {
            Some((op.to_u8() - 0x50) as usize)
        }
        _ => None,
    };

    let threshold = small_int(first)?;
    let count = small_int(count)?;
    if !matches!(last, Instruction::Op(op) if *op == OP_CHECKMULTISIG) {
        return None;
    }

    let keys = key_pushes
        .iter()
        .map(|instruction| match instruction {
            Instruction::PushBytes(bytes) => PublicKey::from_slice(bytes.as_bytes()).ok(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    if keys.len() != count || threshold > count {
        return None;
    }
    Some((threshold, keys))
}

#[derive(Serialize, Deserialize)]
struct FederationRecord {
    members: Vec<FederationMember>,
    creation_time: u64,
    creation_block_number: u64,
    network: Network,
}

/// An immutable M-of-N custodian with threshold `n/2 + 1`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "FederationRecord", into = "FederationRecord")]
pub struct Federation {
    members: Vec<FederationMember>,
    creation_time: u64,
    creation_block_number: u64,
    network: Network,
    redeem_script: ScriptBuf,
    p2sh_script: ScriptBuf,
    address: Address,
    spending_input_size: usize,
}

impl Federation {
    pub fn new(
        members: Vec<FederationMember>,
        creation_time: u64,
        creation_block_number: u64,
        network: Network,
    ) -> Result<Self, Error> {
        if members.is_empty() || members.len() > MAX_FEDERATION_SIZE {
            return Err(Error::InvalidFederation(format!(
                "federation size {} out of range",
                members.len()
            )));
        }
        let members = into_canonical_order(members)?;
        let threshold = members.len() / 2 + 1;

        let keys = members
            .iter()
            .map(FederationMember::btc_public_key)
            .collect::<Vec<_>>();
        let redeem_script = multisig_redeem_script(threshold, &keys);
        let p2sh_script = ScriptBuf::new_p2sh(&redeem_script.script_hash());
        let address = Address::p2sh(&redeem_script, network)
            .map_err(|e| Error::InvalidFederation(e.to_string()))?;

        let spending_input_size = {
            let dummy_signatures = vec![vec![0u8; MAX_SIGNATURE_PUSH_LEN]; threshold];
            let txin = TxIn {
                previous_output: OutPoint::default(),
                script_sig: multisig_script_sig(&dummy_signatures, &redeem_script)?,
                sequence: Sequence::MAX,
                witness: Witness::default(),
            };
            serialize(&txin).len()
        };

        Ok(Self {
            members,
            creation_time,
            creation_block_number,
            network,
            redeem_script,
            p2sh_script,
            address,
            spending_input_size,
        })
    }

    pub fn members(&self) -> &[FederationMember] {
        &self.members
    }

    pub fn btc_public_keys(&self) -> Vec<PublicKey> {
        self.members.iter().map(FederationMember::btc_public_key).collect()
    }

    pub fn member_public_key(&self, index: usize, key_type: KeyType) -> Option<PublicKey> {
        self.members.get(index).map(|member| member.public_key(key_type))
    }

    pub fn has_btc_public_key(&self, key: &PublicKey) -> bool {
        self.members.iter().any(|member| member.btc_public_key == *key)
    }

    pub fn has_member_with_account_address(&self, address: &AccountAddress) -> bool {
        self.members
            .iter()
            .any(|member| member.account_address() == *address)
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn threshold(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn creation_block_number(&self) -> u64 {
        self.creation_block_number
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn redeem_script(&self) -> &ScriptBuf {
        &self.redeem_script
    }

    pub fn p2sh_script(&self) -> &ScriptBuf {
        &self.p2sh_script
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Serialized size of an input spending this federation once fully signed.
    pub fn spending_input_size(&self) -> usize {
        self.spending_input_size
    }

    pub fn flyover_redeem_script(&self, derivation_hash: &[u8; 32]) -> Result<ScriptBuf, Error> {
        flyover_redeem_script(derivation_hash, &self.redeem_script)
    }

    pub fn flyover_p2sh_script(&self, derivation_hash: &[u8; 32]) -> Result<ScriptBuf, Error> {
        let redeem_script = self.flyover_redeem_script(derivation_hash)?;
        Ok(ScriptBuf::new_p2sh(&redeem_script.script_hash()))
    }
}

impl PartialEq for Federation {
    fn eq(&self, other: &Self) -> bool {
        self.members == other.members
            && self.creation_time == other.creation_time
            && self.creation_block_number == other.creation_block_number
            && self.network == other.network
    }
}

impl Eq for Federation {}

impl TryFrom<FederationRecord> for Federation {
    type Error = Error;

    fn try_from(record: FederationRecord) -> Result<Self, Self::Error> {
        Federation::new(
            record.members,
            record.creation_time,
            record.creation_block_number,
            record.network,
        )
    }
}

impl From<Federation> for FederationRecord {
    fn from(federation: Federation) -> Self {
        Self {
            members: federation.members,
            creation_time: federation.creation_time,
            creation_block_number: federation.creation_block_number,
            network: federation.network,
        }
    }
}

/// A candidate federation being assembled by votes. Every mutation returns
/// a new value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFederation {
    members: Vec<FederationMember>,
}

impl PendingFederation {
    pub fn new(members: Vec<FederationMember>) -> Result<Self, Error> {
        Ok(Self {
            members: into_canonical_order(members)?,
        })
    }

    pub fn members(&self) -> &[FederationMember] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn contains_btc_public_key(&self, key: &PublicKey) -> bool {
        self.members.iter().any(|member| member.btc_public_key == *key)
    }

    pub fn add_member(&self, member: FederationMember) -> Result<Self, Error> {
        if self.members.len() >= MAX_FEDERATION_SIZE {
            return Err(Error::InvalidFederation("pending federation is full".to_string()));
        }
        let mut members = self.members.clone();
        members.push(member);
        Self::new(members)
    }

    pub fn is_complete(&self) -> bool {
        self.members.len() >= MIN_PENDING_FEDERATION_SIZE
    }

    /// Double sha256 of the concatenated btc public keys in canonical order.
    pub fn hash(&self) -> sha256d::Hash {
        let bytes = self
            .members
            .iter()
            .flat_map(|member| member.btc_public_key.serialize())
            .collect::<Vec<_>>();
        sha256d::Hash::hash(&bytes)
    }

    pub fn build_federation(
        &self,
        creation_time: u64,
        creation_block_number: u64,
        network: Network,
    ) -> Result<Federation, Error> {
        if !self.is_complete() {
            return Err(Error::InvalidFederation(
                "pending federation is incomplete".to_string(),
            ));
        }
        Federation::new(
            self.members.clone(),
            creation_time,
            creation_block_number,
            network,
        )
    }
}
