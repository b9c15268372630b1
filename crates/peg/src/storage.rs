use crate::election::ElectionVotes;
use crate::federation::{Federation, PendingFederation};
use crate::lifecycle::UtxoSlot;
use crate::release::confirmations::PegoutsWaitingForConfirmations;
use crate::release::request_queue::ReleaseRequestQueue;
use crate::release::signatures::PegoutsWaitingForSignatures;
use crate::wallet::Utxo;
use crate::Error;
use bitcoin::{ScriptBuf, Txid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use strum::{EnumString, IntoStaticStr};
use tracing::trace;

/// Raw key-value persistence. Writing `None` deletes the key.
pub trait Storage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
    fn put(&mut self, key: &str, value: Option<Vec<u8>>) -> Result<(), Error>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: BTreeMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.data.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: Option<Vec<u8>>) -> Result<(), Error> {
        match value {
            Some(bytes) => self.data.insert(key.to_string(), bytes),
            None => self.data.remove(key),
        };
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, EnumString)]
pub enum StorageKey {
    #[strum(serialize = "newFederation")]
    NewFederation,
    #[strum(serialize = "oldFederation")]
    OldFederation,
    #[strum(serialize = "pendingFederation")]
    PendingFederation,
    #[strum(serialize = "lastRetiredFederationP2SHScript")]
    LastRetiredFederationP2shScript,
    #[strum(serialize = "newFederationBtcUTXOs")]
    NewFederationBtcUtxos,
    #[strum(serialize = "oldFederationBtcUTXOs")]
    OldFederationBtcUtxos,
    #[strum(serialize = "releaseRequestQueue")]
    ReleaseRequestQueue,
    #[strum(serialize = "pegoutsWaitingForConfirmations")]
    PegoutsWaitingForConfirmations,
    #[strum(serialize = "pegoutsWaitingForSignatures")]
    PegoutsWaitingForSignatures,
    #[strum(serialize = "federationElection")]
    FederationElection,
    #[strum(serialize = "feePerKbElection")]
    FeePerKbElection,
    #[strum(serialize = "feePerKb")]
    FeePerKb,
    #[strum(serialize = "lockingCap")]
    LockingCap,
    #[strum(serialize = "nextPegoutHeight")]
    NextPegoutHeight,
    #[strum(serialize = "btcTxHashAP")]
    BtcTxHashAlreadyProcessed,
    #[strum(serialize = "pegoutTxSigHash")]
    PegoutTxSigHash,
    #[strum(serialize = "flyoverDerivationHashes")]
    FlyoverDerivationHashes,
}

impl StorageKey {
    fn name(self) -> &'static str {
        self.into()
    }

    fn with_suffix(self, suffix: impl Display) -> String {
        format!("{}-{suffix}", self.name())
    }
}

#[derive(DeriveSerialize, DeriveDeserialize)]
enum Versioned<T> {
    V1(T),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    Ok(rmp_serde::to_vec(&Versioned::V1(value))?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    match rmp_serde::from_slice(bytes)? {
        Versioned::V1(value) => Ok(value),
    }
}

/// Load state of a stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached<T> {
    Unloaded,
    Present(T),
    Absent,
}

impl<T> Cached<T> {
    pub fn as_option(&self) -> Option<&T> {
        match self {
            Cached::Present(value) => Some(value),
            Cached::Unloaded | Cached::Absent => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self, Cached::Unloaded)
    }
}

struct Slot<T> {
    key: StorageKey,
    value: Cached<T>,
    dirty: bool,
}

impl<T: Serialize + DeserializeOwned> Slot<T> {
    fn new(key: StorageKey) -> Self {
        Self {
            key,
            value: Cached::Unloaded,
            dirty: false,
        }
    }

    fn load(&mut self, storage: &dyn Storage) -> Result<(), Error> {
        if !self.value.is_loaded() {
            trace!("loading {}", self.key.name());
            self.value = match storage.get(self.key.name())? {
                Some(bytes) => Cached::Present(decode(&bytes)?),
                None => Cached::Absent,
            };
        }
        Ok(())
    }

    fn get(&mut self, storage: &dyn Storage) -> Result<Option<&T>, Error> {
        self.load(storage)?;
        Ok(self.value.as_option())
    }

    fn get_or_default_mut(&mut self, storage: &dyn Storage) -> Result<&mut T, Error>
    where
        T: Default,
    {
        self.load(storage)?;
        if let Cached::Absent = self.value {
            self.value = Cached::Present(T::default());
        }
        self.dirty = true;
        match &mut self.value {
            Cached::Present(value) => Ok(value),
            Cached::Unloaded | Cached::Absent => {
                Err(Error::Storage(format!("{} is not loaded", self.key.name())))
            }
        }
    }

    fn set(&mut self, value: Option<T>) {
        self.value = match value {
            Some(value) => Cached::Present(value),
            None => Cached::Absent,
        };
        self.dirty = true;
    }

    fn save(&mut self, storage: &mut dyn Storage) -> Result<(), Error> {
        if !self.dirty {
            return Ok(());
        }
        match &self.value {
            Cached::Present(value) => storage.put(self.key.name(), Some(encode(value)?))?,
            Cached::Absent => storage.put(self.key.name(), None)?,
            Cached::Unloaded => {}
        }
        self.dirty = false;
        Ok(())
    }
}

/// Entries stored one key per item, loaded on first access.
struct KeyedSlot<K, V> {
    prefix: StorageKey,
    entries: BTreeMap<K, Option<V>>,
    dirty: BTreeSet<K>,
}

impl<K: Ord + Clone + Display, V: Serialize + DeserializeOwned + Clone> KeyedSlot<K, V> {
    fn new(prefix: StorageKey) -> Self {
        Self {
            prefix,
            entries: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    fn get(&mut self, storage: &dyn Storage, key: &K) -> Result<Option<V>, Error> {
        if let Some(cached) = self.entries.get(key) {
            return Ok(cached.clone());
        }
        let loaded = storage
            .get(&self.prefix.with_suffix(key))?
            .map(|bytes| decode(&bytes))
            .transpose()?;
        self.entries.insert(key.clone(), loaded.clone());
        Ok(loaded)
    }

    fn set(&mut self, key: K, value: V) {
        self.entries.insert(key.clone(), Some(value));
        self.dirty.insert(key);
    }

    fn save(&mut self, storage: &mut dyn Storage) -> Result<(), Error> {
        for key in std::mem::take(&mut self.dirty) {
            let value = match self.entries.get(&key) {
                Some(Some(value)) => Some(encode(value)?),
                _ => None,
            };
            storage.put(&self.prefix.with_suffix(&key), value)?;
        }
        Ok(())
    }
}

/// A first-input signature hash, keyed by its hex form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SighashKey(pub [u8; 32]);

impl Display for SighashKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Lazily loaded view of all bridge state, written back by `save`.
pub struct BridgeStorageProvider<'a> {
    storage: &'a mut dyn Storage,
    new_federation: Slot<Federation>,
    old_federation: Slot<Federation>,
    pending_federation: Slot<PendingFederation>,
    last_retired_federation_p2sh_script: Slot<ScriptBuf>,
    new_federation_utxos: Slot<Vec<Utxo>>,
    old_federation_utxos: Slot<Vec<Utxo>>,
    release_request_queue: Slot<ReleaseRequestQueue>,
    pegouts_waiting_for_confirmations: Slot<PegoutsWaitingForConfirmations>,
    pegouts_waiting_for_signatures: Slot<PegoutsWaitingForSignatures>,
    federation_election: Slot<ElectionVotes>,
    fee_per_kb_election: Slot<ElectionVotes>,
    fee_per_kb: Slot<u64>,
    locking_cap: Slot<u64>,
    next_pegout_height: Slot<u64>,
    flyover_derivation_hashes: Slot<BTreeSet<[u8; 32]>>,
    processed_btc_txs: KeyedSlot<Txid, u64>,
    pegout_sighashes: KeyedSlot<SighashKey, bool>,
}

impl<'a> BridgeStorageProvider<'a> {
    pub fn new(storage: &'a mut dyn Storage) -> Self {
        Self {
            storage,
            new_federation: Slot::new(StorageKey::NewFederation),
            old_federation: Slot::new(StorageKey::OldFederation),
            pending_federation: Slot::new(StorageKey::PendingFederation),
            last_retired_federation_p2sh_script: Slot::new(
                StorageKey::LastRetiredFederationP2shScript,
            ),
            new_federation_utxos: Slot::new(StorageKey::NewFederationBtcUtxos),
            old_federation_utxos: Slot::new(StorageKey::OldFederationBtcUtxos),
            release_request_queue: Slot::new(StorageKey::ReleaseRequestQueue),
            pegouts_waiting_for_confirmations: Slot::new(
                StorageKey::PegoutsWaitingForConfirmations,
            ),
            pegouts_waiting_for_signatures: Slot::new(StorageKey::PegoutsWaitingForSignatures),
            federation_election: Slot::new(StorageKey::FederationElection),
            fee_per_kb_election: Slot::new(StorageKey::FeePerKbElection),
            fee_per_kb: Slot::new(StorageKey::FeePerKb),
            locking_cap: Slot::new(StorageKey::LockingCap),
            next_pegout_height: Slot::new(StorageKey::NextPegoutHeight),
            flyover_derivation_hashes: Slot::new(StorageKey::FlyoverDerivationHashes),
            processed_btc_txs: KeyedSlot::new(StorageKey::BtcTxHashAlreadyProcessed),
            pegout_sighashes: KeyedSlot::new(StorageKey::PegoutTxSigHash),
        }
    }

    pub fn new_federation(&mut self) -> Result<Option<&Federation>, Error> {
        self.new_federation.get(&*self.storage)
    }

    pub fn set_new_federation(&mut self, federation: Option<Federation>) {
        self.new_federation.set(federation)
    }

    pub fn old_federation(&mut self) -> Result<Option<&Federation>, Error> {
        self.old_federation.get(&*self.storage)
    }

    pub fn set_old_federation(&mut self, federation: Option<Federation>) {
        self.old_federation.set(federation)
    }

    pub fn pending_federation(&mut self) -> Result<Option<&PendingFederation>, Error> {
        self.pending_federation.get(&*self.storage)
    }

    pub fn set_pending_federation(&mut self, pending: Option<PendingFederation>) {
        self.pending_federation.set(pending)
    }

    pub fn last_retired_federation_p2sh_script(&mut self) -> Result<Option<&ScriptBuf>, Error> {
        self.last_retired_federation_p2sh_script.get(&*self.storage)
    }

    pub fn set_last_retired_federation_p2sh_script(&mut self, script: Option<ScriptBuf>) {
        self.last_retired_federation_p2sh_script.set(script)
    }

    fn utxo_slot(&mut self, slot: UtxoSlot) -> &mut Slot<Vec<Utxo>> {
        match slot {
            UtxoSlot::New => &mut self.new_federation_utxos,
            UtxoSlot::Old => &mut self.old_federation_utxos,
        }
    }

    pub fn federation_utxos(&mut self, slot: UtxoSlot) -> Result<Vec<Utxo>, Error> {
        let storage = &*self.storage;
        let utxos = match slot {
            UtxoSlot::New => self.new_federation_utxos.get(storage)?,
            UtxoSlot::Old => self.old_federation_utxos.get(storage)?,
        };
        Ok(utxos.cloned().unwrap_or_default())
    }

    pub fn federation_utxos_mut(&mut self, slot: UtxoSlot) -> Result<&mut Vec<Utxo>, Error> {
        let storage = &*self.storage;
        match slot {
            UtxoSlot::New => self.new_federation_utxos.get_or_default_mut(storage),
            UtxoSlot::Old => self.old_federation_utxos.get_or_default_mut(storage),
        }
    }

    pub fn set_federation_utxos(&mut self, slot: UtxoSlot, utxos: Vec<Utxo>) {
        self.utxo_slot(slot).set(Some(utxos))
    }

    pub fn release_request_queue(&mut self) -> Result<&mut ReleaseRequestQueue, Error> {
        self.release_request_queue
            .get_or_default_mut(&*self.storage)
    }

    pub fn pegouts_waiting_for_confirmations(
        &mut self,
    ) -> Result<&mut PegoutsWaitingForConfirmations, Error> {
        self.pegouts_waiting_for_confirmations
            .get_or_default_mut(&*self.storage)
    }

    pub fn pegouts_waiting_for_signatures(
        &mut self,
    ) -> Result<&mut PegoutsWaitingForSignatures, Error> {
        self.pegouts_waiting_for_signatures
            .get_or_default_mut(&*self.storage)
    }

    pub fn federation_election(&mut self) -> Result<ElectionVotes, Error> {
        Ok(self
            .federation_election
            .get(&*self.storage)?
            .cloned()
            .unwrap_or_default())
    }

    pub fn set_federation_election(&mut self, votes: ElectionVotes) {
        self.federation_election.set(Some(votes))
    }

    pub fn fee_per_kb_election(&mut self) -> Result<ElectionVotes, Error> {
        Ok(self
            .fee_per_kb_election
            .get(&*self.storage)?
            .cloned()
            .unwrap_or_default())
    }

    pub fn set_fee_per_kb_election(&mut self, votes: ElectionVotes) {
        self.fee_per_kb_election.set(Some(votes))
    }

    pub fn fee_per_kb(&mut self) -> Result<Option<u64>, Error> {
        Ok(self.fee_per_kb.get(&*self.storage)?.copied())
    }

    pub fn set_fee_per_kb(&mut self, fee_per_kb: u64) {
        self.fee_per_kb.set(Some(fee_per_kb))
    }

    pub fn locking_cap(&mut self) -> Result<Option<u64>, Error> {
        Ok(self.locking_cap.get(&*self.storage)?.copied())
    }

    pub fn set_locking_cap(&mut self, locking_cap: u64) {
        self.locking_cap.set(Some(locking_cap))
    }

    pub fn next_pegout_height(&mut self) -> Result<Option<u64>, Error> {
        Ok(self.next_pegout_height.get(&*self.storage)?.copied())
    }

    pub fn set_next_pegout_height(&mut self, height: u64) {
        self.next_pegout_height.set(Some(height))
    }

    /// Derivation hashes whose flyover scripts the federations watch.
    pub fn flyover_derivation_hashes(&mut self) -> Result<Vec<[u8; 32]>, Error> {
        Ok(self
            .flyover_derivation_hashes
            .get(&*self.storage)?
            .map(|hashes| hashes.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Returns false if the hash was already known.
    pub fn add_flyover_derivation_hash(&mut self, derivation_hash: [u8; 32]) -> Result<bool, Error> {
        if self
            .flyover_derivation_hashes
            .get(&*self.storage)?
            .is_some_and(|hashes| hashes.contains(&derivation_hash))
        {
            return Ok(false);
        }
        Ok(self
            .flyover_derivation_hashes
            .get_or_default_mut(&*self.storage)?
            .insert(derivation_hash))
    }

    pub fn btc_tx_hash_processed_height(&mut self, txid: &Txid) -> Result<Option<u64>, Error> {
        self.processed_btc_txs.get(&*self.storage, txid)
    }

    pub fn set_btc_tx_hash_processed_height(&mut self, txid: Txid, height: u64) {
        self.processed_btc_txs.set(txid, height)
    }

    pub fn has_pegout_tx_sighash(&mut self, sighash: &SighashKey) -> Result<bool, Error> {
        Ok(self
            .pegout_sighashes
            .get(&*self.storage, sighash)?
            .unwrap_or(false))
    }

    pub fn set_pegout_tx_sighash(&mut self, sighash: SighashKey) {
        self.pegout_sighashes.set(sighash, true)
    }

    /// Writes every modified value back to storage.
    pub fn save(&mut self) -> Result<(), Error> {
        let storage = &mut *self.storage;
        self.new_federation.save(storage)?;
        self.old_federation.save(storage)?;
        self.pending_federation.save(storage)?;
        self.last_retired_federation_p2sh_script.save(storage)?;
        self.new_federation_utxos.save(storage)?;
        self.old_federation_utxos.save(storage)?;
        self.release_request_queue.save(storage)?;
        self.pegouts_waiting_for_confirmations.save(storage)?;
        self.pegouts_waiting_for_signatures.save(storage)?;
        self.federation_election.save(storage)?;
        self.fee_per_kb_election.save(storage)?;
        self.fee_per_kb.save(storage)?;
        self.locking_cap.save(storage)?;
        self.next_pegout_height.save(storage)?;
        self.flyover_derivation_hashes.save(storage)?;
        self.processed_btc_txs.save(storage)?;
        self.pegout_sighashes.save(storage)?;
        Ok(())
    }
}
