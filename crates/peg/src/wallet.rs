use crate::federation::Federation;
use crate::Error;
use bdk::database::MemoryDatabase;
use bdk::wallet::coin_selection::{CoinSelectionAlgorithm, Excess, LargestFirstCoinSelection};
use bdk::{FeeRate, KeychainKind, LocalUtxo, WeightedUtxo};
use bitcoin::{OutPoint, Script, ScriptBuf, Transaction, TxOut};
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

/// An unspent output held by a federation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    /// Height of the block that included the funding transaction.
    pub height: u32,
    pub script_pubkey: ScriptBuf,
}

impl Utxo {
    fn to_weighted(&self, satisfaction_weight: usize) -> WeightedUtxo {
        WeightedUtxo {
            satisfaction_weight,
            utxo: bdk::Utxo::Local(LocalUtxo {
                outpoint: self.outpoint,
                txout: TxOut {
                    value: self.value,
                    script_pubkey: self.script_pubkey.clone(),
                },
                keychain: KeychainKind::External,
                is_spent: false,
            }),
        }
    }
}

/// Where the spendable outputs of a wallet come from.
#[derive(Debug, Clone)]
pub enum UtxoProvider {
    /// The federation UTXO set kept in storage. Outputs to scripts the
    /// wallet does not watch are ignored.
    Storage(Vec<Utxo>),
    /// An explicit list, spent as given.
    List(Vec<Utxo>),
    /// Nothing to spend; the wallet only recognizes outputs.
    WatchOnly,
}

/// Which scripts of each federation the wallet recognizes.
#[derive(Debug, Clone, Default)]
pub enum ScriptStrategy {
    #[default]
    Standard,
    /// Also recognize the scripts derived for each flyover derivation hash.
    FlyoverCompatible { derivation_hashes: Vec<[u8; 32]> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedScript {
    pub script_pubkey: ScriptBuf,
    pub redeem_script: ScriptBuf,
    pub threshold: usize,
    pub spending_input_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    InsufficientFunds { needed: u64, available: u64 },
    Provider(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub selected: Vec<Utxo>,
    /// Selected value left over after the target.
    pub remaining: u64,
}

impl CoinSelection {
    pub fn selected_value(&self) -> u64 {
        self.selected.iter().map(|utxo| utxo.value).sum()
    }
}

/// Deterministic wallet over the scripts of one or more federations.
#[derive(Debug, Clone)]
pub struct FederationWallet {
    watched: Vec<WatchedScript>,
    utxos: Vec<Utxo>,
}

impl FederationWallet {
    pub fn new(
        federations: &[&Federation],
        provider: UtxoProvider,
        strategy: ScriptStrategy,
    ) -> Result<Self, Error> {
        let mut watched = Vec::new();
        for federation in federations {
            watched.push(WatchedScript {
                script_pubkey: federation.p2sh_script().clone(),
                redeem_script: federation.redeem_script().clone(),
                threshold: federation.threshold(),
                spending_input_size: federation.spending_input_size(),
            });
            if let ScriptStrategy::FlyoverCompatible { derivation_hashes } = &strategy {
                for hash in derivation_hashes {
                    let redeem_script = federation.flyover_redeem_script(hash)?;
                    watched.push(WatchedScript {
                        script_pubkey: ScriptBuf::new_p2sh(&redeem_script.script_hash()),
                        // the prefix adds a 32 byte push and OP_DROP
                        spending_input_size: federation.spending_input_size() + 34,
                        redeem_script,
                        threshold: federation.threshold(),
                    });
                }
            }
        }

        let utxos = match provider {
            UtxoProvider::Storage(utxos) => utxos
                .into_iter()
                .filter(|utxo| watched.iter().any(|w| w.script_pubkey == utxo.script_pubkey))
                .collect(),
            UtxoProvider::List(utxos) => utxos,
            UtxoProvider::WatchOnly => Vec::new(),
        };

        Ok(Self { watched, utxos })
    }

    pub fn watched_scripts(&self) -> &[WatchedScript] {
        &self.watched
    }

    pub fn watched_script(&self, script_pubkey: &Script) -> Option<&WatchedScript> {
        self.watched
            .iter()
            .find(|watched| watched.script_pubkey.as_script() == script_pubkey)
    }

    pub fn is_watched(&self, script_pubkey: &Script) -> bool {
        self.watched_script(script_pubkey).is_some()
    }

    pub fn redeem_script_for(&self, script_pubkey: &Script) -> Option<&ScriptBuf> {
        self.watched_script(script_pubkey)
            .map(|watched| &watched.redeem_script)
    }

    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    pub fn balance(&self) -> u64 {
        self.utxos.iter().map(|utxo| utxo.value).sum()
    }

    pub fn remove_utxos(&mut self, spent: &[Utxo]) {
        self.utxos.retain(|utxo| !spent.contains(utxo));
    }

    pub fn outputs_to_me<'t>(&self, tx: &'t Transaction) -> Vec<(u32, &'t TxOut)> {
        tx.output
            .iter()
            .enumerate()
            .filter(|(_, txout)| self.is_watched(&txout.script_pubkey))
            .map(|(vout, txout)| (vout as u32, txout))
            .collect()
    }

    pub fn value_sent_to_me(&self, tx: &Transaction) -> u64 {
        self.outputs_to_me(tx)
            .iter()
            .map(|(_, txout)| txout.value)
            .sum()
    }

    /// The outputs of `tx` this wallet can spend, as UTXOs found at `height`.
    pub fn utxos_from(&self, tx: &Transaction, height: u32) -> Vec<Utxo> {
        let txid = tx.txid();
        self.outputs_to_me(tx)
            .into_iter()
            .map(|(vout, txout)| Utxo {
                outpoint: OutPoint { txid, vout },
                value: txout.value,
                height,
                script_pubkey: txout.script_pubkey.clone(),
            })
            .collect()
    }

    /// Largest-first selection of at least `target`. Fees are charged to
    /// the recipients by the caller, so selection runs at a zero fee rate.
    pub fn select_coins(&self, target: u64, drain_script: &Script) -> Result<CoinSelection, SelectionError> {
        let weighted = self
            .utxos
            .iter()
            .map(|utxo| {
                let input_size = self
                    .watched_script(&utxo.script_pubkey)
                    .map(|watched| watched.spending_input_size)
                    .unwrap_or_default();
                utxo.to_weighted(input_size * 4)
            })
            .collect();

        let result = LargestFirstCoinSelection::default()
            .coin_select(
                &MemoryDatabase::new(), // note: this is not really used
                vec![],
                weighted,
                FeeRate::from_sat_per_vb(0.0),
                target,
                drain_script,
            )
            .map_err(|err| match err {
                bdk::Error::InsufficientFunds { needed, available } => {
                    SelectionError::InsufficientFunds { needed, available }
                }
                other => SelectionError::Provider(other.to_string()),
            })?;

        let remaining = match result.excess {
            Excess::Change { amount, fee: _ } => amount,
            Excess::NoChange {
                remaining_amount, ..
            } => remaining_amount,
        };

        let selected = result
            .selected
            .iter()
            .filter_map(|selected| {
                self.utxos
                    .iter()
                    .find(|utxo| utxo.outpoint == selected.outpoint())
                    .cloned()
            })
            .collect::<Vec<_>>();
        debug!(
            "selected {} of {} utxos for target {target}, remaining {remaining}",
            selected.len(),
            self.utxos.len()
        );

        Ok(CoinSelection {
            selected,
            remaining,
        })
    }
}
