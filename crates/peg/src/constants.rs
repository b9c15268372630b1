use crate::election::{AddressBasedAuthorizer, MinimumRequiredCalculation};
use crate::federation::{Federation, FederationMember};
use crate::Error;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Network;
use ethers_core::types::Address;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use strum::{EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// Versioned behaviors that switch on at a configured height of the
/// account chain.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    IntoStaticStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConsensusRule {
    /// Use `federation_activation_age` instead of the legacy activation age.
    FederationActivationAge,
    /// Peg-in minimum is checked per federation output instead of on the total.
    PerOutputMinimumPegin,
    /// Peg-ins exceeding the locking cap are refunded.
    LockingCap,
    /// Invalid peg-ins with a known sender are refunded.
    PeginRefunds,
    /// Release minimum is derived from the estimated pegout fee.
    FeeBasedMinimumPegout,
    /// Rejected release requests are refunded to their sender.
    RefundRejectedPegouts,
    /// Release requests are drained as batches on a cooldown.
    BatchedPegouts,
    /// Release transactions are built with version 2.
    TransactionVersion2,
    /// Migration transactions follow the release transaction version.
    /// Before it they are always built with version 1.
    MigrationTransactionVersion2,
    /// Scripts carrying a flyover derivation prefix are recognized.
    FlyoverScripts,
    /// Built pegouts record their first-input sighash for exact classification.
    PegoutTxIndex,
}

/// Activation height of every consensus rule. Rules missing from the map
/// are never active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationConfig {
    heights: BTreeMap<ConsensusRule, u64>,
}

impl ActivationConfig {
    pub fn new(heights: BTreeMap<ConsensusRule, u64>) -> Self {
        Self { heights }
    }

    pub fn all_active_from(height: u64) -> Self {
        Self {
            heights: ConsensusRule::iter().map(|rule| (rule, height)).collect(),
        }
    }

    pub fn with_rule(mut self, rule: ConsensusRule, height: Option<u64>) -> Self {
        match height {
            Some(height) => self.heights.insert(rule, height),
            None => self.heights.remove(&rule),
        };
        self
    }

    pub fn activation_height(&self, rule: ConsensusRule) -> Option<u64> {
        self.heights.get(&rule).copied()
    }

    pub fn for_block(&self, height: u64) -> ForBlock {
        let active = self
            .heights
            .iter()
            .filter(|(_, activation)| **activation <= height)
            .map(|(rule, _)| *rule)
            .collect();
        ForBlock { height, active }
    }
}

/// The set of rules active at one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForBlock {
    height: u64,
    active: BTreeSet<ConsensusRule>,
}

impl ForBlock {
    pub fn is_active(&self, rule: ConsensusRule) -> bool {
        self.active.contains(&rule)
    }

    pub fn height(&self) -> u64 {
        self.height
    }
}

/// Protocol constants of one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConstants {
    pub network: Network,
    pub genesis_federation_public_keys: Vec<PublicKey>,
    /// Milliseconds since the unix epoch.
    pub genesis_federation_creation_time: u64,
    pub genesis_fee_per_kb: u64,
    pub max_fee_per_kb: u64,

    pub btc_to_account_min_confirmations: u32,
    pub account_to_btc_min_confirmations: u64,

    pub legacy_minimum_pegin_value: u64,
    pub minimum_pegin_value: u64,
    pub legacy_minimum_pegout_value: u64,
    pub minimum_pegout_value: u64,
    pub pegout_fee_safety_margin_percentage: u64,

    pub legacy_federation_activation_age: u64,
    pub federation_activation_age: u64,
    pub funds_migration_age_since_activation_begin: u64,
    pub funds_migration_age_since_activation_end: u64,

    pub number_of_blocks_between_pegouts: u64,
    pub max_release_iterations: usize,
    pub max_transaction_size: usize,

    pub pegout_tx_index_activation_btc_height: u32,
    pub pegout_tx_index_grace_period: u32,

    pub btc_header_max_depth: u32,
    pub block_hash_cache_size: usize,

    pub initial_locking_cap: u64,
    pub locking_cap_increments_multiplier: u64,

    pub federation_change_authorizer: AddressBasedAuthorizer,
    pub fee_per_kb_change_authorizer: AddressBasedAuthorizer,
    pub locking_cap_authorizer: AddressBasedAuthorizer,

    pub activations: ActivationConfig,
}

impl BridgeConstants {
    const REGTEST_GENESIS_KEYS: [&'static str; 3] = [
        "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5",
        "02f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f9",
    ];

    pub fn regtest() -> Result<Self, Error> {
        let genesis_federation_public_keys = Self::REGTEST_GENESIS_KEYS
            .iter()
            .map(|key| PublicKey::from_str(key).map_err(|_| Error::InvalidPublicKey))
            .collect::<Result<Vec<_>, _>>()?;

        let constants = Self {
            network: Network::Regtest,
            genesis_federation_public_keys,
            genesis_federation_creation_time: 1_700_000_000_000,
            genesis_fee_per_kb: 10_000,
            max_fee_per_kb: 5_000_000,
            btc_to_account_min_confirmations: 3,
            account_to_btc_min_confirmations: 10,
            legacy_minimum_pegin_value: 100_000,
            minimum_pegin_value: 50_000,
            legacy_minimum_pegout_value: 25_000,
            minimum_pegout_value: 4_000,
            pegout_fee_safety_margin_percentage: 20,
            legacy_federation_activation_age: 10,
            federation_activation_age: 20,
            funds_migration_age_since_activation_begin: 15,
            funds_migration_age_since_activation_end: 150,
            number_of_blocks_between_pegouts: 30,
            max_release_iterations: 30,
            max_transaction_size: 100_000,
            pegout_tx_index_activation_btc_height: 0,
            pegout_tx_index_grace_period: 10,
            btc_header_max_depth: 1_000,
            block_hash_cache_size: 100,
            initial_locking_cap: 100_000_000_000,
            locking_cap_increments_multiplier: 2,
            federation_change_authorizer: AddressBasedAuthorizer::new(
                vec![
                    Address::repeat_byte(0x11),
                    Address::repeat_byte(0x12),
                    Address::repeat_byte(0x13),
                ],
                MinimumRequiredCalculation::Majority,
            ),
            fee_per_kb_change_authorizer: AddressBasedAuthorizer::new(
                vec![
                    Address::repeat_byte(0x21),
                    Address::repeat_byte(0x22),
                    Address::repeat_byte(0x23),
                ],
                MinimumRequiredCalculation::Majority,
            ),
            locking_cap_authorizer: AddressBasedAuthorizer::new(
                vec![Address::repeat_byte(0x31)],
                MinimumRequiredCalculation::One,
            ),
            activations: ActivationConfig::all_active_from(0),
        };
        constants.validate()?;
        Ok(constants)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        let constants: Self = serde_json::from_str(json)?;
        constants.validate()?;
        Ok(constants)
    }

    pub fn validate(&self) -> Result<(), Error> {
        fn invalid(reason: &str) -> Result<(), Error> {
            Err(Error::InvalidConfiguration(reason.to_string()))
        }

        if self.genesis_federation_public_keys.is_empty() {
            return invalid("genesis federation has no keys");
        }
        if self.funds_migration_age_since_activation_begin
            >= self.funds_migration_age_since_activation_end
        {
            return invalid("funds migration window is empty");
        }
        if self.btc_to_account_min_confirmations == 0 || self.account_to_btc_min_confirmations == 0
        {
            return invalid("confirmation depths must be positive");
        }
        if self.max_release_iterations == 0 {
            return invalid("max release iterations must be positive");
        }
        if self.genesis_fee_per_kb == 0 || self.genesis_fee_per_kb > self.max_fee_per_kb {
            return invalid("genesis fee per kb out of range");
        }
        if self.locking_cap_increments_multiplier < 1 {
            return invalid("locking cap multiplier must be at least one");
        }
        Ok(())
    }

    /// The federation active before any federation change is committed.
    pub fn genesis_federation(&self) -> Result<Federation, Error> {
        let members = self
            .genesis_federation_public_keys
            .iter()
            .copied()
            .map(FederationMember::from_single_key)
            .collect();
        Federation::new(
            members,
            self.genesis_federation_creation_time,
            0,
            self.network,
        )
    }
}
