use crate::Error;
use ethers_core::types::Address;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A proposed change: the function to execute and its raw arguments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallSpec {
    function: String,
    arguments: Vec<Vec<u8>>,
}

impl CallSpec {
    pub fn new(function: impl Into<String>, arguments: Vec<Vec<u8>>) -> Self {
        Self {
            function: function.into(),
            arguments,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn arguments(&self) -> &[Vec<u8>] {
        &self.arguments
    }
}

pub trait Authorizer {
    fn is_authorized(&self, voter: &Address) -> bool;
    fn required_authorized_keys(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinimumRequiredCalculation {
    One,
    Majority,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBasedAuthorizer {
    authorized_addresses: Vec<Address>,
    required_calculation: MinimumRequiredCalculation,
}

impl AddressBasedAuthorizer {
    pub fn new(
        authorized_addresses: Vec<Address>,
        required_calculation: MinimumRequiredCalculation,
    ) -> Self {
        Self {
            authorized_addresses,
            required_calculation,
        }
    }

    pub fn authorized_addresses(&self) -> &[Address] {
        &self.authorized_addresses
    }
}

impl Authorizer for AddressBasedAuthorizer {
    fn is_authorized(&self, voter: &Address) -> bool {
        self.authorized_addresses.contains(voter)
    }

    fn required_authorized_keys(&self) -> usize {
        let count = self.authorized_addresses.len();
        match self.required_calculation {
            MinimumRequiredCalculation::One => 1,
            MinimumRequiredCalculation::Majority => count / 2 + 1,
            MinimumRequiredCalculation::All => count,
        }
    }
}

/// Persisted form of an election: every proposed change with its voters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionVotes(Vec<(CallSpec, Vec<Address>)>);

impl ElectionVotes {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One vote per authorized voter per distinct call; a call wins once its
/// voter count reaches the authorizer's quorum.
#[derive(Debug, Clone)]
pub struct Election<A: Authorizer> {
    authorizer: A,
    votes: BTreeMap<CallSpec, BTreeSet<Address>>,
}

impl<A: Authorizer> Election<A> {
    pub fn empty(authorizer: A) -> Self {
        Self {
            authorizer,
            votes: BTreeMap::new(),
        }
    }

    /// Rebuilds an election from persisted votes. Fails if any recorded
    /// voter is not authorized.
    pub fn new(authorizer: A, votes: ElectionVotes) -> Result<Self, Error> {
        let mut election = Self::empty(authorizer);
        for (spec, voters) in votes.0 {
            if let Some(voter) = voters
                .iter()
                .find(|voter| !election.authorizer.is_authorized(voter))
            {
                return Err(Error::InvariantViolation(format!(
                    "unauthorized voter {voter:?} in stored election"
                )));
            }
            election.votes.entry(spec).or_default().extend(voters);
        }
        Ok(election)
    }

    pub fn vote(&mut self, spec: CallSpec, voter: Address) -> bool {
        if !self.authorizer.is_authorized(&voter) {
            return false;
        }
        self.votes.entry(spec).or_default().insert(voter)
    }

    pub fn winner(&self) -> Option<CallSpec> {
        let required = self.authorizer.required_authorized_keys();
        self.votes
            .iter()
            .find(|(_, voters)| voters.len() >= required)
            .map(|(spec, _)| spec.clone())
    }

    pub fn clear_winner_votes(&mut self) {
        if let Some(winner) = self.winner() {
            self.votes.remove(&winner);
        }
    }

    pub fn clear(&mut self) {
        self.votes.clear();
    }

    pub fn voters_for(&self, spec: &CallSpec) -> Option<&BTreeSet<Address>> {
        self.votes.get(spec)
    }

    pub fn votes(&self) -> ElectionVotes {
        ElectionVotes(
            self.votes
                .iter()
                .filter(|(_, voters)| !voters.is_empty())
                .map(|(spec, voters)| (spec.clone(), voters.iter().copied().collect()))
                .collect(),
        )
    }
}
