use bitcoin::ScriptBuf;
use ethers_core::types::H256;
use serde_derive::{Deserialize, Serialize};

/// An approved outbound transfer waiting to be embedded in a release
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub destination: ScriptBuf,
    pub amount: u64,
    pub rsk_tx_hash: Option<H256>,
}

/// Result of trying to embed a prefix of the queue in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAttempt<T> {
    Built(T),
    TooLarge,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequestQueue {
    entries: Vec<ReleaseRequest>,
}

impl ReleaseRequestQueue {
    pub fn add(&mut self, destination: ScriptBuf, amount: u64, rsk_tx_hash: Option<H256>) {
        self.entries.push(ReleaseRequest {
            destination,
            amount,
            rsk_tx_hash,
        });
    }

    pub fn entries(&self) -> &[ReleaseRequest] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_amount(&self) -> u64 {
        self.entries.iter().map(|entry| entry.amount).sum()
    }

    /// Hands up to `max_iterations` entries, oldest first, to `processor`.
    /// Entries it rejects are moved behind the untouched ones so the next
    /// pass starts with requests that have not been tried yet.
    pub fn process<F>(&mut self, max_iterations: usize, mut processor: F)
    where
        F: FnMut(&ReleaseRequest) -> bool,
    {
        let take = max_iterations.min(self.entries.len());
        let attempted = self.entries.drain(..take).collect::<Vec<_>>();
        let retry = attempted
            .into_iter()
            .filter(|entry| !processor(entry))
            .collect::<Vec<_>>();
        self.entries.extend(retry);
    }

    /// Offers the whole queue to `build`, halving the batch while it is too
    /// large. The entries of a built batch are removed and returned with it.
    pub fn process_batched<T, F>(&mut self, mut build: F) -> Option<(T, Vec<ReleaseRequest>)>
    where
        F: FnMut(&[ReleaseRequest]) -> BatchAttempt<T>,
    {
        let mut count = self.entries.len();
        while count > 0 {
            match build(&self.entries[..count]) {
                BatchAttempt::Built(result) => return Some((result, self.remove_first(count))),
                BatchAttempt::TooLarge if count > 1 => count /= 2,
                BatchAttempt::TooLarge | BatchAttempt::Failed => return None,
            }
        }
        None
    }

    /// Removes the `count` oldest entries, which a batch has consumed.
    pub fn remove_first(&mut self, count: usize) -> Vec<ReleaseRequest> {
        let count = count.min(self.entries.len());
        self.entries.drain(..count).collect()
    }
}
