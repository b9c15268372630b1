use crate::Error;
use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::hash_types::TxMerkleNode;
use bitcoin::{BlockHash, CompactTarget};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Read access to the best chain of bitcoin headers known to the node.
pub trait BtcHeaderChain {
    fn best_chain_height(&self) -> Result<u32, Error>;
    fn best_block_hash(&self) -> Result<BlockHash, Error>;
    fn header_by_hash(&self, hash: &BlockHash) -> Result<Option<Header>, Error>;
}

/// Block hashes of the best chain by height, valid for one chain tip.
///
/// Holds at most `capacity` entries; the lowest heights are evicted first.
/// A different tip invalidates every entry.
#[derive(Debug, Clone)]
pub struct BlockHashCache {
    capacity: usize,
    tip: Option<BlockHash>,
    hashes: BTreeMap<u32, BlockHash>,
}

impl BlockHashCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tip: None,
            hashes: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    fn sync_tip(&mut self, tip: BlockHash) {
        if self.tip != Some(tip) {
            trace!("BlockHashCache::sync_tip: {tip}");
            self.tip = Some(tip);
            self.hashes.clear();
        }
    }

    fn get(&self, height: u32) -> Option<BlockHash> {
        self.hashes.get(&height).copied()
    }

    /// Closest cached entry at or above `height`.
    fn nearest_above(&self, height: u32) -> Option<(u32, BlockHash)> {
        self.hashes
            .range(height..)
            .next()
            .map(|(height, hash)| (*height, *hash))
    }

    fn insert(&mut self, height: u32, hash: BlockHash) {
        if self.capacity == 0 {
            return;
        }
        self.hashes.insert(height, hash);
        while self.hashes.len() > self.capacity {
            self.hashes.pop_first();
        }
    }
}

/// Depth-bounded lookups over a header chain.
pub struct BtcChainView<'a> {
    chain: &'a dyn BtcHeaderChain,
    cache: &'a mut BlockHashCache,
    max_depth: u32,
}

impl<'a> BtcChainView<'a> {
    pub fn new(chain: &'a dyn BtcHeaderChain, cache: &'a mut BlockHashCache, max_depth: u32) -> Self {
        Self {
            chain,
            cache,
            max_depth,
        }
    }

    pub fn best_chain_height(&self) -> Result<u32, Error> {
        self.chain.best_chain_height()
    }

    /// Blocks on top of and including `height`; zero above the tip.
    pub fn confirmations(&self, height: u32) -> Result<u32, Error> {
        let best = self.chain.best_chain_height()?;
        Ok(if height > best { 0 } else { best - height + 1 })
    }

    pub fn block_hash_at_height(&mut self, height: u32) -> Result<Option<BlockHash>, Error> {
        let best_height = self.chain.best_chain_height()?;
        if height > best_height {
            return Ok(None);
        }
        let depth = best_height - height;
        if depth > self.max_depth {
            return Err(Error::BlockStore(format!(
                "height {height} is {depth} blocks deep, more than {}",
                self.max_depth
            )));
        }

        let tip = self.chain.best_block_hash()?;
        self.cache.sync_tip(tip);
        if let Some(hash) = self.cache.get(height) {
            return Ok(Some(hash));
        }

        let (mut cursor_height, mut cursor) = self
            .cache
            .nearest_above(height)
            .unwrap_or((best_height, tip));
        while cursor_height > height {
            let header = self
                .chain
                .header_by_hash(&cursor)?
                .ok_or_else(|| Error::BlockStore(format!("missing header {cursor}")))?;
            self.cache.insert(cursor_height, cursor);
            cursor = header.prev_blockhash;
            cursor_height -= 1;
        }
        self.cache.insert(height, cursor);
        Ok(Some(cursor))
    }

    pub fn block_hash_at_depth(&mut self, depth: u32) -> Result<Option<BlockHash>, Error> {
        let best_height = self.chain.best_chain_height()?;
        match best_height.checked_sub(depth) {
            Some(height) => self.block_hash_at_height(height),
            None => Ok(None),
        }
    }

    pub fn header_at_height(&mut self, height: u32) -> Result<Option<Header>, Error> {
        match self.block_hash_at_height(height)? {
            Some(hash) => self.chain.header_by_hash(&hash),
            None => Ok(None),
        }
    }

    pub fn merkle_root_at_height(&mut self, height: u32) -> Result<Option<TxMerkleNode>, Error> {
        Ok(self.header_at_height(height)?.map(|header| header.merkle_root))
    }
}

/// Header chain kept in memory, starting at an arbitrary height.
#[derive(Debug, Clone)]
pub struct InMemoryHeaderChain {
    start_height: u32,
    best_chain: Vec<BlockHash>,
    headers: HashMap<BlockHash, Header>,
}

impl InMemoryHeaderChain {
    /// A chain whose first block sits at `start_height`.
    pub fn new(start_height: u32) -> Self {
        Self {
            start_height,
            best_chain: Vec::new(),
            headers: HashMap::new(),
        }
    }

    /// Appends a block committing to `merkle_root` on top of the tip.
    pub fn push_block(&mut self, merkle_root: TxMerkleNode) -> BlockHash {
        let prev_blockhash = self
            .best_chain
            .last()
            .copied()
            .unwrap_or_else(BlockHash::all_zeros);
        let header = Header {
            version: Version::ONE,
            prev_blockhash,
            merkle_root,
            time: self.start_height + self.best_chain.len() as u32,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        };
        let hash = header.block_hash();
        self.headers.insert(hash, header);
        self.best_chain.push(hash);
        hash
    }

    pub fn push_empty_blocks(&mut self, count: u32) {
        for _ in 0..count {
            self.push_block(TxMerkleNode::all_zeros());
        }
    }

    /// Drops every block above `height` so a competing branch can be pushed.
    pub fn truncate_to(&mut self, height: u32) {
        let keep = (height + 1).saturating_sub(self.start_height) as usize;
        self.best_chain.truncate(keep);
    }
}

impl BtcHeaderChain for InMemoryHeaderChain {
    fn best_chain_height(&self) -> Result<u32, Error> {
        match self.best_chain.len() {
            0 => Err(Error::BlockStore("empty header chain".to_string())),
            len => Ok(self.start_height + len as u32 - 1),
        }
    }

    fn best_block_hash(&self) -> Result<BlockHash, Error> {
        self.best_chain
            .last()
            .copied()
            .ok_or_else(|| Error::BlockStore("empty header chain".to_string()))
    }

    fn header_by_hash(&self, hash: &BlockHash) -> Result<Option<Header>, Error> {
        Ok(self.headers.get(hash).copied())
    }
}
