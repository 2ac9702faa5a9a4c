//! In-memory block store

use crate::block_store::BlockStore;
use crate::stats::{BlockStoreStats, StatsCounters};
use async_trait::async_trait;
use dashmap::DashMap;
use depot_core::hash::to_hex;
use depot_core::{BlockHash, ContentIndex, Error, Result, StoredBlock};
use parking_lot::Mutex;

/// Blocks held in a concurrent map, index in insertion order
#[derive(Default)]
pub struct MemBlockStore {
    blocks: DashMap<BlockHash, StoredBlock>,
    order: Mutex<Vec<BlockHash>>,
    stats: StatsCounters,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, block_hash: BlockHash) -> bool {
        self.blocks.contains_key(&block_hash)
    }
}

#[async_trait]
impl BlockStore for MemBlockStore {
    async fn put_stored_block(&self, block: StoredBlock) -> Result<()> {
        let hash = block.block_hash();
        let result = Ok(());
        self.stats.on_put(&block, &result);
        if let dashmap::mapref::entry::Entry::Vacant(slot) = self.blocks.entry(hash) {
            slot.insert(block);
            self.order.lock().push(hash);
        }
        result
    }

    async fn get_stored_block(&self, block_hash: BlockHash) -> Result<StoredBlock> {
        let result = self
            .blocks
            .get(&block_hash)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::NotFound(format!("block {}", to_hex(block_hash))));
        self.stats.on_get(&result);
        result
    }

    async fn preflight_get(&self, _block_hashes: &[BlockHash], _ref_counts: &[u32]) -> Result<()> {
        let result = Ok(());
        self.stats.on_preflight(&result);
        result
    }

    async fn get_index(&self) -> Result<ContentIndex> {
        let hashes = self.order.lock().clone();
        let indexes: Vec<_> = hashes
            .iter()
            .filter_map(|h| self.blocks.get(h).map(|b| b.index.clone()))
            .collect();
        let result = Ok(ContentIndex::from_block_indexes(&indexes));
        self.stats.on_index(&result);
        result
    }

    async fn retarget_content(&self, content_index: &ContentIndex) -> Result<ContentIndex> {
        let result = match self.get_index().await {
            Ok(own) => depot_core::retarget_content(&own, content_index),
            Err(e) => Err(e),
        };
        self.stats.on_retarget(&result);
        result
    }

    fn get_stats(&self) -> BlockStoreStats {
        self.stats.snapshot()
    }

    async fn flush(&self) -> Result<()> {
        self.stats.on_flush();
        Ok(())
    }
}
