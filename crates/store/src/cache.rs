//! Two-tier store: a local cache in front of a remote store

use crate::block_store::BlockStore;
use crate::pending::PendingRequests;
use crate::stats::{BlockStoreStats, StatsCounters};
use ahash::AHashSet;
use async_trait::async_trait;
use depot_core::hash::to_hex;
use depot_core::{merge_content_index, BlockHash, ContentIndex, Result, SharedHasher, StoredBlock};
use std::sync::Arc;
use tracing::{debug, warn};

/// Reads hit `local` first and fall back to `remote`, filling the cache
///
/// Puts go to both tiers; only the remote outcome is reported.
pub struct CacheBlockStore<L, R> {
    local: Arc<L>,
    remote: Arc<R>,
    hasher: SharedHasher,
    stats: StatsCounters,
    pending: PendingRequests,
}

impl<L: BlockStore, R: BlockStore> CacheBlockStore<L, R> {
    pub fn new(local: Arc<L>, remote: Arc<R>, hasher: SharedHasher) -> Self {
        Self {
            local,
            remote,
            hasher,
            stats: StatsCounters::new(),
            pending: PendingRequests::new(),
        }
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Copy a block fetched from remote into the local tier in the background
    fn spawn_fill(&self, block: &StoredBlock) {
        let guard = self.pending.begin();
        let hash = block.block_hash();
        let copy = block.duplicate(self.hasher.as_ref());
        let local = Arc::clone(&self.local);
        tokio::spawn(async move {
            let _guard = guard;
            let result = match copy {
                Ok(copy) => local.put_stored_block(copy).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!("cached block {}", to_hex(hash)),
                Err(e) => warn!("failed to cache block {}: {e}", to_hex(hash)),
            }
        });
    }

    /// Forward the blocks the local tier does not hold to remote
    async fn preflight_uncached(&self, block_hashes: &[BlockHash], ref_counts: &[u32]) -> Result<()> {
        let cached: AHashSet<BlockHash> =
            self.local.get_index().await?.block_hashes().iter().copied().collect();
        let mut missing = Vec::new();
        let mut missing_counts = Vec::new();
        for (i, hash) in block_hashes.iter().enumerate() {
            if !cached.contains(hash) {
                missing.push(*hash);
                missing_counts.push(ref_counts.get(i).copied().unwrap_or(1));
            }
        }
        debug!(
            "preflight: {} of {} blocks not cached",
            missing.len(),
            block_hashes.len()
        );
        self.remote.preflight_get(&missing, &missing_counts).await
    }

    async fn merged_index(&self) -> Result<ContentIndex> {
        let (remote, local) = tokio::join!(self.remote.get_index(), self.local.get_index());
        Ok(merge_content_index(&remote?, &local?))
    }
}

#[async_trait]
impl<L: BlockStore, R: BlockStore> BlockStore for CacheBlockStore<L, R> {
    async fn put_stored_block(&self, block: StoredBlock) -> Result<()> {
        let _guard = self.pending.begin();
        let hash = block.block_hash();
        let (remote, local) = tokio::join!(
            self.remote.put_stored_block(block.clone()),
            self.local.put_stored_block(block.clone())
        );
        if let Err(e) = local {
            warn!("failed to cache block {} locally: {e}", to_hex(hash));
        }
        self.stats.on_put(&block, &remote);
        remote
    }

    async fn get_stored_block(&self, block_hash: BlockHash) -> Result<StoredBlock> {
        let _guard = self.pending.begin();
        let result = match self.local.get_stored_block(block_hash).await {
            Err(e) if e.is_miss() => {
                debug!("cache miss for block {}", to_hex(block_hash));
                let fetched = self.remote.get_stored_block(block_hash).await;
                if let Ok(block) = &fetched {
                    self.spawn_fill(block);
                }
                fetched
            }
            other => other,
        };
        self.stats.on_get(&result);
        result
    }

    async fn preflight_get(&self, block_hashes: &[BlockHash], ref_counts: &[u32]) -> Result<()> {
        let _guard = self.pending.begin();
        let result = self.preflight_uncached(block_hashes, ref_counts).await;
        self.stats.on_preflight(&result);
        result
    }

    async fn get_index(&self) -> Result<ContentIndex> {
        let _guard = self.pending.begin();
        let result = self.merged_index().await;
        self.stats.on_index(&result);
        result
    }

    async fn retarget_content(&self, content_index: &ContentIndex) -> Result<ContentIndex> {
        let _guard = self.pending.begin();
        let result = match self.merged_index().await {
            Ok(merged) => depot_core::retarget_content(&merged, content_index),
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
        self.pending.wait_idle("cache block store").await;
        let (local, remote) = tokio::join!(self.local.flush(), self.remote.flush());
        local?;
        remote
    }
}
