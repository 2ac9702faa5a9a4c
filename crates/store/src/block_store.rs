//! The block store interface shared by base stores and decorators

use crate::stats::BlockStoreStats;
use async_trait::async_trait;
use depot_core::{BlockHash, ContentIndex, Result, StoredBlock};
use std::sync::Arc;

/// Asynchronous content-addressed block storage
///
/// Every call resolves exactly once. Decorators forward to an inner store
/// and pass leaf errors through unchanged.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// Store a block; storing a block that already exists is a no-op
    async fn put_stored_block(&self, block: StoredBlock) -> Result<()>;

    /// Fetch a block, `NotFound` if the store does not hold it
    async fn get_stored_block(&self, block_hash: BlockHash) -> Result<StoredBlock>;

    /// Hint that these blocks are about to be fetched
    async fn preflight_get(&self, block_hashes: &[BlockHash], ref_counts: &[u32]) -> Result<()>;

    /// Content index of every block the store holds
    async fn get_index(&self) -> Result<ContentIndex>;

    /// Restrict the store's index to the chunks of `content_index`
    async fn retarget_content(&self, content_index: &ContentIndex) -> Result<ContentIndex>;

    fn get_stats(&self) -> BlockStoreStats;

    /// Resolve once all side work this store started has finished
    async fn flush(&self) -> Result<()>;

    /// Wait for every pending request, then release the store
    async fn dispose(&self) -> Result<()> {
        self.flush().await
    }
}

/// Shared store handle
pub type SharedBlockStore = Arc<dyn BlockStore>;

#[async_trait]
impl<S: BlockStore + ?Sized> BlockStore for Arc<S> {
    async fn put_stored_block(&self, block: StoredBlock) -> Result<()> {
        (**self).put_stored_block(block).await
    }

    async fn get_stored_block(&self, block_hash: BlockHash) -> Result<StoredBlock> {
        (**self).get_stored_block(block_hash).await
    }

    async fn preflight_get(&self, block_hashes: &[BlockHash], ref_counts: &[u32]) -> Result<()> {
        (**self).preflight_get(block_hashes, ref_counts).await
    }

    async fn get_index(&self) -> Result<ContentIndex> {
        (**self).get_index().await
    }

    async fn retarget_content(&self, content_index: &ContentIndex) -> Result<ContentIndex> {
        (**self).retarget_content(content_index).await
    }

    fn get_stats(&self) -> BlockStoreStats {
        (**self).get_stats()
    }

    async fn flush(&self) -> Result<()> {
        (**self).flush().await
    }

    async fn dispose(&self) -> Result<()> {
        (**self).dispose().await
    }
}
