//! Decorator compressing block payloads on put and decompressing on get

use crate::block_store::BlockStore;
use crate::pending::PendingRequests;
use crate::stats::{BlockStoreStats, StatsCounters};
use async_trait::async_trait;
use depot_core::hash::to_hex;
use depot_core::{BlockHash, CompressionRegistry, ContentIndex, Error, Result, StoredBlock};
use std::sync::Arc;
use tracing::debug;

/// Compresses blocks whose tag asks for it before they reach `inner`
pub struct CompressBlockStore<S> {
    inner: S,
    registry: Arc<CompressionRegistry>,
    stats: StatsCounters,
    pending: PendingRequests,
}

impl<S: BlockStore> CompressBlockStore<S> {
    pub fn new(inner: S, registry: Arc<CompressionRegistry>) -> Self {
        Self {
            inner,
            registry,
            stats: StatsCounters::new(),
            pending: PendingRequests::new(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn compress(&self, block: StoredBlock) -> Result<StoredBlock> {
        if block.is_compressed() || block.index.tag == depot_core::COMPRESSION_NONE {
            return Ok(block);
        }
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || {
            let payload = registry.compress_payload(block.index.tag, &block.data)?;
            debug!(
                "compressed block {}: {} -> {} bytes",
                to_hex(block.block_hash()),
                block.data.len(),
                payload.len()
            );
            Ok(StoredBlock::from_payload(block.index, payload))
        })
        .await?
    }

    async fn decompress(&self, block: StoredBlock) -> Result<StoredBlock> {
        if !block.is_compressed() {
            return Ok(block);
        }
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || {
            let data = registry.decompress_payload(block.index.tag, &block.data)?;
            if data.len() as u64 != block.index.data_size() {
                return Err(Error::DataCorruption(format!(
                    "block {} decompressed to {} bytes, chunks total {}",
                    to_hex(block.block_hash()),
                    data.len(),
                    block.index.data_size()
                )));
            }
            Ok(StoredBlock::new(block.index, data))
        })
        .await?
    }
}

#[async_trait]
impl<S: BlockStore> BlockStore for CompressBlockStore<S> {
    async fn put_stored_block(&self, block: StoredBlock) -> Result<()> {
        let _guard = self.pending.begin();
        let stats_view = StoredBlock::new(block.index.clone(), block.data.clone());
        let result = match self.compress(block).await {
            Ok(compressed) => self.inner.put_stored_block(compressed).await,
            Err(e) => Err(e),
        };
        self.stats.on_put(&stats_view, &result);
        result
    }

    async fn get_stored_block(&self, block_hash: BlockHash) -> Result<StoredBlock> {
        let _guard = self.pending.begin();
        let result = match self.inner.get_stored_block(block_hash).await {
            Ok(block) => self.decompress(block).await,
            Err(e) => Err(e),
        };
        self.stats.on_get(&result);
        result
    }

    async fn preflight_get(&self, block_hashes: &[BlockHash], ref_counts: &[u32]) -> Result<()> {
        let _guard = self.pending.begin();
        let result = self.inner.preflight_get(block_hashes, ref_counts).await;
        self.stats.on_preflight(&result);
        result
    }

    async fn get_index(&self) -> Result<ContentIndex> {
        let _guard = self.pending.begin();
        let result = self.inner.get_index().await;
        self.stats.on_index(&result);
        result
    }

    async fn retarget_content(&self, content_index: &ContentIndex) -> Result<ContentIndex> {
        let _guard = self.pending.begin();
        let result = self.inner.retarget_content(content_index).await;
        self.stats.on_retarget(&result);
        result
    }

    fn get_stats(&self) -> BlockStoreStats {
        self.stats.snapshot()
    }

    async fn flush(&self) -> Result<()> {
        self.stats.on_flush();
        self.pending.wait_idle("compress block store").await;
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemBlockStore;
    use depot_core::compression::{DEFLATE_DEFAULT, ZSTD_DEFAULT};
    use depot_core::{Blake3Hasher, BlockIndex, ChunkHasher, COMPRESSION_NONE};

    fn block(tag: u32) -> StoredBlock {
        let hasher = Blake3Hasher::new();
        let chunks: [&[u8]; 2] = [&[b'a'; 500], &[b'b'; 300]];
        let index = BlockIndex::new(
            &hasher,
            tag,
            chunks.iter().map(|c| hasher.hash_buffer(c)).collect(),
            chunks.iter().map(|c| c.len() as u32).collect(),
        )
        .unwrap();
        StoredBlock::new(index, chunks.concat())
    }

    fn store() -> CompressBlockStore<Arc<MemBlockStore>> {
        CompressBlockStore::new(
            Arc::new(MemBlockStore::new()),
            Arc::new(CompressionRegistry::with_defaults()),
        )
    }

    #[tokio::test]
    async fn test_roundtrip_per_codec() -> Result<()> {
        for tag in [ZSTD_DEFAULT, DEFLATE_DEFAULT] {
            let store = store();
            let original = block(tag);
            store.put_stored_block(original.clone()).await?;

            let stored = store.inner().get_stored_block(original.block_hash()).await?;
            assert!(stored.is_compressed());
            assert!(stored.data.len() < original.data.len());

            let fetched = store.get_stored_block(original.block_hash()).await?;
            assert!(!fetched.is_compressed());
            assert_eq!(fetched.index.tag, tag);
            assert_eq!(fetched.data, original.data);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_tag_zero_passes_through() -> Result<()> {
        let store = store();
        let original = block(COMPRESSION_NONE);
        store.put_stored_block(original.clone()).await?;
        assert_eq!(store.inner().get_stored_block(original.block_hash()).await?, original);
        assert_eq!(store.get_stored_block(original.block_hash()).await?, original);
        Ok(())
    }

    #[tokio::test]
    async fn test_size_mismatch_is_corruption() -> Result<()> {
        let store = store();
        let original = block(ZSTD_DEFAULT);
        let registry = CompressionRegistry::with_defaults();
        // valid payload for fewer bytes than the trailer declares
        let payload = registry.compress_payload(ZSTD_DEFAULT, &original.data[..100])?;
        let bogus = StoredBlock::from_payload(original.index.clone(), payload);
        store.inner().put_stored_block(bogus).await?;

        let err = store.get_stored_block(original.block_hash()).await.unwrap_err();
        assert!(matches!(err, Error::DataCorruption(_)));
        assert_eq!(store.get_stats().get_failures, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tag_is_unsupported() -> Result<()> {
        let store = store();
        let err = store.put_stored_block(block(0x7700 | 1)).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        Ok(())
    }
}
