//! Cache over a compressed remote, both on disk

use depot_core::compression::ZSTD_DEFAULT;
use depot_core::{
    block_path, Blake3Hasher, BlockIndex, ChunkHasher, CompressionRegistry, FsStorage, Result,
    StoredBlock,
};
use depot_store::{BlockStore, CacheBlockStore, CompressBlockStore, FsBlockStore};
use std::path::Path;
use std::sync::Arc;

type Layered = CacheBlockStore<FsBlockStore, CompressBlockStore<FsBlockStore>>;

fn layered(local: &Path, remote: &Path) -> Layered {
    let fs = |root: &Path| FsBlockStore::new(FsStorage::shared(), Blake3Hasher::shared(), root);
    let remote = CompressBlockStore::new(fs(remote), Arc::new(CompressionRegistry::with_defaults()));
    CacheBlockStore::new(Arc::new(fs(local)), Arc::new(remote), Blake3Hasher::shared())
}

fn text_block(seed: u8) -> StoredBlock {
    let hasher = Blake3Hasher::new();
    let chunks: Vec<Vec<u8>> = (0..4u8)
        .map(|i| format!("chunk {seed}-{i} ").repeat(200).into_bytes())
        .collect();
    let index = BlockIndex::new(
        &hasher,
        ZSTD_DEFAULT,
        chunks.iter().map(|c| hasher.hash_buffer(c)).collect(),
        chunks.iter().map(|c| c.len() as u32).collect(),
    )
    .unwrap();
    StoredBlock::new(index, chunks.concat())
}

#[tokio::test]
async fn test_put_compresses_remote_and_caches_raw() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let (local_root, remote_root) = (temp_dir.path().join("local"), temp_dir.path().join("remote"));
    let store = layered(&local_root, &remote_root);
    let block = text_block(1);

    store.put_stored_block(block.clone()).await?;
    store.dispose().await?;

    let remote_len = std::fs::metadata(block_path(&remote_root, block.block_hash()))?.len();
    let local_len = std::fs::metadata(block_path(&local_root, block.block_hash()))?.len();
    assert!(remote_len < local_len);

    let fetched = store.get_stored_block(block.block_hash()).await?;
    assert_eq!(fetched.data, block.data);
    assert_eq!(&fetched.chunk_data(2)?[..], &block.chunk_data(2)?[..]);
    Ok(())
}

#[tokio::test]
async fn test_fresh_cache_fills_from_remote() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let (local_root, remote_root) = (temp_dir.path().join("local"), temp_dir.path().join("remote"));
    let blocks = [text_block(1), text_block(2)];
    {
        let seed = layered(&temp_dir.path().join("seed-cache"), &remote_root);
        for block in &blocks {
            seed.put_stored_block(block.clone()).await?;
        }
        seed.dispose().await?;
    }

    let store = layered(&local_root, &remote_root);
    assert_eq!(store.local().get_index().await?.block_count(), 0);
    assert_eq!(store.get_index().await?.block_count(), 2);

    for block in &blocks {
        let fetched = store.get_stored_block(block.block_hash()).await?;
        assert_eq!(fetched.data, block.data);
    }
    store.flush().await?;
    for block in &blocks {
        assert!(block_path(&local_root, block.block_hash()).exists());
    }
    // merged index lists each block once per tier
    assert_eq!(store.get_index().await?.block_count(), 4);
    Ok(())
}
