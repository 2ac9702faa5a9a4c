//! Assemble blocks from the files of a version and store them

use ahash::AHashMap;
use depot_core::hash::to_hex;
use depot_core::storage::{asset_path, atomic_write, ReadFile};
use depot_core::{
    block_path, validate_version, BlockIndex, ChunkHash, ChunkHasher, CompressionRegistry,
    ContentIndex, Error, JobRunner, Result, SharedHasher, SharedStorage, StoredBlock, VersionIndex,
    COMPRESSION_NONE,
};
use depot_store::{BlockStore, SharedBlockStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Where a chunk's bytes can be read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AssetPart {
    asset: usize,
    offset: u64,
    size: u32,
}

/// Chunk hash to the first asset range holding it
fn asset_parts(version: &VersionIndex) -> AHashMap<ChunkHash, AssetPart> {
    let mut parts = AHashMap::with_capacity(version.chunk_count());
    for asset in 0..version.asset_count() {
        let mut offset = 0u64;
        for chunk in version.asset_chunks(asset) {
            let size = version.chunk_sizes()[chunk];
            parts.entry(version.chunk_hashes()[chunk]).or_insert(AssetPart { asset, offset, size });
            offset += size as u64;
        }
    }
    parts
}

/// Reads block contents out of the source tree of a version
struct BlockSource {
    storage: SharedStorage,
    root: PathBuf,
    version: VersionIndex,
    parts: AHashMap<ChunkHash, AssetPart>,
}

impl BlockSource {
    fn new(storage: SharedStorage, root: &Path, version: &VersionIndex) -> Self {
        Self {
            storage,
            root: root.to_path_buf(),
            parts: asset_parts(version),
            version: version.clone(),
        }
    }

    /// Gather the chunk bytes of `index`; the tag comes from the asset of the first chunk
    fn assemble(&self, mut index: BlockIndex) -> Result<StoredBlock> {
        let mut data = Vec::with_capacity(index.data_size() as usize);
        let mut open: Option<(usize, Box<dyn ReadFile>)> = None;
        let mut tag = None;

        for (&hash, &size) in index.chunk_hashes.iter().zip(&index.chunk_sizes) {
            let part = self.parts.get(&hash).copied().ok_or_else(|| {
                Error::NotFound(format!("chunk {} is not part of the version", to_hex(hash)))
            })?;
            if part.size != size {
                return Err(Error::InvalidData(format!(
                    "chunk {} is {size} bytes in the content index but {} in the version",
                    to_hex(hash),
                    part.size
                )));
            }
            tag.get_or_insert(self.version.compression_tags()[part.asset]);

            if open.as_ref().map(|(asset, _)| *asset) != Some(part.asset) {
                let path = asset_path(&self.root, self.version.asset_name(part.asset))?;
                open = Some((part.asset, self.storage.open_read(&path)?));
            }
            if let Some((_, file)) = open.as_mut() {
                let start = data.len();
                data.resize(start + size as usize, 0);
                file.read_at(part.offset, &mut data[start..])?;
            }
        }

        index.tag = tag.unwrap_or(COMPRESSION_NONE);
        Ok(StoredBlock::new(index, data))
    }
}

/// Trailer indexes of every block in `content`, checked against its block hashes
fn plan_blocks(hasher: &dyn ChunkHasher, content: &ContentIndex) -> Result<Vec<BlockIndex>> {
    content
        .block_chunk_ranges()
        .into_iter()
        .enumerate()
        .map(|(block, range)| {
            let index = BlockIndex::new(
                hasher,
                COMPRESSION_NONE,
                content.chunk_hashes()[range.clone()].to_vec(),
                content.chunk_lengths()[range].to_vec(),
            )?;
            let expected = content.block_hashes()[block];
            if index.block_hash != expected {
                return Err(Error::InvalidData(format!(
                    "block {block}: chunks hash to {}, index says {}",
                    to_hex(index.block_hash),
                    to_hex(expected)
                )));
            }
            Ok(index)
        })
        .collect()
}

/// Write every block of `content` as a file under `target_root`
///
/// Blocks whose file already exists are skipped. Returns the number of
/// blocks written. Every chunk of `content` must belong to `version`.
#[allow(clippy::too_many_arguments)]
pub async fn write_content(
    source_storage: SharedStorage,
    target_storage: SharedStorage,
    hasher: SharedHasher,
    registry: Arc<CompressionRegistry>,
    jobs: &JobRunner,
    content: &ContentIndex,
    version: &VersionIndex,
    source_root: &Path,
    target_root: &Path,
) -> Result<usize> {
    validate_version(content, version)?;
    let source = Arc::new(BlockSource::new(source_storage, source_root, version));
    let blocks = plan_blocks(hasher.as_ref(), content)?;

    let work: Vec<_> = blocks
        .into_iter()
        .map(|index| {
            let source = Arc::clone(&source);
            let target = Arc::clone(&target_storage);
            let registry = Arc::clone(&registry);
            let path = block_path(target_root, index.block_hash);
            move || {
                if target.exists(&path) {
                    debug!("block {} already present", to_hex(index.block_hash));
                    return Ok(false);
                }
                let mut block = source.assemble(index)?;
                if block.index.tag != COMPRESSION_NONE {
                    let payload = registry.compress_payload(block.index.tag, &block.data)?;
                    block = StoredBlock::from_payload(block.index, payload);
                }
                atomic_write(target.as_ref(), &path, &block.to_bytes())?;
                Ok(true)
            }
        })
        .collect();

    let total = work.len();
    let written = jobs
        .run_blocking("write content", work)
        .await?
        .into_iter()
        .filter(|&w| w)
        .count();
    info!("wrote {written} of {total} blocks to {}", target_root.display());
    Ok(written)
}

/// Hand every block of `content` to a block store, uncompressed and tagged
///
/// Every chunk of `content` must belong to `version`.
pub async fn put_content(
    store: SharedBlockStore,
    source_storage: SharedStorage,
    hasher: SharedHasher,
    jobs: &JobRunner,
    content: &ContentIndex,
    version: &VersionIndex,
    source_root: &Path,
) -> Result<()> {
    validate_version(content, version)?;
    let source = Arc::new(BlockSource::new(source_storage, source_root, version));
    let blocks = plan_blocks(hasher.as_ref(), content)?;
    let total = blocks.len();

    let work: Vec<_> = blocks
        .into_iter()
        .map(|index| {
            let source = Arc::clone(&source);
            let store = Arc::clone(&store);
            async move {
                let block = tokio::task::spawn_blocking(move || source.assemble(index)).await??;
                store.put_stored_block(block).await
            }
        })
        .collect();

    jobs.run("put content", work).await?;
    info!("stored {total} blocks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::compression::ZSTD_DEFAULT;
    use depot_core::{AssetEntry, Blake3Hasher, FsStorage};
    use std::fs;

    fn entry(name: &str, content: &[u8], chunk: usize, tag: u32) -> AssetEntry {
        let hasher = Blake3Hasher::new();
        AssetEntry {
            name: name.to_string(),
            path_hash: hasher.hash_buffer(name.as_bytes()),
            content_hash: hasher.hash_buffer(content),
            size: content.len() as u32,
            compression_tag: tag,
            chunk_hashes: content.chunks(chunk).map(|c| hasher.hash_buffer(c)).collect(),
            chunk_sizes: content.chunks(chunk).map(|c| c.len() as u32).collect(),
        }
    }

    #[test]
    fn test_asset_parts_first_wins() {
        let version = VersionIndex::from_entries(vec![
            entry("a", b"xxxxyyyy", 4, 0),
            entry("b", b"yyyy", 4, 0),
        ])
        .unwrap();
        let parts = asset_parts(&version);
        let y = Blake3Hasher.hash_buffer(b"yyyy");
        assert_eq!(parts.get(&y), Some(&AssetPart { asset: 0, offset: 4, size: 4 }));
    }

    #[test]
    fn test_assemble_reads_across_assets() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        fs::write(temp_dir.path().join("a"), b"aaaabbbb")?;
        fs::write(temp_dir.path().join("b"), b"cc")?;
        let version = VersionIndex::from_entries(vec![
            entry("a", b"aaaabbbb", 4, ZSTD_DEFAULT),
            entry("b", b"cc", 4, 0),
        ])?;
        let content = depot_core::create_content_index(
            &Blake3Hasher,
            version.chunk_hashes(),
            version.chunk_sizes(),
            1 << 20,
            16,
        )?;

        let source = BlockSource::new(FsStorage::shared(), temp_dir.path(), &version);
        let mut plans = plan_blocks(&Blake3Hasher, &content)?;
        assert_eq!(plans.len(), 1);
        let block = source.assemble(plans.remove(0))?;
        assert_eq!(&block.data[..], b"aaaabbbbcc");
        assert_eq!(block.index.tag, ZSTD_DEFAULT);
        assert!(!block.is_compressed());
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_chunks_rejected_before_writing() -> Result<()> {
        let source_dir = tempfile::tempdir()?;
        let target_dir = tempfile::tempdir()?;
        fs::write(source_dir.path().join("a"), b"aaaa")?;
        let version = VersionIndex::from_entries(vec![entry("a", b"aaaa", 4, 0)])?;
        let stranger = Blake3Hasher.hash_buffer(b"not in the version");
        let content = depot_core::create_content_index(
            &Blake3Hasher,
            &[version.chunk_hashes()[0], stranger],
            &[4, 18],
            1 << 20,
            16,
        )?;

        let err = write_content(
            FsStorage::shared(),
            FsStorage::shared(),
            Blake3Hasher::shared(),
            Arc::new(CompressionRegistry::with_defaults()),
            &JobRunner::new(2),
            &content,
            &version,
            source_dir.path(),
            target_dir.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(fs::read_dir(target_dir.path())?.next().is_none());

        let store: SharedBlockStore = Arc::new(depot_store::MemBlockStore::new());
        let err = put_content(
            store,
            FsStorage::shared(),
            Blake3Hasher::shared(),
            &JobRunner::new(2),
            &content,
            &version,
            source_dir.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        Ok(())
    }
}
