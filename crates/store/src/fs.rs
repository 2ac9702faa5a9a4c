//! Block store keeping one file per block under a root directory

use crate::block_store::BlockStore;
use crate::pending::PendingRequests;
use crate::stats::{BlockStoreStats, StatsCounters};
use ahash::AHashSet;
use async_trait::async_trait;
use depot_core::block::{block_hash_from_file_name, read_block_index};
use depot_core::hash::to_hex;
use depot_core::storage::atomic_write;
use depot_core::{
    block_path, BlockHash, BlockIndex, ContentIndex, Error, Result, SharedHasher, SharedStorage,
    StoredBlock,
};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct KnownBlocks {
    scanned: bool,
    hashes: AHashSet<BlockHash>,
    blocks: Vec<BlockIndex>,
}

impl KnownBlocks {
    fn add(&mut self, index: BlockIndex) {
        if self.hashes.insert(index.block_hash) {
            self.blocks.push(index);
        }
    }
}

struct Shared {
    storage: SharedStorage,
    hasher: SharedHasher,
    root: PathBuf,
    known: RwLock<KnownBlocks>,
    stats: StatsCounters,
    pending: PendingRequests,
}

/// Base store over a [`depot_core::Storage`]
///
/// Files live at `<root>/<hhhh>/<hash>.lrb` and are written through a temp
/// file plus rename. The index is built by scanning trailers on first use
/// and kept current by puts.
#[derive(Clone)]
pub struct FsBlockStore {
    shared: Arc<Shared>,
}

impl FsBlockStore {
    pub fn new(storage: SharedStorage, hasher: SharedHasher, root: impl Into<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                storage,
                hasher,
                root: root.into(),
                known: RwLock::new(KnownBlocks::default()),
                stats: StatsCounters::new(),
                pending: PendingRequests::new(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Run blocking storage work off the async workers, counted as pending
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Shared) -> Result<T> + Send + 'static,
    {
        let _guard = self.shared.pending.begin();
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || work(&shared)).await?
    }

    async fn ensure_scanned(&self) -> Result<()> {
        if self.shared.known.read().scanned {
            return Ok(());
        }
        let found = self.blocking(scan_blocks).await?;
        let mut known = self.shared.known.write();
        if !known.scanned {
            for index in found {
                known.add(index);
            }
            known.scanned = true;
        }
        Ok(())
    }
}

fn scan_blocks(shared: &Shared) -> Result<Vec<BlockIndex>> {
    let storage = shared.storage.as_ref();
    if !storage.exists(&shared.root) {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    let mut dirs = storage.list_dir(&shared.root)?;
    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    for dir in dirs.into_iter().filter(|d| d.is_dir) {
        let dir_path = shared.root.join(&dir.name);
        let mut files = storage.list_dir(&dir_path)?;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        for file in files {
            let Some(hash) = block_hash_from_file_name(&file.name) else {
                continue;
            };
            let bytes = storage.read_file(&dir_path.join(&file.name))?;
            match read_block_index(shared.hasher.as_ref(), &bytes) {
                Ok(index) if index.block_hash == hash => found.push(index),
                Ok(index) => warn!(
                    "block file {} holds block {}, skipping",
                    file.name,
                    to_hex(index.block_hash)
                ),
                Err(e) => warn!("unreadable block file {}: {e}", file.name),
            }
        }
    }
    info!("scanned {} blocks under {}", found.len(), shared.root.display());
    Ok(found)
}

#[async_trait]
impl BlockStore for FsBlockStore {
    async fn put_stored_block(&self, block: StoredBlock) -> Result<()> {
        let hash = block.block_hash();
        let stored = block.clone();
        let result = self
            .blocking(move |shared| {
                let path = block_path(&shared.root, hash);
                if shared.storage.exists(&path) {
                    debug!("block {} already stored", to_hex(hash));
                    return Ok(());
                }
                atomic_write(shared.storage.as_ref(), &path, &stored.to_bytes())
            })
            .await;
        if result.is_ok() {
            let mut index = block.index.clone();
            index.tag = block.payload_tag();
            self.shared.known.write().add(index);
        }
        self.shared.stats.on_put(&block, &result);
        result
    }

    async fn get_stored_block(&self, block_hash: BlockHash) -> Result<StoredBlock> {
        let result = self
            .blocking(move |shared| {
                let bytes = shared.storage.read_file(&block_path(&shared.root, block_hash))?;
                let block = StoredBlock::from_bytes(shared.hasher.as_ref(), &bytes)?;
                if block.block_hash() != block_hash {
                    return Err(Error::DataCorruption(format!(
                        "block file {} holds block {}",
                        to_hex(block_hash),
                        to_hex(block.block_hash())
                    )));
                }
                Ok(block)
            })
            .await;
        self.shared.stats.on_get(&result);
        result
    }

    async fn preflight_get(&self, block_hashes: &[BlockHash], _ref_counts: &[u32]) -> Result<()> {
        debug!("preflight for {} blocks", block_hashes.len());
        let result = Ok(());
        self.shared.stats.on_preflight(&result);
        result
    }

    async fn get_index(&self) -> Result<ContentIndex> {
        let result = match self.ensure_scanned().await {
            Ok(()) => Ok(ContentIndex::from_block_indexes(&self.shared.known.read().blocks)),
            Err(e) => Err(e),
        };
        self.shared.stats.on_index(&result);
        result
    }

    async fn retarget_content(&self, content_index: &ContentIndex) -> Result<ContentIndex> {
        let result = match self.get_index().await {
            Ok(own) => depot_core::retarget_content(&own, content_index),
            Err(e) => Err(e),
        };
        self.shared.stats.on_retarget(&result);
        result
    }

    fn get_stats(&self) -> BlockStoreStats {
        self.shared.stats.snapshot()
    }

    async fn flush(&self) -> Result<()> {
        self.shared.stats.on_flush();
        self.shared.pending.wait_idle("fs block store").await;
        Ok(())
    }
}
