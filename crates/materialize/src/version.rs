//! Turn a directory holding one version into another

use ahash::AHashMap;
use depot_core::hash::to_hex;
use depot_core::storage::{asset_path, atomic_write, temp_sibling, WriteFile};
use depot_core::{
    create_version_diff, validate_content, BlockHash, ChunkHash, ChunkHasher, ContentIndex, Error,
    JobRunner, Result, SharedHasher, SharedStorage, Storage, StoredBlock, VersionDiff, VersionIndex,
};
use depot_store::{BlockStore, SharedBlockStore};
use smallvec::SmallVec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One unit of work in [`change_version`]
#[derive(Debug, Clone, PartialEq, Eq)]
enum WriteJob {
    /// Files with no chunks
    Empty(Vec<usize>),
    /// Files whose chunks all live in one block, ordered by offset
    Block(u64, SmallVec<[usize; 4]>),
    /// A file spanning several blocks
    Spanning(usize),
}

/// Shared state of the write jobs
struct Writer {
    store: SharedBlockStore,
    storage: SharedStorage,
    hasher: SharedHasher,
    content: ContentIndex,
    version: VersionIndex,
    chunk_lookup: AHashMap<ChunkHash, usize>,
    root: PathBuf,
}

impl Writer {
    fn content_chunk(&self, hash: ChunkHash) -> Result<usize> {
        self.chunk_lookup.get(&hash).copied().ok_or_else(|| {
            Error::NotFound(format!("chunk {} is not in the content index", to_hex(hash)))
        })
    }

    fn block_of(&self, content_chunk: usize) -> u64 {
        self.content.chunk_block_indexes()[content_chunk]
    }

    fn block_hash(&self, block: u64) -> BlockHash {
        self.content.block_hashes()[block as usize]
    }

    async fn fetch(&self, block: u64) -> Result<StoredBlock> {
        let block = self.store.get_stored_block(self.block_hash(block)).await?;
        if block.is_compressed() {
            return Err(Error::InvalidArgument(format!(
                "block {} came back compressed, add a compression layer to the store",
                to_hex(block.block_hash())
            )));
        }
        Ok(block)
    }

    /// Bytes of version chunk `chunk` out of `block`, verified against its hash
    fn chunk_bytes<'a>(&self, block: &'a StoredBlock, chunk: usize) -> Result<&'a [u8]> {
        let hash = self.version.chunk_hashes()[chunk];
        let content_chunk = self.content_chunk(hash)?;
        let offset = self.content.chunk_block_offsets()[content_chunk] as usize;
        let len = self.content.chunk_lengths()[content_chunk] as usize;
        let bytes = block.data.get(offset..offset + len).ok_or_else(|| {
            Error::DataCorruption(format!(
                "block {} holds {} bytes, chunk {} ends at {}",
                to_hex(block.block_hash()),
                block.data.len(),
                to_hex(hash),
                offset + len
            ))
        })?;
        if self.hasher.hash_buffer(bytes) != hash {
            return Err(Error::DataCorruption(format!(
                "chunk {} in block {} does not match its hash",
                to_hex(hash),
                to_hex(block.block_hash())
            )));
        }
        Ok(bytes)
    }

    fn path_of(&self, asset: usize) -> Result<PathBuf> {
        asset_path(&self.root, self.version.asset_name(asset))
    }

    async fn run(self: Arc<Self>, job: WriteJob) -> Result<()> {
        match job {
            WriteJob::Empty(assets) => {
                let paths = assets
                    .iter()
                    .map(|&a| self.path_of(a))
                    .collect::<Result<Vec<_>>>()?;
                let storage = Arc::clone(&self.storage);
                tokio::task::spawn_blocking(move || {
                    first_error(paths.iter().map(|p| atomic_write(storage.as_ref(), p, &[])))
                })
                .await?
            }
            WriteJob::Block(block, assets) => self.write_block_group(block, &assets).await,
            WriteJob::Spanning(asset) => self.write_spanning(asset).await,
        }
    }

    /// Fetch one block and write every asset it fully contains
    async fn write_block_group(&self, block: u64, assets: &[usize]) -> Result<()> {
        let fetched = self.fetch(block).await?;
        let mut files = Vec::with_capacity(assets.len());
        let mut results = Vec::new();
        for &asset in assets {
            let assembled = self.path_of(asset).and_then(|path| {
                let mut data = Vec::with_capacity(self.version.asset_sizes()[asset] as usize);
                for chunk in self.version.asset_chunks(asset) {
                    data.extend_from_slice(self.chunk_bytes(&fetched, chunk)?);
                }
                Ok((path, data))
            });
            match assembled {
                Ok(file) => files.push(file),
                Err(e) => {
                    warn!("{}: {e}", self.version.asset_name(asset));
                    results.push(Err(e));
                }
            }
        }
        debug!("writing {} assets from block {}", files.len(), to_hex(fetched.block_hash()));

        let storage = Arc::clone(&self.storage);
        let written = tokio::task::spawn_blocking(move || {
            first_error(files.iter().map(|(path, data)| atomic_write(storage.as_ref(), path, data)))
        })
        .await?;
        results.push(written);
        first_error(results)
    }

    /// Stream an asset block by block into a temp file, then rename it in place
    async fn write_spanning(&self, asset: usize) -> Result<()> {
        let path = self.path_of(asset)?;
        let tmp = temp_sibling(&path)?;
        let size = self.version.asset_sizes()[asset] as u64;

        let storage = Arc::clone(&self.storage);
        let (parent, open_tmp) = (path.parent().map(Path::to_path_buf), tmp.clone());
        let mut file = tokio::task::spawn_blocking(move || {
            if let Some(parent) = parent {
                storage.create_dir(&parent)?;
            }
            storage.open_write(&open_tmp, size)
        })
        .await??;

        let result = self.stream_chunks(asset, &mut file).await;
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || {
            let finished = result.and_then(|()| file.close()).and_then(|()| storage.rename(&tmp, &path));
            if finished.is_err() {
                let _ = storage.remove_file(&tmp);
            }
            finished
        })
        .await?
    }

    async fn stream_chunks(&self, asset: usize, file: &mut Box<dyn WriteFile>) -> Result<()> {
        let chunks = self.version.asset_chunks(asset);
        let mut offset = 0u64;
        let mut next = chunks.start;
        while next < chunks.end {
            let block = self.block_of(self.content_chunk(self.version.chunk_hashes()[next])?);
            let fetched = self.fetch(block).await?;
            let mut run = Vec::new();
            while next < chunks.end
                && self.block_of(self.content_chunk(self.version.chunk_hashes()[next])?) == block
            {
                run.extend_from_slice(self.chunk_bytes(&fetched, next)?);
                next += 1;
            }
            file.write_at(offset, &run)?;
            offset += run.len() as u64;
        }
        Ok(())
    }
}

/// Return the first error after every item was looked at
fn first_error(results: impl IntoIterator<Item = Result<()>>) -> Result<()> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Delete removed assets: files first, then directories deepest first
fn remove_assets(storage: &dyn Storage, root: &Path, source: &VersionIndex, removed: &[usize]) -> Result<()> {
    let (mut dirs, files): (Vec<usize>, Vec<usize>) = removed.iter().copied().partition(|&a| source.is_dir(a));
    dirs.sort_by(|&a, &b| {
        let depth = |i: usize| source.asset_name(i).matches('/').count();
        depth(b).cmp(&depth(a)).then_with(|| source.asset_name(b).cmp(source.asset_name(a)))
    });

    let remove = |asset: usize, is_dir: bool| -> Result<()> {
        let path = asset_path(root, source.asset_name(asset))?;
        let result = if is_dir {
            storage.remove_dir(&path)
        } else {
            storage.remove_file(&path)
        };
        match result {
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => {
                warn!("failed to remove {}: {e}", source.asset_name(asset));
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    };

    first_error(
        files
            .into_iter()
            .map(|a| remove(a, false))
            .chain(dirs.into_iter().map(|a| remove(a, true)))
            .collect::<Vec<_>>(),
    )
}

/// Split the files to write into jobs and the blocks they will fetch
fn plan_writes(writer: &Writer, files: &[usize]) -> (Vec<WriteJob>, Vec<(u64, u32)>, Vec<Result<()>>) {
    let mut empty = Vec::new();
    let mut groups: AHashMap<u64, Vec<(u32, usize)>> = AHashMap::new();
    let mut spanning = Vec::new();
    let mut refs: AHashMap<u64, u32> = AHashMap::new();
    let mut failures = Vec::new();

    for &asset in files {
        let chunks = writer.version.asset_chunks(asset);
        if chunks.is_empty() {
            empty.push(asset);
            continue;
        }
        let located: Result<Vec<usize>> = writer.version.chunk_hashes()[chunks]
            .iter()
            .map(|&h| writer.content_chunk(h))
            .collect();
        let located = match located {
            Ok(located) => located,
            Err(e) => {
                warn!("{}: {e}", writer.version.asset_name(asset));
                failures.push(Err(e));
                continue;
            }
        };

        let mut blocks: SmallVec<[u64; 4]> = SmallVec::new();
        for &c in &located {
            let block = writer.block_of(c);
            if !blocks.contains(&block) {
                blocks.push(block);
            }
        }
        for &block in &blocks {
            *refs.entry(block).or_default() += 1;
        }
        if blocks.len() == 1 {
            let offset = writer.content.chunk_block_offsets()[located[0]];
            groups.entry(blocks[0]).or_default().push((offset, asset));
        } else {
            spanning.push(asset);
        }
    }

    let mut grouped: Vec<_> = groups.into_iter().collect();
    grouped.sort_by_key(|(block, _)| *block);

    let mut jobs = Vec::with_capacity(grouped.len() + spanning.len() + 1);
    if !empty.is_empty() {
        jobs.push(WriteJob::Empty(empty));
    }
    for (block, mut assets) in grouped {
        assets.sort_unstable();
        jobs.push(WriteJob::Block(block, assets.into_iter().map(|(_, a)| a).collect()));
    }
    jobs.extend(spanning.into_iter().map(WriteJob::Spanning));

    let mut refs: Vec<_> = refs.into_iter().collect();
    refs.sort_unstable();
    (jobs, refs, failures)
}

/// Update `target_root` from `source_version` to `target_version`
///
/// Removed assets are deleted, directories created, and added or modified
/// files rewritten whole from blocks fetched through `store`. Every asset is
/// attempted; the first failure is returned at the end.
///
/// `content` must hold every chunk of `target_version`, otherwise the call
/// fails with `Validation` before the target tree is touched.
#[allow(clippy::too_many_arguments)]
pub async fn change_version(
    store: SharedBlockStore,
    target_storage: SharedStorage,
    hasher: SharedHasher,
    jobs: &JobRunner,
    content: &ContentIndex,
    source_version: &VersionIndex,
    target_version: &VersionIndex,
    diff: &VersionDiff,
    target_root: &Path,
) -> Result<()> {
    validate_content(content, target_version)?;
    let mut outcomes: Vec<Result<()>> = Vec::new();

    let removal = {
        let storage = Arc::clone(&target_storage);
        let root = target_root.to_path_buf();
        let source = source_version.clone();
        let removed = diff.removed.clone();
        tokio::task::spawn_blocking(move || remove_assets(storage.as_ref(), &root, &source, &removed)).await?
    };
    outcomes.push(removal);

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for asset in diff.added.iter().copied().chain(diff.modified.iter().map(|&(_, t)| t)) {
        if target_version.is_dir(asset) {
            dirs.push(asset_path(target_root, target_version.asset_name(asset))?);
        } else {
            files.push(asset);
        }
    }
    dirs.sort();
    let storage = Arc::clone(&target_storage);
    let created = tokio::task::spawn_blocking(move || {
        first_error(dirs.iter().map(|d| storage.create_dir(d)).collect::<Vec<_>>())
    })
    .await?;
    outcomes.push(created);

    let writer = Arc::new(Writer {
        store: Arc::clone(&store),
        storage: target_storage,
        hasher,
        content: content.clone(),
        version: target_version.clone(),
        chunk_lookup: content.chunk_lookup(),
        root: target_root.to_path_buf(),
    });
    let (planned, refs, failures) = plan_writes(&writer, &files);
    outcomes.extend(failures);

    let block_hashes: Vec<BlockHash> = refs.iter().map(|&(b, _)| writer.block_hash(b)).collect();
    let ref_counts: Vec<u32> = refs.iter().map(|&(_, n)| n).collect();
    if let Err(e) = store.preflight_get(&block_hashes, &ref_counts).await {
        warn!("preflight for {} blocks failed: {e}", block_hashes.len());
    }

    let job_count = planned.len();
    let work: Vec<_> = planned
        .into_iter()
        .map(|job| Arc::clone(&writer).run(job))
        .collect();
    outcomes.push(jobs.run("write assets", work).await.map(|_| ()));

    info!(
        "changed version: {} removed, {} added, {} modified, {job_count} write jobs",
        diff.removed.len(),
        diff.added.len(),
        diff.modified.len()
    );
    first_error(outcomes)
}

/// Reconstruct `version` from scratch under `target_root`
pub async fn write_version(
    store: SharedBlockStore,
    target_storage: SharedStorage,
    hasher: SharedHasher,
    jobs: &JobRunner,
    content: &ContentIndex,
    version: &VersionIndex,
    target_root: &Path,
) -> Result<()> {
    let empty = VersionIndex::empty();
    let diff = create_version_diff(&empty, version);
    change_version(
        store,
        target_storage,
        hasher,
        jobs,
        content,
        &empty,
        version,
        &diff,
        target_root,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::{create_content_index, AssetEntry, Blake3Hasher};
    use depot_store::MemBlockStore;

    fn entry(name: &str, content: &[u8]) -> AssetEntry {
        let hasher = Blake3Hasher::new();
        AssetEntry {
            name: name.to_string(),
            path_hash: hasher.hash_buffer(name.as_bytes()),
            content_hash: hasher.hash_buffer(content),
            size: content.len() as u32,
            compression_tag: 0,
            chunk_hashes: content.chunks(4).map(|c| hasher.hash_buffer(c)).collect(),
            chunk_sizes: content.chunks(4).map(|c| c.len() as u32).collect(),
        }
    }

    fn writer(version: VersionIndex, max_block: u32) -> Writer {
        let content = create_content_index(
            &Blake3Hasher,
            version.chunk_hashes(),
            version.chunk_sizes(),
            max_block,
            64,
        )
        .unwrap();
        Writer {
            store: Arc::new(MemBlockStore::new()),
            storage: depot_core::FsStorage::shared(),
            hasher: Blake3Hasher::shared(),
            chunk_lookup: content.chunk_lookup(),
            content,
            version,
            root: PathBuf::from("/unused"),
        }
    }

    #[test]
    fn test_plan_groups_single_block_assets() {
        let version = VersionIndex::from_entries(vec![
            entry("a", b"0123456789abcdef"),
            entry("b", b"wxyz"),
            entry("c", b""),
            entry("d", b"abcd"),
        ])
        .unwrap();
        // 8-byte blocks: a spans the first two, b and d share the third
        let w = writer(version, 8);
        let (jobs, refs, failures) = plan_writes(&w, &[0, 1, 2, 3]);
        assert!(failures.is_empty());
        assert_eq!(jobs[0], WriteJob::Empty(vec![2]));
        assert!(jobs.contains(&WriteJob::Spanning(0)));
        let grouped: Vec<_> = jobs
            .iter()
            .filter_map(|j| match j {
                WriteJob::Block(block, assets) => Some((*block, assets.to_vec())),
                _ => None,
            })
            .collect();
        assert_eq!(grouped, vec![(2, vec![1, 3])]);
        assert_eq!(refs.iter().map(|&(_, n)| n).sum::<u32>(), 4);
    }

    #[test]
    fn test_plan_reports_missing_chunks() {
        let version = VersionIndex::from_entries(vec![entry("a", b"abcd")]).unwrap();
        let other = VersionIndex::from_entries(vec![entry("z", b"zzzz")]).unwrap();
        let mut w = writer(other, 64);
        w.version = version;
        let (jobs, _, failures) = plan_writes(&w, &[0]);
        assert!(jobs.is_empty());
        assert!(matches!(failures[0], Err(Error::NotFound(_))));
    }

    #[test]
    fn test_remove_order_files_then_deepest_dirs() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("a/b"))?;
        std::fs::write(root.join("a/b/f"), b"x")?;
        let dir = |name: &str| entry(name, b"");
        let source = VersionIndex::from_entries(vec![dir("a/"), dir("a/b/"), entry("a/b/f", b"x")])?;
        remove_assets(&depot_core::FsStorage, root, &source, &[0, 1, 2])?;
        assert!(!root.join("a").exists());
        // already gone is fine
        remove_assets(&depot_core::FsStorage, root, &source, &[2])?;
        Ok(())
    }

    #[tokio::test]
    async fn test_incomplete_content_leaves_target_untouched() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        std::fs::write(root.join("old"), b"keep")?;

        let source = VersionIndex::from_entries(vec![entry("old", b"keep")])?;
        let target = VersionIndex::from_entries(vec![entry("new", b"abcdefgh")])?;
        // holds only the first chunk of "new"
        let content = create_content_index(
            &Blake3Hasher,
            &target.chunk_hashes()[..1],
            &target.chunk_sizes()[..1],
            64,
            64,
        )?;
        let diff = create_version_diff(&source, &target);

        let err = change_version(
            Arc::new(MemBlockStore::new()),
            depot_core::FsStorage::shared(),
            Blake3Hasher::shared(),
            &JobRunner::new(2),
            &content,
            &source,
            &target,
            &diff,
            root,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(std::fs::read(root.join("old"))?, b"keep");
        assert!(!root.join("new").exists());
        Ok(())
    }
}
