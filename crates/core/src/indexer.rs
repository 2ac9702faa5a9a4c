//! Builds a [`VersionIndex`] from a directory tree

use crate::error::{Error, Result};
use crate::hash::{ChunkHasher, SharedHasher};
use crate::jobs::JobRunner;
use crate::storage::{asset_path, is_dir_name, SharedStorage, Storage};
use crate::version_index::{AssetEntry, VersionIndex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Files and directories found under a root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfos {
    /// Relative `/`-separated paths; directories end with `/`
    pub paths: Vec<String>,
    pub sizes: Vec<u64>,
}

impl FileInfos {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.sizes.iter().sum()
    }
}

/// Enumerate everything under `root`, sorted by path
pub fn get_files_recursively(storage: &dyn Storage, root: &Path) -> Result<FileInfos> {
    let mut found: Vec<(String, u64)> = Vec::new();
    let mut pending: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        for entry in storage.list_dir(&dir)? {
            let relative = format!("{prefix}{}", entry.name);
            if entry.is_dir {
                let name = format!("{relative}/");
                pending.push((dir.join(&entry.name), name.clone()));
                found.push((name, 0));
            } else {
                found.push((relative, entry.size));
            }
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    let (paths, sizes) = found.into_iter().unzip();
    Ok(FileInfos { paths, sizes })
}

/// Chunk slots shared by all indexing jobs
struct ChunkSlots {
    next: AtomicUsize,
    hashes: Vec<AtomicU64>,
    sizes: Vec<AtomicU32>,
}

impl ChunkSlots {
    fn new(capacity: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            hashes: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            sizes: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Reserve `count` consecutive slots
    fn reserve(&self, count: usize) -> Result<usize> {
        let start = self.next.fetch_add(count, Ordering::Relaxed);
        if start + count > self.hashes.len() {
            return Err(Error::Internal(format!(
                "chunk slots exhausted: {start} + {count} > {}",
                self.hashes.len()
            )));
        }
        Ok(start)
    }
}

/// What one indexing job reports back
struct IndexedAsset {
    content_hash: u64,
    size: u32,
    chunk_start: usize,
    chunk_count: usize,
}

fn chunks_for(size: u64, target_chunk_size: u32) -> usize {
    size.div_ceil(target_chunk_size as u64) as usize
}

fn index_file(
    storage: &dyn Storage,
    hasher: &SharedHasher,
    slots: &ChunkSlots,
    path: &Path,
    name: &str,
    declared_size: u64,
    target_chunk_size: u32,
) -> Result<IndexedAsset> {
    let mut file = storage.open_read(path)?;
    let size = file.size();
    let size32 = u32::try_from(size)
        .map_err(|_| Error::InvalidArgument(format!("{name}: {size} bytes exceeds the 4 GiB asset limit")))?;

    let reserved = chunks_for(declared_size, target_chunk_size);
    let needed = chunks_for(size, target_chunk_size);
    if needed > reserved {
        return Err(Error::InvalidData(format!(
            "{name}: file has {size} bytes ({needed} chunks), declared {declared_size} ({reserved} chunks)"
        )));
    }
    let start = slots.reserve(reserved)?;

    let mut content = hasher.begin();
    let mut buf = vec![0u8; (target_chunk_size as u64).min(size) as usize];
    let mut offset = 0u64;
    let mut slot = start;
    while offset < size {
        let len = (size - offset).min(target_chunk_size as u64) as usize;
        let window = &mut buf[..len];
        file.read_at(offset, window)?;
        content.update(window);
        slots.hashes[slot].store(hasher.hash_buffer(window), Ordering::Relaxed);
        slots.sizes[slot].store(len as u32, Ordering::Relaxed);
        slot += 1;
        offset += len as u64;
    }

    debug!("indexed {name}: {size} bytes, {} chunks", slot - start);
    Ok(IndexedAsset {
        content_hash: content.finish(),
        size: size32,
        chunk_start: start,
        chunk_count: slot - start,
    })
}

/// Hash every asset under `root` into a new version index
///
/// `paths`, `sizes` and `tags` are parallel arrays, typically from
/// [`get_files_recursively`]. Directories get a path hash only. Every asset
/// is attempted; the first failure is returned once all jobs finished.
#[allow(clippy::too_many_arguments)]
pub async fn create_version_index(
    storage: SharedStorage,
    hasher: SharedHasher,
    jobs: &JobRunner,
    root: &Path,
    paths: &[String],
    sizes: &[u64],
    tags: &[u32],
    target_chunk_size: u32,
) -> Result<VersionIndex> {
    if paths.len() != sizes.len() || paths.len() != tags.len() {
        return Err(Error::InvalidArgument(format!(
            "{} paths, {} sizes, {} tags",
            paths.len(),
            sizes.len(),
            tags.len()
        )));
    }
    if target_chunk_size == 0 {
        return Err(Error::InvalidArgument("target_chunk_size must be non-zero".into()));
    }
    for (path, &size) in paths.iter().zip(sizes) {
        if size > u32::MAX as u64 {
            return Err(Error::InvalidArgument(format!(
                "{path}: {size} bytes exceeds the 4 GiB asset limit"
            )));
        }
    }

    let capacity: usize = paths
        .iter()
        .zip(sizes)
        .filter(|(p, _)| !is_dir_name(p))
        .map(|(_, &s)| chunks_for(s, target_chunk_size))
        .sum();
    let slots = Arc::new(ChunkSlots::new(capacity));

    let mut work = Vec::with_capacity(paths.len());
    for (name, &declared) in paths.iter().zip(sizes) {
        let storage = Arc::clone(&storage);
        let hasher = Arc::clone(&hasher);
        let slots = Arc::clone(&slots);
        let name = name.clone();
        let path = asset_path(root, &name)?;
        work.push(move || {
            if is_dir_name(&name) {
                return Ok(IndexedAsset {
                    content_hash: 0,
                    size: 0,
                    chunk_start: 0,
                    chunk_count: 0,
                });
            }
            index_file(storage.as_ref(), &hasher, &slots, &path, &name, declared, target_chunk_size)
        });
    }

    let indexed = jobs.run_blocking("index assets", work).await?;

    let entries = indexed
        .into_iter()
        .zip(paths.iter().zip(tags))
        .map(|(asset, (name, &tag))| {
            let range = asset.chunk_start..asset.chunk_start + asset.chunk_count;
            AssetEntry {
                name: name.clone(),
                path_hash: hasher.hash_buffer(name.as_bytes()),
                content_hash: asset.content_hash,
                size: asset.size,
                compression_tag: tag,
                chunk_hashes: slots.hashes[range.clone()]
                    .iter()
                    .map(|h| h.load(Ordering::Relaxed))
                    .collect(),
                chunk_sizes: slots.sizes[range].iter().map(|s| s.load(Ordering::Relaxed)).collect(),
            }
        })
        .collect();

    let index = VersionIndex::from_entries(entries)?;
    info!(
        "indexed {} assets, {} chunks, {} bytes",
        index.asset_count(),
        index.chunk_count(),
        index.total_size()
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Blake3Hasher, ChunkHasher};
    use crate::storage::FsStorage;
    use std::fs;

    async fn index_dir(root: &Path, chunk: u32) -> Result<VersionIndex> {
        let files = get_files_recursively(&FsStorage, root)?;
        let tags = vec![0; files.len()];
        create_version_index(
            FsStorage::shared(),
            Blake3Hasher::shared(),
            &JobRunner::new(3),
            root,
            &files.paths,
            &files.sizes,
            &tags,
            chunk,
        )
        .await
    }

    #[test]
    fn test_get_files_recursively() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        fs::create_dir_all(temp_dir.path().join("a/b"))?;
        fs::write(temp_dir.path().join("a/b/c.txt"), b"hello")?;
        fs::write(temp_dir.path().join("top.bin"), b"12")?;

        let files = get_files_recursively(&FsStorage, temp_dir.path())?;
        assert_eq!(files.paths, vec!["a/", "a/b/", "a/b/c.txt", "top.bin"]);
        assert_eq!(files.sizes, vec![0, 0, 5, 2]);
        assert_eq!(files.total_size(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_index_tree() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        fs::create_dir(temp_dir.path().join("dir"))?;
        fs::write(temp_dir.path().join("dir/ten.bin"), b"0123456789")?;
        fs::write(temp_dir.path().join("empty"), b"")?;

        let index = index_dir(temp_dir.path(), 4).await?;
        assert_eq!(index.names(), &["dir/", "dir/ten.bin", "empty"]);
        assert_eq!(index.chunk_count(), 3);
        assert_eq!(index.asset_chunks(1), 0..3);
        assert_eq!(index.chunk_sizes(), &[4, 4, 2]);

        let hasher = Blake3Hasher::new();
        assert_eq!(index.chunk_hashes()[2], hasher.hash_buffer(b"89"));
        assert_eq!(index.content_hashes()[1], hasher.hash_buffer(b"0123456789"));
        assert_eq!(index.content_hashes()[2], hasher.hash_buffer(b""));
        assert_eq!(index.content_hashes()[0], 0);
        assert_eq!(index.path_hashes()[0], hasher.hash_buffer(b"dir/"));
        Ok(())
    }

    #[tokio::test]
    async fn test_identical_files_share_chunk_hashes() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        fs::write(temp_dir.path().join("a"), b"same bytes")?;
        fs::write(temp_dir.path().join("b"), b"same bytes")?;

        let index = index_dir(temp_dir.path(), 8).await?;
        assert_eq!(index.chunk_count(), 4);
        assert_eq!(index.chunk_hashes()[0..2], index.chunk_hashes()[2..4]);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_larger_than_declared_fails() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        fs::write(temp_dir.path().join("grown"), b"0123456789")?;
        let err = create_version_index(
            FsStorage::shared(),
            Blake3Hasher::shared(),
            &JobRunner::new(1),
            temp_dir.path(),
            &["grown".to_string()],
            &[2],
            &[0],
            4,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_fails_whole_index() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        fs::write(temp_dir.path().join("present"), b"abc")?;
        let err = create_version_index(
            FsStorage::shared(),
            Blake3Hasher::shared(),
            &JobRunner::new(2),
            temp_dir.path(),
            &["present".to_string(), "absent".to_string()],
            &[3, 3],
            &[0, 0],
            4,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_oversized_asset() {
        let err = create_version_index(
            FsStorage::shared(),
            Blake3Hasher::shared(),
            &JobRunner::new(1),
            Path::new("/nonexistent"),
            &["huge".to_string()],
            &[u32::MAX as u64 + 1],
            &[0],
            4,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
