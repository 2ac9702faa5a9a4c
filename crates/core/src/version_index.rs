//! Version index: an immutable snapshot of a directory tree and its chunks

use crate::error::{Error, Result};
use crate::hash::ChunkHash;
use crate::storage::{atomic_write, is_dir_name, Storage};
use crate::wire::{put_u32s, put_u64s, WireReader};
use ahash::AHashMap;
use bytes::BufMut;
use std::ops::Range;
use std::path::Path;

/// One asset with its own chunk list, used to assemble a [`VersionIndex`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    /// `/`-separated path; directories end with `/`
    pub name: String,
    pub path_hash: u64,
    pub content_hash: u64,
    pub size: u32,
    pub compression_tag: u32,
    pub chunk_hashes: Vec<ChunkHash>,
    pub chunk_sizes: Vec<u32>,
}

/// Flat, read-only snapshot of a tree
///
/// Chunk ranges are laid out in asset order, so asset `i` starts where
/// asset `i - 1` ends. Chunks shared by two assets are stored twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionIndex {
    names: Vec<String>,
    path_hashes: Vec<u64>,
    content_hashes: Vec<u64>,
    asset_sizes: Vec<u32>,
    chunk_starts: Vec<u32>,
    chunk_counts: Vec<u32>,
    compression_tags: Vec<u32>,
    chunk_hashes: Vec<ChunkHash>,
    chunk_sizes: Vec<u32>,
}

impl VersionIndex {
    /// Index with no assets
    pub fn empty() -> Self {
        Self::default()
    }

    /// Assemble from per-asset entries, in the given order
    pub fn from_entries(entries: Vec<AssetEntry>) -> Result<Self> {
        let mut index = Self::empty();
        for entry in entries {
            if entry.chunk_hashes.len() != entry.chunk_sizes.len() {
                return Err(Error::InvalidArgument(format!(
                    "asset {}: {} chunk hashes but {} chunk sizes",
                    entry.name,
                    entry.chunk_hashes.len(),
                    entry.chunk_sizes.len()
                )));
            }
            if is_dir_name(&entry.name) && !entry.chunk_hashes.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "directory {} cannot carry chunks",
                    entry.name
                )));
            }
            if entry.name.contains('\0') {
                return Err(Error::InvalidArgument(format!("asset name {:?} contains NUL", entry.name)));
            }
            let start = u32::try_from(index.chunk_hashes.len())
                .map_err(|_| Error::InvalidArgument("too many chunks for a version index".into()))?;
            index.chunk_starts.push(start);
            index.chunk_counts.push(entry.chunk_hashes.len() as u32);
            index.names.push(entry.name);
            index.path_hashes.push(entry.path_hash);
            index.content_hashes.push(entry.content_hash);
            index.asset_sizes.push(entry.size);
            index.compression_tags.push(entry.compression_tag);
            index.chunk_hashes.extend(entry.chunk_hashes);
            index.chunk_sizes.extend(entry.chunk_sizes);
        }
        Ok(index)
    }

    pub fn asset_count(&self) -> usize {
        self.names.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn asset_name(&self, asset: usize) -> &str {
        &self.names[asset]
    }

    pub fn is_dir(&self, asset: usize) -> bool {
        is_dir_name(&self.names[asset])
    }

    pub fn path_hashes(&self) -> &[u64] {
        &self.path_hashes
    }

    pub fn content_hashes(&self) -> &[u64] {
        &self.content_hashes
    }

    pub fn asset_sizes(&self) -> &[u32] {
        &self.asset_sizes
    }

    pub fn chunk_counts(&self) -> &[u32] {
        &self.chunk_counts
    }

    pub fn compression_tags(&self) -> &[u32] {
        &self.compression_tags
    }

    pub fn chunk_hashes(&self) -> &[ChunkHash] {
        &self.chunk_hashes
    }

    pub fn chunk_sizes(&self) -> &[u32] {
        &self.chunk_sizes
    }

    /// Range of asset `asset` in the chunk arrays
    pub fn asset_chunks(&self, asset: usize) -> Range<usize> {
        let start = self.chunk_starts[asset] as usize;
        start..start + self.chunk_counts[asset] as usize
    }

    /// Sum of all asset sizes
    pub fn total_size(&self) -> u64 {
        self.asset_sizes.iter().map(|&s| s as u64).sum()
    }

    /// Position of the asset named `name`
    pub fn find_asset(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Serialize to the flat version index layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let assets = self.names.len();
        let chunks = self.chunk_hashes.len();
        let name_bytes: usize = self.names.iter().map(|n| n.len() + 1).sum();
        let mut out = Vec::with_capacity(16 + assets * 32 + chunks * 12 + name_bytes);

        out.put_u64_le(assets as u64);
        out.put_u64_le(chunks as u64);
        put_u64s(&mut out, &self.path_hashes);
        put_u64s(&mut out, &self.content_hashes);
        put_u32s(&mut out, &self.asset_sizes);
        put_u32s(&mut out, &self.chunk_counts);
        put_u32s(&mut out, &self.chunk_sizes);
        put_u64s(&mut out, &self.chunk_hashes);

        let mut offset = 0u32;
        for name in &self.names {
            out.put_u32_le(offset);
            offset += name.len() as u32 + 1;
        }
        for name in &self.names {
            out.extend_from_slice(name.as_bytes());
            out.put_u8(0);
        }
        put_u32s(&mut out, &self.compression_tags);
        out
    }

    /// Parse a serialized index; a missing compression-tag tail reads as all 0
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes, "version index");
        let asset_count = reader.u64()?;
        let chunk_count = reader.u64()?;
        let asset_count = reader.count(asset_count, 28)?;
        let chunk_count = reader.count(chunk_count, 12)?;

        let path_hashes = reader.u64_vec(asset_count)?;
        let content_hashes = reader.u64_vec(asset_count)?;
        let asset_sizes = reader.u32_vec(asset_count)?;
        let chunk_counts = reader.u32_vec(asset_count)?;
        let chunk_sizes = reader.u32_vec(chunk_count)?;
        let chunk_hashes = reader.u64_vec(chunk_count)?;
        let name_offsets = reader.u32_vec(asset_count)?;

        let rest = reader.rest();
        let mut names = Vec::with_capacity(asset_count);
        let mut cursor = 0usize;
        for (i, &offset) in name_offsets.iter().enumerate() {
            if offset as usize != cursor {
                return Err(Error::InvalidData(format!(
                    "version index: name {i} at offset {offset}, expected {cursor}"
                )));
            }
            let len = rest[cursor..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::InvalidData(format!("version index: name {i} is not terminated")))?;
            let name = std::str::from_utf8(&rest[cursor..cursor + len])
                .map_err(|e| Error::InvalidData(format!("version index: name {i}: {e}")))?;
            names.push(name.to_string());
            cursor += len + 1;
        }

        let tail = &rest[cursor..];
        let compression_tags = if tail.is_empty() {
            vec![0; asset_count]
        } else if tail.len() == asset_count * 4 {
            WireReader::new(tail, "version index tags").u32_vec(asset_count)?
        } else {
            return Err(Error::InvalidData(format!(
                "version index: {} unexpected trailing bytes",
                tail.len()
            )));
        };

        let mut chunk_starts = Vec::with_capacity(asset_count);
        let mut total = 0u64;
        for &count in &chunk_counts {
            chunk_starts.push(total as u32);
            total += count as u64;
        }
        if total != chunk_count as u64 {
            return Err(Error::InvalidData(format!(
                "version index: assets reference {total} chunks, header declares {chunk_count}"
            )));
        }

        Ok(Self {
            names,
            path_hashes,
            content_hashes,
            asset_sizes,
            chunk_starts,
            chunk_counts,
            compression_tags,
            chunk_hashes,
            chunk_sizes,
        })
    }
}

/// Write a version index file atomically
pub fn write_version_index(storage: &dyn Storage, path: &Path, index: &VersionIndex) -> Result<()> {
    atomic_write(storage, path, &index.to_bytes())
}

/// Read a version index file
pub fn read_version_index(storage: &dyn Storage, path: &Path) -> Result<VersionIndex> {
    VersionIndex::from_bytes(&storage.read_file(path)?)
}

/// Asset-level differences between two versions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionDiff {
    /// Source asset indexes with no counterpart in the target
    pub removed: Vec<usize>,
    /// Target asset indexes with no counterpart in the source
    pub added: Vec<usize>,
    /// (source, target) pairs whose content hash changed
    pub modified: Vec<(usize, usize)>,
}

impl VersionDiff {
    /// Compare by path hash, then by content hash
    pub fn compute(source: &VersionIndex, target: &VersionIndex) -> Self {
        let source_lookup: AHashMap<u64, usize> = source
            .path_hashes
            .iter()
            .enumerate()
            .map(|(i, &h)| (h, i))
            .collect();
        let target_lookup: AHashMap<u64, usize> = target
            .path_hashes
            .iter()
            .enumerate()
            .map(|(i, &h)| (h, i))
            .collect();

        let mut diff = Self::default();
        for (i, hash) in source.path_hashes.iter().enumerate() {
            if !target_lookup.contains_key(hash) {
                diff.removed.push(i);
            }
        }
        for (t, hash) in target.path_hashes.iter().enumerate() {
            match source_lookup.get(hash) {
                None => diff.added.push(t),
                Some(&s) if source.content_hashes[s] != target.content_hashes[t] => {
                    diff.modified.push((s, t))
                }
                Some(_) => {}
            }
        }

        diff.removed.sort_by(|&a, &b| source.names[a].cmp(&source.names[b]));
        diff.added.sort_by(|&a, &b| target.names[a].cmp(&target.names[b]));
        diff.modified
            .sort_by(|&(_, a), &(_, b)| target.names[a].cmp(&target.names[b]));
        diff
    }

    /// Check if there are any changes
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Free-function form of [`VersionDiff::compute`]
pub fn create_version_diff(source: &VersionIndex, target: &VersionIndex) -> VersionDiff {
    VersionDiff::compute(source, target)
}
