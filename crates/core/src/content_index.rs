//! Content index: which block holds each unique chunk, and the packing
//! algorithms that build, diff, merge and retarget it

use crate::block::{block_hash_of, BlockIndex};
use crate::compression::COMPRESSION_NONE;
use crate::error::{Error, Result};
use crate::hash::{to_hex, BlockHash, ChunkHash, ChunkHasher};
use crate::storage::{atomic_write, Storage};
use crate::version_index::VersionIndex;
use crate::wire::{put_u32s, put_u64s, WireReader};
use ahash::{AHashMap, AHashSet};
use bytes::BufMut;
use std::ops::Range;
use std::path::Path;
use tracing::debug;

/// Map from unique chunk hash to (block, offset, length), plus the block list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentIndex {
    block_hashes: Vec<BlockHash>,
    chunk_hashes: Vec<ChunkHash>,
    chunk_block_indexes: Vec<u64>,
    chunk_block_offsets: Vec<u32>,
    chunk_lengths: Vec<u32>,
}

impl ContentIndex {
    /// Zero blocks, zero chunks
    pub fn empty() -> Self {
        Self::default()
    }

    /// Lay out blocks in order; each block's chunks follow each other
    pub fn from_block_indexes<'a>(blocks: impl IntoIterator<Item = &'a BlockIndex>) -> Self {
        let mut index = Self::empty();
        for block in blocks {
            let block_index = index.block_hashes.len() as u64;
            index.block_hashes.push(block.block_hash);
            let mut offset = 0u32;
            for (&hash, &size) in block.chunk_hashes.iter().zip(&block.chunk_sizes) {
                index.chunk_hashes.push(hash);
                index.chunk_block_indexes.push(block_index);
                index.chunk_block_offsets.push(offset);
                index.chunk_lengths.push(size);
                offset = offset.wrapping_add(size);
            }
        }
        index
    }

    pub fn block_count(&self) -> usize {
        self.block_hashes.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_hashes.is_empty() && self.chunk_hashes.is_empty()
    }

    pub fn block_hashes(&self) -> &[BlockHash] {
        &self.block_hashes
    }

    pub fn chunk_hashes(&self) -> &[ChunkHash] {
        &self.chunk_hashes
    }

    pub fn chunk_block_indexes(&self) -> &[u64] {
        &self.chunk_block_indexes
    }

    pub fn chunk_block_offsets(&self) -> &[u32] {
        &self.chunk_block_offsets
    }

    pub fn chunk_lengths(&self) -> &[u32] {
        &self.chunk_lengths
    }

    /// Chunk index range of every block, in block order
    pub fn block_chunk_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = vec![0..0; self.block_hashes.len()];
        let mut start = 0;
        while start < self.chunk_hashes.len() {
            let block = self.chunk_block_indexes[start];
            let mut end = start + 1;
            while end < self.chunk_hashes.len() && self.chunk_block_indexes[end] == block {
                end += 1;
            }
            if let Some(range) = ranges.get_mut(block as usize) {
                if range.is_empty() {
                    *range = start..end;
                }
            }
            start = end;
        }
        ranges
    }

    /// Chunk hash to chunk position; when a hash repeats the first entry wins
    pub fn chunk_lookup(&self) -> AHashMap<ChunkHash, usize> {
        let mut lookup = AHashMap::with_capacity(self.chunk_hashes.len());
        for (i, &hash) in self.chunk_hashes.iter().enumerate() {
            lookup.entry(hash).or_insert(i);
        }
        lookup
    }

    /// Block hash to block position; first entry wins
    pub fn block_lookup(&self) -> AHashMap<BlockHash, usize> {
        let mut lookup = AHashMap::with_capacity(self.block_hashes.len());
        for (i, &hash) in self.block_hashes.iter().enumerate() {
            lookup.entry(hash).or_insert(i);
        }
        lookup
    }

    /// Rebuild the trailer index of block `block` with the given tag
    pub fn block_index(&self, hasher: &dyn ChunkHasher, block: usize, tag: u32) -> Result<BlockIndex> {
        let range = self
            .block_chunk_ranges()
            .get(block)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("block {block} out of range")))?;
        BlockIndex::new(
            hasher,
            tag,
            self.chunk_hashes[range.clone()].to_vec(),
            self.chunk_lengths[range].to_vec(),
        )
    }

    /// Serialize to the flat content index layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let blocks = self.block_hashes.len();
        let chunks = self.chunk_hashes.len();
        let mut out = Vec::with_capacity(16 + blocks * 8 + chunks * 24);
        out.put_u64_le(blocks as u64);
        out.put_u64_le(chunks as u64);
        put_u64s(&mut out, &self.block_hashes);
        put_u64s(&mut out, &self.chunk_hashes);
        put_u64s(&mut out, &self.chunk_block_indexes);
        put_u32s(&mut out, &self.chunk_block_offsets);
        put_u32s(&mut out, &self.chunk_lengths);
        out
    }

    /// Parse and check the block references of a serialized index
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes, "content index");
        let block_count = reader.u64()?;
        let chunk_count = reader.u64()?;
        let block_count = reader.count(block_count, 8)?;
        let chunk_count = reader.count(chunk_count, 24)?;
        let index = Self {
            block_hashes: reader.u64_vec(block_count)?,
            chunk_hashes: reader.u64_vec(chunk_count)?,
            chunk_block_indexes: reader.u64_vec(chunk_count)?,
            chunk_block_offsets: reader.u32_vec(chunk_count)?,
            chunk_lengths: reader.u32_vec(chunk_count)?,
        };
        if reader.remaining() != 0 {
            return Err(Error::InvalidData(format!(
                "content index: {} trailing bytes",
                reader.remaining()
            )));
        }
        if let Some(bad) = index
            .chunk_block_indexes
            .iter()
            .find(|&&b| b >= block_count as u64)
        {
            return Err(Error::InvalidData(format!(
                "content index: block index {bad} out of range ({block_count} blocks)"
            )));
        }
        Ok(index)
    }
}

/// Write a content index file atomically
pub fn write_content_index(storage: &dyn Storage, path: &Path, index: &ContentIndex) -> Result<()> {
    atomic_write(storage, path, &index.to_bytes())
}

/// Read a content index file
pub fn read_content_index(storage: &dyn Storage, path: &Path) -> Result<ContentIndex> {
    ContentIndex::from_bytes(&storage.read_file(path)?)
}

fn check_limits(max_block_size: u32, max_chunks_per_block: u32) -> Result<()> {
    if max_block_size == 0 || max_chunks_per_block == 0 {
        return Err(Error::InvalidArgument(format!(
            "max_block_size ({max_block_size}) and max_chunks_per_block ({max_chunks_per_block}) must be non-zero"
        )));
    }
    Ok(())
}

/// Greedy bin-packing of unique chunks into block indexes (tag 0)
///
/// A block grows while `size + next <= max_block_size` and it holds fewer
/// than `max_chunks_per_block` chunks; a chunk larger than the limit gets a
/// block of its own.
pub fn pack_blocks(
    hasher: &dyn ChunkHasher,
    chunk_hashes: &[ChunkHash],
    chunk_sizes: &[u32],
    max_block_size: u32,
    max_chunks_per_block: u32,
) -> Vec<BlockIndex> {
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < chunk_hashes.len() {
        let start = i;
        let mut block_size = chunk_sizes[i] as u64;
        i += 1;
        while i < chunk_hashes.len()
            && block_size + chunk_sizes[i] as u64 <= max_block_size as u64
            && ((i - start) as u32) < max_chunks_per_block
        {
            block_size += chunk_sizes[i] as u64;
            i += 1;
        }
        let hashes = chunk_hashes[start..i].to_vec();
        let sizes = chunk_sizes[start..i].to_vec();
        let block_hash = block_hash_of(hasher, &hashes, &sizes);
        blocks.push(BlockIndex {
            block_hash,
            tag: COMPRESSION_NONE,
            chunk_hashes: hashes,
            chunk_sizes: sizes,
        });
    }
    blocks
}

/// Deduplicate chunks (first occurrence wins) and pack them into blocks
pub fn create_content_index(
    hasher: &dyn ChunkHasher,
    chunk_hashes: &[ChunkHash],
    chunk_sizes: &[u32],
    max_block_size: u32,
    max_chunks_per_block: u32,
) -> Result<ContentIndex> {
    if chunk_hashes.len() != chunk_sizes.len() {
        return Err(Error::InvalidArgument(format!(
            "{} chunk hashes but {} chunk sizes",
            chunk_hashes.len(),
            chunk_sizes.len()
        )));
    }
    check_limits(max_block_size, max_chunks_per_block)?;

    let mut seen = AHashSet::with_capacity(chunk_hashes.len());
    let mut unique_hashes = Vec::with_capacity(chunk_hashes.len());
    let mut unique_sizes = Vec::with_capacity(chunk_hashes.len());
    for (&hash, &size) in chunk_hashes.iter().zip(chunk_sizes) {
        if seen.insert(hash) {
            unique_hashes.push(hash);
            unique_sizes.push(size);
        }
    }

    let blocks = pack_blocks(hasher, &unique_hashes, &unique_sizes, max_block_size, max_chunks_per_block);
    debug!(
        "packed {} unique chunks (of {}) into {} blocks",
        unique_hashes.len(),
        chunk_hashes.len(),
        blocks.len()
    );
    Ok(ContentIndex::from_block_indexes(&blocks))
}

/// Pack only the chunks of `version` that `existing` does not already hold
pub fn create_missing_content(
    hasher: &dyn ChunkHasher,
    existing: &ContentIndex,
    version: &VersionIndex,
    max_block_size: u32,
    max_chunks_per_block: u32,
) -> Result<ContentIndex> {
    check_limits(max_block_size, max_chunks_per_block)?;
    let present: AHashSet<ChunkHash> = existing.chunk_hashes().iter().copied().collect();

    let mut added = AHashSet::new();
    let mut hashes = Vec::new();
    let mut sizes = Vec::new();
    for (&hash, &size) in version.chunk_hashes().iter().zip(version.chunk_sizes()) {
        if !present.contains(&hash) && added.insert(hash) {
            hashes.push(hash);
            sizes.push(size);
        }
    }
    if hashes.is_empty() {
        return Ok(ContentIndex::empty());
    }
    create_content_index(hasher, &hashes, &sizes, max_block_size, max_chunks_per_block)
}

/// Concatenate `a` then `b`, offsetting `b`'s block references
///
/// Chunks present in both inputs appear twice; lookups resolve to `a`'s entry.
pub fn merge_content_index(a: &ContentIndex, b: &ContentIndex) -> ContentIndex {
    let offset = a.block_hashes.len() as u64;
    let mut merged = a.clone();
    merged.block_hashes.extend_from_slice(&b.block_hashes);
    merged.chunk_hashes.extend_from_slice(&b.chunk_hashes);
    merged
        .chunk_block_indexes
        .extend(b.chunk_block_indexes.iter().map(|&i| i + offset));
    merged.chunk_block_offsets.extend_from_slice(&b.chunk_block_offsets);
    merged.chunk_lengths.extend_from_slice(&b.chunk_lengths);
    merged
}

/// Restrict `superset` to the chunks named by `subset`
///
/// Blocks keep their superset order and are renumbered; chunk offsets stay
/// valid because the blocks themselves are unchanged.
pub fn retarget_content(superset: &ContentIndex, subset: &ContentIndex) -> Result<ContentIndex> {
    let lookup = superset.chunk_lookup();
    let mut wanted = vec![false; superset.chunk_count()];
    for &hash in subset.chunk_hashes() {
        let position = lookup.get(&hash).ok_or_else(|| {
            Error::NotFound(format!("chunk {} is not in the store index", to_hex(hash)))
        })?;
        wanted[*position] = true;
    }

    let mut out = ContentIndex::empty();
    let mut remap: AHashMap<u64, u64> = AHashMap::new();
    for (i, keep) in wanted.into_iter().enumerate() {
        if !keep {
            continue;
        }
        let old_block = superset.chunk_block_indexes[i];
        let new_block = *remap.entry(old_block).or_insert_with(|| {
            out.block_hashes.push(superset.block_hashes[old_block as usize]);
            (out.block_hashes.len() - 1) as u64
        });
        out.chunk_hashes.push(superset.chunk_hashes[i]);
        out.chunk_block_indexes.push(new_block);
        out.chunk_block_offsets.push(superset.chunk_block_offsets[i]);
        out.chunk_lengths.push(superset.chunk_lengths[i]);
    }
    Ok(out)
}

/// Sorted set difference: `(added, removed)` = (only in `new`, only in `reference`)
pub fn diff_hashes(reference: &[u64], new: &[u64]) -> (Vec<u64>, Vec<u64>) {
    let mut reference = reference.to_vec();
    reference.sort_unstable();
    reference.dedup();
    let mut new = new.to_vec();
    new.sort_unstable();
    new.dedup();

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let (mut r, mut n) = (0, 0);
    while r < reference.len() && n < new.len() {
        match reference[r].cmp(&new[n]) {
            std::cmp::Ordering::Equal => {
                r += 1;
                n += 1;
            }
            std::cmp::Ordering::Less => {
                removed.push(reference[r]);
                r += 1;
            }
            std::cmp::Ordering::Greater => {
                added.push(new[n]);
                n += 1;
            }
        }
    }
    removed.extend_from_slice(&reference[r..]);
    added.extend_from_slice(&new[n..]);
    (added, removed)
}

/// Every chunk of `version` must be present in `content` with the same length
pub fn validate_content(content: &ContentIndex, version: &VersionIndex) -> Result<()> {
    let lookup = content.chunk_lookup();
    for (&hash, &size) in version.chunk_hashes().iter().zip(version.chunk_sizes()) {
        match lookup.get(&hash) {
            None => {
                return Err(Error::Validation(format!(
                    "chunk {} of the version is missing from the content index",
                    to_hex(hash)
                )))
            }
            Some(&i) if content.chunk_lengths[i] != size => {
                return Err(Error::Validation(format!(
                    "chunk {} is {size} bytes in the version but {} in the content index",
                    to_hex(hash),
                    content.chunk_lengths[i]
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Every chunk of `content` must be referenced by `version`
pub fn validate_version(content: &ContentIndex, version: &VersionIndex) -> Result<()> {
    let referenced: AHashSet<ChunkHash> = version.chunk_hashes().iter().copied().collect();
    if let Some(&hash) = content.chunk_hashes().iter().find(|h| !referenced.contains(h)) {
        return Err(Error::Validation(format!(
            "chunk {} of the content index is not used by the version",
            to_hex(hash)
        )));
    }
    Ok(())
}
