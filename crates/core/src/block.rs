//! Block format: chunk payload, 16-byte padding, then a trailer read from the end
//!
//! ```text
//! [payload][zero padding to 16][chunk_hash:u64 × N][chunk_size:u32 × N][tag:u32][chunk_count:u32]
//! ```
//!
//! For tag 0 the payload is the raw concatenated chunks. Otherwise it is
//! `[uncompressed:u32][compressed:u32][compressed bytes]`.

use crate::compression::{read_payload_header, COMPRESSION_NONE, PAYLOAD_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::hash::{to_hex, BlockHash, ChunkHash, ChunkHasher};
use crate::wire::{put_u32s, put_u64s, WireReader};
use bytes::{BufMut, Bytes};
use std::path::{Path, PathBuf};

/// Extension of block files
pub const BLOCK_EXTENSION: &str = "lrb";

const ALIGNMENT: usize = 16;

/// Describes the chunks inside a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndex {
    pub block_hash: BlockHash,
    /// Compression tag of the stored payload
    pub tag: u32,
    pub chunk_hashes: Vec<ChunkHash>,
    pub chunk_sizes: Vec<u32>,
}

impl BlockIndex {
    /// Build an index, deriving the block hash from the chunk arrays
    pub fn new(
        hasher: &dyn ChunkHasher,
        tag: u32,
        chunk_hashes: Vec<ChunkHash>,
        chunk_sizes: Vec<u32>,
    ) -> Result<Self> {
        if chunk_hashes.len() != chunk_sizes.len() {
            return Err(Error::InvalidArgument(format!(
                "{} chunk hashes but {} chunk sizes",
                chunk_hashes.len(),
                chunk_sizes.len()
            )));
        }
        let block_hash = block_hash_of(hasher, &chunk_hashes, &chunk_sizes);
        Ok(Self {
            block_hash,
            tag,
            chunk_hashes,
            chunk_sizes,
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }

    /// Sum of chunk sizes, i.e. the uncompressed payload length
    pub fn data_size(&self) -> u64 {
        self.chunk_sizes.iter().map(|&s| s as u64).sum()
    }

    fn trailer_size(chunk_count: usize) -> usize {
        chunk_count * 12 + 8
    }

    fn write_trailer(&self, tag: u32, out: &mut Vec<u8>) {
        put_u64s(out, &self.chunk_hashes);
        put_u32s(out, &self.chunk_sizes);
        out.put_u32_le(tag);
        out.put_u32_le(self.chunk_hashes.len() as u32);
    }
}

/// Deterministic block hash over the trailer's hash and size arrays
pub fn block_hash_of(hasher: &dyn ChunkHasher, chunk_hashes: &[ChunkHash], chunk_sizes: &[u32]) -> BlockHash {
    let mut trailer = Vec::with_capacity(chunk_hashes.len() * 12);
    put_u64s(&mut trailer, chunk_hashes);
    put_u32s(&mut trailer, chunk_sizes);
    hasher.hash_buffer(&trailer)
}

/// A block as handed between store layers
///
/// `index.tag` is the compression the block asks for. `compressed` says
/// whether `data` currently holds that encoding or the raw chunks; a raw
/// block always serializes with tag 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub index: BlockIndex,
    pub data: Bytes,
    pub compressed: bool,
}

impl StoredBlock {
    /// Block holding the raw concatenated chunks
    pub fn new(index: BlockIndex, data: impl Into<Bytes>) -> Self {
        Self {
            index,
            data: data.into(),
            compressed: false,
        }
    }

    /// Block holding a payload already encoded with `index.tag`
    pub fn from_payload(index: BlockIndex, payload: impl Into<Bytes>) -> Self {
        let compressed = index.tag != COMPRESSION_NONE;
        Self {
            index,
            data: payload.into(),
            compressed,
        }
    }

    pub fn block_hash(&self) -> BlockHash {
        self.index.block_hash
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Tag written to the trailer: the payload encoding
    pub fn payload_tag(&self) -> u32 {
        if self.compressed {
            self.index.tag
        } else {
            COMPRESSION_NONE
        }
    }

    /// Bytes of chunk `i` in an uncompressed block
    pub fn chunk_data(&self, i: usize) -> Result<Bytes> {
        if self.is_compressed() {
            return Err(Error::InvalidArgument("chunk access on compressed block".into()));
        }
        let size = *self.index.chunk_sizes.get(i).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "chunk {i} out of range for a block of {} chunks",
                self.index.chunk_count()
            ))
        })? as usize;
        let offset: usize = self.index.chunk_sizes[..i].iter().map(|&s| s as usize).sum();
        if offset + size > self.data.len() {
            return Err(Error::DataCorruption(format!(
                "block {} holds {} bytes, chunk {i} ends at {}",
                to_hex(self.block_hash()),
                self.data.len(),
                offset + size
            )));
        }
        Ok(self.data.slice(offset..offset + size))
    }

    /// Serialize to the on-disk block layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let padded = align(self.data.len());
        let mut out = Vec::with_capacity(padded + BlockIndex::trailer_size(self.index.chunk_count()));
        out.extend_from_slice(&self.data);
        out.resize(padded, 0);
        self.index.write_trailer(self.payload_tag(), &mut out);
        out
    }

    /// Parse a serialized block, validating its trailer and payload length
    pub fn from_bytes(hasher: &dyn ChunkHasher, bytes: &[u8]) -> Result<Self> {
        let (index, data_end) = parse_trailer(hasher, bytes)?;
        Ok(Self::from_payload(index, Bytes::copy_from_slice(&bytes[..data_end])))
    }

    /// Independently owned copy made by a serialize/parse round trip
    pub fn duplicate(&self, hasher: &dyn ChunkHasher) -> Result<Self> {
        Self::from_bytes(hasher, &self.to_bytes())
    }
}

/// Read only the index of a serialized block
pub fn read_block_index(hasher: &dyn ChunkHasher, bytes: &[u8]) -> Result<BlockIndex> {
    parse_trailer(hasher, bytes).map(|(index, _)| index)
}

fn parse_trailer(hasher: &dyn ChunkHasher, bytes: &[u8]) -> Result<(BlockIndex, usize)> {
    let corrupt = |msg: String| Error::DataCorruption(format!("block trailer: {msg}"));
    if bytes.len() < 8 {
        return Err(corrupt(format!("{} bytes is too short", bytes.len())));
    }
    let tail = &bytes[bytes.len() - 8..];
    let tag = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let chunk_count = u32::from_le_bytes([tail[4], tail[5], tail[6], tail[7]]) as usize;
    let trailer_size = BlockIndex::trailer_size(chunk_count);
    if bytes.len() < trailer_size {
        return Err(corrupt(format!("{chunk_count} chunks do not fit in {} bytes", bytes.len())));
    }
    let trailer_start = bytes.len() - trailer_size;

    let mut reader = WireReader::new(&bytes[trailer_start..], "block trailer");
    let chunk_hashes = reader.u64_vec(chunk_count)?;
    let chunk_sizes = reader.u32_vec(chunk_count)?;

    let payload = &bytes[..trailer_start];
    let data_len = if tag == COMPRESSION_NONE {
        chunk_sizes.iter().map(|&s| s as usize).sum::<usize>()
    } else {
        let (_, compressed) = read_payload_header(payload)?;
        PAYLOAD_HEADER_SIZE + compressed
    };
    if align(data_len) != trailer_start {
        return Err(corrupt(format!(
            "payload of {data_len} bytes does not match trailer offset {trailer_start}"
        )));
    }

    let index = BlockIndex::new(hasher, tag, chunk_hashes, chunk_sizes)?;
    Ok((index, data_len))
}

fn align(len: usize) -> usize {
    len.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Location of a block under a store root: `<root>/<hhhh>/<hash>.lrb`
pub fn block_path(root: &Path, hash: BlockHash) -> PathBuf {
    let hex = to_hex(hash);
    root.join(&hex[..4]).join(format!("{hex}.{BLOCK_EXTENSION}"))
}

/// Inverse of [`block_path`] for the file name part
pub fn block_hash_from_file_name(name: &str) -> Option<BlockHash> {
    let stem = name.strip_suffix(BLOCK_EXTENSION)?.strip_suffix('.')?;
    crate::hash::from_hex(stem)
}
