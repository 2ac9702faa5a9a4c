//! 64-bit content hashing for chunks, assets, paths and blocks

use std::sync::Arc;

/// Hash of a chunk's bytes
pub type ChunkHash = u64;

/// Hash of a block's trailer
pub type BlockHash = u64;

/// Streaming hash state returned by [`ChunkHasher::begin`]
pub trait HashContext: Send {
    /// Feed more bytes
    fn update(&mut self, data: &[u8]);

    /// Consume the context and produce the 64-bit hash
    fn finish(self: Box<Self>) -> u64;
}

/// Begin/update/end hashing capability
pub trait ChunkHasher: Send + Sync {
    /// Stable identifier of the algorithm
    fn identifier(&self) -> u32;

    /// Start a streaming hash
    fn begin(&self) -> Box<dyn HashContext>;

    /// One-shot hash of a buffer
    fn hash_buffer(&self, data: &[u8]) -> u64 {
        let mut ctx = self.begin();
        ctx.update(data);
        ctx.finish()
    }
}

/// Shared hasher handle passed to jobs
pub type SharedHasher = Arc<dyn ChunkHasher>;

/// BLAKE3 truncated to its first 8 bytes (little-endian)
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

impl Blake3Hasher {
    /// FourCC `blk3`
    pub const IDENTIFIER: u32 = u32::from_le_bytes(*b"blk3");

    pub fn new() -> Self {
        Self
    }

    /// Shared handle for APIs taking [`SharedHasher`]
    pub fn shared() -> SharedHasher {
        Arc::new(Self)
    }
}

struct Blake3Context {
    inner: blake3::Hasher,
}

impl HashContext for Blake3Context {
    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finish(self: Box<Self>) -> u64 {
        truncate(self.inner.finalize().as_bytes())
    }
}

impl ChunkHasher for Blake3Hasher {
    fn identifier(&self) -> u32 {
        Self::IDENTIFIER
    }

    fn begin(&self) -> Box<dyn HashContext> {
        Box::new(Blake3Context {
            inner: blake3::Hasher::new(),
        })
    }

    fn hash_buffer(&self, data: &[u8]) -> u64 {
        truncate(blake3::hash(data).as_bytes())
    }
}

fn truncate(bytes: &[u8; 32]) -> u64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(head)
}

/// Fixed-width lowercase hex, as used in block file names
pub fn to_hex(hash: u64) -> String {
    format!("{hash:016x}")
}

/// Parse the output of [`to_hex`]
pub fn from_hex(hex: &str) -> Option<u64> {
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_consistency() {
        let hasher = Blake3Hasher::new();
        assert_eq!(hasher.hash_buffer(b"hello world"), hasher.hash_buffer(b"hello world"));
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let hasher = Blake3Hasher::new();
        let direct = hasher.hash_buffer(b"hello world");

        let mut ctx = hasher.begin();
        ctx.update(b"hello ");
        ctx.update(b"world");
        assert_eq!(ctx.finish(), direct);
    }

    #[test]
    fn test_truncation_is_blake3_prefix() {
        let full = blake3::hash(b"abc");
        let expected = u64::from_le_bytes(full.as_bytes()[..8].try_into().unwrap());
        assert_eq!(Blake3Hasher::new().hash_buffer(b"abc"), expected);
    }

    #[test]
    fn test_different_data_different_hash() {
        let hasher = Blake3Hasher::new();
        assert_ne!(hasher.hash_buffer(b"hello"), hasher.hash_buffer(b"world"));
    }

    #[test]
    fn test_hex_roundtrip() {
        let value = 0x00de_adbe_ef00_1234u64;
        let hex = to_hex(value);
        assert_eq!(hex, "00deadbeef001234");
        assert_eq!(from_hex(&hex), Some(value));
        assert_eq!(from_hex("abc"), None);
        assert_eq!(from_hex(&"g".repeat(16)), None);
    }
}
