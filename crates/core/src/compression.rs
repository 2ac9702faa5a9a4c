//! Codec capability and the tag-keyed compression registry
//!
//! A compression tag is `(codec << 8) | setting`. Tag `0` always means
//! "stored raw" and is never present in a registry.

use crate::config::DEFAULT_MAX_BLOCK_SIZE;
use crate::error::{Error, Result};
use ahash::AHashMap;
use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;

/// Tag for uncompressed storage
pub const COMPRESSION_NONE: u32 = 0;

const ZSTD_CODEC: u32 = 1;
const DEFLATE_CODEC: u32 = 2;

const fn make_tag(codec: u32, setting: u32) -> u32 {
    (codec << 8) | setting
}

pub const ZSTD_MIN: u32 = make_tag(ZSTD_CODEC, 1);
pub const ZSTD_DEFAULT: u32 = make_tag(ZSTD_CODEC, 2);
pub const ZSTD_MAX: u32 = make_tag(ZSTD_CODEC, 3);
pub const DEFLATE_MIN: u32 = make_tag(DEFLATE_CODEC, 1);
pub const DEFLATE_DEFAULT: u32 = make_tag(DEFLATE_CODEC, 2);
pub const DEFLATE_MAX: u32 = make_tag(DEFLATE_CODEC, 3);

/// Size of the `[uncompressed:u32][compressed:u32]` payload header
pub const PAYLOAD_HEADER_SIZE: usize = 8;

/// Configuration-facing codec choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionKind {
    None,
    Zstd,
    ZstdMax,
    Deflate,
}

impl CompressionKind {
    /// Registry tag for this choice
    pub fn tag(self) -> u32 {
        match self {
            CompressionKind::None => COMPRESSION_NONE,
            CompressionKind::Zstd => ZSTD_DEFAULT,
            CompressionKind::ZstdMax => ZSTD_MAX,
            CompressionKind::Deflate => DEFLATE_DEFAULT,
        }
    }
}

impl std::str::FromStr for CompressionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CompressionKind::None),
            "zstd" => Ok(CompressionKind::Zstd),
            "zstd-max" => Ok(CompressionKind::ZstdMax),
            "deflate" => Ok(CompressionKind::Deflate),
            other => Err(Error::InvalidArgument(format!("unknown compression '{other}'"))),
        }
    }
}

/// Compress/decompress capability
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compress `data` at a codec-specific `setting`
    fn compress(&self, data: &[u8], setting: i32) -> Result<Vec<u8>>;

    /// Decompress into a buffer of at most `uncompressed_size` bytes
    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>>;
}

/// zstd via the bulk API
#[derive(Debug, Default)]
pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8], setting: i32) -> Result<Vec<u8>> {
        Ok(zstd::bulk::compress(data, setting)?)
    }

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(data, uncompressed_size)
            .map_err(|e| Error::DataCorruption(format!("zstd: {e}")))
    }
}

/// Raw deflate via flate2
#[derive(Debug, Default)]
pub struct DeflateCodec;

impl Codec for DeflateCodec {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, data: &[u8], setting: i32) -> Result<Vec<u8>> {
        let level = flate2::Compression::new(setting.clamp(0, 9) as u32);
        let mut encoder = flate2::write::DeflateEncoder::new(Vec::with_capacity(data.len() / 2), level);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(uncompressed_size);
        flate2::read::DeflateDecoder::new(data)
            .take(uncompressed_size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| Error::DataCorruption(format!("deflate: {e}")))?;
        Ok(out)
    }
}

#[derive(Clone)]
struct RegistryEntry {
    codec: Arc<dyn Codec>,
    setting: i32,
}

/// Maps compression tags to a codec and its setting
///
/// Decompression refuses payloads whose header declares more than
/// `max_payload_size` bytes.
#[derive(Clone)]
pub struct CompressionRegistry {
    entries: AHashMap<u32, RegistryEntry>,
    max_payload_size: usize,
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        Self {
            entries: AHashMap::new(),
            max_payload_size: DEFAULT_MAX_BLOCK_SIZE as usize,
        }
    }
}

impl CompressionRegistry {
    /// Empty registry; only tag 0 is usable
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with zstd and deflate at min/default/max settings
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let zstd: Arc<dyn Codec> = Arc::new(ZstdCodec);
        let deflate: Arc<dyn Codec> = Arc::new(DeflateCodec);
        for (tag, codec, setting) in [
            (ZSTD_MIN, &zstd, 1),
            (ZSTD_DEFAULT, &zstd, 3),
            (ZSTD_MAX, &zstd, 19),
            (DEFLATE_MIN, &deflate, 1),
            (DEFLATE_DEFAULT, &deflate, 6),
            (DEFLATE_MAX, &deflate, 9),
        ] {
            registry.entries.insert(
                tag,
                RegistryEntry {
                    codec: Arc::clone(codec),
                    setting,
                },
            );
        }
        registry
    }

    /// Largest uncompressed payload accepted by [`decompress_payload`](Self::decompress_payload)
    pub fn with_max_payload_size(mut self, limit: usize) -> Self {
        self.max_payload_size = limit;
        self
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Register (or replace) a codec for `tag`
    pub fn register(&mut self, tag: u32, codec: Arc<dyn Codec>, setting: i32) -> Result<()> {
        if tag == COMPRESSION_NONE {
            return Err(Error::InvalidArgument("tag 0 is reserved for raw storage".into()));
        }
        self.entries.insert(tag, RegistryEntry { codec, setting });
        Ok(())
    }

    /// Resolve a tag to its codec and setting
    pub fn resolve(&self, tag: u32) -> Result<(&dyn Codec, i32)> {
        self.entries
            .get(&tag)
            .map(|e| (e.codec.as_ref(), e.setting))
            .ok_or_else(|| Error::Unsupported(format!("no codec registered for tag {tag:#x}")))
    }

    /// Compress into `[uncompressed:u32][compressed:u32][bytes]`
    pub fn compress_payload(&self, tag: u32, data: &[u8]) -> Result<Vec<u8>> {
        let (codec, setting) = self.resolve(tag)?;
        let uncompressed = u32::try_from(data.len())
            .map_err(|_| Error::InvalidArgument(format!("payload of {} bytes too large", data.len())))?;
        let compressed = codec.compress(data, setting)?;
        let mut out = Vec::with_capacity(PAYLOAD_HEADER_SIZE + compressed.len());
        out.extend_from_slice(&uncompressed.to_le_bytes());
        out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Inverse of [`compress_payload`](Self::compress_payload)
    pub fn decompress_payload(&self, tag: u32, payload: &[u8]) -> Result<Vec<u8>> {
        let (uncompressed, compressed) = read_payload_header(payload)?;
        if uncompressed > self.max_payload_size {
            return Err(Error::DataCorruption(format!(
                "payload declares {uncompressed} bytes, limit is {}",
                self.max_payload_size
            )));
        }
        let body = &payload[PAYLOAD_HEADER_SIZE..];
        if body.len() < compressed {
            return Err(Error::DataCorruption(format!(
                "compressed payload truncated: {} of {compressed} bytes",
                body.len()
            )));
        }
        let (codec, _) = self.resolve(tag)?;
        let out = codec.decompress(&body[..compressed], uncompressed)?;
        if out.len() != uncompressed {
            return Err(Error::DataCorruption(format!(
                "decompressed {} bytes, header declares {uncompressed}",
                out.len()
            )));
        }
        Ok(out)
    }
}

impl std::fmt::Debug for CompressionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.entries.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("CompressionRegistry")
            .field("tags", &tags)
            .field("max_payload_size", &self.max_payload_size)
            .finish()
    }
}

/// Parse `(uncompressed, compressed)` sizes from a payload header
pub fn read_payload_header(payload: &[u8]) -> Result<(usize, usize)> {
    if payload.len() < PAYLOAD_HEADER_SIZE {
        return Err(Error::DataCorruption("compressed payload shorter than header".into()));
    }
    let mut header = &payload[..PAYLOAD_HEADER_SIZE];
    let uncompressed = header.get_u32_le();
    let compressed = header.get_u32_le();
    Ok((uncompressed as usize, compressed as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{RngCore, SeedableRng};

    fn sample() -> Vec<u8> {
        let mut data = b"depot block payload ".repeat(400);
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let mut noise = vec![0u8; 2048];
        rng.fill_bytes(&mut noise);
        data.extend_from_slice(&noise);
        data
    }

    #[test]
    fn test_every_registered_codec_roundtrips() {
        let registry = CompressionRegistry::with_defaults();
        let data = sample();
        for tag in [ZSTD_MIN, ZSTD_DEFAULT, ZSTD_MAX, DEFLATE_MIN, DEFLATE_DEFAULT, DEFLATE_MAX] {
            let payload = registry.compress_payload(tag, &data).unwrap();
            assert_eq!(registry.decompress_payload(tag, &payload).unwrap(), data, "tag {tag:#x}");
        }
    }

    #[test]
    fn test_empty_payload_roundtrips() {
        let registry = CompressionRegistry::with_defaults();
        let payload = registry.compress_payload(ZSTD_DEFAULT, &[]).unwrap();
        assert!(registry.decompress_payload(ZSTD_DEFAULT, &payload).unwrap().is_empty());
    }

    #[test]
    fn test_size_mismatch_is_corruption() {
        let registry = CompressionRegistry::with_defaults();
        let mut payload = registry.compress_payload(ZSTD_DEFAULT, &sample()).unwrap();
        let declared = u32::from_le_bytes(payload[0..4].try_into().unwrap()) + 10;
        payload[0..4].copy_from_slice(&declared.to_le_bytes());
        let err = registry.decompress_payload(ZSTD_DEFAULT, &payload).unwrap_err();
        assert!(matches!(err, Error::DataCorruption(_)));
    }

    #[test]
    fn test_declared_size_over_limit_rejected() {
        let registry = CompressionRegistry::with_defaults().with_max_payload_size(1024);
        let mut payload = registry.compress_payload(ZSTD_DEFAULT, b"tiny").unwrap();
        payload[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = registry.decompress_payload(ZSTD_DEFAULT, &payload).unwrap_err();
        assert!(matches!(err, Error::DataCorruption(_)));

        let data = sample();
        let payload = registry.compress_payload(DEFLATE_DEFAULT, &data).unwrap();
        assert!(matches!(
            registry.decompress_payload(DEFLATE_DEFAULT, &payload),
            Err(Error::DataCorruption(_))
        ));
        let roomy = CompressionRegistry::with_defaults().with_max_payload_size(data.len());
        assert_eq!(roomy.decompress_payload(DEFLATE_DEFAULT, &payload).unwrap(), data);
    }

    #[test]
    fn test_unknown_tag_is_unsupported() {
        let registry = CompressionRegistry::new();
        assert!(matches!(
            registry.compress_payload(ZSTD_DEFAULT, b"x"),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_tag_zero_cannot_be_registered() {
        let mut registry = CompressionRegistry::new();
        assert!(registry.register(0, Arc::new(ZstdCodec), 3).is_err());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("zstd-max".parse::<CompressionKind>().unwrap().tag(), ZSTD_MAX);
        assert_eq!("none".parse::<CompressionKind>().unwrap().tag(), COMPRESSION_NONE);
        assert!("lz77".parse::<CompressionKind>().is_err());
    }
}
