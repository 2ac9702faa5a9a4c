//! Packing and job configuration loaded from `depot.toml`

use crate::compression::CompressionKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default fixed window used when hashing assets (32 KiB)
pub const DEFAULT_TARGET_CHUNK_SIZE: u32 = 32 * 1024;

/// Default upper bound on a block's uncompressed size (8 MiB)
pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 8 * 1024 * 1024;

/// Default upper bound on chunks per block
pub const DEFAULT_MAX_CHUNKS_PER_BLOCK: u32 = 1024;

/// Configuration for indexing, packing and job dispatch
///
/// Every field has a default so a partial TOML file is valid:
///
/// ```toml
/// target_chunk_size = 65536
/// compression = "zstd"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    /// Window size used to split assets into chunks
    pub target_chunk_size: u32,
    /// Maximum uncompressed size of a packed block
    pub max_block_size: u32,
    /// Maximum number of chunks in a packed block
    pub max_chunks_per_block: u32,
    /// Codec applied to newly indexed assets
    pub compression: CompressionKind,
    /// Maximum number of jobs in flight
    pub max_jobs: usize,
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            target_chunk_size: DEFAULT_TARGET_CHUNK_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_chunks_per_block: DEFAULT_MAX_CHUNKS_PER_BLOCK,
            compression: CompressionKind::Zstd,
            max_jobs: default_max_jobs(),
        }
    }
}

impl DepotConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse and validate configuration text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: DepotConfig = toml::from_str(text)
            .map_err(|e| Error::InvalidData(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::InvalidData(format!("config: {e}")))
    }

    /// Largest block payload this configuration can produce
    ///
    /// A chunk bigger than `max_block_size` is packed into a block of its own.
    pub fn max_payload_size(&self) -> usize {
        self.max_block_size.max(self.target_chunk_size) as usize
    }

    /// Reject zero sizes and job counts
    pub fn validate(&self) -> Result<()> {
        if self.target_chunk_size == 0 {
            return Err(Error::InvalidArgument("target_chunk_size must be non-zero".into()));
        }
        if self.max_block_size == 0 {
            return Err(Error::InvalidArgument("max_block_size must be non-zero".into()));
        }
        if self.max_chunks_per_block == 0 {
            return Err(Error::InvalidArgument("max_chunks_per_block must be non-zero".into()));
        }
        if self.max_jobs == 0 {
            return Err(Error::InvalidArgument("max_jobs must be non-zero".into()));
        }
        Ok(())
    }
}

fn default_max_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
