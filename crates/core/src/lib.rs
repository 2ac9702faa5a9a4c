//! Content-defined dedup and versioned storage primitives
//!
//! This crate provides:
//! - Version indexes (per-asset chunk lists) and their diff
//! - Content indexes (chunks packed into blocks), merge and retarget
//! - The block file format and compression registry
//! - Storage capability, hashing and the bounded job runner

pub mod block;
pub mod compression;
pub mod config;
pub mod content_index;
pub mod error;
pub mod hash;
pub mod indexer;
pub mod jobs;
pub mod storage;
pub mod version_index;

mod wire;

// Re-exports
pub use block::{block_path, BlockIndex, StoredBlock};
pub use compression::{CompressionKind, CompressionRegistry, COMPRESSION_NONE};
pub use config::DepotConfig;
pub use content_index::{
    create_content_index, create_missing_content, diff_hashes, merge_content_index,
    read_content_index, retarget_content, validate_content, validate_version,
    write_content_index, ContentIndex,
};
pub use error::{Error, Result};
pub use hash::{Blake3Hasher, BlockHash, ChunkHash, ChunkHasher, SharedHasher};
pub use indexer::{create_version_index, get_files_recursively, FileInfos};
pub use jobs::{JobRunner, Progress};
pub use storage::{FsStorage, SharedStorage, Storage};
pub use version_index::{
    create_version_diff, read_version_index, write_version_index, AssetEntry, VersionDiff,
    VersionIndex,
};
