//! Layered asynchronous block stores
//!
//! This crate provides:
//! - The `BlockStore` trait and a shared handle type
//! - Base stores: one file per block (`FsBlockStore`) and in-memory (`MemBlockStore`)
//! - Decorators: payload compression and a local cache in front of a remote
//! - Per-store counters and pending-request tracking for shutdown

pub mod block_store;
pub mod cache;
pub mod compress;
pub mod fs;
pub mod mem;
pub mod pending;
pub mod stats;

// Re-exports
pub use block_store::{BlockStore, SharedBlockStore};
pub use cache::CacheBlockStore;
pub use compress::CompressBlockStore;
pub use fs::FsBlockStore;
pub use mem::MemBlockStore;
pub use pending::{PendingGuard, PendingRequests};
pub use stats::{BlockStoreStats, StatsCounters};
