//! Per-store operation counters

use depot_core::{Result, StoredBlock};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a store's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStoreStats {
    pub get_count: u64,
    pub get_failures: u64,
    pub get_bytes: u64,
    pub get_chunks: u64,
    pub put_count: u64,
    pub put_failures: u64,
    pub put_bytes: u64,
    pub put_chunks: u64,
    pub preflight_count: u64,
    pub preflight_failures: u64,
    pub index_count: u64,
    pub index_failures: u64,
    pub retarget_count: u64,
    pub retarget_failures: u64,
    pub flush_count: u64,
}

/// Live counters owned by one store
#[derive(Debug, Default)]
pub struct StatsCounters {
    get_count: AtomicU64,
    get_failures: AtomicU64,
    get_bytes: AtomicU64,
    get_chunks: AtomicU64,
    put_count: AtomicU64,
    put_failures: AtomicU64,
    put_bytes: AtomicU64,
    put_chunks: AtomicU64,
    preflight_count: AtomicU64,
    preflight_failures: AtomicU64,
    index_count: AtomicU64,
    index_failures: AtomicU64,
    retarget_count: AtomicU64,
    retarget_failures: AtomicU64,
    flush_count: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn count<T>(result: &Result<T>, total: &AtomicU64, failures: &AtomicU64) {
    bump(total, 1);
    if result.is_err() {
        bump(failures, 1);
    }
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_get(&self, result: &Result<StoredBlock>) {
        count(result, &self.get_count, &self.get_failures);
        if let Ok(block) = result {
            bump(&self.get_bytes, block.data.len() as u64);
            bump(&self.get_chunks, block.index.chunk_count() as u64);
        }
    }

    pub fn on_put(&self, block: &StoredBlock, result: &Result<()>) {
        count(result, &self.put_count, &self.put_failures);
        if result.is_ok() {
            bump(&self.put_bytes, block.data.len() as u64);
            bump(&self.put_chunks, block.index.chunk_count() as u64);
        }
    }

    pub fn on_preflight<T>(&self, result: &Result<T>) {
        count(result, &self.preflight_count, &self.preflight_failures);
    }

    pub fn on_index<T>(&self, result: &Result<T>) {
        count(result, &self.index_count, &self.index_failures);
    }

    pub fn on_retarget<T>(&self, result: &Result<T>) {
        count(result, &self.retarget_count, &self.retarget_failures);
    }

    pub fn on_flush(&self) {
        bump(&self.flush_count, 1);
    }

    pub fn snapshot(&self) -> BlockStoreStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BlockStoreStats {
            get_count: load(&self.get_count),
            get_failures: load(&self.get_failures),
            get_bytes: load(&self.get_bytes),
            get_chunks: load(&self.get_chunks),
            put_count: load(&self.put_count),
            put_failures: load(&self.put_failures),
            put_bytes: load(&self.put_bytes),
            put_chunks: load(&self.put_chunks),
            preflight_count: load(&self.preflight_count),
            preflight_failures: load(&self.preflight_failures),
            index_count: load(&self.index_count),
            index_failures: load(&self.index_failures),
            retarget_count: load(&self.retarget_count),
            retarget_failures: load(&self.retarget_failures),
            flush_count: load(&self.flush_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::{Blake3Hasher, BlockIndex, Error, COMPRESSION_NONE};

    #[test]
    fn test_counts_successes_and_failures() {
        let stats = StatsCounters::new();
        let index = BlockIndex::new(&Blake3Hasher, COMPRESSION_NONE, vec![1, 2], vec![3, 4]).unwrap();
        let block = StoredBlock::new(index, vec![0u8; 7]);

        stats.on_put(&block, &Ok(()));
        stats.on_get(&Ok(block.clone()));
        stats.on_get(&Err(Error::NotFound("x".into())));
        stats.on_index(&Ok(()));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.put_count, 1);
        assert_eq!(snapshot.put_bytes, 7);
        assert_eq!(snapshot.put_chunks, 2);
        assert_eq!(snapshot.get_count, 2);
        assert_eq!(snapshot.get_failures, 1);
        assert_eq!(snapshot.index_count, 1);
        assert_eq!(snapshot.retarget_count, 0);
    }
}
