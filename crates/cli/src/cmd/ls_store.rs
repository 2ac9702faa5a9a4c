//! List the blocks held by a store

use crate::util;
use anyhow::{Context, Result};
use depot_core::hash::to_hex;
use depot_core::{Blake3Hasher, FsStorage};
use depot_store::{BlockStore, FsBlockStore};
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(store_root: &Path, long: bool) -> Result<()> {
    let store = FsBlockStore::new(FsStorage::shared(), Blake3Hasher::shared(), store_root);
    let index = store
        .get_index()
        .await
        .with_context(|| format!("Failed to read store {}", store_root.display()))?;

    let ranges = index.block_chunk_ranges();
    let total: u64 = index.chunk_lengths().iter().map(|&l| l as u64).sum();

    println!("{}", "Store Summary".bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Path:   {}", store_root.display().to_string().yellow());
    println!("Blocks: {}", index.block_count().to_string().bold());
    println!("Chunks: {}", index.chunk_count().to_string().bold());
    println!("Data:   {}", util::format_size(total).bold());

    if long && !ranges.is_empty() {
        println!();
        for (block, range) in ranges.into_iter().enumerate() {
            let size: u64 = index.chunk_lengths()[range.clone()]
                .iter()
                .map(|&l| l as u64)
                .sum();
            println!(
                "  {} {:>6} chunks {:>12}",
                to_hex(index.block_hashes()[block]).cyan(),
                range.len(),
                util::format_size(size).dimmed()
            );
        }
    }
    Ok(())
}
