//! Rebuild a version from a store into a directory

use crate::util;
use crate::GlobalOptions;
use anyhow::{Context, Result};
use depot_core::{
    create_content_index, create_version_diff, read_version_index, validate_content,
    validate_version, Blake3Hasher, FsStorage, SharedHasher, VersionIndex,
};
use depot_materialize::{change_version, write_version};
use depot_store::BlockStore;
use owo_colors::OwoColorize;
use std::path::Path;
use std::sync::Arc;

fn load(path: &Path) -> Result<VersionIndex> {
    read_version_index(&FsStorage, path)
        .with_context(|| format!("Failed to read version index {}", path.display()))
}

pub async fn run(
    options: &GlobalOptions,
    version_path: &Path,
    target: &Path,
    store_root: &Path,
    cache: Option<&Path>,
    from: Option<&Path>,
) -> Result<()> {
    let config = util::load_config(options, None, None)?;
    let hasher: SharedHasher = Blake3Hasher::shared();
    let version = load(version_path)?;
    let current = from.map(load).transpose()?;

    // blocks may have been packed under a larger chunk size than configured now
    let largest_chunk = version.chunk_sizes().iter().copied().max().unwrap_or(0) as usize;
    let max_payload = config.max_payload_size().max(largest_chunk);
    let store = util::open_store(store_root, cache, Arc::clone(&hasher), max_payload);
    let wanted = create_content_index(
        hasher.as_ref(),
        version.chunk_hashes(),
        version.chunk_sizes(),
        config.max_block_size,
        config.max_chunks_per_block,
    )
    .context("Failed to collect version chunks")?;
    let content = store
        .retarget_content(&wanted)
        .await
        .with_context(|| format!("Store {} cannot serve this version", store_root.display()))?;
    validate_content(&content, &version)
        .and_then(|()| validate_version(&content, &version))
        .context("Store index does not match the version")?;

    std::fs::create_dir_all(target)
        .with_context(|| format!("Failed to create {}", target.display()))?;

    let (jobs, bar) = util::job_runner(&config, options, "writing");
    let written = match &current {
        Some(source_version) => {
            let diff = create_version_diff(source_version, &version);
            println!(
                "{} added, {} removed, {} modified",
                diff.added.len().to_string().green(),
                diff.removed.len().to_string().red(),
                diff.modified.len().to_string().yellow()
            );
            change_version(
                Arc::clone(&store),
                FsStorage::shared(),
                Arc::clone(&hasher),
                &jobs,
                &content,
                source_version,
                &version,
                &diff,
                target,
            )
            .await
        }
        None => {
            write_version(
                Arc::clone(&store),
                FsStorage::shared(),
                Arc::clone(&hasher),
                &jobs,
                &content,
                &version,
                target,
            )
            .await
        }
    };
    util::finish_bar(bar);
    let disposed = store.dispose().await;
    written.with_context(|| format!("Failed to write {}", target.display()))?;
    disposed.context("Failed to flush store")?;

    let stats = store.get_stats();
    println!(
        "{} {} ({} blocks read, {})",
        "Wrote".green().bold(),
        target.display(),
        stats.get_count,
        util::format_size(stats.get_bytes)
    );
    Ok(())
}
