//! Index a directory tree into a version index file

use crate::util;
use crate::GlobalOptions;
use anyhow::{Context, Result};
use depot_core::{
    create_version_index, get_files_recursively, write_version_index, Blake3Hasher, DepotConfig,
    FsStorage, VersionIndex,
};
use owo_colors::OwoColorize;
use std::path::Path;

/// Walk `source` and hash every asset, tagging files with the configured codec
pub async fn build_version(
    config: &DepotConfig,
    options: &GlobalOptions,
    source: &Path,
) -> Result<VersionIndex> {
    let storage = FsStorage::shared();
    let files = get_files_recursively(storage.as_ref(), source)
        .with_context(|| format!("Failed to list {}", source.display()))?;

    let tag = config.compression.tag();
    let tags: Vec<u32> = files
        .paths
        .iter()
        .map(|p| if p.ends_with('/') { 0 } else { tag })
        .collect();

    let (jobs, bar) = util::job_runner(config, options, "indexing");
    let version = create_version_index(
        storage,
        Blake3Hasher::shared(),
        &jobs,
        source,
        &files.paths,
        &files.sizes,
        &tags,
        config.target_chunk_size,
    )
    .await;
    util::finish_bar(bar);
    version.with_context(|| format!("Failed to index {}", source.display()))
}

/// One-line summary of a version
pub fn print_summary(version: &VersionIndex) {
    let dirs = (0..version.asset_count()).filter(|&i| version.is_dir(i)).count();
    println!(
        "{} files, {} directories, {} chunks, {}",
        (version.asset_count() - dirs).to_string().bold(),
        dirs.to_string().bold(),
        version.chunk_count().to_string().bold(),
        util::format_size(version.total_size()).bold()
    );
}

pub async fn run(
    options: &GlobalOptions,
    source: &Path,
    output: &Path,
    chunk_size: Option<u32>,
    compression: Option<&str>,
) -> Result<()> {
    let config = util::load_config(options, chunk_size, compression)?;
    let version = build_version(&config, options, source).await?;

    write_version_index(&FsStorage, output, &version)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("{} {}", "Indexed".green().bold(), source.display());
    print_summary(&version);
    println!("Version index: {}", output.display().to_string().dimmed());
    Ok(())
}
