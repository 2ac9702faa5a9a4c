//! Index a directory and upload the blocks a store is missing

use crate::cmd::index::{build_version, print_summary};
use crate::util;
use crate::GlobalOptions;
use anyhow::{Context, Result};
use depot_core::{
    create_missing_content, validate_version, write_version_index, Blake3Hasher, FsStorage,
    SharedHasher,
};
use depot_materialize::put_content;
use depot_store::{BlockStore, SharedBlockStore};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// `<store>/<source dir name>.lvi`
fn default_output(source: &Path, store: &Path) -> Result<PathBuf> {
    let name = source
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", source.display()))?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    Ok(store.join(format!("{name}.lvi")))
}

pub async fn run(
    options: &GlobalOptions,
    source: &Path,
    store_root: &Path,
    output: Option<&Path>,
    chunk_size: Option<u32>,
    compression: Option<&str>,
) -> Result<()> {
    let config = util::load_config(options, chunk_size, compression)?;
    let output = match output {
        Some(path) => path.to_path_buf(),
        None => default_output(source, store_root)?,
    };
    let hasher: SharedHasher = Blake3Hasher::shared();

    let version = build_version(&config, options, source).await?;
    print_summary(&version);

    let store: SharedBlockStore = Arc::new(util::open_remote(
        store_root,
        Arc::clone(&hasher),
        config.max_payload_size(),
    ));
    let existing = store
        .get_index()
        .await
        .with_context(|| format!("Failed to read store {}", store_root.display()))?;
    let missing = create_missing_content(
        hasher.as_ref(),
        &existing,
        &version,
        config.max_block_size,
        config.max_chunks_per_block,
    )
    .context("Failed to pack missing content")?;
    validate_version(&missing, &version).context("Packed content does not match the version")?;
    info!(
        "{} of {} chunks missing from the store",
        missing.chunk_count(),
        version.chunk_count()
    );

    if missing.is_empty() {
        println!("{}", "Store already holds every chunk".dimmed());
    } else {
        let (jobs, bar) = util::job_runner(&config, options, "uploading");
        let uploaded = put_content(
            Arc::clone(&store),
            FsStorage::shared(),
            Arc::clone(&hasher),
            &jobs,
            &missing,
            &version,
            source,
        )
        .await;
        util::finish_bar(bar);
        uploaded.context("Failed to upload blocks")?;
    }
    store.dispose().await.context("Failed to flush store")?;

    write_version_index(&FsStorage, &output, &version)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let stats = store.get_stats();
    println!(
        "{} {} blocks ({}) to {}",
        "Uploaded".green().bold(),
        stats.put_count.to_string().bold(),
        util::format_size(stats.put_bytes),
        store_root.display()
    );
    println!("Version index: {}", output.display().to_string().dimmed());
    Ok(())
}
