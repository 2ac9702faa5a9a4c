//! Shared utilities for CLI commands

use crate::GlobalOptions;
use anyhow::{anyhow, Context, Result};
use depot_core::{
    CompressionKind, CompressionRegistry, DepotConfig, FsStorage, JobRunner, Progress,
    SharedHasher,
};
use depot_store::{CacheBlockStore, CompressBlockStore, FsBlockStore, SharedBlockStore};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Config file picked up from the working directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "depot.toml";

/// Load the configuration and apply command-line overrides
pub fn load_config(
    options: &GlobalOptions,
    chunk_size: Option<u32>,
    compression: Option<&str>,
) -> Result<DepotConfig> {
    let mut config = match &options.config {
        Some(path) => DepotConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            DepotConfig::load(Path::new(DEFAULT_CONFIG_FILE))
                .context("Failed to load depot.toml")?
        }
        None => DepotConfig::default(),
    };

    if let Some(jobs) = options.jobs {
        config.max_jobs = jobs;
    }
    if let Some(size) = chunk_size {
        config.target_chunk_size = size;
    }
    if let Some(name) = compression {
        config.compression = name
            .parse::<CompressionKind>()
            .map_err(|e| anyhow!("Invalid --compression: {e}"))?;
    }
    config.validate().context("Invalid configuration")?;
    debug!("configuration: {config:?}");
    Ok(config)
}

/// Progress bar driven by the job runner
struct BarProgress {
    bar: ProgressBar,
}

impl Progress for BarProgress {
    fn on_progress(&self, total: usize, done: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(done as u64);
    }
}

/// A job runner for one phase, with a progress bar unless `--quiet`
///
/// Ctrl-C cancels the runner: running jobs finish, queued jobs are dropped.
pub fn job_runner(
    config: &DepotConfig,
    options: &GlobalOptions,
    message: &'static str,
) -> (JobRunner, Option<ProgressBar>) {
    let token = CancellationToken::new();
    let watch = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing running jobs");
            watch.cancel();
        }
    });

    let runner = JobRunner::new(config.max_jobs).with_cancellation(token);
    if options.quiet {
        return (runner, None);
    }

    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template("{msg:>12} [{bar:40.cyan/blue}] {pos}/{len} ({elapsed})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar.set_message(message);
    let progress = Arc::new(BarProgress { bar: bar.clone() });
    (runner.with_progress(progress), Some(bar))
}

/// Finish a bar returned by [`job_runner`]
pub fn finish_bar(bar: Option<ProgressBar>) {
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

/// The remote store: block files under `root`, compressed per block tag
///
/// Blocks decompressing to more than `max_payload_size` bytes are rejected.
pub fn open_remote(
    root: &Path,
    hasher: SharedHasher,
    max_payload_size: usize,
) -> CompressBlockStore<FsBlockStore> {
    CompressBlockStore::new(
        FsBlockStore::new(FsStorage::shared(), hasher, root),
        Arc::new(CompressionRegistry::with_defaults().with_max_payload_size(max_payload_size)),
    )
}

/// The remote store, optionally behind a local cache directory
pub fn open_store(
    root: &Path,
    cache: Option<&Path>,
    hasher: SharedHasher,
    max_payload_size: usize,
) -> SharedBlockStore {
    let remote = open_remote(root, Arc::clone(&hasher), max_payload_size);
    match cache {
        Some(cache_root) => {
            let local = FsBlockStore::new(FsStorage::shared(), Arc::clone(&hasher), cache_root);
            let cached: SharedBlockStore =
                Arc::new(CacheBlockStore::new(Arc::new(local), Arc::new(remote), hasher));
            cached
        }
        None => {
            let direct: SharedBlockStore = Arc::new(remote);
            direct
        }
    }
}

/// Binary units used for sizes in command output
const SIZE_UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Byte count in the largest binary unit that keeps the value at or above 1
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < SIZE_UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", SIZE_UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> GlobalOptions {
        GlobalOptions {
            config: None,
            jobs: Some(3),
            quiet: true,
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
        assert_eq!(format_size(8 << 40), "8.0 TiB");
    }

    #[test]
    fn test_overrides_apply() {
        let config = load_config(&options(), Some(4096), Some("deflate")).unwrap();
        assert_eq!(config.max_jobs, 3);
        assert_eq!(config.target_chunk_size, 4096);
        assert_eq!(config.compression, CompressionKind::Deflate);
    }

    #[test]
    fn test_bad_compression_rejected() {
        assert!(load_config(&options(), None, Some("lz4")).is_err());
    }

    #[test]
    fn test_config_file_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depot.toml");
        std::fs::write(&path, "max_block_size = 65536\n").unwrap();
        let mut opts = options();
        opts.config = Some(path);
        let config = load_config(&opts, None, None).unwrap();
        assert_eq!(config.max_block_size, 65536);
    }
}
