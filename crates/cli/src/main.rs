//! Depot CLI - depot command

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;
mod util;

/// Depot - content-defined dedup and versioned storage for directory trees
#[derive(Parser)]
#[command(name = "depot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    options: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command
#[derive(Args, Clone, Debug)]
pub struct GlobalOptions {
    /// Configuration file (default: depot.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Maximum number of jobs in flight
    #[arg(short = 'j', long, global = true)]
    jobs: Option<usize>,

    /// Hide progress bars
    #[arg(short = 'q', long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a directory tree into a version index file
    Index {
        /// Directory to index
        source: PathBuf,
        /// Version index file to write
        #[arg(short, long)]
        output: PathBuf,
        /// Chunk window size in bytes (overrides config)
        #[arg(long)]
        chunk_size: Option<u32>,
        /// Compression for the indexed assets: none, zstd, zstd-max, deflate
        #[arg(long)]
        compression: Option<String>,
    },
    /// Show the differences between two version index files
    Diff {
        /// Source version index
        source: PathBuf,
        /// Target version index
        target: PathBuf,
    },
    /// Index a directory and upload its missing blocks to a store
    Upsync {
        /// Directory to upload
        source: PathBuf,
        /// Block store directory
        #[arg(short, long)]
        store: PathBuf,
        /// Version index file to write (default: <store>/<dir name>.lvi)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Chunk window size in bytes (overrides config)
        #[arg(long)]
        chunk_size: Option<u32>,
        /// Compression for the uploaded blocks: none, zstd, zstd-max, deflate
        #[arg(long)]
        compression: Option<String>,
    },
    /// Rebuild a version from a store into a directory
    Downsync {
        /// Version index to rebuild
        version: PathBuf,
        /// Directory to write into
        target: PathBuf,
        /// Block store directory
        #[arg(short, long)]
        store: PathBuf,
        /// Local cache directory placed in front of the store
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Version index currently present in the target (enables incremental update)
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// List the blocks held by a store
    LsStore {
        /// Block store directory
        store: PathBuf,
        /// Print every block instead of a summary
        #[arg(short, long)]
        long: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Index {
            source,
            output,
            chunk_size,
            compression,
        } => {
            cmd::index::run(&cli.options, &source, &output, chunk_size, compression.as_deref())
                .await
        }
        Commands::Diff { source, target } => cmd::diff::run(&source, &target),
        Commands::Upsync {
            source,
            store,
            output,
            chunk_size,
            compression,
        } => {
            cmd::upsync::run(
                &cli.options,
                &source,
                &store,
                output.as_deref(),
                chunk_size,
                compression.as_deref(),
            )
            .await
        }
        Commands::Downsync {
            version,
            target,
            store,
            cache,
            from,
        } => {
            cmd::downsync::run(
                &cli.options,
                &version,
                &target,
                &store,
                cache.as_deref(),
                from.as_deref(),
            )
            .await
        }
        Commands::LsStore { store, long } => cmd::ls_store::run(&store, long).await,
    }
}
