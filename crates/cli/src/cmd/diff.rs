//! Show the differences between two version index files

use crate::util;
use anyhow::{Context, Result};
use depot_core::{create_version_diff, read_version_index, FsStorage, VersionIndex};
use owo_colors::OwoColorize;
use std::path::Path;

fn load(path: &Path) -> Result<VersionIndex> {
    read_version_index(&FsStorage, path)
        .with_context(|| format!("Failed to read version index {}", path.display()))
}

pub fn run(source: &Path, target: &Path) -> Result<()> {
    let source_version = load(source)?;
    let target_version = load(target)?;
    let diff = create_version_diff(&source_version, &target_version);

    println!("{}", "Diff Summary".bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("From: {}", source.display().to_string().yellow());
    println!("To:   {}", target.display().to_string().yellow());
    println!();

    if diff.is_empty() {
        println!("{}", "No changes between versions".dimmed());
        return Ok(());
    }

    if !diff.added.is_empty() {
        println!("{} Added ({} assets)", "A".green().bold(), diff.added.len());
        for &asset in &diff.added {
            println!(
                "  {} {} {}",
                "+".green(),
                target_version.asset_name(asset),
                util::format_size(target_version.asset_sizes()[asset] as u64).dimmed()
            );
        }
        println!();
    }

    if !diff.removed.is_empty() {
        println!("{} Removed ({} assets)", "D".red().bold(), diff.removed.len());
        for &asset in &diff.removed {
            println!("  {} {}", "-".red(), source_version.asset_name(asset));
        }
        println!();
    }

    if !diff.modified.is_empty() {
        println!("{} Modified ({} assets)", "M".yellow().bold(), diff.modified.len());
        for &(before, after) in &diff.modified {
            println!(
                "  {} {} {}",
                "~".yellow(),
                target_version.asset_name(after),
                format!(
                    "{} -> {}",
                    util::format_size(source_version.asset_sizes()[before] as u64),
                    util::format_size(target_version.asset_sizes()[after] as u64)
                )
                .dimmed()
            );
        }
        println!();
    }

    let total = diff.added.len() + diff.removed.len() + diff.modified.len();
    println!("Total: {} changes", total.to_string().bold());
    Ok(())
}
