//! End-to-end runs of the `depot` binary

use anyhow::{Context, Result};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// `depot` invocation in a scratch working directory
struct DepotCommand {
    working_dir: PathBuf,
    args: Vec<String>,
}

impl DepotCommand {
    fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            args: vec!["--quiet".to_string()],
        }
    }

    fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    fn execute(self) -> Result<Output> {
        Command::new(env!("CARGO_BIN_EXE_depot"))
            .args(&self.args)
            .current_dir(&self.working_dir)
            .output()
            .context("Failed to run depot")
    }

    /// Run and fail with captured stderr on a non-zero exit
    fn success(self) -> Result<String> {
        let output = self.execute()?;
        if !output.status.success() {
            anyhow::bail!("depot failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}

fn make_tree(root: &Path) -> Result<()> {
    fs::create_dir_all(root.join("assets/textures"))?;
    fs::create_dir_all(root.join("empty"))?;
    fs::write(root.join("readme.txt"), b"depot test tree\n")?;
    fs::write(root.join("assets/data.bin"), random_bytes(1, 300_000))?;
    fs::write(root.join("assets/textures/copy.bin"), random_bytes(1, 300_000))?;
    fs::write(root.join("assets/zeros.bin"), vec![0u8; 100_000])?;
    Ok(())
}

fn assert_same_file(a: &Path, b: &Path) -> Result<()> {
    assert_eq!(fs::read(a)?, fs::read(b)?, "{} differs", b.display());
    Ok(())
}

#[test]
fn test_upsync_then_downsync_rebuilds_tree() -> Result<()> {
    let work = tempfile::tempdir()?;
    let source = work.path().join("source");
    make_tree(&source)?;

    let out = DepotCommand::new(work.path())
        .args(&["upsync", "source", "--store", "store", "--output", "v1.lvi", "--chunk-size", "16384"])
        .success()?;
    assert!(out.contains("Uploaded"));

    let listing = DepotCommand::new(work.path()).args(&["ls-store", "store"]).success()?;
    assert!(listing.contains("Blocks:"));

    DepotCommand::new(work.path())
        .args(&["downsync", "v1.lvi", "rebuilt", "--store", "store", "--cache", "cache"])
        .success()?;

    let rebuilt = work.path().join("rebuilt");
    for name in ["readme.txt", "assets/data.bin", "assets/textures/copy.bin", "assets/zeros.bin"] {
        assert_same_file(&source.join(name), &rebuilt.join(name))?;
    }
    assert!(rebuilt.join("empty").is_dir());
    Ok(())
}

#[test]
fn test_incremental_downsync_applies_diff() -> Result<()> {
    let work = tempfile::tempdir()?;
    let source = work.path().join("source");
    make_tree(&source)?;

    DepotCommand::new(work.path())
        .args(&["upsync", "source", "--store", "store", "--output", "v1.lvi"])
        .success()?;
    DepotCommand::new(work.path())
        .args(&["downsync", "v1.lvi", "target", "--store", "store"])
        .success()?;

    fs::remove_file(source.join("readme.txt"))?;
    fs::write(source.join("assets/data.bin"), random_bytes(2, 120_000))?;
    fs::write(source.join("notes.md"), b"# notes\n")?;
    DepotCommand::new(work.path())
        .args(&["upsync", "source", "--store", "store", "--output", "v2.lvi"])
        .success()?;

    let diff = DepotCommand::new(work.path()).args(&["diff", "v1.lvi", "v2.lvi"]).success()?;
    assert!(diff.contains("notes.md"));
    assert!(diff.contains("readme.txt"));
    assert!(diff.contains("assets/data.bin"));

    DepotCommand::new(work.path())
        .args(&["downsync", "v2.lvi", "target", "--store", "store", "--from", "v1.lvi"])
        .success()?;

    let target = work.path().join("target");
    assert!(!target.join("readme.txt").exists());
    assert_same_file(&source.join("assets/data.bin"), &target.join("assets/data.bin"))?;
    assert_same_file(&source.join("notes.md"), &target.join("notes.md"))?;
    Ok(())
}

#[test]
fn test_index_and_identical_diff() -> Result<()> {
    let work = tempfile::tempdir()?;
    make_tree(&work.path().join("source"))?;

    for output in ["a.lvi", "b.lvi"] {
        DepotCommand::new(work.path())
            .args(&["index", "source", "--output", output, "--compression", "none"])
            .success()?;
    }
    let diff = DepotCommand::new(work.path()).args(&["diff", "a.lvi", "b.lvi"]).success()?;
    assert!(diff.contains("No changes"));
    Ok(())
}

#[test]
fn test_downsync_from_empty_store_fails() -> Result<()> {
    let work = tempfile::tempdir()?;
    make_tree(&work.path().join("source"))?;
    DepotCommand::new(work.path())
        .args(&["index", "source", "--output", "v.lvi"])
        .success()?;

    let output = DepotCommand::new(work.path())
        .args(&["downsync", "v.lvi", "target", "--store", "nothing"])
        .execute()?;
    assert!(!output.status.success());
    Ok(())
}
