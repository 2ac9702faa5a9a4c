//! Filesystem capability consumed by indexing, block stores and materialization

use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Random-access reader returned by [`Storage::open_read`]
pub trait ReadFile: Send {
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`; short files are an error
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Random-access writer returned by [`Storage::open_write`]
pub trait WriteFile: Send {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flush and close
    fn close(self: Box<Self>) -> Result<()>;
}

/// One entry of [`Storage::list_dir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Open/read/write/enumerate capability set
pub trait Storage: Send + Sync {
    fn open_read(&self, path: &Path) -> Result<Box<dyn ReadFile>>;

    /// Create or truncate `path`, pre-sized to `initial_size` bytes
    fn open_write(&self, path: &Path, initial_size: u64) -> Result<Box<dyn WriteFile>>;

    /// Create a directory and its missing parents
    fn create_dir(&self, path: &Path) -> Result<()>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory
    fn remove_dir(&self, path: &Path) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Unix permission bits
    fn permissions(&self, path: &Path) -> Result<u32>;

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()>;

    /// Read a whole file
    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let mut file = self.open_read(path)?;
        let mut buf = vec![0u8; file.size() as usize];
        file.read_at(0, &mut buf)?;
        Ok(buf)
    }

    /// Create or replace a whole file
    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = self.open_write(path, data.len() as u64)?;
        file.write_at(0, data)?;
        file.close()
    }
}

/// Shared storage handle passed to jobs
pub type SharedStorage = Arc<dyn Storage>;

/// [`Storage`] backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> SharedStorage {
        Arc::new(Self)
    }
}

struct FsReadFile {
    file: File,
    size: u64,
}

impl ReadFile for FsReadFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }
}

struct FsWriteFile {
    file: File,
}

impl WriteFile for FsWriteFile {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

impl Storage for FsStorage {
    fn open_read(&self, path: &Path) -> Result<Box<dyn ReadFile>> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Box::new(FsReadFile { file, size }))
    }

    fn open_write(&self, path: &Path, initial_size: u64) -> Result<Box<dyn WriteFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(initial_size)?;
        Ok(Box::new(FsWriteFile { file }))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Symlinks to files are listed with the target's size; symlinked
    /// directories and dangling links are skipped
    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let is_link = entry.file_type()?.is_symlink();
            let meta = match fs::metadata(entry.path()) {
                Ok(meta) => meta,
                Err(e) if is_link && e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("skipping dangling link {}", entry.path().display());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if is_link && meta.is_dir() {
                debug!("skipping directory link {}", entry.path().display());
                continue;
            }
            let name = entry
                .file_name()
                .into_string()
                .map_err(|n| Error::InvalidData(format!("non UTF-8 file name {n:?}")))?;
            entries.push(DirEntry {
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        Ok(entries)
    }

    #[cfg(unix)]
    fn permissions(&self, path: &Path) -> Result<u32> {
        use std::os::unix::fs::PermissionsExt;
        Ok(fs::metadata(path)?.permissions().mode() & 0o7777)
    }

    #[cfg(not(unix))]
    fn permissions(&self, path: &Path) -> Result<u32> {
        let readonly = fs::metadata(path)?.permissions().readonly();
        Ok(if readonly { 0o444 } else { 0o644 })
    }

    #[cfg(unix)]
    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(mode & 0o222 == 0);
        fs::set_permissions(path, perms)?;
        Ok(())
    }
}

/// Uniquely named hidden temp file next to `target`
pub fn temp_sibling(target: &Path) -> Result<PathBuf> {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidArgument(format!("no file name in {}", target.display())))?;
    Ok(target.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple())))
}

/// Atomic write helper
///
/// Writes data to a uniquely named sibling temp file, then renames it over
/// the target so readers never observe a partial file.
pub fn atomic_write(storage: &dyn Storage, target: &Path, data: &[u8]) -> Result<()> {
    let tmp = temp_sibling(target)?;
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            storage.create_dir(parent)?;
        }
    }
    if let Err(e) = storage.write_file(&tmp, data) {
        let _ = storage.remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = storage.rename(&tmp, target) {
        let _ = storage.remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Resolve an asset name (`/`-separated, directories end with `/`) under `root`
///
/// Rejects absolute names and `..` components.
pub fn asset_path(root: &Path, name: &str) -> Result<PathBuf> {
    let trimmed = name.trim_end_matches('/');
    let relative = Path::new(trimmed);
    let mut out = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::InvalidArgument(format!("asset path escapes root: {name}")));
            }
        }
    }
    Ok(out)
}

/// True when an asset name denotes a directory
pub fn is_dir_name(name: &str) -> bool {
    name.ends_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let target = temp_dir.path().join("nested/out.bin");
        atomic_write(&FsStorage, &target, b"payload")?;

        assert_eq!(fs::read(&target)?, b"payload");
        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn test_read_at_and_write_at() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("f.bin");
        let storage = FsStorage::new();

        let mut writer = storage.open_write(&path, 8)?;
        writer.write_at(4, b"tail")?;
        writer.write_at(0, b"head")?;
        writer.close()?;

        let mut reader = storage.open_read(&path)?;
        assert_eq!(reader.size(), 8);
        let mut buf = [0u8; 4];
        reader.read_at(4, &mut buf)?;
        assert_eq!(&buf, b"tail");
        assert!(reader.read_at(6, &mut buf).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let err = FsStorage.open_read(&temp_dir.path().join("nope")).err().unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_asset_path() {
        let root = Path::new("/data");
        assert_eq!(asset_path(root, "a/b.txt").unwrap(), Path::new("/data/a/b.txt"));
        assert_eq!(asset_path(root, "a/dir/").unwrap(), Path::new("/data/a/dir"));
        assert_eq!(asset_path(root, "./a").unwrap(), Path::new("/data/a"));
        assert!(asset_path(root, "../escape").is_err());
        assert!(asset_path(root, "/abs").is_err());
    }

    #[test]
    fn test_list_dir() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        fs::write(temp_dir.path().join("a.txt"), b"abc")?;
        fs::create_dir(temp_dir.path().join("sub"))?;

        let mut entries = FsStorage.list_dir(temp_dir.path())?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], DirEntry { name: "a.txt".into(), is_dir: false, size: 3 });
        assert!(entries[1].is_dir);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_list_dir_resolves_file_links() -> Result<()> {
        use std::os::unix::fs::symlink;

        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("tree");
        fs::create_dir_all(root.join("sub"))?;
        fs::write(temp_dir.path().join("target.bin"), vec![7u8; 5000])?;
        symlink(temp_dir.path().join("target.bin"), root.join("link.bin"))?;
        symlink(root.join("sub"), root.join("dir-link"))?;
        symlink(temp_dir.path().join("gone"), root.join("dangling"))?;

        let mut entries = FsStorage.list_dir(&root)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            entries,
            vec![
                DirEntry { name: "link.bin".into(), is_dir: false, size: 5000 },
                DirEntry { name: "sub".into(), is_dir: true, size: 0 },
            ]
        );

        let files = crate::indexer::get_files_recursively(&FsStorage, &root)?;
        assert_eq!(files.paths, vec!["link.bin".to_string(), "sub/".to_string()]);
        assert_eq!(files.sizes, vec![5000, 0]);
        Ok(())
    }
}
