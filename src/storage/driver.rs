use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::error::StorageError;

/// Stat result for a stored file.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Byte-level file operations rooted at one base directory.
///
/// All paths handed to the driver are relative to the base; the driver
/// creates parent directories on write and tolerates missing files on
/// remove. Free space is accounted against a configured capacity rather
/// than the filesystem, so the engine's budget is independent of other
/// tenants of the volume.
pub struct DiskDriver {
    base_dir: PathBuf,
    capacity: u64,
}

impl DiskDriver {
    pub fn new(base_dir: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            capacity,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Absolute path for a relative storage path.
    pub fn path_of(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.base_dir.join(rel)
    }

    async fn ensure_parent_dirs(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Writes `data`, replacing any existing content.
    pub async fn put_bytes(&self, rel: impl AsRef<Path>, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_of(rel);
        Self::ensure_parent_dirs(&path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Appends `data` to the end of the file, creating it if absent.
    pub async fn append_bytes(
        &self,
        rel: impl AsRef<Path>,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.path_of(rel);
        Self::ensure_parent_dirs(&path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Reads the whole file.
    pub async fn get_bytes(&self, rel: impl AsRef<Path>) -> Result<Vec<u8>, StorageError> {
        let path = self.path_of(rel);
        tokio::fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotExist(path.display().to_string())
            } else {
                StorageError::Io(err)
            }
        })
    }

    /// Copies exactly `len` bytes from `data` into the file at `offset`.
    ///
    /// The file is created if absent and never truncated, so concurrent
    /// writers covering disjoint ranges do not interfere.
    pub async fn write_at(
        &self,
        rel: impl AsRef<Path>,
        offset: u64,
        len: u64,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StorageError> {
        let path = self.path_of(rel);
        Self::ensure_parent_dirs(&path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let copied = tokio::io::copy(&mut data.take(len), &mut file).await?;
        if copied != len {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short write: expected {len} bytes, copied {copied}"),
            )));
        }
        file.sync_data().await?;
        Ok(())
    }

    /// Opens the file for sequential reading.
    pub async fn open_read(&self, rel: impl AsRef<Path>) -> Result<File, StorageError> {
        let path = self.path_of(rel);
        File::open(&path)
            .await
            .map_err(|_| StorageError::FileNotExist(path.display().to_string()))
    }

    pub async fn stat(&self, rel: impl AsRef<Path>) -> Result<StorageInfo, StorageError> {
        let path = self.path_of(rel);
        let metadata = tokio::fs::metadata(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotExist(path.display().to_string())
            } else {
                StorageError::Io(err)
            }
        })?;
        Ok(StorageInfo {
            size: metadata.len(),
            modified: metadata.modified().ok(),
            path,
        })
    }

    pub async fn exists(&self, rel: impl AsRef<Path>) -> bool {
        tokio::fs::symlink_metadata(self.path_of(rel)).await.is_ok()
    }

    /// Removes a file or symlink, tolerating absence.
    pub async fn remove(&self, rel: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = self.path_of(rel);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Removes a directory if it is empty. Absent or non-empty directories
    /// are left alone.
    pub async fn remove_empty_dir(&self, rel: impl AsRef<Path>) {
        let _ = tokio::fs::remove_dir(self.path_of(rel)).await;
    }

    /// Creates a symlink at `link` pointing to `target`, replacing any
    /// previous link.
    pub async fn symlink(
        &self,
        target: impl AsRef<Path>,
        link: impl AsRef<Path>,
    ) -> Result<(), StorageError> {
        let target = self.path_of(target);
        let link = self.path_of(link);
        Self::ensure_parent_dirs(&link).await?;
        match tokio::fs::remove_file(&link).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }
        #[cfg(unix)]
        tokio::fs::symlink(&target, &link).await?;
        #[cfg(windows)]
        tokio::fs::symlink_file(&target, &link).await?;
        Ok(())
    }

    /// Visits every regular file under `rel`, depth-first.
    pub async fn walk<F>(&self, rel: impl AsRef<Path>, mut visit: F) -> Result<(), StorageError>
    where
        F: FnMut(&Path, u64),
    {
        let root = self.path_of(rel);
        if !root.exists() {
            return Ok(());
        }
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file() {
                    let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                    visit(&entry.path(), size);
                }
            }
        }
        Ok(())
    }

    /// Total bytes of regular files under `rel`.
    pub async fn used_space(&self, rel: impl AsRef<Path>) -> Result<u64, StorageError> {
        let mut used = 0u64;
        self.walk(rel, |_, size| used += size).await?;
        Ok(used)
    }

    /// Remaining budget: configured capacity minus used space.
    pub async fn free_space(&self, rel: impl AsRef<Path>) -> Result<u64, StorageError> {
        let used = self.used_space(rel).await?;
        Ok(self.capacity.saturating_sub(used))
    }
}
