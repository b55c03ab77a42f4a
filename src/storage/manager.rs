use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::AsyncRead;
use tracing::warn;

use super::driver::{DiskDriver, StorageInfo};
use super::error::StorageError;
use super::meta::{FileMetadata, PieceMetaRecord};

const DOWNLOAD_DIR: &str = "download";
const UPLOAD_DIR: &str = "upload";
const META_SUFFIX: &str = ".meta";
const PIECE_SUFFIX: &str = ".piece";

/// Task-keyed namespace over the [`DiskDriver`].
///
/// Every task owns a payload file, a JSON metadata sidecar, a line-per-piece
/// log, and an upload-view symlink through which peers are served.
pub struct StorageManager {
    driver: DiskDriver,
}

impl StorageManager {
    pub fn new(driver: DiskDriver) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &DiskDriver {
        &self.driver
    }

    fn bucket(task_id: &str) -> &str {
        // Tasks are spread over 4096 buckets by fingerprint prefix.
        &task_id[..task_id.len().min(3)]
    }

    fn download_path(task_id: &str) -> PathBuf {
        PathBuf::from(DOWNLOAD_DIR)
            .join(Self::bucket(task_id))
            .join(task_id)
    }

    fn upload_path(task_id: &str) -> PathBuf {
        PathBuf::from(UPLOAD_DIR)
            .join(Self::bucket(task_id))
            .join(task_id)
    }

    fn metadata_path(task_id: &str) -> PathBuf {
        PathBuf::from(DOWNLOAD_DIR)
            .join(Self::bucket(task_id))
            .join(format!("{task_id}{META_SUFFIX}"))
    }

    fn piece_log_path(task_id: &str) -> PathBuf {
        PathBuf::from(DOWNLOAD_DIR)
            .join(Self::bucket(task_id))
            .join(format!("{task_id}{PIECE_SUFFIX}"))
    }

    pub async fn read_file_metadata(&self, task_id: &str) -> Result<FileMetadata, StorageError> {
        let bytes = self.driver.get_bytes(Self::metadata_path(task_id)).await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| StorageError::ConvertFailed(format!("task metadata json: {err}")))
    }

    pub async fn write_file_metadata(
        &self,
        task_id: &str,
        metadata: &FileMetadata,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(metadata)
            .map_err(|err| StorageError::ConvertFailed(format!("task metadata json: {err}")))?;
        self.driver
            .put_bytes(Self::metadata_path(task_id), &bytes)
            .await
    }

    /// Appends one record to the piece log.
    pub async fn append_piece_metadata(
        &self,
        task_id: &str,
        record: &PieceMetaRecord,
    ) -> Result<(), StorageError> {
        let line = format!("{record}\n");
        self.driver
            .append_bytes(Self::piece_log_path(task_id), line.as_bytes())
            .await
    }

    /// Rewrites the piece log with exactly the given records.
    pub async fn write_piece_meta_records(
        &self,
        task_id: &str,
        records: &[PieceMetaRecord],
    ) -> Result<(), StorageError> {
        let mut content = String::new();
        for record in records {
            content.push_str(&record.to_string());
            content.push('\n');
        }
        self.driver
            .put_bytes(Self::piece_log_path(task_id), content.as_bytes())
            .await
    }

    /// Reads the piece log as-is; records may be in any order.
    pub async fn read_piece_meta_records(
        &self,
        task_id: &str,
    ) -> Result<Vec<PieceMetaRecord>, StorageError> {
        let bytes = self.driver.get_bytes(Self::piece_log_path(task_id)).await?;
        let text = String::from_utf8(bytes)
            .map_err(|err| StorageError::ConvertFailed(format!("piece log utf8: {err}")))?;
        let mut records = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(line.parse::<PieceMetaRecord>()?);
        }
        Ok(records)
    }

    /// Writes `len` bytes of payload at `offset`.
    pub async fn write_download_file(
        &self,
        task_id: &str,
        offset: u64,
        len: u64,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StorageError> {
        self.driver
            .write_at(Self::download_path(task_id), offset, len, data)
            .await
    }

    pub async fn read_download_file(&self, task_id: &str) -> Result<File, StorageError> {
        self.driver.open_read(Self::download_path(task_id)).await
    }

    pub async fn stat_download_file(&self, task_id: &str) -> Result<StorageInfo, StorageError> {
        self.driver
            .stat(Self::download_path(task_id))
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    StorageError::TaskNotPersisted(task_id.to_string())
                } else {
                    err
                }
            })
    }

    /// Deletes all sidecars, recreates an empty payload file, and points the
    /// upload view at it.
    pub async fn reset_repo(&self, task_id: &str) -> Result<(), StorageError> {
        self.delete_task(task_id).await?;
        self.driver
            .put_bytes(Self::download_path(task_id), &[])
            .await?;
        self.driver
            .symlink(Self::download_path(task_id), Self::upload_path(task_id))
            .await
    }

    /// Unlinks every path belonging to the task, tolerating absent files.
    pub async fn delete_task(&self, task_id: &str) -> Result<(), StorageError> {
        self.driver.remove(Self::metadata_path(task_id)).await?;
        self.driver.remove(Self::piece_log_path(task_id)).await?;
        self.driver.remove(Self::download_path(task_id)).await?;
        self.driver.remove(Self::upload_path(task_id)).await?;
        // Best-effort cleanup of empty fingerprint buckets.
        self.driver
            .remove_empty_dir(
                PathBuf::from(DOWNLOAD_DIR).join(Self::bucket(task_id)),
            )
            .await;
        self.driver
            .remove_empty_dir(PathBuf::from(UPLOAD_DIR).join(Self::bucket(task_id)))
            .await;
        Ok(())
    }

    /// Task ids that still have a payload on disk.
    pub async fn walk_task_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        self.driver
            .walk(DOWNLOAD_DIR, |path, _| {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    return;
                };
                if name.ends_with(META_SUFFIX) || name.ends_with(PIECE_SUFFIX) {
                    return;
                }
                ids.push(name.to_string());
            })
            .await?;
        Ok(ids)
    }

    /// Bytes occupied under the download namespace.
    pub async fn used_space(&self) -> Result<u64, StorageError> {
        self.driver.used_space(DOWNLOAD_DIR).await
    }

    /// Remaining capacity budget.
    pub async fn free_space(&self) -> Result<u64, StorageError> {
        self.driver.free_space(DOWNLOAD_DIR).await
    }

    /// Payload size on disk for a task, 0 when absent.
    pub async fn task_footprint(&self, task_id: &str) -> u64 {
        let mut total = 0;
        for path in [
            Self::download_path(task_id),
            Self::metadata_path(task_id),
            Self::piece_log_path(task_id),
        ] {
            match self.driver.stat(&path).await {
                Ok(info) => total += info.size,
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(task_id, %err, "stat during footprint accounting"),
            }
        }
        total
    }
}
