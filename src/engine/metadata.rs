use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::locker::LockerPool;
use crate::storage::{FileMetadata, PieceMetaRecord, StorageError, StorageManager, StorageInfo};
use crate::task::SeedTask;

use super::now_millis;

/// Locked metadata operations layered over the storage manager.
///
/// Read-modify-write cycles on the JSON sidecar are serialized per task so
/// concurrent updates (access time, expire info, final result) never lose
/// each other's fields.
pub struct MetadataStore {
    storage: Arc<StorageManager>,
    locker: LockerPool,
}

impl MetadataStore {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self {
            storage,
            locker: LockerPool::new(),
        }
    }

    /// Persists the initial metadata for a freshly registered task.
    pub async fn write_metadata_for_task(
        &self,
        task: &SeedTask,
    ) -> Result<FileMetadata, StorageError> {
        let _guard = self.locker.write(&task.id).await;
        let metadata = FileMetadata {
            task_id: task.id.clone(),
            task_url: task.task_url.clone(),
            piece_size: task.piece_size,
            source_file_len: task.source_file_length,
            access_time: now_millis(),
            interval: 0,
            cdn_file_length: task.cdn_file_length,
            digest: task.digest.clone(),
            source_real_digest: String::new(),
            tag: task.tag.clone(),
            expire_info: HashMap::new(),
            finish: false,
            success: false,
            total_piece_count: task.total_piece_count,
            piece_md5_sign: String::new(),
            range: task.range.clone(),
            filter: task.filter.clone(),
        };
        self.storage.write_file_metadata(&task.id, &metadata).await?;
        Ok(metadata)
    }

    /// Updates the access timestamp and the gap since the previous access.
    pub async fn update_access_time(
        &self,
        task_id: &str,
        access_time: i64,
    ) -> Result<(), StorageError> {
        let _guard = self.locker.write(task_id).await;
        let mut metadata = self.storage.read_file_metadata(task_id).await?;
        let interval = access_time - metadata.access_time;
        metadata.interval = interval.max(0);
        if interval < 0 {
            warn!(task_id, interval, "access time went backwards");
        }
        metadata.access_time = access_time;
        self.storage.write_file_metadata(task_id, &metadata).await
    }

    /// Stores the origin cache validators captured at download time.
    pub async fn update_expire_info(
        &self,
        task_id: &str,
        expire_info: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let _guard = self.locker.write(task_id).await;
        let mut metadata = self.storage.read_file_metadata(task_id).await?;
        metadata.expire_info = expire_info;
        self.storage.write_file_metadata(task_id, &metadata).await
    }

    /// Marks the task finished and, when successful, records the
    /// authoritative lengths and digests.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_status_and_result(
        &self,
        task_id: &str,
        success: bool,
        source_file_len: i64,
        cdn_file_length: i64,
        source_real_digest: &str,
        total_piece_count: u32,
        piece_md5_sign: &str,
    ) -> Result<(), StorageError> {
        let _guard = self.locker.write(task_id).await;
        let mut metadata = self.storage.read_file_metadata(task_id).await?;
        metadata.finish = true;
        metadata.success = success;
        if success {
            metadata.source_file_len = source_file_len;
            metadata.cdn_file_length = cdn_file_length;
            if total_piece_count > 0 {
                metadata.total_piece_count = total_piece_count;
            }
            if !source_real_digest.is_empty() {
                metadata.source_real_digest = source_real_digest.to_string();
            }
            if !piece_md5_sign.is_empty() {
                metadata.piece_md5_sign = piece_md5_sign.to_string();
            }
        }
        self.storage.write_file_metadata(task_id, &metadata).await
    }

    pub async fn read_file_metadata(&self, task_id: &str) -> Result<FileMetadata, StorageError> {
        self.storage.read_file_metadata(task_id).await
    }

    pub async fn append_piece_metadata(
        &self,
        task_id: &str,
        record: &PieceMetaRecord,
    ) -> Result<(), StorageError> {
        let _guard = self.locker.write(task_id).await;
        self.storage.append_piece_metadata(task_id, record).await
    }

    pub async fn write_piece_meta_records(
        &self,
        task_id: &str,
        records: &[PieceMetaRecord],
    ) -> Result<(), StorageError> {
        let _guard = self.locker.write(task_id).await;
        self.storage.write_piece_meta_records(task_id, records).await
    }

    /// Piece records sorted by piece number.
    pub async fn read_piece_meta_records(
        &self,
        task_id: &str,
    ) -> Result<Vec<PieceMetaRecord>, StorageError> {
        let _guard = self.locker.read(task_id).await;
        let mut records = self.storage.read_piece_meta_records(task_id).await?;
        records.sort_by_key(|record| record.piece_num);
        Ok(records)
    }

    /// Aggregate piece signature: SHA-256 over the per-piece digests in
    /// index order. Also returns the sorted records.
    pub async fn piece_md5_sign(
        &self,
        task_id: &str,
    ) -> Result<(String, Vec<PieceMetaRecord>), StorageError> {
        let records = self.read_piece_meta_records(task_id).await?;
        let sign = crate::digest::sha256_hex_concat(records.iter().map(|r| r.md5.as_str()));
        Ok((sign, records))
    }

    pub async fn stat_download_file(&self, task_id: &str) -> Result<StorageInfo, StorageError> {
        self.storage.stat_download_file(task_id).await
    }

    pub async fn read_download_file(
        &self,
        task_id: &str,
    ) -> Result<tokio::fs::File, StorageError> {
        self.storage.read_download_file(task_id).await
    }

    pub async fn write_download_file(
        &self,
        task_id: &str,
        offset: u64,
        len: u64,
        data: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<(), StorageError> {
        self.storage.write_download_file(task_id, offset, len, data).await
    }

    /// Clears all sidecars and recreates an empty payload plus upload view.
    pub async fn reset_repo(&self, task: &SeedTask) -> Result<(), StorageError> {
        let _guard = self.locker.write(&task.id).await;
        self.storage.reset_repo(&task.id).await
    }
}
