use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::metadata::MetadataStore;
use crate::digest::{md5_hex, DigestAccumulator};
use crate::source::{ClientRegistry, SourceRequest};
use crate::storage::{FileMetadata, PieceMetaRecord, StorageError};
use crate::task::SeedTask;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("no cache hit: {0}")]
    Miss(String),

    #[error("resource expired")]
    Expired,

    #[error("origin does not support range requests")]
    RangeNotSupported,

    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// Outcome of cache detection.
#[derive(Debug, Default)]
pub struct CacheResult {
    /// `-1` for a full hit; otherwise the byte offset a resumed fetch must
    /// start at.
    pub break_point: i64,
    /// Persisted metadata backing the hit, absent on a cold start.
    pub file_metadata: Option<FileMetadata>,
    /// Verified piece prefix, sorted by piece number.
    pub piece_records: Vec<PieceMetaRecord>,
}

impl CacheResult {
    /// A cold-start result: nothing reusable on disk.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_full_hit(&self) -> bool {
        self.break_point == -1
    }
}

/// Decides whether the local store satisfies a task fully, partially, or
/// not at all, re-hashing payload bytes to verify what it reports.
pub struct CacheDetector {
    metadata: Arc<MetadataStore>,
    clients: Arc<ClientRegistry>,
}

impl CacheDetector {
    pub fn new(metadata: Arc<MetadataStore>, clients: Arc<ClientRegistry>) -> Self {
        Self { metadata, clients }
    }

    /// Runs detection for `task`.
    ///
    /// `accumulator` is fed every verified payload byte so a resumed fetch
    /// continues the source digest where the cache left off. Any error
    /// means "no usable cache"; the caller falls through to a full fetch.
    pub async fn detect(
        &self,
        task: &SeedTask,
        accumulator: &mut DigestAccumulator,
    ) -> Result<CacheResult, DetectError> {
        let metadata = self
            .metadata
            .read_file_metadata(&task.id)
            .await
            .map_err(|err| DetectError::Miss(format!("read task metadata: {err}")))?;
        if metadata.piece_size != task.piece_size {
            return Err(DetectError::Miss(format!(
                "piece size changed: persisted {} requested {}",
                metadata.piece_size, task.piece_size
            )));
        }

        let client = self
            .clients
            .for_url(&task.raw_url)
            .map_err(|err| DetectError::Miss(err.to_string()))?;
        let request =
            SourceRequest::new(&task.raw_url).with_header(task.headers.clone());
        let expire_info = crate::source::ExpireInfo::from_map(&metadata.expire_info);
        let expired = client
            .is_expired(&request, &expire_info)
            .await
            .unwrap_or_else(|err| {
                // a probe failure does not invalidate the cache
                warn!(task_id = %task.id, %err, "expiry probe failed, treat as fresh");
                false
            });
        if expired {
            debug!(task_id = %task.id, "cached artifact expired");
            return Err(DetectError::Expired);
        }

        if metadata.finish && metadata.success {
            return self.detect_by_read_file(task, metadata).await;
        }

        let support_range = client
            .is_support_range(&request)
            .await
            .map_err(|err| DetectError::Miss(err.to_string()))?;
        if !support_range {
            return Err(DetectError::RangeNotSupported);
        }
        if task.source_file_length < 0 {
            return Err(DetectError::Miss(
                "unknown source length cannot resume".to_string(),
            ));
        }
        self.detect_partial(task, metadata, accumulator).await
    }

    /// Full-hit candidate: stream the payload through a fresh hasher and
    /// compare with the persisted source digest.
    async fn detect_by_read_file(
        &self,
        task: &SeedTask,
        metadata: FileMetadata,
    ) -> Result<CacheResult, DetectError> {
        if metadata.source_real_digest.is_empty() {
            return Err(DetectError::Miss("finished task without digest".to_string()));
        }
        let declared_algorithm = crate::digest::DeclaredDigest::parse(&metadata.digest)
            .map(|d| d.algorithm)
            .unwrap_or_default();
        let mut hasher = DigestAccumulator::new(declared_algorithm);

        let mut file = self.metadata.read_download_file(&task.id).await?;
        let mut buf = vec![0u8; 256 * 1024];
        loop {
            let n = file.read(&mut buf).await.map_err(StorageError::Io)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let observed = hasher.finalize_hex();
        if observed != metadata.source_real_digest {
            return Err(DetectError::Miss(format!(
                "payload digest drifted: persisted {} observed {}",
                metadata.source_real_digest, observed
            )));
        }

        let records = self.metadata.read_piece_meta_records(&task.id).await?;
        Ok(CacheResult {
            break_point: -1,
            file_metadata: Some(metadata),
            piece_records: records,
        })
    }

    /// Unfinished cache: verify the longest piece prefix whose bytes still
    /// hash to their records, feeding those bytes to `accumulator`.
    async fn detect_partial(
        &self,
        task: &SeedTask,
        metadata: FileMetadata,
        accumulator: &mut DigestAccumulator,
    ) -> Result<CacheResult, DetectError> {
        let records = self.metadata.read_piece_meta_records(&task.id).await?;
        let mut file = self.metadata.read_download_file(&task.id).await?;

        let mut verified = Vec::new();
        let mut cursor = 0u64;
        for record in records {
            if record.source_range.start != cursor {
                debug!(
                    task_id = %task.id,
                    piece_num = record.piece_num,
                    cursor,
                    "gap in piece log, stop prefix"
                );
                break;
            }
            let mut content = vec![0u8; record.piece_len as usize];
            if let Err(err) = file.read_exact(&mut content).await {
                debug!(task_id = %task.id, piece_num = record.piece_num, %err, "payload shorter than piece log");
                break;
            }
            if md5_hex(&content) != record.md5 {
                debug!(
                    task_id = %task.id,
                    piece_num = record.piece_num,
                    "piece digest mismatch, stop prefix"
                );
                break;
            }
            accumulator.update(&content);
            cursor += record.piece_len as u64;
            verified.push(record);
        }

        if verified.is_empty() {
            return Err(DetectError::Miss("no verifiable piece prefix".to_string()));
        }
        Ok(CacheResult {
            break_point: cursor as i64,
            file_metadata: Some(metadata),
            piece_records: verified,
        })
    }
}
