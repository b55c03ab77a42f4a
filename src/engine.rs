//! The seed-task lifecycle engine.
//!
//! [`SeedEngine`] ties everything together for a single request: register
//! (or join) the task, detect how much of it the local cache already
//! satisfies, stream the remainder from the origin through the rate-limited
//! digest reader, slice it into pieces, persist payload and metadata, and
//! fan piece-completion events out to subscribers.
//!
//! # Components
//!
//! - [`SeedEngine`] - Coordinator; one fetch per fingerprint
//! - [`MetadataStore`] - Locked metadata operations over the storage manager
//! - [`CacheDetector`] / [`CacheResult`] - Full / partial / no-cache decision
//! - [`PieceWriter`] / [`DownloadMetadata`] - Bounded-parallel piece pipeline

mod detector;
mod fetcher;
mod metadata;
mod writer;

pub use detector::{CacheDetector, CacheResult, DetectError};
pub use metadata::MetadataStore;
pub use writer::{BufferPool, DownloadMetadata, PieceWriter};

#[cfg(test)]
mod tests;

use std::sync::{Arc, OnceLock, Weak};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bandwidth::{LimitedDigestReader, RateLimiter};
use crate::config::Config;
use crate::digest::{DeclaredDigest, DigestAccumulator, DigestAlgorithm};
use crate::gc::GcSupervisor;
use crate::locker::LockerPool;
use crate::progress::{PieceEvent, ProgressBroker};
use crate::source::ClientRegistry;
use crate::storage::{PieceMetaRecord, StorageManager};
use crate::task::{SeedRequest, SeedTask, TaskError, TaskRegistry, TaskStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task download fail: {0}")]
    DownloadFail(String),

    #[error("inconsistent values: {0}")]
    Inconsistent(String),

    #[error("resources lacked: need {need} bytes")]
    ResourceLacked { need: i64 },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("storage: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("source: {0}")]
    Source(#[from] crate::source::SourceError),

    #[error("system error: {0}")]
    System(String),
}

/// Origin-facing seed engine.
///
/// One instance per process; all tasks share the rate limiter, locker pool,
/// registry, broker, and storage manager.
pub struct SeedEngine {
    config: Config,
    storage: Arc<StorageManager>,
    metadata: Arc<MetadataStore>,
    registry: Arc<TaskRegistry>,
    progress: Arc<ProgressBroker>,
    clients: Arc<ClientRegistry>,
    limiter: Arc<RateLimiter>,
    locker: LockerPool,
    detector: CacheDetector,
    writer: PieceWriter,
    /// Set by [`GcSupervisor::new`]; lets the space check force a sweep.
    reclaimer: OnceLock<Weak<GcSupervisor>>,
}

impl SeedEngine {
    pub fn new(config: Config, clients: Arc<ClientRegistry>, storage: Arc<StorageManager>) -> Arc<Self> {
        let metadata = Arc::new(MetadataStore::new(storage.clone()));
        let registry = Arc::new(TaskRegistry::new(clients.clone(), config.piece.clone()));
        let progress = Arc::new(ProgressBroker::new(&config.progress));
        let limiter = match config.download_rate() {
            0 => RateLimiter::unlimited(),
            rate => RateLimiter::new(rate),
        };
        let detector = CacheDetector::new(metadata.clone(), clients.clone());
        let writer = PieceWriter::new(
            metadata.clone(),
            progress.clone(),
            config.writer_parallelism,
        );
        Arc::new(Self {
            config,
            storage,
            metadata,
            registry,
            progress,
            clients,
            limiter,
            locker: LockerPool::new(),
            detector,
            writer,
            reclaimer: OnceLock::new(),
        })
    }

    pub(crate) fn attach_reclaimer(&self, gc: Weak<GcSupervisor>) {
        let _ = self.reclaimer.set(gc);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn progress(&self) -> &Arc<ProgressBroker> {
        &self.progress
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub(crate) fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub(crate) fn locker(&self) -> &LockerPool {
        &self.locker
    }

    /// Registers a seed request and returns the task id plus a subscription
    /// to its piece events.
    ///
    /// The first registration of a frozen task elects this call to spawn
    /// the fetch; concurrent registrations of the same fingerprint only
    /// attach subscribers.
    pub async fn register(
        self: &Arc<Self>,
        request: SeedRequest,
    ) -> Result<(String, mpsc::Receiver<PieceEvent>), EngineError> {
        let entry = self.registry.add_or_update(&request).await?;
        let task = entry.read().clone();

        if task.source_file_length > 0 && !self.ensure_space(task.source_file_length).await? {
            return Err(EngineError::ResourceLacked {
                need: task.source_file_length,
            });
        }

        self.trigger_once(&task.id).await?;

        let task = self.registry.snapshot(&task.id)?;
        let receiver = self.progress.watch(&task).await;
        if !task.is_done() && self.registry.snapshot(&task.id)?.is_done() {
            // the fetch finished between the snapshot and the subscription;
            // close the late subscriber so it observes the terminal state
            self.progress.publish_task(&task.id).await;
        }
        let now = now_millis();
        self.registry.touch(&task.id, now);
        if let Err(err) = self.metadata.update_access_time(&task.id, now).await {
            if !matches!(&err, crate::storage::StorageError::FileNotExist(_)) {
                warn!(task_id = %task.id, %err, "update access time");
            }
        }
        Ok((task.id, receiver))
    }

    /// Spawns the fetch for a frozen task; a task that is Running or
    /// Success needs no trigger.
    async fn trigger_once(self: &Arc<Self>, task_id: &str) -> Result<(), EngineError> {
        {
            let _read = self.locker.read(task_id).await;
            let entry = self.registry.get(task_id)?;
            if !entry.read().is_frozen() {
                debug!(task_id, "task not frozen, no trigger needed");
                return Ok(());
            }
        }

        let _write = self.locker.write(task_id).await;
        let entry = self.registry.get(task_id)?;
        {
            let mut task = entry.write();
            // reconfirm under the exclusive lock
            if !task.is_frozen() {
                debug!(task_id = %task.id, "reconfirmed not frozen, no trigger needed");
                return Ok(());
            }
            task.update_status(TaskStatus::Running);
        }

        let engine = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let result = engine.trigger_seed(&task_id).await;
            if let Err(err) = &result {
                error!(task_id, %err, "seed trigger failed");
            }
        });
        Ok(())
    }

    /// Runs one complete fetch for the task, publishing the terminal state
    /// to the broker in every outcome.
    pub async fn trigger_seed(self: &Arc<Self>, task_id: &str) -> Result<SeedTask, EngineError> {
        let result = self.do_trigger(task_id).await;
        let entry = self.registry.get(task_id)?;
        match result {
            Ok(updated) => {
                *entry.write() = updated.clone();
                self.progress.publish_task(task_id).await;
                Ok(updated)
            }
            Err(err) => {
                error!(task_id, %err, "fetch failed");
                entry.write().update_status(TaskStatus::Failed);
                self.progress.publish_task(task_id).await;
                Err(err)
            }
        }
    }

    async fn do_trigger(self: &Arc<Self>, task_id: &str) -> Result<SeedTask, EngineError> {
        let _guard = self.locker.write(task_id).await;
        let task = self.registry.snapshot(task_id)?;

        // The accumulator follows the declared digest algorithm so the
        // final comparison is apples to apples.
        let algorithm = match DeclaredDigest::parse(&task.digest) {
            Ok(declared) => declared.algorithm,
            Err(_) => DigestAlgorithm::Md5,
        };
        let mut accumulator = DigestAccumulator::new(algorithm);

        // first: detect cache
        let detect_result = match self.detector.detect(&task, &mut accumulator).await {
            Ok(result) => result,
            Err(err) => {
                debug!(task_id, %err, "no usable cache");
                accumulator = DigestAccumulator::new(algorithm);
                self.metadata.reset_repo(&task).await?;
                CacheResult::empty()
            }
        };
        info!(
            task_id,
            break_point = detect_result.break_point,
            verified_pieces = detect_result.piece_records.len(),
            "cache detect result"
        );

        // second: report the detect result
        self.progress.init_progress(task_id);
        for record in &detect_result.piece_records {
            self.progress.publish_piece(task_id, record.clone()).await;
        }

        // full hit: no fetch required
        if detect_result.break_point == -1 {
            let metadata = detect_result
                .file_metadata
                .as_ref()
                .ok_or_else(|| EngineError::System("full hit without metadata".to_string()))?;
            info!(task_id, "cache full hit on local");
            let mut task = task;
            task.update_result(
                TaskStatus::Success,
                metadata.source_real_digest.clone(),
                metadata.piece_md5_sign.clone(),
                metadata.source_file_len,
                metadata.cdn_file_length,
                metadata.total_piece_count,
            );
            return Ok(task);
        }

        let break_point = detect_result.break_point.max(0) as u64;
        if detect_result.piece_records.is_empty() && break_point == 0 {
            // no reusable prefix: start the repo from scratch
            self.metadata.reset_repo(&task).await?;
            self.metadata.write_metadata_for_task(&task).await?;
        } else {
            // keep only the verified prefix in the piece log
            self.metadata
                .write_piece_meta_records(task_id, &detect_result.piece_records)
                .await?;
        }

        // third: open the origin stream from the break point
        let stream = fetcher::download(self, &task, break_point).await?;
        let reader = LimitedDigestReader::new(stream, self.limiter.clone(), accumulator);

        // fourth: run the piece pipeline
        let download = self
            .writer
            .write(reader, &task, break_point, detect_result.piece_records.len() as u32)
            .await?;

        // fifth: reconcile declared vs observed
        let final_task = self.handle_result(&task, &download).await?;
        self.registry.touch(task_id, now_millis());
        Ok(final_task)
    }

    /// Verifies declared against observed attributes and persists the final
    /// metadata. A mismatch marks the task Failed with `success=false`.
    async fn handle_result(
        &self,
        task: &SeedTask,
        download: &DownloadMetadata,
    ) -> Result<SeedTask, EngineError> {
        debug!(task_id = %task.id, ?download, "handle seed result");
        let mut failure = None;

        if !task.digest.is_empty() {
            let declared = DeclaredDigest::parse(&task.digest)
                .map(|d| d.hex)
                .unwrap_or_else(|_| task.digest.clone());
            if declared != download.source_real_digest {
                failure = Some(format!(
                    "file digest not match expected: {} real: {}",
                    declared, download.source_real_digest
                ));
            }
        }
        if failure.is_none()
            && task.source_file_length >= 0
            && task.source_file_length != download.real_source_file_length
        {
            failure = Some(format!(
                "file length not match expected: {} real: {}",
                task.source_file_length, download.real_source_file_length
            ));
        }
        let expected_pieces = task.expected_piece_count();
        if failure.is_none() && expected_pieces > 0 && download.total_piece_count != expected_pieces
        {
            failure = Some(format!(
                "total piece count not match expected: {} real: {}",
                expected_pieces, download.total_piece_count
            ));
        }

        let success = failure.is_none();
        let source_file_len = if task.source_file_length >= 0 {
            task.source_file_length
        } else {
            download.real_source_file_length
        };
        self.metadata
            .update_status_and_result(
                &task.id,
                success,
                source_file_len,
                download.real_cdn_file_length,
                &download.source_real_digest,
                download.total_piece_count,
                &download.piece_md5_sign,
            )
            .await?;

        if let Some(message) = failure {
            warn!(task_id = %task.id, %message, "seed result inconsistent");
            return Err(EngineError::Inconsistent(message));
        }

        let mut finished = task.clone();
        finished.update_result(
            TaskStatus::Success,
            download.source_real_digest.clone(),
            download.piece_md5_sign.clone(),
            source_file_len,
            download.real_cdn_file_length,
            download.total_piece_count,
        );
        Ok(finished)
    }

    /// Current task state.
    pub fn get_task(&self, task_id: &str) -> Result<SeedTask, EngineError> {
        Ok(self.registry.snapshot(task_id)?)
    }

    /// Pieces known for the task, sorted by piece number.
    pub async fn get_pieces(&self, task_id: &str) -> Vec<PieceMetaRecord> {
        self.progress.get_pieces(task_id).await
    }

    /// Deletes every artifact of a task; used by the garbage collector.
    pub async fn delete(&self, task_id: &str) -> Result<(), EngineError> {
        let _guard = self.locker.write(task_id).await;
        self.storage.delete_task(task_id).await?;
        Ok(())
    }

    /// Like [`try_free_space`](Self::try_free_space), but on shortfall
    /// forces one synchronous GC sweep before re-checking.
    pub async fn ensure_space(&self, need: i64) -> Result<bool, EngineError> {
        if self.try_free_space(need).await? {
            return Ok(true);
        }
        let Some(gc) = self.reclaimer.get().and_then(Weak::upgrade) else {
            return Ok(false);
        };
        gc.run_once(true).await?;
        self.try_free_space(need).await
    }

    /// True when the reservation fits the remaining budget after accounting
    /// for the space still owed to in-flight tasks.
    pub async fn try_free_space(&self, need: i64) -> Result<bool, EngineError> {
        let need = need.max(0) as u64;
        let free = self.storage.free_space().await?;
        let reserved = self.inflight_reservation().await;
        Ok(free.saturating_sub(reserved)
            > need + crate::constants::FREE_SPACE_SAFETY_MARGIN.min(self.config.storage.capacity / 10))
    }

    /// Bytes still owed to registered tasks whose payloads are incomplete.
    async fn inflight_reservation(&self) -> u64 {
        let mut reserved = 0u64;
        for task_id in self.registry.task_ids() {
            let Some(entry) = self.registry.exist(&task_id) else {
                continue;
            };
            let task = entry.read().clone();
            let total = if task.cdn_file_length > 0 {
                task.cdn_file_length
            } else {
                task.source_file_length
            };
            if total <= 0 {
                continue;
            }
            let on_disk = self.storage.task_footprint(&task_id).await;
            reserved += (total as u64).saturating_sub(on_disk);
        }
        reserved
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
