use std::sync::Arc;

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::metadata::MetadataStore;
use super::EngineError;
use crate::bandwidth::LimitedDigestReader;
use crate::progress::ProgressBroker;
use crate::storage::{PieceMetaRecord, PieceRange, PieceStyle};
use crate::task::SeedTask;

/// Pool of reusable piece buffers.
///
/// Buffers are handed to persistence workers and recycled once the piece
/// is on disk; a missing buffer is simply reallocated.
pub struct BufferPool {
    buffers: ArrayQueue<BytesMut>,
    piece_size: usize,
}

impl BufferPool {
    pub fn new(slots: usize, piece_size: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            buffers: ArrayQueue::new(slots.max(1)),
            piece_size,
        });
        for _ in 0..slots.max(1) {
            let _ = pool.buffers.push(BytesMut::with_capacity(piece_size));
        }
        pool
    }

    pub fn get(&self) -> BytesMut {
        self.buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.piece_size))
    }

    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        let _ = self.buffers.push(buf);
    }

    pub fn available(&self) -> usize {
        self.buffers.len()
    }
}

/// Result of one pipeline run.
#[derive(Debug, Default, Clone)]
pub struct DownloadMetadata {
    /// Bytes actually read from the origin this run.
    pub back_source_length: i64,
    /// Size of the stored payload after the run.
    pub real_cdn_file_length: i64,
    /// Verified cached prefix plus bytes read this run.
    pub real_source_file_length: i64,
    pub total_piece_count: u32,
    /// SHA-256 over the per-piece digests in index order.
    pub piece_md5_sign: String,
    /// Digest of the full source stream.
    pub source_real_digest: String,
}

struct PieceJob {
    piece_num: u32,
    content: BytesMut,
}

/// Streamed slicing, hashing, and bounded-parallel persistence of origin
/// bytes, with piece-completion events published as pieces land.
pub struct PieceWriter {
    metadata: Arc<MetadataStore>,
    progress: Arc<ProgressBroker>,
    parallelism: usize,
}

impl PieceWriter {
    pub fn new(metadata: Arc<MetadataStore>, progress: Arc<ProgressBroker>, parallelism: usize) -> Self {
        Self {
            metadata,
            progress,
            parallelism: parallelism.max(1),
        }
    }

    /// Drains `reader` into pieces starting at `break_point`.
    ///
    /// `cur_piece_num` is the index of the first piece this run produces,
    /// i.e. the number of pieces the cache already verified. Any worker
    /// error cancels the pipeline; the partial payload and piece log are
    /// kept for a later resume.
    pub async fn write(
        &self,
        mut reader: LimitedDigestReader,
        task: &SeedTask,
        break_point: u64,
        cur_piece_num: u32,
    ) -> Result<DownloadMetadata, EngineError> {
        let piece_size = task.piece_size as usize;
        let routine_count = routine_count(
            task.source_file_length - break_point as i64,
            task.piece_size,
            self.parallelism,
        );
        debug!(task_id = %task.id, routine_count, cur_piece_num, "start writer pool");

        let pool = BufferPool::new(routine_count * 2, piece_size);
        let cancel = CancellationToken::new();
        let (job_sender, job_receiver) = mpsc::channel::<PieceJob>(routine_count);
        let job_receiver = Arc::new(Mutex::new(job_receiver));

        let mut workers = Vec::with_capacity(routine_count);
        for _ in 0..routine_count {
            workers.push(tokio::spawn(worker_loop(
                self.metadata.clone(),
                self.progress.clone(),
                job_receiver.clone(),
                pool.clone(),
                cancel.clone(),
                task.id.clone(),
                task.piece_size,
            )));
        }

        // producer: slice the stream into piece-size jobs
        let mut back_source_length = 0i64;
        let mut piece_num = cur_piece_num;
        let mut read_error = None;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let mut buf = pool.get();
            buf.resize(piece_size, 0);
            let n = match reader.read_full(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    read_error = Some(EngineError::DownloadFail(format!(
                        "read source, piece {piece_num}: {err}"
                    )));
                    break;
                }
            };
            if n == 0 {
                pool.put(buf);
                break;
            }
            buf.truncate(n);
            back_source_length += n as i64;
            if job_sender
                .send(PieceJob {
                    piece_num,
                    content: buf,
                })
                .await
                .is_err()
            {
                // all workers exited early, the error surfaces below
                break;
            }
            piece_num += 1;
            if n < piece_size {
                break;
            }
        }
        drop(job_sender);

        let mut worker_error = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => worker_error = worker_error.or(Some(err)),
                Err(err) => {
                    worker_error =
                        worker_error.or(Some(EngineError::System(format!("writer task: {err}"))))
                }
            }
        }
        if let Some(err) = read_error.or(worker_error) {
            return Err(err);
        }

        let storage_info = self.metadata.stat_download_file(&task.id).await?;
        let (piece_md5_sign, records) = self.metadata.piece_md5_sign(&task.id).await?;
        debug_assert_eq!(records.len() as u32, piece_num);

        Ok(DownloadMetadata {
            back_source_length,
            real_cdn_file_length: storage_info.size as i64,
            real_source_file_length: break_point as i64 + back_source_length,
            total_piece_count: piece_num,
            piece_md5_sign,
            source_real_digest: reader.into_digest_hex(),
        })
    }
}

async fn worker_loop(
    metadata: Arc<MetadataStore>,
    progress: Arc<ProgressBroker>,
    jobs: Arc<Mutex<mpsc::Receiver<PieceJob>>>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
    task_id: String,
    piece_size: u32,
) -> Result<(), EngineError> {
    loop {
        let job = {
            let mut receiver = jobs.lock().await;
            tokio::select! {
                job = receiver.recv() => job,
                _ = cancel.cancelled() => None,
            }
        };
        let Some(job) = job else {
            return Ok(());
        };
        if let Err(err) = persist_piece(&metadata, &progress, &task_id, piece_size, &job).await {
            error!(task_id, piece_num = job.piece_num, %err, "persist piece");
            cancel.cancel();
            pool.put(job.content);
            return Err(err);
        }
        pool.put(job.content);
    }
}

async fn persist_piece(
    metadata: &MetadataStore,
    progress: &ProgressBroker,
    task_id: &str,
    piece_size: u32,
    job: &PieceJob,
) -> Result<(), EngineError> {
    let piece_len = job.content.len() as u32;
    let offset = job.piece_num as u64 * piece_size as u64;
    let md5 = crate::digest::md5_hex(&job.content);

    metadata
        .write_download_file(task_id, offset, piece_len as u64, &mut &job.content[..])
        .await?;

    // stored bytes are verbatim source bytes
    let range = PieceRange::new(offset, offset + piece_len as u64 - 1);
    let record = PieceMetaRecord {
        piece_num: job.piece_num,
        piece_len,
        md5,
        stored_range: range,
        source_range: range,
        style: PieceStyle::Plain,
    };
    metadata.append_piece_metadata(task_id, &record).await?;
    progress.publish_piece(task_id, record).await;
    Ok(())
}

/// Worker count for the remaining bytes: one per outstanding piece, capped.
/// An unknown remainder uses the full cap.
fn routine_count(remaining: i64, piece_size: u32, cap: usize) -> usize {
    if remaining < 0 || piece_size == 0 {
        return cap.max(1);
    }
    if remaining == 0 {
        return 1;
    }
    let divisor = piece_size as i64;
    let pieces = ((remaining + divisor - 1) / divisor).max(1) as usize;
    pieces.min(cap.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routine_count_is_clamped() {
        assert_eq!(routine_count(-1, 2000, 4), 4);
        assert_eq!(routine_count(0, 2000, 4), 1);
        assert_eq!(routine_count(1, 2000, 4), 1);
        assert_eq!(routine_count(4000, 2000, 4), 2);
        assert_eq!(routine_count(100_000, 2000, 4), 4);
        assert_eq!(routine_count(100_000, 0, 4), 4);
    }

    #[test]
    fn test_buffer_pool_recycles() {
        let pool = BufferPool::new(2, 16);
        assert_eq!(pool.available(), 2);
        let a = pool.get();
        let b = pool.get();
        let c = pool.get(); // past capacity, freshly allocated
        assert_eq!(pool.available(), 0);
        pool.put(a);
        pool.put(b);
        pool.put(c); // dropped, queue full
        assert_eq!(pool.available(), 2);
        let recycled = pool.get();
        assert!(recycled.is_empty());
        assert!(recycled.capacity() >= 16);
    }
}
