use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use super::*;
use crate::config::Config;
use crate::digest::{md5_hex, sha256_hex_concat};
use crate::progress::PieceEvent;
use crate::source::{ByteStream, ExpireInfo, ResourceClient, SourceError, SourceRequest};
use crate::storage::{DiskDriver, FileMetadata, PieceRange, PieceStyle, StorageManager};
use crate::task::{SeedRequest, TaskStatus};

const PAYLOAD_LEN: usize = 9789;
const PIECE_SIZE: u32 = 2000;

fn payload() -> Vec<u8> {
    (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
}

/// In-memory origin serving one artifact, with range support and call
/// accounting.
struct MockOrigin {
    payload: Vec<u8>,
    support_range: bool,
    report_length: bool,
    /// Lie about the content length, e.g. a truncating origin.
    declared_length: Option<i64>,
    expired: bool,
    downloads: AtomicU32,
    served_bytes: AtomicU64,
    ranges: parking_lot::Mutex<Vec<Option<String>>>,
}

impl MockOrigin {
    fn new(payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self::unwrapped(payload))
    }

    fn without_range_support(payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            support_range: false,
            ..Self::unwrapped(payload)
        })
    }

    fn without_length(payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            report_length: false,
            ..Self::unwrapped(payload)
        })
    }

    fn expired(payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            expired: true,
            ..Self::unwrapped(payload)
        })
    }

    fn truncating(payload: Vec<u8>, declared_length: i64) -> Arc<Self> {
        Arc::new(Self {
            declared_length: Some(declared_length),
            ..Self::unwrapped(payload)
        })
    }

    fn unwrapped(payload: Vec<u8>) -> Self {
        Self {
            payload,
            support_range: true,
            report_length: true,
            declared_length: None,
            expired: false,
            downloads: AtomicU32::new(0),
            served_bytes: AtomicU64::new(0),
            ranges: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn slice_for(&self, range: Option<&String>) -> Vec<u8> {
        match range {
            None => self.payload.clone(),
            Some(spec) => {
                let (start, end) = spec.split_once('-').expect("range spec");
                let start: usize = start.parse().expect("range start");
                let end: usize = if end.is_empty() {
                    self.payload.len() - 1
                } else {
                    end.parse().expect("range end")
                };
                self.payload[start..=end.min(self.payload.len() - 1)].to_vec()
            }
        }
    }
}

#[async_trait]
impl ResourceClient for MockOrigin {
    async fn content_length(&self, _request: &SourceRequest) -> Result<i64, SourceError> {
        if !self.report_length {
            return Ok(-1);
        }
        Ok(self
            .declared_length
            .unwrap_or(self.payload.len() as i64))
    }

    async fn is_expired(
        &self,
        _request: &SourceRequest,
        _expire_info: &ExpireInfo,
    ) -> Result<bool, SourceError> {
        Ok(self.expired)
    }

    async fn is_support_range(&self, _request: &SourceRequest) -> Result<bool, SourceError> {
        Ok(self.support_range)
    }

    async fn download(&self, request: &SourceRequest) -> Result<ByteStream, SourceError> {
        let (stream, _) = self.download_with_expire_info(request).await?;
        Ok(stream)
    }

    async fn download_with_expire_info(
        &self,
        request: &SourceRequest,
    ) -> Result<(ByteStream, ExpireInfo), SourceError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.ranges.lock().push(request.range.clone());
        let body = self.slice_for(request.range.as_ref());
        self.served_bytes.fetch_add(body.len() as u64, Ordering::SeqCst);
        Ok((
            Box::new(std::io::Cursor::new(body)),
            ExpireInfo {
                last_modified: "Wed, 21 Oct 2015 07:28:00 GMT".to_string(),
                etag: "\"v1\"".to_string(),
            },
        ))
    }
}

fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn engine_with(origin: Arc<MockOrigin>, temp: &TempDir) -> Arc<SeedEngine> {
    init_logs();
    let mut config = Config::default();
    config.storage.base_dir = temp.path().to_path_buf();
    config.storage.capacity = 1 << 30;
    config.progress.subscriber_timeout = Duration::from_millis(300);
    let storage = Arc::new(StorageManager::new(DiskDriver::new(
        temp.path(),
        config.storage.capacity,
    )));
    let clients = Arc::new(crate::source::ClientRegistry::new().register("http", origin));
    SeedEngine::new(config, clients, storage)
}

/// Forces a small per-task piece size so the scenario payload yields
/// several pieces.
fn shrink_piece_size(engine: &Arc<SeedEngine>, task_id: &str) {
    let entry = engine.registry().get(task_id).unwrap();
    entry.write().piece_size = PIECE_SIZE;
}

async fn register_small_pieces(
    engine: &Arc<SeedEngine>,
    request: SeedRequest,
) -> (String, tokio::sync::mpsc::Receiver<PieceEvent>) {
    // register without triggering, shrink the piece size, then trigger
    let entry = engine.registry().add_or_update(&request).await.unwrap();
    let task_id = entry.read().id.clone();
    shrink_piece_size(engine, &task_id);
    engine.register(request).await.unwrap()
}

async fn drain(mut receiver: tokio::sync::mpsc::Receiver<PieceEvent>) -> Vec<PieceEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_fresh_fetch_produces_expected_pieces() {
    let temp = TempDir::new().unwrap();
    let origin = MockOrigin::new(payload());
    let engine = engine_with(origin.clone(), &temp);

    let (task_id, receiver) = register_small_pieces(
        &engine,
        SeedRequest::new("http://origin.test/data.bin"),
    )
    .await;
    let events = drain(receiver).await;

    assert_eq!(events.len(), 5);
    let expected = [
        (0u32, 2000u32, 0u64, 1999u64),
        (1, 2000, 2000, 3999),
        (2, 2000, 4000, 5999),
        (3, 2000, 6000, 7999),
        (4, 1789, 8000, 9788),
    ];
    for (event, (num, len, start, end)) in events.iter().zip(expected) {
        assert_eq!(event.piece_num, num);
        assert_eq!(event.piece_len, len);
        assert_eq!(event.stored_range, PieceRange::new(start, end));
        assert_eq!(event.source_range, PieceRange::new(start, end));
        assert_eq!(event.style, PieceStyle::Plain);
    }

    let task = engine.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.total_piece_count, 5);
    assert_eq!(task.cdn_file_length, PAYLOAD_LEN as i64);
    assert_eq!(task.source_file_length, PAYLOAD_LEN as i64);
    assert_eq!(task.source_real_digest, md5_hex(&payload()));

    // aggregate signature covers the per-piece digests in index order
    let expected_sign = sha256_hex_concat(events.iter().map(|e| e.md5.clone()));
    assert_eq!(task.piece_md5_sign, expected_sign);

    let metadata = engine.metadata().read_file_metadata(&task_id).await.unwrap();
    assert!(metadata.finish);
    assert!(metadata.success);
    assert_eq!(metadata.total_piece_count, 5);
    assert_eq!(origin.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(origin.ranges.lock()[0], None);
}

#[tokio::test]
async fn test_piece_length_law_holds() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(MockOrigin::new(payload()), &temp);

    let (task_id, receiver) = register_small_pieces(
        &engine,
        SeedRequest::new("http://origin.test/data.bin"),
    )
    .await;
    drain(receiver).await;

    let task = engine.get_task(&task_id).unwrap();
    let piece_size = task.piece_size as i64;
    let count = task.total_piece_count as i64;
    assert!(piece_size * (count - 1) < task.cdn_file_length);
    assert!(task.cdn_file_length <= piece_size * count);

    // sorted pieces tile the source exactly once
    let pieces = engine.get_pieces(&task_id).await;
    let mut cursor = 0u64;
    for piece in &pieces {
        assert_eq!(piece.source_range.start, cursor);
        cursor = piece.source_range.end + 1;
    }
    assert_eq!(cursor, PAYLOAD_LEN as u64);
}

async fn seed_partial_cache(engine: &Arc<SeedEngine>, task_id: &str, pieces: u32) {
    let data = payload();
    let storage = engine.storage();
    storage.reset_repo(task_id).await.unwrap();
    let prefix_len = (pieces * PIECE_SIZE) as usize;
    storage
        .write_download_file(task_id, 0, prefix_len as u64, &mut &data[..prefix_len])
        .await
        .unwrap();

    let mut records = Vec::new();
    for num in 0..pieces {
        let start = (num * PIECE_SIZE) as u64;
        let end = start + PIECE_SIZE as u64 - 1;
        records.push(crate::storage::PieceMetaRecord {
            piece_num: num,
            piece_len: PIECE_SIZE,
            md5: md5_hex(&data[start as usize..=end as usize]),
            stored_range: PieceRange::new(start, end),
            source_range: PieceRange::new(start, end),
            style: PieceStyle::Plain,
        });
    }
    storage.write_piece_meta_records(task_id, &records).await.unwrap();

    let metadata = FileMetadata {
        task_id: task_id.to_string(),
        task_url: "http://origin.test/data.bin".to_string(),
        piece_size: PIECE_SIZE,
        source_file_len: PAYLOAD_LEN as i64,
        access_time: now_millis(),
        expire_info: HashMap::from([("ETag".to_string(), "\"v1\"".to_string())]),
        ..Default::default()
    };
    storage.write_file_metadata(task_id, &metadata).await.unwrap();
}

#[tokio::test]
async fn test_resume_from_partial_cache() {
    let temp = TempDir::new().unwrap();
    let origin = MockOrigin::new(payload());
    let engine = engine_with(origin.clone(), &temp);

    let request = SeedRequest::new("http://origin.test/data.bin");
    let entry = engine.registry().add_or_update(&request).await.unwrap();
    let task_id = entry.read().id.clone();
    shrink_piece_size(&engine, &task_id);
    seed_partial_cache(&engine, &task_id, 2).await;

    let (_, receiver) = engine.register(request).await.unwrap();
    let events = drain(receiver).await;

    // replay of the two cached pieces plus three fetched ones
    assert_eq!(events.len(), 5);
    assert_eq!(
        events.iter().map(|e| e.piece_num).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );

    // only the remainder was read from the origin
    assert_eq!(origin.ranges.lock().as_slice(), &[Some("4000-".to_string())]);
    assert_eq!(
        origin.served_bytes.load(Ordering::SeqCst),
        (PAYLOAD_LEN - 4000) as u64
    );

    let task = engine.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.source_real_digest, md5_hex(&payload()));
    let records = engine
        .metadata()
        .read_piece_meta_records(&task_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 5);
}

#[tokio::test]
async fn test_partial_cache_without_range_support_refetches_fully() {
    let temp = TempDir::new().unwrap();
    let origin = MockOrigin::without_range_support(payload());
    let engine = engine_with(origin.clone(), &temp);

    let request = SeedRequest::new("http://origin.test/data.bin");
    let entry = engine.registry().add_or_update(&request).await.unwrap();
    let task_id = entry.read().id.clone();
    shrink_piece_size(&engine, &task_id);
    seed_partial_cache(&engine, &task_id, 2).await;

    let (_, receiver) = engine.register(request).await.unwrap();
    let events = drain(receiver).await;

    assert_eq!(events.len(), 5);
    // detector reported no cache, the fetch started from byte zero
    assert_eq!(origin.ranges.lock().as_slice(), &[None]);
    assert_eq!(origin.served_bytes.load(Ordering::SeqCst), PAYLOAD_LEN as u64);
    assert_eq!(
        engine.get_task(&task_id).unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn test_full_cache_hit_skips_the_fetcher() {
    let temp = TempDir::new().unwrap();
    let origin = MockOrigin::new(payload());
    let engine = engine_with(origin.clone(), &temp);

    let request = SeedRequest::new("http://origin.test/data.bin");
    let entry = engine.registry().add_or_update(&request).await.unwrap();
    let task_id = entry.read().id.clone();
    shrink_piece_size(&engine, &task_id);
    seed_partial_cache(&engine, &task_id, 2).await;

    // promote the partial seed to a finished, successful artifact
    let data = payload();
    let storage = engine.storage();
    storage
        .write_download_file(&task_id, 0, data.len() as u64, &mut &data[..])
        .await
        .unwrap();
    let mut records = storage.read_piece_meta_records(&task_id).await.unwrap();
    for num in 2..5u32 {
        let start = (num * PIECE_SIZE) as u64;
        let end = (start + PIECE_SIZE as u64 - 1).min(PAYLOAD_LEN as u64 - 1);
        records.push(crate::storage::PieceMetaRecord {
            piece_num: num,
            piece_len: (end - start + 1) as u32,
            md5: md5_hex(&data[start as usize..=end as usize]),
            stored_range: PieceRange::new(start, end),
            source_range: PieceRange::new(start, end),
            style: PieceStyle::Plain,
        });
    }
    storage.write_piece_meta_records(&task_id, &records).await.unwrap();
    let mut metadata = storage.read_file_metadata(&task_id).await.unwrap();
    metadata.finish = true;
    metadata.success = true;
    metadata.cdn_file_length = PAYLOAD_LEN as i64;
    metadata.total_piece_count = 5;
    metadata.source_real_digest = md5_hex(&data);
    metadata.piece_md5_sign = sha256_hex_concat(records.iter().map(|r| r.md5.clone()));
    storage.write_file_metadata(&task_id, &metadata).await.unwrap();

    let (_, receiver) = engine.register(request).await.unwrap();
    let events = drain(receiver).await;

    assert_eq!(events.len(), 5);
    assert_eq!(origin.downloads.load(Ordering::SeqCst), 0);
    let task = engine.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.source_real_digest, md5_hex(&data));
}

#[tokio::test]
async fn test_expired_cache_is_discarded_and_refetched() {
    let temp = TempDir::new().unwrap();
    let origin = MockOrigin::expired(payload());
    let engine = engine_with(origin.clone(), &temp);

    let request = SeedRequest::new("http://origin.test/data.bin");
    let entry = engine.registry().add_or_update(&request).await.unwrap();
    let task_id = entry.read().id.clone();
    shrink_piece_size(&engine, &task_id);
    seed_partial_cache(&engine, &task_id, 2).await;

    let (_, receiver) = engine.register(request).await.unwrap();
    let events = drain(receiver).await;

    assert_eq!(events.len(), 5);
    assert_eq!(origin.ranges.lock().as_slice(), &[None]);
    assert_eq!(
        engine.get_task(&task_id).unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn test_declared_digest_mismatch_fails_the_task() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(MockOrigin::new(payload()), &temp);

    let mut request = SeedRequest::new("http://origin.test/data.bin");
    request.digest = format!("md5:{}", "a".repeat(32));
    let (task_id, receiver) = register_small_pieces(&engine, request).await;
    let events = drain(receiver).await;

    // the pipeline ran to completion before verification failed
    assert_eq!(events.len(), 5);
    let task = engine.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let metadata = engine.metadata().read_file_metadata(&task_id).await.unwrap();
    assert!(metadata.finish);
    assert!(!metadata.success);
}

#[tokio::test]
async fn test_declared_digest_match_succeeds() {
    let temp = TempDir::new().unwrap();
    let engine = engine_with(MockOrigin::new(payload()), &temp);

    let mut request = SeedRequest::new("http://origin.test/data.bin");
    request.digest = format!("md5:{}", md5_hex(&payload()));
    let (task_id, receiver) = register_small_pieces(&engine, request).await;
    drain(receiver).await;

    assert_eq!(
        engine.get_task(&task_id).unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn test_origin_shorter_than_declared_fails_the_task() {
    let temp = TempDir::new().unwrap();
    // origin claims 12000 bytes but serves 9789
    let origin = MockOrigin::truncating(payload(), 12_000);
    let engine = engine_with(origin, &temp);

    let (task_id, receiver) = register_small_pieces(
        &engine,
        SeedRequest::new("http://origin.test/data.bin"),
    )
    .await;
    drain(receiver).await;

    let task = engine.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let metadata = engine.metadata().read_file_metadata(&task_id).await.unwrap();
    assert!(metadata.finish);
    assert!(!metadata.success);
}

#[tokio::test]
async fn test_origin_longer_than_declared_fails_the_task() {
    let temp = TempDir::new().unwrap();
    // origin claims 8000 bytes but serves 9789
    let origin = MockOrigin::truncating(payload(), 8_000);
    let engine = engine_with(origin, &temp);

    let (task_id, receiver) = register_small_pieces(
        &engine,
        SeedRequest::new("http://origin.test/data.bin"),
    )
    .await;
    drain(receiver).await;

    assert_eq!(engine.get_task(&task_id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_unknown_content_length_terminates_on_eof() {
    let temp = TempDir::new().unwrap();
    let origin = MockOrigin::without_length(payload());
    let engine = engine_with(origin, &temp);

    let (task_id, receiver) = engine
        .register(SeedRequest::new("http://origin.test/stream.bin"))
        .await
        .unwrap();
    let events = drain(receiver).await;

    // default piece size swallows the whole payload in one piece
    assert_eq!(events.len(), 1);
    let task = engine.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.total_piece_count, 1);
    assert_eq!(task.source_file_length, PAYLOAD_LEN as i64);
    assert_eq!(task.cdn_file_length, PAYLOAD_LEN as i64);
}

#[tokio::test]
async fn test_concurrent_registrations_share_one_fetch() {
    let temp = TempDir::new().unwrap();
    let origin = MockOrigin::new(payload());
    let engine = engine_with(origin.clone(), &temp);

    // pre-create so the piece size can be pinned before any trigger
    let request = SeedRequest::new("http://origin.test/data.bin");
    let entry = engine.registry().add_or_update(&request).await.unwrap();
    let task_id = entry.read().id.clone();
    shrink_piece_size(&engine, &task_id);

    let mut joins = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        let request = request.clone();
        joins.push(tokio::spawn(async move {
            let (_, receiver) = engine.register(request).await.unwrap();
            drain(receiver).await
        }));
    }

    for join in joins {
        let events = join.await.unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(
            events.iter().map(|e| e.piece_num).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
    }
    assert_eq!(origin.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.get_task(&task_id).unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn test_second_register_after_success_is_a_cache_hit() {
    let temp = TempDir::new().unwrap();
    let origin = MockOrigin::new(payload());
    let engine = engine_with(origin.clone(), &temp);

    let request = SeedRequest::new("http://origin.test/data.bin");
    let (task_id, receiver) = register_small_pieces(&engine, request.clone()).await;
    drain(receiver).await;
    assert_eq!(origin.downloads.load(Ordering::SeqCst), 1);

    let (_, receiver) = engine.register(request).await.unwrap();
    let events = drain(receiver).await;
    assert_eq!(events.len(), 5);
    // Success is not frozen: no second fetch was triggered
    assert_eq!(origin.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.get_task(&task_id).unwrap().status,
        TaskStatus::Success
    );
}
