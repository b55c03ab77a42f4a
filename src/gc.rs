//! Space reclamation.
//!
//! The collector periodically walks the persisted tasks and, under space
//! pressure, evicts the coldest ones: storage artifacts deleted, registry
//! entry dropped, broker state cleared. A task that is Running or still has
//! subscribers is never touched; the per-task write lock serializes the
//! check against a racing trigger.

use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crate::config::GcConfig;
use crate::engine::{now_millis, SeedEngine};
use crate::task::TaskStatus;

/// One eviction candidate found on disk.
#[derive(Debug)]
struct Candidate {
    task_id: String,
    last_access_millis: i64,
    footprint: u64,
}

/// Periodic garbage collector bound to one engine instance.
pub struct GcSupervisor {
    engine: Weak<SeedEngine>,
    config: GcConfig,
}

impl GcSupervisor {
    pub fn new(engine: &Arc<SeedEngine>, config: GcConfig) -> Arc<Self> {
        let gc = Arc::new(Self {
            engine: Arc::downgrade(engine),
            config,
        });
        // lets the engine's space check force a sweep under pressure
        engine.attach_reclaimer(Arc::downgrade(&gc));
        gc
    }

    /// Starts the background sweep loop. The loop ends when the engine is
    /// dropped.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gc = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(gc.config.initial_delay).await;
            let mut ticker = tokio::time::interval(gc.config.period);
            loop {
                ticker.tick().await;
                if gc.engine.upgrade().is_none() {
                    debug!("engine gone, stop gc loop");
                    return;
                }
                if let Err(err) = gc.run_once(false).await {
                    warn!(%err, "gc sweep failed");
                }
            }
        })
    }

    /// Runs one sweep. With `force` the thresholds are ignored and cold
    /// classification is waived, reclaiming as much as candidates allow.
    ///
    /// Returns the number of evicted tasks.
    pub async fn run_once(&self, force: bool) -> Result<usize, crate::engine::EngineError> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(0);
        };
        let storage = engine.storage();
        let usage = storage.used_space().await?;
        if !force && usage <= self.config.young_threshold {
            return Ok(0);
        }
        let aggressive = force || usage > self.config.full_threshold;

        let now = now_millis();
        let interval_millis = self.config.interval_threshold.as_millis() as i64;
        let mut candidates = Vec::new();
        for task_id in storage.walk_task_ids().await? {
            let persisted = match storage.read_file_metadata(&task_id).await {
                Ok(metadata) => metadata.access_time,
                // artifacts without metadata are orphans, evict first
                Err(_) => 0,
            };
            // the in-memory record is fresher than the sidecar
            let last_access = engine
                .registry()
                .last_access(&task_id)
                .unwrap_or(persisted)
                .max(persisted);
            if !aggressive && now - last_access < interval_millis {
                continue;
            }
            if let Some(entry) = engine.registry().exist(&task_id) {
                if entry.read().status == TaskStatus::Running {
                    continue;
                }
            }
            let footprint = storage.task_footprint(&task_id).await;
            candidates.push(Candidate {
                task_id,
                last_access_millis: last_access,
                footprint,
            });
        }
        candidates.sort_by_key(|candidate| candidate.last_access_millis);

        let overflow = usage.saturating_sub(self.config.young_threshold);
        let target = if overflow > 0 {
            (overflow as f64 * self.config.clean_ratio).ceil() as u64
        } else {
            // forced pass without overshoot: take what the candidates give
            u64::MAX
        };

        let mut freed = 0u64;
        let mut evicted = 0usize;
        for candidate in candidates {
            if freed >= target {
                break;
            }
            if self.evict(&engine, &candidate).await {
                freed += candidate.footprint;
                evicted += 1;
            }
        }
        info!(usage, freed, evicted, aggressive, "gc sweep done");
        engine.locker().prune();
        Ok(evicted)
    }

    /// Evicts one task unless it is live. Returns true when artifacts were
    /// deleted.
    async fn evict(&self, engine: &Arc<SeedEngine>, candidate: &Candidate) -> bool {
        let task_id = &candidate.task_id;
        let _guard = engine.locker().write(task_id).await;

        // recheck under the lock, a trigger may have taken the task
        if let Some(entry) = engine.registry().exist(task_id) {
            if entry.read().status == TaskStatus::Running {
                debug!(task_id, "task became live, skip eviction");
                return false;
            }
        }
        if engine.progress().subscriber_count(task_id) > 0 {
            debug!(task_id, "task still has subscribers, skip eviction");
            return false;
        }

        if let Err(err) = engine.storage().delete_task(task_id).await {
            warn!(task_id, %err, "delete task artifacts");
            return false;
        }
        engine.registry().delete(task_id);
        engine.progress().clear(task_id).await;
        debug!(task_id, footprint = candidate.footprint, "task evicted");
        true
    }

    /// Space-pressure entry point: checks the reservation and, on
    /// shortfall, forces one synchronous sweep before re-checking.
    pub async fn try_free_space(&self, need: i64) -> Result<bool, crate::engine::EngineError> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(false);
        };
        engine.ensure_space(need).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::source::{
        ByteStream, ClientRegistry, ExpireInfo, ResourceClient, SourceError, SourceRequest,
    };
    use crate::storage::{DiskDriver, FileMetadata, StorageManager};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct IdleOrigin;

    #[async_trait]
    impl ResourceClient for IdleOrigin {
        async fn content_length(&self, _request: &SourceRequest) -> Result<i64, SourceError> {
            Ok(100)
        }

        async fn is_expired(
            &self,
            _request: &SourceRequest,
            _expire_info: &ExpireInfo,
        ) -> Result<bool, SourceError> {
            Ok(false)
        }

        async fn is_support_range(&self, _request: &SourceRequest) -> Result<bool, SourceError> {
            Ok(true)
        }

        async fn download(&self, _request: &SourceRequest) -> Result<ByteStream, SourceError> {
            Ok(Box::new(std::io::Cursor::new(vec![0u8; 100])))
        }

        async fn download_with_expire_info(
            &self,
            _request: &SourceRequest,
        ) -> Result<(ByteStream, ExpireInfo), SourceError> {
            Ok((
                Box::new(std::io::Cursor::new(vec![0u8; 100])),
                ExpireInfo::default(),
            ))
        }
    }

    fn engine(temp: &TempDir, young_threshold: u64) -> (Arc<SeedEngine>, Arc<GcSupervisor>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut config = Config::default();
        config.storage.base_dir = temp.path().to_path_buf();
        config.storage.capacity = 100_000;
        config.gc.young_threshold = young_threshold;
        config.gc.full_threshold = young_threshold * 2;
        config.gc.interval_threshold = Duration::from_millis(0);
        let storage = Arc::new(StorageManager::new(DiskDriver::new(
            temp.path(),
            config.storage.capacity,
        )));
        let clients = Arc::new(ClientRegistry::new().register("http", Arc::new(IdleOrigin)));
        let gc_config = config.gc.clone();
        let engine = SeedEngine::new(config, clients, storage);
        let gc = GcSupervisor::new(&engine, gc_config);
        (engine, gc)
    }

    async fn seed_task(engine: &Arc<SeedEngine>, task_id: &str, size: usize, access_time: i64) {
        let storage = engine.storage();
        let data = vec![1u8; size];
        storage
            .write_download_file(task_id, 0, size as u64, &mut data.as_slice())
            .await
            .unwrap();
        let metadata = FileMetadata {
            task_id: task_id.to_string(),
            access_time,
            ..Default::default()
        };
        storage.write_file_metadata(task_id, &metadata).await.unwrap();
    }

    fn task_id(tag: u8) -> String {
        format!("{:064x}", tag as u128)
    }

    #[tokio::test]
    async fn test_sweep_below_threshold_is_a_noop() {
        let temp = TempDir::new().unwrap();
        let (engine, gc) = engine(&temp, 1_000_000);
        seed_task(&engine, &task_id(1), 4000, 0).await;

        assert_eq!(gc.run_once(false).await.unwrap(), 0);
        assert!(engine.storage().stat_download_file(&task_id(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_evicts_coldest_first_until_target() {
        let temp = TempDir::new().unwrap();
        // usage lands a little above 12000; the overflow over the threshold
        // is smaller than one task, so evicting the coldest one suffices
        let (engine, gc) = engine(&temp, 10_000);
        seed_task(&engine, &task_id(1), 4000, 1_000).await; // coldest
        seed_task(&engine, &task_id(2), 4000, 2_000).await;
        seed_task(&engine, &task_id(3), 4000, 3_000).await; // hottest

        let evicted = gc.run_once(false).await.unwrap();
        assert_eq!(evicted, 1);
        assert!(engine.storage().stat_download_file(&task_id(1)).await.is_err());
        assert!(engine.storage().stat_download_file(&task_id(2)).await.is_ok());
        assert!(engine.storage().stat_download_file(&task_id(3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_forced_sweep_ignores_thresholds() {
        let temp = TempDir::new().unwrap();
        let (engine, gc) = engine(&temp, 1_000_000);
        seed_task(&engine, &task_id(1), 4000, 0).await;

        let evicted = gc.run_once(true).await.unwrap();
        assert_eq!(evicted, 1);
        assert!(engine.storage().stat_download_file(&task_id(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_running_task_is_never_evicted() {
        let temp = TempDir::new().unwrap();
        let (engine, gc) = engine(&temp, 0);

        let entry = engine
            .registry()
            .add_or_update(&crate::task::SeedRequest::new("http://origin.test/a"))
            .await
            .unwrap();
        let id = entry.read().id.clone();
        entry.write().update_status(TaskStatus::Running);
        seed_task(&engine, &id, 4000, 0).await;

        assert_eq!(gc.run_once(true).await.unwrap(), 0);
        assert!(engine.storage().stat_download_file(&id).await.is_ok());
        assert!(engine.registry().exist(&id).is_some());
    }

    #[tokio::test]
    async fn test_eviction_drops_registry_and_broker_state() {
        let temp = TempDir::new().unwrap();
        let (engine, gc) = engine(&temp, 0);

        let entry = engine
            .registry()
            .add_or_update(&crate::task::SeedRequest::new("http://origin.test/a"))
            .await
            .unwrap();
        let id = entry.read().id.clone();
        entry.write().update_status(TaskStatus::Failed);
        seed_task(&engine, &id, 4000, 0).await;
        engine.progress().init_progress(&id);

        assert_eq!(gc.run_once(true).await.unwrap(), 1);
        assert!(engine.registry().exist(&id).is_none());
        assert!(engine.progress().get_pieces(&id).await.is_empty());
        assert!(engine.storage().stat_download_file(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_try_free_space_forces_a_sweep_under_pressure() {
        let temp = TempDir::new().unwrap();
        let (engine, gc) = engine(&temp, 0);
        // capacity 100_000, margin capacity/10 = 10_000; fill most of it
        seed_task(&engine, &task_id(1), 80_000, 0).await;

        assert!(!engine.try_free_space(20_000).await.unwrap());
        assert!(gc.try_free_space(20_000).await.unwrap());
        assert!(engine.storage().stat_download_file(&task_id(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_register_under_pressure_reclaims_through_gc() {
        let temp = TempDir::new().unwrap();
        let (engine, _gc) = engine(&temp, 0);
        // leaves less free space than the reservation margin
        seed_task(&engine, &task_id(1), 95_000, 0).await;
        assert!(!engine.try_free_space(100).await.unwrap());

        // registration forces a sweep instead of failing with ResourceLacked
        let (_, receiver) = engine
            .register(crate::task::SeedRequest::new("http://origin.test/fresh"))
            .await
            .unwrap();
        assert!(engine.storage().stat_download_file(&task_id(1)).await.is_err());
        drop(receiver);
    }
}
