use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::entity::{piece_size_for, SeedRequest, SeedTask};
use super::TaskError;
use crate::config::PieceConfig;
use crate::constants::{CONTENT_LENGTH_RETRIES, UNKNOWN_SOURCE_LENGTH};
use crate::fingerprint::{canonical_url, fingerprint};
use crate::source::{ClientRegistry, SourceRequest};

/// Access bookkeeping used by the garbage collector to order evictions.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AccessRecord {
    /// Unix millis of the most recent access.
    pub last_access_millis: i64,
}

/// Maps fingerprints to seed tasks.
///
/// Entry creation is guarded by the map itself; entity mutation goes
/// through the per-task `RwLock`, which only the owning fetch writes while
/// the task is Running.
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<RwLock<SeedTask>>>,
    accessed: DashMap<String, AccessRecord>,
    clients: Arc<ClientRegistry>,
    piece_config: PieceConfig,
}

impl TaskRegistry {
    pub fn new(clients: Arc<ClientRegistry>, piece_config: PieceConfig) -> Self {
        Self {
            tasks: DashMap::new(),
            accessed: DashMap::new(),
            clients,
            piece_config,
        }
    }

    /// Registers a request, returning the task entry.
    ///
    /// A new fingerprint inserts a Waiting task with a freshly probed
    /// source length and derived piece size. An existing entry only
    /// reconciles the mutable request fields (headers, declared digest)
    /// when the task is not Running.
    pub async fn add_or_update(
        &self,
        request: &SeedRequest,
    ) -> Result<Arc<RwLock<SeedTask>>, TaskError> {
        if request.url.trim().is_empty() {
            return Err(TaskError::InvalidValue {
                field: "url",
                value: request.url.clone(),
            });
        }
        let canonical = canonical_url(&request.url, &request.filters)?;
        let id = fingerprint(request)?;

        if let Some(existing) = self.tasks.get(&id) {
            let entry = existing.clone();
            drop(existing);
            let mut task = entry.write();
            if task.task_url != canonical {
                return Err(TaskError::IdDuplicate {
                    id,
                    existing: task.task_url.clone(),
                    incoming: canonical,
                });
            }
            if !task.status.is_frozen() {
                debug!(task_id = %id, status = ?task.status, "task busy, skip field reconcile");
            } else {
                task.headers = request.headers.clone();
                if !request.digest.is_empty() {
                    task.digest = request.digest.clone();
                }
            }
            drop(task);
            return Ok(entry);
        }

        let source_file_length = self.probe_source_length(request).await?;
        let piece_size = piece_size_for(source_file_length, &self.piece_config);
        debug!(
            task_id = %id,
            source_file_length,
            piece_size,
            "register new seed task"
        );

        let task = SeedTask::new(id.clone(), request, canonical.clone(), source_file_length, piece_size);
        let entry = self
            .tasks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(task)))
            .clone();
        // A racing insert may have won with a different canonical URL.
        {
            let existing = entry.read();
            if existing.task_url != canonical {
                return Err(TaskError::IdDuplicate {
                    id,
                    existing: existing.task_url.clone(),
                    incoming: canonical,
                });
            }
        }
        Ok(entry)
    }

    async fn probe_source_length(&self, request: &SeedRequest) -> Result<i64, TaskError> {
        let client =
            self.clients
                .for_url(&request.url)
                .map_err(|err| TaskError::UrlNotReachable {
                    url: request.url.clone(),
                    reason: err.to_string(),
                })?;
        let source_request =
            SourceRequest::new(&request.url).with_header(request.headers.clone());

        let mut last_err = None;
        for attempt in 0..CONTENT_LENGTH_RETRIES {
            match client.content_length(&source_request).await {
                Ok(len) if len >= 0 => return Ok(len),
                Ok(_) => return Ok(UNKNOWN_SOURCE_LENGTH),
                Err(err) => {
                    warn!(url = %request.url, attempt, %err, "content length probe failed");
                    last_err = Some(err);
                }
            }
        }
        Err(TaskError::UrlNotReachable {
            url: request.url.clone(),
            reason: last_err
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no probe attempts".to_string()),
        })
    }

    pub fn get(&self, task_id: &str) -> Result<Arc<RwLock<SeedTask>>, TaskError> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    pub fn exist(&self, task_id: &str) -> Option<Arc<RwLock<SeedTask>>> {
        self.tasks.get(task_id).map(|entry| entry.clone())
    }

    /// Removes the entry; used only by the garbage collector.
    pub fn delete(&self, task_id: &str) {
        self.tasks.remove(task_id);
        self.accessed.remove(task_id);
    }

    /// Snapshot of a task's current state.
    pub fn snapshot(&self, task_id: &str) -> Result<SeedTask, TaskError> {
        Ok(self.get(task_id)?.read().clone())
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Records a consumption of the task for eviction ordering.
    pub fn touch(&self, task_id: &str, now_millis: i64) {
        self.accessed.insert(
            task_id.to_string(),
            AccessRecord {
                last_access_millis: now_millis,
            },
        );
    }

    pub(crate) fn last_access(&self, task_id: &str) -> Option<i64> {
        self.accessed.get(task_id).map(|r| r.last_access_millis)
    }
}
