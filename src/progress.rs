//! Progress fan-out between the piece writer and subscribers.
//!
//! At most one producer publishes pieces per task; any number of
//! subscribers watch. A subscriber registered mid-fetch first receives a
//! replay of every already-known piece, then live events. Publishing into a
//! full subscriber channel is bounded by a timeout: the event is dropped
//! for that subscriber, which stays registered and still observes the
//! terminal channel close.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::config::ProgressConfig;
use crate::storage::PieceMetaRecord;
use crate::task::SeedTask;

/// One piece-completion event delivered to subscribers.
pub type PieceEvent = PieceMetaRecord;

struct TaskProgress {
    /// Known pieces ordered by piece number.
    records: BTreeMap<u32, PieceMetaRecord>,
    subscribers: Vec<mpsc::Sender<PieceEvent>>,
}

impl TaskProgress {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            subscribers: Vec::new(),
        }
    }
}

/// Per-task piece-event fan-out.
///
/// The per-task `RwLock` is the ordering boundary: `watch` snapshots the
/// record map under the same exclusion window that `publish_piece` inserts
/// under, so replay events always precede any live event published after
/// the subscription point.
pub struct ProgressBroker {
    tasks: DashMap<String, Arc<RwLock<TaskProgress>>>,
    buffer: usize,
    timeout: Duration,
}

impl ProgressBroker {
    pub fn new(config: &ProgressConfig) -> Self {
        Self {
            tasks: DashMap::new(),
            buffer: config.subscriber_buffer.max(1),
            timeout: config.subscriber_timeout,
        }
    }

    /// Idempotently creates fan-out state for a task.
    pub fn init_progress(&self, task_id: &str) {
        self.tasks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(TaskProgress::new())));
    }

    fn progress_of(&self, task_id: &str) -> Arc<RwLock<TaskProgress>> {
        self.tasks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(TaskProgress::new())))
            .clone()
    }

    /// Attaches a subscriber to the task.
    ///
    /// Already-known pieces are replayed into the channel before any event
    /// published after this call; the channel is sized to hold the full
    /// replay plus the configured live buffer, so the replay happens inside
    /// the same exclusion window that registers the subscriber. If the task
    /// is already done the channel closes right after the replay.
    pub async fn watch(&self, task: &SeedTask) -> mpsc::Receiver<PieceEvent> {
        debug!(task_id = %task.id, "watch seed progress");
        let progress = self.progress_of(&task.id);

        let mut state = progress.write().await;
        let (sender, receiver) = mpsc::channel(self.buffer + state.records.len());
        for record in state.records.values() {
            // capacity covers the whole snapshot
            let _ = sender.try_send(record.clone());
        }
        if !task.is_done() {
            state.subscribers.push(sender);
        }
        drop(state);
        receiver
    }

    /// Records a completed piece and fans it out to the live subscribers.
    ///
    /// The per-task write guard is held across the whole fan-out, so
    /// concurrent publishers (the pipeline runs several persistence
    /// workers) deliver to each subscriber in publish order. A subscriber
    /// that cannot accept the event within the timeout misses it; only
    /// task termination closes channels.
    pub async fn publish_piece(&self, task_id: &str, record: PieceMetaRecord) {
        let progress = self.progress_of(task_id);
        let mut state = progress.write().await;
        state.records.insert(record.piece_num, record.clone());

        let mut deliveries = Vec::with_capacity(state.subscribers.len());
        for sender in &state.subscribers {
            let sender = sender.clone();
            let record = record.clone();
            let timeout = self.timeout;
            let task_id = task_id.to_string();
            deliveries.push(tokio::spawn(async move {
                match tokio::time::timeout(timeout, sender.send(record)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {} // receiver dropped; removed on publish_task
                    Err(_) => {
                        warn!(task_id = %task_id, "piece publish timed out, event dropped")
                    }
                }
            }));
        }
        for delivery in deliveries {
            let _ = delivery.await;
        }
    }

    /// Terminates fan-out for the task: every subscriber channel is closed
    /// exactly once. Must be called once per trigger.
    pub async fn publish_task(&self, task_id: &str) {
        let progress = self.progress_of(task_id);
        let mut state = progress.write().await;
        let drained = std::mem::take(&mut state.subscribers);
        debug!(task_id, subscribers = drained.len(), "publish task, close subscribers");
        drop(state);
        // dropping the senders closes each channel
        drop(drained);
    }

    /// Drops all state for the task; used by the garbage collector.
    pub async fn clear(&self, task_id: &str) {
        if let Some((_, progress)) = self.tasks.remove(task_id) {
            let mut state = progress.write().await;
            state.subscribers.clear();
            state.records.clear();
        }
    }

    /// Known pieces sorted by piece number.
    pub async fn get_pieces(&self, task_id: &str) -> Vec<PieceMetaRecord> {
        // clone the Arc out so no map shard stays locked across the await
        let progress = match self.tasks.get(task_id) {
            Some(entry) => entry.clone(),
            None => return Vec::new(),
        };
        let state = progress.read().await;
        state.records.values().cloned().collect()
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        match self.tasks.get(task_id) {
            Some(progress) => match progress.try_read() {
                Ok(state) => state.subscribers.len(),
                Err(_) => 0,
            },
            None => 0,
        }
    }
}
