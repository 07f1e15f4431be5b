//! In-process implementations of the storage seams.
//!
//! They honour the same contracts as the Redis and Postgres backends
//! (competing consumers, pending claims, idempotent terminal writes) and back
//! the hermetic pipeline tests and single-process local runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::queue::{QueueError, StreamEntry, TaskStream};
use super::storage::{Document, DocumentSource, StorageError};
use super::store::{CancelRequest, ResultStore, StoreError};
use super::task_error::{ErrorKind, TaskError};
use crate::models::task::{Task, TaskOutcome, TaskStatus};

/// An entry claimed by a consumer and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingClaim {
    pub group: String,
    pub consumer: String,
    pub entry_id: String,
    pub claimed_at: Instant,
    pub deliveries: u64,
}

#[derive(Default)]
struct Group {
    next_index: usize,
    pending: HashMap<String, PendingClaim>,
    acks: HashMap<String, u32>,
}

#[derive(Default)]
struct Stream {
    entries: Vec<(String, HashMap<String, String>)>,
    groups: HashMap<String, Group>,
    next_seq: u64,
}

impl Stream {
    fn fields(&self, entry_id: &str) -> Option<HashMap<String, String>> {
        self.entries
            .iter()
            .find(|(id, _)| id == entry_id)
            .map(|(_, fields)| fields.clone())
    }
}

/// Numeric order of a "{seq}-0" entry id.
fn entry_seq(entry_id: &str) -> u64 {
    entry_id
        .split('-')
        .next()
        .and_then(|seq| seq.parse().ok())
        .unwrap_or(u64::MAX)
}

#[derive(Default)]
pub struct MemoryTaskStream {
    streams: Mutex<HashMap<String, Stream>>,
    arrivals: Notify,
}

impl MemoryTaskStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims currently held in `group`.
    pub fn pending_claims(&self, stream: &str, group: &str) -> Vec<PendingClaim> {
        let streams = self.lock();
        let mut claims: Vec<PendingClaim> = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.values().cloned().collect())
            .unwrap_or_default();
        claims.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));
        claims
    }

    /// How many times `entry_id` has been acknowledged in `group`.
    pub fn ack_count(&self, stream: &str, group: &str, entry_id: &str) -> u32 {
        self.lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.acks.get(entry_id).copied())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Stream>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_new(
        &self,
        stream_name: &str,
        group_name: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let mut streams = self.lock();
        let no_group = || QueueError::NoGroup {
            stream: stream_name.to_string(),
            group: group_name.to_string(),
        };
        let stream = streams.get_mut(stream_name).ok_or_else(no_group)?;
        let group = stream.groups.get_mut(group_name).ok_or_else(no_group)?;

        let start = group.next_index;
        let end = (start + count).min(stream.entries.len());
        group.next_index = end;

        let now = Instant::now();
        Ok(stream.entries[start..end]
            .iter()
            .map(|(entry_id, fields)| {
                group.pending.insert(
                    entry_id.clone(),
                    PendingClaim {
                        group: group_name.to_string(),
                        consumer: consumer.to_string(),
                        entry_id: entry_id.clone(),
                        claimed_at: now,
                        deliveries: 1,
                    },
                );
                StreamEntry {
                    stream: stream_name.to_string(),
                    entry_id: entry_id.clone(),
                    fields: fields.clone(),
                    delivery_count: 1,
                }
            })
            .collect())
    }
}

#[async_trait]
impl TaskStream for MemoryTaskStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        self.lock()
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn enqueue(&self, stream: &str, fields: &[(String, String)]) -> Result<String, QueueError> {
        let id = {
            let mut streams = self.lock();
            let stream = streams.entry(stream.to_string()).or_default();
            stream.next_seq += 1;
            let id = format!("{}-0", stream.next_seq);
            stream
                .entries
                .push((id.clone(), fields.iter().cloned().collect()));
            id
        };
        self.arrivals.notify_waiters();
        Ok(id)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let deadline = Instant::now() + block;
        loop {
            // Register for wakeups before looking, so an enqueue in between is not missed.
            let arrived = self.arrivals.notified();
            let entries = self.take_new(stream, group, consumer, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn reclaim(
        &self,
        stream_name: &str,
        group_name: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let mut streams = self.lock();
        let Some(stream) = streams.get_mut(stream_name) else {
            return Ok(Vec::new());
        };
        let mut stale: Vec<String> = match stream.groups.get(group_name) {
            Some(group) => group
                .pending
                .values()
                .filter(|claim| claim.claimed_at.elapsed() >= min_idle)
                .map(|claim| claim.entry_id.clone())
                .collect(),
            None => return Ok(Vec::new()),
        };
        stale.sort_by_key(|id| entry_seq(id));
        stale.truncate(count);

        let now = Instant::now();
        let mut entries = Vec::with_capacity(stale.len());
        for entry_id in stale {
            let Some(fields) = stream.fields(&entry_id) else {
                continue;
            };
            let Some(claim) = stream
                .groups
                .get_mut(group_name)
                .and_then(|g| g.pending.get_mut(&entry_id))
            else {
                continue;
            };
            claim.consumer = consumer.to_string();
            claim.claimed_at = now;
            claim.deliveries += 1;
            entries.push(StreamEntry {
                stream: stream_name.to_string(),
                entry_id,
                fields,
                delivery_count: claim.deliveries,
            });
        }
        Ok(entries)
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        entry_id: &str,
    ) -> Result<(), QueueError> {
        let mut streams = self.lock();
        if let Some(claim) = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.get_mut(entry_id))
        {
            claim.consumer = consumer.to_string();
            claim.claimed_at = Instant::now();
        }
        Ok(())
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), QueueError> {
        let mut streams = self.lock();
        if let Some(group) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            group.pending.remove(entry_id);
            *group.acks.entry(entry_id.to_string()).or_default() += 1;
        }
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<u64, QueueError> {
        Ok(self
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryResultStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Task>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        self.lock().entry(task.id).or_insert_with(|| task.clone());
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.lock().get(&task_id).cloned())
    }

    async fn begin(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if !task.cancel_requested && task.status.can_transition_to(TaskStatus::Processing) {
            task.status = TaskStatus::Processing;
            task.started_at.get_or_insert_with(Utc::now);
        }
        Ok(Some(task.clone()))
    }

    async fn record_progress(
        &self,
        task_id: Uuid,
        progress: u8,
        step: &str,
        seq: u64,
    ) -> Result<(), StoreError> {
        if let Some(task) = self.lock().get_mut(&task_id) {
            if task.status == TaskStatus::Processing {
                task.progress = task.progress.max(progress);
                task.current_step = Some(step.to_string());
                task.progress_seq = task.progress_seq.max(seq);
            }
        }
        Ok(())
    }

    async fn save_result(&self, outcome: &TaskOutcome) -> Result<bool, StoreError> {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&outcome.task_id) else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = outcome.status;
        task.result = outcome.result.clone();
        task.error = outcome.error.clone();
        task.error_kind = outcome.error_kind;
        task.cost = outcome.accounting.cost;
        task.tokens_in = outcome.accounting.tokens_in;
        task.tokens_out = outcome.accounting.tokens_out;
        task.duration_secs = outcome.duration_secs;
        if outcome.status == TaskStatus::Completed {
            task.progress = 100;
        }
        task.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn request_cancel(&self, task_id: Uuid) -> Result<Option<CancelRequest>, StoreError> {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        let cancelled_now = task.status == TaskStatus::Pending;
        match task.status {
            TaskStatus::Pending => {
                task.status = TaskStatus::Cancelled;
                task.error = Some(TaskError::Cancelled.user_message());
                task.error_kind = Some(ErrorKind::Cancelled);
                task.completed_at = Some(Utc::now());
            }
            TaskStatus::Processing => task.cancel_requested = true,
            _ => {}
        }
        Ok(Some(CancelRequest {
            task: task.clone(),
            cancelled_now,
        }))
    }
}

/// Documents held in memory, keyed by file reference.
#[derive(Default)]
pub struct MemoryDocuments {
    documents: Mutex<HashMap<String, Document>>,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file_ref: &str, bytes: impl Into<Vec<u8>>, content_type: Option<&str>) {
        let document = Document {
            file_ref: file_ref.to_string(),
            bytes: bytes.into(),
            content_type: content_type.map(str::to_string),
        };
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(file_ref.to_string(), document);
    }
}

#[async_trait]
impl DocumentSource for MemoryDocuments {
    async fn fetch(&self, file_ref: &str) -> Result<Document, StorageError> {
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(file_ref)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(file_ref.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::{Accounting, TaskType};
    use serde_json::json;

    const STREAM: &str = "docflow:tasks:parse";
    const GROUP: &str = "workers";

    fn fields(n: u32) -> Vec<(String, String)> {
        vec![("n".to_string(), n.to_string())]
    }

    #[tokio::test]
    async fn competing_consumers_receive_disjoint_entries() {
        let stream = MemoryTaskStream::new();
        stream.ensure_group(STREAM, GROUP).await.unwrap();
        for n in 0..4 {
            stream.enqueue(STREAM, &fields(n)).await.unwrap();
        }

        let a = stream
            .claim(STREAM, GROUP, "a", 2, Duration::ZERO)
            .await
            .unwrap();
        let b = stream
            .claim(STREAM, GROUP, "b", 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        assert!(a.iter().all(|e| b.iter().all(|o| o.entry_id != e.entry_id)));
        assert_eq!(stream.pending(STREAM, GROUP).await.unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_claim_wakes_on_enqueue() {
        let stream = std::sync::Arc::new(MemoryTaskStream::new());
        stream.ensure_group(STREAM, GROUP).await.unwrap();

        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream
                    .claim(STREAM, GROUP, "a", 1, Duration::from_secs(30))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        stream.enqueue(STREAM, &fields(1)).await.unwrap();

        assert_eq!(waiter.await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn claim_times_out_empty() {
        let stream = MemoryTaskStream::new();
        stream.ensure_group(STREAM, GROUP).await.unwrap();
        let entries = stream
            .claim(STREAM, GROUP, "a", 1, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_claims_become_reclaimable_after_window() {
        let stream = MemoryTaskStream::new();
        stream.ensure_group(STREAM, GROUP).await.unwrap();
        stream.enqueue(STREAM, &fields(1)).await.unwrap();
        stream
            .claim(STREAM, GROUP, "crashed", 1, Duration::ZERO)
            .await
            .unwrap();

        let window = Duration::from_secs(60);
        let early = stream.reclaim(STREAM, GROUP, "b", window, 10).await.unwrap();
        assert!(early.is_empty());

        tokio::time::advance(window).await;
        let taken = stream.reclaim(STREAM, GROUP, "b", window, 10).await.unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].delivery_count, 2);
        assert_eq!(stream.pending_claims(STREAM, GROUP)[0].consumer, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn touch_keeps_a_live_claim() {
        let stream = MemoryTaskStream::new();
        stream.ensure_group(STREAM, GROUP).await.unwrap();
        let id = stream.enqueue(STREAM, &fields(1)).await.unwrap();
        stream.claim(STREAM, GROUP, "a", 1, Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        stream.touch(STREAM, GROUP, "a", &id).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;

        let taken = stream
            .reclaim(STREAM, GROUP, "b", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(taken.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn live_older_claim_does_not_hide_a_stale_one() {
        let stream = MemoryTaskStream::new();
        stream.ensure_group(STREAM, GROUP).await.unwrap();
        let live = stream.enqueue(STREAM, &fields(1)).await.unwrap();
        let stale = stream.enqueue(STREAM, &fields(2)).await.unwrap();
        stream.claim(STREAM, GROUP, "live", 1, Duration::ZERO).await.unwrap();
        stream.claim(STREAM, GROUP, "crashed", 1, Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        stream.touch(STREAM, GROUP, "live", &live).await.unwrap();

        let taken = stream
            .reclaim(STREAM, GROUP, "b", Duration::from_secs(60), 1)
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].entry_id, stale);
    }

    #[test]
    fn entry_ids_order_numerically() {
        let mut ids = vec!["10-0".to_string(), "9-0".to_string(), "100-0".to_string()];
        ids.sort_by_key(|id| entry_seq(id));
        assert_eq!(ids, ["9-0", "10-0", "100-0"]);
    }

    #[tokio::test]
    async fn claim_without_group_fails() {
        let stream = MemoryTaskStream::new();
        let err = stream
            .claim(STREAM, GROUP, "a", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NoGroup { .. }));
    }

    #[tokio::test]
    async fn terminal_write_happens_once() {
        let store = MemoryResultStore::new();
        let task = Task::new(Uuid::new_v4(), TaskType::Parse, json!({}));
        store.create(&task).await.unwrap();
        store.begin(task.id).await.unwrap();

        let charged = Accounting {
            cost: 0.5,
            tokens_in: 10,
            tokens_out: 10,
            calls: 1,
        };
        let first = TaskOutcome::completed(task.id, json!({ "ok": true }), charged, 1.0);
        assert!(store.save_result(&first).await.unwrap());

        let again = TaskOutcome::completed(task.id, json!({ "ok": false }), charged, 2.0);
        assert!(!store.save_result(&again).await.unwrap());

        let saved = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(saved.result, Some(json!({ "ok": true })));
        assert_eq!(saved.cost, 0.5);
    }

    #[tokio::test]
    async fn cancelling_pending_task_is_immediate() {
        let store = MemoryResultStore::new();
        let task = Task::new(Uuid::new_v4(), TaskType::Edit, json!({}));
        store.create(&task).await.unwrap();

        let cancelled = store.request_cancel(task.id).await.unwrap().unwrap();
        assert!(cancelled.cancelled_now);
        assert_eq!(cancelled.task.status, TaskStatus::Cancelled);

        let again = store.request_cancel(task.id).await.unwrap().unwrap();
        assert!(!again.cancelled_now);
        assert_eq!(again.task.status, TaskStatus::Cancelled);

        let begun = store.begin(task.id).await.unwrap().unwrap();
        assert_eq!(begun.status, TaskStatus::Cancelled);
    }
}
