//! Live progress events.
//!
//! Publishing is fire-and-forget: a subscriber that is not connected misses
//! the event and reads current status from the result store instead.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::store::ResultStore;
use super::task_error::ErrorKind;
use crate::models::progress::{MessageType, ProgressMessage};
use crate::models::task::Task;

#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    /// Deliver to currently connected subscribers. Failures are logged, never returned.
    async fn publish(&self, message: &ProgressMessage);
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ProgressMessage>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ProgressPublisher for BroadcastPublisher {
    async fn publish(&self, message: &ProgressMessage) {
        // No receivers is not an error.
        let _ = self.tx.send(message.clone());
    }
}

struct ReporterState {
    seq: u64,
    progress: u8,
    step: String,
    finished: bool,
}

/// Emits the ordered progress stream for a single task.
///
/// Progress is clamped to be non-decreasing, every message carries the next
/// sequence number, and nothing is emitted after the terminal message.
pub struct ProgressReporter {
    task_id: Uuid,
    publisher: Arc<dyn ProgressPublisher>,
    store: Arc<dyn ResultStore>,
    started: Instant,
    // Held across publish so sequence order equals delivery order.
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(
        task_id: Uuid,
        publisher: Arc<dyn ProgressPublisher>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            task_id,
            publisher,
            store,
            started: Instant::now(),
            state: Mutex::new(ReporterState {
                seq: 0,
                progress: 0,
                step: "Queued".to_string(),
                finished: false,
            }),
        }
    }

    /// Continue the stream of a task that may have been delivered before:
    /// progress and sequence pick up from the stored record.
    pub fn resume(
        task: &Task,
        publisher: Arc<dyn ProgressPublisher>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let mut reporter = Self::new(task.id, publisher, store);
        {
            let state = reporter.state.get_mut();
            state.seq = task.progress_seq;
            state.progress = task.progress.min(100);
            if let Some(step) = &task.current_step {
                state.step = step.clone();
            }
        }
        reporter
    }

    pub async fn update(&self, progress: u8, step: &str) {
        let mut state = self.state.lock().await;
        if state.finished {
            return;
        }
        let progress = progress.min(100).max(state.progress);
        state.progress = progress;
        state.step = step.to_string();
        state.seq += 1;

        if let Err(e) = self
            .store
            .record_progress(self.task_id, progress, step, state.seq)
            .await
        {
            tracing::warn!(task_id = %self.task_id, error = %e, "Failed to persist progress");
        }

        let message = self.message(&state, MessageType::ProgressUpdate);
        self.publisher.publish(&message).await;
    }

    pub async fn complete(&self, result_summary: serde_json::Value) {
        let mut state = self.state.lock().await;
        if state.finished {
            return;
        }
        state.finished = true;
        state.progress = 100;
        state.step = "Completed".to_string();
        state.seq += 1;

        let mut message = self.message(&state, MessageType::TaskComplete);
        message.result_summary = Some(result_summary);
        self.publisher.publish(&message).await;
    }

    /// Terminal failure or cancellation. Progress stays at its last value.
    pub async fn fail(&self, kind: ErrorKind, error: String) {
        let mut state = self.state.lock().await;
        if state.finished {
            return;
        }
        state.finished = true;
        state.step = if kind == ErrorKind::Cancelled {
            "Cancelled".to_string()
        } else {
            "Failed".to_string()
        };
        state.seq += 1;

        let mut message = self.message(&state, MessageType::TaskError);
        message.error = Some(error);
        message.error_kind = Some(kind);
        self.publisher.publish(&message).await;
    }

    /// Whether the stored record carries a cancel request. Store errors read
    /// as "not requested".
    pub async fn cancel_requested(&self) -> bool {
        match self.store.get(self.task_id).await {
            Ok(task) => task.is_some_and(|task| task.cancel_requested),
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "Failed to read cancel flag");
                false
            }
        }
    }

    pub async fn current(&self) -> (u8, String) {
        let state = self.state.lock().await;
        (state.progress, state.step.clone())
    }

    fn message(&self, state: &ReporterState, kind: MessageType) -> ProgressMessage {
        ProgressMessage {
            task_id: self.task_id,
            kind,
            seq: state.seq,
            progress: state.progress,
            current_step: state.step.clone(),
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            result_summary: None,
            error: None,
            error_kind: None,
        }
    }
}

/// Compact view of a result for the terminal progress message.
///
/// Scalars are kept (long strings truncated), arrays and objects become counts.
pub fn summarize(result: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    const MAX_TEXT: usize = 200;

    let brief = |value: &Value| match value {
        Value::String(s) if s.chars().count() > MAX_TEXT => {
            let mut cut: String = s.chars().take(MAX_TEXT).collect();
            cut.push('…');
            Value::String(cut)
        }
        Value::Array(items) => serde_json::json!({ "count": items.len() }),
        Value::Object(map) => serde_json::json!({ "fields": map.len() }),
        other => other.clone(),
    };

    match result {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), brief(value)))
                .collect(),
        ),
        other => brief(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::TaskType;
    use crate::services::memory::MemoryResultStore;
    use serde_json::json;

    fn reporter(publisher: &BroadcastPublisher) -> ProgressReporter {
        ProgressReporter::new(
            Uuid::new_v4(),
            Arc::new(publisher.clone()),
            Arc::new(MemoryResultStore::new()),
        )
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let publisher = BroadcastPublisher::new(16);
        let mut rx = publisher.subscribe();
        let reporter = reporter(&publisher);

        reporter.update(40, "Extracting").await;
        reporter.update(20, "Late event").await;

        assert_eq!(rx.recv().await.unwrap().progress, 40);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.progress, 40);
        assert_eq!(second.seq, 2);
    }

    #[tokio::test]
    async fn resumed_reporter_continues_sequence_and_progress() {
        let publisher = BroadcastPublisher::new(16);
        let mut rx = publisher.subscribe();
        let store = Arc::new(MemoryResultStore::new());
        let mut task = Task::new(Uuid::new_v4(), TaskType::Parse, json!({}));
        store.create(&task).await.unwrap();
        task = store.begin(task.id).await.unwrap().unwrap();

        let first = ProgressReporter::resume(&task, Arc::new(publisher.clone()), store.clone());
        first.update(20, "Loading").await;
        first.update(40, "Extracting").await;

        // Redelivery: a new reporter built from the stored record.
        let task = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.progress_seq, 2);
        let second = ProgressReporter::resume(&task, Arc::new(publisher.clone()), store.clone());
        second.update(20, "Loading").await;
        second.complete(json!({})).await;

        let seen: Vec<(u64, u8)> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| (m.seq, m.progress))
            .collect();
        assert_eq!(seen, vec![(1, 20), (2, 40), (3, 40), (4, 100)]);
    }

    #[tokio::test]
    async fn nothing_follows_the_terminal_message() {
        let publisher = BroadcastPublisher::new(16);
        let mut rx = publisher.subscribe();
        let reporter = reporter(&publisher);

        reporter.update(70, "Validating").await;
        reporter.fail(ErrorKind::Timeout, "please retry".into()).await;
        reporter.update(90, "Too late").await;
        reporter.complete(json!({})).await;

        assert_eq!(rx.recv().await.unwrap().kind, MessageType::ProgressUpdate);
        let terminal = rx.recv().await.unwrap();
        assert_eq!(terminal.kind, MessageType::TaskError);
        assert_eq!(terminal.progress, 70);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn summary_collapses_collections() {
        let summary = summarize(&json!({
            "fields": { "a": 1, "b": 2 },
            "issues": [1, 2, 3],
            "title": "Quarterly report",
        }));
        assert_eq!(summary["issues"]["count"], 3);
        assert_eq!(summary["fields"]["fields"], 2);
        assert_eq!(summary["title"], "Quarterly report");
    }
}
