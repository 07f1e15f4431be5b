//! Stream consumer loops.
//!
//! One loop runs per (stream, group) pair. Each loop sweeps for stale claims,
//! blocks on new entries, and hands every entry to a bounded pool of task
//! runs. An entry is acknowledged only after its terminal state is saved;
//! anything else leaves it pending for redelivery.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::cancel::{CancelRegistry, CancelScope};
use super::dispatcher::Dispatcher;
use super::handlers::TaskContext;
use super::progress::{summarize, ProgressPublisher, ProgressReporter};
use super::queue::{QueueError, StreamEntry, TaskStream};
use super::retry::{Ledger, RetryingClient};
use super::store::ResultStore;
use super::task_error::{ErrorKind, TaskError};
use crate::models::task::{Accounting, Task, TaskOutcome, TaskStatus};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Runtime settings for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub consumer_name: String,
    /// Entries requested per claim.
    pub claim_count: usize,
    pub claim_block: Duration,
    /// Idle time after which another consumer may take over a claim.
    pub visibility_timeout: Duration,
    /// Deliveries after which an entry is failed outright.
    pub max_deliveries: u64,
    /// Task runs in flight per process, across all loops.
    pub concurrency: usize,
    pub task_timeout: Duration,
    pub cost_ceiling: f64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            consumer_name: format!("worker-{}", Uuid::new_v4().simple()),
            claim_count: 1,
            claim_block: Duration::from_millis(5000),
            visibility_timeout: Duration::from_secs(300),
            max_deliveries: 5,
            concurrency: 4,
            task_timeout: Duration::from_secs(900),
            cost_ceiling: 1.0,
        }
    }
}

/// What happened to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Terminal state saved and the entry acknowledged.
    Finished {
        status: TaskStatus,
        error_kind: Option<ErrorKind>,
    },
    /// The task was already terminal; the entry was re-acknowledged.
    AlreadyTerminal,
    /// The entry could not be tied to a task and was acknowledged.
    Discarded,
    /// Left pending for redelivery (shutdown or store failure).
    Deferred,
}

#[derive(Clone)]
pub struct Worker {
    stream: Arc<dyn TaskStream>,
    store: Arc<dyn ResultStore>,
    publisher: Arc<dyn ProgressPublisher>,
    dispatcher: Arc<Dispatcher>,
    client: Arc<RetryingClient>,
    settings: Arc<WorkerSettings>,
    cancels: CancelRegistry,
    shutdown: CancellationToken,
    slots: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        stream: Arc<dyn TaskStream>,
        store: Arc<dyn ResultStore>,
        publisher: Arc<dyn ProgressPublisher>,
        dispatcher: Arc<Dispatcher>,
        client: Arc<RetryingClient>,
        settings: WorkerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            stream,
            store,
            publisher,
            dispatcher,
            client,
            settings: Arc::new(settings),
            cancels: CancelRegistry::new(),
            shutdown,
            slots,
        }
    }

    /// Registry of running tasks, for delivering cancel requests.
    pub fn cancel_registry(&self) -> CancelRegistry {
        self.cancels.clone()
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Run every consumer loop until shutdown, then wait for in-flight tasks.
    pub async fn run(&self) -> Result<(), QueueError> {
        let groups = self.dispatcher.consumer_groups();
        for (stream, group) in &groups {
            self.stream.ensure_group(stream, group).await?;
        }

        tracing::info!(
            consumer = %self.settings.consumer_name,
            loops = groups.len(),
            concurrency = self.settings.concurrency,
            "Worker started"
        );

        let mut loops = JoinSet::new();
        for (stream, group) in groups {
            let worker = self.clone();
            loops.spawn(async move { worker.consume(stream, group).await });
        }
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Consumer loop aborted");
            }
        }

        tracing::info!(consumer = %self.settings.consumer_name, "Worker stopped");
        Ok(())
    }

    /// Claim and process entries from one stream until shutdown.
    pub async fn consume(&self, stream: String, group: String) {
        let span = tracing::info_span!("consumer", %stream, %group);
        async {
            let mut running = JoinSet::new();

            loop {
                while let Some(joined) = running.try_join_next() {
                    log_join_error(joined);
                }

                let slot = tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    slot = self.slots.clone().acquire_owned() => match slot {
                        Ok(slot) => slot,
                        Err(_) => break,
                    },
                };
                let want = self
                    .settings
                    .claim_count
                    .min(self.slots.available_permits() + 1)
                    .max(1);

                let entries = match self.next_entries(&stream, &group, want).await {
                    Ok(Some(entries)) => entries,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read from stream, backing off");
                        drop(slot);
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                        }
                    }
                };

                let mut slot = Some(slot);
                for entry in entries {
                    let permit = match slot.take() {
                        Some(permit) => permit,
                        None => match self.slots.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let worker = self.clone();
                    let group = group.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        worker.process(&group, entry).await
                    });
                }
            }

            if !running.is_empty() {
                tracing::info!(in_flight = running.len(), "Draining in-flight tasks");
            }
            while let Some(joined) = running.join_next().await {
                log_join_error(joined);
            }
        }
        .instrument(span)
        .await
    }

    /// Stale claims first, then new entries. `None` once shutdown fires.
    async fn next_entries(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Option<Vec<StreamEntry>>, QueueError> {
        let consumer = &self.settings.consumer_name;

        let reclaimed = self
            .stream
            .reclaim(stream, group, consumer, self.settings.visibility_timeout, count)
            .await?;
        if !reclaimed.is_empty() {
            tracing::warn!(count = reclaimed.len(), "Reclaimed stale entries");
            metrics::counter!("docflow_stream_reclaimed_total", "stream" => stream.to_string())
                .increment(reclaimed.len() as u64);
            return Ok(Some(reclaimed));
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            claimed = self.stream.claim(stream, group, consumer, count, self.settings.claim_block) => {
                claimed.map(Some)
            }
        }
    }

    /// Process one claimed entry through to a terminal state and ack.
    ///
    /// Never panics and never propagates a handler failure: every path ends in
    /// an acknowledged terminal state or a deliberate deferral.
    pub async fn process(&self, group: &str, entry: StreamEntry) -> ProcessOutcome {
        let span = tracing::info_span!(
            "task",
            entry_id = %entry.entry_id,
            stream = %entry.stream,
            delivery = entry.delivery_count,
            task_id = tracing::field::Empty,
        );
        self.process_entry(group, entry).instrument(span).await
    }

    async fn process_entry(&self, group: &str, entry: StreamEntry) -> ProcessOutcome {
        let started = Instant::now();

        let task_id = match entry.task_id() {
            Ok(task_id) => task_id,
            Err(e) => {
                tracing::error!(error = %e, "Discarding malformed entry");
                self.ack(group, &entry).await;
                return ProcessOutcome::Discarded;
            }
        };
        tracing::Span::current().record("task_id", tracing::field::display(task_id));

        // Registered before the record is read, so a cancel published while
        // the task is being loaded still reaches it.
        let registration = self.cancels.register(task_id);

        let task = match self.load_task(task_id, &entry).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::error!("Entry has no task record and no usable type; discarding");
                self.ack(group, &entry).await;
                return ProcessOutcome::Discarded;
            }
            Err(outcome) => return outcome,
        };

        if task.status.is_terminal() {
            tracing::info!(status = %task.status, "Task already terminal, re-acknowledging");
            self.ack(group, &entry).await;
            return ProcessOutcome::AlreadyTerminal;
        }

        let reporter = Arc::new(ProgressReporter::resume(
            &task,
            self.publisher.clone(),
            self.store.clone(),
        ));
        let label = task.task_type.to_string();

        if entry.delivery_count > self.settings.max_deliveries {
            tracing::error!(
                max_deliveries = self.settings.max_deliveries,
                "Entry exceeded delivery attempts"
            );
            let failure = TaskError::Internal(format!(
                "exceeded {} delivery attempts",
                self.settings.max_deliveries
            ));
            return self
                .finish(
                    group,
                    &entry,
                    task_id,
                    &label,
                    Err(failure),
                    Accounting::default(),
                    started,
                    &reporter,
                )
                .await;
        }

        if task.cancel_requested {
            return self
                .finish(
                    group,
                    &entry,
                    task_id,
                    &label,
                    Err(TaskError::Cancelled),
                    Accounting::default(),
                    started,
                    &reporter,
                )
                .await;
        }

        let (result, accounting) = self
            .run_handler(task_id, &entry, &reporter, registration.token())
            .await;

        if matches!(result, Err(TaskError::Interrupted)) {
            tracing::warn!("Task interrupted by shutdown; leaving entry for redelivery");
            return ProcessOutcome::Deferred;
        }

        self.finish(group, &entry, task_id, &label, result, accounting, started, &reporter)
            .await
    }

    /// Move the task into processing, creating the record if the entry was
    /// enqueued without one.
    async fn load_task(
        &self,
        task_id: Uuid,
        entry: &StreamEntry,
    ) -> Result<Option<Task>, ProcessOutcome> {
        match self.store.begin(task_id).await {
            Ok(Some(task)) => return Ok(Some(task)),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "Failed to load task record; leaving entry pending");
                return Err(ProcessOutcome::Deferred);
            }
        }

        let Ok(task_type) = entry.task_type() else {
            return Ok(None);
        };
        let payload = entry
            .payload()
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));
        let task = Task::new(task_id, task_type, payload);

        let begun = async {
            self.store.create(&task).await?;
            self.store.begin(task_id).await
        };
        match begun.await {
            Ok(task) => Ok(task),
            Err(e) => {
                tracing::error!(error = %e, "Failed to create task record; leaving entry pending");
                Err(ProcessOutcome::Deferred)
            }
        }
    }

    async fn run_handler(
        &self,
        task_id: Uuid,
        entry: &StreamEntry,
        reporter: &Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> (Result<serde_json::Value, TaskError>, Accounting) {
        let task_type = match entry.task_type() {
            Ok(task_type) => task_type,
            Err(e) => return (Err(TaskError::InvalidInput(e.to_string())), Accounting::default()),
        };
        let payload = match entry.payload() {
            Ok(payload) => payload,
            Err(e) => return (Err(TaskError::InvalidInput(e.to_string())), Accounting::default()),
        };
        let route = match self.dispatcher.route(task_type) {
            Ok(route) => route,
            Err(e) => return (Err(TaskError::InvalidInput(e.to_string())), Accounting::default()),
        };
        if route.stream != entry.stream {
            tracing::warn!(expected = %route.stream, "Entry arrived on an unexpected stream");
        }

        let scope = CancelScope::new(self.shutdown.clone(), cancel.clone());
        let ledger = Arc::new(Ledger::new(self.settings.cost_ceiling));
        let ctx = TaskContext::new(
            task_id,
            Uuid::new_v4().to_string(),
            self.client.clone(),
            ledger.clone(),
            reporter.clone(),
            scope,
        );
        let _heartbeat = self.heartbeat(route.group.clone(), entry, task_id, cancel);

        tracing::info!(task_type = %task_type, trace_id = ctx.trace_id(), "Processing task");

        let timeout = self.settings.task_timeout;
        let run = AssertUnwindSafe(route.handler.handle(&ctx, &payload)).catch_unwind();
        let result = match tokio::time::timeout(timeout, run).await {
            Err(_) => Err(TaskError::TimedOut(timeout)),
            Ok(Err(panic)) => Err(TaskError::Internal(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Ok(Ok(result)) => result,
        };

        (result, ledger.snapshot())
    }

    /// Keep our claim fresh while the task runs, and pick up cancel requests
    /// that reached the store without reaching this process.
    fn heartbeat(
        &self,
        group: String,
        entry: &StreamEntry,
        task_id: Uuid,
        cancel: CancellationToken,
    ) -> Heartbeat {
        let period = (self.settings.visibility_timeout / 3).max(Duration::from_millis(10));
        let store = self.store.clone();
        let stream = self.stream.clone();
        let stream_name = entry.stream.clone();
        let entry_id = entry.entry_id.clone();
        let consumer = self.settings.consumer_name.clone();

        Heartbeat(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if let Err(e) = stream.touch(&stream_name, &group, &consumer, &entry_id).await {
                    tracing::warn!(%entry_id, error = %e, "Failed to refresh claim");
                }
                match store.get(task_id).await {
                    Ok(Some(task)) if task.cancel_requested && !cancel.is_cancelled() => {
                        tracing::info!(%task_id, "Cancel request found in store");
                        cancel.cancel();
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(%task_id, error = %e, "Failed to read cancel flag"),
                }
            }
        }))
    }

    /// Save the terminal state, publish it, and acknowledge.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        group: &str,
        entry: &StreamEntry,
        task_id: Uuid,
        task_type: &str,
        result: Result<serde_json::Value, TaskError>,
        accounting: Accounting,
        started: Instant,
        reporter: &ProgressReporter,
    ) -> ProcessOutcome {
        let duration = started.elapsed().as_secs_f64();

        let outcome = match &result {
            Ok(value) => TaskOutcome::completed(task_id, value.clone(), accounting, duration),
            Err(e) => {
                match e.kind() {
                    ErrorKind::Internal
                    | ErrorKind::TransientExhausted
                    | ErrorKind::Unauthorized
                    | ErrorKind::QuotaExceeded => {
                        tracing::error!(error = %e, kind = %e.kind(), "Task failed")
                    }
                    ErrorKind::Cancelled => tracing::info!("Task cancelled"),
                    _ => tracing::warn!(error = %e, kind = %e.kind(), "Task failed"),
                }
                TaskOutcome::failed(task_id, e.kind(), e.user_message(), accounting, duration)
            }
        };

        match self.store.save_result(&outcome).await {
            Ok(true) => match &outcome.result {
                Some(value) => reporter.complete(summarize(value)).await,
                None => {
                    let kind = outcome.error_kind.unwrap_or(ErrorKind::Internal);
                    reporter.fail(kind, outcome.error.clone().unwrap_or_default()).await;
                }
            },
            Ok(false) => {
                tracing::info!("Task reached a terminal state elsewhere; keeping that result");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to save task result; leaving entry pending");
                return ProcessOutcome::Deferred;
            }
        }

        let outcome_label = match outcome.status {
            TaskStatus::Completed => "completed".to_string(),
            TaskStatus::Cancelled => "cancelled".to_string(),
            _ => outcome
                .error_kind
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "failed".to_string()),
        };
        metrics::counter!(
            "docflow_tasks_total",
            "type" => task_type.to_string(),
            "outcome" => outcome_label
        )
        .increment(1);
        metrics::histogram!("docflow_task_duration_seconds", "type" => task_type.to_string())
            .record(duration);

        tracing::info!(
            status = %outcome.status,
            cost = accounting.cost,
            tokens_in = accounting.tokens_in,
            tokens_out = accounting.tokens_out,
            duration_secs = duration,
            "Task finished"
        );

        self.ack(group, entry).await;
        ProcessOutcome::Finished {
            status: outcome.status,
            error_kind: outcome.error_kind,
        }
    }

    async fn ack(&self, group: &str, entry: &StreamEntry) {
        if let Err(e) = self.stream.ack(&entry.stream, group, &entry.entry_id).await {
            // The entry will be redelivered and re-acknowledged.
            tracing::error!(error = %e, "Failed to acknowledge entry");
        }
    }
}

/// Aborts the heartbeat when the task run ends, however it ends.
struct Heartbeat(JoinHandle<()>);

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_join_error(joined: Result<ProcessOutcome, tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Task run aborted");
    }
}
