//! Shared fakes and a hermetic worker harness for pipeline tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use docflow::models::progress::ProgressMessage;
use docflow::models::task::{Task, TaskType};
use docflow::services::consumer::{ProcessOutcome, Worker, WorkerSettings};
use docflow::services::dispatcher::Dispatcher;
use docflow::services::handlers::{
    edit::EditHandler, generate::GenerateHandler, parse::ParseHandler, review::ReviewHandler,
    DocumentLimits, TaskHandler,
};
use docflow::services::limiter::ConcurrencyLimiter;
use docflow::services::memory::{MemoryDocuments, MemoryResultStore, MemoryTaskStream};
use docflow::services::model_client::{ApiError, ModelClient, ModelRequest, ModelResponse};
use docflow::services::pricing::PriceTable;
use docflow::services::progress::BroadcastPublisher;
use docflow::services::queue::{entry_fields, stream_name, StreamEntry, TaskStream, DEFAULT_GROUP};
use docflow::services::retry::{RetryPolicy, RetryingClient};
use docflow::services::store::ResultStore;

pub const PARSE_REPLY: &str = r#"{"title": "Invoice 42", "total": 1250.0, "due_date": null}"#;

/// Timing of one model call as seen by the fake.
#[derive(Debug, Clone, Copy)]
pub struct CallRecord {
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// Scripted model: replies are consumed in order, then the fallback repeats.
pub struct FakeModel {
    script: Mutex<VecDeque<Result<ModelResponse, ApiError>>>,
    fallback: Result<ModelResponse, ApiError>,
    delay: Duration,
    calls: Mutex<Vec<CallRecord>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeModel {
    pub fn replying(text: &str, tokens_in: u64, tokens_out: u64) -> Self {
        Self::with_fallback(Ok(ModelResponse {
            text: text.to_string(),
            tokens_in,
            tokens_out,
        }))
    }

    pub fn failing(error: ApiError) -> Self {
        Self::with_fallback(Err(error))
    }

    fn with_fallback(fallback: Result<ModelResponse, ApiError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then(self, reply: Result<ModelResponse, ApiError>) -> Self {
        self.script.lock().unwrap().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a> {
    model: &'a FakeModel,
    index: usize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.model.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.model.calls.lock().unwrap()[self.index].finished = Some(Instant::now());
    }
}

#[async_trait]
impl ModelClient for FakeModel {
    fn provider(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, _request: &ModelRequest) -> Result<ModelResponse, ApiError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(CallRecord {
                started: Instant::now(),
                finished: None,
            });
            calls.len() - 1
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight { model: self, index };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

pub struct HarnessBuilder {
    model: FakeModel,
    limiter: usize,
    policy: RetryPolicy,
    settings: WorkerSettings,
    overrides: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HarnessBuilder {
    pub fn model(mut self, model: FakeModel) -> Self {
        self.model = model;
        self
    }

    pub fn limiter(mut self, capacity: usize) -> Self {
        self.limiter = capacity;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn cost_ceiling(mut self, ceiling: f64) -> Self {
        self.settings.cost_ceiling = ceiling;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.settings.task_timeout = timeout;
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.settings.visibility_timeout = timeout;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.overrides.insert(handler.task_type(), handler);
        self
    }

    pub async fn build(mut self) -> Harness {
        let stream = Arc::new(MemoryTaskStream::new());
        let store = Arc::new(MemoryResultStore::new());
        let publisher = BroadcastPublisher::new(1024);
        let documents = Arc::new(MemoryDocuments::new());
        let model = Arc::new(self.model);

        let limits = DocumentLimits::default();
        let defaults: Vec<Arc<dyn TaskHandler>> = vec![
            Arc::new(ParseHandler::new(documents.clone(), limits)),
            Arc::new(EditHandler::new(documents.clone(), limits)),
            Arc::new(ReviewHandler::new(documents.clone(), limits)),
            Arc::new(GenerateHandler),
        ];
        let mut dispatcher = Dispatcher::new();
        for handler in defaults {
            let task_type = handler.task_type();
            let handler = self.overrides.remove(&task_type).unwrap_or(handler);
            dispatcher
                .register(task_type, stream_name(task_type), DEFAULT_GROUP, handler)
                .unwrap();
        }
        for (stream_key, group) in dispatcher.consumer_groups() {
            stream.ensure_group(&stream_key, &group).await.unwrap();
        }

        let client = RetryingClient::new(
            model.clone(),
            ConcurrencyLimiter::new(self.limiter),
            self.policy,
            &PriceTable::default(),
        )
        .unwrap();
        let client = Arc::new(client);
        let dispatcher = Arc::new(dispatcher);
        let shutdown = CancellationToken::new();

        let worker = Worker::new(
            stream.clone(),
            store.clone(),
            Arc::new(publisher.clone()),
            dispatcher.clone(),
            client.clone(),
            self.settings.clone(),
            shutdown.clone(),
        );

        Harness {
            stream,
            store,
            publisher,
            documents,
            model,
            client,
            dispatcher,
            settings: self.settings,
            worker,
            shutdown,
        }
    }
}

pub struct Harness {
    pub stream: Arc<MemoryTaskStream>,
    pub store: Arc<MemoryResultStore>,
    pub publisher: BroadcastPublisher,
    pub documents: Arc<MemoryDocuments>,
    pub model: Arc<FakeModel>,
    pub client: Arc<RetryingClient>,
    pub dispatcher: Arc<Dispatcher>,
    pub settings: WorkerSettings,
    pub worker: Worker,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            model: FakeModel::replying(PARSE_REPLY, 1000, 500),
            limiter: 2,
            policy: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(10),
            },
            settings: WorkerSettings {
                consumer_name: "test-worker".to_string(),
                claim_block: Duration::from_millis(100),
                ..WorkerSettings::default()
            },
            overrides: HashMap::new(),
        }
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }

    /// A second worker sharing this harness's backends, as another process would.
    pub fn second_worker(&self, consumer_name: &str) -> (Worker, CancellationToken) {
        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            self.stream.clone(),
            self.store.clone(),
            Arc::new(self.publisher.clone()),
            self.dispatcher.clone(),
            self.client.clone(),
            WorkerSettings {
                consumer_name: consumer_name.to_string(),
                ..self.settings.clone()
            },
            shutdown.clone(),
        );
        (worker, shutdown)
    }

    pub fn add_document(&self, file_ref: &str) {
        self.documents
            .insert(file_ref, b"%PDF-1.7 test document".to_vec(), Some("application/pdf"));
    }

    /// Create the record and enqueue the entry, as the API does.
    pub async fn submit(&self, task_type: TaskType, payload: serde_json::Value) -> Uuid {
        let task = Task::new(Uuid::new_v4(), task_type, payload);
        self.store.create(&task).await.unwrap();
        self.stream
            .enqueue(
                &stream_name(task_type),
                &entry_fields(task.id, task_type, &task.payload),
            )
            .await
            .unwrap();
        task.id
    }

    pub async fn submit_parse(&self) -> Uuid {
        self.add_document("docs/invoice.pdf");
        self.submit(
            TaskType::Parse,
            serde_json::json!({ "file_ref": "docs/invoice.pdf" }),
        )
        .await
    }

    pub async fn claim(&self, task_type: TaskType, consumer: &str) -> StreamEntry {
        let mut entries = self
            .stream
            .claim(
                &stream_name(task_type),
                DEFAULT_GROUP,
                consumer,
                1,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1, "expected one entry on {task_type} stream");
        entries.remove(0)
    }

    pub async fn process(&self, entry: StreamEntry) -> ProcessOutcome {
        self.worker.process(DEFAULT_GROUP, entry).await
    }

    /// Claim the next entry of `task_type` and process it.
    pub async fn run_next(&self, task_type: TaskType) -> ProcessOutcome {
        let entry = self.claim(task_type, "test-worker").await;
        self.process(entry).await
    }

    pub async fn task(&self, task_id: Uuid) -> Task {
        self.store.get(task_id).await.unwrap().expect("task record")
    }

    pub fn pending(&self, task_type: TaskType) -> usize {
        self.stream
            .pending_claims(&stream_name(task_type), DEFAULT_GROUP)
            .len()
    }
}

/// Everything already published for `task_id`.
pub fn drain_messages(
    rx: &mut broadcast::Receiver<ProgressMessage>,
    task_id: Uuid,
) -> Vec<ProgressMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if message.task_id == task_id {
            messages.push(message);
        }
    }
    messages
}
