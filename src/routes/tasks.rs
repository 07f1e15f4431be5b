use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{CancelTaskResponse, ErrorResponse, SubmitTaskRequest, SubmitTaskResponse};
use crate::models::payload::validate_for;
use crate::models::progress::{MessageType, ProgressMessage};
use crate::models::task::{Accounting, Task, TaskOutcome, TaskStatus};
use crate::services::progress::ProgressReporter;
use crate::services::pubsub;
use crate::services::queue::{entry_fields, stream_name, QueueError};
use crate::services::store::StoreError;
use crate::services::task_error::ErrorKind;

/// JSON error response with a status code.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(task_id: Uuid) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("task {task_id} not found"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "Result store request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "task store unavailable")
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        tracing::error!(error = %e, "Stream request failed");
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "task queue unavailable")
    }
}

/// POST /api/v1/tasks: Create a task and enqueue it on its type's stream.
pub async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), AppError> {
    validate_for(request.task_type, &request.payload)
        .map_err(|e| AppError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    let task = Task::new(Uuid::new_v4(), request.task_type, request.payload);
    state.store.create(&task).await?;

    let stream = stream_name(task.task_type);
    let fields = entry_fields(task.id, task.task_type, &task.payload);
    let entry_id = match state.queue.enqueue(&stream, &fields).await {
        Ok(entry_id) => entry_id,
        Err(e) => {
            // The record would otherwise stay pending with nothing to run it.
            let outcome = TaskOutcome::failed(
                task.id,
                ErrorKind::Internal,
                "The task could not be queued. Please retry.".to_string(),
                Accounting::default(),
                0.0,
            );
            if let Err(save_err) = state.store.save_result(&outcome).await {
                tracing::error!(task_id = %task.id, error = %save_err, "Failed to mark unqueued task");
            }
            return Err(e.into());
        }
    };

    tracing::info!(
        task_id = %task.id,
        task_type = %task.task_type,
        %stream,
        %entry_id,
        "Task submitted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitTaskResponse {
            task_id: task.id,
            status: task.status,
            entry_id,
        }),
    ))
}

/// GET /api/v1/tasks/{task_id}: Current task record.
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    let task = state
        .store
        .get(task_id)
        .await?
        .ok_or_else(|| AppError::not_found(task_id))?;
    Ok(Json(task))
}

/// POST /api/v1/tasks/{task_id}/cancel: Cancel a pending or running task.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<CancelTaskResponse>, AppError> {
    let request = state
        .store
        .request_cancel(task_id)
        .await?
        .ok_or_else(|| AppError::not_found(task_id))?;
    let task = request.task;

    match task.status {
        TaskStatus::Processing => {
            if let Err(e) = pubsub::publish_cancel(&state.redis, task_id).await {
                // The flag is still set, so a redelivery will not run the task.
                tracing::warn!(%task_id, error = %e, "Failed to signal cancel to workers");
            }
        }
        // No worker will pick this task up, so the terminal message is ours.
        TaskStatus::Cancelled if request.cancelled_now => {
            ProgressReporter::resume(&task, state.publisher.clone(), state.store.clone())
                .fail(ErrorKind::Cancelled, task.error.clone().unwrap_or_default())
                .await;
        }
        TaskStatus::Cancelled => {}
        finished => {
            return Err(AppError::new(
                StatusCode::CONFLICT,
                format!("task {task_id} already {finished}"),
            ))
        }
    }

    tracing::info!(%task_id, status = %task.status, "Cancel requested");
    Ok(Json(CancelTaskResponse {
        task_id,
        status: task.status,
        cancel_requested: task.cancel_requested || task.status == TaskStatus::Cancelled,
    }))
}

fn snapshot_event(task: &Task) -> Event {
    Event::default()
        .event("snapshot")
        .data(serde_json::to_string(task).unwrap_or_default())
}

fn progress_event(message: &ProgressMessage) -> Event {
    let name = match message.kind {
        MessageType::ProgressUpdate => "progress_update",
        MessageType::TaskComplete => "task_complete",
        MessageType::TaskError => "task_error",
    };
    Event::default()
        .event(name)
        .id(message.seq.to_string())
        .data(serde_json::to_string(message).unwrap_or_default())
}

/// GET /api/v1/tasks/{task_id}/events: Snapshot, then live progress until terminal.
pub async fn task_events(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let mut snapshot = state
        .store
        .get(task_id)
        .await?
        .ok_or_else(|| AppError::not_found(task_id))?;

    let live = if snapshot.status.is_terminal() {
        None
    } else {
        let live = pubsub::subscribe_progress(&state.redis, task_id).await?;
        // Re-read now that we are subscribed, so no step falls in between.
        snapshot = state
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| AppError::not_found(task_id))?;
        (!snapshot.status.is_terminal()).then_some(live)
    };

    let events = async_stream::stream! {
        yield Ok(snapshot_event(&snapshot));

        if let Some(live) = live {
            futures::pin_mut!(live);
            while let Some(message) = live.next().await {
                let terminal = message.is_terminal();
                yield Ok(progress_event(&message));
                if terminal {
                    break;
                }
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::{MemoryResultStore, MemoryTaskStream};
    use crate::services::progress::BroadcastPublisher;
    use crate::services::queue::TaskStream;
    use crate::services::store::ResultStore;
    use serde_json::json;
    use std::sync::Arc;

    fn state() -> (AppState, Arc<MemoryResultStore>, Arc<MemoryTaskStream>) {
        let store = Arc::new(MemoryResultStore::new());
        let queue = Arc::new(MemoryTaskStream::new());
        let publisher = Arc::new(BroadcastPublisher::new(16));
        let redis = redis::Client::open("redis://127.0.0.1:6379/").unwrap();
        (
            AppState::new(store.clone(), queue.clone(), publisher, redis),
            store,
            queue,
        )
    }

    fn parse_request() -> SubmitTaskRequest {
        serde_json::from_value(json!({
            "type": "parse",
            "payload": { "file_ref": "docs/invoice.pdf" }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn submit_creates_record_and_entry() {
        let (state, store, queue) = state();

        let (status, Json(response)) = submit_task(State(state), Json(parse_request()))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        let task = store.get(response.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let stream = stream_name(task.task_type);
        queue.ensure_group(&stream, "g").await.unwrap();
        let _ = queue
            .claim(&stream, "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(queue.pending(&stream, "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected() {
        let (state, _, _) = state();
        let request: SubmitTaskRequest = serde_json::from_value(json!({
            "type": "edit",
            "payload": { "file_ref": "docs/a.docx" }
        }))
        .unwrap();

        let err = submit_task(State(state), Json(request)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (state, _, _) = state();
        let err = get_task(State(state), Path(Uuid::new_v4())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pending_task_cancels_immediately() {
        let (state, store, _) = state();
        let (_, Json(submitted)) = submit_task(State(state.clone()), Json(parse_request()))
            .await
            .unwrap();

        let Json(response) = cancel_task(State(state.clone()), Path(submitted.task_id))
            .await
            .unwrap();
        assert_eq!(response.status, TaskStatus::Cancelled);

        let task = store.get(submitted.task_id).await.unwrap().unwrap();
        assert_eq!(task.error_kind, Some(ErrorKind::Cancelled));

        let err = cancel_task(State(state), Path(submitted.task_id)).await;
        assert!(err.is_ok(), "cancelling twice is harmless");
    }

    #[tokio::test]
    async fn cancelling_pending_task_publishes_one_terminal_message() {
        let (_, store, queue) = state();
        let publisher = Arc::new(BroadcastPublisher::new(16));
        let redis = redis::Client::open("redis://127.0.0.1:6379/").unwrap();
        let state = AppState::new(store.clone(), queue, publisher.clone(), redis);
        let mut rx = publisher.subscribe();

        let (_, Json(submitted)) = submit_task(State(state.clone()), Json(parse_request()))
            .await
            .unwrap();
        cancel_task(State(state.clone()), Path(submitted.task_id))
            .await
            .unwrap();
        cancel_task(State(state), Path(submitted.task_id))
            .await
            .unwrap();

        let message = rx.try_recv().unwrap();
        assert_eq!(message.task_id, submitted.task_id);
        assert_eq!(message.kind, MessageType::TaskError);
        assert_eq!(message.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(message.seq, 1);
        assert!(message.error.is_some());
        assert!(rx.try_recv().is_err(), "a repeated cancel publishes nothing");
    }

    #[tokio::test]
    async fn finished_task_cannot_be_cancelled() {
        let (state, store, _) = state();
        let task = Task::new(Uuid::new_v4(), crate::models::task::TaskType::Generate, json!({}));
        store.create(&task).await.unwrap();
        store.begin(task.id).await.unwrap();
        store
            .save_result(&TaskOutcome::completed(task.id, json!({}), Accounting::default(), 1.0))
            .await
            .unwrap();

        let err = cancel_task(State(state), Path(task.id)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }
}
