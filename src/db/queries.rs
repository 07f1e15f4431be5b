use std::str::FromStr;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::task::{Task, TaskOutcome, TaskStatus, TaskType};
use crate::services::store::{CancelRequest, StoreError};
use crate::services::task_error::{ErrorKind, TaskError};

const TASK_COLUMNS: &str = "id, task_type, payload, status, progress, current_step, progress_seq, result, error, \
     error_kind, cost, tokens_in, tokens_out, duration_secs, cancel_requested, created_at, \
     started_at, completed_at";

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let corrupt = |detail: String| StoreError::Corrupt { task_id: id, detail };

    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    let progress: i16 = row.try_get("progress")?;
    let tokens_in: i64 = row.try_get("tokens_in")?;
    let tokens_out: i64 = row.try_get("tokens_out")?;
    let progress_seq: i64 = row.try_get("progress_seq")?;

    Ok(Task {
        id,
        task_type: TaskType::from_str(&task_type)
            .map_err(|_| corrupt(format!("unknown task type {task_type:?}")))?,
        payload: row.try_get("payload")?,
        status: TaskStatus::from_str(&status)
            .map_err(|_| corrupt(format!("unknown status {status:?}")))?,
        progress: progress.clamp(0, 100) as u8,
        current_step: row.try_get("current_step")?,
        progress_seq: progress_seq.max(0) as u64,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        error_kind: error_kind
            .map(|kind| {
                ErrorKind::from_str(&kind).map_err(|_| corrupt(format!("unknown error kind {kind:?}")))
            })
            .transpose()?,
        cost: row.try_get("cost")?,
        tokens_in: tokens_in.max(0) as u64,
        tokens_out: tokens_out.max(0) as u64,
        duration_secs: row.try_get("duration_secs")?,
        cancel_requested: row.try_get("cancel_requested")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// Insert a new pending task. An existing id is left untouched.
pub async fn insert_task(pool: &PgPool, task: &Task) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO tasks (id, task_type, payload, status, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(task.id)
    .bind(task.task_type.to_string())
    .bind(&task.payload)
    .bind(task.status.to_string())
    .bind(task.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a task by ID
pub async fn get_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Task>, StoreError> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(task_from_row).transpose()
}

/// Enter processing unless terminal or cancel-requested, returning the current record.
pub async fn begin_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Task>, StoreError> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'processing',
            started_at = COALESCE(started_at, NOW()),
            updated_at = NOW()
        WHERE id = $1
          AND status IN ('pending', 'processing')
          AND NOT cancel_requested
        "#,
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    get_task(pool, task_id).await
}

/// Progress snapshot; never lowers stored progress or sequence.
pub async fn update_progress(
    pool: &PgPool,
    task_id: Uuid,
    progress: u8,
    step: &str,
    seq: u64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET progress = GREATEST(progress, $2),
            current_step = $3,
            progress_seq = GREATEST(progress_seq, $4),
            updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(task_id)
    .bind(i16::from(progress.min(100)))
    .bind(step)
    .bind(i64::try_from(seq).unwrap_or(i64::MAX))
    .execute(pool)
    .await?;

    Ok(())
}

/// Terminal write. Returns false if the task was already terminal.
pub async fn save_result(pool: &PgPool, outcome: &TaskOutcome) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = $2,
            result = $3,
            error = $4,
            error_kind = $5,
            cost = $6,
            tokens_in = $7,
            tokens_out = $8,
            duration_secs = $9,
            progress = CASE WHEN $2 = 'completed' THEN 100 ELSE progress END,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
          AND status NOT IN ('completed', 'failed', 'cancelled')
        "#,
    )
    .bind(outcome.task_id)
    .bind(outcome.status.to_string())
    .bind(&outcome.result)
    .bind(&outcome.error)
    .bind(outcome.error_kind.map(|kind| kind.to_string()))
    .bind(outcome.accounting.cost)
    .bind(outcome.accounting.tokens_in as i64)
    .bind(outcome.accounting.tokens_out as i64)
    .bind(outcome.duration_secs)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Cancel a pending task, or flag a processing one for its worker.
pub async fn request_cancel(
    pool: &PgPool,
    task_id: Uuid,
) -> Result<Option<CancelRequest>, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        WITH prior AS (
            SELECT id AS prior_id, status AS prior_status
            FROM tasks
            WHERE id = $1
            FOR UPDATE
        )
        UPDATE tasks
        SET status = CASE WHEN status = 'pending' THEN 'cancelled' ELSE status END,
            error = CASE WHEN status = 'pending' THEN $2 ELSE error END,
            error_kind = CASE WHEN status = 'pending' THEN 'cancelled' ELSE error_kind END,
            completed_at = CASE WHEN status = 'pending' THEN NOW() ELSE completed_at END,
            cancel_requested = cancel_requested OR status = 'processing',
            updated_at = NOW()
        FROM prior
        WHERE tasks.id = prior.prior_id
        RETURNING {TASK_COLUMNS}, prior.prior_status
        "#
    ))
    .bind(task_id)
    .bind(TaskError::Cancelled.user_message())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let task = task_from_row(&row)?;
    let prior_status: String = row.try_get("prior_status")?;
    Ok(Some(CancelRequest {
        cancelled_now: prior_status == "pending" && task.status == TaskStatus::Cancelled,
        task,
    }))
}
