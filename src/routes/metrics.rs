use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus metrics scrape endpoint.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every series the server and worker emit.
pub fn describe_metrics() {
    metrics::describe_counter!("docflow_tasks_total", "Tasks finished, by type and outcome");
    metrics::describe_histogram!(
        "docflow_task_duration_seconds",
        "Wall-clock handler time per task"
    );
    metrics::describe_gauge!(
        "docflow_api_calls_in_flight",
        "Model API calls currently holding a limiter permit"
    );
    metrics::describe_counter!(
        "docflow_api_retries_total",
        "Retryable model API failures, by kind"
    );
    metrics::describe_histogram!("docflow_api_cost_usd", "Cost of each successful model call");
    metrics::describe_counter!(
        "docflow_stream_reclaimed_total",
        "Stream entries taken over from idle consumers"
    );
}
