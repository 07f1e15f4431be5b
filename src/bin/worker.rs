use docflow::{
    config::AppConfig,
    db::{self, PgResultStore},
    routes::metrics::describe_metrics,
    services::{
        consumer::Worker,
        dispatcher::Dispatcher,
        handlers::register_defaults,
        limiter::ConcurrencyLimiter,
        model_client::HttpModelClient,
        pricing::PriceTable,
        pubsub::{listen_for_cancellations, RedisProgressPublisher},
        queue::RedisTaskStream,
        retry::RetryingClient,
        storage::R2Client,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting docflow worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        describe_metrics();
        tracing::info!(%addr, "Serving metrics");
    }

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let redis = redis::Client::open(config.redis_url.as_str()).expect("Invalid REDIS_URL");
    let stream = RedisTaskStream::new(&config.redis_url).expect("Failed to initialize task streams");
    let publisher = RedisProgressPublisher::connect(&redis)
        .await
        .expect("Failed to connect progress publisher");

    let r2 = config.r2_settings().expect("R2 storage is required by the worker");
    let documents = R2Client::new(&r2.bucket, &r2.endpoint, &r2.access_key, &r2.secret_key)
        .expect("Failed to initialize R2 client");

    let model = HttpModelClient::new(
        config.ai_provider.clone(),
        config.ai_base_url.clone(),
        config.ai_api_key().expect("AI_API_KEY is required by the worker").to_string(),
        config.ai_model.clone(),
        config.request_timeout(),
    )
    .expect("Failed to initialize model client");

    let limiter = ConcurrencyLimiter::new(config.max_concurrent_api_calls);
    let client = RetryingClient::new(
        Arc::new(model),
        limiter,
        config.retry_policy(),
        &PriceTable::default(),
    )
    .expect("AI_PROVIDER has no price table entry");

    let mut dispatcher = Dispatcher::new();
    register_defaults(&mut dispatcher, Arc::new(documents), config.document_limits())
        .expect("Failed to register task handlers");

    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        Arc::new(stream),
        Arc::new(PgResultStore::new(db_pool)),
        Arc::new(publisher),
        Arc::new(dispatcher),
        Arc::new(client),
        config.worker_settings(),
        shutdown.clone(),
    );

    tokio::spawn(listen_for_cancellations(
        redis,
        worker.cancel_registry(),
        shutdown.clone(),
    ));
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received, draining in-flight tasks");
            shutdown.cancel();
        }
    });

    tracing::info!(
        consumer = %worker.settings().consumer_name,
        max_concurrent_api_calls = config.max_concurrent_api_calls,
        "Worker ready"
    );

    worker.run().await.expect("Worker failed to start consumer groups");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
