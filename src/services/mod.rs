pub mod cancel;
pub mod consumer;
pub mod dispatcher;
pub mod handlers;
pub mod limiter;
pub mod memory;
pub mod model_client;
pub mod pricing;
pub mod progress;
pub mod pubsub;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod store;
pub mod task_error;
