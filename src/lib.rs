//! docflow
//!
//! Stream-backed document task processing: tasks are enqueued on Redis
//! Streams, claimed by consumer groups, run through per-type handlers that
//! call a rate-limited, retrying model API, and recorded in PostgreSQL with
//! live progress over Redis pub/sub.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
