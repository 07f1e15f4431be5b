pub mod api;
pub mod payload;
pub mod progress;
pub mod task;
