//! queuectl: a durable, at-least-once background job queue backed by SQLite.

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod metrics;
pub mod store;
pub mod worker;
