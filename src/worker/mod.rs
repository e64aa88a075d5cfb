//! Worker side of the queue: the per-worker loop and the pool that runs
//! several of them concurrently.

pub mod pool;
pub mod worker_loop;

pub use pool::{PoolReport, StopHandle, WorkerPool};
pub use worker_loop::{BACKOFF_BASE_KEY, WorkerLoop, WorkerStats};
