//! Worker pool: N concurrent worker loops sharing one store and one stop flag.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::WorkerSettings;
use crate::executor::Executor;
use crate::store::JobStore;
use crate::worker::worker_loop::{WorkerLoop, WorkerStats};

/// Cloneable handle for requesting a graceful stop from another task,
/// such as a signal handler.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask every worker to exit once it is idle.
    pub fn request_stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Totals across all workers of one `start` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub workers: usize,
    pub completed: u64,
    pub failed: u64,
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    executor: Arc<Executor>,
    settings: WorkerSettings,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn JobStore>, settings: WorkerSettings) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            executor: Arc::new(Executor::new()),
            settings,
            stop_tx: Arc::new(stop_tx),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Ask every worker to exit once it is idle.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Launch `count` workers and block until all of them have stopped.
    ///
    /// Clears any earlier stop request first. In-flight jobs always finish
    /// and are reported before their worker exits.
    pub async fn start(&self, count: usize) -> PoolReport {
        self.stop_tx.send_replace(false);
        let count = count.max(1);
        info!(count, "Starting workers");

        let handles: Vec<_> = (1..=count)
            .map(|id| {
                let worker = WorkerLoop::new(
                    id,
                    Arc::clone(&self.store),
                    Arc::clone(&self.executor),
                    self.settings.clone(),
                    self.stop_tx.subscribe(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let mut report = PoolReport {
            workers: count,
            ..Default::default()
        };
        for result in join_all(handles).await {
            match result {
                Ok(WorkerStats { completed, failed }) => {
                    report.completed += completed;
                    report.failed += failed;
                }
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }

        info!(
            completed = report.completed,
            failed = report.failed,
            "All workers stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::jobs::NewJob;
    use crate::store::LibSqlBackend;

    fn fast_settings(dir: &tempfile::TempDir) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(20),
            default_timeout: Duration::from_secs(5),
            default_backoff_base: 2,
            logs_dir: dir.path().join("logs"),
        }
    }

    #[tokio::test]
    async fn start_blocks_until_stop() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let pool = Arc::new(WorkerPool::new(store, fast_settings(&dir)));
        let stop = pool.stop_handle();

        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.start(3).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!runner.is_finished());
        assert!(!stop.is_stop_requested());

        stop.request_stop();
        let report = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.workers, 3);
        assert_eq!(report.completed, 0);
    }

    #[tokio::test]
    async fn start_clears_previous_stop_request() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store.enqueue(&NewJob::new("a", "true")).await.unwrap();

        let pool = Arc::new(WorkerPool::new(Arc::clone(&store), fast_settings(&dir)));
        pool.request_stop();
        assert!(pool.stop_handle().is_stop_requested());

        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.start(1).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.stats().await.unwrap().completed < 1 {
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.request_stop();
        let report = runner.await.unwrap();
        assert_eq!(report.completed, 1);
    }
}
