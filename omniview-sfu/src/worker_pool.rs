//! Worker Pool Manager: a fixed pool of media-engine worker handles,
//! created once at startup and addressed by stable index.
//!
//! A worker that terminates unexpectedly is fatal for the whole
//! service: there is no replacement or room migration. The default
//! fatal handler exits the process; tests inject their own.

use crate::engine::{MediaEngine, ResourceUsage, WorkerHandle, WorkerSettings};
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info};

/// Invoked with `(worker_index, pid)` when a worker dies.
pub type FatalHandler = Arc<dyn Fn(usize, u32) + Send + Sync>;

pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    workers: OnceCell<Vec<Arc<dyn WorkerHandle>>>,
    on_fatal: FatalHandler,
}

impl WorkerPool {
    /// Pool with the fail-fast default: log and exit the process.
    pub fn new(engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        Self::with_fatal_handler(
            engine,
            Arc::new(|index, pid| {
                error!(worker = index, pid, "media worker died, terminating service");
                std::process::exit(1);
            }),
        )
    }

    pub fn with_fatal_handler(engine: Arc<dyn MediaEngine>, on_fatal: FatalHandler) -> Arc<Self> {
        Arc::new(Self {
            engine,
            workers: OnceCell::new(),
            on_fatal,
        })
    }

    /// Create `count` workers exactly once. Subsequent (and concurrent)
    /// calls are no-ops that observe the first initialization.
    pub async fn initialize(self: &Arc<Self>, count: usize, settings: &WorkerSettings) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidInput("worker count must be at least 1".into()));
        }

        self.workers
            .get_or_try_init(|| async {
                let mut workers = Vec::with_capacity(count);
                for index in 0..count {
                    let worker = self
                        .engine
                        .create_worker(settings)
                        .await
                        .map_err(Error::from)?;
                    info!(worker = index, pid = worker.pid(), "media worker created");
                    self.watch_worker(index, Arc::clone(&worker));
                    workers.push(worker);
                }
                info!(count, "worker pool ready");
                Ok::<_, Error>(workers)
            })
            .await?;

        Ok(())
    }

    fn watch_worker(self: &Arc<Self>, index: usize, worker: Arc<dyn WorkerHandle>) {
        let on_fatal = Arc::clone(&self.on_fatal);
        tokio::spawn(async move {
            worker.died().await;
            error!(worker = index, pid = worker.pid(), "media worker terminated unexpectedly");
            on_fatal(index, worker.pid());
        });
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.workers.initialized()
    }

    /// Number of workers, 0 before initialization.
    #[must_use]
    pub fn count(&self) -> usize {
        self.workers.get().map_or(0, Vec::len)
    }

    pub fn get(&self, index: usize) -> Result<Arc<dyn WorkerHandle>> {
        let workers = self.workers.get().ok_or(Error::NotReady)?;
        workers
            .get(index)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("worker {index}")))
    }

    /// Per-worker CPU usage for diagnostics. Workers that fail the
    /// query are skipped.
    pub async fn resource_usage(&self) -> Vec<(usize, ResourceUsage)> {
        let Some(workers) = self.workers.get() else {
            return Vec::new();
        };
        let mut usage = Vec::with_capacity(workers.len());
        for (index, worker) in workers.iter().enumerate() {
            if let Ok(stats) = worker.resource_usage().await {
                usage.push((index, stats));
            }
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: 3100,
            rtc_max_port: 3300,
            log_level: "warn".to_string(),
        }
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let engine = MockEngine::new();
        let pool = WorkerPool::with_fatal_handler(engine.clone(), Arc::new(|_, _| {}));

        pool.initialize(3, &settings()).await.expect("first init");
        assert_eq!(pool.count(), 3);

        // A second call must not create more workers.
        pool.initialize(5, &settings()).await.expect("second init");
        assert_eq!(pool.count(), 3);
        assert_eq!(engine.workers_created(), 3);
    }

    #[tokio::test]
    async fn get_before_initialize_is_not_ready() {
        let engine = MockEngine::new();
        let pool = WorkerPool::with_fatal_handler(engine, Arc::new(|_, _| {}));
        assert!(!pool.is_ready());
        assert!(matches!(pool.get(0), Err(Error::NotReady)));
    }

    #[tokio::test]
    async fn get_out_of_range_is_not_found() {
        let engine = MockEngine::new();
        let pool = WorkerPool::with_fatal_handler(engine, Arc::new(|_, _| {}));
        pool.initialize(2, &settings()).await.expect("init");
        assert!(pool.get(1).is_ok());
        assert!(matches!(pool.get(2), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn worker_death_invokes_fatal_handler() {
        let engine = MockEngine::new();
        let deaths = Arc::new(AtomicUsize::new(0));
        let deaths_clone = Arc::clone(&deaths);
        let pool = WorkerPool::with_fatal_handler(
            engine.clone(),
            Arc::new(move |_, _| {
                deaths_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        pool.initialize(2, &settings()).await.expect("init");

        engine.kill_worker(1);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(deaths.load(Ordering::SeqCst), 1);
    }
}
