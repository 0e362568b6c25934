//! Router Registry: one routing context per `(room, worker)` pair,
//! created lazily on the first operation that needs that worker.

use crate::engine::{CodecCapability, RouterHandle};
use crate::error::Result;
use crate::worker_pool::WorkerPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Lazily creates and caches routers for one room. Creation goes
/// through an async mutex so two handlers racing on the same worker
/// index both end up with the single router created first.
pub struct RouterRegistry {
    pool: Arc<WorkerPool>,
    codecs: Vec<CodecCapability>,
    routers: Mutex<HashMap<usize, Arc<dyn RouterHandle>>>,
}

impl RouterRegistry {
    pub fn new(pool: Arc<WorkerPool>, codecs: Vec<CodecCapability>) -> Self {
        Self {
            pool,
            codecs,
            routers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the router for `worker_index`, creating it on first use.
    pub async fn get_or_create(&self, worker_index: usize) -> Result<Arc<dyn RouterHandle>> {
        let mut routers = self.routers.lock().await;
        if let Some(router) = routers.get(&worker_index) {
            return Ok(Arc::clone(router));
        }

        let worker = self.pool.get(worker_index)?;
        let router = worker.create_router(&self.codecs).await?;
        debug!(worker = worker_index, router = %router.id(), "router created");
        routers.insert(worker_index, Arc::clone(&router));
        Ok(router)
    }

    /// Router for `worker_index` if one was already created.
    pub async fn get(&self, worker_index: usize) -> Option<Arc<dyn RouterHandle>> {
        self.routers.lock().await.get(&worker_index).cloned()
    }

    /// Any existing router, preferring the lowest worker index. Used to
    /// replay capabilities on duplicate join.
    pub async fn any(&self) -> Option<Arc<dyn RouterHandle>> {
        let routers = self.routers.lock().await;
        routers
            .keys()
            .min()
            .copied()
            .and_then(|index| routers.get(&index).cloned())
    }

    /// Close every router and drop the cache. Called once at room
    /// teardown.
    pub async fn close_all(&self) {
        let routers: Vec<_> = self.routers.lock().await.drain().collect();
        for (worker_index, router) in routers {
            debug!(worker = worker_index, router = %router.id(), "closing router");
            router.close().await;
        }
    }
}
