//! Worker pool driving reconciliations
//!
//! Workers start only after the watch cache has synced, each running
//! `get -> sync -> done` until the queue shuts down. Keys that fail with a
//! retryable error go back with backoff; the rest are forgotten.

mod context;
#[cfg(test)]
mod tests;

pub use context::{Context, ContextBuilder, COMPONENT};

use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::health::components;
use crate::observability::ReconcileResult;
use crate::reconciler::{Action, Reconciler};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default number of concurrent workers
pub const DEFAULT_WORKERS: usize = 2;

pub struct Controller {
    ctx: Arc<Context>,
    reconciler: Arc<Reconciler>,
    workers: usize,
}

impl Controller {
    pub fn new(ctx: Arc<Context>, workers: usize) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(ctx.clone())),
            ctx,
            workers: workers.max(1),
        }
    }

    /// Dispatcher feeding this controller's cache and queue
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.ctx.cache.clone(), self.ctx.queue.clone())
    }

    /// Run the worker pool until `shutdown` fires.
    ///
    /// Returns [`Error::CacheSyncAborted`] if shutdown arrives before the
    /// watch cache has synced.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), Error> {
        let health = &self.ctx.health;
        for name in components::ALL {
            health.register(name).await;
        }
        health
            .set_degraded(components::WATCH_CACHE, "waiting for initial sync")
            .await;

        info!("Waiting for watch cache to sync");
        tokio::select! {
            _ = self.ctx.cache.wait_for_sync() => {}
            _ = shutdown.recv() => {
                self.ctx.queue.shutdown().await;
                warn!("Shutdown before watch cache synced");
                return Err(Error::CacheSyncAborted);
            }
        }
        health.set_healthy(components::WATCH_CACHE).await;
        health.set_synced(true).await;

        info!(workers = self.workers, "Starting reconcile workers");
        let handles: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|id| {
                let ctx = self.ctx.clone();
                let reconciler = self.reconciler.clone();
                tokio::spawn(async move { worker(id, ctx, reconciler).await })
            })
            .collect();

        // a closed channel means every sender is gone; treat it as shutdown
        let _ = shutdown.recv().await;
        info!("Shutting down reconcile workers");

        self.ctx.queue.shutdown().await;
        health
            .set_unhealthy(components::QUEUE, "queue shut down")
            .await;

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task failed");
            }
        }
        health
            .set_unhealthy(components::WORKERS, "workers stopped")
            .await;

        info!("All reconcile workers stopped");
        Ok(())
    }
}

async fn worker(id: usize, ctx: Arc<Context>, reconciler: Arc<Reconciler>) {
    debug!(worker = id, "Worker started");
    while process_next(&ctx, &reconciler).await {}
    debug!(worker = id, "Worker stopped");
}

/// Reconcile one key; false once the queue has shut down
pub(crate) async fn process_next(ctx: &Context, reconciler: &Reconciler) -> bool {
    let Some(key) = ctx.queue.get().await else {
        return false;
    };

    ctx.metrics.worker_started();
    let start = Instant::now();
    let result = reconciler.sync(&key).await;
    let outcome = handle_result(ctx, &key, result).await;
    ctx.metrics.observe_reconcile(start.elapsed(), outcome);
    ctx.metrics.worker_finished();

    ctx.queue.done(&key).await;
    ctx.metrics.set_queue_depth(ctx.queue.len().await);
    true
}

async fn handle_result(ctx: &Context, key: &str, result: Result<Action, Error>) -> ReconcileResult {
    match result {
        Ok(action) => {
            ctx.queue.forget(key);
            ctx.health.set_healthy(components::STORE).await;
            if let Action::Requeue(delay) = action {
                ctx.queue.add_after(key.to_string(), delay).await;
            }
            ReconcileResult::Success
        }
        Err(e) if e.is_retryable() => {
            let delay = ctx.queue.add_rate_limited(key).await;
            ctx.metrics.inc_queue_retries();
            ctx.logger
                .log_sync_error(key, &e.to_string(), delay, ctx.queue.num_requeues(key));
            if matches!(e, Error::Store { .. }) {
                ctx.health
                    .set_degraded(components::STORE, e.to_string())
                    .await;
            }
            ReconcileResult::Retry
        }
        Err(e) => {
            ctx.queue.forget(key);
            ctx.logger.log_dropped_key(key, &e.to_string());
            ReconcileResult::Dropped
        }
    }
}
