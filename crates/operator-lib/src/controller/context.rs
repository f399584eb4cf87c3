//! Shared handle passed to every operator component

use crate::builder::ChildTemplate;
use crate::cache::WatchCache;
use crate::events::{EventRecorder, EventSink};
use crate::health::HealthRegistry;
use crate::observability::{OperatorMetrics, StructuredLogger};
use crate::queue::{RateLimiterConfig, WorkQueue};
use crate::reconciler::ReconcileConfig;
use crate::store::ResourceStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Component name stamped on events and lifecycle logs
pub const COMPONENT: &str = "podmonitor-controller";

/// Everything a reconciliation or worker needs, constructed once at startup
pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub cache: Arc<WatchCache>,
    pub queue: WorkQueue,
    pub recorder: EventRecorder,
    pub metrics: OperatorMetrics,
    pub logger: StructuredLogger,
    pub health: HealthRegistry,
    pub template: ChildTemplate,
    pub reconcile: ReconcileConfig,
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    store: Option<Arc<dyn ResourceStore>>,
    event_sink: Option<Arc<dyn EventSink>>,
    cache: Option<Arc<WatchCache>>,
    health: Option<HealthRegistry>,
    backoff: RateLimiterConfig,
    event_dedup_window: Option<Duration>,
    template: ChildTemplate,
    reconcile: ReconcileConfig,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            event_sink: None,
            cache: None,
            health: None,
            backoff: RateLimiterConfig::default(),
            event_dedup_window: None,
            template: ChildTemplate::default(),
            reconcile: ReconcileConfig::default(),
        }
    }

    /// Set the authoritative resource store
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set where recorded events are published
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Share an existing watch cache instead of creating one
    pub fn cache(mut self, cache: Arc<WatchCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Set the failed-sync backoff bounds
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = RateLimiterConfig {
            base_delay: base,
            max_delay: max,
        };
        self
    }

    pub fn event_dedup_window(mut self, window: Duration) -> Self {
        self.event_dedup_window = Some(window);
        self
    }

    pub fn template(mut self, template: ChildTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn reconcile(mut self, reconcile: ReconcileConfig) -> Self {
        self.reconcile = reconcile;
        self
    }

    pub fn build(self) -> Result<Context> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("Resource store is required"))?;
        let sink = self
            .event_sink
            .ok_or_else(|| anyhow::anyhow!("Event sink is required"))?;

        let mut recorder = EventRecorder::new(sink, COMPONENT);
        if let Some(window) = self.event_dedup_window {
            recorder = recorder.with_dedup_window(window);
        }

        Ok(Context {
            store,
            cache: self.cache.unwrap_or_default(),
            queue: WorkQueue::new("podmonitors", self.backoff),
            recorder,
            metrics: OperatorMetrics::new(),
            logger: StructuredLogger::new(COMPONENT),
            health: self.health.unwrap_or_default(),
            template: self.template,
            reconcile: self.reconcile,
        })
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
