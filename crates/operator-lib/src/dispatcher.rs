//! Watch → queue bridge
//!
//! Applies store watch events to the [`WatchCache`] and turns them into
//! queue keys. This is the only place where a pod event is routed to the
//! PodMonitor it concerns. The dispatcher never writes to the store.

use crate::cache::WatchCache;
use crate::error::StoreError;
use crate::models::{MonitorResource, ObjectKey, Pod, KIND};
use crate::queue::WorkQueue;
use crate::store::{WatchEvent, WatchObject, WatchSource};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

/// Delay between attempts to list the watch source
const RELIST_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Subscriber to changes of objects of type `K`
#[async_trait]
pub trait EventHandler<K: Send + Sync>: Send + Sync {
    async fn on_add(&self, object: &K);

    /// `old` is the cached copy the update replaces, if one was cached
    async fn on_update(&self, old: Option<&K>, new: &K);

    async fn on_delete(&self, object: &K);
}

/// Routes watch events into the work queue
#[derive(Clone)]
pub struct Dispatcher {
    cache: Arc<WatchCache>,
    queue: WorkQueue,
}

impl Dispatcher {
    pub fn new(cache: Arc<WatchCache>, queue: WorkQueue) -> Self {
        Self { cache, queue }
    }

    /// Queue key of the PodMonitor a pod event concerns, if any.
    ///
    /// A pod controlled by a PodMonitor routes to its owner; a pod named like
    /// a cached PodMonitor is that resource's monitored target.
    fn route_pod(&self, pod: &Pod) -> Option<ObjectKey> {
        if let Some(owner) = pod.metadata.controller_ref().filter(|o| o.kind == KIND) {
            let owner_key = ObjectKey::new(pod.metadata.namespace.clone(), owner.name.clone());
            if self.cache.contains_monitor(&owner_key) {
                return Some(owner_key);
            }
            warn!(
                pod = %pod.key(),
                owner = %owner_key,
                "Ignoring orphaned pod: owning PodMonitor not found"
            );
            return None;
        }

        let key = pod.key();
        if self.cache.contains_monitor(&key) {
            return Some(key);
        }
        trace!(pod = %key, "Pod not related to any PodMonitor");
        None
    }

    async fn enqueue(&self, key: ObjectKey) {
        self.queue.add(key.to_string()).await;
    }

    /// Apply one watch event to the cache and dispatch it
    pub async fn handle(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(WatchObject::Monitor(resource)) => {
                match self.cache.apply_monitor(resource.clone()) {
                    Some(old) => {
                        EventHandler::<MonitorResource>::on_update(self, Some(&old), &resource)
                            .await
                    }
                    None => EventHandler::<MonitorResource>::on_add(self, &resource).await,
                }
            }
            WatchEvent::Modified(WatchObject::Monitor(resource)) => {
                let old = self.cache.apply_monitor(resource.clone());
                EventHandler::<MonitorResource>::on_update(self, old.as_ref(), &resource).await;
            }
            WatchEvent::Deleted(WatchObject::Monitor(resource)) => {
                self.cache.remove_monitor(&resource.key());
                EventHandler::<MonitorResource>::on_delete(self, &resource).await;
            }
            WatchEvent::Added(WatchObject::Pod(pod)) => match self.cache.apply_pod(pod.clone()) {
                Some(old) => EventHandler::<Pod>::on_update(self, Some(&old), &pod).await,
                None => EventHandler::<Pod>::on_add(self, &pod).await,
            },
            WatchEvent::Modified(WatchObject::Pod(pod)) => {
                let old = self.cache.apply_pod(pod.clone());
                EventHandler::<Pod>::on_update(self, old.as_ref(), &pod).await;
            }
            WatchEvent::Deleted(WatchObject::Pod(pod)) => {
                self.cache.remove_pod(&pod.key());
                EventHandler::<Pod>::on_delete(self, &pod).await;
            }
        }
    }

    /// Bring the cache in line with a fresh listing of the source.
    ///
    /// Objects missing from the listing are dispatched as deletions, the rest
    /// as adds or updates. Marks the cache synced on success.
    pub async fn relist(&self, source: &dyn WatchSource) -> Result<usize, StoreError> {
        let objects = source.list().await?;
        let listed: HashSet<(bool, ObjectKey)> = objects
            .iter()
            .map(|object| (matches!(object, WatchObject::Monitor(_)), object.key()))
            .collect();

        for resource in self.cache.list_monitors() {
            if !listed.contains(&(true, resource.key())) {
                self.handle(WatchEvent::Deleted(WatchObject::Monitor(resource)))
                    .await;
            }
        }
        for pod in self.cache.list_pods() {
            if !listed.contains(&(false, pod.key())) {
                self.handle(WatchEvent::Deleted(WatchObject::Pod(pod))).await;
            }
        }

        // monitors first so pods can be routed against them
        let (monitors, pods): (Vec<_>, Vec<_>) = objects
            .into_iter()
            .partition(|object| matches!(object, WatchObject::Monitor(_)));
        let count = monitors.len() + pods.len();
        for object in monitors.into_iter().chain(pods) {
            self.handle(WatchEvent::Added(object)).await;
        }

        self.cache.mark_synced();
        Ok(count)
    }

    /// List until it succeeds; false if shutdown arrived first
    async fn relist_until_ok(
        &self,
        source: &dyn WatchSource,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        loop {
            match self.relist(source).await {
                Ok(count) => {
                    debug!(objects = count, "Relisted watch source");
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to list watch source, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RELIST_RETRY_DELAY) => {}
                        _ = shutdown.recv() => return false,
                    }
                }
            }
        }
    }

    /// Keep the cache and queue fed from `source` until shutdown
    pub async fn run(self, source: Arc<dyn WatchSource>, mut shutdown: broadcast::Receiver<()>) {
        info!(queue = self.queue.name(), "Starting watch dispatcher");

        // subscribe before listing so no change falls between the two
        let mut watch = source.watch();
        if !self.relist_until_ok(source.as_ref(), &mut shutdown).await {
            info!("Dispatcher stopped before initial sync");
            return;
        }

        loop {
            tokio::select! {
                event = watch.recv() => match event {
                    Ok(event) => self.handle(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch feed lagged, relisting");
                        if !self.relist_until_ok(source.as_ref(), &mut shutdown).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Watch feed closed");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutting down watch dispatcher");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl EventHandler<MonitorResource> for Dispatcher {
    async fn on_add(&self, resource: &MonitorResource) {
        self.enqueue(resource.key()).await;
    }

    async fn on_update(&self, _old: Option<&MonitorResource>, new: &MonitorResource) {
        self.enqueue(new.key()).await;
    }

    async fn on_delete(&self, resource: &MonitorResource) {
        // nothing left to reconcile; drop any pending backoff
        self.queue.forget(&resource.key().to_string());
        debug!(resource = %resource.key(), "PodMonitor deleted");
    }
}

#[async_trait]
impl EventHandler<Pod> for Dispatcher {
    async fn on_add(&self, pod: &Pod) {
        if let Some(key) = self.route_pod(pod) {
            self.enqueue(key).await;
        }
    }

    async fn on_update(&self, _old: Option<&Pod>, new: &Pod) {
        if let Some(key) = self.route_pod(new) {
            self.enqueue(key).await;
        }
    }

    async fn on_delete(&self, pod: &Pod) {
        if let Some(key) = self.route_pod(pod) {
            self.enqueue(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MonitorSpec, PodPhase};
    use crate::queue::RateLimiterConfig;
    use crate::store::MemoryStore;
    use tokio::time::timeout;

    fn setup() -> (Dispatcher, Arc<WatchCache>, WorkQueue) {
        let cache = Arc::new(WatchCache::new());
        let queue = WorkQueue::new("test", RateLimiterConfig::default());
        (Dispatcher::new(cache.clone(), queue.clone()), cache, queue)
    }

    fn monitor(name: &str) -> MonitorResource {
        let mut resource = MonitorResource::new("ns", name, MonitorSpec::default());
        resource.metadata.uid = format!("uid-{name}");
        resource
    }

    fn owned_pod(owner: &MonitorResource) -> Pod {
        let mut pod = Pod::new("ns", format!("pm-{}", owner.metadata.name));
        pod.metadata
            .owner_references
            .push(owner.controller_owner_ref());
        pod
    }

    async fn drain(queue: &WorkQueue) -> Vec<String> {
        let mut keys = Vec::new();
        while !queue.is_empty().await {
            if let Some(key) = queue.get().await {
                queue.done(&key).await;
                keys.push(key);
            }
        }
        keys
    }

    #[tokio::test]
    async fn test_monitor_events_enqueue_own_key() {
        let (dispatcher, cache, queue) = setup();
        let resource = monitor("x");

        dispatcher
            .handle(WatchEvent::Added(WatchObject::Monitor(resource.clone())))
            .await;
        dispatcher
            .handle(WatchEvent::Modified(WatchObject::Monitor(resource.clone())))
            .await;

        assert!(cache.contains_monitor(&resource.key()));
        assert_eq!(drain(&queue).await, vec!["ns/x".to_string()]);
    }

    #[tokio::test]
    async fn test_owned_pod_routes_to_owner() {
        let (dispatcher, _cache, queue) = setup();
        let resource = monitor("x");
        dispatcher
            .handle(WatchEvent::Added(WatchObject::Monitor(resource.clone())))
            .await;
        drain(&queue).await;

        let pod = owned_pod(&resource).with_phase(PodPhase::Succeeded);
        dispatcher
            .handle(WatchEvent::Modified(WatchObject::Pod(pod.clone())))
            .await;
        assert_eq!(drain(&queue).await, vec!["ns/x".to_string()]);

        dispatcher
            .handle(WatchEvent::Deleted(WatchObject::Pod(pod)))
            .await;
        assert_eq!(drain(&queue).await, vec!["ns/x".to_string()]);
    }

    #[tokio::test]
    async fn test_orphan_pod_is_ignored() {
        let (dispatcher, cache, queue) = setup();
        let pod = owned_pod(&monitor("gone"));

        dispatcher
            .handle(WatchEvent::Added(WatchObject::Pod(pod.clone())))
            .await;

        assert!(queue.is_empty().await);
        // still cached, only routing is skipped
        assert!(cache.get_pod(&pod.key()).is_some());
    }

    #[tokio::test]
    async fn test_target_pod_routes_by_name() {
        let (dispatcher, _cache, queue) = setup();
        dispatcher
            .handle(WatchEvent::Added(WatchObject::Monitor(monitor("x"))))
            .await;
        drain(&queue).await;

        dispatcher
            .handle(WatchEvent::Added(WatchObject::Pod(Pod::new("ns", "x"))))
            .await;
        dispatcher
            .handle(WatchEvent::Added(WatchObject::Pod(Pod::new("ns", "unrelated"))))
            .await;

        assert_eq!(drain(&queue).await, vec!["ns/x".to_string()]);
    }

    #[tokio::test]
    async fn test_relist_reconciles_cache() {
        let (dispatcher, cache, queue) = setup();
        // stale entry the source no longer has
        cache.apply_monitor(monitor("stale"));

        let store = MemoryStore::new();
        let resource = store.apply_resource(monitor("x")).await;
        store.put_pod(owned_pod(&resource)).await;

        let count = dispatcher.relist(&store).await.unwrap();

        assert_eq!(count, 2);
        assert!(cache.has_synced());
        assert!(!cache.contains_monitor(&ObjectKey::new("ns", "stale")));
        assert_eq!(cache.pod_count(), 1);
        assert_eq!(drain(&queue).await, vec!["ns/x".to_string()]);
    }

    #[tokio::test]
    async fn test_run_follows_watch_feed() {
        let (dispatcher, cache, queue) = setup();
        let store = Arc::new(MemoryStore::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(dispatcher.run(store.clone(), shutdown_rx));
        timeout(Duration::from_secs(1), cache.wait_for_sync())
            .await
            .unwrap();

        store.apply_resource(monitor("x")).await;
        let key = timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("ns/x"));

        shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
