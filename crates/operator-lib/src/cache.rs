//! Local, eventually-consistent mirror of watched objects
//!
//! The dispatcher is the only writer. Reconcilers read through point lookups
//! and must not start before [`WatchCache::has_synced`] reports true.

use crate::models::{MonitorResource, ObjectKey, Pod};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::info;

/// Indexed cache of PodMonitors and Pods
pub struct WatchCache {
    monitors: DashMap<ObjectKey, MonitorResource>,
    pods: DashMap<ObjectKey, Pod>,
    synced: watch::Sender<bool>,
}

impl WatchCache {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            monitors: DashMap::new(),
            pods: DashMap::new(),
            synced,
        }
    }

    /// Insert or replace a PodMonitor, returning the previous copy
    pub fn apply_monitor(&self, resource: MonitorResource) -> Option<MonitorResource> {
        self.monitors.insert(resource.key(), resource)
    }

    pub fn remove_monitor(&self, key: &ObjectKey) -> Option<MonitorResource> {
        self.monitors.remove(key).map(|(_, v)| v)
    }

    pub fn get_monitor(&self, key: &ObjectKey) -> Option<MonitorResource> {
        self.monitors.get(key).map(|r| r.clone())
    }

    pub fn contains_monitor(&self, key: &ObjectKey) -> bool {
        self.monitors.contains_key(key)
    }

    /// Insert or replace a Pod, returning the previous copy
    pub fn apply_pod(&self, pod: Pod) -> Option<Pod> {
        self.pods.insert(pod.key(), pod)
    }

    pub fn remove_pod(&self, key: &ObjectKey) -> Option<Pod> {
        self.pods.remove(key).map(|(_, v)| v)
    }

    pub fn get_pod(&self, key: &ObjectKey) -> Option<Pod> {
        self.pods.get(key).map(|r| r.clone())
    }

    /// All cached PodMonitors
    pub fn list_monitors(&self) -> Vec<MonitorResource> {
        self.monitors.iter().map(|r| r.value().clone()).collect()
    }

    /// All cached Pods
    pub fn list_pods(&self) -> Vec<Pod> {
        self.pods.iter().map(|r| r.value().clone()).collect()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    /// Signal that the initial list has been applied
    pub fn mark_synced(&self) {
        if !*self.synced.borrow() {
            info!(
                monitors = self.monitors.len(),
                pods = self.pods.len(),
                "Watch cache synced"
            );
        }
        self.synced.send_replace(true);
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolve once the cache has synced
    pub async fn wait_for_sync(&self) {
        let mut rx = self.synced.subscribe();
        while !*rx.borrow_and_update() {
            // the sender lives in `self`, so this only fails if the cache is gone
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for WatchCache {
    fn default() -> Self {
        Self::new()
    }
}
