//! In-process authoritative store
//!
//! Holds PodMonitors and Pods with per-object version tokens, enforces
//! optimistic concurrency on status writes, cascades deletes to owned pods
//! and broadcasts every change to watchers.

use super::{ResourceStore, WatchEvent, WatchObject, WatchSource};
use crate::error::StoreError;
use crate::events::{EventSink, KubernetesEvent};
use crate::models::{MonitorResource, ObjectKey, Pod, PodPhase, KIND};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

const MONITOR_KIND: &str = KIND;
const POD_KIND: &str = "Pod";

/// Default capacity of the watch broadcast channel
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Recorded events kept before the oldest are evicted
pub const DEFAULT_EVENT_RETENTION: usize = 1000;

/// Write counters, handy for asserting idempotence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub status_writes: u64,
    pub conflicts: u64,
    pub pods_created: u64,
    /// Events currently retained
    pub events_recorded: usize,
    /// Events dropped to stay within the retention limit
    pub events_evicted: u64,
}

/// Initial objects loaded into a [`MemoryStore`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub monitors: Vec<MonitorResource>,
    #[serde(default)]
    pub pods: Vec<Pod>,
}

impl Manifest {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Default)]
struct Counters {
    status_writes: AtomicU64,
    conflicts: AtomicU64,
    pods_created: AtomicU64,
    events_evicted: AtomicU64,
}

/// Thread-safe in-memory implementation of the cluster store
pub struct MemoryStore {
    monitors: RwLock<HashMap<ObjectKey, MonitorResource>>,
    pods: RwLock<HashMap<ObjectKey, Pod>>,
    /// Most recent events, oldest first
    events: RwLock<VecDeque<KubernetesEvent>>,
    event_retention: usize,
    watch_tx: broadcast::Sender<WatchEvent>,
    next_version: AtomicU64,
    next_uid: AtomicU64,
    counters: Counters,
    /// When set, every trait operation fails with `Unavailable`
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_retention(DEFAULT_EVENT_RETENTION)
    }

    /// Store that keeps at most `retention` recorded events
    pub fn with_event_retention(retention: usize) -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let retention = retention.max(1);
        Self {
            monitors: RwLock::new(HashMap::new()),
            pods: RwLock::new(HashMap::new()),
            events: RwLock::new(VecDeque::with_capacity(retention.min(10_000))),
            event_retention: retention,
            watch_tx,
            next_version: AtomicU64::new(1),
            next_uid: AtomicU64::new(1),
            counters: Counters::default(),
            unavailable: AtomicBool::new(false),
        }
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn new_uid(&self) -> String {
        format!("{:08x}", self.next_uid.fetch_add(1, Ordering::SeqCst))
    }

    /// Broadcast a change. Callers hold the write guard of the map they
    /// mutated so watchers see per-key changes in commit order.
    fn emit(&self, event: WatchEvent) {
        // no receivers is fine; nobody is watching yet
        let _ = self.watch_tx.send(event);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store marked unavailable"));
        }
        Ok(())
    }

    /// Simulate an outage of the store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Apply every object in `manifest`, monitors first
    pub async fn seed(&self, manifest: Manifest) {
        let (monitors, pods) = (manifest.monitors.len(), manifest.pods.len());
        for resource in manifest.monitors {
            self.apply_resource(resource).await;
        }
        for pod in manifest.pods {
            self.put_pod(pod).await;
        }
        info!(monitors, pods, "Seeded memory store");
    }

    /// Create a PodMonitor or replace its spec, keeping the stored status
    pub async fn apply_resource(&self, mut resource: MonitorResource) -> MonitorResource {
        let key = resource.key();
        let mut monitors = self.monitors.write().await;

        let event = match monitors.get(&key) {
            Some(existing) => {
                resource.metadata.uid = existing.metadata.uid.clone();
                resource.status = existing.status.clone();
                resource.metadata.resource_version = self.bump_version();
                WatchEvent::Modified(WatchObject::Monitor(resource.clone()))
            }
            None => {
                if resource.metadata.uid.is_empty() {
                    resource.metadata.uid = self.new_uid();
                }
                resource.metadata.resource_version = self.bump_version();
                WatchEvent::Added(WatchObject::Monitor(resource.clone()))
            }
        };

        monitors.insert(key, resource.clone());
        self.emit(event);
        resource
    }

    /// Delete a PodMonitor and every pod it controls
    pub async fn delete_resource(&self, key: &ObjectKey) -> Option<MonitorResource> {
        // lock order: monitors, then pods
        let mut monitors = self.monitors.write().await;
        let removed = monitors.remove(key)?;

        let mut pods = self.pods.write().await;
        let owned: Vec<ObjectKey> = pods
            .values()
            .filter(|pod| removed.controls(&pod.metadata))
            .map(Pod::key)
            .collect();
        let cascaded: Vec<Pod> = owned.iter().filter_map(|k| pods.remove(k)).collect();

        debug!(resource = %key, cascaded = cascaded.len(), "Deleted PodMonitor");
        self.emit(WatchEvent::Deleted(WatchObject::Monitor(removed.clone())));
        for pod in cascaded {
            self.emit(WatchEvent::Deleted(WatchObject::Pod(pod)));
        }
        Some(removed)
    }

    /// Create or replace a pod from outside the operator (the monitored workload)
    pub async fn put_pod(&self, mut pod: Pod) -> Pod {
        let key = pod.key();
        let mut pods = self.pods.write().await;

        let existed = match pods.get(&key) {
            Some(existing) => {
                pod.metadata.uid = existing.metadata.uid.clone();
                true
            }
            None => {
                if pod.metadata.uid.is_empty() {
                    pod.metadata.uid = self.new_uid();
                }
                false
            }
        };
        pod.metadata.resource_version = self.bump_version();
        pods.insert(key, pod.clone());

        let object = WatchObject::Pod(pod.clone());
        self.emit(if existed {
            WatchEvent::Modified(object)
        } else {
            WatchEvent::Added(object)
        });
        pod
    }

    /// Move an existing pod to `phase`
    pub async fn set_pod_phase(&self, key: &ObjectKey, phase: PodPhase) -> Option<Pod> {
        let mut pods = self.pods.write().await;
        let pod = pods.get_mut(key)?;
        pod.status.phase = phase;
        pod.metadata.resource_version = self.bump_version();
        let updated = pod.clone();
        self.emit(WatchEvent::Modified(WatchObject::Pod(updated.clone())));
        Some(updated)
    }

    pub async fn delete_pod(&self, key: &ObjectKey) -> Option<Pod> {
        let mut pods = self.pods.write().await;
        let removed = pods.remove(key)?;
        self.emit(WatchEvent::Deleted(WatchObject::Pod(removed.clone())));
        Some(removed)
    }

    /// Retained events recorded through [`EventSink`], oldest first
    pub async fn recorded_events(&self) -> Vec<KubernetesEvent> {
        self.events.read().await.iter().cloned().collect()
    }

    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            status_writes: self.counters.status_writes.load(Ordering::SeqCst),
            conflicts: self.counters.conflicts.load(Ordering::SeqCst),
            pods_created: self.counters.pods_created.load(Ordering::SeqCst),
            events_recorded: self.events.read().await.len(),
            events_evicted: self.counters.events_evicted.load(Ordering::SeqCst),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_resource(&self, key: &ObjectKey) -> Result<MonitorResource, StoreError> {
        self.check_available()?;
        self.monitors
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(MONITOR_KIND, key))
    }

    async fn update_status(
        &self,
        resource: &MonitorResource,
    ) -> Result<MonitorResource, StoreError> {
        self.check_available()?;
        let key = resource.key();
        let mut monitors = self.monitors.write().await;

        let stored = monitors
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found(MONITOR_KIND, &key))?;

        if stored.metadata.resource_version != resource.metadata.resource_version {
            self.counters.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Conflict {
                kind: MONITOR_KIND,
                key: key.to_string(),
                observed: resource.metadata.resource_version,
                current: stored.metadata.resource_version,
            });
        }

        stored.status = resource.status.clone();
        stored.metadata.resource_version = self.bump_version();
        let updated = stored.clone();
        self.counters.status_writes.fetch_add(1, Ordering::SeqCst);
        self.emit(WatchEvent::Modified(WatchObject::Monitor(updated.clone())));
        Ok(updated)
    }

    async fn get_child_pod(&self, key: &ObjectKey) -> Result<Pod, StoreError> {
        self.check_available()?;
        self.pods
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(POD_KIND, key))
    }

    async fn create_child_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.check_available()?;
        let key = pod.key();
        let mut pods = self.pods.write().await;

        if pods.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: POD_KIND,
                key: key.to_string(),
            });
        }

        let mut created = pod.clone();
        created.metadata.uid = self.new_uid();
        created.metadata.resource_version = self.bump_version();
        pods.insert(key, created.clone());
        self.counters.pods_created.fetch_add(1, Ordering::SeqCst);
        self.emit(WatchEvent::Added(WatchObject::Pod(created.clone())));
        Ok(created)
    }
}

#[async_trait]
impl WatchSource for MemoryStore {
    async fn list(&self) -> Result<Vec<WatchObject>, StoreError> {
        self.check_available()?;
        let mut objects: Vec<WatchObject> = self
            .monitors
            .read()
            .await
            .values()
            .cloned()
            .map(WatchObject::Monitor)
            .collect();
        objects.extend(self.pods.read().await.values().cloned().map(WatchObject::Pod));
        Ok(objects)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch_tx.subscribe()
    }
}

#[async_trait]
impl EventSink for MemoryStore {
    async fn publish(&self, event: KubernetesEvent) -> anyhow::Result<()> {
        let mut events = self.events.write().await;
        while events.len() >= self.event_retention {
            events.pop_front();
            self.counters.events_evicted.fetch_add(1, Ordering::SeqCst);
        }
        events.push_back(event);
        Ok(())
    }
}
