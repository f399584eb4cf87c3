//! Boundary to the authoritative cluster store
//!
//! The reconciler only ever talks to the store through [`ResourceStore`];
//! the dispatcher consumes a [`WatchSource`] to keep the watch cache fresh.

mod memory;

pub use memory::{Manifest, MemoryStore, StoreStats};

use crate::error::StoreError;
use crate::models::{MonitorResource, ObjectKey, Pod};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// CRUD operations the reconciler needs from the cluster store
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a PodMonitor by key
    async fn get_resource(&self, key: &ObjectKey) -> Result<MonitorResource, StoreError>;

    /// Replace the status sub-resource.
    ///
    /// Must reject the write with [`StoreError::Conflict`] when
    /// `resource.metadata.resource_version` is not the stored version.
    async fn update_status(&self, resource: &MonitorResource)
        -> Result<MonitorResource, StoreError>;

    /// Fetch a pod by key
    async fn get_child_pod(&self, key: &ObjectKey) -> Result<Pod, StoreError>;

    /// Create a pod, failing with [`StoreError::AlreadyExists`] on a name clash
    async fn create_child_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;
}

/// Object carried by a watch event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WatchObject {
    #[serde(rename = "PodMonitor")]
    Monitor(MonitorResource),
    Pod(Pod),
}

impl WatchObject {
    pub fn key(&self) -> ObjectKey {
        match self {
            WatchObject::Monitor(resource) => resource.key(),
            WatchObject::Pod(pod) => pod.key(),
        }
    }
}

/// Change notification from the store
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(WatchObject),
    Modified(WatchObject),
    Deleted(WatchObject),
}

/// List-then-watch feed of store changes
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Snapshot of every watched object
    async fn list(&self) -> Result<Vec<WatchObject>, StoreError>;

    /// Subscribe to changes made after this call
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
