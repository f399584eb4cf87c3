//! Kubernetes-style event recording for PodMonitor lifecycle changes
//!
//! Handles:
//! - Building `Event` objects against a PodMonitor
//! - Suppressing identical events within a deduplication window
//! - Best-effort delivery to an [`EventSink`]

use crate::models::{MonitorResource, API_VERSION, KIND};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default deduplication window (15 minutes)
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 15 * 60;

/// Reasons attached to recorded events
pub mod reasons {
    pub const PHASE_CHANGED: &str = "PhaseChanged";
    pub const MONITORED_POD_MISSING: &str = "MonitoredPodMissing";
    pub const CHILD_NOT_OWNED: &str = "ChildNameConflict";
    pub const CHILD_CREATED: &str = "ChildPodCreated";
    pub const MONITOR_COMPLETED: &str = "MonitorCompleted";
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    pub component: String,
}

/// Event recorded against a PodMonitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesEvent {
    pub metadata: EventMetadata,
    pub involved_object: ObjectReference,
    pub reason: String,
    pub message: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// RFC3339 timestamp
    pub first_timestamp: String,
    pub source: EventSource,
}

/// Destination for recorded events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: KubernetesEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    namespace: String,
    name: String,
    reason: String,
    message: String,
}

/// Event recorder with deduplication
#[derive(Clone)]
pub struct EventRecorder {
    sink: Arc<dyn EventSink>,
    component: String,
    dedup_window: Duration,
    recent: Arc<Mutex<HashMap<DedupKey, Instant>>>,
    sequence: Arc<AtomicU64>,
}

impl EventRecorder {
    pub fn new(sink: Arc<dyn EventSink>, component: impl Into<String>) -> Self {
        Self {
            sink,
            component: component.into(),
            dedup_window: Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS),
            recent: Arc::new(Mutex::new(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set custom deduplication window
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Record a `Normal` event
    pub async fn normal(&self, resource: &MonitorResource, reason: &str, message: String) {
        self.record(resource, EventType::Normal, reason, message)
            .await;
    }

    /// Record a `Warning` event
    pub async fn warning(&self, resource: &MonitorResource, reason: &str, message: String) {
        self.record(resource, EventType::Warning, reason, message)
            .await;
    }

    async fn record(
        &self,
        resource: &MonitorResource,
        event_type: EventType,
        reason: &str,
        message: String,
    ) {
        let key = DedupKey {
            namespace: resource.metadata.namespace.clone(),
            name: resource.metadata.name.clone(),
            reason: reason.to_string(),
            message: message.clone(),
        };
        if !self.admit(key) {
            debug!(
                resource = %resource.key(),
                reason = %reason,
                "Suppressing duplicate event"
            );
            return;
        }

        let event = self.build_event(resource, event_type, reason, message);
        if let Err(e) = self.sink.publish(event).await {
            warn!(resource = %resource.key(), reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Returns false when an identical event was emitted inside the window
    fn admit(&self, key: DedupKey) -> bool {
        let mut recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        recent.retain(|_, at| at.elapsed() < self.dedup_window);
        if recent.contains_key(&key) {
            return false;
        }
        recent.insert(key, Instant::now());
        true
    }

    fn build_event(
        &self,
        resource: &MonitorResource,
        event_type: EventType,
        reason: &str,
        message: String,
    ) -> KubernetesEvent {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now();

        KubernetesEvent {
            metadata: EventMetadata {
                name: format!(
                    "{}.{:x}{:04x}",
                    resource.metadata.name,
                    now.timestamp_millis(),
                    sequence & 0xffff
                ),
                namespace: resource.metadata.namespace.clone(),
            },
            involved_object: ObjectReference {
                api_version: API_VERSION.to_string(),
                kind: KIND.to_string(),
                name: resource.metadata.name.clone(),
                namespace: resource.metadata.namespace.clone(),
                uid: Some(resource.metadata.uid.clone()).filter(|uid| !uid.is_empty()),
            },
            reason: reason.to_string(),
            message,
            event_type,
            first_timestamp: now.to_rfc3339(),
            source: EventSource {
                component: self.component.clone(),
            },
        }
    }
}
