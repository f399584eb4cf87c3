//! Core data models for the PodMonitor operator
//!
//! Mirrors the persisted layout of the `PodMonitor` custom resource and the
//! subset of the core `Pod` object the reconciler reads and writes.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// API group/version of the PodMonitor custom resource
pub const API_VERSION: &str = "lsalab.nthu/v1";

/// Kind of the PodMonitor custom resource
pub const KIND: &str = "PodMonitor";

/// Default sampling interval when `sampleIntervalSeconds` is unset
pub const DEFAULT_SAMPLE_INTERVAL_SECONDS: i32 = 30;

/// Namespace/name identity of a cluster object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Split a `namespace/name` queue key.
    ///
    /// Both halves must be non-empty and the key must contain exactly one `/`.
    pub fn parse(key: &str) -> Result<Self, Error> {
        let malformed = |message: &str| Error::MalformedKey {
            key: key.to_string(),
            message: message.to_string(),
        };

        let (namespace, name) = key
            .split_once('/')
            .ok_or_else(|| malformed("expected namespace/name"))?;

        if name.contains('/') {
            return Err(malformed("unexpected extra '/'"));
        }
        if namespace.is_empty() || name.is_empty() {
            return Err(malformed("namespace and name must be non-empty"));
        }

        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Back-reference from a dependent object to the object that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

/// Object metadata shared by every stored object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    /// Version token used for optimistic concurrency; bumped on every write
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// The owner reference flagged as managing controller, if any
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|owner| owner.controller)
    }
}

/// Lifecycle phase of a MonitorResource
///
/// Unknown strings are preserved in [`MonitorPhase::Unrecognized`] so that a
/// newer schema never fails to deserialize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MonitorPhase {
    #[default]
    None,
    Pending,
    Running,
    Completed,
    Failed,
    Unrecognized(String),
}

impl MonitorPhase {
    pub fn as_str(&self) -> &str {
        match self {
            MonitorPhase::None => "",
            MonitorPhase::Pending => "Pending",
            MonitorPhase::Running => "Running",
            MonitorPhase::Completed => "Completed",
            MonitorPhase::Failed => "Failed",
            MonitorPhase::Unrecognized(raw) => raw,
        }
    }

    /// Label used for logs and metrics, where the empty phase reads badly
    pub fn label(&self) -> &str {
        match self {
            MonitorPhase::None => "None",
            other => other.as_str(),
        }
    }
}

impl From<String> for MonitorPhase {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "" => MonitorPhase::None,
            "Pending" => MonitorPhase::Pending,
            "Running" => MonitorPhase::Running,
            "Completed" => MonitorPhase::Completed,
            "Failed" => MonitorPhase::Failed,
            _ => MonitorPhase::Unrecognized(raw),
        }
    }
}

impl From<MonitorPhase> for String {
    fn from(phase: MonitorPhase) -> Self {
        phase.as_str().to_string()
    }
}

impl fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Declared configuration of a MonitorResource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    #[serde(default = "default_sample_interval")]
    pub sample_interval_seconds: i32,
    #[serde(default)]
    pub log_directory: String,
}

fn default_sample_interval() -> i32 {
    DEFAULT_SAMPLE_INTERVAL_SECONDS
}

impl Default for MonitorSpec {
    fn default() -> Self {
        Self {
            sample_interval_seconds: DEFAULT_SAMPLE_INTERVAL_SECONDS,
            log_directory: String::new(),
        }
    }
}

impl MonitorSpec {
    /// Sampling interval handed to the child; non-positive values fall back to the default
    pub fn effective_sample_interval(&self) -> i32 {
        if self.sample_interval_seconds > 0 {
            self.sample_interval_seconds
        } else {
            DEFAULT_SAMPLE_INTERVAL_SECONDS
        }
    }
}

/// Observed state written back by the reconciler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatus {
    #[serde(default)]
    pub phase: MonitorPhase,
    /// Populated only while the phase is Failed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl MonitorStatus {
    pub fn new(phase: MonitorPhase) -> Self {
        Self {
            phase,
            reason: String::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            phase: MonitorPhase::Failed,
            reason: reason.into(),
        }
    }
}

/// The PodMonitor custom resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorResource {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MonitorSpec,
    #[serde(default)]
    pub status: MonitorStatus,
}

impl MonitorResource {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: MonitorSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: MonitorStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Owner reference to record on children so they route back here
    pub fn controller_owner_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller: true,
            block_owner_deletion: true,
        }
    }

    /// Whether `meta` names this resource as its controlling owner
    pub fn controls(&self, meta: &ObjectMeta) -> bool {
        meta.namespace == self.metadata.namespace
            && meta.controller_ref().is_some_and(|owner| {
                owner.kind == KIND
                    && owner.name == self.metadata.name
                    && (owner.uid.is_empty() || owner.uid == self.metadata.uid)
            })
    }
}

/// Phase reported by a pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Succeeded and Failed are terminal; nothing restarts the pod afterwards
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPathVolumeSource {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub host_path: HostPathVolumeSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

impl Container {
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|var| var.name == name)
            .map(|var| var.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// A pod, either the monitored workload or the monitor child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: PodSpec::default(),
            status: PodStatus::default(),
        }
    }

    pub fn with_phase(mut self, phase: PodPhase) -> Self {
        self.status.phase = phase;
        self
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}
