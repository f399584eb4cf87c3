//! Child pod construction
//!
//! [`build_child_pod`] derives the monitor child from a PodMonitor and the
//! fixed [`ChildTemplate`]. [`MonitorEnv`] is the reading side of the same
//! environment contract, used by the process running inside the child.

use crate::error::Error;
use crate::models::{
    Container, EnvVar, HostPathVolumeSource, MonitorResource, ObjectKey, ObjectMeta, Pod, PodSpec,
    PodStatus, RestartPolicy, Volume, VolumeMount, DEFAULT_SAMPLE_INTERVAL_SECONDS,
};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const ENV_NAMESPACE: &str = "PODMONITOR_NAMESPACE";
pub const ENV_NAME: &str = "PODMONITOR_NAME";
pub const ENV_SPEED: &str = "PODMONITOR_SPEED";
pub const ENV_LOGDIR: &str = "PODMONITOR_LOGDIR";

/// Label carrying the owning PodMonitor's name
pub const LABEL_OWNER: &str = "podmonitors.lsalab.nthu";
/// Label marking every monitor child
pub const LABEL_MANAGED: &str = "podmonitors";

pub const CHILD_NAME_PREFIX: &str = "pm-";
pub const LOG_VOLUME_NAME: &str = "podmonitor-log";

/// Mount path used when `logDirectory` is empty
pub const DEFAULT_LOG_MOUNT: &str = "/var/log/podmonitor";

/// Fixed parts of the child pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildTemplate {
    pub image: String,
    pub container_name: String,
    /// Host directory backing the log volume
    pub host_log_path: String,
    pub service_account: String,
}

impl Default for ChildTemplate {
    fn default() -> Self {
        Self {
            image: "riyazhu/podmonitor:latest".to_string(),
            container_name: "podmonitor".to_string(),
            host_log_path: "/var/local".to_string(),
            service_account: "podmonitor-metricstest".to_string(),
        }
    }
}

/// Key of the monitor child for `resource`
pub fn child_key(resource: &MonitorResource) -> ObjectKey {
    ObjectKey::new(
        resource.metadata.namespace.clone(),
        format!("{}{}", CHILD_NAME_PREFIX, resource.metadata.name),
    )
}

/// Build the desired monitor child for `resource`.
///
/// Pure: the same inputs always produce the same pod.
pub fn build_child_pod(resource: &MonitorResource, template: &ChildTemplate) -> Pod {
    let key = child_key(resource);
    let log_dir = if resource.spec.log_directory.is_empty() {
        DEFAULT_LOG_MOUNT.to_string()
    } else {
        resource.spec.log_directory.clone()
    };

    let labels = BTreeMap::from([
        (LABEL_OWNER.to_string(), resource.metadata.name.clone()),
        (LABEL_MANAGED.to_string(), "true".to_string()),
    ]);

    let container = Container {
        name: template.container_name.clone(),
        image: template.image.clone(),
        env: vec![
            EnvVar::new(ENV_NAMESPACE, resource.metadata.namespace.clone()),
            EnvVar::new(ENV_NAME, resource.metadata.name.clone()),
            EnvVar::new(
                ENV_SPEED,
                resource.spec.effective_sample_interval().to_string(),
            ),
            EnvVar::new(ENV_LOGDIR, log_dir.clone()),
        ],
        volume_mounts: vec![VolumeMount {
            name: LOG_VOLUME_NAME.to_string(),
            mount_path: log_dir,
        }],
    };

    Pod {
        metadata: ObjectMeta {
            namespace: key.namespace,
            name: key.name,
            labels,
            owner_references: vec![resource.controller_owner_ref()],
            ..Default::default()
        },
        spec: PodSpec {
            containers: vec![container],
            volumes: vec![Volume {
                name: LOG_VOLUME_NAME.to_string(),
                host_path: HostPathVolumeSource {
                    path: template.host_log_path.clone(),
                },
            }],
            restart_policy: RestartPolicy::OnFailure,
            service_account_name: template.service_account.clone(),
        },
        status: PodStatus::default(),
    }
}

/// Settings the monitor child reads from its environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEnv {
    pub namespace: String,
    pub name: String,
    /// Sampling interval in seconds
    pub speed: u64,
    pub log_dir: String,
}

impl MonitorEnv {
    /// Parse the contract through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let name = present(ENV_NAME).ok_or_else(|| Error::Environment {
            message: format!("{ENV_NAME} is not set"),
        })?;

        let speed = present(ENV_SPEED)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .filter(|speed| *speed > 0)
            .map(|speed| speed as u64)
            .unwrap_or(DEFAULT_SAMPLE_INTERVAL_SECONDS as u64);

        Ok(Self {
            namespace: present(ENV_NAMESPACE).unwrap_or_else(|| "default".to_string()),
            name,
            speed,
            log_dir: present(ENV_LOGDIR).unwrap_or_else(|| "./log".to_string()),
        })
    }

    /// Parse the contract from the process environment
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// File the child appends its samples to
    pub fn log_path(&self) -> PathBuf {
        PathBuf::from(&self.log_dir).join(&self.name)
    }
}
