//! Operator configuration
//!
//! Values come from `PODMONITOR_*` environment variables, then command-line
//! flags override them.

use anyhow::{Context as _, Result};
use clap::Parser;
use podmonitor_lib::builder::ChildTemplate;
use podmonitor_lib::reconciler::ReconcileConfig;
use podmonitor_lib::store::Manifest;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line flags
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "podmonitor-operator", version, about = "PodMonitor operator")]
pub struct Args {
    /// Number of concurrent reconcile workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Port for health and metrics endpoints
    #[arg(long)]
    pub api_port: Option<u16>,

    /// JSON manifest used to seed the in-memory store
    #[arg(long)]
    pub manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// First retry delay after a failed sync
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap on the retry delay
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_failed_requeue_secs")]
    pub failed_requeue_secs: u64,

    #[serde(default = "default_resync_secs")]
    pub resync_secs: u64,

    #[serde(default = "default_unrecognized_requeue_secs")]
    pub unrecognized_requeue_secs: u64,

    /// Image of the monitor child container
    #[serde(default = "default_monitor_image")]
    pub monitor_image: String,

    /// Host directory backing the child's log volume
    #[serde(default = "default_host_log_path")]
    pub host_log_path: String,

    #[serde(default = "default_service_account")]
    pub service_account: String,

    /// Window for suppressing identical events
    #[serde(default = "default_event_dedup_secs")]
    pub event_dedup_secs: u64,

    #[serde(default)]
    pub manifest_path: Option<PathBuf>,
}

fn default_workers() -> usize {
    2
}

fn default_api_port() -> u16 {
    8080
}

fn default_backoff_base_ms() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    300
}

fn default_failed_requeue_secs() -> u64 {
    5
}

fn default_resync_secs() -> u64 {
    30
}

fn default_unrecognized_requeue_secs() -> u64 {
    10
}

fn default_monitor_image() -> String {
    ChildTemplate::default().image
}

fn default_host_log_path() -> String {
    ChildTemplate::default().host_log_path
}

fn default_service_account() -> String {
    ChildTemplate::default().service_account
}

fn default_event_dedup_secs() -> u64 {
    15 * 60
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            api_port: default_api_port(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            failed_requeue_secs: default_failed_requeue_secs(),
            resync_secs: default_resync_secs(),
            unrecognized_requeue_secs: default_unrecognized_requeue_secs(),
            monitor_image: default_monitor_image(),
            host_log_path: default_host_log_path(),
            service_account: default_service_account(),
            event_dedup_secs: default_event_dedup_secs(),
            manifest_path: None,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::from_env_source(Self::environment())
    }

    /// Environment source with the operator's prefix
    pub fn environment() -> config::Environment {
        config::Environment::with_prefix("PODMONITOR").try_parsing(true)
    }

    pub fn from_env_source(env: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(env)
            .build()
            .context("Failed to read PODMONITOR_* environment")?;

        config
            .try_deserialize()
            .context("Invalid PODMONITOR_* configuration")
    }

    /// Apply command-line overrides
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(workers) = args.workers {
            self.workers = workers;
        }
        if let Some(port) = args.api_port {
            self.api_port = port;
        }
        if let Some(manifest) = &args.manifest {
            self.manifest_path = Some(manifest.clone());
        }
        self
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn event_dedup_window(&self) -> Duration {
        Duration::from_secs(self.event_dedup_secs)
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            failed_requeue: Duration::from_secs(self.failed_requeue_secs),
            resync: Duration::from_secs(self.resync_secs),
            unrecognized_requeue: Duration::from_secs(self.unrecognized_requeue_secs),
        }
    }

    pub fn child_template(&self) -> ChildTemplate {
        ChildTemplate {
            image: self.monitor_image.clone(),
            host_log_path: self.host_log_path.clone(),
            service_account: self.service_account.clone(),
            ..ChildTemplate::default()
        }
    }
}

/// Read a JSON seed manifest from disk
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    Manifest::from_json(&raw)
        .with_context(|| format!("Failed to parse manifest {}", path.display()))
}
