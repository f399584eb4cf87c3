//! Library for the PodMonitor operator
//!
//! This crate provides the core functionality for:
//! - Deduplicating, rate-limited work queue of resource keys
//! - Watch cache and watch → queue dispatch
//! - PodMonitor phase state machine and child pod construction
//! - Optimistic-concurrency status writes through a store boundary
//! - Health checks, metrics, and event recording

pub mod builder;
pub mod cache;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod health;
pub mod models;
pub mod observability;
pub mod queue;
pub mod reconciler;
pub mod store;

pub use controller::{Context, ContextBuilder, Controller};
pub use error::{Error, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{OperatorMetrics, StructuredLogger};
pub use reconciler::{Action, ReconcileConfig, Reconciler};
pub use store::{Manifest, MemoryStore, ResourceStore, WatchEvent, WatchObject, WatchSource};
