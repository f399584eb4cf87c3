//! PodMonitor operator process: configuration and HTTP probes

pub mod api;
pub mod config;
