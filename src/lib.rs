//! promstore - Prometheus remote-storage client over PostgreSQL
//!
//! This library provides the write/read core of a remote-storage adapter:
//! - Bounded LRU caches for metric, label, series and exemplar identifiers
//! - Hash-partitioned ingestion across concurrent copy workers
//! - Synchronous or asynchronous write acknowledgement
//! - Background health checks and telemetry with ordered shutdown

#![warn(clippy::all)]

pub mod error;
pub mod types;

/// Configuration management with TOML support
pub mod config;

/// Prometheus metrics
pub mod metrics;

/// Store abstraction, PostgreSQL and in-memory backends
pub mod store;

/// Identifier caches and their background maintenance
pub mod cache;

/// Label to id resolution through the label cache
pub mod resolver;

/// Ingestion coordinator and copy workers
pub mod ingestion;

/// Read path: label matchers to series
pub mod query;

/// Store health probes
pub mod health;

/// Periodic telemetry reporting
pub mod telemetry;

/// Database operational gauges
pub mod dbmetrics;

/// Cluster coordination hook
pub mod cluster;

/// Client facade composing every subsystem
pub mod client;

// Re-export main types
pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use error::{Error, Result};
pub use ingestion::IngestReport;
pub use types::{InstanceId, Labels, ReadRequest, ReadResponse, TimeSeries, TraceBatch, WriteRequest};
