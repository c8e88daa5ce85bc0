//! Shared configuration, error types, IDs, and metrics for the TSQ crates.
//!
//! Architecture role:
//! - defines the reduce coordinator configuration
//! - provides the common [`TsqError`] / [`Result`] contracts
//! - hosts the prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::ReduceConfig;
pub use error::{Result, TsqError};
pub use ids::*;
pub use metrics::{MetricsRegistry, global_metrics};
