//! Shared data model and configuration for dagrun.
//!
//! The run model mirrors what the persisted run-history store keeps per
//! attempt. Nothing here performs I/O except configuration loading.

pub mod config;
pub mod types;

pub use config::{OrchestratorConfig, PollingConfig, TelemetryConfig};
pub use types::{NodeState, NodeStatus, RunRef, RunState, RunStatus, SubRunEntry};
