//! Observability for the dagrun orchestrator
//!
//! Sets up structured logging with `tracing`. Every orchestrator entry point
//! runs inside a span carrying the workflow name and run ID.

pub mod tracing_setup;

pub use tracing_setup::*;

use thiserror::Error;

/// Observability errors
#[derive(Error, Debug)]
pub enum ObservabilityError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, ObservabilityError>;
