//! Warrant Telemetry - logging setup and job tracing.
//!
//! This crate provides:
//! - Configurable `tracing` subscriber setup with multiple formats
//! - [`JobContext`] spans that tie every log line of a maintenance run together
//!
//! # Example
//!
//! ```rust,no_run
//! use warrant_telemetry::{JobContext, LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), warrant_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("warrant_engine::migration=debug");
//! setup_logging(&config)?;
//!
//! let _guard = JobContext::new("purge_duplicates").enter();
//! tracing::info!(removed = 3, "purged duplicate credentials");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod context;
mod error;
mod logging;

pub use context::{JobContext, JobGuard};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging, setup_test_logging,
};
