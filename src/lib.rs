//! hooktime - timing instrumentation for callback-driven build pipelines
//!
//! This library wraps a pipeline's extensions and resource transformers so
//! that every callback invocation and transformer phase is timed, without
//! changing what the pipeline produces. Measurements land in a run-scoped
//! ledger and are aggregated into a per-extension, per-transformer report.

pub mod aggregate;
pub mod carrier;
pub mod cli;
pub mod clock;
pub mod config;
pub mod correlation;
pub mod error;
pub mod extension;
pub mod host;
pub mod identity;
mod instrument;
pub mod intercept;
pub mod json_output;
pub mod ledger;
pub mod report;
pub mod session;
pub mod span;
pub mod transformer;
pub mod value;

pub use aggregate::{aggregate, AggregationResult};
pub use config::ProfilerOptions;
pub use error::{HostResult, Violation};
pub use session::Profiler;
