//! Invariant violations raised by the instrumentation layer
//!
//! A violation means the layer's assumptions about the host's contract did
//! not hold. They are never retried or downgraded: continuing would produce
//! silently wrong measurements. Host errors travel as `anyhow::Error`, and a
//! violation raised inside a host call is carried the same way, so callers
//! can recover it with `err.downcast_ref::<Violation>()`.

use thiserror::Error;

use crate::correlation::CorrelationId;
use crate::ledger::{EventKind, EventPhase};

/// Result type for host-facing operations
pub type HostResult<T> = anyhow::Result<T>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("profiling run initialized twice; a run must finish before the next one starts")]
    AlreadyInitialized,

    #[error("profiling run is not initialized")]
    NotInitialized,

    #[error("{kind} events are not sorted by time (event #{index} goes back in time)")]
    OutOfOrder { kind: EventKind, index: usize },

    #[error("pipeline must report exactly one {phase} milestone, found none")]
    MissingMilestone { phase: EventPhase },

    #[error("pipeline must report exactly one {phase} milestone, found {count}")]
    DuplicateMilestone { phase: EventPhase, count: usize },

    #[error("invocation {correlation} of {entity} must record one start followed by one end, found [{found}]")]
    UnmatchedCorrelation {
        entity: String,
        correlation: CorrelationId,
        found: String,
    },

    #[error("object tagged `{tag}` is declared as {expected} but does not expose that shape")]
    UnrecognizedCarrier { tag: String, expected: &'static str },

    #[error("member `{member}` of `{container}` is not an extension point carrier")]
    UnrecognizedMember { container: String, member: String },

    #[error("`{registrar}` takes exactly 2 arguments (options, callback), got {got}")]
    RegistrationArity { registrar: &'static str, got: usize },

    #[error("`{registrar}` expects a {expected} callback, got {found}")]
    CallbackConvention {
        registrar: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("transformer at {path} is neither callable nor a record with pitch/normal phases")]
    MalformedTransformer { path: String },

    #[error("unsupported rule: {0}")]
    UnsupportedRule(String),

    #[error("invalid profiler options: {0}")]
    InvalidOptions(String),
}
