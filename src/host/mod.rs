//! Reference host
//!
//! A small callback-driven build pipeline used to exercise the profiler end
//! to end: hooks with stage-ordered taps, a compiler and its compilations,
//! a transformer runner with pitch support, and a sample workload.

pub mod compiler;
pub mod hooks;
pub mod runner;
pub mod sample;

pub use compiler::{Artifacts, Compilation, Compiler};
pub use hooks::{Hook, HookKind, HookMap, HooksRecord};
pub use runner::{resolve_chain, run_chain};
pub use sample::{host_profile, sample_compiler, sample_config, sample_sources, SampleLoader};
