//! Resource transformers
//!
//! Transformers are not reached through the object graph: the host loads
//! them by absolute path when a resource needs them. The host's loading path
//! calls a [`ModuleLoader`]; [`install_load_interceptor`] returns one that
//! substitutes instrumented transformers for the candidate paths and passes
//! everything else through to the real loader.
//!
//! A transformer runs in two phases. `pitch` runs left to right over the
//! chain before any source is read; `normal` runs right to left over the
//! source. Either phase may defer its result through the context's
//! completion slot.

mod interceptor;
mod naming;

use std::fmt;
use std::rc::Rc;

use crate::error::{HostResult, Violation};
use crate::ledger::{EventDetail, EventKind, Recorder, TransformPhase};
use crate::span::{settle_on_signal, InvocationSpan};
use crate::value::{Completer, CompletionHandle, Reply, Value};

pub use interceptor::{install_load_interceptor, LoadInterceptor, Substitute, SCOUT_ID};
pub use naming::display_name;

/// One transformer phase
pub type TransformFn = Rc<dyn Fn(&TransformContext, &[Value]) -> HostResult<Reply>>;

/// What a transformer phase sees of the resource being processed
pub struct TransformContext {
    resource_path: String,
    chain: Vec<String>,
    completer: Completer,
}

impl TransformContext {
    pub fn new(resource_path: &str, chain: Vec<String>, completer: Completer) -> Self {
        Self {
            resource_path: resource_path.to_string(),
            chain,
            completer,
        }
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    /// Absolute paths of every transformer applied to the resource
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub fn completer(&self) -> &Completer {
        &self.completer
    }

    /// Declare the result asynchronous; complete the handle with it later
    pub fn defer(&self) -> CompletionHandle {
        self.completer.defer()
    }
}

/// Record-shaped transformer module
#[derive(Clone, Default)]
pub struct TransformerRecord {
    pub normal: Option<TransformFn>,
    pub pitch: Option<TransformFn>,
    /// Wants raw bytes rather than text; passed through untouched
    pub raw: bool,
}

/// A loaded transformer module
#[derive(Clone)]
pub enum TransformerModule {
    /// The module itself is the normal phase
    Callable(TransformFn),
    Record(TransformerRecord),
    /// Anything else the loader produced
    Other(serde_json::Value),
}

impl TransformerModule {
    pub fn callable(f: impl Fn(&TransformContext, &[Value]) -> HostResult<Reply> + 'static) -> Self {
        TransformerModule::Callable(Rc::new(f))
    }

    pub fn normal(&self) -> Option<TransformFn> {
        match self {
            TransformerModule::Callable(f) => Some(f.clone()),
            TransformerModule::Record(record) => record.normal.clone(),
            TransformerModule::Other(_) => None,
        }
    }

    pub fn pitch(&self) -> Option<TransformFn> {
        match self {
            TransformerModule::Record(record) => record.pitch.clone(),
            _ => None,
        }
    }
}

impl fmt::Debug for TransformerModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformerModule::Callable(_) => write!(f, "Callable"),
            TransformerModule::Record(record) => f
                .debug_struct("Record")
                .field("normal", &record.normal.is_some())
                .field("pitch", &record.pitch.is_some())
                .field("raw", &record.raw)
                .finish(),
            TransformerModule::Other(value) => write!(f, "Other({value})"),
        }
    }
}

/// The host's module loading contract: identifier in, module out
pub trait ModuleLoader {
    fn load(&self, id: &str) -> HostResult<TransformerModule>;
}

/// Wrap both phases of a transformer with start/end timing
///
/// Events are attributed to `path`. A module that is neither callable nor a
/// record with at least one phase is rejected, naming the path.
pub fn instrument_transformer(
    recorder: &Recorder,
    module: TransformerModule,
    path: &str,
) -> HostResult<TransformerModule> {
    let wrap = |phase: TransformPhase, f: TransformFn| wrap_phase(recorder.clone(), path, phase, f);
    match module {
        TransformerModule::Callable(f) => Ok(TransformerModule::Callable(wrap(TransformPhase::Normal, f))),
        TransformerModule::Record(record) if record.normal.is_some() || record.pitch.is_some() => {
            Ok(TransformerModule::Record(TransformerRecord {
                normal: record.normal.map(|f| wrap(TransformPhase::Normal, f)),
                pitch: record.pitch.map(|f| wrap(TransformPhase::Pitch, f)),
                raw: record.raw,
            }))
        }
        TransformerModule::Record(_) | TransformerModule::Other(_) => Err(Violation::MalformedTransformer {
            path: path.to_string(),
        }
        .into()),
    }
}

fn wrap_phase(recorder: Recorder, path: &str, phase: TransformPhase, f: TransformFn) -> TransformFn {
    let path = path.to_string();
    Rc::new(move |ctx: &TransformContext, args: &[Value]| {
        let span = InvocationSpan::open(
            &recorder,
            EventKind::ResourceTransform,
            &path,
            EventDetail::Transform {
                phase,
                resource: ctx.resource_path().to_string(),
            },
        );
        settle_on_signal(span, ctx.completer(), || f(ctx, args))
    })
}
