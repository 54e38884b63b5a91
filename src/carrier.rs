//! Host objects and extension point carriers
//!
//! The host exposes its object graph through [`HostObject`]. Whether an
//! object is an extension point carrier is decided structurally, by the type
//! tag the host declares in its [`HostProfile`], never by probing content.
//! A carrier then exposes one of three typed views through [`Shape`]:
//!
//! ```text
//! Container  ── member(name) ──▶ nested carriers (plus bookkeeping fields)
//! Point      ── registrar(convention) ──▶ tap / tapAsync / tapPromise
//! Keyed      ── lookup(key) ──▶ extension point
//! ```

use std::any::Any;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::error::{HostResult, Violation};
use crate::value::{Completion, HostFn, Value};

/// Shared handle to a host object
pub type ObjectRef = Rc<dyn HostObject>;

/// Identity of a host object (its allocation address)
pub fn identity_of(obj: &ObjectRef) -> usize {
    Rc::as_ptr(obj) as *const () as usize
}

pub trait HostObject {
    /// Type tag the host declares for this object
    fn type_tag(&self) -> &str;

    fn shape(&self) -> Shape<'_> {
        Shape::Plain
    }

    /// Concrete host type, for host code that downcasts
    fn as_any(&self) -> &dyn Any;
}

/// Typed view of a host object
pub enum Shape<'a> {
    Container(&'a dyn CarrierContainer),
    Point(&'a dyn ExtensionPoint),
    Keyed(&'a dyn KeyedCollection),
    Plain,
}

impl Shape<'_> {
    fn label(&self) -> &'static str {
        match self {
            Shape::Container(_) => "container",
            Shape::Point(_) => "extension point",
            Shape::Keyed(_) => "keyed collection",
            Shape::Plain => "plain object",
        }
    }
}

/// An object holding extension point carriers
pub trait CarrierContainer {
    fn member_names(&self) -> Vec<String>;

    /// Read a member; unknown names yield `Value::Undefined`
    fn member(&self, name: &str) -> HostResult<Value>;

    /// Host bookkeeping that must reach extensions unwrapped
    fn is_bookkeeping(&self, name: &str) -> bool {
        name.starts_with('_')
    }

    /// Immutable at observation time
    fn is_frozen(&self) -> bool {
        false
    }

    /// Every non-bookkeeping member must itself be a carrier
    fn is_strict(&self) -> bool {
        false
    }
}

/// A named slot where extensions register callbacks
pub trait ExtensionPoint {
    fn point_name(&self) -> &str;

    /// Registration operation for a completion convention, if supported
    fn registrar(&self, completion: Completion) -> Option<HostFn>;

    /// Any other member (call, isUsed, ...)
    fn member(&self, _name: &str) -> HostResult<Value> {
        Ok(Value::Undefined)
    }

    fn is_frozen(&self) -> bool {
        false
    }
}

/// A collection that yields an extension point per key
pub trait KeyedCollection {
    fn lookup(&self, key: &str) -> HostResult<Value>;

    fn member(&self, _name: &str) -> HostResult<Value> {
        Ok(Value::Undefined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierKind {
    Container,
    Point,
    Keyed,
}

impl CarrierKind {
    fn label(self) -> &'static str {
        match self {
            CarrierKind::Container => "container",
            CarrierKind::Point => "extension point",
            CarrierKind::Keyed => "keyed collection",
        }
    }
}

/// What the host adapter declares about its types
///
/// Lists the tags of each carrier kind plus the member paths (from the
/// pipeline root) of the run-started and run-finished extension points, and
/// optionally of the point the host calls when a run fails.
///
/// # Example
/// ```
/// use hooktime::carrier::HostProfile;
///
/// let profile = HostProfile::new()
///     .container("Compiler")
///     .point("Hook")
///     .keyed("HookMap")
///     .milestones(&["hooks", "compile"], &["hooks", "done"])
///     .failure(&["hooks", "failed"]);
/// assert!(profile.is_carrier_tag("Hook"));
/// assert_eq!(profile.run_failed().map(|path| path.len()), Some(2));
/// assert!(!profile.is_carrier_tag("Module"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct HostProfile {
    containers: BTreeSet<String>,
    points: BTreeSet<String>,
    keyed: BTreeSet<String>,
    run_started: Vec<String>,
    run_finished: Vec<String>,
    run_failed: Vec<String>,
}

impl HostProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container(mut self, tag: &str) -> Self {
        self.containers.insert(tag.to_string());
        self
    }

    pub fn point(mut self, tag: &str) -> Self {
        self.points.insert(tag.to_string());
        self
    }

    pub fn keyed(mut self, tag: &str) -> Self {
        self.keyed.insert(tag.to_string());
        self
    }

    pub fn milestones(mut self, started: &[&str], finished: &[&str]) -> Self {
        self.run_started = started.iter().map(|s| s.to_string()).collect();
        self.run_finished = finished.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Point called with the error when a run fails
    pub fn failure(mut self, failed: &[&str]) -> Self {
        self.run_failed = failed.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn run_started(&self) -> &[String] {
        &self.run_started
    }

    pub fn run_finished(&self) -> &[String] {
        &self.run_finished
    }

    pub fn run_failed(&self) -> Option<&[String]> {
        (!self.run_failed.is_empty()).then_some(self.run_failed.as_slice())
    }

    pub fn is_carrier_tag(&self, tag: &str) -> bool {
        self.kind_of_tag(tag).is_some()
    }

    fn kind_of_tag(&self, tag: &str) -> Option<CarrierKind> {
        if self.containers.contains(tag) {
            Some(CarrierKind::Container)
        } else if self.points.contains(tag) {
            Some(CarrierKind::Point)
        } else if self.keyed.contains(tag) {
            Some(CarrierKind::Keyed)
        } else {
            None
        }
    }

    /// Classify a host object
    ///
    /// `Ok(None)` for non-carriers. A declared carrier whose shape does not
    /// match its declared kind is rejected rather than guessed at.
    pub fn classify(&self, obj: &ObjectRef) -> Result<Option<CarrierKind>, Violation> {
        let Some(kind) = self.kind_of_tag(obj.type_tag()) else {
            return Ok(None);
        };
        let shape = obj.shape();
        let matches = matches!(
            (kind, &shape),
            (CarrierKind::Container, Shape::Container(_))
                | (CarrierKind::Point, Shape::Point(_))
                | (CarrierKind::Keyed, Shape::Keyed(_))
        );
        if !matches {
            tracing::debug!(
                tag = obj.type_tag(),
                exposed = shape.label(),
                "carrier shape mismatch"
            );
            return Err(Violation::UnrecognizedCarrier {
                tag: obj.type_tag().to_string(),
                expected: kind.label(),
            });
        }
        Ok(Some(kind))
    }

    /// Classify any value; only objects can be carriers
    pub fn classify_value(&self, value: &Value) -> Result<Option<CarrierKind>, Violation> {
        match value {
            Value::Object(obj) => self.classify(obj),
            _ => Ok(None),
        }
    }
}
