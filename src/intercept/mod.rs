//! Interception layer
//!
//! Every value passing from the host to an extension goes through
//! [`Interceptor::intercept`]. Non-carriers come back untouched. Carriers come
//! back as a wrapped view, created on first sight and cached by the
//! original's identity, so observing the same carrier twice yields the same
//! view (`Rc::ptr_eq`).
//!
//! ```text
//! host value ──▶ resolve (shim) ──▶ cached view? ──yes──▶ view
//!                                        │ no
//!                                        ▼
//!                      classify ──▶ frozen? ──▶ shadow copy
//!                                        │
//!                                        ▼
//!                        WrappedContainer / WrappedPoint / WrappedKeyed
//! ```
//!
//! Views hold only a weak reference back to the layer. Once the layer is
//! dropped they degrade to plain delegation.

mod views;


use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::carrier::{identity_of, CarrierKind, HostProfile, ObjectRef};
use crate::error::HostResult;
use crate::identity::IdentityShim;
use crate::ledger::Recorder;
use crate::value::{HostFn, Value};

use views::{ShadowContainer, ShadowPoint, WrappedContainer, WrappedKeyed, WrappedPoint};

/// Instrumented registrars, shared by every interceptor of a session
///
/// Keyed by the instrumented function's identity. Holding the function keeps
/// its address from being reused while the entry exists.
#[derive(Clone, Default)]
pub struct InstrumentedSet(Rc<RefCell<HashMap<usize, HostFn>>>);

impl InstrumentedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, f: &HostFn) {
        self.0.borrow_mut().insert(f.id(), f.clone());
    }

    pub fn contains(&self, f: &HostFn) -> bool {
        self.0.borrow().contains_key(&f.id())
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

pub(crate) struct LayerInner {
    pub(crate) extension: String,
    pub(crate) recorder: Recorder,
    shim: IdentityShim,
    profile: Rc<HostProfile>,
    /// original identity -> view
    views: RefCell<HashMap<usize, ObjectRef>>,
    /// frozen original identity -> shadow copy
    shadows: RefCell<HashMap<usize, ObjectRef>>,
    /// original registrar identity -> instrumented registrar
    pub(crate) registrars: RefCell<HashMap<usize, HostFn>>,
    pub(crate) instrumented: InstrumentedSet,
}

/// Per-extension interception layer
///
/// Events recorded through this layer are attributed to its extension name.
#[derive(Clone)]
pub struct Interceptor {
    inner: Rc<LayerInner>,
}

impl Interceptor {
    pub fn new(
        extension: &str,
        recorder: Recorder,
        shim: IdentityShim,
        profile: Rc<HostProfile>,
        instrumented: InstrumentedSet,
    ) -> Self {
        Self {
            inner: Rc::new(LayerInner {
                extension: extension.to_string(),
                recorder,
                shim,
                profile,
                views: RefCell::new(HashMap::new()),
                shadows: RefCell::new(HashMap::new()),
                registrars: RefCell::new(HashMap::new()),
                instrumented,
            }),
        }
    }

    pub fn extension(&self) -> &str {
        &self.inner.extension
    }

    /// Return `value` unchanged, or the cached view of the carrier it holds
    pub fn intercept(&self, value: &Value) -> HostResult<Value> {
        self.inner.intercept(value)
    }

    /// Instrumented counterpart of a registration operation
    pub fn wrap_registration(&self, registrar: &HostFn, completion: crate::value::Completion) -> HostFn {
        self.inner.wrap_registrar(registrar, completion)
    }

    /// Number of views created this run
    pub fn view_count(&self) -> usize {
        self.inner.views.borrow().len()
    }

    /// Forget every view, shadow and wrapped registrar (end of run)
    pub fn reset(&self) {
        self.inner.views.borrow_mut().clear();
        self.inner.shadows.borrow_mut().clear();
        self.inner.registrars.borrow_mut().clear();
    }
}

impl LayerInner {
    pub(crate) fn intercept(self: &Rc<Self>, value: &Value) -> HostResult<Value> {
        match value {
            Value::Object(obj) => Ok(Value::Object(self.intercept_object(obj)?)),
            _ => Ok(value.clone()),
        }
    }

    pub(crate) fn intercept_all(self: &Rc<Self>, args: &[Value]) -> HostResult<Vec<Value>> {
        args.iter().map(|arg| self.intercept(arg)).collect()
    }

    fn intercept_object(self: &Rc<Self>, obj: &ObjectRef) -> HostResult<ObjectRef> {
        // A view from any layer stands for its original
        let original = self.shim.resolve(obj);
        let addr = identity_of(&original);
        if let Some(view) = self.views.borrow().get(&addr) {
            return Ok(view.clone());
        }

        let Some(kind) = self.profile.classify(&original)? else {
            return Ok(obj.clone());
        };
        let layer = Rc::downgrade(self);
        let view: ObjectRef = match kind {
            CarrierKind::Container => {
                let target = if views::container_is_frozen(&original) {
                    self.shadow_of(&original, ShadowContainer::copy)?
                } else {
                    original.clone()
                };
                Rc::new(WrappedContainer::new(layer, original.clone(), target))
            }
            CarrierKind::Point => {
                let target = if views::point_is_frozen(&original) {
                    self.shadow_of(&original, ShadowPoint::copy)?
                } else {
                    original.clone()
                };
                Rc::new(WrappedPoint::new(layer, original.clone(), target))
            }
            CarrierKind::Keyed => Rc::new(WrappedKeyed::new(layer, original.clone())),
        };

        debug!(
            extension = %self.extension,
            tag = original.type_tag(),
            "wrapped carrier"
        );
        self.shim.alias(&view, &original);
        self.views.borrow_mut().insert(addr, view.clone());
        Ok(view)
    }

    /// Private mutable copy of a frozen carrier, made once per original
    fn shadow_of(
        &self,
        original: &ObjectRef,
        copy: impl FnOnce(&ObjectRef) -> HostResult<ObjectRef>,
    ) -> HostResult<ObjectRef> {
        let addr = identity_of(original);
        if let Some(shadow) = self.shadows.borrow().get(&addr) {
            return Ok(shadow.clone());
        }
        let shadow = copy(original)?;
        self.shim.alias(&shadow, original);
        self.shadows.borrow_mut().insert(addr, shadow.clone());
        Ok(shadow)
    }

    pub(crate) fn is_carrier(&self, value: &Value) -> HostResult<bool> {
        Ok(self.profile.classify_value(value)?.is_some())
    }

    pub(crate) fn profile(&self) -> &HostProfile {
        &self.profile
    }
}
