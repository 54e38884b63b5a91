// Wrapped views and shadow copies of extension point carriers
//
// Views report the original's type tag and delegate `as_any` to it, so host
// code downcasting a view still reaches its own concrete type.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use super::LayerInner;
use crate::carrier::{CarrierContainer, ExtensionPoint, HostObject, KeyedCollection, ObjectRef, Shape};
use crate::error::{HostResult, Violation};
use crate::value::{Completion, HostFn, Value};

pub(super) fn container_is_frozen(obj: &ObjectRef) -> bool {
    matches!(obj.shape(), Shape::Container(c) if c.is_frozen())
}

pub(super) fn point_is_frozen(obj: &ObjectRef) -> bool {
    matches!(obj.shape(), Shape::Point(p) if p.is_frozen())
}

pub(super) struct WrappedContainer {
    layer: Weak<LayerInner>,
    original: ObjectRef,
    /// The original, or its shadow copy when the original is frozen
    target: ObjectRef,
}

impl WrappedContainer {
    pub(super) fn new(layer: Weak<LayerInner>, original: ObjectRef, target: ObjectRef) -> Self {
        Self {
            layer,
            original,
            target,
        }
    }
}

impl HostObject for WrappedContainer {
    fn type_tag(&self) -> &str {
        self.original.type_tag()
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Container(self)
    }

    fn as_any(&self) -> &dyn Any {
        self.original.as_any()
    }
}

impl CarrierContainer for WrappedContainer {
    fn member_names(&self) -> Vec<String> {
        match self.target.shape() {
            Shape::Container(inner) => inner.member_names(),
            _ => Vec::new(),
        }
    }

    fn member(&self, name: &str) -> HostResult<Value> {
        let Shape::Container(inner) = self.target.shape() else {
            return Ok(Value::Undefined);
        };
        let value = inner.member(name)?;
        if inner.is_bookkeeping(name) {
            return Ok(value);
        }
        let Some(layer) = self.layer.upgrade() else {
            return Ok(value);
        };
        if inner.is_strict() && !value.is_undefined() && !layer.is_carrier(&value)? {
            return Err(Violation::UnrecognizedMember {
                container: self.original.type_tag().to_string(),
                member: name.to_string(),
            }
            .into());
        }
        layer.intercept(&value)
    }

    fn is_bookkeeping(&self, name: &str) -> bool {
        match self.target.shape() {
            Shape::Container(inner) => inner.is_bookkeeping(name),
            _ => false,
        }
    }

    fn is_strict(&self) -> bool {
        match self.target.shape() {
            Shape::Container(inner) => inner.is_strict(),
            _ => false,
        }
    }
}

pub(super) struct WrappedPoint {
    layer: Weak<LayerInner>,
    original: ObjectRef,
    target: ObjectRef,
}

impl WrappedPoint {
    pub(super) fn new(layer: Weak<LayerInner>, original: ObjectRef, target: ObjectRef) -> Self {
        Self {
            layer,
            original,
            target,
        }
    }
}

impl HostObject for WrappedPoint {
    fn type_tag(&self) -> &str {
        self.original.type_tag()
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Point(self)
    }

    fn as_any(&self) -> &dyn Any {
        self.original.as_any()
    }
}

impl ExtensionPoint for WrappedPoint {
    fn point_name(&self) -> &str {
        match self.target.shape() {
            Shape::Point(inner) => inner.point_name(),
            _ => "",
        }
    }

    fn registrar(&self, completion: Completion) -> Option<HostFn> {
        let Shape::Point(inner) = self.target.shape() else {
            return None;
        };
        let raw = inner.registrar(completion)?;
        match self.layer.upgrade() {
            Some(layer) => Some(layer.wrap_registrar(&raw, completion)),
            None => Some(raw),
        }
    }

    fn member(&self, name: &str) -> HostResult<Value> {
        match self.target.shape() {
            Shape::Point(inner) => inner.member(name),
            _ => Ok(Value::Undefined),
        }
    }
}

pub(super) struct WrappedKeyed {
    layer: Weak<LayerInner>,
    original: ObjectRef,
}

impl WrappedKeyed {
    pub(super) fn new(layer: Weak<LayerInner>, original: ObjectRef) -> Self {
        Self { layer, original }
    }
}

impl HostObject for WrappedKeyed {
    fn type_tag(&self) -> &str {
        self.original.type_tag()
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Keyed(self)
    }

    fn as_any(&self) -> &dyn Any {
        self.original.as_any()
    }
}

impl KeyedCollection for WrappedKeyed {
    fn lookup(&self, key: &str) -> HostResult<Value> {
        let Shape::Keyed(inner) = self.original.shape() else {
            return Ok(Value::Undefined);
        };
        let value = inner.lookup(key)?;
        let Some(layer) = self.layer.upgrade() else {
            return Ok(value);
        };
        let yields_point = match &value {
            Value::Object(obj) => matches!(obj.shape(), Shape::Point(_)) && layer.is_carrier(&value)?,
            _ => false,
        };
        if !yields_point {
            return Err(Violation::UnrecognizedCarrier {
                tag: format!("{}[{key}]", self.original.type_tag()),
                expected: "extension point",
            }
            .into());
        }
        layer.intercept(&value)
    }

    fn member(&self, name: &str) -> HostResult<Value> {
        match self.original.shape() {
            Shape::Keyed(inner) => inner.member(name),
            _ => Ok(Value::Undefined),
        }
    }
}

/// Owned copy of a frozen container
pub(super) struct ShadowContainer {
    original: ObjectRef,
    members: BTreeMap<String, Value>,
    bookkeeping: BTreeSet<String>,
    strict: bool,
}

impl ShadowContainer {
    pub(super) fn copy(original: &ObjectRef) -> HostResult<ObjectRef> {
        let Shape::Container(inner) = original.shape() else {
            return Err(Violation::UnrecognizedCarrier {
                tag: original.type_tag().to_string(),
                expected: "container",
            }
            .into());
        };
        let mut members = BTreeMap::new();
        let mut bookkeeping = BTreeSet::new();
        for name in inner.member_names() {
            if inner.is_bookkeeping(&name) {
                bookkeeping.insert(name.clone());
            }
            members.insert(name.clone(), inner.member(&name)?);
        }
        let strict = inner.is_strict();
        Ok(Rc::new(ShadowContainer {
            original: original.clone(),
            members,
            bookkeeping,
            strict,
        }))
    }
}

impl HostObject for ShadowContainer {
    fn type_tag(&self) -> &str {
        self.original.type_tag()
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Container(self)
    }

    fn as_any(&self) -> &dyn Any {
        self.original.as_any()
    }
}

impl CarrierContainer for ShadowContainer {
    fn member_names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    fn member(&self, name: &str) -> HostResult<Value> {
        Ok(self.members.get(name).cloned().unwrap_or_default())
    }

    fn is_bookkeeping(&self, name: &str) -> bool {
        self.bookkeeping.contains(name) || name.starts_with('_')
    }

    fn is_strict(&self) -> bool {
        self.strict
    }
}

/// Owned copy of a frozen extension point
pub(super) struct ShadowPoint {
    original: ObjectRef,
    name: String,
    registrars: [Option<HostFn>; 3],
}

impl ShadowPoint {
    pub(super) fn copy(original: &ObjectRef) -> HostResult<ObjectRef> {
        let Shape::Point(inner) = original.shape() else {
            return Err(Violation::UnrecognizedCarrier {
                tag: original.type_tag().to_string(),
                expected: "extension point",
            }
            .into());
        };
        let registrars = Completion::ALL.map(|completion| inner.registrar(completion));
        let name = inner.point_name().to_string();
        Ok(Rc::new(ShadowPoint {
            original: original.clone(),
            name,
            registrars,
        }))
    }
}

impl HostObject for ShadowPoint {
    fn type_tag(&self) -> &str {
        self.original.type_tag()
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Point(self)
    }

    fn as_any(&self) -> &dyn Any {
        self.original.as_any()
    }
}

impl ExtensionPoint for ShadowPoint {
    fn point_name(&self) -> &str {
        &self.name
    }

    fn registrar(&self, completion: Completion) -> Option<HostFn> {
        self.registrars[completion.index()].clone()
    }

    fn member(&self, name: &str) -> HostResult<Value> {
        match self.original.shape() {
            Shape::Point(inner) => inner.member(name),
            _ => Ok(Value::Undefined),
        }
    }
}
