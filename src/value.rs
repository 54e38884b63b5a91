//! Values exchanged between the host pipeline and its extensions
//!
//! The host hands extensions a graph of `Value`s: plain data, host objects
//! (some of which are extension point carriers), host functions such as
//! registration operations, and extension callbacks. Everything is reference
//! counted, so cloning a `Value` never copies the object it points at.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};

use crate::carrier::{identity_of, ObjectRef, Shape};
use crate::error::HostResult;

/// How a registered callback reports that it is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Done when the callback returns
    Immediate,
    /// May request a completion handle and finish later
    Signal,
    /// Returns a future; done when it resolves
    Deferred,
}

impl Completion {
    pub const ALL: [Completion; 3] = [
        Completion::Immediate,
        Completion::Signal,
        Completion::Deferred,
    ];

    /// Name of the registration operation for this convention
    pub fn registrar_name(self) -> &'static str {
        match self {
            Completion::Immediate => "tap",
            Completion::Signal => "tapAsync",
            Completion::Deferred => "tapPromise",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Completion::Immediate => "immediate",
            Completion::Signal => "signal",
            Completion::Deferred => "deferred",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Completion::Immediate => 0,
            Completion::Signal => 1,
            Completion::Deferred => 2,
        }
    }
}

/// A host function, e.g. the registration operation of an extension point
#[derive(Clone)]
pub struct HostFn(Rc<dyn Fn(&[Value]) -> HostResult<Value>>);

impl HostFn {
    pub fn new(f: impl Fn(&[Value]) -> HostResult<Value> + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> HostResult<Value> {
        (self.0)(args)
    }

    /// Identity of the underlying function object
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn same(&self, other: &HostFn) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFn({:#x})", self.id())
    }
}

pub type ImmediateFn = Rc<dyn Fn(&[Value]) -> HostResult<Value>>;
pub type SignalFn = Rc<dyn Fn(&[Value], &Completer) -> HostResult<Reply>>;
pub type DeferredFn = Rc<dyn Fn(&[Value]) -> LocalBoxFuture<'static, HostResult<Value>>>;

/// An extension callback, tagged with its completion convention
#[derive(Clone)]
pub enum Callback {
    Immediate(ImmediateFn),
    Signal(SignalFn),
    Deferred(DeferredFn),
}

impl Callback {
    pub fn immediate(f: impl Fn(&[Value]) -> HostResult<Value> + 'static) -> Self {
        Callback::Immediate(Rc::new(f))
    }

    pub fn signal(f: impl Fn(&[Value], &Completer) -> HostResult<Reply> + 'static) -> Self {
        Callback::Signal(Rc::new(f))
    }

    /// Build a deferred callback from any function returning a future
    ///
    /// The future cannot borrow the arguments; clone what it needs.
    pub fn deferred<F, Fut>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Fut + 'static,
        Fut: Future<Output = HostResult<Value>> + 'static,
    {
        Callback::Deferred(Rc::new(move |args: &[Value]| f(args).boxed_local()))
    }

    pub fn completion(&self) -> Completion {
        match self {
            Callback::Immediate(_) => Completion::Immediate,
            Callback::Signal(_) => Completion::Signal,
            Callback::Deferred(_) => Completion::Deferred,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({})", self.completion().label())
    }
}

/// What a signal-convention callback or transformer returns to the host
#[derive(Debug, Clone)]
pub enum Reply {
    Ready(Value),
    /// The result will arrive through the completion handle
    Pending,
}

type Sink = Box<dyn FnOnce(HostResult<Value>)>;
type Observer = Box<dyn FnOnce()>;

/// Registration of a settle observer, used to detach it again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ObserverKey(u64);

#[derive(Default)]
struct CompleterState {
    deferred: bool,
    settled: bool,
    sink: Option<Sink>,
    observers: Vec<(ObserverKey, Observer)>,
    next_key: u64,
}

/// Completion slot handed to a signal-convention callback
///
/// The callback either returns `Reply::Ready` without touching the slot, or
/// calls [`Completer::defer`] and later completes the returned handle.
#[derive(Clone)]
pub struct Completer(Rc<RefCell<CompleterState>>);

impl Completer {
    /// Create a slot whose eventual result goes to `sink`
    pub fn new(sink: impl FnOnce(HostResult<Value>) + 'static) -> Self {
        Self(Rc::new(RefCell::new(CompleterState {
            sink: Some(Box::new(sink)),
            ..CompleterState::default()
        })))
    }

    /// A slot nobody listens to
    pub fn detached() -> Self {
        Self(Rc::new(RefCell::new(CompleterState::default())))
    }

    /// Request a completion handle; the result is now pending
    pub fn defer(&self) -> CompletionHandle {
        self.0.borrow_mut().deferred = true;
        CompletionHandle(self.clone())
    }

    pub fn is_deferred(&self) -> bool {
        self.0.borrow().deferred
    }

    pub fn is_settled(&self) -> bool {
        self.0.borrow().settled
    }

    /// Run `f` once the slot settles (immediately if it already has)
    ///
    /// Returns the key to [`Completer::detach`] a still-waiting observer.
    pub(crate) fn on_settle(&self, f: impl FnOnce() + 'static) -> Option<ObserverKey> {
        let mut state = self.0.borrow_mut();
        if state.settled {
            drop(state);
            f();
            return None;
        }
        let key = ObserverKey(state.next_key);
        state.next_key += 1;
        state.observers.push((key, Box::new(f)));
        Some(key)
    }

    /// Drop an observer that has not run yet
    pub(crate) fn detach(&self, key: ObserverKey) {
        self.0.borrow_mut().observers.retain(|(k, _)| *k != key);
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.borrow();
        f.debug_struct("Completer")
            .field("deferred", &state.deferred)
            .field("settled", &state.settled)
            .finish()
    }
}

/// Handle returned by [`Completer::defer`]
#[derive(Debug, Clone)]
pub struct CompletionHandle(Completer);

impl CompletionHandle {
    /// Settle the slot. Only the first completion counts.
    ///
    /// Observers run before the host's sink sees the result.
    pub fn complete(&self, result: HostResult<Value>) {
        let (observers, sink) = {
            let mut state = (self.0).0.borrow_mut();
            if state.settled {
                return;
            }
            state.settled = true;
            (std::mem::take(&mut state.observers), state.sink.take())
        };
        for (_, observer) in observers {
            observer();
        }
        if let Some(sink) = sink {
            sink(result);
        }
    }
}

/// Any value flowing between the host and an extension
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Data(serde_json::Value),
    Object(ObjectRef),
    Function(HostFn),
    Callback(Callback),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Data(serde_json::Value::String(s.into()))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Data(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&HostFn> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Read a member of a container, keyed collection or extension point
    ///
    /// Anything else (or a missing member) yields `Value::Undefined`.
    pub fn get(&self, member: &str) -> HostResult<Value> {
        let Some(obj) = self.as_object() else {
            return Ok(Value::Undefined);
        };
        match obj.shape() {
            Shape::Container(c) => c.member(member),
            Shape::Point(p) => p.member(member),
            Shape::Keyed(k) => k.member(member),
            Shape::Plain => Ok(Value::Undefined),
        }
    }

    /// Look up a key on a keyed collection of extension points
    pub fn lookup(&self, key: &str) -> HostResult<Value> {
        match self.as_object().map(|obj| obj.shape()) {
            Some(Shape::Keyed(k)) => k.lookup(key),
            _ => anyhow::bail!("value is not a keyed collection; cannot look up `{key}`"),
        }
    }

    /// Register `callback` on this extension point under `name`
    pub fn register(&self, name: &str, callback: Callback) -> HostResult<Value> {
        self.register_with(Value::string(name), callback)
    }

    /// Register with a full options value (`{"name": .., "stage": ..}`)
    pub fn register_with(&self, options: Value, callback: Callback) -> HostResult<Value> {
        let completion = callback.completion();
        let registrar = match self.as_object().map(|obj| obj.shape()) {
            Some(Shape::Point(p)) => p.registrar(completion),
            _ => anyhow::bail!("value is not an extension point; cannot register a callback"),
        };
        let Some(registrar) = registrar else {
            anyhow::bail!(
                "extension point does not support `{}`",
                completion.registrar_name()
            );
        };
        registrar.call(&[options, Value::Callback(callback)])
    }

    pub fn tap(
        &self,
        name: &str,
        f: impl Fn(&[Value]) -> HostResult<Value> + 'static,
    ) -> HostResult<Value> {
        self.register(name, Callback::immediate(f))
    }

    pub fn tap_async(
        &self,
        name: &str,
        f: impl Fn(&[Value], &Completer) -> HostResult<Reply> + 'static,
    ) -> HostResult<Value> {
        self.register(name, Callback::signal(f))
    }

    pub fn tap_promise<F, Fut>(&self, name: &str, f: F) -> HostResult<Value>
    where
        F: Fn(&[Value]) -> Fut + 'static,
        Fut: Future<Output = HostResult<Value>> + 'static,
    {
        self.register(name, Callback::deferred(f))
    }

    /// Same underlying object (or function)
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => identity_of(a) == identity_of(b),
            (Value::Function(a), Value::Function(b)) => a.same(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Data(data) => write!(f, "Data({data})"),
            Value::Object(obj) => write!(f, "Object({}@{:#x})", obj.type_tag(), identity_of(obj)),
            Value::Function(func) => fmt::Debug::fmt(func, f),
            Value::Callback(cb) => fmt::Debug::fmt(cb, f),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(data: serde_json::Value) -> Self {
        Value::Data(data)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Object(obj)
    }
}
