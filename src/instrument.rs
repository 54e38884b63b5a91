//! Callback instrumentation
//!
//! A wrapped extension point hands out instrumented registration operations.
//! Registering through one substitutes an instrumented callback for the
//! extension's own; every invocation of that callback then runs inside an
//! [`InvocationSpan`] attributed to the extension.
//!
//! Registrars are wrapped at most once: the wrapped function is cached by the
//! original's identity, and a function that already is an instrumented
//! registrar is handed back as is. Re-wrapping therefore never double-times
//! an invocation.

use std::rc::{Rc, Weak};

use futures::future::{self, FutureExt};
use tracing::debug;

use crate::error::Violation;
use crate::intercept::LayerInner;
use crate::ledger::{EventDetail, EventKind};
use crate::span::{settle_deferred, settle_immediate, settle_on_signal, InvocationSpan};
use crate::value::{Callback, Completion, HostFn, Value};

impl LayerInner {
    pub(crate) fn wrap_registrar(self: &Rc<Self>, raw: &HostFn, completion: Completion) -> HostFn {
        if self.instrumented.contains(raw) {
            return raw.clone();
        }
        if let Some(wrapped) = self.registrars.borrow().get(&raw.id()) {
            return wrapped.clone();
        }
        let wrapped = instrument_registrar(Rc::downgrade(self), raw.clone(), completion);
        debug!(
            extension = %self.extension,
            registrar = completion.registrar_name(),
            "instrumented registrar"
        );
        self.instrumented.insert(&wrapped);
        self.registrars
            .borrow_mut()
            .insert(raw.id(), wrapped.clone());
        wrapped
    }

    fn reserve_span(&self, completion: Completion) -> Rc<InvocationSpan> {
        InvocationSpan::reserve(
            &self.recorder,
            EventKind::ExtensionCallback,
            &self.extension,
            EventDetail::Callback { completion },
        )
    }

    /// Substitute for an extension's callback
    pub(crate) fn instrument_callback(self: &Rc<Self>, callback: Callback) -> Callback {
        let layer = Rc::downgrade(self);
        match callback {
            Callback::Immediate(original) => Callback::immediate(move |args: &[Value]| {
                let Some(layer) = layer.upgrade() else {
                    return original(args);
                };
                let span = layer.reserve_span(Completion::Immediate);
                let args = layer.intercept_all(args)?;
                span.start();
                settle_immediate(span, original(&args))
            }),
            Callback::Signal(original) => Callback::signal(move |args: &[Value], completer| {
                let Some(layer) = layer.upgrade() else {
                    return original(args, completer);
                };
                let span = layer.reserve_span(Completion::Signal);
                let args = layer.intercept_all(args)?;
                span.start();
                settle_on_signal(span, completer, || original(&args, completer))
            }),
            Callback::Deferred(original) => Callback::Deferred(Rc::new(move |args: &[Value]| {
                let Some(layer) = layer.upgrade() else {
                    return original(args);
                };
                let span = layer.reserve_span(Completion::Deferred);
                let args = match layer.intercept_all(args) {
                    Ok(args) => args,
                    Err(err) => return future::ready(Err(err)).boxed_local(),
                };
                span.start();
                settle_deferred(span, original(&args))
            })),
        }
    }
}

fn instrument_registrar(layer: Weak<LayerInner>, raw: HostFn, completion: Completion) -> HostFn {
    let registrar = completion.registrar_name();
    HostFn::new(move |args: &[Value]| {
        if args.len() != 2 {
            return Err(Violation::RegistrationArity {
                registrar,
                got: args.len(),
            }
            .into());
        }
        let callback = match &args[1] {
            Value::Callback(cb) if cb.completion() == completion => cb.clone(),
            Value::Callback(cb) => {
                return Err(Violation::CallbackConvention {
                    registrar,
                    expected: completion.label(),
                    found: cb.completion().label(),
                }
                .into())
            }
            _ => {
                return Err(Violation::CallbackConvention {
                    registrar,
                    expected: completion.label(),
                    found: "non-callback value",
                }
                .into())
            }
        };
        let Some(layer) = layer.upgrade() else {
            return raw.call(args);
        };
        let instrumented = layer.instrument_callback(callback);
        raw.call(&[args[0].clone(), Value::Callback(instrumented)])
    })
}
