//! Start/end timing for one invocation
//!
//! Every instrumented callback and transformer phase goes through
//! [`InvocationSpan`]: reserving mints a correlation id, starting appends the
//! start event, closing appends the matching end event. The completion conventions
//! only decide *when* `close()` runs:
//!
//! | convention | end event appended |
//! |---|---|
//! | immediate | right after the original returns |
//! | signal | when the deferred handle completes, else as immediate |
//! | deferred | when the returned future resolves |
//!
//! The end event is appended on error results too, so a failing invocation
//! never leaves its correlation id unmatched.

use std::cell::Cell;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};

use crate::correlation::CorrelationId;
use crate::error::HostResult;
use crate::ledger::{EventDetail, EventKind, EventPhase, Recorder};
use crate::value::{Completer, Reply, Value};

pub struct InvocationSpan {
    recorder: Recorder,
    kind: EventKind,
    entity: String,
    correlation: CorrelationId,
    detail: EventDetail,
    started: Cell<bool>,
    closed: Cell<bool>,
}

impl InvocationSpan {
    /// Mint an id without recording anything yet
    pub fn reserve(
        recorder: &Recorder,
        kind: EventKind,
        entity: &str,
        detail: EventDetail,
    ) -> Rc<Self> {
        Rc::new(Self {
            recorder: recorder.clone(),
            kind,
            entity: entity.to_string(),
            correlation: recorder.mint(),
            detail,
            started: Cell::new(false),
            closed: Cell::new(false),
        })
    }

    /// Append the start event; later calls do nothing
    pub fn start(&self) {
        if self.started.replace(true) {
            return;
        }
        self.recorder.record(
            self.kind,
            self.correlation,
            &self.entity,
            EventPhase::Start,
            self.detail.clone(),
        );
    }

    /// Mint an id and append the start event
    pub fn open(
        recorder: &Recorder,
        kind: EventKind,
        entity: &str,
        detail: EventDetail,
    ) -> Rc<Self> {
        let span = Self::reserve(recorder, kind, entity, detail);
        span.start();
        span
    }

    pub fn correlation(&self) -> CorrelationId {
        self.correlation
    }

    /// Append the end event; later calls do nothing
    ///
    /// A span that never started closes without recording.
    pub fn close(&self) {
        if self.closed.replace(true) || !self.started.get() {
            return;
        }
        self.recorder.record(
            self.kind,
            self.correlation,
            &self.entity,
            EventPhase::End,
            self.detail.clone(),
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

pub(crate) fn settle_immediate<T>(span: Rc<InvocationSpan>, result: HostResult<T>) -> HostResult<T> {
    span.close();
    result
}

/// Run a signal-convention invocation against the host's completion slot
///
/// If the original deferred, the end waits for the handle and the host gets
/// `Reply::Pending`; otherwise the span closes as soon as `call` returns.
pub(crate) fn settle_on_signal(
    span: Rc<InvocationSpan>,
    completer: &Completer,
    call: impl FnOnce() -> HostResult<Reply>,
) -> HostResult<Reply> {
    let pending = span.clone();
    let observer = completer.on_settle(move || pending.close());
    let reply = call();
    if completer.is_deferred() && reply.is_ok() {
        return Ok(Reply::Pending);
    }
    // Settled here: the slot may be reused, so it must not keep this span
    if let Some(key) = observer {
        completer.detach(key);
    }
    settle_immediate(span, reply)
}

/// Close the span when `fut` resolves, passing its output through untouched
pub(crate) fn settle_deferred(
    span: Rc<InvocationSpan>,
    fut: LocalBoxFuture<'static, HostResult<Value>>,
) -> LocalBoxFuture<'static, HostResult<Value>> {
    async move {
        let output = fut.await;
        span.close();
        output
    }
    .boxed_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, Timestamp};
    use crate::ledger::TimedEvent;
    use futures::channel::oneshot;

    fn recorder() -> (Rc<ManualClock>, Recorder) {
        let clock = Rc::new(ManualClock::new());
        (clock.clone(), Recorder::new(clock))
    }

    fn phases(events: &[TimedEvent]) -> Vec<EventPhase> {
        events.iter().map(|e| e.phase).collect()
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_, recorder) = recorder();
        let span = InvocationSpan::open(&recorder, EventKind::ExtensionCallback, "X", EventDetail::None);
        span.close();
        span.close();
        let events = recorder.snapshot().extension_callbacks;
        assert_eq!(phases(&events), vec![EventPhase::Start, EventPhase::End]);
        assert!(events.iter().all(|e| e.correlation == span.correlation()));
    }

    #[test]
    fn test_signal_without_deferral_closes_on_return() {
        let (_, recorder) = recorder();
        let span = InvocationSpan::open(&recorder, EventKind::ExtensionCallback, "X", EventDetail::None);
        let completer = Completer::detached();
        let reply = settle_on_signal(span.clone(), &completer, || Ok(Reply::Ready(Value::string("done"))));
        assert!(matches!(reply, Ok(Reply::Ready(_))));
        assert!(span.is_closed());
        assert_eq!(Rc::strong_count(&span), 1);
    }

    #[test]
    fn test_reused_completer_only_closes_current_span() {
        let (clock, recorder) = recorder();
        let completer = Completer::detached();
        let first = InvocationSpan::open(&recorder, EventKind::ExtensionCallback, "A", EventDetail::None);
        settle_on_signal(first.clone(), &completer, || Ok(Reply::Ready(Value::Undefined))).unwrap();

        let second = InvocationSpan::open(&recorder, EventKind::ExtensionCallback, "B", EventDetail::None);
        let handle = completer.defer();
        let reply = settle_on_signal(second.clone(), &completer, || Ok(Reply::Ready(Value::Undefined)));
        assert!(matches!(reply, Ok(Reply::Pending)));

        clock.set_millis(9);
        handle.complete(Ok(Value::Undefined));
        assert!(second.is_closed());
        let ends: Vec<_> = recorder
            .snapshot()
            .extension_callbacks
            .into_iter()
            .filter(|e| e.phase == EventPhase::End)
            .map(|e| e.entity)
            .collect();
        assert_eq!(ends, vec!["A", "B"]);
        assert_eq!(Rc::strong_count(&first), 1);
    }

    #[test]
    fn test_reserved_span_records_on_start() {
        let (_, recorder) = recorder();
        let span = InvocationSpan::reserve(&recorder, EventKind::ExtensionCallback, "X", EventDetail::None);
        assert!(recorder.snapshot().is_empty());
        span.start();
        span.start();
        span.close();
        let events = recorder.snapshot().extension_callbacks;
        assert_eq!(phases(&events), vec![EventPhase::Start, EventPhase::End]);

        let unused = InvocationSpan::reserve(&recorder, EventKind::ExtensionCallback, "Y", EventDetail::None);
        unused.close();
        assert_eq!(recorder.snapshot().extension_callbacks.len(), 2);
    }

    #[test]
    fn test_signal_with_deferral_waits_for_handle() {
        let (clock, recorder) = recorder();
        let span = InvocationSpan::open(&recorder, EventKind::ExtensionCallback, "X", EventDetail::None);
        let completer = Completer::detached();
        let handle = completer.defer();
        let reply = settle_on_signal(span.clone(), &completer, || Ok(Reply::Ready(Value::Undefined)));
        assert!(matches!(reply, Ok(Reply::Pending)));
        assert!(!span.is_closed());

        clock.set_millis(40);
        handle.complete(Ok(Value::Undefined));
        assert!(span.is_closed());
        let events = recorder.snapshot().extension_callbacks;
        assert_eq!(events[1].timestamp, Timestamp::from_millis(40));
    }

    #[test]
    fn test_error_results_still_close() {
        let (_, recorder) = recorder();
        let span = InvocationSpan::open(&recorder, EventKind::ExtensionCallback, "X", EventDetail::None);
        let completer = Completer::detached();
        let _handle = completer.defer();
        let reply = settle_on_signal(span.clone(), &completer, || Err(anyhow::anyhow!("boom")));
        assert!(reply.is_err());
        assert!(span.is_closed());
    }

    #[test]
    fn test_deferred_closes_when_future_resolves() {
        let (clock, recorder) = recorder();
        let span = InvocationSpan::open(&recorder, EventKind::ExtensionCallback, "X", EventDetail::None);
        let (tx, rx) = oneshot::channel::<u32>();
        let fut = async move {
            let n = rx.await?;
            Ok::<_, anyhow::Error>(Value::Data(serde_json::json!(n)))
        }
        .boxed_local();
        let wrapped = settle_deferred(span.clone(), fut);

        let mut pool = futures::executor::LocalPool::new();
        let spawner = pool.spawner();
        let result = Rc::new(std::cell::RefCell::new(None));
        let sink = result.clone();
        futures::task::LocalSpawnExt::spawn_local(&spawner, async move {
            *sink.borrow_mut() = Some(wrapped.await);
        })
        .unwrap();

        pool.run_until_stalled();
        assert!(!span.is_closed());

        clock.set_millis(30);
        tx.send(7).unwrap();
        pool.run_until_stalled();
        assert!(span.is_closed());
        let value = result.borrow_mut().take().unwrap().unwrap();
        assert_eq!(value.as_str(), None);
        assert!(matches!(value, Value::Data(ref d) if d == &serde_json::json!(7)));
    }
}
