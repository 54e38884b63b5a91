//! Event ledger: append-only store of timed events
//!
//! Events are kept per kind in append order. A run is armed with
//! [`Recorder::begin_run`] and drained with [`Recorder::end_run`]; arming an
//! already armed ledger is a fatal usage error, never a silent no-op.
//!
//! Appends while disarmed come from hooks the host calls before its
//! run-started point. They are held back and open the next armed run.
//! [`Recorder::abort_run`] discards everything, armed or held back, when a
//! run fails.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

pub use crate::clock::Timestamp;
use crate::clock::{Clock, MonotonicClock};
use crate::correlation::{CorrelationId, IdMint};
use crate::error::Violation;
use crate::value::Completion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ResourceTransform,
    ExtensionCallback,
    PipelineMilestone,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::ResourceTransform,
        EventKind::ExtensionCallback,
        EventKind::PipelineMilestone,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::ResourceTransform => "resource-transform",
            EventKind::ExtensionCallback => "extension-callback",
            EventKind::PipelineMilestone => "pipeline-milestone",
        })
    }
}

/// Start or end of an invocation (for milestones: start or end of the run)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    Start,
    End,
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventPhase::Start => "start",
            EventPhase::End => "end",
        })
    }
}

/// Transformer phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformPhase {
    Pitch,
    Normal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDetail {
    #[default]
    None,
    Callback {
        completion: Completion,
    },
    Transform {
        phase: TransformPhase,
        resource: String,
    },
}

impl EventDetail {
    pub fn is_none(&self) -> bool {
        matches!(self, EventDetail::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub kind: EventKind,
    pub correlation: CorrelationId,
    /// Extension name, transformer path or run label
    pub entity: String,
    pub phase: EventPhase,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "EventDetail::is_none")]
    pub detail: EventDetail,
}

/// Drained ledger contents for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub resource_transforms: Vec<TimedEvent>,
    #[serde(default)]
    pub extension_callbacks: Vec<TimedEvent>,
    #[serde(default)]
    pub milestones: Vec<TimedEvent>,
    /// Transformers deliberately left uninstrumented
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored_transformers: Vec<String>,
}

impl LedgerSnapshot {
    /// Distribute events to their kind, keeping order
    pub fn from_events(events: impl IntoIterator<Item = TimedEvent>) -> Self {
        let mut snapshot = Self::default();
        for event in events {
            snapshot.events_mut(event.kind).push(event);
        }
        snapshot
    }

    pub fn events(&self, kind: EventKind) -> &[TimedEvent] {
        match kind {
            EventKind::ResourceTransform => &self.resource_transforms,
            EventKind::ExtensionCallback => &self.extension_callbacks,
            EventKind::PipelineMilestone => &self.milestones,
        }
    }

    fn events_mut(&mut self, kind: EventKind) -> &mut Vec<TimedEvent> {
        match kind {
            EventKind::ResourceTransform => &mut self.resource_transforms,
            EventKind::ExtensionCallback => &mut self.extension_callbacks,
            EventKind::PipelineMilestone => &mut self.milestones,
        }
    }

    pub fn len(&self) -> usize {
        self.resource_transforms.len() + self.extension_callbacks.len() + self.milestones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Default)]
pub struct EventLedger {
    run: Option<CorrelationId>,
    current: LedgerSnapshot,
    /// Appended while disarmed
    held: Vec<TimedEvent>,
    ignored: BTreeSet<String>,
}

impl EventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, event: TimedEvent) {
        if self.run.is_some() {
            self.current.events_mut(event.kind).push(event);
        } else {
            self.held.push(event);
        }
    }

    pub fn events(&self, kind: EventKind) -> &[TimedEvent] {
        self.current.events(kind)
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Arm the ledger for a run identified by `run`
    pub fn begin(&mut self, run: CorrelationId) -> Result<(), Violation> {
        if self.run.is_some() {
            return Err(Violation::AlreadyInitialized);
        }
        self.run = Some(run);
        for event in std::mem::take(&mut self.held) {
            self.current.events_mut(event.kind).push(event);
        }
        Ok(())
    }

    pub fn current_run(&self) -> Option<CorrelationId> {
        self.run
    }

    pub fn note_ignored(&mut self, path: &str) {
        self.ignored.insert(path.to_string());
    }

    /// Drain everything recorded, clear, and disarm
    pub fn finish(&mut self) -> Result<LedgerSnapshot, Violation> {
        if self.run.take().is_none() {
            return Err(Violation::NotInitialized);
        }
        let mut snapshot = std::mem::take(&mut self.current);
        snapshot.ignored_transformers = std::mem::take(&mut self.ignored).into_iter().collect();
        Ok(snapshot)
    }

    /// Drop everything recorded or held back, and disarm
    ///
    /// Returns how many events were discarded.
    pub fn abort(&mut self) -> usize {
        let discarded = self.len();
        self.run = None;
        self.current = LedgerSnapshot::default();
        self.held.clear();
        self.ignored.clear();
        discarded
    }

    /// Copy of the current contents, held-back events included, without draining
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut snapshot = self.current.clone();
        for event in &self.held {
            snapshot.events_mut(event.kind).push(event.clone());
        }
        snapshot.ignored_transformers = self.ignored.iter().cloned().collect();
        snapshot
    }

    pub fn len(&self) -> usize {
        self.current.len() + self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run-scoped recording context shared by every instrumented call
///
/// Cloning is cheap; all clones append to the same ledger.
#[derive(Clone)]
pub struct Recorder {
    ledger: Rc<RefCell<EventLedger>>,
    clock: Rc<dyn Clock>,
    ids: Rc<IdMint>,
}

impl Recorder {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            ledger: Rc::new(RefCell::new(EventLedger::new())),
            clock,
            ids: Rc::new(IdMint::new()),
        }
    }

    pub fn with_monotonic_clock() -> Self {
        Self::new(Rc::new(MonotonicClock::new()))
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn mint(&self) -> CorrelationId {
        self.ids.tick()
    }

    /// Append an event stamped with the current time
    pub fn record(
        &self,
        kind: EventKind,
        correlation: CorrelationId,
        entity: &str,
        phase: EventPhase,
        detail: EventDetail,
    ) {
        let timestamp = self.clock.now();
        self.ledger.borrow_mut().append(TimedEvent {
            kind,
            correlation,
            entity: entity.to_string(),
            phase,
            timestamp,
            detail,
        });
    }

    /// Arm the ledger and record the start-of-run milestone
    pub fn begin_run(&self, label: &str) -> Result<(), Violation> {
        let run = self.mint();
        self.ledger.borrow_mut().begin(run)?;
        self.record(
            EventKind::PipelineMilestone,
            run,
            label,
            EventPhase::Start,
            EventDetail::None,
        );
        Ok(())
    }

    /// Record the end-of-run milestone and drain the ledger
    pub fn end_run(&self, label: &str) -> Result<LedgerSnapshot, Violation> {
        let run = self
            .ledger
            .borrow()
            .current_run()
            .ok_or(Violation::NotInitialized)?;
        self.record(
            EventKind::PipelineMilestone,
            run,
            label,
            EventPhase::End,
            EventDetail::None,
        );
        self.ledger.borrow_mut().finish()
    }

    /// Disarm and discard the run in progress, if any
    pub fn abort_run(&self) -> usize {
        self.ledger.borrow_mut().abort()
    }

    pub fn is_running(&self) -> bool {
        self.ledger.borrow().is_running()
    }

    pub fn note_ignored(&self, path: &str) {
        self.ledger.borrow_mut().note_ignored(path);
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.ledger.borrow().snapshot()
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self.ledger.borrow();
        f.debug_struct("Recorder")
            .field("running", &ledger.is_running())
            .field("events", &ledger.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manual() -> (Rc<ManualClock>, Recorder) {
        let clock = Rc::new(ManualClock::new());
        let recorder = Recorder::new(clock.clone());
        (clock, recorder)
    }

    #[test]
    fn test_events_grouped_by_kind_in_append_order() {
        let (clock, recorder) = manual();
        let a = recorder.mint();
        let b = recorder.mint();
        recorder.record(
            EventKind::ExtensionCallback,
            a,
            "A",
            EventPhase::Start,
            EventDetail::None,
        );
        clock.set_millis(3);
        recorder.record(
            EventKind::ResourceTransform,
            b,
            "/loaders/b.js",
            EventPhase::Start,
            EventDetail::None,
        );
        clock.set_millis(5);
        recorder.record(
            EventKind::ExtensionCallback,
            a,
            "A",
            EventPhase::End,
            EventDetail::None,
        );

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.extension_callbacks.len(), 2);
        assert_eq!(snapshot.resource_transforms.len(), 1);
        assert_eq!(
            snapshot.extension_callbacks[1].timestamp,
            Timestamp::from_millis(5)
        );
    }

    #[test]
    fn test_events_before_begin_open_the_next_run() {
        let (clock, recorder) = manual();
        let early = recorder.mint();
        recorder.record(EventKind::ExtensionCallback, early, "Env", EventPhase::Start, EventDetail::None);
        recorder.record(EventKind::ExtensionCallback, early, "Env", EventPhase::End, EventDetail::None);
        assert_eq!(recorder.snapshot().extension_callbacks.len(), 2);

        clock.set_millis(2);
        recorder.begin_run("run").unwrap();
        let snapshot = recorder.end_run("run").unwrap();
        assert_eq!(snapshot.extension_callbacks.len(), 2);
        assert_eq!(snapshot.milestones.len(), 2);
        assert!(recorder.snapshot().is_empty());
    }

    #[test]
    fn test_abort_discards_and_disarms() {
        let (_, recorder) = manual();
        let held = recorder.mint();
        recorder.record(EventKind::ExtensionCallback, held, "Env", EventPhase::Start, EventDetail::None);
        assert_eq!(recorder.abort_run(), 1);

        recorder.begin_run("run").unwrap();
        let id = recorder.mint();
        recorder.record(EventKind::ResourceTransform, id, "/l/a.js", EventPhase::Start, EventDetail::None);
        recorder.note_ignored("/l/skip.js");
        assert_eq!(recorder.abort_run(), 2);
        assert!(!recorder.is_running());
        assert!(recorder.snapshot().is_empty());
        assert!(recorder.snapshot().ignored_transformers.is_empty());

        // A clean run follows
        recorder.begin_run("run").unwrap();
        let snapshot = recorder.end_run("run").unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.resource_transforms.is_empty());
    }

    #[test]
    fn test_double_begin_is_fatal() {
        let (_, recorder) = manual();
        recorder.begin_run("run").unwrap();
        assert_eq!(recorder.begin_run("run"), Err(Violation::AlreadyInitialized));
    }

    #[test]
    fn test_end_without_begin_is_fatal() {
        let (_, recorder) = manual();
        assert_eq!(
            recorder.end_run("run").unwrap_err(),
            Violation::NotInitialized
        );
    }

    #[test]
    fn test_end_run_drains_and_rearms() {
        let (clock, recorder) = manual();
        recorder.begin_run("run").unwrap();
        recorder.note_ignored("/loaders/skip.js");
        clock.set_millis(60);
        let snapshot = recorder.end_run("run").unwrap();

        assert_eq!(snapshot.milestones.len(), 2);
        assert_eq!(
            snapshot.milestones[0].correlation,
            snapshot.milestones[1].correlation
        );
        assert_eq!(snapshot.ignored_transformers, vec!["/loaders/skip.js"]);
        assert!(!recorder.is_running());
        assert!(recorder.snapshot().is_empty());

        // Re-armed for the next run
        recorder.begin_run("run").unwrap();
        assert!(recorder.is_running());
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let (_, recorder) = manual();
        recorder.begin_run("run").unwrap();
        let id = recorder.mint();
        recorder.record(
            EventKind::ResourceTransform,
            id,
            "/loaders/a.js",
            EventPhase::Start,
            EventDetail::Transform {
                phase: TransformPhase::Normal,
                resource: "/src/a.txt".to_string(),
            },
        );
        let snapshot = recorder.snapshot();
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"resource_transform\""));
        assert_eq!(LedgerSnapshot::from_json(&json).unwrap(), snapshot);
    }
}
