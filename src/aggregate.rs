//! Aggregation of a drained ledger into per-entity totals
//!
//! Algorithm:
//! 1. Every kind must be non-decreasing in time as appended.
//! 2. Exactly one start-of-run and one end-of-run milestone; their
//!    difference is the pipeline total.
//! 3. Callback and transform events are grouped by entity (first-seen
//!    order), then by correlation id. Each id must hold one start followed
//!    by one end. Grouping never relies on position, so interleaved deferred
//!    completions aggregate correctly.
//! 4. Transformers that collapse to the same display name raise a non-fatal
//!    advisory.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::config::ProfilerOptions;
use crate::error::Violation;
use crate::ledger::{EventKind, EventPhase, LedgerSnapshot, TimedEvent};
use crate::transformer::display_name;

/// How transformer entities are matched and displayed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationPolicy {
    /// Display names or absolute paths reported as ignored
    pub excluded_transformers: Vec<String>,
    pub group_by_absolute_path: bool,
}

impl AggregationPolicy {
    pub fn from_options(options: &ProfilerOptions) -> Self {
        Self {
            excluded_transformers: options.resource_transform.exclude.clone(),
            group_by_absolute_path: options.resource_transform.group_by_absolute_path,
        }
    }

    /// Exclusion matches either the display name or the full path
    pub fn is_excluded(&self, path: &str) -> bool {
        let name = display_name(path);
        self.excluded_transformers
            .iter()
            .any(|excluded| excluded == path || *excluded == name)
    }

    pub fn display_for(&self, path: &str) -> String {
        if self.group_by_absolute_path {
            path.replace('\\', "/")
        } else {
            display_name(path)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Measured(Duration),
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTotal {
    /// Extension name or transformer path
    pub name: String,
    pub display: String,
    pub invocations: usize,
    pub status: EntityStatus,
}

impl EntityTotal {
    pub fn duration(&self) -> Option<Duration> {
        match self.status {
            EntityStatus::Measured(total) => Some(total),
            EntityStatus::Ignored => None,
        }
    }
}

/// Non-fatal configuration finding, rendered alongside the results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    DisplayNameCollision { display: String, paths: Vec<String> },
    DuplicateExtension { name: String },
    FunctionMinimizer { name: String },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::DisplayNameCollision { display, paths } => write!(
                f,
                "transformers {} share the assumed name `{display}`",
                paths.join(", ")
            ),
            Advisory::DuplicateExtension { name } => write!(
                f,
                "extension `{name}` is used more than once; its timings are merged"
            ),
            Advisory::FunctionMinimizer { name } => write!(
                f,
                "minimizer `{name}` is a plain function and is not measured"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationResult {
    pub pipeline_total: Duration,
    pub extensions: Vec<EntityTotal>,
    pub transformers: Vec<EntityTotal>,
    pub advisories: Vec<Advisory>,
}

impl AggregationResult {
    /// (kind, display name) -> total, ignored entities left out
    ///
    /// An extension and a transformer sharing a display name stay apart.
    pub fn per_entity(&self) -> BTreeMap<(EventKind, String), Duration> {
        let extensions = self
            .extensions
            .iter()
            .map(|entity| (EventKind::ExtensionCallback, entity));
        let transformers = self
            .transformers
            .iter()
            .map(|entity| (EventKind::ResourceTransform, entity));

        let mut totals = BTreeMap::new();
        for (kind, entity) in extensions.chain(transformers) {
            if let Some(duration) = entity.duration() {
                *totals
                    .entry((kind, entity.display.clone()))
                    .or_insert(Duration::ZERO) += duration;
            }
        }
        totals
    }

    pub fn extensions_total(&self) -> Duration {
        self.extensions.iter().filter_map(EntityTotal::duration).sum()
    }

    pub fn transformers_total(&self) -> Duration {
        self.transformers.iter().filter_map(EntityTotal::duration).sum()
    }

    pub fn has_collisions(&self) -> bool {
        self.advisories
            .iter()
            .any(|a| matches!(a, Advisory::DisplayNameCollision { .. }))
    }
}

pub fn aggregate(
    snapshot: &LedgerSnapshot,
    policy: &AggregationPolicy,
) -> Result<AggregationResult, Violation> {
    for kind in EventKind::ALL {
        ensure_sorted(kind, snapshot.events(kind))?;
    }
    let pipeline_total = pipeline_total(snapshot.events(EventKind::PipelineMilestone))?;

    let mut extensions = Vec::new();
    for (name, events) in group_by_entity(snapshot.events(EventKind::ExtensionCallback)) {
        let (invocations, total) = sum_invocations(name, &events)?;
        extensions.push(EntityTotal {
            name: name.to_string(),
            display: name.to_string(),
            invocations,
            status: EntityStatus::Measured(total),
        });
    }

    let is_ignored = |path: &str| {
        policy.is_excluded(path) || snapshot.ignored_transformers.iter().any(|p| p == path)
    };
    let mut transformers = Vec::new();
    for (path, events) in group_by_entity(snapshot.events(EventKind::ResourceTransform)) {
        if is_ignored(path) {
            transformers.push(ignored(path));
            continue;
        }
        let (invocations, total) = sum_invocations(path, &events)?;
        transformers.push(EntityTotal {
            name: path.to_string(),
            display: policy.display_for(path),
            invocations,
            status: EntityStatus::Measured(total),
        });
    }
    for path in &snapshot.ignored_transformers {
        if !transformers.iter().any(|t| &t.name == path) {
            transformers.push(ignored(path));
        }
    }

    let advisories = display_collisions(&transformers);
    Ok(AggregationResult {
        pipeline_total,
        extensions,
        transformers,
        advisories,
    })
}

fn ignored(path: &str) -> EntityTotal {
    EntityTotal {
        name: path.to_string(),
        display: path.to_string(),
        invocations: 0,
        status: EntityStatus::Ignored,
    }
}

fn ensure_sorted(kind: EventKind, events: &[TimedEvent]) -> Result<(), Violation> {
    match events
        .windows(2)
        .position(|pair| pair[1].timestamp < pair[0].timestamp)
    {
        Some(index) => Err(Violation::OutOfOrder {
            kind,
            index: index + 1,
        }),
        None => Ok(()),
    }
}

fn pipeline_total(milestones: &[TimedEvent]) -> Result<Duration, Violation> {
    let single = |phase: EventPhase| {
        let mut matching = milestones.iter().filter(|e| e.phase == phase);
        match (matching.next(), matching.count()) {
            (None, _) => Err(Violation::MissingMilestone { phase }),
            (Some(event), 0) => Ok(event),
            (Some(_), extra) => Err(Violation::DuplicateMilestone {
                phase,
                count: extra + 1,
            }),
        }
    };
    let start = single(EventPhase::Start)?;
    let end = single(EventPhase::End)?;
    Ok(end.timestamp.duration_since(start.timestamp))
}

/// Group by entity, keeping first-seen order
fn group_by_entity(events: &[TimedEvent]) -> Vec<(&str, Vec<&TimedEvent>)> {
    let mut groups: Vec<(&str, Vec<&TimedEvent>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for event in events {
        let slot = *index.entry(event.entity.as_str()).or_insert_with(|| {
            groups.push((event.entity.as_str(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(event);
    }
    groups
}

/// Invocation count and summed duration of one entity's events
fn sum_invocations(entity: &str, events: &[&TimedEvent]) -> Result<(usize, Duration), Violation> {
    let mut order = Vec::new();
    let mut by_id: HashMap<_, Vec<&TimedEvent>> = HashMap::new();
    for &event in events {
        by_id
            .entry(event.correlation)
            .or_insert_with(|| {
                order.push(event.correlation);
                Vec::new()
            })
            .push(event);
    }

    let mut total = Duration::ZERO;
    for correlation in &order {
        let pair = &by_id[correlation];
        match pair.as_slice() {
            [start, end] if start.phase == EventPhase::Start && end.phase == EventPhase::End => {
                total += end.timestamp.duration_since(start.timestamp);
            }
            other => {
                let found = other
                    .iter()
                    .map(|e| e.phase.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(Violation::UnmatchedCorrelation {
                    entity: entity.to_string(),
                    correlation: *correlation,
                    found,
                });
            }
        }
    }
    Ok((order.len(), total))
}

fn display_collisions(transformers: &[EntityTotal]) -> Vec<Advisory> {
    let mut by_display: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for t in transformers.iter().filter(|t| t.duration().is_some()) {
        by_display.entry(&t.display).or_default().push(t.name.clone());
    }
    by_display
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .map(|(display, paths)| Advisory::DisplayNameCollision {
            display: display.to_string(),
            paths,
        })
        .collect()
}
