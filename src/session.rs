//! Profiling session
//!
//! A [`Profiler`] owns everything scoped to a profiled pipeline: the
//! recorder and its ledger, the identity shim, the per-extension
//! interceptors, and the advisories collected while wrapping. Hosts reach it
//! through three seams:
//!
//! - [`Profiler::wrap_config`] rewrites a [`PipelineConfig`] before the host
//!   is built from it,
//! - [`Profiler::transformer_loader`] wraps the host's module loader,
//! - [`Profiler::identity_shim`] backs the host's identity-keyed tables.
//!
//! The run itself is bracketed by the milestone extension that
//! `wrap_config` appends: start-of-run arms the ledger, end-of-run drains
//! it, aggregates, and writes the report. A failed run is discarded.
//!
//! Configurations wrapped together by [`Profiler::wrap_configs`] form one
//! run group. Each of them carries a milestone extension, so any of them may
//! run alone; when several run at once they share one armed run, and the
//! report is written when the last one finishes.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::aggregate::{aggregate, Advisory, AggregationResult};
use crate::carrier::HostProfile;
use crate::clock::{Clock, MonotonicClock};
use crate::config::ProfilerOptions;
use crate::error::{HostResult, Violation};
use crate::extension::{normalize_rules, Extension, Minimizer, PipelineConfig};
use crate::identity::IdentityShim;
use crate::intercept::{InstrumentedSet, Interceptor};
use crate::ledger::Recorder;
use crate::report::{render, write_report};
use crate::transformer::{install_load_interceptor, instrument_transformer, LoadInterceptor, ModuleLoader};
use crate::value::{Callback, Value};

/// Registration name of the milestone callbacks
pub const MILESTONE_NAME: &str = "hooktime";
/// Entity name of the pipeline milestone events
pub const RUN_LABEL: &str = "pipeline";

const FIRST_STAGE: i64 = -1000;
const LAST_STAGE: i64 = 1000;

/// Group members currently inside the armed run
struct ActiveRun {
    group: usize,
    members: BTreeSet<usize>,
    failed: bool,
}

struct Session {
    options: ProfilerOptions,
    profile: Rc<HostProfile>,
    recorder: Recorder,
    shim: IdentityShim,
    instrumented: InstrumentedSet,
    interceptors: RefCell<Vec<Interceptor>>,
    loaders: RefCell<Vec<LoadInterceptor>>,
    seen_extensions: RefCell<BTreeSet<String>>,
    advisories: RefCell<Vec<Advisory>>,
    last_result: RefCell<Option<AggregationResult>>,
    active: RefCell<Option<ActiveRun>>,
    groups: Cell<usize>,
    color: Cell<bool>,
}

/// Handle to a profiling session; clones share the session
#[derive(Clone)]
pub struct Profiler {
    inner: Rc<Session>,
}

impl Profiler {
    pub fn new(options: ProfilerOptions, profile: HostProfile) -> Result<Self, Violation> {
        Self::with_clock(options, profile, Rc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        options: ProfilerOptions,
        profile: HostProfile,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, Violation> {
        options.validate().map_err(Violation::InvalidOptions)?;
        Ok(Self {
            inner: Rc::new(Session {
                options,
                profile: Rc::new(profile),
                recorder: Recorder::new(clock),
                shim: IdentityShim::new(),
                instrumented: InstrumentedSet::new(),
                interceptors: RefCell::new(Vec::new()),
                loaders: RefCell::new(Vec::new()),
                seen_extensions: RefCell::new(BTreeSet::new()),
                advisories: RefCell::new(Vec::new()),
                last_result: RefCell::new(None),
                active: RefCell::new(None),
                groups: Cell::new(0),
                color: Cell::new(false),
            }),
        })
    }

    pub fn options(&self) -> &ProfilerOptions {
        &self.inner.options
    }

    pub fn recorder(&self) -> &Recorder {
        &self.inner.recorder
    }

    /// Shim the host must key its identity-keyed tables through
    pub fn identity_shim(&self) -> IdentityShim {
        self.inner.shim.clone()
    }

    /// Color durations in reports written to stdout
    pub fn set_color(&self, color: bool) {
        self.inner.color.set(color);
    }

    /// Result of the most recently finished run
    pub fn last_result(&self) -> Option<AggregationResult> {
        self.inner.last_result.borrow().clone()
    }

    /// Advisories raised while wrapping configurations
    pub fn advisories(&self) -> Vec<Advisory> {
        self.inner.advisories.borrow().clone()
    }

    fn advise(&self, advisory: Advisory) {
        warn!(%advisory, "profiling advisory");
        self.inner.advisories.borrow_mut().push(advisory);
    }

    /// Wrap an extension so its callbacks are timed
    ///
    /// Returned unchanged when callback instrumentation is off or the
    /// extension is excluded by name.
    pub fn wrap_extension(&self, extension: Rc<dyn Extension>) -> Rc<dyn Extension> {
        let options = &self.inner.options;
        let name = extension.name().to_string();
        if !options.callbacks_enabled() || options.is_extension_excluded(&name) {
            debug!(extension = %name, "extension left unwrapped");
            return extension;
        }
        if !self.inner.seen_extensions.borrow_mut().insert(name.clone()) {
            self.advise(Advisory::DuplicateExtension { name: name.clone() });
        }

        let interceptor = Interceptor::new(
            &name,
            self.inner.recorder.clone(),
            self.inner.shim.clone(),
            self.inner.profile.clone(),
            self.inner.instrumented.clone(),
        );
        self.inner.interceptors.borrow_mut().push(interceptor.clone());
        Rc::new(InstrumentedExtension {
            inner: extension,
            interceptor,
        })
    }

    /// Extension that brackets each run with the pipeline milestones
    pub fn milestone_extension(&self) -> Rc<dyn Extension> {
        self.group_milestone(self.next_group(), 0)
    }

    fn next_group(&self) -> usize {
        let group = self.inner.groups.get();
        self.inner.groups.set(group + 1);
        group
    }

    fn group_milestone(&self, group: usize, member: usize) -> Rc<dyn Extension> {
        Rc::new(MilestoneExtension {
            profiler: self.clone(),
            group,
            member,
        })
    }

    /// Whether a group member is inside the armed run
    pub fn in_run(&self) -> bool {
        self.inner.active.borrow().is_some()
    }

    /// A group member reached its run-started point
    ///
    /// The first member arms the ledger; members of the same group join the
    /// armed run. Anything else while a run is armed is a nested run.
    fn enter_run(&self, group: usize, member: usize) -> Result<(), Violation> {
        let mut active = self.inner.active.borrow_mut();
        if let Some(run) = active.as_mut() {
            if run.group == group && run.members.insert(member) {
                debug!(group, member, "joined pipeline run");
                return Ok(());
            }
            return Err(Violation::AlreadyInitialized);
        }
        self.begin_run()?;
        *active = Some(ActiveRun {
            group,
            members: BTreeSet::from([member]),
            failed: false,
        });
        Ok(())
    }

    /// A group member reached its run-finished point
    ///
    /// The last member out finishes the run, or discards it when another
    /// member failed.
    fn leave_run(&self, group: usize, member: usize) -> anyhow::Result<()> {
        let (emptied, failed) = {
            let mut active = self.inner.active.borrow_mut();
            let (left, emptied, failed) = match active.as_mut() {
                Some(run) if run.group == group => {
                    let left = run.members.remove(&member);
                    (left, run.members.is_empty(), run.failed)
                }
                _ => (false, false, false),
            };
            if !left {
                return Err(Violation::NotInitialized.into());
            }
            if emptied {
                *active = None;
            }
            (emptied, failed)
        };
        match (emptied, failed) {
            (true, false) => {
                self.finish_run()?;
            }
            (true, true) => self.discard_run(),
            _ => debug!(group, member, "left pipeline run"),
        }
        Ok(())
    }

    /// A group member's run failed
    ///
    /// The run is discarded once no member is left inside it. A failure
    /// before the run started discards the events held back for it.
    fn fail_run(&self, group: usize, member: usize) {
        let discard = {
            let mut active = self.inner.active.borrow_mut();
            let emptied = match active.as_mut() {
                Some(run) if run.group == group => {
                    run.members.remove(&member);
                    run.failed = true;
                    run.members.is_empty()
                }
                _ => false,
            };
            if emptied {
                *active = None;
            }
            active.is_none()
        };
        if discard {
            self.discard_run();
        }
    }

    /// Drop the run in progress without reporting it
    fn discard_run(&self) {
        let discarded = self.inner.recorder.abort_run();
        self.reset_caches();
        warn!(discarded, "pipeline run failed; its timings are discarded");
    }

    /// Arm the ledger and record start-of-run
    pub fn begin_run(&self) -> Result<(), Violation> {
        debug!("pipeline run started");
        self.inner.recorder.begin_run(RUN_LABEL)
    }

    /// Record end-of-run, aggregate, and write the report
    ///
    /// Interceptor caches and transformer substitutions are reset, so the
    /// next run starts from fresh views.
    pub fn finish_run(&self) -> anyhow::Result<AggregationResult> {
        let snapshot = self.inner.recorder.end_run(RUN_LABEL)?;
        self.reset_caches();

        let mut result = aggregate(&snapshot, &self.inner.options.policy())?;
        for advisory in &result.advisories {
            warn!(%advisory, "profiling advisory");
        }
        result
            .advisories
            .extend(self.inner.advisories.borrow().iter().cloned());

        let report = self.render(&result)?;
        write_report(&report, self.inner.options.output_file.as_deref())?;
        debug!(
            total = ?result.pipeline_total,
            events = snapshot.len(),
            "pipeline run finished"
        );
        *self.inner.last_result.borrow_mut() = Some(result.clone());
        Ok(result)
    }

    /// Render a result in the configured format
    pub fn render(&self, result: &AggregationResult) -> anyhow::Result<String> {
        let options = &self.inner.options;
        let color = self.inner.color.get() && options.output_file.is_none();
        render(result, options, color)
    }

    fn reset_caches(&self) {
        for interceptor in self.inner.interceptors.borrow().iter() {
            interceptor.reset();
        }
        for loader in self.inner.loaders.borrow().iter() {
            loader.clear_substitutions();
        }
        self.inner.instrumented.clear();
        self.inner.shim.prune();
    }

    /// Module loader that serves instrumented transformers
    ///
    /// Excluded transformers are served untouched and reported as ignored.
    pub fn transformer_loader(&self, real: Rc<dyn ModuleLoader>) -> LoadInterceptor {
        let recorder = self.inner.recorder.clone();
        let policy = self.inner.options.policy();
        let loader = install_load_interceptor(real, Vec::new(), move |module, path| {
            if policy.is_excluded(path) {
                debug!(path, "transformer excluded");
                recorder.note_ignored(path);
                return Ok(module);
            }
            instrument_transformer(&recorder, module, path)
        });
        if !self.inner.options.transforms_enabled() {
            loader.uninstall();
        }
        self.inner.loaders.borrow_mut().push(loader.clone());
        loader
    }

    /// Rewrite a configuration for profiling
    ///
    /// Returned untouched when profiling is disabled.
    pub fn wrap_config(&self, config: PipelineConfig) -> HostResult<PipelineConfig> {
        if !self.inner.options.is_enabled() {
            return Ok(config);
        }
        let mut config = self.instrument_config(config)?;
        config.extensions.push(self.milestone_extension());
        Ok(config)
    }

    /// Rewrite several configurations run together
    ///
    /// Every configuration gets a milestone extension of one shared group:
    /// each can run on its own, and concurrent runs are reported once.
    pub fn wrap_configs(&self, configs: Vec<PipelineConfig>) -> HostResult<Vec<PipelineConfig>> {
        if !self.inner.options.is_enabled() {
            return Ok(configs);
        }
        let group = self.next_group();
        configs
            .into_iter()
            .enumerate()
            .map(|(member, config)| {
                let mut config = self.instrument_config(config)?;
                config.extensions.push(self.group_milestone(group, member));
                Ok(config)
            })
            .collect()
    }

    fn instrument_config(&self, config: PipelineConfig) -> HostResult<PipelineConfig> {
        let extensions = config
            .extensions
            .into_iter()
            .map(|ext| self.wrap_extension(ext))
            .collect();
        let minimizers = config
            .minimizers
            .into_iter()
            .map(|minimizer| match minimizer {
                Minimizer::Extension(ext) => Minimizer::Extension(self.wrap_extension(ext)),
                Minimizer::Function { name, run } => {
                    if self.inner.options.callbacks_enabled() {
                        self.advise(Advisory::FunctionMinimizer { name: name.clone() });
                    }
                    Minimizer::Function { name, run }
                }
            })
            .collect();
        let rules = if self.inner.options.transforms_enabled() {
            normalize_rules(&config.rules)?
        } else {
            config.rules
        };
        Ok(PipelineConfig {
            name: config.name,
            extensions,
            minimizers,
            rules,
        })
    }
}

/// An extension applied to an intercepted view of the host
struct InstrumentedExtension {
    inner: Rc<dyn Extension>,
    interceptor: Interceptor,
}

impl Extension for InstrumentedExtension {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn apply(&self, host: &Value) -> HostResult<()> {
        let view = self.interceptor.intercept(host)?;
        self.inner.apply(&view)
    }
}

struct MilestoneExtension {
    profiler: Profiler,
    group: usize,
    member: usize,
}

impl MilestoneExtension {
    fn point(host: &Value, path: &[String]) -> HostResult<Value> {
        let mut value = host.clone();
        for member in path {
            value = value.get(member)?;
        }
        if value.is_undefined() {
            anyhow::bail!("host has no milestone extension point at `{}`", path.join("."));
        }
        Ok(value)
    }
}

impl Extension for MilestoneExtension {
    fn name(&self) -> &str {
        MILESTONE_NAME
    }

    fn apply(&self, host: &Value) -> HostResult<()> {
        let profile = &self.profiler.inner.profile;
        let started = Self::point(host, profile.run_started())?;
        let finished = Self::point(host, profile.run_finished())?;

        let (group, member) = (self.group, self.member);

        let profiler = self.profiler.clone();
        started.register_with(
            serde_json::json!({ "name": MILESTONE_NAME, "stage": FIRST_STAGE }).into(),
            Callback::immediate(move |_| {
                profiler.enter_run(group, member)?;
                Ok(Value::Undefined)
            }),
        )?;
        let profiler = self.profiler.clone();
        finished.register_with(
            serde_json::json!({ "name": MILESTONE_NAME, "stage": LAST_STAGE }).into(),
            Callback::immediate(move |_| {
                profiler.leave_run(group, member)?;
                Ok(Value::Undefined)
            }),
        )?;

        if let Some(path) = profile.run_failed() {
            let failed = Self::point(host, path)?;
            let profiler = self.profiler.clone();
            failed.register_with(
                serde_json::json!({ "name": MILESTONE_NAME, "stage": FIRST_STAGE }).into(),
                Callback::immediate(move |_| {
                    profiler.fail_run(group, member);
                    Ok(Value::Undefined)
                }),
            )?;
        }
        Ok(())
    }
}
