//! Extensions and the pipeline configuration that lists them
//!
//! A [`PipelineConfig`] is what a host is built from: the extensions to apply
//! to its root object, the minimizers run during optimization, and the
//! resource rules that decide which transformers process which resource.
//! The session rewrites a configuration before the host sees it, so the
//! types here are plain data plus trait objects.

use std::fmt;
use std::rc::Rc;

use crate::error::{HostResult, Violation};
use crate::transformer::SCOUT_ID;
use crate::value::Value;

/// A unit of third-party code applied to the host's root object
pub trait Extension {
    fn name(&self) -> &str;

    /// Register callbacks on the extension points reachable from `host`
    fn apply(&self, host: &Value) -> HostResult<()>;
}

pub type MinimizerFn = Rc<dyn Fn(&Value) -> HostResult<()>>;

/// A minimizer is either a full extension or a bare function
#[derive(Clone)]
pub enum Minimizer {
    Extension(Rc<dyn Extension>),
    Function { name: String, run: MinimizerFn },
}

impl Minimizer {
    pub fn name(&self) -> &str {
        match self {
            Minimizer::Extension(ext) => ext.name(),
            Minimizer::Function { name, .. } => name,
        }
    }

    pub fn apply(&self, host: &Value) -> HostResult<()> {
        match self {
            Minimizer::Extension(ext) => ext.apply(host),
            Minimizer::Function { run, .. } => run(host),
        }
    }
}

impl fmt::Debug for Minimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Minimizer::Extension(ext) => write!(f, "Extension({})", ext.name()),
            Minimizer::Function { name, .. } => write!(f, "Function({name})"),
        }
    }
}

/// One transformer applied by a rule
#[derive(Debug, Clone, PartialEq)]
pub struct UseEntry {
    /// Module id (absolute path) of the transformer
    pub loader: String,
    pub options: Option<serde_json::Value>,
}

impl UseEntry {
    pub fn new(loader: &str) -> Self {
        Self {
            loader: loader.to_string(),
            options: None,
        }
    }

    pub fn is_scout(&self) -> bool {
        self.loader == SCOUT_ID
    }
}

pub type ComputedUse = Rc<dyn Fn(&str) -> Vec<UseEntry>>;

#[derive(Clone, Default)]
pub enum RuleUse {
    #[default]
    None,
    Single(UseEntry),
    List(Vec<UseEntry>),
    /// Chain computed per resource; cannot be instrumented ahead of time
    Computed(ComputedUse),
}

impl RuleUse {
    /// Entries of a normalized rule
    pub fn entries(&self) -> &[UseEntry] {
        match self {
            RuleUse::Single(entry) => std::slice::from_ref(entry),
            RuleUse::List(entries) => entries,
            RuleUse::None | RuleUse::Computed(_) => &[],
        }
    }
}

impl fmt::Debug for RuleUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleUse::None => write!(f, "None"),
            RuleUse::Single(entry) => f.debug_tuple("Single").field(entry).finish(),
            RuleUse::List(entries) => f.debug_tuple("List").field(entries).finish(),
            RuleUse::Computed(_) => write!(f, "Computed"),
        }
    }
}

/// A resource rule
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Resource path suffix this rule matches; `None` matches everything
    pub test: Option<String>,
    /// Shorthand for a single-entry `uses`
    pub loader: Option<String>,
    pub options: Option<serde_json::Value>,
    pub uses: RuleUse,
    /// First matching nested rule applies
    pub one_of: Vec<Rule>,
    /// Every matching nested rule applies
    pub rules: Vec<Rule>,
}

impl Rule {
    pub fn new(test: &str) -> Self {
        Self {
            test: Some(test.to_string()),
            ..Self::default()
        }
    }

    pub fn with_uses(mut self, loaders: &[&str]) -> Self {
        self.uses = RuleUse::List(loaders.iter().map(|l| UseEntry::new(l)).collect());
        self
    }

    pub fn matches(&self, resource: &str) -> bool {
        self.test.as_deref().map_or(true, |suffix| resource.ends_with(suffix))
    }
}

#[derive(Debug, Clone)]
pub enum RuleItem {
    Rule(Rule),
    /// `"..."`: splice in the host's default rules
    Inherit,
}

/// Everything a host pipeline is built from
#[derive(Clone, Default)]
pub struct PipelineConfig {
    pub name: String,
    pub extensions: Vec<Rc<dyn Extension>>,
    pub minimizers: Vec<Minimizer>,
    pub rules: Vec<RuleItem>,
}

impl PipelineConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn extension(mut self, extension: Rc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn minimizer(mut self, minimizer: Minimizer) -> Self {
        self.minimizers.push(minimizer);
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(RuleItem::Rule(rule));
        self
    }

    pub fn extension_names(&self) -> Vec<&str> {
        self.extensions.iter().map(|ext| ext.name()).collect()
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("name", &self.name)
            .field("extensions", &self.extension_names())
            .field("minimizers", &self.minimizers)
            .field("rules", &self.rules)
            .finish()
    }
}

/// Put the scout transformer first in every rule that applies transformers
///
/// `loader`/`options` shorthand is folded into `uses` first. Nested `one_of`
/// and `rules` are normalized the same way.
pub fn normalize_rules(items: &[RuleItem]) -> Result<Vec<RuleItem>, Violation> {
    items
        .iter()
        .map(|item| match item {
            RuleItem::Rule(rule) => Ok(RuleItem::Rule(normalize_rule(rule)?)),
            RuleItem::Inherit => Err(Violation::UnsupportedRule(
                "the \"...\" placeholder cannot be instrumented; list the rules explicitly".to_string(),
            )),
        })
        .collect()
}

fn normalize_rule(rule: &Rule) -> Result<Rule, Violation> {
    let mut rule = rule.clone();

    let mut uses = match std::mem::take(&mut rule.uses) {
        RuleUse::None => match rule.loader.take() {
            Some(loader) => vec![UseEntry {
                loader,
                options: rule.options.take(),
            }],
            None => Vec::new(),
        },
        RuleUse::Single(entry) => vec![entry],
        RuleUse::List(entries) => entries,
        RuleUse::Computed(_) => {
            return Err(Violation::UnsupportedRule(format!(
                "rule for `{}` computes its transformers per resource",
                rule.test.as_deref().unwrap_or("*")
            )))
        }
    };
    if !uses.is_empty() {
        if !uses[0].is_scout() {
            uses.insert(0, UseEntry::new(SCOUT_ID));
        }
        rule.uses = RuleUse::List(uses);
    }

    rule.one_of = rule.one_of.iter().map(normalize_rule).collect::<Result<_, _>>()?;
    rule.rules = rule.rules.iter().map(normalize_rule).collect::<Result<_, _>>()?;
    Ok(rule)
}
