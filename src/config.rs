// Profiler options
//
// Loaded from TOML. camelCase key names are accepted as aliases so option
// files written for the JavaScript plugin keep working.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregationPolicy;

/// Which instrumentation is switched on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnableSetting {
    All(bool),
    Split(EnableSplit),
}

impl Default for EnableSetting {
    fn default() -> Self {
        EnableSetting::All(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnableSplit {
    #[serde(default = "enabled", alias = "plugin")]
    pub callbacks: bool,
    #[serde(default = "enabled", alias = "loader")]
    pub transforms: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformOptions {
    /// Display names or absolute paths of transformers to leave unmeasured
    pub exclude: Vec<String>,
    /// Report transformers by absolute path instead of package name
    #[serde(alias = "groupByAbsolutePath", alias = "groupedByAbsolutePath")]
    pub group_by_absolute_path: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionOptions {
    /// Extension names to leave unwrapped
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

/// Options for a profiling session
///
/// # Example
/// ```
/// use hooktime::config::ProfilerOptions;
///
/// let options = ProfilerOptions::from_toml_str(
///     r#"
///     warnTimeLimit = 100
///     [loader]
///     exclude = ["sass-loader"]
///     "#,
/// )
/// .unwrap();
/// assert_eq!(options.warn_time_limit, 100.0);
/// assert_eq!(options.danger_time_limit, 8000.0);
/// assert!(options.resource_transform.exclude.contains(&"sass-loader".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerOptions {
    pub enable: EnableSetting,

    /// Report destination; stdout when unset
    #[serde(alias = "outputFile", skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,

    /// Milliseconds at which a duration is shown as a warning
    #[serde(alias = "warnTimeLimit")]
    pub warn_time_limit: f64,

    /// Milliseconds at which a duration is shown as dangerous
    #[serde(alias = "dangerTimeLimit")]
    pub danger_time_limit: f64,

    #[serde(alias = "resourceTransform", alias = "loader")]
    pub resource_transform: TransformOptions,

    #[serde(alias = "plugin")]
    pub extension: ExtensionOptions,

    pub format: ReportFormat,
}

impl Default for ProfilerOptions {
    fn default() -> Self {
        Self {
            enable: EnableSetting::default(),
            output_file: None,
            warn_time_limit: 3000.0,
            danger_time_limit: 8000.0,
            resource_transform: TransformOptions::default(),
            extension: ExtensionOptions::default(),
            format: ReportFormat::Text,
        }
    }
}

impl ProfilerOptions {
    /// Options with all instrumentation switched off
    pub fn disabled() -> Self {
        Self {
            enable: EnableSetting::All(false),
            ..Self::default()
        }
    }

    pub fn callbacks_enabled(&self) -> bool {
        match self.enable {
            EnableSetting::All(on) => on,
            EnableSetting::Split(split) => split.callbacks,
        }
    }

    pub fn transforms_enabled(&self) -> bool {
        match self.enable {
            EnableSetting::All(on) => on,
            EnableSetting::Split(split) => split.transforms,
        }
    }

    /// Anything at all instrumented
    pub fn is_enabled(&self) -> bool {
        self.callbacks_enabled() || self.transforms_enabled()
    }

    pub fn is_extension_excluded(&self, name: &str) -> bool {
        self.extension.exclude.iter().any(|excluded| excluded == name)
    }

    pub fn policy(&self) -> AggregationPolicy {
        AggregationPolicy::from_options(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        for (name, limit) in [
            ("warn_time_limit", self.warn_time_limit),
            ("danger_time_limit", self.danger_time_limit),
        ] {
            if !limit.is_finite() || limit < 0.0 {
                return Err(format!("{name} must be a non-negative number, got {limit}"));
            }
        }

        if self.warn_time_limit > self.danger_time_limit {
            return Err(format!(
                "warn_time_limit ({}) must not exceed danger_time_limit ({})",
                self.warn_time_limit, self.danger_time_limit
            ));
        }

        Ok(())
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let options: ProfilerOptions = toml::from_str(contents).context("invalid options file")?;
        options.validate().map_err(anyhow::Error::msg)?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read options file {}", path.display()))?;
        Self::from_toml_str(&contents).with_context(|| format!("in {}", path.display()))
    }
}
