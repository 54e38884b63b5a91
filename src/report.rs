//! Text report
//!
//! ```text
//! ┌── hooktime
//! │ Pipeline run takes 60.0000 ms
//! ├── Extensions
//! │ Extension Banner takes 5.0000 ms
//! │ All extensions take 5.0000 ms
//! ├── Resource transformers
//! │ Transformer upper-loader takes 30.0000 ms
//! │ Transformer sass-loader is ignored.
//! │ All transformers take 30.0000 ms
//! ```
//!
//! Entries are listed slowest first. Durations are colored by severity when
//! color is on.

use std::cmp::Reverse;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use crossterm::style::{style, Color, Stylize};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregate::{Advisory, AggregationResult, EntityStatus, EntityTotal};
use crate::config::{ProfilerOptions, ReportFormat};
use crate::json_output::JsonReport;

const HEADER: &str = "┌── hooktime";
const SECTION: &str = "├── ";
const LINE: &str = "│ ";

/// Severity of a duration against the configured limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Warn,
    Danger,
}

impl Severity {
    fn color(self) -> Color {
        match self {
            Severity::Ok => Color::Green,
            Severity::Warn => Color::Yellow,
            Severity::Danger => Color::Red,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportStyle {
    pub warn_ms: f64,
    pub danger_ms: f64,
    pub color: bool,
}

impl Default for ReportStyle {
    fn default() -> Self {
        Self::from_options(&ProfilerOptions::default(), false)
    }
}

impl ReportStyle {
    pub fn from_options(options: &ProfilerOptions, color: bool) -> Self {
        Self {
            warn_ms: options.warn_time_limit,
            danger_ms: options.danger_time_limit,
            color,
        }
    }

    pub fn severity(&self, duration: Duration) -> Severity {
        let ms = as_millis(duration);
        if ms >= self.danger_ms {
            Severity::Danger
        } else if ms >= self.warn_ms {
            Severity::Warn
        } else {
            Severity::Ok
        }
    }

    fn time(&self, duration: Duration) -> String {
        let text = format_duration(duration);
        if self.color {
            style(text).with(self.severity(duration).color()).to_string()
        } else {
            text
        }
    }

    fn title(&self, text: &str) -> String {
        if self.color {
            style(text).bold().to_string()
        } else {
            text.to_string()
        }
    }
}

pub fn as_millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Milliseconds with four decimals
pub fn format_duration(duration: Duration) -> String {
    format!("{:.4} ms", as_millis(duration))
}

/// Measured entities slowest first, then ignored ones in ledger order
fn ordered(entities: &[EntityTotal]) -> Vec<&EntityTotal> {
    let mut measured: Vec<_> = entities.iter().filter(|e| e.duration().is_some()).collect();
    measured.sort_by_key(|e| Reverse(e.duration()));
    measured.extend(entities.iter().filter(|e| e.status == EntityStatus::Ignored));
    measured
}

pub fn render_text(result: &AggregationResult, style: &ReportStyle) -> String {
    let mut lines = vec![style.title(HEADER)];
    lines.push(format!(
        "{LINE}Pipeline run takes {}",
        style.time(result.pipeline_total)
    ));

    if !result.extensions.is_empty() {
        lines.push(format!("{SECTION}{}", style.title("Extensions")));
        for entity in ordered(&result.extensions) {
            lines.push(entity_line("Extension", entity, style));
        }
        lines.push(format!(
            "{LINE}All extensions take {}",
            style.time(result.extensions_total())
        ));
    }

    if !result.transformers.is_empty() {
        lines.push(format!("{SECTION}{}", style.title("Resource transformers")));
        for entity in ordered(&result.transformers) {
            lines.push(entity_line("Transformer", entity, style));
        }
        if result.has_collisions() {
            lines.push(format!(
                "{LINE}There are many different transformers that have the same assumed name. \
                 Consider setting resource_transform.group_by_absolute_path"
            ));
        }
        lines.push(format!(
            "{LINE}All transformers take {}",
            style.time(result.transformers_total())
        ));
    }

    let advisories: Vec<_> = result
        .advisories
        .iter()
        .filter(|a| !matches!(a, Advisory::DisplayNameCollision { .. }))
        .collect();
    if !advisories.is_empty() {
        lines.push(format!("{SECTION}{}", style.title("Advisories")));
        for advisory in advisories {
            lines.push(format!("{LINE}{advisory}"));
        }
    }

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

fn entity_line(noun: &str, entity: &EntityTotal, style: &ReportStyle) -> String {
    match entity.status {
        EntityStatus::Measured(total) => {
            format!("{LINE}{noun} {} takes {}", entity.display, style.time(total))
        }
        EntityStatus::Ignored => format!("{LINE}{noun} {} is ignored.", entity.display),
    }
}

/// Render `result` in the format `options` ask for
pub fn render(result: &AggregationResult, options: &ProfilerOptions, color: bool) -> anyhow::Result<String> {
    let style = ReportStyle::from_options(options, color);
    match options.format {
        ReportFormat::Text => Ok(render_text(result, &style)),
        ReportFormat::Json => JsonReport::from_result(result, &style).to_json(),
    }
}

/// Write a rendered report to `output`, or to stdout
pub fn write_report(contents: &str, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, contents)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            info!(path = %path.display(), "wrote timing report");
        }
        None => print!("{contents}"),
    }
    Ok(())
}
