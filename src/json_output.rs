//! JSON output format for timing reports
//!
//! `--format json` implementation. Carries the same content as the text
//! report, with durations in fractional milliseconds.

use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregationResult, EntityTotal};
use crate::report::{as_millis, ReportStyle, Severity};

/// One extension or transformer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonEntity {
    /// Extension name or transformer path
    pub name: String,
    /// Name shown in the report
    pub display: String,
    /// Number of measured invocations
    pub invocations: usize,
    /// Summed duration in milliseconds (absent when ignored)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSummary {
    pub pipeline_total_ms: f64,
    pub pipeline_severity: Severity,
    pub extensions_total_ms: f64,
    pub transformers_total_ms: f64,
}

/// Root JSON output structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonReport {
    /// Format version identifier
    pub version: String,
    /// Format name
    pub format: String,
    pub summary: JsonSummary,
    pub extensions: Vec<JsonEntity>,
    pub transformers: Vec<JsonEntity>,
    /// Rendered advisories
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<String>,
}

impl JsonReport {
    pub fn from_result(result: &AggregationResult, style: &ReportStyle) -> Self {
        let entity = |total: &EntityTotal| {
            let duration = total.duration();
            JsonEntity {
                name: total.name.clone(),
                display: total.display.clone(),
                invocations: total.invocations,
                total_ms: duration.map(as_millis),
                severity: duration.map(|d| style.severity(d)),
                ignored: duration.is_none(),
            }
        };
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "hooktime-json-v1".to_string(),
            summary: JsonSummary {
                pipeline_total_ms: as_millis(result.pipeline_total),
                pipeline_severity: style.severity(result.pipeline_total),
                extensions_total_ms: as_millis(result.extensions_total()),
                transformers_total_ms: as_millis(result.transformers_total()),
            },
            extensions: result.extensions.iter().map(entity).collect(),
            transformers: result.transformers.iter().map(entity).collect(),
            advisories: result.advisories.iter().map(ToString::to_string).collect(),
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)? + "\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Advisory, EntityStatus};
    use std::time::Duration;

    fn result() -> AggregationResult {
        AggregationResult {
            pipeline_total: Duration::from_millis(60),
            extensions: vec![EntityTotal {
                name: "Banner".to_string(),
                display: "Banner".to_string(),
                invocations: 2,
                status: EntityStatus::Measured(Duration::from_micros(5500)),
            }],
            transformers: vec![EntityTotal {
                name: "/w/skip.js".to_string(),
                display: "/w/skip.js".to_string(),
                invocations: 0,
                status: EntityStatus::Ignored,
            }],
            advisories: vec![Advisory::FunctionMinimizer {
                name: "terse".to_string(),
            }],
        }
    }

    #[test]
    fn test_json_report_creation() {
        let report = JsonReport::from_result(&result(), &ReportStyle::default());
        assert_eq!(report.format, "hooktime-json-v1");
        assert_eq!(report.summary.pipeline_total_ms, 60.0);
        assert_eq!(report.summary.extensions_total_ms, 5.5);
        assert_eq!(report.extensions[0].severity, Some(Severity::Ok));
        assert!(report.transformers[0].ignored);
        assert_eq!(report.advisories.len(), 1);
    }

    #[test]
    fn test_json_serialization() {
        let json = JsonReport::from_result(&result(), &ReportStyle::default())
            .to_json()
            .unwrap();
        assert!(json.contains("\"format\": \"hooktime-json-v1\""));
        assert!(json.contains("\"total_ms\": 5.5"));
        assert!(json.contains("\"ignored\": true"));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let report = JsonReport::from_result(&result(), &ReportStyle::default());
        let ignored = serde_json::to_string(&report.transformers[0]).unwrap();
        assert!(!ignored.contains("total_ms"));
        assert!(!ignored.contains("severity"));

        let measured = serde_json::to_string(&report.extensions[0]).unwrap();
        // false flags are omitted
        assert!(!measured.contains("ignored"));
    }
}
