//! Integration tests: profiling never changes what the pipeline produces
//!
//! The sample workload runs with and without a profiler and the emitted
//! artifacts are compared byte for byte.

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;

use hooktime::aggregate::{AggregationResult, EntityStatus};
use hooktime::config::{EnableSetting, EnableSplit, ProfilerOptions, ReportFormat, TransformOptions};
use hooktime::host::sample::{BANNER_LOADER, STRIP_LOADER, UPPER_LOADER};
use hooktime::host::{host_profile, sample_compiler, sample_config, sample_sources, Artifacts, Compiler, SampleLoader};
use hooktime::error::HostResult;
use hooktime::extension::{Extension, PipelineConfig};
use hooktime::identity::IdentityShim;
use hooktime::value::Value;
use hooktime::Profiler;

fn options_writing_to(dir: &Path) -> ProfilerOptions {
    ProfilerOptions {
        output_file: Some(dir.join("report.txt")),
        ..ProfilerOptions::default()
    }
}

fn baseline() -> Artifacts {
    sample_compiler(None).unwrap().run(&sample_sources()).unwrap()
}

fn profiled(options: ProfilerOptions) -> (Profiler, Artifacts) {
    let profiler = Profiler::new(options, host_profile()).unwrap();
    let artifacts = sample_compiler(Some(&profiler))
        .unwrap()
        .run(&sample_sources())
        .unwrap();
    (profiler, artifacts)
}

#[test]
fn test_profiled_artifacts_match_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let (profiler, artifacts) = profiled(options_writing_to(dir.path()));

    assert_eq!(artifacts, baseline());
    assert!(profiler.last_result().is_some());
}

#[test]
fn test_report_file_is_written_per_run() {
    let dir = tempfile::tempdir().unwrap();
    profiled(options_writing_to(dir.path()));

    let report = std::fs::read_to_string(dir.path().join("report.txt")).unwrap();
    assert!(report.starts_with("┌── hooktime"));
    assert!(report.contains("Pipeline run takes"));
    assert!(report.contains("BannerExtension"));
    assert!(report.contains("Transformer @acme/strip-loader takes"));
    assert!(report.contains("collapse-blank-lines"));
    assert!(!report.contains('\u{1b}'));
}

#[test]
fn test_every_extension_and_transformer_is_measured() {
    let dir = tempfile::tempdir().unwrap();
    let (profiler, _) = profiled(options_writing_to(dir.path()));
    let result = profiler.last_result().unwrap();

    let mut extensions: Vec<&str> = result.extensions.iter().map(|e| e.name.as_str()).collect();
    extensions.sort_unstable();
    assert_eq!(
        extensions,
        vec![
            "BannerExtension",
            "BuildReportExtension",
            "LegacyEnvExtension",
            "ManifestExtension",
            "TrimExtension",
        ]
    );

    let mut transformers: Vec<&str> = result.transformers.iter().map(|t| t.name.as_str()).collect();
    transformers.sort_unstable();
    assert_eq!(transformers, vec![UPPER_LOADER, STRIP_LOADER, BANNER_LOADER]);
    assert!(result
        .transformers
        .iter()
        .all(|t| matches!(t.status, EntityStatus::Measured(_))));
}

#[test]
fn test_rerun_on_the_same_session() {
    let dir = tempfile::tempdir().unwrap();
    let profiler = Profiler::new(options_writing_to(dir.path()), host_profile()).unwrap();
    let compiler = sample_compiler(Some(&profiler)).unwrap();

    let first = compiler.run(&sample_sources()).unwrap();
    let first_result = profiler.last_result().unwrap();
    let second = compiler.run(&sample_sources()).unwrap();
    let second_result = profiler.last_result().unwrap();

    assert_eq!(first, second);
    assert_eq!(first, baseline());
    assert_eq!(compiler.run_count(), 2);
    assert_eq!(first_result.extensions.len(), second_result.extensions.len());
    assert_eq!(
        first_result.transformers.iter().map(|t| t.invocations).collect::<Vec<_>>(),
        second_result.transformers.iter().map(|t| t.invocations).collect::<Vec<_>>()
    );
    assert!(!profiler.recorder().is_running());
}

#[test]
fn test_excluded_transformer_is_reported_as_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let options = ProfilerOptions {
        resource_transform: TransformOptions {
            exclude: vec!["@acme/strip-loader".to_string()],
            ..TransformOptions::default()
        },
        ..options_writing_to(dir.path())
    };
    let (profiler, artifacts) = profiled(options);
    assert_eq!(artifacts, baseline());

    let result = profiler.last_result().unwrap();
    let strip = result
        .transformers
        .iter()
        .find(|t| t.name == STRIP_LOADER)
        .unwrap();
    assert_eq!(strip.status, EntityStatus::Ignored);
    let report = std::fs::read_to_string(dir.path().join("report.txt")).unwrap();
    assert!(report.contains(&format!("Transformer {STRIP_LOADER} is ignored.")));
}

#[test]
fn test_callbacks_disabled_still_times_transformers() {
    let dir = tempfile::tempdir().unwrap();
    let options = ProfilerOptions {
        enable: EnableSetting::Split(EnableSplit {
            callbacks: false,
            transforms: true,
        }),
        ..options_writing_to(dir.path())
    };
    let (profiler, artifacts) = profiled(options);
    assert_eq!(artifacts, baseline());

    let result = profiler.last_result().unwrap();
    assert!(result.extensions.is_empty());
    assert_eq!(result.transformers.len(), 3);
}

#[test]
fn test_disabled_profiler_leaves_pipeline_alone() {
    let (profiler, artifacts) = profiled(ProfilerOptions::disabled());
    assert_eq!(artifacts, baseline());
    assert!(profiler.last_result().is_none());
    assert!(profiler.recorder().snapshot().is_empty());
}

#[test]
fn test_json_report_file() {
    let dir = tempfile::tempdir().unwrap();
    let options = ProfilerOptions {
        format: ReportFormat::Json,
        output_file: Some(dir.path().join("report.json")),
        ..ProfilerOptions::default()
    };
    profiled(options);

    let json = std::fs::read_to_string(dir.path().join("report.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(doc["format"], "hooktime-json-v1");
    assert_eq!(doc["extensions"].as_array().unwrap().len(), 5);
    assert_eq!(doc["transformers"].as_array().unwrap().len(), 3);
    assert!(doc["advisories"]
        .as_array()
        .unwrap()
        .iter()
        .any(|a| a.as_str().unwrap_or_default().contains("collapse-blank-lines")));
}

#[test]
fn test_views_need_the_shared_identity_shim() {
    // Per-compilation hooks are looked up by identity. With a shim that knows
    // nothing of the views, the manifest extension taps a different hook and
    // sees no assets.
    let dir = tempfile::tempdir().unwrap();
    let profiler = Profiler::new(options_writing_to(dir.path()), host_profile()).unwrap();
    let compiler = Compiler::new(
        profiler.wrap_config(sample_config()).unwrap(),
        Rc::new(profiler.transformer_loader(Rc::new(SampleLoader::new()))),
        IdentityShim::new(),
    )
    .unwrap();
    let artifacts = compiler.run(&sample_sources()).unwrap();

    assert_eq!(artifacts["manifest.json"], "[]");
    assert_ne!(artifacts["manifest.json"], baseline()["manifest.json"]);
}

fn profiled_compiler(profiler: &Profiler, config: PipelineConfig) -> Rc<Compiler> {
    Compiler::new(
        config,
        Rc::new(profiler.transformer_loader(Rc::new(SampleLoader::new()))),
        profiler.identity_shim(),
    )
    .unwrap()
}

fn extension_invocations(result: &AggregationResult) -> usize {
    result.extensions.iter().map(|e| e.invocations).sum()
}

#[test]
fn test_configs_wrapped_together_run_on_their_own() {
    let dir = tempfile::tempdir().unwrap();
    let profiler = Profiler::new(options_writing_to(dir.path()), host_profile()).unwrap();
    let configs = profiler.wrap_configs(vec![sample_config(), sample_config()]).unwrap();
    let compilers: Vec<_> = configs
        .into_iter()
        .map(|config| profiled_compiler(&profiler, config))
        .collect();

    let first = compilers[0].run(&sample_sources()).unwrap();
    let alone = profiler.last_result().unwrap();
    assert!(!profiler.recorder().is_running());

    let second = compilers[1].run(&sample_sources()).unwrap();
    let other = profiler.last_result().unwrap();
    assert!(!profiler.recorder().is_running());
    assert!(profiler.recorder().snapshot().is_empty());

    compilers[0].run(&sample_sources()).unwrap();
    let again = profiler.last_result().unwrap();

    assert_eq!(first, baseline());
    assert_eq!(second, baseline());
    assert!(extension_invocations(&alone) > 0);
    assert_eq!(extension_invocations(&other), extension_invocations(&alone));
    assert_eq!(extension_invocations(&again), extension_invocations(&alone));
    assert_eq!(
        again.transformers.iter().map(|t| t.invocations).collect::<Vec<_>>(),
        alone.transformers.iter().map(|t| t.invocations).collect::<Vec<_>>()
    );
}

/// Fails the first `make` it sees
#[derive(Default)]
struct FlakyExtension {
    failed: Rc<Cell<bool>>,
}

impl Extension for FlakyExtension {
    fn name(&self) -> &str {
        "FlakyExtension"
    }

    fn apply(&self, host: &Value) -> HostResult<()> {
        let failed = self.failed.clone();
        host.get("hooks")?.get("make")?.tap("FlakyExtension", move |_| {
            if !failed.replace(true) {
                anyhow::bail!("make interrupted");
            }
            Ok(Value::Undefined)
        })?;
        Ok(())
    }
}

#[test]
fn test_failed_run_does_not_block_the_next() {
    let dir = tempfile::tempdir().unwrap();
    let profiler = Profiler::new(options_writing_to(dir.path()), host_profile()).unwrap();
    let config = profiler
        .wrap_config(sample_config().extension(Rc::new(FlakyExtension::default())))
        .unwrap();
    let compiler = profiled_compiler(&profiler, config);

    let err = compiler.run(&sample_sources()).unwrap_err();
    assert!(format!("{err:#}").contains("make interrupted"));
    assert!(!profiler.recorder().is_running());
    assert!(profiler.recorder().snapshot().is_empty());
    assert!(profiler.last_result().is_none());
    assert!(!dir.path().join("report.txt").exists());

    let artifacts = compiler.run(&sample_sources()).unwrap();
    assert_eq!(artifacts, baseline());
    let result = profiler.last_result().unwrap();
    assert!(result.extensions.iter().any(|e| e.name == "FlakyExtension"));
    assert!(dir.path().join("report.txt").exists());
}
