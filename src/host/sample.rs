// Sample workload for the reference host
//
// A handful of extensions covering every completion convention and every
// carrier kind, three transformers (one callable, one deferring, one with a
// pitch phase) and a few sources. `hooktime simulate` and the transparency
// tests run this workload with and without profiling.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{anyhow, bail};

use super::compiler::{Compiler, COMPILATION_TAG, COMPILER_TAG};
use super::hooks::{HOOKS_TAG, HOOK_MAP_TAG, HOOK_TAG, LEGACY_HOOK_TAG};
use crate::carrier::HostProfile;
use crate::error::HostResult;
use crate::extension::{Extension, Minimizer, PipelineConfig, Rule};
use crate::identity::IdentityShim;
use crate::session::Profiler;
use crate::transformer::{ModuleLoader, TransformContext, TransformerModule, TransformerRecord};
use crate::value::{Reply, Value};

pub const UPPER_LOADER: &str = "/work/loaders/upper.js";
pub const STRIP_LOADER: &str = "/work/node_modules/@acme/strip-loader/lib/index.js";
pub const BANNER_LOADER: &str = "/work/node_modules/banner-loader/index.js";

/// Carrier tags and milestone points of the reference host
pub fn host_profile() -> HostProfile {
    HostProfile::new()
        .container(COMPILER_TAG)
        .container(COMPILATION_TAG)
        .container(HOOKS_TAG)
        .point(HOOK_TAG)
        .point(LEGACY_HOOK_TAG)
        .keyed(HOOK_MAP_TAG)
        .milestones(&["hooks", "compile"], &["hooks", "done"])
        .failure(&["hooks", "failed"])
}

pub fn sample_sources() -> BTreeMap<String, String> {
    [
        ("/work/src/index.txt", "hello pipeline\n// internal note\nbuild me\n"),
        ("/work/src/readme.txt", "// draft\nread me first\n"),
        ("/work/src/notes.md", "# Notes\n\n- keep timings honest   \n"),
        ("/work/src/logo.svg", "<svg/>\n"),
    ]
    .into_iter()
    .map(|(path, text)| (path.to_string(), text.to_string()))
    .collect()
}

pub fn sample_config() -> PipelineConfig {
    PipelineConfig::new("sample")
        .extension(Rc::new(BannerExtension::new("/* built by sample */")))
        .extension(Rc::new(ManifestExtension::default()))
        .extension(Rc::new(BuildReportExtension))
        .extension(Rc::new(LegacyEnvExtension::default()))
        .minimizer(Minimizer::Extension(Rc::new(TrimExtension)))
        .minimizer(Minimizer::Function {
            name: "collapse-blank-lines".to_string(),
            run: Rc::new(collapse_blank_lines),
        })
        .rule(Rule::new(".txt").with_uses(&[UPPER_LOADER, STRIP_LOADER]))
        .rule(Rule {
            one_of: vec![Rule {
                loader: Some(BANNER_LOADER.to_string()),
                ..Rule::new(".md")
            }],
            ..Rule::default()
        })
}

/// Build a compiler over the sample workload
///
/// With a profiler, the configuration, module loader and identity shim all
/// come from it; without one the host runs untouched.
pub fn sample_compiler(profiler: Option<&Profiler>) -> HostResult<Rc<Compiler>> {
    let loader: Rc<dyn ModuleLoader> = Rc::new(SampleLoader::new());
    match profiler {
        Some(profiler) => Compiler::new(
            profiler.wrap_config(sample_config())?,
            Rc::new(profiler.transformer_loader(loader)),
            profiler.identity_shim(),
        ),
        None => Compiler::new(sample_config(), loader, IdentityShim::new()),
    }
}

fn call_member(obj: &Value, member: &str, args: &[Value]) -> HostResult<Value> {
    let value = obj.get(member)?;
    let f = value
        .as_function()
        .ok_or_else(|| anyhow!("`{member}` is not a function"))?;
    f.call(args)
}

fn asset_names(compilation: &Value) -> HostResult<Vec<String>> {
    match call_member(compilation, "assetNames", &[])? {
        Value::Data(data) => Ok(serde_json::from_value(data)?),
        other => bail!("assetNames returned {other:?}"),
    }
}

fn read_asset(compilation: &Value, name: &str) -> HostResult<String> {
    call_member(compilation, "getAsset", &[Value::string(name)])?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing asset {name}"))
}

fn update_asset(compilation: &Value, name: &str, contents: String) -> HostResult<()> {
    call_member(compilation, "updateAsset", &[Value::string(name), Value::string(contents)])?;
    Ok(())
}

fn first_arg(args: &[Value]) -> HostResult<Value> {
    args.first().cloned().ok_or_else(|| anyhow!("callback expects an argument"))
}

/// Prefixes every text asset with a banner (promise convention)
pub struct BannerExtension {
    banner: String,
}

impl BannerExtension {
    pub fn new(banner: &str) -> Self {
        Self {
            banner: banner.to_string(),
        }
    }
}

impl Extension for BannerExtension {
    fn name(&self) -> &str {
        "BannerExtension"
    }

    fn apply(&self, host: &Value) -> HostResult<()> {
        let banner = self.banner.clone();
        host.get("hooks")?.get("compilation")?.tap("BannerExtension", move |args| {
            let compilation = first_arg(args)?;
            let banner = banner.clone();
            compilation
                .get("hooks")?
                .get("processAssets")?
                .tap_promise("BannerExtension", move |args| {
                    let compilation = args.first().cloned().unwrap_or_default();
                    let banner = banner.clone();
                    async move {
                        for name in asset_names(&compilation)? {
                            if name.ends_with(".txt") {
                                let contents = read_asset(&compilation, &name)?;
                                update_asset(&compilation, &name, format!("{banner}\n{contents}"))?;
                            }
                        }
                        Ok::<_, anyhow::Error>(Value::Undefined)
                    }
                })?;
            Ok(Value::Undefined)
        })?;
        Ok(())
    }
}

/// Writes `manifest.json` listing every emitted asset (signal convention)
///
/// Asset names arrive through the compilation's asset hook, fetched with
/// `compilationHooks(compilation)`.
#[derive(Default)]
pub struct ManifestExtension {
    names: Rc<RefCell<Vec<String>>>,
}

impl Extension for ManifestExtension {
    fn name(&self) -> &str {
        "ManifestExtension"
    }

    fn apply(&self, host: &Value) -> HostResult<()> {
        let hooks = host.get("hooks")?;
        let compilation_hooks = host.get("compilationHooks")?;

        let names = self.names.clone();
        hooks.get("compilation")?.tap("ManifestExtension", move |args| {
            let compilation = first_arg(args)?;
            names.borrow_mut().clear();
            let f = compilation_hooks
                .as_function()
                .ok_or_else(|| anyhow!("compilationHooks is not a function"))?;
            let asset_hook = f.call(&[compilation])?;
            let names = names.clone();
            asset_hook.tap("ManifestExtension", move |args| {
                if let Some(name) = args.first().and_then(Value::as_str) {
                    names.borrow_mut().push(name.to_string());
                }
                Ok(Value::Undefined)
            })?;
            Ok(Value::Undefined)
        })?;

        let names = self.names.clone();
        hooks.get("emit")?.tap_async("ManifestExtension", move |args, completer| {
            let compilation = first_arg(args)?;
            let handle = completer.defer();
            let manifest = serde_json::to_string_pretty(&*names.borrow())?;
            let emitted = call_member(
                &compilation,
                "emitAsset",
                &[Value::string("manifest.json"), Value::string(manifest)],
            );
            handle.complete(emitted);
            Ok(Reply::Pending)
        })?;
        Ok(())
    }
}

/// Counts built modules and reports them from the `stage` hook map
pub struct BuildReportExtension;

impl Extension for BuildReportExtension {
    fn name(&self) -> &str {
        "BuildReportExtension"
    }

    fn apply(&self, host: &Value) -> HostResult<()> {
        host.get("hooks")?.get("compilation")?.tap("BuildReportExtension", |args| {
            let compilation = first_arg(args)?;
            let hooks = compilation.get("hooks")?;
            let built = Rc::new(RefCell::new(Vec::new()));

            let seen = built.clone();
            hooks.get("buildModule")?.tap("BuildReportExtension", move |args| {
                if let Some(resource) = args.first().and_then(Value::as_str) {
                    seen.borrow_mut().push(resource.to_string());
                }
                Ok(Value::Undefined)
            })?;

            hooks.get("stage")?.lookup("report")?.tap("BuildReportExtension", move |args| {
                let compilation = first_arg(args)?;
                let report = format!("built {} modules\n{}\n", built.borrow().len(), built.borrow().join("\n"));
                call_member(
                    &compilation,
                    "emitAsset",
                    &[Value::string("build-report.txt"), Value::string(report)],
                )
            })?;
            Ok(Value::Undefined)
        })?;
        Ok(())
    }
}

/// Reads the compiler name from the frozen `environment` hook
#[derive(Default)]
pub struct LegacyEnvExtension {
    environment: Rc<RefCell<Option<String>>>,
}

impl Extension for LegacyEnvExtension {
    fn name(&self) -> &str {
        "LegacyEnvExtension"
    }

    fn apply(&self, host: &Value) -> HostResult<()> {
        let hooks = host.get("hooks")?;
        let name = host.get("name")?.as_str().unwrap_or("unnamed").to_string();

        let environment = self.environment.clone();
        hooks.get("environment")?.tap("LegacyEnvExtension", move |_| {
            *environment.borrow_mut() = Some(format!("environment ready for {name}"));
            Ok(Value::Undefined)
        })?;

        let environment = self.environment.clone();
        hooks.get("emit")?.tap("LegacyEnvExtension", move |args| {
            let compilation = first_arg(args)?;
            let text = environment.borrow().clone().unwrap_or_default();
            call_member(
                &compilation,
                "emitAsset",
                &[Value::string("environment.txt"), Value::string(text)],
            )
        })?;
        Ok(())
    }
}

/// Trims trailing whitespace of every line during `optimize`
pub struct TrimExtension;

impl Extension for TrimExtension {
    fn name(&self) -> &str {
        "TrimExtension"
    }

    fn apply(&self, host: &Value) -> HostResult<()> {
        host.get("hooks")?.get("compilation")?.tap("TrimExtension", |args| {
            let compilation = first_arg(args)?;
            compilation.get("hooks")?.get("optimize")?.tap("TrimExtension", |args| {
                let compilation = first_arg(args)?;
                for name in asset_names(&compilation)? {
                    let contents = read_asset(&compilation, &name)?;
                    let trimmed: Vec<&str> = contents.lines().map(str::trim_end).collect();
                    update_asset(&compilation, &name, trimmed.join("\n") + "\n")?;
                }
                Ok(Value::Undefined)
            })?;
            Ok(Value::Undefined)
        })?;
        Ok(())
    }
}

/// Plain-function minimizer: collapses runs of blank lines
fn collapse_blank_lines(host: &Value) -> HostResult<()> {
    host.get("hooks")?.get("compilation")?.tap("collapse-blank-lines", |args| {
        let compilation = first_arg(args)?;
        compilation.get("hooks")?.get("optimize")?.tap("collapse-blank-lines", |args| {
            let compilation = first_arg(args)?;
            for name in asset_names(&compilation)? {
                let contents = read_asset(&compilation, &name)?;
                let mut out = String::with_capacity(contents.len());
                let mut blank = false;
                for line in contents.lines() {
                    if line.trim().is_empty() {
                        if blank {
                            continue;
                        }
                        blank = true;
                    } else {
                        blank = false;
                    }
                    out.push_str(line);
                    out.push('\n');
                }
                update_asset(&compilation, &name, out)?;
            }
            Ok(Value::Undefined)
        })?;
        Ok(Value::Undefined)
    })?;
    Ok(())
}

fn source_arg(args: &[Value]) -> String {
    args.first().and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Module loader of the sample transformers
#[derive(Debug, Default)]
pub struct SampleLoader {
    loads: RefCell<Vec<String>>,
}

impl SampleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every id requested so far
    pub fn loads(&self) -> Vec<String> {
        self.loads.borrow().clone()
    }
}

impl ModuleLoader for SampleLoader {
    fn load(&self, id: &str) -> HostResult<TransformerModule> {
        self.loads.borrow_mut().push(id.to_string());
        match id {
            UPPER_LOADER => Ok(TransformerModule::callable(|_, args| {
                Ok(Reply::Ready(Value::string(source_arg(args).to_uppercase())))
            })),
            STRIP_LOADER => Ok(TransformerModule::Record(TransformerRecord {
                normal: Some(Rc::new(|ctx: &TransformContext, args: &[Value]| -> HostResult<Reply> {
                    let handle = ctx.defer();
                    let stripped: Vec<String> = source_arg(args)
                        .lines()
                        .filter(|line| !line.trim_start().starts_with("//"))
                        .map(str::to_string)
                        .collect();
                    handle.complete(Ok(Value::string(stripped.join("\n") + "\n")));
                    Ok(Reply::Pending)
                })),
                pitch: None,
                raw: false,
            })),
            BANNER_LOADER => Ok(TransformerModule::Record(TransformerRecord {
                normal: Some(Rc::new(|ctx: &TransformContext, args: &[Value]| -> HostResult<Reply> {
                    let header = format!("<!-- {} -->", ctx.resource_path());
                    Ok(Reply::Ready(Value::string(format!("{header}\n{}", source_arg(args)))))
                })),
                pitch: Some(Rc::new(|_: &TransformContext, _: &[Value]| -> HostResult<Reply> {
                    Ok(Reply::Ready(Value::Undefined))
                })),
                raw: false,
            })),
            other => bail!("cannot find module '{other}'"),
        }
    }
}
