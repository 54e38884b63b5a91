// Compiler and compilation objects of the reference host
//
// One `Compiler::run` is one pipeline run:
//
//   environment -> compile -> compilation -> make -> build modules
//     -> optimize -> processAssets -> stage hooks -> asset hooks -> emit -> done
//
// A run that errors anywhere calls `failed` with the error message instead
// of `done`.
//
// The compiler keeps per-compilation asset hooks in an identity-keyed table,
// the way hosts let extensions fetch hooks "for this compilation". Lookups go
// through the identity shim, so a wrapped compilation finds the same hooks
// as the original.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Context};
use futures::executor::block_on;
use tracing::{debug, warn};

use super::hooks::{Hook, HookKind, HookMap, HooksRecord};
use super::runner::{resolve_chain, run_chain};
use crate::carrier::{CarrierContainer, HostObject, ObjectRef, Shape};
use crate::error::HostResult;
use crate::extension::{Minimizer, PipelineConfig, RuleItem};
use crate::identity::{IdentityKeyedMap, IdentityShim};
use crate::transformer::ModuleLoader;
use crate::value::{HostFn, Value};

pub const COMPILER_TAG: &str = "Compiler";
pub const COMPILATION_TAG: &str = "Compilation";

/// Emitted assets by name
pub type Artifacts = BTreeMap<String, String>;

pub struct CompilerHooks {
    pub environment: Rc<Hook>,
    pub compile: Rc<Hook>,
    pub compilation: Rc<Hook>,
    pub make: Rc<Hook>,
    pub emit: Rc<Hook>,
    pub done: Rc<Hook>,
    pub failed: Rc<Hook>,
}

impl CompilerHooks {
    fn new() -> Self {
        Self {
            environment: Hook::frozen("environment", HookKind::Sync),
            compile: Hook::new("compile", HookKind::Sync),
            compilation: Hook::new("compilation", HookKind::Sync),
            make: Hook::new("make", HookKind::AsyncParallel),
            emit: Hook::new("emit", HookKind::AsyncSeries),
            done: Hook::new("done", HookKind::AsyncSeries),
            failed: Hook::new("failed", HookKind::Sync),
        }
    }

    fn record(&self) -> ObjectRef {
        HooksRecord::new([
            ("environment", self.environment.clone() as ObjectRef),
            ("compile", self.compile.clone() as ObjectRef),
            ("compilation", self.compilation.clone() as ObjectRef),
            ("make", self.make.clone() as ObjectRef),
            ("emit", self.emit.clone() as ObjectRef),
            ("done", self.done.clone() as ObjectRef),
            ("failed", self.failed.clone() as ObjectRef),
        ])
    }
}

pub struct Compiler {
    name: String,
    pub hooks: CompilerHooks,
    record: ObjectRef,
    rules: Vec<RuleItem>,
    loader: Rc<dyn ModuleLoader>,
    asset_hooks: RefCell<IdentityKeyedMap<Rc<Hook>>>,
    compilation_hooks_fn: HostFn,
    runs: RefCell<usize>,
}

impl Compiler {
    /// Build a compiler and apply the configuration's extensions to it
    ///
    /// `shim` backs the per-compilation hook table.
    pub fn new(
        config: PipelineConfig,
        loader: Rc<dyn ModuleLoader>,
        shim: IdentityShim,
    ) -> HostResult<Rc<Self>> {
        let hooks = CompilerHooks::new();
        let record = hooks.record();
        let compiler = Rc::new_cyclic(|me: &Weak<Compiler>| {
            let me = me.clone();
            Compiler {
                name: config.name.clone(),
                hooks,
                record,
                rules: config.rules.clone(),
                loader,
                asset_hooks: RefCell::new(IdentityKeyedMap::new(shim)),
                compilation_hooks_fn: HostFn::new(move |args: &[Value]| {
                    let compiler = me.upgrade().ok_or_else(|| anyhow!("compiler dropped"))?;
                    let Some(compilation) = args.first().and_then(Value::as_object) else {
                        bail!("compilationHooks expects a compilation");
                    };
                    let hook: ObjectRef = compiler.compilation_hooks(compilation);
                    Ok(Value::Object(hook))
                }),
                runs: RefCell::new(0),
            }
        });

        let root = compiler.as_value();
        for extension in &config.extensions {
            extension
                .apply(&root)
                .with_context(|| format!("applying extension {}", extension.name()))?;
        }
        for minimizer in &config.minimizers {
            apply_minimizer(minimizer, &root)?;
        }
        Ok(compiler)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_value(self: &Rc<Self>) -> Value {
        let obj: ObjectRef = self.clone();
        Value::Object(obj)
    }

    /// Asset hook of `compilation`, created on first request
    pub fn compilation_hooks(&self, compilation: &ObjectRef) -> Rc<Hook> {
        self.asset_hooks
            .borrow_mut()
            .get_or_insert_with(compilation, || Hook::new("assetEmitted", HookKind::Sync))
            .clone()
    }

    pub fn run_count(&self) -> usize {
        *self.runs.borrow()
    }

    /// Run the pipeline over `sources` (resource path -> contents)
    pub fn run(&self, sources: &BTreeMap<String, String>) -> HostResult<Artifacts> {
        block_on(self.run_async(sources))
    }

    pub async fn run_async(&self, sources: &BTreeMap<String, String>) -> HostResult<Artifacts> {
        *self.runs.borrow_mut() += 1;
        match self.build(sources).await {
            Ok(artifacts) => Ok(artifacts),
            Err(err) => {
                if let Err(hook_err) = self.hooks.failed.call(&[Value::string(err.to_string())]) {
                    warn!(compiler = %self.name, error = %hook_err, "failed hook errored");
                }
                Err(err)
            }
        }
    }

    async fn build(&self, sources: &BTreeMap<String, String>) -> HostResult<Artifacts> {
        self.hooks.environment.call(&[])?;
        self.hooks.compile.call(&[])?;

        let compilation = Compilation::new();
        let compilation_obj: ObjectRef = compilation.clone();
        let compilation_value = Value::Object(compilation_obj.clone());
        self.hooks.compilation.call(&[compilation_value.clone()])?;
        self.hooks.make.call_async(vec![compilation_value.clone()]).await?;

        for (resource, source) in sources {
            compilation.hooks.build_module.call(&[Value::string(resource)])?;
            let chain = resolve_chain(&self.rules, resource);
            let output = if chain.is_empty() {
                source.clone()
            } else {
                run_chain(self.loader.as_ref(), resource, &chain, source).await?
            };
            compilation.emit_asset(&asset_name(resource), output)?;
        }

        compilation.hooks.optimize.call(&[compilation_value.clone()])?;
        compilation
            .hooks
            .process_assets
            .call_async(vec![compilation_value.clone()])
            .await?;
        for key in compilation.hooks.stage.keys() {
            if let Some(hook) = compilation.hooks.stage.get(&key) {
                hook.call(&[compilation_value.clone()])?;
            }
        }

        let asset_hook = self.compilation_hooks(&compilation_obj);
        for (name, contents) in compilation.assets() {
            asset_hook.call(&[Value::string(name), Value::string(contents)])?;
        }

        self.hooks.emit.call_async(vec![compilation_value.clone()]).await?;
        let artifacts = compilation.assets();
        debug!(compiler = %self.name, assets = artifacts.len(), "pipeline run complete");

        let stats = serde_json::json!({
            "name": self.name,
            "assets": artifacts.keys().collect::<Vec<_>>(),
        });
        self.hooks.done.call_async(vec![stats.into()]).await?;
        self.asset_hooks.borrow_mut().prune();
        Ok(artifacts)
    }
}

fn apply_minimizer(minimizer: &Minimizer, root: &Value) -> HostResult<()> {
    minimizer
        .apply(root)
        .with_context(|| format!("applying minimizer {}", minimizer.name()))
}

/// Asset name for a resource: its file name
fn asset_name(resource: &str) -> String {
    resource
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(resource)
        .to_string()
}

impl HostObject for Compiler {
    fn type_tag(&self) -> &str {
        COMPILER_TAG
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Container(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl CarrierContainer for Compiler {
    fn member_names(&self) -> Vec<String> {
        ["hooks", "name", "compilationHooks", "_runs"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn member(&self, name: &str) -> HostResult<Value> {
        Ok(match name {
            "hooks" => Value::Object(self.record.clone()),
            "name" => Value::string(&self.name),
            "compilationHooks" => Value::Function(self.compilation_hooks_fn.clone()),
            "_runs" => serde_json::Value::from(self.run_count()).into(),
            _ => Value::Undefined,
        })
    }
}

pub struct CompilationHooks {
    pub build_module: Rc<Hook>,
    pub optimize: Rc<Hook>,
    pub process_assets: Rc<Hook>,
    pub stage: Rc<HookMap>,
}

pub struct Compilation {
    pub hooks: CompilationHooks,
    record: ObjectRef,
    assets: RefCell<Artifacts>,
    functions: BTreeMap<&'static str, HostFn>,
}

impl Compilation {
    pub fn new() -> Rc<Self> {
        let hooks = CompilationHooks {
            build_module: Hook::new("buildModule", HookKind::Sync),
            optimize: Hook::new("optimize", HookKind::Sync),
            process_assets: Hook::new("processAssets", HookKind::AsyncSeries),
            stage: HookMap::new("stage", HookKind::Sync),
        };
        let record = HooksRecord::new([
            ("buildModule", hooks.build_module.clone() as ObjectRef),
            ("optimize", hooks.optimize.clone() as ObjectRef),
            ("processAssets", hooks.process_assets.clone() as ObjectRef),
            ("stage", hooks.stage.clone() as ObjectRef),
        ]);
        Rc::new_cyclic(|me: &Weak<Compilation>| Compilation {
            hooks,
            record,
            assets: RefCell::new(BTreeMap::new()),
            functions: asset_functions(me),
        })
    }

    pub fn emit_asset(&self, name: &str, contents: String) -> HostResult<()> {
        let mut assets = self.assets.borrow_mut();
        if assets.contains_key(name) {
            bail!("asset {name} emitted twice");
        }
        assets.insert(name.to_string(), contents);
        Ok(())
    }

    pub fn update_asset(&self, name: &str, contents: String) -> HostResult<()> {
        match self.assets.borrow_mut().get_mut(name) {
            Some(slot) => {
                *slot = contents;
                Ok(())
            }
            None => bail!("cannot update missing asset {name}"),
        }
    }

    pub fn asset(&self, name: &str) -> Option<String> {
        self.assets.borrow().get(name).cloned()
    }

    pub fn assets(&self) -> Artifacts {
        self.assets.borrow().clone()
    }
}

fn text_arg(args: &[Value], index: usize, function: &str) -> HostResult<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{function} expects a string argument at position {index}"))
}

/// Host functions exposed as compilation members
fn asset_functions(me: &Weak<Compilation>) -> BTreeMap<&'static str, HostFn> {
    let upgrade = |me: &Weak<Compilation>| me.upgrade().ok_or_else(|| anyhow!("compilation dropped"));
    let mut functions = BTreeMap::new();

    let weak = me.clone();
    functions.insert(
        "emitAsset",
        HostFn::new(move |args: &[Value]| {
            let compilation = upgrade(&weak)?;
            compilation.emit_asset(&text_arg(args, 0, "emitAsset")?, text_arg(args, 1, "emitAsset")?)?;
            Ok(Value::Undefined)
        }),
    );
    let weak = me.clone();
    functions.insert(
        "updateAsset",
        HostFn::new(move |args: &[Value]| {
            let compilation = upgrade(&weak)?;
            compilation.update_asset(&text_arg(args, 0, "updateAsset")?, text_arg(args, 1, "updateAsset")?)?;
            Ok(Value::Undefined)
        }),
    );
    let weak = me.clone();
    functions.insert(
        "getAsset",
        HostFn::new(move |args: &[Value]| {
            let compilation = upgrade(&weak)?;
            Ok(compilation
                .asset(&text_arg(args, 0, "getAsset")?)
                .map(Value::string)
                .unwrap_or_default())
        }),
    );
    let weak = me.clone();
    functions.insert(
        "assetNames",
        HostFn::new(move |_: &[Value]| {
            let compilation = upgrade(&weak)?;
            let names: Vec<String> = compilation.assets.borrow().keys().cloned().collect();
            Ok(serde_json::Value::from(names).into())
        }),
    );
    functions
}

impl HostObject for Compilation {
    fn type_tag(&self) -> &str {
        COMPILATION_TAG
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Container(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl CarrierContainer for Compilation {
    fn member_names(&self) -> Vec<String> {
        let mut names = vec!["hooks".to_string(), "_assetCount".to_string()];
        names.extend(self.functions.keys().map(|name| name.to_string()));
        names
    }

    fn member(&self, name: &str) -> HostResult<Value> {
        Ok(match name {
            "hooks" => Value::Object(self.record.clone()),
            "_assetCount" => serde_json::Value::from(self.assets.borrow().len()).into(),
            other => self
                .functions
                .get(other)
                .map(|f| Value::Function(f.clone()))
                .unwrap_or_default(),
        })
    }
}
