// Extension points of the reference host
//
// A `Hook` keeps its taps ordered by stage and runs them when the host calls
// it. Registration operations are built once per hook and hold only a weak
// reference back to it, so a shadow copy of a frozen hook still registers on
// the original.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail};
use futures::channel::oneshot;
use futures::future::join_all;

use crate::carrier::{CarrierContainer, ExtensionPoint, HostObject, KeyedCollection, ObjectRef, Shape};
use crate::error::HostResult;
use crate::value::{Callback, Completer, Completion, HostFn, Reply, Value};

pub const HOOK_TAG: &str = "Hook";
pub const LEGACY_HOOK_TAG: &str = "LegacyHook";
pub const HOOK_MAP_TAG: &str = "HookMap";
pub const HOOKS_TAG: &str = "Hooks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Only `tap`; taps run in order, synchronously
    Sync,
    /// Taps run one after another, each awaited
    AsyncSeries,
    /// Taps start together and are awaited jointly
    AsyncParallel,
}

#[derive(Clone)]
struct Tap {
    name: String,
    stage: i64,
    callback: Callback,
}

pub struct Hook {
    name: String,
    kind: HookKind,
    frozen: bool,
    taps: RefCell<Vec<Tap>>,
    registrars: [Option<HostFn>; 3],
}

impl Hook {
    pub fn new(name: &str, kind: HookKind) -> Rc<Self> {
        Self::build(name, kind, false)
    }

    /// A hook that is immutable once created; interception shadows it
    pub fn frozen(name: &str, kind: HookKind) -> Rc<Self> {
        Self::build(name, kind, true)
    }

    fn build(name: &str, kind: HookKind, frozen: bool) -> Rc<Self> {
        Rc::new_cyclic(|hook: &Weak<Hook>| {
            let registrars = Completion::ALL.map(|completion| {
                let supported = kind != HookKind::Sync || completion == Completion::Immediate;
                supported.then(|| registrar(hook.clone(), completion))
            });
            Hook {
                name: name.to_string(),
                kind,
                frozen,
                taps: RefCell::new(Vec::new()),
                registrars,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    pub fn tap_names(&self) -> Vec<String> {
        self.taps.borrow().iter().map(|tap| tap.name.clone()).collect()
    }

    pub fn is_used(&self) -> bool {
        !self.taps.borrow().is_empty()
    }

    fn add_tap(&self, args: &[Value], completion: Completion) -> HostResult<Value> {
        let [options, callback] = args else {
            bail!("{}.{} expects (options, callback)", self.name, completion.registrar_name());
        };
        let (name, stage) = parse_tap_options(options)?;
        let callback = match callback {
            Value::Callback(cb) if cb.completion() == completion => cb.clone(),
            _ => bail!(
                "{}.{} expects a {} callback",
                self.name,
                completion.registrar_name(),
                completion.label()
            ),
        };
        let mut taps = self.taps.borrow_mut();
        let at = taps.iter().position(|tap| tap.stage > stage).unwrap_or(taps.len());
        taps.insert(at, Tap { name, stage, callback });
        Ok(Value::Undefined)
    }

    /// Run every tap synchronously
    pub fn call(&self, args: &[Value]) -> HostResult<()> {
        let taps = self.taps.borrow().clone();
        for tap in taps {
            match &tap.callback {
                Callback::Immediate(f) => {
                    f(args)?;
                }
                _ => bail!("{} is called synchronously but `{}` is asynchronous", self.name, tap.name),
            }
        }
        Ok(())
    }

    /// Run every tap, awaiting asynchronous ones
    pub async fn call_async(&self, args: Vec<Value>) -> HostResult<()> {
        let taps = self.taps.borrow().clone();
        match self.kind {
            HookKind::Sync => self.call(&args),
            HookKind::AsyncSeries => {
                for tap in taps {
                    run_tap(tap, args.clone()).await?;
                }
                Ok(())
            }
            HookKind::AsyncParallel => {
                let outcomes = join_all(taps.into_iter().map(|tap| run_tap(tap, args.clone()))).await;
                outcomes.into_iter().try_for_each(|outcome| outcome.map(drop))
            }
        }
    }
}

fn registrar(hook: Weak<Hook>, completion: Completion) -> HostFn {
    HostFn::new(move |args: &[Value]| {
        let hook = hook
            .upgrade()
            .ok_or_else(|| anyhow!("{} on a dropped hook", completion.registrar_name()))?;
        hook.add_tap(args, completion)
    })
}

/// Options are a bare name or `{"name": .., "stage": ..}`
fn parse_tap_options(options: &Value) -> HostResult<(String, i64)> {
    let Value::Data(data) = options else {
        bail!("tap options must be a name or an options object");
    };
    match data {
        serde_json::Value::String(name) => Ok((name.clone(), 0)),
        serde_json::Value::Object(map) => {
            let name = map
                .get("name")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| anyhow!("tap options need a name"))?;
            let stage = map.get("stage").and_then(serde_json::Value::as_i64).unwrap_or(0);
            Ok((name.to_string(), stage))
        }
        other => bail!("invalid tap options {other}"),
    }
}

async fn run_tap(tap: Tap, args: Vec<Value>) -> HostResult<Value> {
    match tap.callback {
        Callback::Immediate(f) => f(&args),
        Callback::Signal(f) => {
            let (tx, rx) = oneshot::channel();
            let completer = Completer::new(move |result| {
                let _ = tx.send(result);
            });
            let reply = f(&args, &completer)?;
            let deferred = completer.is_deferred();
            // Only outstanding handles may keep the slot alive
            drop(completer);
            match reply {
                Reply::Ready(value) if !deferred => Ok(value),
                Reply::Pending if !deferred => {
                    bail!("`{}` reported a pending result without deferring", tap.name)
                }
                _ => rx
                    .await
                    .map_err(|_| anyhow!("`{}` dropped its completion handle", tap.name))?,
            }
        }
        Callback::Deferred(f) => f(&args).await,
    }
}

impl HostObject for Hook {
    fn type_tag(&self) -> &str {
        if self.frozen {
            LEGACY_HOOK_TAG
        } else {
            HOOK_TAG
        }
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Point(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ExtensionPoint for Hook {
    fn point_name(&self) -> &str {
        &self.name
    }

    fn registrar(&self, completion: Completion) -> Option<HostFn> {
        self.registrars[completion.index()].clone()
    }

    fn member(&self, name: &str) -> HostResult<Value> {
        Ok(match name {
            "name" => Value::string(&self.name),
            "isUsed" => serde_json::Value::Bool(self.is_used()).into(),
            _ => Value::Undefined,
        })
    }

    fn is_frozen(&self) -> bool {
        self.frozen
    }
}

/// Hooks created on demand per key
pub struct HookMap {
    name: String,
    kind: HookKind,
    hooks: RefCell<BTreeMap<String, Rc<Hook>>>,
}

impl HookMap {
    pub fn new(name: &str, kind: HookKind) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_string(),
            kind,
            hooks: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn for_key(&self, key: &str) -> Rc<Hook> {
        self.hooks
            .borrow_mut()
            .entry(key.to_string())
            .or_insert_with(|| Hook::new(&format!("{}[{key}]", self.name), self.kind))
            .clone()
    }

    /// Hook for `key` only if something created it
    pub fn get(&self, key: &str) -> Option<Rc<Hook>> {
        self.hooks.borrow().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.hooks.borrow().keys().cloned().collect()
    }
}

impl HostObject for HookMap {
    fn type_tag(&self) -> &str {
        HOOK_MAP_TAG
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Keyed(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl KeyedCollection for HookMap {
    fn lookup(&self, key: &str) -> HostResult<Value> {
        let hook: ObjectRef = self.for_key(key);
        Ok(Value::Object(hook))
    }
}

/// Frozen record of named hooks; every member is a carrier
pub struct HooksRecord {
    members: BTreeMap<String, ObjectRef>,
}

impl HooksRecord {
    pub fn new(members: impl IntoIterator<Item = (&'static str, ObjectRef)>) -> Rc<Self> {
        Rc::new(Self {
            members: members
                .into_iter()
                .map(|(name, obj)| (name.to_string(), obj))
                .collect(),
        })
    }
}

impl HostObject for HooksRecord {
    fn type_tag(&self) -> &str {
        HOOKS_TAG
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Container(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl CarrierContainer for HooksRecord {
    fn member_names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    fn member(&self, name: &str) -> HostResult<Value> {
        Ok(self
            .members
            .get(name)
            .map(|obj| Value::Object(obj.clone()))
            .unwrap_or_default())
    }

    fn is_frozen(&self) -> bool {
        true
    }

    fn is_strict(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn as_value(hook: &Rc<Hook>) -> Value {
        let obj: ObjectRef = hook.clone();
        Value::Object(obj)
    }

    #[test]
    fn test_taps_run_in_stage_order() {
        let hook = Hook::new("compile", HookKind::Sync);
        let order = Rc::new(RefCell::new(Vec::new()));
        let value = as_value(&hook);
        for (name, stage) in [("b", 0), ("last", 10), ("a", 0), ("first", -10)] {
            let order = order.clone();
            value
                .register_with(
                    serde_json::json!({ "name": name, "stage": stage }).into(),
                    Callback::immediate(move |_| {
                        order.borrow_mut().push(name);
                        Ok(Value::Undefined)
                    }),
                )
                .unwrap();
        }
        hook.call(&[]).unwrap();
        assert_eq!(*order.borrow(), vec!["first", "b", "a", "last"]);
        assert_eq!(hook.tap_names(), vec!["first", "b", "a", "last"]);
    }

    #[test]
    fn test_sync_hook_only_supports_tap() {
        let hook = Hook::new("compile", HookKind::Sync);
        assert!(hook.registrar(Completion::Immediate).is_some());
        assert!(hook.registrar(Completion::Signal).is_none());
        assert!(as_value(&hook)
            .tap_promise("x", |_| async { Ok(Value::Undefined) })
            .is_err());
    }

    #[test]
    fn test_async_series_awaits_each_convention() {
        let hook = Hook::new("emit", HookKind::AsyncSeries);
        let log = Rc::new(RefCell::new(Vec::new()));
        let value = as_value(&hook);

        let l = log.clone();
        value
            .tap_async("signal", move |_, completer| {
                let handle = completer.defer();
                l.borrow_mut().push("signal");
                handle.complete(Ok(Value::Undefined));
                Ok(Reply::Pending)
            })
            .unwrap();
        let l = log.clone();
        value
            .tap_promise("deferred", move |_| {
                let l = l.clone();
                async move {
                    l.borrow_mut().push("deferred");
                    Ok::<_, anyhow::Error>(Value::Undefined)
                }
            })
            .unwrap();
        let l = log.clone();
        value
            .tap("immediate", move |_| {
                l.borrow_mut().push("immediate");
                Ok(Value::Undefined)
            })
            .unwrap();

        block_on(hook.call_async(Vec::new())).unwrap();
        assert_eq!(*log.borrow(), vec!["signal", "deferred", "immediate"]);
    }

    #[test]
    fn test_dropped_completion_handle_is_an_error() {
        let hook = Hook::new("emit", HookKind::AsyncSeries);
        as_value(&hook)
            .tap_async("forgetful", |_, completer| {
                drop(completer.defer());
                Ok(Reply::Pending)
            })
            .unwrap();
        let err = block_on(hook.call_async(Vec::new())).unwrap_err();
        assert!(err.to_string().contains("dropped its completion handle"));
    }

    #[test]
    fn test_parallel_hook_propagates_errors() {
        let hook = Hook::new("make", HookKind::AsyncParallel);
        let value = as_value(&hook);
        value.tap("ok", |_| Ok(Value::Undefined)).unwrap();
        value
            .tap_promise("fails", |_| async { Err(anyhow!("boom")) })
            .unwrap();
        assert!(block_on(hook.call_async(Vec::new())).is_err());
    }

    #[test]
    fn test_hook_map_creates_hooks_on_demand() {
        let map = HookMap::new("stage", HookKind::Sync);
        assert!(map.get("report").is_none());
        let first = map.for_key("report");
        let second = map.lookup("report").unwrap();
        let second: ObjectRef = second.as_object().unwrap().clone();
        let first: ObjectRef = first;
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(map.keys(), vec!["report"]);
    }

    #[test]
    fn test_frozen_hook_reports_legacy_tag() {
        let hook = Hook::frozen("environment", HookKind::Sync);
        assert_eq!(hook.type_tag(), LEGACY_HOOK_TAG);
        assert!(ExtensionPoint::is_frozen(hook.as_ref()));
    }
}
