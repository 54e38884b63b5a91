// Load interception for resource transformers
//
// The interceptor sits between the host's transformer loading path and the
// real loader. Candidate ids are loaded from the real loader once, handed to
// the substitute, and the substituted module is served from then on. The
// scout transformer, inserted first in every rule, discovers candidates: its
// pitch phase sees the resource's whole chain before any other transformer of
// that chain is loaded.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use tracing::debug;

use super::{ModuleLoader, TransformContext, TransformerModule, TransformerRecord};
use crate::error::HostResult;
use crate::value::{Reply, Value};

/// Module id of the instrumentation's own scout transformer
pub const SCOUT_ID: &str = "hooktime/scout";

/// Produces the module served in place of a candidate
pub type Substitute = Rc<dyn Fn(TransformerModule, &str) -> HostResult<TransformerModule>>;

#[derive(Default)]
struct LoadState {
    installed: bool,
    candidates: BTreeSet<String>,
    substituted: HashMap<String, TransformerModule>,
}

/// A [`ModuleLoader`] that substitutes candidate transformers
#[derive(Clone)]
pub struct LoadInterceptor {
    real: Rc<dyn ModuleLoader>,
    substitute: Substitute,
    state: Rc<RefCell<LoadState>>,
}

/// Route transformer loads through a substituting interceptor
///
/// While installed, loads of any id in `candidates` (or added later by the
/// scout) are served by `substitute` applied to the real module.
pub fn install_load_interceptor(
    real: Rc<dyn ModuleLoader>,
    candidates: impl IntoIterator<Item = String>,
    substitute: impl Fn(TransformerModule, &str) -> HostResult<TransformerModule> + 'static,
) -> LoadInterceptor {
    LoadInterceptor {
        real,
        substitute: Rc::new(substitute),
        state: Rc::new(RefCell::new(LoadState {
            installed: true,
            candidates: candidates.into_iter().collect(),
            substituted: HashMap::new(),
        })),
    }
}

impl LoadInterceptor {
    pub fn is_installed(&self) -> bool {
        self.state.borrow().installed
    }

    /// Stop substituting; every load goes to the real loader
    pub fn uninstall(&self) {
        let mut state = self.state.borrow_mut();
        state.installed = false;
        state.substituted.clear();
    }

    /// Forget substituted modules; the next load of a candidate substitutes afresh
    pub fn clear_substitutions(&self) {
        self.state.borrow_mut().substituted.clear();
    }

    pub fn add_candidates(&self, paths: impl IntoIterator<Item = String>) {
        add_candidates(&self.state, paths);
    }

    pub fn candidates(&self) -> Vec<String> {
        self.state.borrow().candidates.iter().cloned().collect()
    }

    fn scout(&self) -> TransformerModule {
        let state = Rc::downgrade(&self.state);
        let pitch = move |ctx: &TransformContext, _: &[Value]| -> HostResult<Reply> {
            if let Some(state) = state.upgrade() {
                add_candidates(&state, ctx.chain().iter().cloned());
            }
            Ok(Reply::Ready(Value::Undefined))
        };
        let normal = |_: &TransformContext, args: &[Value]| -> HostResult<Reply> {
            Ok(Reply::Ready(args.first().cloned().unwrap_or_default()))
        };
        TransformerModule::Record(TransformerRecord {
            normal: Some(Rc::new(normal)),
            pitch: Some(Rc::new(pitch)),
            raw: false,
        })
    }
}

fn add_candidates(state: &RefCell<LoadState>, paths: impl IntoIterator<Item = String>) {
    let mut state = state.borrow_mut();
    for path in paths {
        if path != SCOUT_ID {
            state.candidates.insert(path);
        }
    }
}

impl ModuleLoader for LoadInterceptor {
    fn load(&self, id: &str) -> HostResult<TransformerModule> {
        if id == SCOUT_ID {
            return Ok(self.scout());
        }
        {
            let state = self.state.borrow();
            if !state.installed || !state.candidates.contains(id) {
                drop(state);
                return self.real.load(id);
            }
            if let Some(module) = state.substituted.get(id) {
                return Ok(module.clone());
            }
        }
        let real = self.real.load(id)?;
        let module = (self.substitute)(real, id)?;
        debug!(path = id, "substituted transformer");
        self.state
            .borrow_mut()
            .substituted
            .insert(id.to_string(), module.clone());
        Ok(module)
    }
}
