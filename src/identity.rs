//! Identity translation for host lookups keyed by object identity
//!
//! Once a carrier is wrapped, the host may see either the original or the
//! wrapped view of the same logical object. Side tables keyed by raw identity
//! would then split in two. The shim keeps a bidirectional side table:
//!
//! - view → original, registered eagerly when a view is created
//! - original → [`SurrogateToken`], attached once on first sight
//!
//! [`IdentityKeyedMap`] is the adapter host code puts in front of its
//! identity-keyed bookkeeping. Every key is resolved to its original and then
//! to the token, so lookups agree whichever reference the host holds.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde::Serialize;

use crate::carrier::{identity_of, HostObject, ObjectRef};

/// Stable, opaque per-object key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SurrogateToken(u64);

impl SurrogateToken {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

struct TokenEntry {
    original: Weak<dyn HostObject>,
    token: SurrogateToken,
}

struct AliasEntry {
    view: Weak<dyn HostObject>,
    original: Weak<dyn HostObject>,
}

#[derive(Default)]
struct ShimState {
    tokens: HashMap<usize, TokenEntry>,
    aliases: HashMap<usize, AliasEntry>,
    next_token: u64,
}

/// Live object behind `weak`, if it still sits at `addr`
fn live_at(weak: &Weak<dyn HostObject>, addr: usize) -> Option<ObjectRef> {
    weak.upgrade().filter(|obj| identity_of(obj) == addr)
}

/// Shared identity side table
#[derive(Clone, Default)]
pub struct IdentityShim {
    state: Rc<RefCell<ShimState>>,
}

impl IdentityShim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `view` stands for `original`
    pub fn alias(&self, view: &ObjectRef, original: &ObjectRef) {
        let original = self.resolve(original);
        if identity_of(view) == identity_of(&original) {
            return;
        }
        self.state.borrow_mut().aliases.insert(
            identity_of(view),
            AliasEntry {
                view: Rc::downgrade(view),
                original: Rc::downgrade(&original),
            },
        );
    }

    pub fn is_alias(&self, obj: &ObjectRef) -> bool {
        let addr = identity_of(obj);
        let state = self.state.borrow();
        state
            .aliases
            .get(&addr)
            .is_some_and(|entry| live_at(&entry.view, addr).is_some())
    }

    /// The original object behind `obj` (itself when it is not a view)
    pub fn resolve(&self, obj: &ObjectRef) -> ObjectRef {
        let mut current = obj.clone();
        let mut state = self.state.borrow_mut();
        loop {
            let addr = identity_of(&current);
            let Some(entry) = state.aliases.get(&addr) else {
                return current;
            };
            if live_at(&entry.view, addr).is_none() {
                // Address reused by an unrelated object
                state.aliases.remove(&addr);
                return current;
            }
            match entry.original.upgrade() {
                Some(original) => current = original,
                None => return current,
            }
        }
    }

    /// Token of the logical object behind `obj`, attached on first sight
    pub fn token_for(&self, obj: &ObjectRef) -> SurrogateToken {
        let original = self.resolve(obj);
        let addr = identity_of(&original);
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.tokens.get(&addr) {
            if live_at(&entry.original, addr).is_some() {
                return entry.token;
            }
        }
        state.next_token += 1;
        let token = SurrogateToken(state.next_token);
        state.tokens.insert(
            addr,
            TokenEntry {
                original: Rc::downgrade(&original),
                token,
            },
        );
        token
    }

    /// Token if one was already attached
    pub fn existing_token(&self, obj: &ObjectRef) -> Option<SurrogateToken> {
        let original = self.resolve(obj);
        let addr = identity_of(&original);
        let state = self.state.borrow();
        state
            .tokens
            .get(&addr)
            .filter(|entry| live_at(&entry.original, addr).is_some())
            .map(|entry| entry.token)
    }

    /// Drop entries whose objects are gone
    pub fn prune(&self) {
        let mut state = self.state.borrow_mut();
        state
            .tokens
            .retain(|addr, entry| live_at(&entry.original, *addr).is_some());
        state
            .aliases
            .retain(|addr, entry| live_at(&entry.view, *addr).is_some());
    }

    pub fn alias_count(&self) -> usize {
        self.state.borrow().aliases.len()
    }
}

/// Identity-keyed side table that treats views and originals alike
pub struct IdentityKeyedMap<V> {
    shim: IdentityShim,
    entries: HashMap<SurrogateToken, (Weak<dyn HostObject>, V)>,
}

impl<V> IdentityKeyedMap<V> {
    pub fn new(shim: IdentityShim) -> Self {
        Self {
            shim,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: &ObjectRef, value: V) -> Option<V> {
        let token = self.shim.token_for(key);
        let original = Rc::downgrade(&self.shim.resolve(key));
        self.entries
            .insert(token, (original, value))
            .map(|(_, old)| old)
    }

    pub fn get(&self, key: &ObjectRef) -> Option<&V> {
        let token = self.shim.existing_token(key)?;
        self.entries.get(&token).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &ObjectRef) -> bool {
        self.get(key).is_some()
    }

    pub fn get_or_insert_with(&mut self, key: &ObjectRef, make: impl FnOnce() -> V) -> &mut V {
        let token = self.shim.token_for(key);
        let original = Rc::downgrade(&self.shim.resolve(key));
        let (_, value) = self
            .entries
            .entry(token)
            .or_insert_with(|| (original, make()));
        value
    }

    pub fn remove(&mut self, key: &ObjectRef) -> Option<V> {
        let token = self.shim.existing_token(key)?;
        self.entries.remove(&token).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose key objects are gone
    pub fn prune(&mut self) {
        self.entries
            .retain(|_, (original, _)| original.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    struct Obj(&'static str);

    impl HostObject for Obj {
        fn type_tag(&self) -> &str {
            self.0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn obj(tag: &'static str) -> ObjectRef {
        Rc::new(Obj(tag))
    }

    #[test]
    fn test_token_attached_once_per_original() {
        let shim = IdentityShim::new();
        let original = obj("Compilation");
        let first = shim.token_for(&original);
        let second = shim.token_for(&original);
        assert_eq!(first, second);
        assert_eq!(shim.existing_token(&original), Some(first));
    }

    #[test]
    fn test_view_and_original_share_a_token() {
        let shim = IdentityShim::new();
        let original = obj("Compilation");
        let view = obj("Compilation");
        shim.alias(&view, &original);

        assert!(shim.is_alias(&view));
        assert!(!shim.is_alias(&original));
        assert_eq!(shim.token_for(&view), shim.token_for(&original));
        assert_eq!(identity_of(&shim.resolve(&view)), identity_of(&original));
    }

    #[test]
    fn test_alias_chains_resolve_to_the_root() {
        let shim = IdentityShim::new();
        let original = obj("Compiler");
        let shadow = obj("Compiler");
        let view = obj("Compiler");
        shim.alias(&shadow, &original);
        shim.alias(&view, &shadow);
        assert_eq!(identity_of(&shim.resolve(&view)), identity_of(&original));
    }

    #[test]
    fn test_keyed_map_lookup_through_either_reference() {
        let shim = IdentityShim::new();
        let original = obj("Compilation");
        let view = obj("Compilation");
        shim.alias(&view, &original);

        let mut map = IdentityKeyedMap::new(shim.clone());
        map.insert(&original, "stored against original");
        assert_eq!(map.get(&view), Some(&"stored against original"));

        *map.get_or_insert_with(&view, || "unused") = "updated through view";
        assert_eq!(map.get(&original), Some(&"updated through view"));
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove(&view), Some("updated through view"));
        assert!(map.is_empty());
        assert!(!map.contains(&original));
    }

    #[test]
    fn test_unaliased_objects_stay_distinct() {
        let shim = IdentityShim::new();
        let a = obj("Compilation");
        let b = obj("Compilation");
        let mut map = IdentityKeyedMap::new(shim);
        map.insert(&a, 1);
        map.insert(&b, 2);
        assert_eq!(map.get(&a), Some(&1));
        assert_eq!(map.get(&b), Some(&2));
    }

    #[test]
    fn test_prune_drops_dead_entries() {
        let shim = IdentityShim::new();
        let mut map = IdentityKeyedMap::new(shim.clone());
        {
            let short_lived = obj("Compilation");
            let view = obj("Compilation");
            shim.alias(&view, &short_lived);
            map.insert(&short_lived, ());
        }
        shim.prune();
        map.prune();
        assert_eq!(shim.alias_count(), 0);
        assert!(map.is_empty());
    }
}
