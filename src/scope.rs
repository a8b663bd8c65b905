// ABOUTME: Scope module managing the linked stack of variable frames used
// during rendering

use crate::value::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One frame of the name-lookup stack. Reads walk outward through the
/// parent chain; writes land in this frame. Frames are shared by
/// handle (`Arc`) so macros capture their defining frame and observe
/// later mutations to it.
#[derive(Debug, Default)]
pub struct Scope {
    bindings: RwLock<HashMap<String, Value>>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    /// Creates a root frame with no parent
    pub fn new() -> Arc<Self> {
        Arc::new(Scope::default())
    }

    /// Creates a root frame pre-populated with the render context
    pub fn with_bindings(bindings: HashMap<String, Value>) -> Arc<Self> {
        Arc::new(Scope {
            bindings: RwLock::new(bindings),
            parent: None,
        })
    }

    /// Creates a child frame chained to `parent`
    pub fn child(parent: &Arc<Scope>) -> Arc<Self> {
        Arc::new(Scope {
            bindings: RwLock::new(HashMap::new()),
            parent: Some(Arc::clone(parent)),
        })
    }

    /// Binds a name in THIS frame (does not walk the parent chain).
    /// `set` statements write to the innermost frame.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.bindings
            .write()
            .expect("scope lock poisoned")
            .insert(name.into(), value);
    }

    /// Looks up a name here and then in parent frames
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self
            .bindings
            .read()
            .expect("scope lock poisoned")
            .get(name)
        {
            return Some(value.clone());
        }
        match &self.parent {
            Some(parent) => parent.get(name),
            None => None,
        }
    }

    /// Whether the name is bound anywhere in the chain
    pub fn contains(&self, name: &str) -> bool {
        if self
            .bindings
            .read()
            .expect("scope lock poisoned")
            .contains_key(name)
        {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.contains(name))
    }

    /// Names bound in this frame only, for module imports
    pub fn local_bindings(&self) -> Vec<(String, Value)> {
        self.bindings
            .read()
            .expect("scope lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
