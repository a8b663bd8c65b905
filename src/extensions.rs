// ABOUTME: Custom-tag extension contract: trait, AST node, and the
// registry with dependency tracking and lifecycle hooks

use crate::ast::{Expr, Stmt};
use crate::error::TemplateError;
use crate::parser::ParserView;
use crate::value::{Kwargs, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Render-time callback carried by an extension's AST node. Receives
/// the evaluated positional and named arguments and, when the tag had
/// a body, its rendered output. The returned value is written to the
/// output buffer.
pub type ExtensionEvalFn =
    dyn Fn(&[Value], &Kwargs, Option<&str>) -> Result<Value, TemplateError> + Send + Sync;

/// AST node produced by an extension's parse callback.
#[derive(Clone)]
pub struct ExtensionNode {
    /// Name of the owning extension
    pub name: String,
    /// The tag word that triggered parsing
    pub tag: String,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
    /// Body statements, for tags registered with an end tag
    pub body: Option<Arc<Vec<Stmt>>>,
    pub eval: Arc<ExtensionEvalFn>,
}

impl fmt::Debug for ExtensionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionNode")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// A user-supplied custom tag. When the parser sees one of
/// `tag_words()` at the start of a block, it delegates to `parse`,
/// which consumes tokens through the tag (and optional body plus end
/// tag) and returns the node to evaluate at render time.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn tag_words(&self) -> &[&str];

    /// Names of extensions that must already be registered
    fn dependencies(&self) -> &[&str] {
        &[]
    }

    fn parse(&self, tag: &str, view: &mut ParserView<'_, '_>)
        -> Result<ExtensionNode, TemplateError>;

    // Lifecycle hooks; errors propagate wrapped as ExtensionError
    fn on_load(&self) -> Result<(), TemplateError> {
        Ok(())
    }

    fn on_unload(&self) -> Result<(), TemplateError> {
        Ok(())
    }

    fn before_render(&self) -> Result<(), TemplateError> {
        Ok(())
    }

    fn after_render(&self) -> Result<(), TemplateError> {
        Ok(())
    }
}

#[derive(Default)]
struct Inner {
    extensions: HashMap<String, Arc<dyn Extension>>,
    /// tag word → owning extension name
    tags: HashMap<String, String>,
}

/// Registry of extensions keyed by name, with tag-word lookup for the
/// parser. Dependencies form a DAG checked at registration time.
#[derive(Default)]
pub struct ExtensionRegistry {
    inner: RwLock<Inner>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension. Fails when a dependency is missing, a
    /// tag word is already taken, or the `on_load` hook errors.
    pub fn register(&self, ext: Arc<dyn Extension>) -> Result<(), TemplateError> {
        let name = ext.name().to_string();
        let mut inner = self.inner.write().expect("extension registry poisoned");

        if inner.extensions.contains_key(&name) {
            return Err(TemplateError::name_error(
                format!("extension `{name}` is already registered"),
                None,
            ));
        }
        for dep in ext.dependencies() {
            if !inner.extensions.contains_key(*dep) {
                return Err(TemplateError::name_error(
                    format!("extension `{name}` requires `{dep}`, which is not registered"),
                    None,
                ));
            }
        }
        for word in ext.tag_words() {
            if let Some(owner) = inner.tags.get(*word) {
                return Err(TemplateError::name_error(
                    format!("tag `{word}` is already provided by extension `{owner}`"),
                    None,
                ));
            }
        }

        ext.on_load()
            .map_err(|e| TemplateError::extension(&name, "on_load", e))?;

        for word in ext.tag_words() {
            inner.tags.insert((*word).to_string(), name.clone());
        }
        inner.extensions.insert(name, ext);
        Ok(())
    }

    /// Unregister by name. Fails while other registered extensions
    /// still depend on it, or when the `on_unload` hook errors.
    pub fn unregister(&self, name: &str) -> Result<(), TemplateError> {
        let mut inner = self.inner.write().expect("extension registry poisoned");

        if !inner.extensions.contains_key(name) {
            return Err(TemplateError::name_error(
                format!("extension `{name}` is not registered"),
                None,
            ));
        }
        for (other_name, other) in &inner.extensions {
            if other_name != name && other.dependencies().contains(&name) {
                return Err(TemplateError::name_error(
                    format!("extension `{name}` is still required by `{other_name}`"),
                    None,
                ));
            }
        }

        let ext = inner
            .extensions
            .remove(name)
            .expect("presence checked above");
        inner.tags.retain(|_, owner| owner != name);
        drop(inner);

        ext.on_unload()
            .map_err(|e| TemplateError::extension(name, "on_unload", e))
    }

    /// The extension owning a tag word, if any
    pub fn lookup_tag(&self, word: &str) -> Option<Arc<dyn Extension>> {
        let inner = self.inner.read().expect("extension registry poisoned");
        let owner = inner.tags.get(word)?;
        inner.extensions.get(owner).cloned()
    }

    pub fn is_tag(&self, word: &str) -> bool {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .tags
            .contains_key(word)
    }

    /// All registered extensions, for render lifecycle hooks
    pub fn all(&self) -> Vec<Arc<dyn Extension>> {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .extensions
            .values()
            .cloned()
            .collect()
    }
}
