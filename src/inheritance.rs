// ABOUTME: Inheritance resolver: extends-chain walking, block override
// resolution, and the memoizing cache keyed by leaf template

use crate::environment::Environment;
use crate::error::TemplateError;
use crate::ast::Stmt;
use crate::template::CompiledTemplate;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// The resolved view of an inheritance hierarchy: the template chain
/// from base to leaf, and for every block name the definitions ordered
/// most-derived first. `bodies[0]` is the effective body; `bodies[1]`
/// is what `super()` reaches, and so on.
#[derive(Debug)]
pub struct ResolvedHierarchy {
    /// Root (base-most) template first, leaf last
    pub chain: Vec<Arc<CompiledTemplate>>,
    pub blocks: HashMap<String, Vec<Arc<Vec<Stmt>>>>,
}

impl ResolvedHierarchy {
    fn build(chain_leaf_first: Vec<Arc<CompiledTemplate>>) -> Self {
        let mut blocks: HashMap<String, Vec<Arc<Vec<Stmt>>>> = HashMap::new();
        for template in &chain_leaf_first {
            for (name, body) in &template.blocks {
                blocks
                    .entry(name.clone())
                    .or_default()
                    .push(Arc::clone(body));
            }
        }
        let mut chain = chain_leaf_first;
        chain.reverse();
        Self { chain, blocks }
    }
}

struct CacheEntry {
    participants: Vec<Arc<CompiledTemplate>>,
    resolved: Arc<ResolvedHierarchy>,
}

/// Memoized hierarchy resolutions keyed by leaf template name. An
/// entry is reused only while every participating compilation is still
/// the current one in the compile cache; recompiling any participant
/// invalidates it.
#[derive(Default)]
pub struct InheritanceCache {
    inner: RwLock<HashMap<String, CacheEntry>>,
}

impl InheritanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, leaf: &str) -> Option<(Vec<Arc<CompiledTemplate>>, Arc<ResolvedHierarchy>)> {
        let inner = self.inner.read().expect("inheritance cache poisoned");
        inner
            .get(leaf)
            .map(|e| (e.participants.clone(), Arc::clone(&e.resolved)))
    }

    fn insert(
        &self,
        leaf: String,
        participants: Vec<Arc<CompiledTemplate>>,
        resolved: Arc<ResolvedHierarchy>,
    ) {
        self.inner
            .write()
            .expect("inheritance cache poisoned")
            .insert(
                leaf,
                CacheEntry {
                    participants,
                    resolved,
                },
            );
    }

    /// Drop entries that involve the named template
    pub fn invalidate(&self, name: &str) {
        self.inner
            .write()
            .expect("inheritance cache poisoned")
            .retain(|_, entry| !entry.participants.iter().any(|p| p.name == name));
    }
}

/// Resolve the hierarchy of `leaf`, memoizing when the whole extends
/// chain is literal and the leaf came through the loader.
pub fn resolve(
    env: &Environment,
    leaf: &Arc<CompiledTemplate>,
) -> Result<Arc<ResolvedHierarchy>, TemplateError> {
    let cacheable = leaf.version.is_some() && leaf.literal_parent().is_some();

    if cacheable {
        if let Some((participants, resolved)) = env.inheritance_cache().lookup(&leaf.name) {
            if validate(env, leaf, &participants) {
                return Ok(resolved);
            }
            log::debug!(
                "inheritance cache entry for `{}` is stale, re-resolving",
                leaf.name
            );
            env.inheritance_cache().invalidate(&leaf.name);
        }
    }

    let parent_name = match leaf.literal_parent() {
        Some(name) => name.to_string(),
        None => {
            return Err(TemplateError::inheritance(
                "extends target must be a literal string to resolve statically",
                leaf.parent.as_ref().map(|e| e.span),
            ));
        }
    };
    let resolved = resolve_with_parent(env, leaf, &parent_name)?;

    if cacheable {
        let mut participants = resolved.chain.clone();
        participants.reverse(); // store leaf-first, matching lookups
        env.inheritance_cache()
            .insert(leaf.name.clone(), participants, Arc::clone(&resolved));
    }
    Ok(resolved)
}

/// Resolve with the leaf's parent name already known (used when the
/// `extends` expression was evaluated against the render context).
/// Parents beyond the first must use literal targets.
pub fn resolve_with_parent(
    env: &Environment,
    leaf: &Arc<CompiledTemplate>,
    parent_name: &str,
) -> Result<Arc<ResolvedHierarchy>, TemplateError> {
    let mut chain = vec![Arc::clone(leaf)];
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(leaf.name.clone());

    let mut next = Some(parent_name.to_string());
    while let Some(name) = next {
        if !seen.insert(name.clone()) {
            return Err(TemplateError::inheritance(
                format!("cycle in extends chain at `{name}`"),
                None,
            ));
        }
        let parent = env.get_template(&name)?;
        next = match (&parent.parent, parent.literal_parent()) {
            (None, _) => None,
            (Some(_), Some(grandparent)) => Some(grandparent.to_string()),
            (Some(expr), None) => {
                return Err(TemplateError::inheritance(
                    format!("template `{name}` extends a computed name; only the leaf may"),
                    Some(expr.span),
                ));
            }
        };
        chain.push(parent);
    }

    Ok(Arc::new(ResolvedHierarchy::build(chain)))
}

/// A cached resolution stays valid while each participant is still the
/// compile cache's current entry for its name.
fn validate(
    env: &Environment,
    leaf: &Arc<CompiledTemplate>,
    participants: &[Arc<CompiledTemplate>],
) -> bool {
    participants.iter().all(|p| {
        if p.name == leaf.name {
            return Arc::ptr_eq(p, leaf);
        }
        match env.get_template(&p.name) {
            Ok(current) => Arc::ptr_eq(&current, p),
            Err(_) => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::loader::{Loader, StringLoader};

    fn env_with(templates: &[(&str, &str)]) -> Environment {
        let loader = StringLoader::new();
        for (name, source) in templates {
            loader.add_template(*name, *source);
        }
        let mut env = Environment::new();
        env.set_loader(loader);
        env
    }

    #[test]
    fn test_resolves_chain_root_first() {
        let env = env_with(&[
            ("base", "{% block t %}base{% endblock %}"),
            ("mid", "{% extends \"base\" %}{% block t %}mid{% endblock %}"),
            ("leaf", "{% extends \"mid\" %}{% block t %}leaf{% endblock %}"),
        ]);
        let leaf = env.get_template("leaf").unwrap();
        let resolved = resolve(&env, &leaf).unwrap();
        let names: Vec<&str> = resolved.chain.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["base", "mid", "leaf"]);
        // most-derived definition first
        assert_eq!(resolved.blocks["t"].len(), 3);
    }

    #[test]
    fn test_block_not_overridden_uses_base() {
        let env = env_with(&[
            ("base", "{% block a %}A{% endblock %}{% block b %}B{% endblock %}"),
            ("leaf", "{% extends \"base\" %}{% block a %}child{% endblock %}"),
        ]);
        let leaf = env.get_template("leaf").unwrap();
        let resolved = resolve(&env, &leaf).unwrap();
        assert_eq!(resolved.blocks["a"].len(), 2);
        assert_eq!(resolved.blocks["b"].len(), 1);
    }

    #[test]
    fn test_cycle_detected() {
        let env = env_with(&[
            ("a", "{% extends \"b\" %}"),
            ("b", "{% extends \"a\" %}"),
        ]);
        let leaf = env.get_template("a").unwrap();
        let err = resolve(&env, &leaf).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_missing_parent_propagates() {
        let env = env_with(&[("leaf", "{% extends \"ghost\" %}")]);
        let leaf = env.get_template("leaf").unwrap();
        assert!(matches!(
            resolve(&env, &leaf),
            Err(TemplateError::NotFound { .. })
        ));
    }

    #[test]
    fn test_cache_reuse_and_invalidation() {
        let loader = StringLoader::new();
        loader.add_template("base", "{% block t %}v1{% endblock %}");
        loader.add_template("leaf", "{% extends \"base\" %}");
        let loader = std::sync::Arc::new(loader);
        let mut env = Environment::new();
        env.set_loader(SharedLoader(std::sync::Arc::clone(&loader)));

        let leaf = env.get_template("leaf").unwrap();
        let first = resolve(&env, &leaf).unwrap();
        let again = resolve(&env, &leaf).unwrap();
        assert!(Arc::ptr_eq(&first, &again), "expected a cache hit");

        // changing the base bumps its version; the next resolve rebuilds
        loader.add_template("base", "{% block t %}v2{% endblock %}");
        let rebuilt = resolve(&env, &leaf).unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt), "expected re-resolution");
    }

    /// Loader wrapper sharing an inner StringLoader with the test
    struct SharedLoader(std::sync::Arc<StringLoader>);

    impl crate::loader::Loader for SharedLoader {
        fn get_source(
            &self,
            name: &str,
        ) -> Result<crate::loader::TemplateSource, TemplateError> {
            self.0.get_source(name)
        }

        fn version(&self, name: &str) -> Option<crate::loader::Version> {
            self.0.version(name)
        }
    }
}
