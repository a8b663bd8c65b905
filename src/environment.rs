// ABOUTME: The Environment: engine configuration, filter/test/global
// registries, the loader, and the compiled-template cache

use crate::config::EngineConfig;
use crate::error::TemplateError;
use crate::eval;
use crate::extensions::{Extension, ExtensionRegistry};
use crate::filters::{register_builtin_filters, FilterFn, FilterState};
use crate::inheritance::InheritanceCache;
use crate::loader::Loader;
use crate::template::CompiledTemplate;
use crate::testers::{register_builtin_tests, TestFn};
use crate::value::{Kwargs, Namespace, NativeCallable, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Central engine object: configuration, registries, loader, and the
/// compile cache. Registries take `&self` through interior locking so
/// setup can happen on a shared environment; mutation is expected to
/// finish before concurrent renders begin.
pub struct Environment {
    config: EngineConfig,
    filters: RwLock<HashMap<String, Arc<FilterFn>>>,
    tests: RwLock<HashMap<String, Arc<TestFn>>>,
    globals: RwLock<HashMap<String, Value>>,
    extensions: ExtensionRegistry,
    loader: Option<Box<dyn Loader>>,
    cache: RwLock<HashMap<String, Arc<CompiledTemplate>>>,
    inheritance: InheritanceCache,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("filters", &self.filter_names())
            .field("tests", &self.test_names())
            .field("has_loader", &self.loader.is_some())
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// An environment with the default configuration and all built-in
    /// filters, tests, and globals registered.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut filters = HashMap::new();
        register_builtin_filters(&mut filters);
        let mut tests = HashMap::new();
        register_builtin_tests(&mut tests);

        let env = Self {
            config,
            filters: RwLock::new(filters),
            tests: RwLock::new(tests),
            globals: RwLock::new(HashMap::new()),
            extensions: ExtensionRegistry::new(),
            loader: None,
            cache: RwLock::new(HashMap::new()),
            inheritance: InheritanceCache::new(),
        };
        register_builtin_globals(&env);
        env
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_loader(&mut self, loader: impl Loader + 'static) {
        self.loader = Some(Box::new(loader));
        self.cache.write().expect("compile cache poisoned").clear();
    }

    pub fn loader(&self) -> Option<&dyn Loader> {
        self.loader.as_deref()
    }

    // ========================================================================
    // Registries
    // ========================================================================

    pub fn add_filter<F>(&self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Value, &[Value], &Kwargs, &FilterState<'_>) -> Result<Value, TemplateError>
            + Send
            + Sync
            + 'static,
    {
        self.filters
            .write()
            .expect("filter registry poisoned")
            .insert(name.into(), Arc::new(filter));
    }

    pub fn add_test<F>(&self, name: impl Into<String>, test: F)
    where
        F: Fn(&Value, &[Value]) -> Result<bool, TemplateError> + Send + Sync + 'static,
    {
        self.tests
            .write()
            .expect("test registry poisoned")
            .insert(name.into(), Arc::new(test));
    }

    pub fn add_global(&self, name: impl Into<String>, value: Value) {
        self.globals
            .write()
            .expect("global registry poisoned")
            .insert(name.into(), value);
    }

    pub fn add_extension(&self, extension: Arc<dyn Extension>) -> Result<(), TemplateError> {
        self.extensions.register(extension)
    }

    pub fn remove_extension(&self, name: &str) -> Result<(), TemplateError> {
        self.extensions.unregister(name)
    }

    pub fn filter(&self, name: &str) -> Option<Arc<FilterFn>> {
        self.filters
            .read()
            .expect("filter registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn test(&self, name: &str) -> Option<Arc<TestFn>> {
        self.tests
            .read()
            .expect("test registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals
            .read()
            .expect("global registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn filter_names(&self) -> Vec<String> {
        self.filters
            .read()
            .expect("filter registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn test_names(&self) -> Vec<String> {
        self.tests
            .read()
            .expect("test registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    pub(crate) fn inheritance_cache(&self) -> &InheritanceCache {
        &self.inheritance
    }

    // ========================================================================
    // Compilation and the compile cache
    // ========================================================================

    /// Compile a literal template string (uncached).
    pub fn template_from_str(&self, source: &str) -> Result<Arc<CompiledTemplate>, TemplateError> {
        Ok(Arc::new(CompiledTemplate::compile(
            "<string>",
            source,
            &self.config,
            Some(&self.extensions),
            None,
        )?))
    }

    /// Load a template by name through the loader, reusing the cached
    /// compilation while the loader's version token is unchanged.
    pub fn get_template(&self, name: &str) -> Result<Arc<CompiledTemplate>, TemplateError> {
        let Some(loader) = self.loader.as_deref() else {
            return Err(TemplateError::not_found(name));
        };

        if let Some(cached) = self
            .cache
            .read()
            .expect("compile cache poisoned")
            .get(name)
        {
            match loader.version(name) {
                Some(version) if Some(&version) == cached.version.as_ref() => {
                    return Ok(Arc::clone(cached));
                }
                _ => log::debug!("template `{name}` is stale, recompiling"),
            }
        } else {
            log::debug!("compile cache miss for `{name}`");
        }

        let source = loader.get_source(name)?;
        let compiled = Arc::new(CompiledTemplate::compile(
            name,
            &source.source,
            &self.config,
            Some(&self.extensions),
            Some(source.version),
        )?);
        self.cache
            .write()
            .expect("compile cache poisoned")
            .insert(name.to_string(), Arc::clone(&compiled));
        self.inheritance.invalidate(name);
        Ok(compiled)
    }

    pub fn list_templates(&self) -> Vec<String> {
        self.loader
            .as_deref()
            .map(Loader::list_templates)
            .unwrap_or_default()
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    /// Render a compiled template against a context mapping.
    pub fn render(
        &self,
        template: &Arc<CompiledTemplate>,
        context: &Value,
    ) -> Result<String, TemplateError> {
        for extension in self.extensions.all() {
            extension
                .before_render()
                .map_err(|e| TemplateError::extension(extension.name(), "before_render", e))?;
        }

        let result = eval::render_template(self, template, context);

        for extension in self.extensions.all() {
            if let Err(e) = extension.after_render() {
                if result.is_ok() {
                    return Err(TemplateError::extension(
                        extension.name(),
                        "after_render",
                        e,
                    ));
                }
            }
        }
        result
    }

    /// Load by name and render.
    pub fn render_named(&self, name: &str, context: &Value) -> Result<String, TemplateError> {
        let template = self.get_template(name)?;
        self.render(&template, context)
    }

    /// Compile a literal string and render it.
    pub fn render_str(&self, source: &str, context: &Value) -> Result<String, TemplateError> {
        let template = self.template_from_str(source)?;
        self.render(&template, context)
    }
}

// ============================================================================
// Built-in globals
// ============================================================================

fn register_builtin_globals(env: &Environment) {
    env.add_global(
        "range",
        Value::Callable(Arc::new(NativeCallable::new("range", global_range))),
    );
    env.add_global(
        "namespace",
        Value::Callable(Arc::new(NativeCallable::new("namespace", global_namespace))),
    );
    env.add_global(
        "dict",
        Value::Callable(Arc::new(NativeCallable::new("dict", global_dict))),
    );
}

/// `range(stop)`, `range(start, stop)`, `range(start, stop, step)`
fn global_range(args: &[Value], kwargs: &Kwargs) -> Result<Value, TemplateError> {
    if !kwargs.is_empty() {
        return Err(TemplateError::type_error(
            "range takes positional arguments only",
            None,
        ));
    }
    let mut ints = Vec::with_capacity(args.len());
    for arg in args {
        ints.push(arg.as_int().ok_or_else(|| {
            TemplateError::type_error(
                format!("range expects integers, got {}", arg.type_name()),
                None,
            )
        })?);
    }
    let (start, stop, step) = match ints[..] {
        [stop] => (0, stop, 1),
        [start, stop] => (start, stop, 1),
        [start, stop, step] => (start, stop, step),
        _ => {
            return Err(TemplateError::type_error(
                format!("range takes 1 to 3 arguments, got {}", ints.len()),
                None,
            ))
        }
    };
    if step == 0 {
        return Err(TemplateError::math_error("range step cannot be zero", None));
    }

    let mut out = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        out.push(Value::Int(current));
        current += step;
    }
    Ok(Value::List(out))
}

/// `namespace(**kwargs)` builds a mutable attribute bag
fn global_namespace(args: &[Value], kwargs: &Kwargs) -> Result<Value, TemplateError> {
    if !args.is_empty() {
        return Err(TemplateError::type_error(
            "namespace takes keyword arguments only",
            None,
        ));
    }
    let ns = Namespace::new();
    for (name, value) in kwargs {
        ns.set(name.clone(), value.clone());
    }
    Ok(Value::Namespace(Arc::new(ns)))
}

/// `dict(**kwargs)` builds a mapping in argument order
fn global_dict(args: &[Value], kwargs: &Kwargs) -> Result<Value, TemplateError> {
    if !args.is_empty() {
        return Err(TemplateError::type_error(
            "dict takes keyword arguments only",
            None,
        ));
    }
    Ok(Value::Map(kwargs.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UndefinedPolicy;
    use crate::loader::StringLoader;

    #[test]
    fn test_render_str_basic() {
        let env = Environment::new();
        let ctx = crate::context! { name => "Alice" };
        assert_eq!(
            env.render_str("Hello {{ name }}!", &ctx).unwrap(),
            "Hello Alice!"
        );
    }

    #[test]
    fn test_render_rejects_non_mapping_context() {
        let env = Environment::new();
        let err = env.render_str("x", &Value::Int(3)).unwrap_err();
        assert!(err.to_string().contains("mapping"));
    }

    #[test]
    fn test_range_global() {
        let env = Environment::new();
        assert_eq!(
            env.render_str("{% for i in range(3) %}{{ i }}{% endfor %}", &Value::None)
                .unwrap(),
            "012"
        );
        assert_eq!(
            env.render_str("{{ range(1, 7, 2) | join(',') }}", &Value::None)
                .unwrap(),
            "1,3,5"
        );
        assert_eq!(
            env.render_str("{{ range(3, 0, -1) | join(',') }}", &Value::None)
                .unwrap(),
            "3,2,1"
        );
        assert!(env.render_str("{{ range(1, 2, 0) }}", &Value::None).is_err());
    }

    #[test]
    fn test_dict_global_keeps_order() {
        let env = Environment::new();
        assert_eq!(
            env.render_str("{{ dict(z=1, a=2) | tojson }}", &Value::None)
                .unwrap(),
            "{\"z\":1,\"a\":2}"
        );
    }

    #[test]
    fn test_custom_filter_registration() {
        let env = Environment::new();
        env.add_filter("shout", |value: &Value, _args: &[Value], _kw: &Kwargs, _state: &FilterState<'_>| {
            Ok(Value::String(format!("{}!!", value)))
        });
        assert_eq!(
            env.render_str("{{ 'hey' | shout }}", &Value::None).unwrap(),
            "hey!!"
        );
    }

    #[test]
    fn test_custom_test_registration() {
        let env = Environment::new();
        env.add_test("answer", |value: &Value, _args: &[Value]| {
            Ok(value.as_int() == Some(42))
        });
        assert_eq!(
            env.render_str("{{ 42 is answer }}", &Value::None).unwrap(),
            "true"
        );
    }

    #[test]
    fn test_custom_global() {
        let env = Environment::new();
        env.add_global("site", Value::from("example.org"));
        assert_eq!(env.render_str("{{ site }}", &Value::None).unwrap(), "example.org");
    }

    #[test]
    fn test_unknown_filter_suggests() {
        let env = Environment::new();
        let err = env.render_str("{{ 1 | uper }}", &Value::None).unwrap_err();
        let shown = err.to_string();
        assert!(shown.contains("unknown filter `uper`"));
        assert!(shown.contains("did you mean `upper`?"));
    }

    #[test]
    fn test_compile_cache_reuses_until_readd() {
        let loader = StringLoader::new();
        loader.add_template("page", "v1");
        let loader = Arc::new(loader);

        struct Shared(Arc<StringLoader>);
        impl Loader for Shared {
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

        let mut env = Environment::new();
        env.set_loader(Shared(Arc::clone(&loader)));

        let first = env.get_template("page").unwrap();
        let second = env.get_template("page").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        loader.add_template("page", "v2");
        let third = env.get_template("page").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(env.render(&third, &Value::None).unwrap(), "v2");
    }

    #[test]
    fn test_get_template_without_loader() {
        let env = Environment::new();
        assert!(matches!(
            env.get_template("anything"),
            Err(TemplateError::NotFound { .. })
        ));
    }

    #[test]
    fn test_strict_undefined_policy() {
        let env = Environment::with_config(EngineConfig {
            undefined: UndefinedPolicy::Strict,
            ..EngineConfig::default()
        });
        let err = env.render_str("{{ missing }}", &Value::None).unwrap_err();
        match err {
            TemplateError::Undefined { name, .. } => assert_eq!(name, "missing"),
            other => panic!("expected undefined error, got {other}"),
        }
    }

    #[test]
    fn test_debug_undefined_policy_emits_marker() {
        let env = Environment::with_config(EngineConfig {
            undefined: UndefinedPolicy::Debug,
            ..EngineConfig::default()
        });
        assert_eq!(
            env.render_str("x{{ missing }}y", &Value::None).unwrap(),
            "x[undefined: missing]y"
        );
    }
}
