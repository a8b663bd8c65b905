// ABOUTME: Inheritance, include, and import behavior across templates
// served by a loader

use pretty_assertions::assert_eq;
use vellum::{context, Environment, Loader, StringLoader, TemplateError, Value};

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
fn test_block_override_with_super() {
    let env = env_with(&[
        ("base", "{% block t %}Base{% endblock %}"),
        (
            "child",
            "{% extends \"base\" %}{% block t %}Child({{ super() }}){% endblock %}",
        ),
    ]);
    assert_eq!(env.render_named("child", &Value::None).unwrap(), "Child(Base)");
}

#[test]
fn test_unoverridden_block_uses_base_body() {
    let env = env_with(&[
        ("base", "[{% block a %}A{% endblock %}|{% block b %}B{% endblock %}]"),
        ("child", "{% extends \"base\" %}{% block a %}X{% endblock %}"),
    ]);
    assert_eq!(env.render_named("child", &Value::None).unwrap(), "[X|B]");
}

#[test]
fn test_three_level_super_chain() {
    let env = env_with(&[
        ("base", "{% block t %}base{% endblock %}"),
        (
            "mid",
            "{% extends \"base\" %}{% block t %}mid({{ super() }}){% endblock %}",
        ),
        (
            "leaf",
            "{% extends \"mid\" %}{% block t %}leaf({{ super() }}){% endblock %}",
        ),
    ]);
    assert_eq!(
        env.render_named("leaf", &Value::None).unwrap(),
        "leaf(mid(base))"
    );
}

#[test]
fn test_super_reuse_within_one_render() {
    let env = env_with(&[
        ("base", "{% block t %}B{% endblock %}"),
        (
            "child",
            "{% extends \"base\" %}{% block t %}{{ super() }}+{{ super() }}{% endblock %}",
        ),
    ]);
    assert_eq!(env.render_named("child", &Value::None).unwrap(), "B+B");
}

#[test]
fn test_override_with_original_body_matches_parent() {
    // overriding every block with the parent's own body is a no-op
    let env = env_with(&[
        ("base", "A{% block t %}body {{ n }}{% endblock %}B"),
        (
            "child",
            "{% extends \"base\" %}{% block t %}body {{ n }}{% endblock %}",
        ),
    ]);
    let ctx = context! { n => 7 };
    assert_eq!(
        env.render_named("child", &ctx).unwrap(),
        env.render_named("base", &ctx).unwrap()
    );
}

#[test]
fn test_child_top_level_text_is_dropped() {
    let env = env_with(&[
        ("base", "A{% block t %}T{% endblock %}Z"),
        ("child", "{% extends \"base\" %}ignored{% block t %}X{% endblock %}ignored"),
    ]);
    assert_eq!(env.render_named("child", &Value::None).unwrap(), "AXZ");
}

#[test]
fn test_inherited_render_sees_context() {
    let env = env_with(&[
        ("base", "{% block t %}{% endblock %}"),
        (
            "child",
            "{% extends \"base\" %}{% block t %}hello {{ name }}{% endblock %}",
        ),
    ]);
    let ctx = context! { name => "Ada" };
    assert_eq!(env.render_named("child", &ctx).unwrap(), "hello Ada");
}

#[test]
fn test_dynamic_extends_target() {
    let env = env_with(&[
        ("base", "{% block t %}base{% endblock %}"),
        ("child", "{% extends layout %}{% block t %}child{% endblock %}"),
    ]);
    let ctx = context! { layout => "base" };
    assert_eq!(env.render_named("child", &ctx).unwrap(), "child");
}

#[test]
fn test_extends_cycle_detected() {
    let env = env_with(&[
        ("a", "{% extends \"b\" %}"),
        ("b", "{% extends \"a\" %}"),
    ]);
    assert!(matches!(
        env.render_named("a", &Value::None),
        Err(TemplateError::Inheritance { .. })
    ));
}

#[test]
fn test_super_without_parent_definition() {
    let env = env_with(&[
        ("base", "{% block t %}{% endblock %}{% block only_child %}{% endblock %}"),
        (
            "child",
            "{% extends \"base\" %}{% block only_child %}{{ super() }}{% endblock %}",
        ),
    ]);
    assert!(matches!(
        env.render_named("child", &Value::None),
        Err(TemplateError::Inheritance { .. })
    ));
}

#[test]
fn test_include_inherits_context() {
    let env = env_with(&[
        ("partial", "[{{ name }}]"),
        ("page", "before {% include \"partial\" %} after"),
    ]);
    let ctx = context! { name => "x" };
    assert_eq!(env.render_named("page", &ctx).unwrap(), "before [x] after");
}

#[test]
fn test_include_with_explicit_context() {
    let env = env_with(&[
        ("partial", "[{{ name }}]"),
        ("page", "{% include \"partial\" with {'name': 'local'} %}"),
    ]);
    let ctx = context! { name => "outer" };
    assert_eq!(env.render_named("page", &ctx).unwrap(), "[local]");
}

#[test]
fn test_include_ignore_missing() {
    let env = env_with(&[("page", "a{% include \"ghost\" ignore missing %}b")]);
    assert_eq!(env.render_named("page", &Value::None).unwrap(), "ab");

    let env = env_with(&[("page", "a{% include \"ghost\" %}b")]);
    assert!(matches!(
        env.render_named("page", &Value::None),
        Err(TemplateError::NotFound { .. })
    ));
}

#[test]
fn test_include_does_not_leak_bindings() {
    let env = env_with(&[
        ("partial", "{% set leaked = 1 %}"),
        ("page", "{% include \"partial\" %}{{ leaked }}ok"),
    ]);
    assert_eq!(env.render_named("page", &Value::None).unwrap(), "ok");
}

#[test]
fn test_included_template_with_own_inheritance() {
    let env = env_with(&[
        ("base", "<{% block t %}b{% endblock %}>"),
        ("partial", "{% extends \"base\" %}{% block t %}p{% endblock %}"),
        ("page", "A{% include \"partial\" %}Z"),
    ]);
    assert_eq!(env.render_named("page", &Value::None).unwrap(), "A<p>Z");
}

#[test]
fn test_import_module_macros() {
    let env = env_with(&[
        ("macros", "{% macro hi(name) %}hi {{ name }}{% endmacro %}"),
        ("page", "{% import \"macros\" as m %}{{ m.hi('you') }}"),
    ]);
    assert_eq!(env.render_named("page", &Value::None).unwrap(), "hi you");
}

#[test]
fn test_from_import_with_alias() {
    let env = env_with(&[
        (
            "macros",
            "{% macro a() %}A{% endmacro %}{% macro b() %}B{% endmacro %}",
        ),
        ("page", "{% from \"macros\" import a, b as other %}{{ a() }}{{ other() }}"),
    ]);
    assert_eq!(env.render_named("page", &Value::None).unwrap(), "AB");
}

#[test]
fn test_from_import_missing_name() {
    let env = env_with(&[
        ("macros", "{% macro a() %}A{% endmacro %}"),
        ("page", "{% from \"macros\" import ghost %}"),
    ]);
    assert!(matches!(
        env.render_named("page", &Value::None),
        Err(TemplateError::Name { .. })
    ));
}

#[test]
fn test_import_runs_against_empty_scope() {
    // the module must not see the importing template's variables
    let env = env_with(&[
        ("module", "{% set seen = outer is defined %}"),
        ("page", "{% set outer = 1 %}{% import \"module\" as m %}{{ m.seen }}"),
    ]);
    assert_eq!(env.render_named("page", &Value::None).unwrap(), "false");
}

#[test]
fn test_recompile_after_source_change() {
    let loader = StringLoader::new();
    loader.add_template("base", "{% block t %}v1{% endblock %}");
    loader.add_template("child", "{% extends \"base\" %}");
    let loader = std::sync::Arc::new(loader);

    struct Shared(std::sync::Arc<StringLoader>);
    impl Loader for Shared {
        fn get_source(&self, name: &str) -> Result<vellum::TemplateSource, TemplateError> {
            self.0.get_source(name)
        }
        fn version(&self, name: &str) -> Option<vellum::Version> {
            self.0.version(name)
        }
    }

    let mut env = Environment::new();
    env.set_loader(Shared(std::sync::Arc::clone(&loader)));

    assert_eq!(env.render_named("child", &Value::None).unwrap(), "v1");
    loader.add_template("base", "{% block t %}v2{% endblock %}");
    assert_eq!(env.render_named("child", &Value::None).unwrap(), "v2");
}
