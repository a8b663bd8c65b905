// ABOUTME: End-to-end rendering tests covering expressions, control
// flow, scoping, and the engine's documented edge behaviors

use pretty_assertions::assert_eq;
use vellum::{context, Autoescape, EngineConfig, Environment, EscapeContext, TemplateError, Value};

fn render(source: &str, context: &Value) -> String {
    Environment::new()
        .render_str(source, context)
        .unwrap_or_else(|e| panic!("render of {source:?} failed: {e}"))
}

fn render_err(source: &str, context: &Value) -> TemplateError {
    Environment::new()
        .render_str(source, context)
        .expect_err("render should fail")
}

#[test]
fn test_plain_interpolation() {
    let ctx = context! { name => "Alice" };
    assert_eq!(render("Hello {{ name }}!", &ctx), "Hello Alice!");
}

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(render("{{ 2 + 3 * 4 }}", &Value::None), "14");
    assert_eq!(render("{{ (2 + 3) * 4 }}", &Value::None), "20");
}

#[test]
fn test_power_right_associative() {
    assert_eq!(render("{{ 2 ** 3 ** 2 }}", &Value::None), "512");
}

#[test]
fn test_division_semantics() {
    assert_eq!(render("{{ 8 / 2 }}", &Value::None), "4.0");
    assert_eq!(render("{{ 7 // 2 }}", &Value::None), "3");
    assert_eq!(render("{{ -7 // 2 }}", &Value::None), "-4");
    assert_eq!(render("{{ 7 % 3 }}", &Value::None), "1");
    assert_eq!(render("{{ -7 % 3 }}", &Value::None), "2");
}

#[test]
fn test_division_by_zero_is_math_error() {
    assert!(matches!(
        render_err("{{ 1 / 0 }}", &Value::None),
        TemplateError::Math { .. }
    ));
    assert!(matches!(
        render_err("{{ 1 % 0 }}", &Value::None),
        TemplateError::Math { .. }
    ));
}

#[test]
fn test_string_concat_and_add_rejection() {
    assert_eq!(render("{{ 'a' ~ 1 ~ 'b' }}", &Value::None), "a1b");
    assert!(matches!(
        render_err("{{ 'a' + 'b' }}", &Value::None),
        TemplateError::Type { .. }
    ));
}

#[test]
fn test_string_repetition() {
    assert_eq!(render("{{ 'ab' * 3 }}", &Value::None), "ababab");
}

#[test]
fn test_logical_operators_return_operands() {
    assert_eq!(render("{{ 0 or 'fallback' }}", &Value::None), "fallback");
    assert_eq!(render("{{ 'a' and 'b' }}", &Value::None), "b");
    assert_eq!(render("{{ not 0 }}", &Value::None), "true");
}

#[test]
fn test_membership() {
    assert_eq!(render("{{ 2 in [1, 2, 3] }}", &Value::None), "true");
    assert_eq!(render("{{ 'x' not in 'abc' }}", &Value::None), "true");
    let ctx = context! { d => Value::map_from([("k", Value::Int(1))]) };
    assert_eq!(render("{{ 'k' in d }}", &ctx), "true");
}

#[test]
fn test_conditional_expression() {
    assert_eq!(render("{{ 'y' if 1 else 'n' }}", &Value::None), "y");
    assert_eq!(render("{{ 'y' if 0 else 'n' }}", &Value::None), "n");
    // missing else arm yields empty output
    assert_eq!(render("{{ 'y' if 0 }}", &Value::None), "");
}

#[test]
fn test_if_elif_else() {
    let source = "{% if n > 10 %}big{% elif n > 5 %}mid{% else %}small{% endif %}";
    assert_eq!(render(source, &context! { n => 20 }), "big");
    assert_eq!(render(source, &context! { n => 7 }), "mid");
    assert_eq!(render(source, &context! { n => 1 }), "small");
}

#[test]
fn test_for_loop_over_range() {
    assert_eq!(
        render("{% for i in range(3) %}{{ i }}{% endfor %}", &Value::None),
        "012"
    );
}

#[test]
fn test_loop_descriptor_invariants() {
    let out = render(
        "{% for x in 'abc' %}{{ loop.index0 + 1 == loop.index }}{{ loop.revindex == loop.length - loop.index0 }}{% endfor %}",
        &Value::None,
    );
    assert_eq!(out, "truetrue".repeat(3));

    let out = render(
        "{% for x in [1, 2, 3] %}{% if loop.first %}F{% endif %}{% if loop.last %}L{% endif %}{{ x }}{% endfor %}",
        &Value::None,
    );
    assert_eq!(out, "F123L");
}

#[test]
fn test_loop_previtem_nextitem() {
    let out = render(
        "{% for x in [1, 2, 3] %}[{{ loop.previtem }}<{{ x }}>{{ loop.nextitem }}]{% endfor %}",
        &Value::None,
    );
    assert_eq!(out, "[<1>2][1<2>3][2<3>]");
}

#[test]
fn test_loop_cycle() {
    let out = render(
        "{% for i in range(4) %}{{ loop.cycle('odd', 'even') }} {% endfor %}",
        &Value::None,
    );
    assert_eq!(out, "odd even odd even ");
}

#[test]
fn test_loop_changed() {
    let ctx = context! { xs => vec![1i64, 1, 2, 2, 3] };
    let out = render(
        "{% for x in xs %}{% if loop.changed(x) %}{{ x }}{% endif %}{% endfor %}",
        &ctx,
    );
    assert_eq!(out, "123");
}

#[test]
fn test_break_and_continue() {
    assert_eq!(
        render(
            "{% for i in range(10) %}{% if i == 3 %}{% break %}{% endif %}{{ i }}{% endfor %}",
            &Value::None
        ),
        "012"
    );
    assert_eq!(
        render(
            "{% for i in range(5) %}{% if i % 2 == 0 %}{% continue %}{% endif %}{{ i }}{% endfor %}",
            &Value::None
        ),
        "13"
    );
}

#[test]
fn test_for_else_on_empty() {
    assert_eq!(
        render("{% for x in [] %}{{ x }}{% else %}none{% endfor %}", &Value::None),
        "none"
    );
}

#[test]
fn test_for_header_filter() {
    assert_eq!(
        render(
            "{% for i in range(6) if i % 2 == 0 %}{{ i }}{% endfor %}",
            &Value::None
        ),
        "024"
    );
    // the filter shrinks loop.length
    assert_eq!(
        render(
            "{% for i in range(6) if i % 2 == 0 %}{{ loop.length }}{% endfor %}",
            &Value::None
        ),
        "333"
    );
}

#[test]
fn test_for_unpacking_over_mapping() {
    let ctx = context! { d => Value::map_from([("a", Value::Int(1)), ("b", Value::Int(2))]) };
    assert_eq!(
        render("{% for k, v in d %}{{ k }}={{ v }};{% endfor %}", &ctx),
        "a=1;b=2;"
    );
    // a single target receives keys
    assert_eq!(render("{% for k in d %}{{ k }}{% endfor %}", &ctx), "ab");
}

#[test]
fn test_unpacking_mismatch_is_type_error() {
    let ctx = context! { pairs => Value::List(vec![Value::from(vec![1i64, 2, 3])]) };
    assert!(matches!(
        render_err("{% for a, b in pairs %}{% endfor %}", &ctx),
        TemplateError::Type { .. }
    ));
}

#[test]
fn test_recursive_loop() {
    let tree = Value::List(vec![
        Value::map_from([
            ("name", Value::from("a")),
            (
                "children",
                Value::List(vec![Value::map_from([
                    ("name", Value::from("b")),
                    ("children", Value::List(vec![])),
                ])]),
            ),
        ]),
    ]);
    let ctx = context! { tree => tree };
    let out = render(
        "{% for node in tree recursive %}{{ node.name }}:{{ loop.depth }} {{ loop(node.children) }}{% endfor %}",
        &ctx,
    );
    assert_eq!(out, "a:1 b:2 ");
}

#[test]
fn test_set_statement() {
    assert_eq!(render("{% set x = 40 + 2 %}{{ x }}", &Value::None), "42");
    assert_eq!(
        render("{% set a, b = [1, 2] %}{{ a }}{{ b }}", &Value::None),
        "12"
    );
}

#[test]
fn test_set_block() {
    assert_eq!(
        render("{% set x %}A{{ 1 }}B{% endset %}{{ x }}", &Value::None),
        "A1B"
    );
}

#[test]
fn test_namespace_accumulation() {
    let out = render(
        "{% set ns = namespace(c=0) %}{% for i in range(3) %}{% set ns.c = ns.c + 1 %}{% endfor %}{{ ns.c }}",
        &Value::None,
    );
    assert_eq!(out, "3");
}

#[test]
fn test_with_statement_scoping() {
    assert_eq!(
        render("{% with a=1 %}{{ a }}{% endwith %}{{ a }}", &Value::None),
        "1"
    );
}

#[test]
fn test_do_statement_emits_nothing() {
    assert_eq!(render("a{% do range(3) %}b", &Value::None), "ab");
}

#[test]
fn test_raw_block() {
    assert_eq!(
        render("{% raw %}{{ untouched }}{% endraw %}", &Value::None),
        "{{ untouched }}"
    );
}

#[test]
fn test_comment_only_template() {
    assert_eq!(render("{# nothing to see #}", &Value::None), "");
}

#[test]
fn test_empty_template() {
    assert_eq!(render("", &Value::None), "");
}

#[test]
fn test_pure_text_roundtrip() {
    // no statements, no expressions: output equals the source after
    // whitespace normalization (the default drops one final newline)
    let source = "line one\nline two\n";
    assert_eq!(render(source, &Value::None), "line one\nline two");
}

#[test]
fn test_same_context_same_output() {
    let env = Environment::new();
    let template = env
        .template_from_str("{{ a }}-{% for x in xs %}{{ x }}{% endfor %}")
        .unwrap();
    let ctx = context! { a => 1, xs => vec![2i64, 3] };
    let first = env.render(&template, &ctx).unwrap();
    let second = env.render(&template, &ctx).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_filter_chain_composes() {
    let ctx = context! { v => "  word  " };
    assert_eq!(render("{{ v | trim | upper }}", &ctx), "WORD");
}

#[test]
fn test_tests_in_templates() {
    assert_eq!(render("{{ 4 is even }}", &Value::None), "true");
    assert_eq!(render("{{ 4 is not odd }}", &Value::None), "true");
    assert_eq!(render("{{ 9 is divisibleby(3) }}", &Value::None), "true");
    assert_eq!(render("{{ x is defined }}", &Value::None), "false");
    assert_eq!(render("{{ none is none }}", &Value::None), "true");
}

#[test]
fn test_negative_and_out_of_range_indices() {
    let ctx = context! { xs => vec![1i64, 2, 3], s => "abc" };
    assert_eq!(render("{{ xs[-1] }}", &ctx), "3");
    assert_eq!(render("{{ s[-2] }}", &ctx), "b");
    // out-of-range access is silently undefined under the default policy
    assert_eq!(render("{{ xs[10] }}", &ctx), "");
}

#[test]
fn test_slices() {
    let ctx = context! { s => "abcdef", xs => vec![1i64, 2, 3, 4] };
    assert_eq!(render("{{ s[1:4] }}", &ctx), "bcd");
    assert_eq!(render("{{ s[:2] }}", &ctx), "ab");
    assert_eq!(render("{{ s[::2] }}", &ctx), "ace");
    assert_eq!(render("{{ xs[::-1] | join('') }}", &ctx), "4321");
}

#[test]
fn test_comprehensions() {
    assert_eq!(
        render("{{ [i * 2 for i in range(4) if i != 2] | join(',') }}", &Value::None),
        "0,2,6"
    );
    assert_eq!(
        render("{{ {c: 1 for c in 'ab'} | tojson }}", &Value::None),
        "{\"a\":1,\"b\":1}"
    );
}

#[test]
fn test_dict_and_list_literals() {
    assert_eq!(
        render("{{ {'a': 1, 'b': [2, 3]} | tojson }}", &Value::None),
        "{\"a\":1,\"b\":[2,3]}"
    );
}

#[test]
fn test_none_renders_empty() {
    assert_eq!(render("x{{ none }}y", &Value::None), "xy");
}

#[test]
fn test_float_formatting() {
    assert_eq!(render("{{ 2.0 }}", &Value::None), "2.0");
    assert_eq!(render("{{ 2.5 }}", &Value::None), "2.5");
}

#[test]
fn test_container_output_form() {
    let ctx = context! { xs => Value::List(vec![Value::Int(1), Value::from("a")]) };
    assert_eq!(render("{{ xs }}", &ctx), "[1, 'a']");
}

#[test]
fn test_autoescape_html() {
    let env = Environment::with_config(EngineConfig {
        autoescape: Autoescape::Fixed(EscapeContext::Html),
        ..EngineConfig::default()
    });
    let ctx = context! { v => "<script>" };
    assert_eq!(env.render_str("{{ v }}", &ctx).unwrap(), "&lt;script&gt;");
    // safe values bypass escaping exactly once
    assert_eq!(
        env.render_str("{{ v | safe }}", &ctx).unwrap(),
        "<script>"
    );
    assert_eq!(
        env.render_str("{{ v | escape }}", &ctx).unwrap(),
        "&lt;script&gt;"
    );
}

#[test]
fn test_autoescape_output_has_no_raw_specials() {
    let env = Environment::with_config(EngineConfig {
        autoescape: Autoescape::Fixed(EscapeContext::Html),
        ..EngineConfig::default()
    });
    let hostile = context! { v => "<a href=\"x\">&'</a>" };
    let out = env.render_str("{{ v }}", &hostile).unwrap();
    for c in ['<', '>', '"', '\''] {
        assert!(!out.contains(c), "unescaped {c} in {out:?}");
    }
    assert!(!out.replace("&lt;", "").replace("&gt;", "")
        .replace("&quot;", "").replace("&#39;", "").replace("&amp;", "")
        .contains('&'));
}

#[test]
fn test_autoescape_statement_overrides() {
    let env = Environment::new();
    let ctx = context! { v => "<b>" };
    assert_eq!(
        env.render_str("{% autoescape true %}{{ v }}{% endautoescape %}{{ v }}", &ctx)
            .unwrap(),
        "&lt;b&gt;<b>"
    );
}

#[test]
fn test_filter_block() {
    assert_eq!(
        render("{% filter upper %}hello {{ 'world' }}{% endfilter %}", &Value::None),
        "HELLO WORLD"
    );
    assert_eq!(
        render("{% filter upper | trim %}  pad  {% endfilter %}", &Value::None),
        "PAD"
    );
}

#[test]
fn test_unknown_test_is_name_error() {
    assert!(matches!(
        render_err("{{ 1 is nonsense }}", &Value::None),
        TemplateError::Name { .. }
    ));
}

#[test]
fn test_calling_undefined_is_name_error() {
    assert!(matches!(
        render_err("{{ missing_fn() }}", &Value::None),
        TemplateError::Name { .. }
    ));
}

#[test]
fn test_super_outside_block_is_inheritance_error() {
    assert!(matches!(
        render_err("{{ super() }}", &Value::None),
        TemplateError::Inheritance { .. }
    ));
}

#[test]
fn test_error_carries_location() {
    let err = render_err("line one\n{{ 1 / 0 }}", &Value::None);
    let span = err.span().expect("math error should carry a location");
    assert_eq!(span.line, 2);
}

#[test]
fn test_iterating_non_iterable_is_type_error() {
    assert!(matches!(
        render_err("{% for x in 42 %}{% endfor %}", &Value::None),
        TemplateError::Type { .. }
    ));
}
