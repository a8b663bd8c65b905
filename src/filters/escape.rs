//! Escaping filters: safety marking, forced escaping, and tag stripping

use crate::autoescape::escape_html;
use crate::error::TemplateError;
use crate::value::{Kwargs, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::{coerce_string, FilterFn, FilterState};

pub fn register(registry: &mut HashMap<String, Arc<FilterFn>>) {
    registry.insert("safe".to_string(), Arc::new(filter_safe));
    registry.insert("escape".to_string(), Arc::new(filter_escape));
    registry.insert("e".to_string(), Arc::new(filter_escape));
    registry.insert("forceescape".to_string(), Arc::new(filter_forceescape));
    registry.insert("striptags".to_string(), Arc::new(filter_striptags));
}

/// Mark the value as not needing escape. When autoescape is off this
/// is a no-op, so unescaped pipelines do not accumulate markers.
pub fn filter_safe(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    if !state.autoescape.is_active() {
        return Ok(value.clone());
    }
    Ok(Value::SafeString(coerce_string(value)))
}

/// HTML-escape now, regardless of the current mode. Already-safe
/// strings pass through so values escape exactly once.
pub fn filter_escape(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    if value.is_safe() {
        return Ok(value.clone());
    }
    Ok(Value::SafeString(escape_html(&coerce_string(value))))
}

/// Escape even values already marked safe.
pub fn filter_forceescape(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    Ok(Value::SafeString(escape_html(&coerce_string(value))))
}

/// Remove markup tags and collapse runs of whitespace.
pub fn filter_striptags(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let s = coerce_string(value);
    let mut stripped = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => stripped.push(c),
            _ => {}
        }
    }
    let collapsed: Vec<&str> = stripped.split_whitespace().collect();
    Ok(Value::String(collapsed.join(" ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoescape::EscapeContext;
    use crate::environment::Environment;

    fn apply_with_context(
        f: impl Fn(&Value, &[Value], &Kwargs, &FilterState<'_>) -> Result<Value, TemplateError>,
        value: Value,
        autoescape: EscapeContext,
    ) -> Value {
        let env = Environment::new();
        let state = FilterState {
            env: &env,
            autoescape,
        };
        f(&value, &[], &Kwargs::new(), &state).unwrap()
    }

    #[test]
    fn test_safe_marks_under_autoescape() {
        let out = apply_with_context(filter_safe, Value::from("<b>"), EscapeContext::Html);
        assert!(out.is_safe());
        assert_eq!(out.to_string(), "<b>");
    }

    #[test]
    fn test_safe_is_noop_without_autoescape() {
        let out = apply_with_context(filter_safe, Value::from("<b>"), EscapeContext::None);
        assert!(!out.is_safe());
    }

    #[test]
    fn test_escape_once() {
        let out = apply_with_context(filter_escape, Value::from("<b>"), EscapeContext::None);
        assert!(out.is_safe());
        assert_eq!(out.to_string(), "&lt;b&gt;");
        // a second application leaves the escaped form alone
        let again = apply_with_context(filter_escape, out, EscapeContext::None);
        assert_eq!(again.to_string(), "&lt;b&gt;");
    }

    #[test]
    fn test_forceescape_re_escapes() {
        let safe = Value::safe("&lt;b&gt;");
        let out = apply_with_context(filter_forceescape, safe, EscapeContext::Html);
        assert_eq!(out.to_string(), "&amp;lt;b&amp;gt;");
    }

    #[test]
    fn test_striptags() {
        let out = apply_with_context(
            filter_striptags,
            Value::from("<p>Hello   <b>world</b></p>"),
            EscapeContext::None,
        );
        assert_eq!(out, Value::from("Hello world"));
    }
}
