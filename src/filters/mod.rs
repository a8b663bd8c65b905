//! # Built-in Filters Module
//!
//! Filters applied with `|` syntax, organized by category:
//!
//! - **[strings]**: upper, lower, capitalize, title, trim, replace,
//!   truncate, indent, wordcount, urlencode, center
//! - **[numbers]**: abs, round, int, float, sum, min, max
//! - **[collections]**: length/count, first, last, join, reverse, sort,
//!   unique, batch, slice, items, keys, values, map, select, reject,
//!   default/d, tojson
//! - **[escape]**: safe, escape/e, forceescape, striptags
//!
//! Each category module exposes a `register` function that installs its
//! filters into the environment's registry.

use crate::autoescape::EscapeContext;
use crate::environment::Environment;
use crate::error::TemplateError;
use crate::value::{Kwargs, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub mod collections;
pub mod escape;
pub mod numbers;
pub mod strings;

/// Per-application state handed to every filter: the environment (for
/// filters that dispatch to tests or other filters) and the active
/// escape context (for `safe` and friends).
pub struct FilterState<'a> {
    pub env: &'a Environment,
    pub autoescape: EscapeContext,
}

/// The uniform filter signature: `(value, positional, named, state)`.
pub type FilterFn =
    dyn Fn(&Value, &[Value], &Kwargs, &FilterState<'_>) -> Result<Value, TemplateError>
        + Send
        + Sync;

/// Register all built-in filters
pub fn register_builtin_filters(registry: &mut HashMap<String, Arc<FilterFn>>) {
    strings::register(registry);
    numbers::register(registry);
    collections::register(registry);
    escape::register(registry);
}

// ============================================================================
// Shared argument helpers
// ============================================================================

/// Look up an argument positionally or by keyword
pub(crate) fn arg_opt<'a>(
    args: &'a [Value],
    kwargs: &'a Kwargs,
    index: usize,
    name: &str,
) -> Option<&'a Value> {
    args.get(index).or_else(|| kwargs.get(name))
}

pub(crate) fn arg_required<'a>(
    filter: &str,
    args: &'a [Value],
    kwargs: &'a Kwargs,
    index: usize,
    name: &str,
) -> Result<&'a Value, TemplateError> {
    arg_opt(args, kwargs, index, name).ok_or_else(|| {
        TemplateError::type_error(
            format!("filter `{filter}` missing required argument `{name}`"),
            None,
        )
    })
}

pub(crate) fn str_arg(filter: &str, value: &Value) -> Result<String, TemplateError> {
    value.as_str().map(str::to_string).ok_or_else(|| {
        TemplateError::type_error(
            format!("filter `{filter}` expects a string argument, got {}", value.type_name()),
            None,
        )
    })
}

pub(crate) fn int_arg(filter: &str, value: &Value) -> Result<i64, TemplateError> {
    value.as_int().ok_or_else(|| {
        TemplateError::type_error(
            format!(
                "filter `{filter}` expects an integer argument, got {}",
                value.type_name()
            ),
            None,
        )
    })
}

pub(crate) fn bool_arg(value: &Value) -> bool {
    value.is_truthy()
}

/// Coerce the filtered value to its output string form
pub(crate) fn coerce_string(value: &Value) -> String {
    value.to_string()
}

/// The filtered value as a list, for collection filters
pub(crate) fn list_input<'a>(
    filter: &str,
    value: &'a Value,
) -> Result<&'a [Value], TemplateError> {
    match value {
        Value::List(items) => Ok(items),
        _ => Err(TemplateError::type_error(
            format!("filter `{filter}` expects a list, got {}", value.type_name()),
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contains_expected_filters() {
        let mut registry = HashMap::new();
        register_builtin_filters(&mut registry);
        for name in [
            "upper", "lower", "capitalize", "title", "trim", "replace", "truncate", "indent",
            "wordcount", "urlencode", "center", "abs", "round", "int", "float", "sum", "min",
            "max", "length", "count", "first", "last", "join", "reverse", "sort", "unique",
            "batch", "slice", "items", "keys", "values", "map", "select", "reject", "default",
            "d", "tojson", "safe", "escape", "e", "forceescape", "striptags",
        ] {
            assert!(registry.contains_key(name), "missing filter `{name}`");
        }
    }

    #[test]
    fn test_arg_lookup_positional_then_named() {
        let args = vec![Value::Int(1)];
        let mut kwargs = Kwargs::new();
        kwargs.insert("width".to_string(), Value::Int(9));
        assert_eq!(arg_opt(&args, &kwargs, 0, "width"), Some(&Value::Int(1)));
        assert_eq!(arg_opt(&[], &kwargs, 0, "width"), Some(&Value::Int(9)));
        assert_eq!(arg_opt(&[], &Kwargs::new(), 0, "width"), None);
    }
}
