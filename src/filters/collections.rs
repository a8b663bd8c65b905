//! Collection filters: sizing, selection, ordering, grouping, and
//! JSON serialization

use crate::error::TemplateError;
use crate::value::{Kwargs, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use super::{arg_opt, bool_arg, coerce_string, int_arg, list_input, str_arg, FilterFn,
    FilterState};

pub fn register(registry: &mut HashMap<String, Arc<FilterFn>>) {
    registry.insert("length".to_string(), Arc::new(filter_length));
    registry.insert("count".to_string(), Arc::new(filter_length));
    registry.insert("first".to_string(), Arc::new(filter_first));
    registry.insert("last".to_string(), Arc::new(filter_last));
    registry.insert("join".to_string(), Arc::new(filter_join));
    registry.insert("reverse".to_string(), Arc::new(filter_reverse));
    registry.insert("sort".to_string(), Arc::new(filter_sort));
    registry.insert("unique".to_string(), Arc::new(filter_unique));
    registry.insert("batch".to_string(), Arc::new(filter_batch));
    registry.insert("slice".to_string(), Arc::new(filter_slice));
    registry.insert("items".to_string(), Arc::new(filter_items));
    registry.insert("keys".to_string(), Arc::new(filter_keys));
    registry.insert("values".to_string(), Arc::new(filter_values));
    registry.insert("map".to_string(), Arc::new(filter_map));
    registry.insert("select".to_string(), Arc::new(filter_select));
    registry.insert("reject".to_string(), Arc::new(filter_reject));
    registry.insert("default".to_string(), Arc::new(filter_default));
    registry.insert("d".to_string(), Arc::new(filter_default));
    registry.insert("tojson".to_string(), Arc::new(filter_tojson));
}

/// Number of items in a list or mapping, or characters in a string.
pub fn filter_length(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    value.len().map(|n| Value::Int(n as i64)).ok_or_else(|| {
        TemplateError::type_error(
            format!("filter `length` got an unsized {}", value.type_name()),
            None,
        )
    })
}

pub fn filter_first(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    match value {
        Value::List(items) => Ok(items.first().cloned().unwrap_or(Value::undefined("first"))),
        Value::String(s) | Value::SafeString(s) => Ok(s
            .chars()
            .next()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::undefined("first"))),
        other => Err(TemplateError::type_error(
            format!("filter `first` expects a sequence, got {}", other.type_name()),
            None,
        )),
    }
}

pub fn filter_last(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    match value {
        Value::List(items) => Ok(items.last().cloned().unwrap_or(Value::undefined("last"))),
        Value::String(s) | Value::SafeString(s) => Ok(s
            .chars()
            .next_back()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::undefined("last"))),
        other => Err(TemplateError::type_error(
            format!("filter `last` expects a sequence, got {}", other.type_name()),
            None,
        )),
    }
}

/// Join list items into one string with an optional separator.
///
/// # Examples
///
/// ```text
/// {{ [1, 2, 3] | join(", ") }} => 1, 2, 3
/// ```
pub fn filter_join(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let items = list_input("join", value)?;
    let sep = match arg_opt(args, kwargs, 0, "d") {
        Some(v) => str_arg("join", v)?,
        None => String::new(),
    };
    let parts: Vec<String> = items.iter().map(coerce_string).collect();
    Ok(Value::String(parts.join(&sep)))
}

/// Reverse a list or string.
pub fn filter_reverse(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    match value {
        Value::List(items) => {
            let mut out = items.clone();
            out.reverse();
            Ok(Value::List(out))
        }
        Value::String(s) | Value::SafeString(s) => {
            Ok(Value::String(s.chars().rev().collect()))
        }
        other => Err(TemplateError::type_error(
            format!("filter `reverse` expects a sequence, got {}", other.type_name()),
            None,
        )),
    }
}

/// Walk a dotted attribute path into nested mappings
fn attr_path(value: &Value, path: &str) -> Value {
    let mut current = value.clone();
    for segment in path.split('.') {
        current = match current.get_attr(segment) {
            Some(next) => next,
            None => return Value::undefined(path),
        };
    }
    current
}

/// Sort a list. `reverse=true` inverts the order; `attribute="a.b"`
/// sorts mappings by a dotted key path.
pub fn filter_sort(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let items = list_input("sort", value)?;
    let descending = arg_opt(args, kwargs, 0, "reverse").is_some_and(bool_arg);
    let attribute = match kwargs.get("attribute") {
        Some(v) => Some(str_arg("sort", v)?),
        None => None,
    };

    let key = |item: &Value| match &attribute {
        Some(path) => attr_path(item, path),
        None => item.clone(),
    };

    let mut out = items.to_vec();
    let mut failed: Option<(String, String)> = None;
    out.sort_by(|a, b| {
        let (ka, kb) = (key(a), key(b));
        match ka.try_cmp(&kb) {
            Some(ord) => {
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
            None => {
                failed.get_or_insert((
                    ka.type_name().to_string(),
                    kb.type_name().to_string(),
                ));
                Ordering::Equal
            }
        }
    });
    if let Some((a, b)) = failed {
        return Err(TemplateError::type_error(
            format!("filter `sort` cannot compare {a} with {b}"),
            None,
        ));
    }
    Ok(Value::List(out))
}

/// Drop duplicate items, keeping first occurrences in order.
pub fn filter_unique(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let items = list_input("unique", value)?;
    let mut out: Vec<Value> = Vec::new();
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    Ok(Value::List(out))
}

/// Group items into chunks of `linecount`, padding the final chunk
/// with `fill_with` when given.
pub fn filter_batch(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let items = list_input("batch", value)?;
    let size = match arg_opt(args, kwargs, 0, "linecount") {
        Some(v) => int_arg("batch", v)?,
        None => {
            return Err(TemplateError::type_error(
                "filter `batch` missing required argument `linecount`",
                None,
            ))
        }
    };
    if size <= 0 {
        return Err(TemplateError::type_error(
            "filter `batch` needs a positive chunk size",
            None,
        ));
    }
    let fill = arg_opt(args, kwargs, 1, "fill_with").cloned();

    let mut out = Vec::new();
    for chunk in items.chunks(size as usize) {
        let mut group = chunk.to_vec();
        if let Some(fill) = &fill {
            while group.len() < size as usize {
                group.push(fill.clone());
            }
        }
        out.push(Value::List(group));
    }
    Ok(Value::List(out))
}

/// Split a list into `slices` columns; earlier columns take the
/// remainder. `fill_with` pads the shorter columns.
pub fn filter_slice(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let items = list_input("slice", value)?;
    let slices = match arg_opt(args, kwargs, 0, "slices") {
        Some(v) => int_arg("slice", v)?,
        None => {
            return Err(TemplateError::type_error(
                "filter `slice` missing required argument `slices`",
                None,
            ))
        }
    };
    if slices <= 0 {
        return Err(TemplateError::type_error(
            "filter `slice` needs a positive slice count",
            None,
        ));
    }
    let fill = arg_opt(args, kwargs, 1, "fill_with").cloned();

    let slices = slices as usize;
    let per_slice = items.len() / slices;
    let with_extra = items.len() % slices;

    let mut out = Vec::with_capacity(slices);
    let mut offset = 0;
    for i in 0..slices {
        let take = per_slice + usize::from(i < with_extra);
        let mut group: Vec<Value> = items[offset..offset + take].to_vec();
        offset += take;
        if let Some(fill) = &fill {
            if i >= with_extra && with_extra > 0 {
                group.push(fill.clone());
            }
        }
        out.push(Value::List(group));
    }
    Ok(Value::List(out))
}

/// Mapping entries as `[key, value]` pairs, in insertion order.
pub fn filter_items(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    match value {
        Value::Map(map) => Ok(Value::List(
            map.iter()
                .map(|(k, v)| Value::List(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        )),
        other => Err(TemplateError::type_error(
            format!("filter `items` expects a mapping, got {}", other.type_name()),
            None,
        )),
    }
}

pub fn filter_keys(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    match value {
        Value::Map(map) => Ok(Value::List(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        other => Err(TemplateError::type_error(
            format!("filter `keys` expects a mapping, got {}", other.type_name()),
            None,
        )),
    }
}

pub fn filter_values(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    match value {
        Value::Map(map) => Ok(Value::List(map.values().cloned().collect())),
        other => Err(TemplateError::type_error(
            format!("filter `values` expects a mapping, got {}", other.type_name()),
            None,
        )),
    }
}

/// Project each item: `map(attribute="name")` pulls an attribute,
/// `map("upper")` applies a registered filter.
pub fn filter_map(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let items = list_input("map", value)?;

    if let Some(path) = kwargs.get("attribute") {
        let path = str_arg("map", path)?;
        return Ok(Value::List(
            items.iter().map(|item| attr_path(item, &path)).collect(),
        ));
    }

    let filter_name = match args.first() {
        Some(v) => str_arg("map", v)?,
        None => {
            return Err(TemplateError::type_error(
                "filter `map` needs an `attribute` keyword or a filter name",
                None,
            ))
        }
    };
    let inner = state.env.filter(&filter_name).ok_or_else(|| {
        TemplateError::name_error(format!("unknown filter `{filter_name}` in `map`"), None)
    })?;

    let extra = &args[1..];
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(inner(item, extra, &Kwargs::new(), state)?);
    }
    Ok(Value::List(out))
}

fn filter_by_test(
    name: &str,
    keep_matching: bool,
    value: &Value,
    args: &[Value],
    state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let items = list_input(name, value)?;

    // without a test, select keeps truthy items and reject drops them
    let Some(test_name) = args.first() else {
        let out = items
            .iter()
            .filter(|item| item.is_truthy() == keep_matching)
            .cloned()
            .collect();
        return Ok(Value::List(out));
    };

    let test_name = str_arg(name, test_name)?;
    let test = state.env.test(&test_name).ok_or_else(|| {
        TemplateError::name_error(format!("unknown test `{test_name}` in `{name}`"), None)
    })?;
    let extra = &args[1..];

    let mut out = Vec::new();
    for item in items {
        if test(item, extra)? == keep_matching {
            out.push(item.clone());
        }
    }
    Ok(Value::List(out))
}

/// Keep items passing a test (or truthy items without one).
pub fn filter_select(
    value: &Value,
    args: &[Value],
    _kwargs: &Kwargs,
    state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    filter_by_test("select", true, value, args, state)
}

/// Drop items passing a test (or truthy items without one).
pub fn filter_reject(
    value: &Value,
    args: &[Value],
    _kwargs: &Kwargs,
    state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    filter_by_test("reject", false, value, args, state)
}

/// Fall back to a default when the value is undefined, or also when
/// it is falsy with `boolean=true`.
pub fn filter_default(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let fallback = arg_opt(args, kwargs, 0, "default_value")
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()));
    let boolean = arg_opt(args, kwargs, 1, "boolean").is_some_and(bool_arg);

    let use_default = if boolean {
        !value.is_truthy()
    } else {
        value.is_undefined()
    };
    Ok(if use_default { fallback } else { value.clone() })
}

/// Serialize to JSON, HTML-safely: `<`, `>`, `&`, and `'` become
/// unicode escapes so the result can be embedded in markup.
pub fn filter_tojson(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let json = value.to_json()?;
    let rendered = if arg_opt(args, kwargs, 0, "indent").is_some() {
        serde_json::to_string_pretty(&json)
    } else {
        serde_json::to_string(&json)
    }
    .map_err(|e| TemplateError::type_error(format!("tojson: {e}"), None))?;

    let mut out = String::with_capacity(rendered.len());
    for c in rendered.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\'' => out.push_str("\\u0027"),
            _ => out.push(c),
        }
    }
    Ok(Value::SafeString(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoescape::EscapeContext;
    use crate::environment::Environment;

    fn run(
        f: impl Fn(&Value, &[Value], &Kwargs, &FilterState<'_>) -> Result<Value, TemplateError>,
        value: Value,
        args: &[Value],
        kwargs: Kwargs,
    ) -> Result<Value, TemplateError> {
        let env = Environment::new();
        let state = FilterState {
            env: &env,
            autoescape: EscapeContext::None,
        };
        f(&value, args, &kwargs, &state)
    }

    fn apply(
        f: impl Fn(&Value, &[Value], &Kwargs, &FilterState<'_>) -> Result<Value, TemplateError>,
        value: Value,
        args: &[Value],
    ) -> Value {
        run(f, value, args, Kwargs::new()).unwrap()
    }

    #[test]
    fn test_length() {
        assert_eq!(apply(filter_length, Value::from(vec![1i64, 2]), &[]), Value::Int(2));
        assert_eq!(apply(filter_length, Value::from("abc"), &[]), Value::Int(3));
        assert!(run(filter_length, Value::Int(3), &[], Kwargs::new()).is_err());
    }

    #[test]
    fn test_first_last() {
        let list = Value::from(vec![1i64, 2, 3]);
        assert_eq!(apply(filter_first, list.clone(), &[]), Value::Int(1));
        assert_eq!(apply(filter_last, list, &[]), Value::Int(3));
        assert!(apply(filter_first, Value::List(vec![]), &[]).is_undefined());
    }

    #[test]
    fn test_join() {
        let list = Value::from(vec![1i64, 2, 3]);
        assert_eq!(
            apply(filter_join, list.clone(), &[Value::from(", ")]),
            Value::from("1, 2, 3")
        );
        assert_eq!(apply(filter_join, list, &[]), Value::from("123"));
    }

    #[test]
    fn test_sort() {
        let list = Value::from(vec![3i64, 1, 2]);
        assert_eq!(
            apply(filter_sort, list.clone(), &[]),
            Value::from(vec![1i64, 2, 3])
        );
        assert_eq!(
            apply(filter_sort, list, &[Value::Bool(true)]),
            Value::from(vec![3i64, 2, 1])
        );
    }

    #[test]
    fn test_sort_by_attribute() {
        let users = Value::List(vec![
            Value::map_from([("name", Value::from("b"))]),
            Value::map_from([("name", Value::from("a"))]),
        ]);
        let mut kwargs = Kwargs::new();
        kwargs.insert("attribute".to_string(), Value::from("name"));
        let sorted = run(filter_sort, users, &[], kwargs).unwrap();
        match sorted {
            Value::List(items) => {
                assert_eq!(items[0].get_attr("name"), Some(Value::from("a")));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn test_sort_incomparable() {
        let mixed = Value::List(vec![Value::Int(1), Value::from("a")]);
        assert!(run(filter_sort, mixed, &[], Kwargs::new()).is_err());
    }

    #[test]
    fn test_unique_preserves_order() {
        let list = Value::from(vec![2i64, 1, 2, 3, 1]);
        assert_eq!(
            apply(filter_unique, list, &[]),
            Value::from(vec![2i64, 1, 3])
        );
    }

    #[test]
    fn test_batch() {
        let list = Value::from(vec![1i64, 2, 3, 4, 5]);
        let batched = apply(filter_batch, list, &[Value::Int(2), Value::Int(0)]);
        assert_eq!(
            batched,
            Value::List(vec![
                Value::from(vec![1i64, 2]),
                Value::from(vec![3i64, 4]),
                Value::from(vec![5i64, 0]),
            ])
        );
    }

    #[test]
    fn test_slice_columns() {
        let list = Value::from(vec![1i64, 2, 3, 4, 5]);
        let sliced = apply(filter_slice, list, &[Value::Int(2)]);
        assert_eq!(
            sliced,
            Value::List(vec![
                Value::from(vec![1i64, 2, 3]),
                Value::from(vec![4i64, 5]),
            ])
        );
    }

    #[test]
    fn test_items_keys_values_ordered() {
        let map = Value::map_from([("z", Value::Int(1)), ("a", Value::Int(2))]);
        assert_eq!(
            apply(filter_keys, map.clone(), &[]),
            Value::List(vec![Value::from("z"), Value::from("a")])
        );
        assert_eq!(
            apply(filter_values, map.clone(), &[]),
            Value::from(vec![1i64, 2])
        );
        let items = apply(filter_items, map, &[]);
        assert_eq!(
            items,
            Value::List(vec![
                Value::List(vec![Value::from("z"), Value::Int(1)]),
                Value::List(vec![Value::from("a"), Value::Int(2)]),
            ])
        );
    }

    #[test]
    fn test_map_attribute() {
        let users = Value::List(vec![
            Value::map_from([("name", Value::from("a"))]),
            Value::map_from([("name", Value::from("b"))]),
        ]);
        let mut kwargs = Kwargs::new();
        kwargs.insert("attribute".to_string(), Value::from("name"));
        assert_eq!(
            run(filter_map, users, &[], kwargs).unwrap(),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_map_filter() {
        let words = Value::List(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(
            apply(filter_map, words, &[Value::from("upper")]),
            Value::List(vec![Value::from("A"), Value::from("B")])
        );
    }

    #[test]
    fn test_select_and_reject() {
        let list = Value::from(vec![1i64, 2, 3, 4]);
        assert_eq!(
            apply(filter_select, list.clone(), &[Value::from("even")]),
            Value::from(vec![2i64, 4])
        );
        assert_eq!(
            apply(filter_reject, list, &[Value::from("even")]),
            Value::from(vec![1i64, 3])
        );
        let with_falsy = Value::List(vec![Value::Int(0), Value::Int(1), Value::None]);
        assert_eq!(
            apply(filter_select, with_falsy, &[]),
            Value::from(vec![1i64])
        );
    }

    #[test]
    fn test_default() {
        assert_eq!(
            apply(filter_default, Value::undefined("x"), &[Value::from("fb")]),
            Value::from("fb")
        );
        assert_eq!(
            apply(filter_default, Value::Int(0), &[Value::from("fb")]),
            Value::Int(0)
        );
        assert_eq!(
            apply(
                filter_default,
                Value::Int(0),
                &[Value::from("fb"), Value::Bool(true)]
            ),
            Value::from("fb")
        );
    }

    #[test]
    fn test_tojson_is_safe_and_escaped() {
        let value = Value::map_from([("k", Value::from("<b>"))]);
        let out = apply(filter_tojson, value, &[]);
        assert!(out.is_safe());
        assert_eq!(out.to_string(), "{\"k\":\"\\u003cb\\u003e\"}");
    }

    #[test]
    fn test_tojson_preserves_insertion_order() {
        let value = Value::map_from([("z", Value::Int(1)), ("a", Value::Int(2))]);
        assert_eq!(
            apply(filter_tojson, value, &[]).to_string(),
            "{\"z\":1,\"a\":2}"
        );
    }
}
