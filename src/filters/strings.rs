//! String transformation filters
//!
//! Case mapping, trimming, replacement, truncation, layout helpers,
//! and URL encoding. Non-string inputs are coerced through their
//! output string form first.

use crate::autoescape::escape_url;
use crate::error::TemplateError;
use crate::value::{Kwargs, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::{arg_opt, arg_required, bool_arg, coerce_string, int_arg, str_arg, FilterFn,
    FilterState};

pub fn register(registry: &mut HashMap<String, Arc<FilterFn>>) {
    registry.insert("upper".to_string(), Arc::new(filter_upper));
    registry.insert("lower".to_string(), Arc::new(filter_lower));
    registry.insert("capitalize".to_string(), Arc::new(filter_capitalize));
    registry.insert("title".to_string(), Arc::new(filter_title));
    registry.insert("trim".to_string(), Arc::new(filter_trim));
    registry.insert("replace".to_string(), Arc::new(filter_replace));
    registry.insert("truncate".to_string(), Arc::new(filter_truncate));
    registry.insert("indent".to_string(), Arc::new(filter_indent));
    registry.insert("wordcount".to_string(), Arc::new(filter_wordcount));
    registry.insert("urlencode".to_string(), Arc::new(filter_urlencode));
    registry.insert("center".to_string(), Arc::new(filter_center));
}

/// Uppercase the value.
///
/// # Examples
///
/// ```text
/// {{ "hello" | upper }} => HELLO
/// ```
pub fn filter_upper(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    Ok(Value::String(coerce_string(value).to_uppercase()))
}

/// Lowercase the value.
pub fn filter_lower(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    Ok(Value::String(coerce_string(value).to_lowercase()))
}

/// Uppercase the first character and lowercase the rest.
pub fn filter_capitalize(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let s = coerce_string(value);
    let mut chars = s.chars();
    let out = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    Ok(Value::String(out))
}

/// Capitalize each whitespace-separated word.
pub fn filter_title(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let s = coerce_string(value);
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_whitespace() {
            at_word_start = true;
            out.push(c);
        } else if at_word_start {
            out.extend(c.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    Ok(Value::String(out))
}

/// Strip surrounding whitespace, or the characters given as the first
/// argument.
pub fn filter_trim(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let s = coerce_string(value);
    let out = match arg_opt(args, kwargs, 0, "chars") {
        Some(chars) => {
            let set: Vec<char> = str_arg("trim", chars)?.chars().collect();
            s.trim_matches(|c| set.contains(&c)).to_string()
        }
        None => s.trim().to_string(),
    };
    Ok(Value::String(out))
}

/// Replace occurrences of a substring.
///
/// # Examples
///
/// ```text
/// {{ "aaa" | replace("a", "b", 2) }} => bba
/// ```
pub fn filter_replace(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let s = coerce_string(value);
    let old = str_arg("replace", arg_required("replace", args, kwargs, 0, "old")?)?;
    let new = str_arg("replace", arg_required("replace", args, kwargs, 1, "new")?)?;
    let out = match arg_opt(args, kwargs, 2, "count") {
        Some(count) => s.replacen(&old, &new, int_arg("replace", count)?.max(0) as usize),
        None => s.replace(&old, &new),
    };
    Ok(Value::String(out))
}

/// Shorten to at most `length` characters, appending `end` when text
/// was dropped. Without `killwords`, cuts at the last word boundary.
pub fn filter_truncate(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let s = coerce_string(value);
    let length = match arg_opt(args, kwargs, 0, "length") {
        Some(v) => int_arg("truncate", v)?.max(0) as usize,
        None => 255,
    };
    let killwords = arg_opt(args, kwargs, 1, "killwords").is_some_and(bool_arg);
    let end = match arg_opt(args, kwargs, 2, "end") {
        Some(v) => str_arg("truncate", v)?,
        None => "...".to_string(),
    };

    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= length {
        return Ok(Value::String(s));
    }
    let mut cut: String = chars[..length].iter().collect();
    if !killwords {
        if let Some(last_space) = cut.rfind(char::is_whitespace) {
            cut.truncate(last_space);
        }
    }
    Ok(Value::String(format!("{}{}", cut.trim_end(), end)))
}

/// Indent every line by `width` spaces; the first line is left alone
/// unless `first` is set.
pub fn filter_indent(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let s = coerce_string(value);
    let width = match arg_opt(args, kwargs, 0, "width") {
        Some(v) => int_arg("indent", v)?.max(0) as usize,
        None => 4,
    };
    let indent_first = arg_opt(args, kwargs, 1, "first").is_some_and(bool_arg);
    let pad = " ".repeat(width);

    let mut out = String::with_capacity(s.len());
    for (i, line) in s.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if (i > 0 || indent_first) && !line.is_empty() {
            out.push_str(&pad);
        }
        out.push_str(line);
    }
    Ok(Value::String(out))
}

/// Count whitespace-separated words.
pub fn filter_wordcount(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let s = coerce_string(value);
    Ok(Value::Int(s.split_whitespace().count() as i64))
}

/// Percent-encode a string, or a mapping into `k=v&k=v` query form.
pub fn filter_urlencode(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    match value {
        Value::Map(map) => {
            let pairs: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}={}", escape_url(k), escape_url(&coerce_string(v))))
                .collect();
            Ok(Value::String(pairs.join("&")))
        }
        other => Ok(Value::String(escape_url(&coerce_string(other)))),
    }
}

/// Center the value in a field of the given width (default 80).
pub fn filter_center(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let s = coerce_string(value);
    let width = match arg_opt(args, kwargs, 0, "width") {
        Some(v) => int_arg("center", v)?.max(0) as usize,
        None => 80,
    };
    let len = s.chars().count();
    if len >= width {
        return Ok(Value::String(s));
    }
    let total = width - len;
    let left = total / 2;
    Ok(Value::String(format!(
        "{}{}{}",
        " ".repeat(left),
        s,
        " ".repeat(total - left)
    )))
}
