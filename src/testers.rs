//! Built-in tests applied with `is` syntax: type predicates, numeric
//! predicates, and string shape checks.

use crate::error::TemplateError;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Signature of a test: the tested value plus positional arguments.
pub type TestFn = dyn Fn(&Value, &[Value]) -> Result<bool, TemplateError> + Send + Sync;

/// Register all built-in tests
pub fn register_builtin_tests(registry: &mut HashMap<String, Arc<TestFn>>) {
    let mut add = |name: &str, f: Arc<TestFn>| {
        registry.insert(name.to_string(), f);
    };

    add("defined", Arc::new(test_defined));
    add("undefined", Arc::new(test_undefined));
    add("none", Arc::new(test_none));
    add("string", Arc::new(test_string));
    add("number", Arc::new(test_number));
    add("integer", Arc::new(test_integer));
    add("float", Arc::new(test_float));
    add("boolean", Arc::new(test_boolean));
    add("sequence", Arc::new(test_sequence));
    add("mapping", Arc::new(test_mapping));
    add("iterable", Arc::new(test_iterable));
    add("callable", Arc::new(test_callable));
    add("even", Arc::new(test_even));
    add("odd", Arc::new(test_odd));
    add("divisibleby", Arc::new(test_divisibleby));
    add("lower", Arc::new(test_lower));
    add("upper", Arc::new(test_upper));
    add("equalto", Arc::new(test_equalto));
    add("eq", Arc::new(test_equalto));
    add("sameas", Arc::new(test_sameas));
    add("in", Arc::new(test_in));
    add("empty", Arc::new(test_empty));
    add("startswith", Arc::new(test_startswith));
    add("endswith", Arc::new(test_endswith));
    add("alpha", Arc::new(test_alpha));
    add("alnum", Arc::new(test_alnum));
    add("ascii", Arc::new(test_ascii));
}

fn no_args(name: &str, args: &[Value]) -> Result<(), TemplateError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(TemplateError::type_error(
            format!("test `{name}` takes no arguments"),
            None,
        ))
    }
}

fn one_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value, TemplateError> {
    match args {
        [arg] => Ok(arg),
        _ => Err(TemplateError::type_error(
            format!("test `{name}` takes exactly one argument, got {}", args.len()),
            None,
        )),
    }
}

fn int_value(name: &str, value: &Value) -> Result<i64, TemplateError> {
    value.as_int().ok_or_else(|| {
        TemplateError::type_error(
            format!("test `{name}` requires an integer, got {}", value.type_name()),
            None,
        )
    })
}

fn str_value<'a>(name: &str, value: &'a Value) -> Result<&'a str, TemplateError> {
    value.as_str().ok_or_else(|| {
        TemplateError::type_error(
            format!("test `{name}` requires a string, got {}", value.type_name()),
            None,
        )
    })
}

fn test_defined(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("defined", args)?;
    Ok(!value.is_undefined())
}

fn test_undefined(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("undefined", args)?;
    Ok(value.is_undefined())
}

fn test_none(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("none", args)?;
    Ok(matches!(value, Value::None))
}

fn test_string(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("string", args)?;
    Ok(value.as_str().is_some())
}

fn test_number(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("number", args)?;
    Ok(matches!(value, Value::Int(_) | Value::Float(_)))
}

fn test_integer(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("integer", args)?;
    Ok(matches!(value, Value::Int(_)))
}

fn test_float(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("float", args)?;
    Ok(matches!(value, Value::Float(_)))
}

fn test_boolean(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("boolean", args)?;
    Ok(matches!(value, Value::Bool(_)))
}

fn test_sequence(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("sequence", args)?;
    Ok(matches!(
        value,
        Value::List(_) | Value::String(_) | Value::SafeString(_)
    ))
}

fn test_mapping(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("mapping", args)?;
    Ok(matches!(value, Value::Map(_)))
}

fn test_iterable(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("iterable", args)?;
    Ok(matches!(
        value,
        Value::List(_) | Value::Map(_) | Value::String(_) | Value::SafeString(_)
    ))
}

fn test_callable(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("callable", args)?;
    Ok(matches!(value, Value::Callable(_) | Value::Macro(_)))
}

fn test_even(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("even", args)?;
    Ok(int_value("even", value)? % 2 == 0)
}

fn test_odd(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("odd", args)?;
    Ok(int_value("odd", value)? % 2 != 0)
}

fn test_divisibleby(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    let divisor = int_value("divisibleby", one_arg("divisibleby", args)?)?;
    if divisor == 0 {
        return Err(TemplateError::math_error("divisibleby zero", None));
    }
    Ok(int_value("divisibleby", value)? % divisor == 0)
}

/// True when the string has cased characters and none are uppercase
fn test_lower(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("lower", args)?;
    let s = str_value("lower", value)?;
    let mut has_cased = false;
    for c in s.chars() {
        if c.is_uppercase() {
            return Ok(false);
        }
        if c.is_lowercase() {
            has_cased = true;
        }
    }
    Ok(has_cased)
}

fn test_upper(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("upper", args)?;
    let s = str_value("upper", value)?;
    let mut has_cased = false;
    for c in s.chars() {
        if c.is_lowercase() {
            return Ok(false);
        }
        if c.is_uppercase() {
            has_cased = true;
        }
    }
    Ok(has_cased)
}

fn test_equalto(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    Ok(value == one_arg("equalto", args)?)
}

/// Identity comparison: reference types by pointer, simple scalars by
/// strict same-variant equality.
fn test_sameas(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    let other = one_arg("sameas", args)?;
    Ok(match (value, other) {
        (Value::Callable(a), Value::Callable(b)) => Arc::ptr_eq(a, b),
        (Value::Macro(a), Value::Macro(b)) => Arc::ptr_eq(a, b),
        (Value::Namespace(a), Value::Namespace(b)) => Arc::ptr_eq(a, b),
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    })
}

fn test_in(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    let container = one_arg("in", args)?;
    container.contains(value).ok_or_else(|| {
        TemplateError::type_error(
            format!("`in` needs a container, got {}", container.type_name()),
            None,
        )
    })
}

fn test_empty(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("empty", args)?;
    value.is_empty().ok_or_else(|| {
        TemplateError::type_error(
            format!("test `empty` requires a sized value, got {}", value.type_name()),
            None,
        )
    })
}

fn test_startswith(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    let prefix = str_value("startswith", one_arg("startswith", args)?)?.to_string();
    Ok(str_value("startswith", value)?.starts_with(&prefix))
}

fn test_endswith(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    let suffix = str_value("endswith", one_arg("endswith", args)?)?.to_string();
    Ok(str_value("endswith", value)?.ends_with(&suffix))
}

fn test_alpha(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("alpha", args)?;
    let s = str_value("alpha", value)?;
    Ok(!s.is_empty() && s.chars().all(char::is_alphabetic))
}

fn test_alnum(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("alnum", args)?;
    let s = str_value("alnum", value)?;
    Ok(!s.is_empty() && s.chars().all(char::is_alphanumeric))
}

fn test_ascii(value: &Value, args: &[Value]) -> Result<bool, TemplateError> {
    no_args("ascii", args)?;
    Ok(str_value("ascii", value)?.is_ascii())
}
