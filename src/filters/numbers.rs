//! Numeric filters: absolute value, rounding, coercion, aggregation

use crate::error::TemplateError;
use crate::value::{Kwargs, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::{arg_opt, int_arg, list_input, str_arg, FilterFn, FilterState};

pub fn register(registry: &mut HashMap<String, Arc<FilterFn>>) {
    registry.insert("abs".to_string(), Arc::new(filter_abs));
    registry.insert("round".to_string(), Arc::new(filter_round));
    registry.insert("int".to_string(), Arc::new(filter_int));
    registry.insert("float".to_string(), Arc::new(filter_float));
    registry.insert("sum".to_string(), Arc::new(filter_sum));
    registry.insert("min".to_string(), Arc::new(filter_min));
    registry.insert("max".to_string(), Arc::new(filter_max));
}

/// Absolute value, preserving the numeric type.
pub fn filter_abs(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    match value {
        Value::Int(n) => n
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| TemplateError::math_error("integer overflow in `abs`", None)),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(TemplateError::type_error(
            format!("filter `abs` expects a number, got {}", other.type_name()),
            None,
        )),
    }
}

/// Round to the given precision (default 0). The `method` keyword
/// selects `common`, `ceil`, or `floor`. Always yields a float.
pub fn filter_round(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let input = value.as_float().ok_or_else(|| {
        TemplateError::type_error(
            format!("filter `round` expects a number, got {}", value.type_name()),
            None,
        )
    })?;
    let precision = match arg_opt(args, kwargs, 0, "precision") {
        Some(v) => int_arg("round", v)?,
        None => 0,
    };
    let method = match arg_opt(args, kwargs, 1, "method") {
        Some(v) => str_arg("round", v)?,
        None => "common".to_string(),
    };

    let factor = 10f64.powi(precision as i32);
    let scaled = input * factor;
    let rounded = match method.as_str() {
        "common" => scaled.round(),
        "ceil" => scaled.ceil(),
        "floor" => scaled.floor(),
        other => {
            return Err(TemplateError::type_error(
                format!("filter `round` has no method `{other}`"),
                None,
            ))
        }
    };
    Ok(Value::Float(rounded / factor))
}

/// Coerce to integer; strings are parsed, failures yield the
/// `default` argument (0 when absent).
pub fn filter_int(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let fallback = || match arg_opt(args, kwargs, 0, "default") {
        Some(v) => v.clone(),
        None => Value::Int(0),
    };
    let out = match value {
        Value::Int(n) => Value::Int(*n),
        Value::Float(f) => Value::Int(*f as i64),
        Value::Bool(b) => Value::Int(i64::from(*b)),
        Value::String(s) | Value::SafeString(s) => match s.trim().parse::<i64>() {
            Ok(n) => Value::Int(n),
            Err(_) => fallback(),
        },
        _ => fallback(),
    };
    Ok(out)
}

/// Coerce to float; parse failures yield the `default` argument
/// (0.0 when absent).
pub fn filter_float(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let fallback = || match arg_opt(args, kwargs, 0, "default") {
        Some(v) => v.clone(),
        None => Value::Float(0.0),
    };
    let out = match value {
        Value::Int(n) => Value::Float(*n as f64),
        Value::Float(f) => Value::Float(*f),
        Value::String(s) | Value::SafeString(s) => match s.trim().parse::<f64>() {
            Ok(f) => Value::Float(f),
            Err(_) => fallback(),
        },
        _ => fallback(),
    };
    Ok(out)
}

/// Sum a list of numbers, starting from `start` (default 0). The
/// result stays an integer while every operand is one.
pub fn filter_sum(
    value: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    let items = list_input("sum", value)?;
    let mut acc = match arg_opt(args, kwargs, 0, "start") {
        Some(v) => v.clone(),
        None => Value::Int(0),
    };
    for item in items {
        acc = match (&acc, item) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| TemplateError::math_error("integer overflow in `sum`", None))?,
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => Value::Float(x + y),
                _ => {
                    return Err(TemplateError::type_error(
                        format!("filter `sum` expects numbers, got {}", item.type_name()),
                        None,
                    ))
                }
            },
        };
    }
    Ok(acc)
}

fn extreme(
    filter: &str,
    value: &Value,
    want_greater: bool,
) -> Result<Value, TemplateError> {
    let items = list_input(filter, value)?;
    let mut best: Option<&Value> = None;
    for item in items {
        match best {
            None => best = Some(item),
            Some(current) => {
                let ord = item.try_cmp(current).ok_or_else(|| {
                    TemplateError::type_error(
                        format!("filter `{filter}` cannot compare {} with {}",
                            item.type_name(),
                            current.type_name()
                        ),
                        None,
                    )
                })?;
                if (ord == std::cmp::Ordering::Greater) == want_greater
                    && ord != std::cmp::Ordering::Equal
                {
                    best = Some(item);
                }
            }
        }
    }
    best.cloned().ok_or_else(|| {
        TemplateError::type_error(format!("filter `{filter}` of an empty list"), None)
    })
}

pub fn filter_min(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    extreme("min", value, false)
}

pub fn filter_max(
    value: &Value,
    _args: &[Value],
    _kwargs: &Kwargs,
    _state: &FilterState<'_>,
) -> Result<Value, TemplateError> {
    extreme("max", value, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoescape::EscapeContext;
    use crate::environment::Environment;

    fn apply(
        f: impl Fn(&Value, &[Value], &Kwargs, &FilterState<'_>) -> Result<Value, TemplateError>,
        value: Value,
        args: &[Value],
    ) -> Result<Value, TemplateError> {
        let env = Environment::new();
        let state = FilterState {
            env: &env,
            autoescape: EscapeContext::None,
        };
        f(&value, args, &Kwargs::new(), &state)
    }

    #[test]
    fn test_abs() {
        assert_eq!(apply(filter_abs, Value::Int(-3), &[]).unwrap(), Value::Int(3));
        assert_eq!(
            apply(filter_abs, Value::Float(-2.5), &[]).unwrap(),
            Value::Float(2.5)
        );
        assert!(apply(filter_abs, Value::from("x"), &[]).is_err());
    }

    #[test]
    fn test_round() {
        assert_eq!(
            apply(filter_round, Value::Float(2.345), &[Value::Int(2)]).unwrap(),
            Value::Float(2.35)
        );
        assert_eq!(
            apply(filter_round, Value::Float(2.4), &[]).unwrap(),
            Value::Float(2.0)
        );
    }

    #[test]
    fn test_int_coercion() {
        assert_eq!(apply(filter_int, Value::from("42"), &[]).unwrap(), Value::Int(42));
        assert_eq!(apply(filter_int, Value::Float(3.9), &[]).unwrap(), Value::Int(3));
        assert_eq!(apply(filter_int, Value::from("bad"), &[]).unwrap(), Value::Int(0));
        assert_eq!(
            apply(filter_int, Value::from("bad"), &[Value::Int(-1)]).unwrap(),
            Value::Int(-1)
        );
    }

    #[test]
    fn test_float_coercion() {
        assert_eq!(
            apply(filter_float, Value::from("2.5"), &[]).unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(
            apply(filter_float, Value::Int(2), &[]).unwrap(),
            Value::Float(2.0)
        );
    }

    #[test]
    fn test_sum_preserves_int() {
        let list = Value::from(vec![1i64, 2, 3]);
        assert_eq!(apply(filter_sum, list, &[]).unwrap(), Value::Int(6));
        let mixed = Value::List(vec![Value::Int(1), Value::Float(0.5)]);
        assert_eq!(apply(filter_sum, mixed, &[]).unwrap(), Value::Float(1.5));
    }

    #[test]
    fn test_min_max() {
        let list = Value::from(vec![3i64, 1, 2]);
        assert_eq!(apply(filter_min, list.clone(), &[]).unwrap(), Value::Int(1));
        assert_eq!(apply(filter_max, list, &[]).unwrap(), Value::Int(3));
        assert!(apply(filter_min, Value::List(vec![]), &[]).is_err());
    }
}
