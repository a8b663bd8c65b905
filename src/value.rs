// ABOUTME: Dynamic value type for template evaluation: variants, truthiness,
// equality, coercion, and the serde bridge for building render contexts

use crate::error::TemplateError;
use crate::macros::MacroDef;
use indexmap::IndexMap;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Named arguments to a call, in declaration order.
pub type Kwargs = IndexMap<String, Value>;

/// A host-language function exposed to templates (globals such as
/// `range`, or anything the caller registers).
pub struct NativeCallable {
    name: String,
    func: Box<dyn Fn(&[Value], &Kwargs) -> Result<Value, TemplateError> + Send + Sync>,
}

impl NativeCallable {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> Result<Value, TemplateError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value, TemplateError> {
        (self.func)(args, kwargs)
    }
}

impl fmt::Debug for NativeCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeCallable({})", self.name)
    }
}

/// Mutable attribute bag created by the `namespace()` global. Attribute
/// assignment through `{% set ns.attr = ... %}` mutates the bag in
/// place, which is how loops accumulate state across iterations.
#[derive(Debug, Default)]
pub struct Namespace {
    inner: RwLock<IndexMap<String, Value>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.read().expect("namespace lock poisoned").get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.inner
            .write()
            .expect("namespace lock poisoned")
            .insert(name.into(), value);
    }

    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.inner.read().expect("namespace lock poisoned").clone()
    }
}

/// The universal runtime datum.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// A string marked as not needing escape under autoescape
    SafeString(String),
    List(Vec<Value>),
    /// String-keyed mapping preserving insertion order
    Map(IndexMap<String, Value>),
    Callable(Arc<NativeCallable>),
    Macro(Arc<MacroDef>),
    Namespace(Arc<Namespace>),
    /// A name that had no binding; carries the name for diagnostics
    Undefined(String),
}

impl Value {
    pub fn safe(s: impl Into<String>) -> Self {
        Value::SafeString(s.into())
    }

    pub fn undefined(name: impl Into<String>) -> Self {
        Value::Undefined(name.into())
    }

    pub fn empty_map() -> Self {
        Value::Map(IndexMap::new())
    }

    /// Build a map value from `(key, value)` pairs, preserving order.
    pub fn map_from<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) | Value::SafeString(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "mapping",
            Value::Callable(_) => "function",
            Value::Macro(_) => "macro",
            Value::Namespace(_) => "namespace",
            Value::Undefined(_) => "undefined",
        }
    }

    /// Truthiness: none/undefined/false/0/0.0/""/empty list/empty map
    /// are falsy, everything else truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None | Value::Undefined(_) => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) | Value::SafeString(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Callable(_) | Value::Macro(_) | Value::Namespace(_) => true,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined(_))
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Value::SafeString(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::SafeString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// The number of items or characters, for sized values.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::String(s) | Value::SafeString(s) => Some(s.chars().count()),
            Value::List(items) => Some(items.len()),
            Value::Map(map) => Some(map.len()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|n| n == 0)
    }

    /// Attribute lookup: namespace field or mapping key.
    pub fn get_attr(&self, name: &str) -> Option<Value> {
        match self {
            Value::Namespace(ns) => ns.get(name),
            Value::Map(map) => map.get(name).cloned(),
            _ => None,
        }
    }

    /// Item lookup: mapping key first, then list/string index.
    /// Negative indices count from the end.
    pub fn get_item(&self, key: &Value) -> Option<Value> {
        match (self, key) {
            (Value::Map(map), k) => {
                let name = k.as_str()?;
                map.get(name).cloned()
            }
            (Value::Namespace(ns), k) => ns.get(k.as_str()?),
            (Value::List(items), Value::Int(idx)) => {
                let i = normalize_index(*idx, items.len())?;
                items.get(i).cloned()
            }
            (Value::String(s) | Value::SafeString(s), Value::Int(idx)) => {
                let chars: Vec<char> = s.chars().collect();
                let i = normalize_index(*idx, chars.len())?;
                chars.get(i).map(|c| Value::String(c.to_string()))
            }
            _ => None,
        }
    }

    /// Membership for `in`: element of a list, key of a mapping,
    /// substring of a string. `None` means the value is not a container.
    pub fn contains(&self, needle: &Value) -> Option<bool> {
        match self {
            Value::List(items) => Some(items.contains(needle)),
            Value::Map(map) => {
                let key = needle.as_str()?;
                Some(map.contains_key(key))
            }
            Value::String(s) | Value::SafeString(s) => {
                let sub = needle.as_str()?;
                Some(s.contains(sub))
            }
            _ => None,
        }
    }

    /// Ordering for `<`/`<=`/`>`/`>=`: numerics by natural order,
    /// strings lexicographically. `None` means the types do not order.
    pub fn try_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (
                Value::String(a) | Value::SafeString(a),
                Value::String(b) | Value::SafeString(b),
            ) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Reader-friendly form used inside rendered lists and mappings.
    pub fn repr(&self) -> String {
        match self {
            Value::None => "none".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format_float(*f),
            Value::String(s) | Value::SafeString(s) => format!("'{}'", s.replace('\'', "\\'")),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Callable(c) => format!("<function {}>", c.name()),
            Value::Macro(m) => format!("<macro {}>", m.name),
            Value::Namespace(ns) => {
                let inner: Vec<String> = ns
                    .snapshot()
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                format!("<namespace {{{}}}>", inner.join(", "))
            }
            Value::Undefined(_) => "undefined".to_string(),
        }
    }

    /// Convert to a JSON value for serialization-backed filters.
    /// Functions, macros, and namespaces have no JSON form.
    pub fn to_json(&self) -> Result<serde_json::Value, TemplateError> {
        match self {
            Value::None | Value::Undefined(_) => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Int(n) => Ok(serde_json::Value::Number((*n).into())),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    TemplateError::type_error("cannot serialize a non-finite float", None)
                }),
            Value::String(s) | Value::SafeString(s) => Ok(serde_json::Value::String(s.clone())),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.to_json()?);
                }
                Ok(serde_json::Value::Array(out))
            }
            Value::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json()?);
                }
                Ok(serde_json::Value::Object(out))
            }
            other => Err(TemplateError::type_error(
                format!("cannot serialize a {} to JSON", other.type_name()),
                None,
            )),
        }
    }

    /// Build a value from anything serde can serialize. This is the
    /// main way callers construct render contexts from their own types.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Value, TemplateError> {
        let json = serde_json::to_value(value)
            .map_err(|e| TemplateError::type_error(format!("context serialization: {e}"), None))?;
        Ok(Value::from(json))
    }
}

/// Map a possibly-negative index onto a length, Python style.
fn normalize_index(idx: i64, len: usize) -> Option<usize> {
    if idx < 0 {
        let back = idx.unsigned_abs() as usize;
        if back > len {
            None
        } else {
            Some(len - back)
        }
    } else {
        Some(idx as usize)
    }
}

/// Format a float the way template output expects: whole floats keep a
/// trailing `.0` so `8 / 2` renders as `4.0`.
pub(crate) fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

impl fmt::Display for Value {
    /// The output form used when a value is written into the render
    /// buffer: scalars plainly, containers in their reader-friendly
    /// bracketed form, none and undefined as empty output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None | Value::Undefined(_) => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::String(s) | Value::SafeString(s) => write!(f, "{s}"),
            Value::List(_) | Value::Map(_) | Value::Namespace(_) => write!(f, "{}", self.repr()),
            Value::Callable(c) => write!(f, "<function {}>", c.name()),
            Value::Macro(m) => write!(f, "<macro {}>", m.name),
        }
    }
}

impl PartialEq for Value {
    /// Equality with numeric promotion; `==` on incompatible types is
    /// `false` rather than an error. Callables, macros, and namespaces
    /// compare by identity.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Undefined(_), Value::Undefined(_)) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (
                Value::String(a) | Value::SafeString(a),
                Value::String(b) | Value::SafeString(b),
            ) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Callable(a), Value::Callable(b)) => Arc::ptr_eq(a, b),
            (Value::Macro(a), Value::Macro(b)) => Arc::ptr_eq(a, b),
            (Value::Namespace(a), Value::Namespace(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Build a render context from `key => value` pairs:
///
/// ```
/// use vellum::context;
/// let ctx = context! { name => "Alice", count => 3 };
/// ```
#[macro_export]
macro_rules! context {
    () => {
        $crate::value::Value::empty_map()
    };
    ($($key:ident => $value:expr),+ $(,)?) => {
        $crate::value::Value::map_from([
            $((stringify!($key), $crate::value::Value::from($value))),+
        ])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::undefined("x").is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(!Value::empty_map().is_truthy());

        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(Value::from(vec![0i64]).is_truthy());
    }

    #[test]
    fn test_numeric_equality_promotes() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Float(2.5), Value::Float(2.5));
        assert_ne!(Value::Int(1), Value::Float(1.5));
    }

    #[test]
    fn test_cross_type_equality_is_false() {
        assert_ne!(Value::Int(1), Value::from("1"));
        assert_ne!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::None, Value::Int(0));
    }

    #[test]
    fn test_safe_string_equals_plain() {
        assert_eq!(Value::safe("x"), Value::from("x"));
    }

    #[test]
    fn test_display_output_forms() {
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Float(4.0).to_string(), "4.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::None.to_string(), "");
        assert_eq!(Value::undefined("x").to_string(), "");
        assert_eq!(
            Value::from(vec![Value::Int(1), Value::from("a")]).to_string(),
            "[1, 'a']"
        );
    }

    #[test]
    fn test_map_display_preserves_insertion_order() {
        let map = Value::map_from([("z", Value::Int(1)), ("a", Value::Int(2))]);
        assert_eq!(map.to_string(), "{'z': 1, 'a': 2}");
    }

    #[test]
    fn test_negative_indexing() {
        let list = Value::from(vec![1i64, 2, 3]);
        assert_eq!(list.get_item(&Value::Int(-1)), Some(Value::Int(3)));
        assert_eq!(list.get_item(&Value::Int(-3)), Some(Value::Int(1)));
        assert_eq!(list.get_item(&Value::Int(-4)), None);
        assert_eq!(list.get_item(&Value::Int(5)), None);

        let s = Value::from("abc");
        assert_eq!(s.get_item(&Value::Int(-1)), Some(Value::from("c")));
    }

    #[test]
    fn test_attr_and_item_on_map() {
        let map = Value::map_from([("key", Value::Int(7))]);
        assert_eq!(map.get_attr("key"), Some(Value::Int(7)));
        assert_eq!(map.get_item(&Value::from("key")), Some(Value::Int(7)));
        assert_eq!(map.get_attr("missing"), None);
    }

    #[test]
    fn test_namespace_mutation() {
        let ns = Arc::new(Namespace::new());
        ns.set("count", Value::Int(0));
        ns.set("count", Value::Int(3));
        let value = Value::Namespace(ns.clone());
        assert_eq!(value.get_attr("count"), Some(Value::Int(3)));
    }

    #[test]
    fn test_try_cmp() {
        use std::cmp::Ordering;
        assert_eq!(Value::Int(1).try_cmp(&Value::Int(2)), Some(Ordering::Less));
        assert_eq!(
            Value::Int(2).try_cmp(&Value::Float(1.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Value::from("a").try_cmp(&Value::from("b")),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Int(1).try_cmp(&Value::from("a")), None);
    }

    #[test]
    fn test_from_serialize() {
        #[derive(Serialize)]
        struct User {
            name: String,
            age: i64,
        }
        let value = Value::from_serialize(&User {
            name: "Ada".to_string(),
            age: 36,
        })
        .unwrap();
        assert_eq!(value.get_attr("name"), Some(Value::from("Ada")));
        assert_eq!(value.get_attr("age"), Some(Value::Int(36)));
    }

    #[test]
    fn test_to_json_rejects_callables() {
        let f = Value::Callable(Arc::new(NativeCallable::new("f", |_, _| Ok(Value::None))));
        assert!(f.to_json().is_err());
    }

    #[test]
    fn test_context_macro() {
        let ctx = context! { name => "Alice", count => 3 };
        assert_eq!(ctx.get_attr("name"), Some(Value::from("Alice")));
        assert_eq!(ctx.get_attr("count"), Some(Value::Int(3)));
        assert_eq!(context! {}, Value::empty_map());
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(4.0), "4.0");
        assert_eq!(format_float(-0.5), "-0.5");
        assert_eq!(format_float(f64::INFINITY), "inf");
    }
}
