// ABOUTME: Per-iteration loop state backing the synthetic `loop` variable

use crate::error::TemplateError;
use crate::value::Value;

/// Live state of one `for` loop. A stack of these sits on the renderer;
/// the innermost entry answers `loop.cycle(...)` and `loop.changed(...)`
/// dispatch, which need mutable state across iterations.
#[derive(Debug)]
pub struct LoopState {
    items: Vec<Value>,
    index0: usize,
    depth0: usize,
    /// Arguments seen by the last `loop.changed(...)` call
    last_changed: Option<Vec<Value>>,
}

impl LoopState {
    pub fn new(items: Vec<Value>, depth0: usize) -> Self {
        Self {
            items,
            index0: 0,
            depth0,
            last_changed: None,
        }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn set_index0(&mut self, index0: usize) {
        self.index0 = index0;
    }

    pub fn depth0(&self) -> usize {
        self.depth0
    }

    /// `loop.cycle(a, b, c)` picks by the current index
    pub fn cycle(&self, args: &[Value]) -> Result<Value, TemplateError> {
        if args.is_empty() {
            return Err(TemplateError::type_error(
                "loop.cycle requires at least one argument",
                None,
            ));
        }
        Ok(args[self.index0 % args.len()].clone())
    }

    /// `loop.changed(*values)` is true when the arguments differ from
    /// the previous call's
    pub fn changed(&mut self, args: &[Value]) -> bool {
        let changed = self.last_changed.as_deref() != Some(args);
        self.last_changed = Some(args.to_vec());
        changed
    }

    /// Snapshot the `loop` descriptor for the current iteration.
    pub fn descriptor(&self) -> Value {
        let index0 = self.index0;
        let length = self.items.len();
        let previtem = if index0 > 0 {
            self.items[index0 - 1].clone()
        } else {
            Value::undefined("loop.previtem")
        };
        let nextitem = match self.items.get(index0 + 1) {
            Some(item) => item.clone(),
            None => Value::undefined("loop.nextitem"),
        };

        Value::map_from([
            ("index", Value::Int(index0 as i64 + 1)),
            ("index0", Value::Int(index0 as i64)),
            ("revindex", Value::Int((length - index0) as i64)),
            ("revindex0", Value::Int((length - index0 - 1) as i64)),
            ("first", Value::Bool(index0 == 0)),
            ("last", Value::Bool(index0 + 1 == length)),
            ("length", Value::Int(length as i64)),
            ("depth", Value::Int(self.depth0 as i64 + 1)),
            ("depth0", Value::Int(self.depth0 as i64)),
            ("previtem", previtem),
            ("nextitem", nextitem),
        ])
    }
}
