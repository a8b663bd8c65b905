// ABOUTME: Evaluator walking the AST against a scope chain, producing
// rendered output and enforcing the runtime semantics

use crate::ast::{
    AssignTarget, BinaryOp, Expr, ExprKind, IncludeContext, Span, Stmt, StmtKind, UnaryOp,
};
use crate::autoescape::EscapeContext;
use crate::config::UndefinedPolicy;
use crate::environment::Environment;
use crate::error::{closest_name, TemplateError};
use crate::filters::FilterState;
use crate::forloop::LoopState;
use crate::inheritance::{self, ResolvedHierarchy};
use crate::macros::{bind_arguments, MacroDef};
use crate::scope::Scope;
use crate::template::CompiledTemplate;
use crate::value::{Kwargs, Value};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Hard ceiling on macro/include/super nesting, against runaway
/// recursive templates.
const MAX_DEPTH: usize = 200;

/// Control-flow signal raised by `break`/`continue`, unwound through
/// enclosing statements until a loop consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Break,
    Continue,
}

/// Re-entry context for a `recursive` loop, so `loop(iterable)` can
/// run the body again at greater depth.
#[derive(Clone)]
struct RecursiveLoop {
    targets: Vec<String>,
    cond: Option<Expr>,
    body: Arc<Vec<Stmt>>,
}

/// Render a compiled template against a context mapping.
pub(crate) fn render_template(
    env: &Environment,
    template: &Arc<CompiledTemplate>,
    context: &Value,
) -> Result<String, TemplateError> {
    let bindings: HashMap<String, Value> = match context {
        Value::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::None => HashMap::new(),
        other => {
            return Err(TemplateError::type_error(
                format!("render context must be a mapping, got {}", other.type_name()),
                None,
            ))
        }
    };
    let root = Scope::with_bindings(bindings);

    let escape_name = template.version.is_some().then(|| template.name.as_str());
    let escape = env.config().autoescape.context_for(escape_name);

    let mut renderer = Renderer {
        env,
        out: String::new(),
        escape: vec![escape],
        hierarchy: None,
        block_stack: Vec::new(),
        super_cache: HashMap::new(),
        loops: Vec::new(),
        recursive: Vec::new(),
        depth: 0,
    };
    renderer.render_compiled(template, &root)?;
    Ok(renderer.out)
}

struct Renderer<'env> {
    env: &'env Environment,
    out: String,
    /// Autoescape context stack; the innermost entry is active
    escape: Vec<EscapeContext>,
    hierarchy: Option<Arc<ResolvedHierarchy>>,
    /// (block name, level) for each block currently rendering, for
    /// `super()` dispatch
    block_stack: Vec<(String, usize)>,
    /// Rendered `super()` content per (block, level), reused within a
    /// render
    super_cache: HashMap<(String, usize), String>,
    loops: Vec<LoopState>,
    recursive: Vec<RecursiveLoop>,
    depth: usize,
}

impl<'env> Renderer<'env> {
    fn escape_context(&self) -> EscapeContext {
        *self.escape.last().expect("escape stack is never empty")
    }

    fn enter(&mut self, span: Span) -> Result<(), TemplateError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(TemplateError::type_error(
                "maximum render recursion depth exceeded",
                Some(span),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Run `f` with a fresh output buffer, returning what it produced.
    fn capture<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, TemplateError>,
    ) -> Result<(String, T), TemplateError> {
        let saved = std::mem::take(&mut self.out);
        let result = f(self);
        let content = std::mem::replace(&mut self.out, saved);
        result.map(|value| (content, value))
    }

    // ========================================================================
    // Template-level rendering
    // ========================================================================

    /// Render a compiled template, resolving its inheritance chain
    /// first when it extends a parent. Hierarchy state is saved around
    /// the render so includes inside inheriting templates stay
    /// isolated.
    fn render_compiled(
        &mut self,
        template: &Arc<CompiledTemplate>,
        scope: &Arc<Scope>,
    ) -> Result<(), TemplateError> {
        let saved_hierarchy = self.hierarchy.take();
        let saved_blocks = std::mem::take(&mut self.block_stack);
        let saved_super = std::mem::take(&mut self.super_cache);

        let result = (|| -> Result<(), TemplateError> {
            match &template.parent {
                None => {
                    self.render_statements(&template.ast, scope)?;
                }
                Some(parent_expr) => {
                    let hierarchy = if template.literal_parent().is_some() {
                        inheritance::resolve(self.env, template)?
                    } else {
                        let name_value = self.eval_expr(parent_expr, scope)?;
                        let name = name_value.as_str().ok_or_else(|| {
                            TemplateError::type_error(
                                format!(
                                    "extends expects a template name string, got {}",
                                    name_value.type_name()
                                ),
                                Some(parent_expr.span),
                            )
                        })?;
                        inheritance::resolve_with_parent(self.env, template, name)?
                    };
                    let base = Arc::clone(hierarchy.chain.first().expect("chain is never empty"));
                    self.hierarchy = Some(hierarchy);
                    self.render_statements(&base.ast, scope)?;
                }
            }
            Ok(())
        })();

        self.hierarchy = saved_hierarchy;
        self.block_stack = saved_blocks;
        self.super_cache = saved_super;
        result
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn render_statements(
        &mut self,
        stmts: &[Stmt],
        scope: &Arc<Scope>,
    ) -> Result<Flow, TemplateError> {
        for stmt in stmts {
            match self.render_statement(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn render_statement(
        &mut self,
        stmt: &Stmt,
        scope: &Arc<Scope>,
    ) -> Result<Flow, TemplateError> {
        match &stmt.kind {
            StmtKind::Text(text) | StmtKind::Raw(text) => {
                self.out.push_str(text);
                Ok(Flow::Normal)
            }
            StmtKind::Output(expr) => {
                let value = self.eval_expr(expr, scope)?;
                self.write_value(&value, expr.span)?;
                Ok(Flow::Normal)
            }
            StmtKind::If { arms, else_body } => {
                for (cond, body) in arms {
                    if self.eval_expr(cond, scope)?.is_truthy() {
                        return self.render_statements(body, scope);
                    }
                }
                self.render_statements(else_body, scope)
            }
            StmtKind::For {
                targets,
                iter,
                cond,
                body,
                else_body,
                recursive,
            } => {
                let iterable = self.eval_expr(iter, scope)?;
                let items = self.iter_items(&iterable, targets.len(), iter.span)?;
                let items =
                    self.filter_loop_items(items, targets, cond.as_ref(), scope, stmt.span)?;

                if items.is_empty() {
                    let frame = Scope::child(scope);
                    return self.render_statements(else_body, &frame);
                }

                if *recursive {
                    self.recursive.push(RecursiveLoop {
                        targets: targets.clone(),
                        cond: cond.clone(),
                        body: Arc::clone(body),
                    });
                }
                let result = self.run_loop(items, targets, body, scope, 0, stmt.span);
                if *recursive {
                    self.recursive.pop();
                }
                result?;
                Ok(Flow::Normal)
            }
            StmtKind::Block { name, body } => self.render_block(name, body, scope),
            // extends was lifted into the compiled template's parent
            // reference; nothing happens at its source position
            StmtKind::Extends(_) => Ok(Flow::Normal),
            StmtKind::Include {
                name,
                context,
                ignore_missing,
            } => {
                self.render_include(name, context, *ignore_missing, scope, stmt.span)?;
                Ok(Flow::Normal)
            }
            StmtKind::Import { name, alias } => {
                let module = self.load_module(name, stmt.span, scope)?;
                scope.define(alias.clone(), Value::Map(module));
                Ok(Flow::Normal)
            }
            StmtKind::FromImport { name, names } => {
                let module = self.load_module(name, stmt.span, scope)?;
                for (imported, alias) in names {
                    let value = module.get(imported).cloned().ok_or_else(|| {
                        TemplateError::name_error(
                            format!("cannot import `{imported}`: not defined by the module"),
                            Some(stmt.span),
                        )
                    })?;
                    scope.define(alias.clone().unwrap_or_else(|| imported.clone()), value);
                }
                Ok(Flow::Normal)
            }
            StmtKind::Macro(decl) => {
                let def = MacroDef::from_decl(decl, Arc::clone(scope));
                scope.define(decl.name.clone(), Value::Macro(Arc::new(def)));
                Ok(Flow::Normal)
            }
            StmtKind::Set { targets, value } => {
                let value = self.eval_expr(value, scope)?;
                if targets.len() == 1 {
                    self.assign(&targets[0], value, scope, stmt.span)?;
                } else {
                    let items = match value {
                        Value::List(items) if items.len() == targets.len() => items,
                        Value::List(items) => {
                            return Err(TemplateError::type_error(
                                format!(
                                    "cannot unpack {} values into {} targets",
                                    items.len(),
                                    targets.len()
                                ),
                                Some(stmt.span),
                            ))
                        }
                        other => {
                            return Err(TemplateError::type_error(
                                format!("cannot unpack {} into targets", other.type_name()),
                                Some(stmt.span),
                            ))
                        }
                    };
                    for (target, item) in targets.iter().zip(items) {
                        self.assign(target, item, scope, stmt.span)?;
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::SetBlock { name, body } => {
                let (content, _) = self.capture(|r| r.render_statements(body, scope))?;
                scope.define(name.clone(), Value::SafeString(content));
                Ok(Flow::Normal)
            }
            StmtKind::CallBlock { call, body } => {
                self.render_call_block(call, body, scope)?;
                Ok(Flow::Normal)
            }
            StmtKind::With { bindings, body } => {
                let frame = Scope::child(scope);
                // right-hand sides evaluate in the enclosing scope
                for (name, expr) in bindings {
                    let value = self.eval_expr(expr, scope)?;
                    frame.define(name.clone(), value);
                }
                self.render_statements(body, &frame)
            }
            StmtKind::Do(expr) => {
                self.eval_expr(expr, scope)?;
                Ok(Flow::Normal)
            }
            StmtKind::Autoescape { enabled, body } => {
                let context = if *enabled {
                    let current = self.escape_context();
                    if current.is_active() {
                        current
                    } else {
                        EscapeContext::Html
                    }
                } else {
                    EscapeContext::None
                };
                self.escape.push(context);
                let result = self.render_statements(body, scope);
                self.escape.pop();
                result
            }
            StmtKind::FilterBlock { filters, body } => {
                let (content, _) = self.capture(|r| r.render_statements(body, scope))?;
                let mut value = Value::String(content);
                for call in filters {
                    let args = self.eval_args(&call.args, scope)?;
                    let kwargs = self.eval_kwargs(&call.kwargs, scope)?;
                    value = self.apply_filter(&call.name, &value, &args, &kwargs, call.span)?;
                }
                // the body was already escaped while rendering
                self.out.push_str(&value.to_string());
                Ok(Flow::Normal)
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Extension(node) => {
                let args = self.eval_args(&node.args, scope)?;
                let kwargs = self.eval_kwargs(&node.kwargs, scope)?;
                let body = match &node.body {
                    Some(body) => {
                        let body = Arc::clone(body);
                        let (content, _) =
                            self.capture(|r| r.render_statements(&body, scope))?;
                        Some(content)
                    }
                    None => None,
                };
                let result = (node.eval)(&args, &kwargs, body.as_deref())
                    .map_err(|e| TemplateError::extension(&node.name, &node.tag, e))?;
                self.write_value(&result, stmt.span)?;
                Ok(Flow::Normal)
            }
        }
    }

    /// Dispatch a block statement: under inheritance the most derived
    /// definition wins; otherwise the local body renders.
    fn render_block(
        &mut self,
        name: &str,
        local_body: &Arc<Vec<Stmt>>,
        scope: &Arc<Scope>,
    ) -> Result<Flow, TemplateError> {
        let resolved = self
            .hierarchy
            .as_ref()
            .and_then(|h| h.blocks.get(name))
            .and_then(|bodies| bodies.first())
            .map(Arc::clone);
        let body = resolved.unwrap_or_else(|| Arc::clone(local_body));

        self.block_stack.push((name.to_string(), 0));
        let frame = Scope::child(scope);
        let result = self.render_statements(&body, &frame);
        self.block_stack.pop();
        result
    }

    fn render_include(
        &mut self,
        name: &Expr,
        context: &IncludeContext,
        ignore_missing: bool,
        scope: &Arc<Scope>,
        span: Span,
    ) -> Result<(), TemplateError> {
        let name_value = self.eval_expr(name, scope)?;
        let Some(template_name) = name_value.as_str() else {
            return Err(TemplateError::type_error(
                format!(
                    "include expects a template name string, got {}",
                    name_value.type_name()
                ),
                Some(name.span),
            ));
        };

        let template = match self.env.get_template(template_name) {
            Ok(template) => template,
            Err(TemplateError::NotFound { .. }) if ignore_missing => return Ok(()),
            Err(other) => return Err(other),
        };

        let include_scope = match context {
            IncludeContext::Inherit => Scope::child(scope),
            IncludeContext::Explicit(expr) => {
                let value = self.eval_expr(expr, scope)?;
                match value {
                    Value::Map(map) => Scope::with_bindings(
                        map.into_iter().collect::<HashMap<String, Value>>(),
                    ),
                    other => {
                        return Err(TemplateError::type_error(
                            format!(
                                "include context must be a mapping, got {}",
                                other.type_name()
                            ),
                            Some(expr.span),
                        ))
                    }
                }
            }
        };

        self.enter(span)?;
        let result = self.render_compiled(&template, &include_scope);
        self.leave();
        result
    }

    /// Execute a template as a module against an empty scope and
    /// return its top-level bindings.
    fn load_module(
        &mut self,
        name: &Expr,
        span: Span,
        scope: &Arc<Scope>,
    ) -> Result<IndexMap<String, Value>, TemplateError> {
        let name_value = self.eval_expr(name, scope)?;
        let Some(template_name) = name_value.as_str() else {
            return Err(TemplateError::type_error(
                format!(
                    "import expects a template name string, got {}",
                    name_value.type_name()
                ),
                Some(name.span),
            ));
        };
        let template = self.env.get_template(template_name)?;

        let module_scope = Scope::new();
        self.enter(span)?;
        let result = self.capture(|r| r.render_statements(&template.ast, &module_scope));
        self.leave();
        result?;

        let mut module: IndexMap<String, Value> = IndexMap::new();
        for (key, value) in module_scope.local_bindings() {
            module.insert(key, value);
        }
        Ok(module)
    }

    fn render_call_block(
        &mut self,
        call: &Expr,
        body: &Arc<Vec<Stmt>>,
        scope: &Arc<Scope>,
    ) -> Result<(), TemplateError> {
        let ExprKind::Call {
            callee,
            args,
            kwargs,
        } = &call.kind
        else {
            return Err(TemplateError::syntax(
                "`call` expects a macro invocation",
                call.span,
            ));
        };

        let callee_value = self.eval_expr(callee, scope)?;
        let Value::Macro(def) = callee_value else {
            return Err(TemplateError::type_error(
                format!(
                    "`call` target must be a macro, got {}",
                    callee_value.type_name()
                ),
                Some(call.span),
            ));
        };

        let args = self.eval_args(args, scope)?;
        let kwargs = self.eval_kwargs(kwargs, scope)?;
        let caller = MacroDef::caller(Arc::clone(body), Arc::clone(scope));
        let rendered = self.invoke_macro(
            &def,
            &args,
            &kwargs,
            Some(Value::Macro(Arc::new(caller))),
            call.span,
        )?;
        self.write_value(&rendered, call.span)
    }

    // ========================================================================
    // Loops
    // ========================================================================

    /// Materialize an iterable. With multiple targets a mapping yields
    /// `[key, value]` pairs; with one target it yields keys.
    fn iter_items(
        &self,
        iterable: &Value,
        target_count: usize,
        span: Span,
    ) -> Result<Vec<Value>, TemplateError> {
        match iterable {
            Value::List(items) => Ok(items.clone()),
            Value::Map(map) => {
                if target_count >= 2 {
                    Ok(map
                        .iter()
                        .map(|(k, v)| {
                            Value::List(vec![Value::String(k.clone()), v.clone()])
                        })
                        .collect())
                } else {
                    Ok(map.keys().map(|k| Value::String(k.clone())).collect())
                }
            }
            Value::String(s) | Value::SafeString(s) => {
                Ok(s.chars().map(|c| Value::String(c.to_string())).collect())
            }
            Value::Undefined(name) => Err(TemplateError::undefined(name.clone(), Some(span))),
            other => Err(TemplateError::type_error(
                format!("{} is not iterable", other.type_name()),
                Some(span),
            )),
        }
    }

    /// Apply a loop header's `if` clause per element.
    fn filter_loop_items(
        &mut self,
        items: Vec<Value>,
        targets: &[String],
        cond: Option<&Expr>,
        scope: &Arc<Scope>,
        span: Span,
    ) -> Result<Vec<Value>, TemplateError> {
        let Some(cond) = cond else {
            return Ok(items);
        };
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            let probe = Scope::child(scope);
            self.bind_targets(&probe, targets, &item, span)?;
            if self.eval_expr(cond, &probe)?.is_truthy() {
                kept.push(item);
            }
        }
        Ok(kept)
    }

    fn run_loop(
        &mut self,
        items: Vec<Value>,
        targets: &[String],
        body: &[Stmt],
        scope: &Arc<Scope>,
        depth0: usize,
        span: Span,
    ) -> Result<(), TemplateError> {
        self.loops.push(LoopState::new(items, depth0));
        let result = self.run_loop_inner(targets, body, scope, span);
        self.loops.pop();
        result
    }

    fn run_loop_inner(
        &mut self,
        targets: &[String],
        body: &[Stmt],
        scope: &Arc<Scope>,
        span: Span,
    ) -> Result<(), TemplateError> {
        let count = self.loops.last().expect("loop state pushed").len();
        for index in 0..count {
            let state = self.loops.last_mut().expect("loop state pushed");
            state.set_index0(index);
            let item = state.items()[index].clone();
            let descriptor = state.descriptor();

            let frame = Scope::child(scope);
            self.bind_targets(&frame, targets, &item, span)?;
            frame.define("loop", descriptor);

            match self.render_statements(body, &frame)? {
                Flow::Break => break,
                Flow::Continue | Flow::Normal => {}
            }
        }
        Ok(())
    }

    /// Bind loop targets, unpacking position-by-position for multiple
    /// targets.
    fn bind_targets(
        &self,
        frame: &Arc<Scope>,
        targets: &[String],
        item: &Value,
        span: Span,
    ) -> Result<(), TemplateError> {
        if targets.len() == 1 {
            frame.define(targets[0].clone(), item.clone());
            return Ok(());
        }
        match item {
            Value::List(parts) if parts.len() == targets.len() => {
                for (target, part) in targets.iter().zip(parts) {
                    frame.define(target.clone(), part.clone());
                }
                Ok(())
            }
            Value::List(parts) => Err(TemplateError::type_error(
                format!(
                    "cannot unpack {} values into {} loop variables",
                    parts.len(),
                    targets.len()
                ),
                Some(span),
            )),
            other => Err(TemplateError::type_error(
                format!("cannot unpack {} into loop variables", other.type_name()),
                Some(span),
            )),
        }
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    fn assign(
        &mut self,
        target: &AssignTarget,
        value: Value,
        scope: &Arc<Scope>,
        span: Span,
    ) -> Result<(), TemplateError> {
        match target {
            AssignTarget::Name(name) => {
                scope.define(name.clone(), value);
                Ok(())
            }
            AssignTarget::Attr { obj, name } => {
                let host = self.eval_expr(obj, scope)?;
                match host {
                    Value::Namespace(ns) => {
                        ns.set(name.clone(), value);
                        Ok(())
                    }
                    other => Err(TemplateError::type_error(
                        format!(
                            "can only assign attributes on namespace objects, got {}",
                            other.type_name()
                        ),
                        Some(span),
                    )),
                }
            }
            AssignTarget::Index { obj, key } => {
                let host = self.eval_expr(obj, scope)?;
                let key = self.eval_expr(key, scope)?;
                match (host, key.as_str()) {
                    (Value::Namespace(ns), Some(attr)) => {
                        ns.set(attr.to_string(), value);
                        Ok(())
                    }
                    (other, _) => Err(TemplateError::type_error(
                        format!(
                            "item assignment needs a namespace and string key, got {}",
                            other.type_name()
                        ),
                        Some(span),
                    )),
                }
            }
        }
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Write an expression result into the output buffer, honoring the
    /// undefined policy and the active escape context.
    fn write_value(&mut self, value: &Value, span: Span) -> Result<(), TemplateError> {
        match value {
            Value::Undefined(name) => match self.env.config().undefined {
                UndefinedPolicy::Silent => Ok(()),
                UndefinedPolicy::Strict => {
                    Err(TemplateError::undefined(name.clone(), Some(span)))
                }
                UndefinedPolicy::Debug => {
                    self.out.push_str(&format!("[undefined: {name}]"));
                    Ok(())
                }
            },
            Value::SafeString(s) => {
                self.out.push_str(s);
                Ok(())
            }
            Value::None => Ok(()),
            other => {
                let text = other.to_string();
                let context = self.escape_context();
                if context.is_active() {
                    self.out.push_str(&context.escape(&text));
                } else {
                    self.out.push_str(&text);
                }
                Ok(())
            }
        }
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval_args(
        &mut self,
        args: &[Expr],
        scope: &Arc<Scope>,
    ) -> Result<Vec<Value>, TemplateError> {
        args.iter().map(|a| self.eval_expr(a, scope)).collect()
    }

    fn eval_kwargs(
        &mut self,
        kwargs: &[(String, Expr)],
        scope: &Arc<Scope>,
    ) -> Result<Kwargs, TemplateError> {
        let mut out = Kwargs::new();
        for (name, expr) in kwargs {
            out.insert(name.clone(), self.eval_expr(expr, scope)?);
        }
        Ok(out)
    }

    fn eval_expr(&mut self, expr: &Expr, scope: &Arc<Scope>) -> Result<Value, TemplateError> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Literal(value) => Ok(value.clone()),
            ExprKind::Ident(name) => Ok(scope
                .get(name)
                .or_else(|| self.env.global(name))
                .unwrap_or_else(|| Value::undefined(name.clone()))),
            ExprKind::Attr { obj, name } => {
                let host = self.eval_expr(obj, scope)?;
                if let Value::Undefined(base) = &host {
                    return self.chained_undefined(base, name, span);
                }
                Ok(host
                    .get_attr(name)
                    .unwrap_or_else(|| Value::undefined(name.clone())))
            }
            ExprKind::Index { obj, key } => {
                let host = self.eval_expr(obj, scope)?;
                let key = self.eval_expr(key, scope)?;
                if let Value::Undefined(base) = &host {
                    return self.chained_undefined(base, &key.repr(), span);
                }
                Ok(host
                    .get_item(&key)
                    .unwrap_or_else(|| Value::undefined(key.repr())))
            }
            ExprKind::Slice {
                obj,
                start,
                stop,
                step,
            } => {
                let host = self.eval_expr(obj, scope)?;
                let start = self.eval_slice_bound(start.as_deref(), scope)?;
                let stop = self.eval_slice_bound(stop.as_deref(), scope)?;
                let step = self.eval_slice_bound(step.as_deref(), scope)?;
                slice_value(&host, start, stop, step, span)
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval_expr(operand, scope)?;
                eval_unary(*op, &value, span)
            }
            ExprKind::Binary { op, left, right } => {
                // and/or are short-circuit and return the operand value
                match op {
                    BinaryOp::And => {
                        let l = self.eval_expr(left, scope)?;
                        if !l.is_truthy() {
                            return Ok(l);
                        }
                        return self.eval_expr(right, scope);
                    }
                    BinaryOp::Or => {
                        let l = self.eval_expr(left, scope)?;
                        if l.is_truthy() {
                            return Ok(l);
                        }
                        return self.eval_expr(right, scope);
                    }
                    _ => {}
                }
                let l = self.eval_expr(left, scope)?;
                let r = self.eval_expr(right, scope)?;
                eval_binary(*op, &l, &r, span)
            }
            ExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if self.eval_expr(cond, scope)?.is_truthy() {
                    self.eval_expr(then, scope)
                } else {
                    match otherwise {
                        Some(other) => self.eval_expr(other, scope),
                        None => Ok(Value::None),
                    }
                }
            }
            ExprKind::Filter {
                value,
                name,
                args,
                kwargs,
            } => {
                let input = self.eval_expr(value, scope)?;
                let args = self.eval_args(args, scope)?;
                let kwargs = self.eval_kwargs(kwargs, scope)?;
                self.apply_filter(name, &input, &args, &kwargs, span)
            }
            ExprKind::Test {
                value,
                name,
                args,
                negated,
            } => {
                let input = self.eval_expr(value, scope)?;
                let args = self.eval_args(args, scope)?;
                let result = self.apply_test(name, &input, &args, span)?;
                Ok(Value::Bool(result != *negated))
            }
            ExprKind::Call {
                callee,
                args,
                kwargs,
            } => self.eval_call(callee, args, kwargs, scope, span),
            ExprKind::List(elements) => Ok(Value::List(self.eval_args(elements, scope)?)),
            ExprKind::Dict(pairs) => {
                let mut map = IndexMap::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key_value = self.eval_expr(key, scope)?;
                    let key = dict_key(&key_value, key.span)?;
                    map.insert(key, self.eval_expr(value, scope)?);
                }
                Ok(Value::Map(map))
            }
            ExprKind::Comprehension {
                key,
                value,
                targets,
                iter,
                cond,
                is_dict,
            } => {
                let iterable = self.eval_expr(iter, scope)?;
                let items = self.iter_items(&iterable, targets.len(), iter.span)?;

                let mut list_out = Vec::new();
                let mut map_out = IndexMap::new();
                for item in items {
                    let frame = Scope::child(scope);
                    self.bind_targets(&frame, targets, &item, span)?;
                    if let Some(cond) = cond {
                        if !self.eval_expr(cond, &frame)?.is_truthy() {
                            continue;
                        }
                    }
                    if *is_dict {
                        let key_expr = key.as_ref().expect("dict comprehension has a key");
                        let key_value = self.eval_expr(key_expr, &frame)?;
                        let key = dict_key(&key_value, key_expr.span)?;
                        map_out.insert(key, self.eval_expr(value, &frame)?);
                    } else {
                        list_out.push(self.eval_expr(value, &frame)?);
                    }
                }
                Ok(if *is_dict {
                    Value::Map(map_out)
                } else {
                    Value::List(list_out)
                })
            }
            ExprKind::Super => self.eval_super(scope, span),
        }
    }

    /// Attribute or index access on an undefined base: strict raises,
    /// otherwise the undefined chains.
    fn chained_undefined(
        &self,
        base: &str,
        segment: &str,
        span: Span,
    ) -> Result<Value, TemplateError> {
        if self.env.config().undefined == UndefinedPolicy::Strict {
            Err(TemplateError::undefined(base, Some(span)))
        } else {
            Ok(Value::undefined(format!("{base}.{segment}")))
        }
    }

    fn eval_slice_bound(
        &mut self,
        bound: Option<&Expr>,
        scope: &Arc<Scope>,
    ) -> Result<Option<i64>, TemplateError> {
        match bound {
            None => Ok(None),
            Some(expr) => {
                let value = self.eval_expr(expr, scope)?;
                match value.as_int() {
                    Some(n) => Ok(Some(n)),
                    None => Err(TemplateError::type_error(
                        format!("slice bounds must be integers, got {}", value.type_name()),
                        Some(expr.span),
                    )),
                }
            }
        }
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        scope: &Arc<Scope>,
        span: Span,
    ) -> Result<Value, TemplateError> {
        // loop(...) re-enters the innermost recursive loop body
        if let ExprKind::Ident(name) = &callee.kind {
            if name == "loop" && scope.contains("loop") {
                return self.eval_loop_recursion(args, kwargs, scope, span);
            }
        }
        // loop.cycle(...) / loop.changed(...) dispatch on live state
        if let ExprKind::Attr { obj, name } = &callee.kind {
            if matches!(&obj.kind, ExprKind::Ident(base) if base == "loop")
                && scope.contains("loop")
                && !self.loops.is_empty()
            {
                match name.as_str() {
                    "cycle" => {
                        let args = self.eval_args(args, scope)?;
                        return self
                            .loops
                            .last()
                            .expect("loops checked non-empty")
                            .cycle(&args);
                    }
                    "changed" => {
                        let args = self.eval_args(args, scope)?;
                        let changed = self
                            .loops
                            .last_mut()
                            .expect("loops checked non-empty")
                            .changed(&args);
                        return Ok(Value::Bool(changed));
                    }
                    _ => {}
                }
            }
        }

        let callee_value = self.eval_expr(callee, scope)?;
        let args = self.eval_args(args, scope)?;
        let kwargs = self.eval_kwargs(kwargs, scope)?;
        match callee_value {
            Value::Callable(callable) => callable.call(&args, &kwargs),
            Value::Macro(def) => self.invoke_macro(&def, &args, &kwargs, None, span),
            Value::Undefined(name) => Err(TemplateError::name_error(
                format!("`{name}` is not a known function or macro"),
                Some(span),
            )),
            other => Err(TemplateError::type_error(
                format!("{} is not callable", other.type_name()),
                Some(span),
            )),
        }
    }

    fn eval_loop_recursion(
        &mut self,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        scope: &Arc<Scope>,
        span: Span,
    ) -> Result<Value, TemplateError> {
        let Some(rl) = self.recursive.last().cloned() else {
            return Err(TemplateError::type_error(
                "loop() requires a loop marked `recursive`",
                Some(span),
            ));
        };
        if args.len() != 1 || !kwargs.is_empty() {
            return Err(TemplateError::type_error(
                "loop() takes exactly one iterable argument",
                Some(span),
            ));
        }
        let iterable = self.eval_expr(&args[0], scope)?;
        let items = self.iter_items(&iterable, rl.targets.len(), span)?;
        let items = self.filter_loop_items(items, &rl.targets, rl.cond.as_ref(), scope, span)?;
        let depth0 = self.loops.last().map(|l| l.depth0() + 1).unwrap_or(0);

        self.enter(span)?;
        let result = self.capture(|r| {
            r.run_loop(items, &rl.targets, &rl.body, scope, depth0, span)
        });
        self.leave();
        let (content, ()) = result?;
        Ok(Value::SafeString(content))
    }

    fn eval_super(&mut self, scope: &Arc<Scope>, span: Span) -> Result<Value, TemplateError> {
        let Some((name, level)) = self.block_stack.last().cloned() else {
            return Err(TemplateError::inheritance(
                "super() is only valid inside a block",
                Some(span),
            ));
        };
        let bodies = self
            .hierarchy
            .as_ref()
            .and_then(|h| h.blocks.get(&name))
            .cloned()
            .unwrap_or_default();
        let next = level + 1;
        if next >= bodies.len() {
            return Err(TemplateError::inheritance(
                format!("block `{name}` has no parent definition to super() into"),
                Some(span),
            ));
        }

        if let Some(cached) = self.super_cache.get(&(name.clone(), next)) {
            return Ok(Value::SafeString(cached.clone()));
        }

        let body = Arc::clone(&bodies[next]);
        self.enter(span)?;
        self.block_stack.push((name.clone(), next));
        let frame = Scope::child(scope);
        let result = self.capture(|r| r.render_statements(&body, &frame));
        self.block_stack.pop();
        self.leave();
        let (content, _) = result?;

        self.super_cache.insert((name, next), content.clone());
        Ok(Value::SafeString(content))
    }

    fn invoke_macro(
        &mut self,
        def: &Arc<MacroDef>,
        args: &[Value],
        kwargs: &Kwargs,
        caller: Option<Value>,
        span: Span,
    ) -> Result<Value, TemplateError> {
        self.enter(span)?;
        let defining_scope = Arc::clone(&def.scope);
        let bound = bind_arguments(def, args, kwargs, |expr| {
            self.eval_expr(expr, &defining_scope)
        });
        let bound = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.leave();
                return Err(e);
            }
        };

        let frame = Scope::child(&def.scope);
        for (name, value) in bound {
            frame.define(name, value);
        }
        if let Some(caller) = caller {
            frame.define("caller", caller);
        }

        let body = Arc::clone(&def.body);
        let result = self.capture(|r| r.render_statements(&body, &frame));
        self.leave();
        let (content, _) = result?;
        Ok(Value::SafeString(content))
    }

    fn apply_filter(
        &mut self,
        name: &str,
        value: &Value,
        args: &[Value],
        kwargs: &Kwargs,
        span: Span,
    ) -> Result<Value, TemplateError> {
        let Some(filter) = self.env.filter(name) else {
            let names = self.env.filter_names();
            let suggestion = closest_name(name, names.iter().map(String::as_str));
            return Err(TemplateError::name_error_with_suggestion(
                format!("unknown filter `{name}`"),
                suggestion,
                Some(span),
            ));
        };
        let state = FilterState {
            env: self.env,
            autoescape: self.escape_context(),
        };
        filter(value, args, kwargs, &state)
    }

    fn apply_test(
        &mut self,
        name: &str,
        value: &Value,
        args: &[Value],
        span: Span,
    ) -> Result<bool, TemplateError> {
        let Some(test) = self.env.test(name) else {
            let names = self.env.test_names();
            let suggestion = closest_name(name, names.iter().map(String::as_str));
            return Err(TemplateError::name_error_with_suggestion(
                format!("unknown test `{name}`"),
                suggestion,
                Some(span),
            ));
        };
        test(value, args)
    }
}

// ============================================================================
// Operator semantics
// ============================================================================

fn undefined_operand(value: &Value, span: Span) -> Option<TemplateError> {
    match value {
        Value::Undefined(name) => Some(TemplateError::undefined(name.clone(), Some(span))),
        _ => None,
    }
}

fn eval_unary(op: UnaryOp, value: &Value, span: Span) -> Result<Value, TemplateError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
        UnaryOp::Neg => {
            if let Some(err) = undefined_operand(value, span) {
                return Err(err);
            }
            match value {
                Value::Int(n) => n
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| TemplateError::math_error("integer overflow", Some(span))),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(TemplateError::type_error(
                    format!("cannot negate {}", other.type_name()),
                    Some(span),
                )),
            }
        }
        UnaryOp::Pos => match value {
            Value::Int(_) | Value::Float(_) => Ok(value.clone()),
            other => Err(TemplateError::type_error(
                format!("unary `+` needs a number, got {}", other.type_name()),
                Some(span),
            )),
        },
    }
}

fn eval_binary(op: BinaryOp, l: &Value, r: &Value, span: Span) -> Result<Value, TemplateError> {
    // equality tolerates any operand types, including undefined
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(l == r)),
        BinaryOp::Ne => return Ok(Value::Bool(l != r)),
        _ => {}
    }
    if let Some(err) = undefined_operand(l, span).or_else(|| undefined_operand(r, span)) {
        return Err(err);
    }

    match op {
        BinaryOp::Add => eval_add(l, r, span),
        BinaryOp::Sub => numeric_op(l, r, span, "-", |a, b| a.checked_sub(b), |a, b| a - b),
        BinaryOp::Mul => eval_mul(l, r, span),
        BinaryOp::Div => {
            let (a, b) = float_operands(l, r, span, "/")?;
            if b == 0.0 {
                return Err(TemplateError::math_error("division by zero", Some(span)));
            }
            Ok(Value::Float(a / b))
        }
        BinaryOp::FloorDiv => match (l, r) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err(TemplateError::math_error("division by zero", Some(span)));
                }
                Ok(Value::Int(floor_div(*a, *b)))
            }
            _ => {
                let (a, b) = float_operands(l, r, span, "//")?;
                if b == 0.0 {
                    return Err(TemplateError::math_error("division by zero", Some(span)));
                }
                Ok(Value::Float((a / b).floor()))
            }
        },
        BinaryOp::Rem => match (l, r) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err(TemplateError::math_error("modulo by zero", Some(span)));
                }
                Ok(Value::Int(floor_mod(*a, *b)))
            }
            _ => {
                let (a, b) = float_operands(l, r, span, "%")?;
                if b == 0.0 {
                    return Err(TemplateError::math_error("modulo by zero", Some(span)));
                }
                Ok(Value::Float(a - b * (a / b).floor()))
            }
        },
        BinaryOp::Pow => eval_pow(l, r, span),
        BinaryOp::Concat => {
            let text = format!("{l}{r}");
            Ok(if l.is_safe() && r.is_safe() {
                Value::SafeString(text)
            } else {
                Value::String(text)
            })
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let Some(ord) = l.try_cmp(r) else {
                return Err(TemplateError::type_error(
                    format!("cannot order {} and {}", l.type_name(), r.type_name()),
                    Some(span),
                ));
            };
            let result = match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::In | BinaryOp::NotIn => {
            let Some(found) = r.contains(l) else {
                return Err(TemplateError::type_error(
                    format!("`in` needs a container, got {}", r.type_name()),
                    Some(span),
                ));
            };
            Ok(Value::Bool(found == (op == BinaryOp::In)))
        }
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => {
            unreachable!("handled before operand checks")
        }
    }
}

fn eval_add(l: &Value, r: &Value, span: Span) -> Result<Value, TemplateError> {
    match (l, r) {
        (Value::String(_) | Value::SafeString(_), Value::String(_) | Value::SafeString(_)) => {
            Err(TemplateError::type_error(
                "cannot add strings; use `~` for concatenation",
                Some(span),
            ))
        }
        (Value::List(a), Value::List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(Value::List(out))
        }
        _ => numeric_op(l, r, span, "+", |a, b| a.checked_add(b), |a, b| a + b),
    }
}

fn eval_mul(l: &Value, r: &Value, span: Span) -> Result<Value, TemplateError> {
    match (l, r) {
        (Value::String(s) | Value::SafeString(s), Value::Int(n))
        | (Value::Int(n), Value::String(s) | Value::SafeString(s)) => {
            let count = (*n).max(0) as usize;
            Ok(Value::String(s.repeat(count)))
        }
        _ => numeric_op(l, r, span, "*", |a, b| a.checked_mul(b), |a, b| a * b),
    }
}

fn eval_pow(l: &Value, r: &Value, span: Span) -> Result<Value, TemplateError> {
    match (l, r) {
        (Value::Int(base), Value::Int(exp)) if *exp >= 0 => {
            let exp = u32::try_from(*exp)
                .map_err(|_| TemplateError::math_error("integer overflow in `**`", Some(span)))?;
            base.checked_pow(exp)
                .map(Value::Int)
                .ok_or_else(|| TemplateError::math_error("integer overflow in `**`", Some(span)))
        }
        _ => {
            let (a, b) = float_operands(l, r, span, "**")?;
            Ok(Value::Float(a.powf(b)))
        }
    }
}

/// Integer arithmetic stays integer; any float operand promotes.
fn numeric_op(
    l: &Value,
    r: &Value,
    span: Span,
    op: &str,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, TemplateError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
            .map(Value::Int)
            .ok_or_else(|| TemplateError::math_error(format!("integer overflow in `{op}`"), Some(span))),
        _ => {
            let (a, b) = float_operands(l, r, span, op)?;
            Ok(Value::Float(float_op(a, b)))
        }
    }
}

fn float_operands(
    l: &Value,
    r: &Value,
    span: Span,
    op: &str,
) -> Result<(f64, f64), TemplateError> {
    match (l.as_float(), r.as_float()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(TemplateError::type_error(
            format!(
                "`{op}` needs numeric operands, got {} and {}",
                l.type_name(),
                r.type_name()
            ),
            Some(span),
        )),
    }
}

/// Python-style floor division: rounds toward negative infinity.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Python-style modulo: the result takes the divisor's sign.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

/// Dictionary keys must be scalar; non-strings coerce to their output
/// form.
fn dict_key(value: &Value, span: Span) -> Result<String, TemplateError> {
    match value {
        Value::String(s) | Value::SafeString(s) => Ok(s.clone()),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(value.to_string()),
        other => Err(TemplateError::type_error(
            format!("dict keys must be scalar, got {}", other.type_name()),
            Some(span),
        )),
    }
}

/// Python slice semantics: negative indices count from the end,
/// negative steps walk backwards, bounds clamp.
fn slice_value(
    value: &Value,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
    span: Span,
) -> Result<Value, TemplateError> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(TemplateError::type_error("slice step cannot be zero", Some(span)));
    }

    match value {
        Value::List(items) => {
            let indices = slice_indices(items.len(), start, stop, step);
            Ok(Value::List(
                indices.into_iter().map(|i| items[i].clone()).collect(),
            ))
        }
        Value::String(s) | Value::SafeString(s) => {
            let chars: Vec<char> = s.chars().collect();
            let indices = slice_indices(chars.len(), start, stop, step);
            Ok(Value::String(indices.into_iter().map(|i| chars[i]).collect()))
        }
        Value::Undefined(name) => Err(TemplateError::undefined(name.clone(), Some(span))),
        other => Err(TemplateError::type_error(
            format!("cannot slice {}", other.type_name()),
            Some(span),
        )),
    }
}

fn slice_indices(len: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let clamp = |idx: i64, upper: i64| -> i64 {
        let idx = if idx < 0 { idx + len } else { idx };
        idx.clamp(if step < 0 { -1 } else { 0 }, upper)
    };

    let (mut current, stop) = if step > 0 {
        (
            start.map_or(0, |s| clamp(s, len)),
            stop.map_or(len, |s| clamp(s, len)),
        )
    } else {
        (
            start.map_or(len - 1, |s| clamp(s, len - 1)),
            stop.map_or(-1, |s| clamp(s, len - 1)),
        )
    };

    let mut out = Vec::new();
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        out.push(current as usize);
        current += step;
    }
    out
}
