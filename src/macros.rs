// ABOUTME: Runtime macro values and the argument-binding protocol

use crate::ast::{Expr, MacroDecl, Stmt};
use crate::error::TemplateError;
use crate::scope::Scope;
use crate::value::{Kwargs, Value};
use std::sync::Arc;

/// A macro as a callable value: the parsed definition plus the frame
/// it was defined in. The frame is captured by handle, so the macro
/// body observes later mutations to its defining scope.
#[derive(Debug)]
pub struct MacroDef {
    pub name: String,
    pub params: Vec<(String, Option<Expr>)>,
    pub body: Arc<Vec<Stmt>>,
    pub scope: Arc<Scope>,
}

impl MacroDef {
    pub fn from_decl(decl: &MacroDecl, scope: Arc<Scope>) -> Self {
        Self {
            name: decl.name.clone(),
            params: decl.params.clone(),
            body: Arc::clone(&decl.body),
            scope,
        }
    }

    /// A synthetic zero-parameter macro, used for the `caller` binding
    /// of call blocks.
    pub fn caller(body: Arc<Vec<Stmt>>, scope: Arc<Scope>) -> Self {
        Self {
            name: "caller".to_string(),
            params: Vec::new(),
            body,
            scope,
        }
    }
}

/// Bind call arguments against a macro's parameter list: positional by
/// position, then keyword into the remaining parameters, then defaults.
/// Returns `(name, value)` pairs in parameter order.
///
/// Default expressions are evaluated on demand through `eval_default`,
/// against the macro's defining scope.
pub fn bind_arguments<F>(
    def: &MacroDef,
    args: &[Value],
    kwargs: &Kwargs,
    mut eval_default: F,
) -> Result<Vec<(String, Value)>, TemplateError>
where
    F: FnMut(&Expr) -> Result<Value, TemplateError>,
{
    let params = &def.params;
    if args.len() > params.len() {
        return Err(TemplateError::type_error(
            format!(
                "`{}` takes at most {} argument{}, got {}",
                def.name,
                params.len(),
                if params.len() == 1 { "" } else { "s" },
                args.len()
            ),
            None,
        ));
    }

    let mut bound: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, value) in bound.iter_mut().zip(args.iter()) {
        *slot = Some(value.clone());
    }

    for (name, value) in kwargs {
        let position = params.iter().position(|(p, _)| p == name);
        match position {
            Some(i) => {
                if bound[i].is_some() {
                    return Err(TemplateError::type_error(
                        format!("`{}` got multiple values for argument `{}`", def.name, name),
                        None,
                    ));
                }
                bound[i] = Some(value.clone());
            }
            None => {
                return Err(TemplateError::type_error(
                    format!("`{}` got an unexpected keyword argument `{}`", def.name, name),
                    None,
                ));
            }
        }
    }

    let mut out = Vec::with_capacity(params.len());
    for ((name, default), slot) in params.iter().zip(bound) {
        let value = match slot {
            Some(v) => v,
            None => match default {
                Some(expr) => eval_default(expr)?,
                None => {
                    return Err(TemplateError::type_error(
                        format!("`{}` missing required argument `{}`", def.name, name),
                        None,
                    ));
                }
            },
        };
        out.push((name.clone(), value));
    }
    Ok(out)
}
