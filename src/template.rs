// ABOUTME: Compiled templates: the immutable post-parse representation
// held by the environment's compile cache

use crate::ast::{Expr, ExprKind, MacroDecl, Stmt, StmtKind};
use crate::config::EngineConfig;
use crate::error::TemplateError;
use crate::extensions::ExtensionRegistry;
use crate::loader::Version;
use crate::parser::parse_template;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A parsed template, immutable once built: the root statement list,
/// the parent reference from `extends` (if any), the block table, and
/// the top-level macro table.
#[derive(Debug)]
pub struct CompiledTemplate {
    pub name: String,
    pub ast: Vec<Stmt>,
    /// The `extends` target expression; a literal string in the
    /// common, cacheable case
    pub parent: Option<Expr>,
    pub blocks: HashMap<String, Arc<Vec<Stmt>>>,
    pub macros: Vec<Arc<MacroDecl>>,
    /// Loader freshness token; `None` for literal-string templates
    pub version: Option<Version>,
}

impl CompiledTemplate {
    pub(crate) fn compile(
        name: impl Into<String>,
        source: &str,
        config: &EngineConfig,
        extensions: Option<&ExtensionRegistry>,
        version: Option<Version>,
    ) -> Result<Self, TemplateError> {
        let ast = parse_template(source, config, extensions)?;

        let mut parent = None;
        let mut macros = Vec::new();
        for stmt in &ast {
            match &stmt.kind {
                StmtKind::Extends(expr) => {
                    if parent.is_some() {
                        return Err(TemplateError::syntax(
                            "a template may only extend one parent",
                            stmt.span,
                        ));
                    }
                    parent = Some(expr.clone());
                }
                StmtKind::Macro(decl) => macros.push(Arc::clone(decl)),
                _ => {}
            }
        }

        let mut blocks = HashMap::new();
        collect_blocks(&ast, &mut blocks)?;

        Ok(Self {
            name: name.into(),
            ast,
            parent,
            blocks,
            macros,
            version,
        })
    }

    /// The parent template name when `extends` targets a literal
    /// string; dynamic targets resolve per render.
    pub fn literal_parent(&self) -> Option<&str> {
        match &self.parent {
            Some(Expr {
                kind: ExprKind::Literal(Value::String(name)),
                ..
            }) => Some(name),
            _ => None,
        }
    }
}

/// Walk statement bodies collecting named blocks, rejecting duplicates.
fn collect_blocks(
    stmts: &[Stmt],
    blocks: &mut HashMap<String, Arc<Vec<Stmt>>>,
) -> Result<(), TemplateError> {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::Block { name, body } => {
                if blocks.insert(name.clone(), Arc::clone(body)).is_some() {
                    return Err(TemplateError::syntax(
                        format!("block `{name}` defined twice"),
                        stmt.span,
                    ));
                }
                collect_blocks(body, blocks)?;
            }
            StmtKind::If { arms, else_body } => {
                for (_, body) in arms {
                    collect_blocks(body, blocks)?;
                }
                collect_blocks(else_body, blocks)?;
            }
            StmtKind::For {
                body, else_body, ..
            } => {
                collect_blocks(body, blocks)?;
                collect_blocks(else_body, blocks)?;
            }
            StmtKind::With { body, .. }
            | StmtKind::Autoescape { body, .. }
            | StmtKind::FilterBlock { body, .. } => {
                collect_blocks(body, blocks)?;
            }
            _ => {}
        }
    }
    Ok(())
}
