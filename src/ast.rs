// ABOUTME: AST node definitions produced by the parser and walked by the evaluator

use crate::extensions::ExtensionNode;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Source position carried by every token and AST node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `not`
    Not,
    /// Unary `-`
    Neg,
    /// Unary `+`
    Pos,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOp::Not => "not",
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
    /// String concatenation `~`
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Rem => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Concat => "~",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        })
    }
}

/// An expression node; evaluation produces a `Value`.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Value),
    Ident(String),
    Attr {
        obj: Box<Expr>,
        name: String,
    },
    Index {
        obj: Box<Expr>,
        key: Box<Expr>,
    },
    Slice {
        obj: Box<Expr>,
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `then if cond else otherwise`; a missing else arm yields none
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    /// `value | name(args, kw=...)`
    Filter {
        value: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    /// `value is [not] name(args)`
    Test {
        value: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        negated: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    /// `[expr for x in seq if cond]` / `{k: v for x in seq}`
    Comprehension {
        key: Option<Box<Expr>>,
        value: Box<Expr>,
        targets: Vec<String>,
        iter: Box<Expr>,
        cond: Option<Box<Expr>>,
        is_dict: bool,
    },
    /// `super()` inside an overriding block body
    Super,
}

/// A macro definition as parsed: parameters with optional default
/// expressions, and the body. Shared so the macro table and runtime
/// macro values reference the same parse.
#[derive(Debug)]
pub struct MacroDecl {
    pub name: String,
    pub params: Vec<(String, Option<Expr>)>,
    pub body: Arc<Vec<Stmt>>,
    pub span: Span,
}

/// The left-hand side of a `set` assignment.
#[derive(Debug, Clone)]
pub enum AssignTarget {
    Name(String),
    /// `ns.attr = ...`; mutates the namespace in place
    Attr { obj: Expr, name: String },
    /// `obj[key] = ...`
    Index { obj: Expr, key: Expr },
}

/// What context an included template renders against.
#[derive(Debug, Clone)]
pub enum IncludeContext {
    /// The including template's current scope (the default)
    Inherit,
    /// An explicit mapping expression: `include "x" with expr`
    Explicit(Expr),
}

/// A statement node; evaluation appends output or mutates scope.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// Literal template text, whitespace control already applied
    Text(String),
    /// `{{ expr }}`
    Output(Expr),
    If {
        /// Condition/body pairs: the `if` arm then any `elif` arms
        arms: Vec<(Expr, Vec<Stmt>)>,
        else_body: Vec<Stmt>,
    },
    For {
        targets: Vec<String>,
        iter: Expr,
        /// Per-element filter from an `if` clause in the header
        cond: Option<Expr>,
        body: Arc<Vec<Stmt>>,
        else_body: Vec<Stmt>,
        recursive: bool,
    },
    Block {
        name: String,
        body: Arc<Vec<Stmt>>,
    },
    Extends(Expr),
    Include {
        name: Expr,
        context: IncludeContext,
        ignore_missing: bool,
    },
    Import {
        name: Expr,
        alias: String,
    },
    FromImport {
        name: Expr,
        /// Imported names with optional aliases
        names: Vec<(String, Option<String>)>,
    },
    Macro(Arc<MacroDecl>),
    Set {
        targets: Vec<AssignTarget>,
        value: Expr,
    },
    /// `{% set name %}body{% endset %}`
    SetBlock {
        name: String,
        body: Vec<Stmt>,
    },
    /// `{% call macro_expr(...) %}body{% endcall %}`
    CallBlock {
        call: Expr,
        body: Arc<Vec<Stmt>>,
    },
    With {
        bindings: Vec<(String, Expr)>,
        body: Vec<Stmt>,
    },
    Do(Expr),
    Raw(String),
    Autoescape {
        enabled: bool,
        body: Vec<Stmt>,
    },
    /// `{% filter name(...) | other %}body{% endfilter %}`
    FilterBlock {
        filters: Vec<FilterCall>,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Extension(ExtensionNode),
}

/// One link of a filter chain in a `{% filter %}` block.
#[derive(Debug, Clone)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
    pub span: Span,
}
