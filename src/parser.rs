// ABOUTME: Parser turning the token stream into the template AST, with a
// precedence-climbing expression parser and extension-tag delegation

use crate::ast::{
    AssignTarget, BinaryOp, Expr, ExprKind, FilterCall, IncludeContext, MacroDecl, Span, Stmt,
    StmtKind, UnaryOp,
};
use crate::config::EngineConfig;
use crate::error::TemplateError;
use crate::extensions::ExtensionRegistry;
use crate::lexer::{tokenize, Keyword, Token, TokenKind};
use crate::value::Value;
use std::sync::Arc;

/// Parse template source into the statement list of the template root.
pub fn parse_template(
    source: &str,
    config: &EngineConfig,
    extensions: Option<&ExtensionRegistry>,
) -> Result<Vec<Stmt>, TemplateError> {
    let tokens = tokenize(source, config)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        extensions,
        loop_depth: 0,
    };
    let (stmts, end) = parser.parse_statements(&[])?;
    debug_assert!(end.is_none(), "top level has no stop tags");
    Ok(stmts)
}

pub struct Parser<'env> {
    tokens: Vec<Token>,
    pos: usize,
    extensions: Option<&'env ExtensionRegistry>,
    loop_depth: usize,
}

impl<'env> Parser<'env> {
    // ========================================================================
    // Token cursor
    // ========================================================================

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek2(&self) -> &Token {
        let idx = (self.pos + 1).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !matches!(token.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        self.eat(&TokenKind::Keyword(kw))
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Span, TemplateError> {
        let token = self.peek();
        if token.kind == kind {
            let span = token.span;
            self.advance();
            Ok(span)
        } else {
            Err(TemplateError::syntax(
                format!("expected {what}, found {}", token.kind.describe()),
                token.span,
            ))
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<Span, TemplateError> {
        self.expect(TokenKind::Keyword(kw), &format!("`{}`", kw.as_str()))
    }

    fn expect_ident(&mut self) -> Result<(String, Span), TemplateError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, token.span))
            }
            _ => Err(TemplateError::syntax(
                format!("expected an identifier, found {}", token.kind.describe()),
                token.span,
            )),
        }
    }

    fn expect_block_end(&mut self) -> Result<(), TemplateError> {
        let token = self.peek();
        if matches!(token.kind, TokenKind::BlockEnd(_)) {
            self.advance();
            Ok(())
        } else {
            Err(TemplateError::syntax(
                format!("expected `%}}`, found {}", token.kind.describe()),
                token.span,
            ))
        }
    }

    fn expect_var_end(&mut self) -> Result<(), TemplateError> {
        let token = self.peek();
        if matches!(token.kind, TokenKind::VarEnd(_)) {
            self.advance();
            Ok(())
        } else {
            Err(TemplateError::syntax(
                format!("expected `}}}}`, found {}", token.kind.describe()),
                token.span,
            ))
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Parse statements until end of input or until a `{% stop %}` tag
    /// whose word appears in `stops`. On a stop, the block-start and
    /// the stop word are consumed; the caller finishes the tag.
    fn parse_statements(
        &mut self,
        stops: &[&str],
    ) -> Result<(Vec<Stmt>, Option<String>), TemplateError> {
        let mut body = Vec::new();
        loop {
            let token = self.peek().clone();
            match token.kind {
                TokenKind::Text(text) => {
                    self.advance();
                    body.push(Stmt::new(StmtKind::Text(text), token.span));
                }
                TokenKind::VarStart(_) => {
                    self.advance();
                    let expr = self.parse_expression()?;
                    self.expect_var_end()?;
                    body.push(Stmt::new(StmtKind::Output(expr), token.span));
                }
                TokenKind::BlockStart(_) => {
                    if let Some(word) = self.stop_word_after_block_start(stops) {
                        self.advance(); // block start
                        self.advance(); // stop word
                        return Ok((body, Some(word)));
                    }
                    body.push(self.parse_block_statement()?);
                }
                TokenKind::Eof => {
                    if stops.is_empty() {
                        return Ok((body, None));
                    }
                    let expected: Vec<String> =
                        stops.iter().map(|s| format!("{{% {s} %}}")).collect();
                    return Err(TemplateError::syntax(
                        format!(
                            "unexpected end of template, expected {}",
                            expected.join(" or ")
                        ),
                        token.span,
                    ));
                }
                _ => {
                    return Err(TemplateError::syntax(
                        format!("unexpected {}", token.kind.describe()),
                        token.span,
                    ));
                }
            }
        }
    }

    /// The stop word following the current block-start token, if any.
    fn stop_word_after_block_start(&self, stops: &[&str]) -> Option<String> {
        match &self.peek2().kind {
            TokenKind::Keyword(kw) if stops.contains(&kw.as_str()) => {
                Some(kw.as_str().to_string())
            }
            TokenKind::Ident(name) if stops.contains(&name.as_str()) => Some(name.clone()),
            _ => None,
        }
    }

    /// Parse one `{% ... %}` statement, starting at its block-start token.
    fn parse_block_statement(&mut self) -> Result<Stmt, TemplateError> {
        self.advance(); // block start
        let token = self.advance();
        let span = token.span;
        match token.kind {
            TokenKind::Keyword(Keyword::If) => self.parse_if(span),
            TokenKind::Keyword(Keyword::For) => self.parse_for(span),
            TokenKind::Keyword(Keyword::Block) => self.parse_block(span),
            TokenKind::Keyword(Keyword::Extends) => {
                let expr = self.parse_expression()?;
                self.expect_block_end()?;
                Ok(Stmt::new(StmtKind::Extends(expr), span))
            }
            TokenKind::Keyword(Keyword::Include) => self.parse_include(span),
            TokenKind::Keyword(Keyword::Import) => {
                let name = self.parse_expression()?;
                self.expect_keyword(Keyword::As)?;
                let (alias, _) = self.expect_ident()?;
                self.expect_block_end()?;
                Ok(Stmt::new(StmtKind::Import { name, alias }, span))
            }
            TokenKind::Keyword(Keyword::From) => self.parse_from(span),
            TokenKind::Keyword(Keyword::Macro) => self.parse_macro(span),
            TokenKind::Keyword(Keyword::Set) => self.parse_set(span),
            TokenKind::Keyword(Keyword::Call) => self.parse_call_block(span),
            TokenKind::Keyword(Keyword::With) => self.parse_with(span),
            TokenKind::Keyword(Keyword::Do) => {
                let expr = self.parse_expression()?;
                self.expect_block_end()?;
                Ok(Stmt::new(StmtKind::Do(expr), span))
            }
            TokenKind::Keyword(Keyword::Raw) => self.parse_raw(span),
            TokenKind::Keyword(Keyword::Autoescape) => self.parse_autoescape(span),
            TokenKind::Keyword(Keyword::Filter) => self.parse_filter_block(span),
            TokenKind::Keyword(Keyword::Break) => {
                if self.loop_depth == 0 {
                    return Err(TemplateError::syntax("`break` outside of a loop", span));
                }
                self.expect_block_end()?;
                Ok(Stmt::new(StmtKind::Break, span))
            }
            TokenKind::Keyword(Keyword::Continue) => {
                if self.loop_depth == 0 {
                    return Err(TemplateError::syntax("`continue` outside of a loop", span));
                }
                self.expect_block_end()?;
                Ok(Stmt::new(StmtKind::Continue, span))
            }
            TokenKind::Keyword(kw) => Err(TemplateError::syntax(
                format!("unexpected `{}`", kw.as_str()),
                span,
            )),
            TokenKind::Ident(name) => self.parse_extension_tag(&name, span),
            other => Err(TemplateError::syntax(
                format!("expected a statement keyword, found {}", other.describe()),
                span,
            )),
        }
    }

    fn parse_if(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let mut arms = Vec::new();
        let mut cond = self.parse_expression()?;
        self.expect_block_end()?;
        loop {
            let (body, end) = self.parse_statements(&["elif", "else", "endif"])?;
            arms.push((cond, body));
            match end.as_deref() {
                Some("elif") => {
                    cond = self.parse_expression()?;
                    self.expect_block_end()?;
                }
                Some("else") => {
                    self.expect_block_end()?;
                    let (else_body, _) = self.parse_statements(&["endif"])?;
                    self.expect_block_end()?;
                    return Ok(Stmt::new(StmtKind::If { arms, else_body }, span));
                }
                _ => {
                    self.expect_block_end()?;
                    return Ok(Stmt::new(
                        StmtKind::If {
                            arms,
                            else_body: Vec::new(),
                        },
                        span,
                    ));
                }
            }
        }
    }

    fn parse_for(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let mut targets = Vec::new();
        loop {
            let (name, _) = self.expect_ident()?;
            targets.push(name);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect_keyword(Keyword::In)?;
        // no conditional expression here: a trailing `if` is the loop filter
        let iter = self.parse_or()?;
        let cond = if self.eat_keyword(Keyword::If) {
            Some(self.parse_or()?)
        } else {
            None
        };
        let recursive = self.eat_keyword(Keyword::Recursive);
        self.expect_block_end()?;

        self.loop_depth += 1;
        let (body, end) = self.parse_statements(&["else", "endfor"])?;
        self.loop_depth -= 1;

        let else_body = if end.as_deref() == Some("else") {
            self.expect_block_end()?;
            let (else_body, _) = self.parse_statements(&["endfor"])?;
            else_body
        } else {
            Vec::new()
        };
        self.expect_block_end()?;
        Ok(Stmt::new(
            StmtKind::For {
                targets,
                iter,
                cond,
                body: Arc::new(body),
                else_body,
                recursive,
            },
            span,
        ))
    }

    fn parse_block(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let (name, _) = self.expect_ident()?;
        self.expect_block_end()?;
        let (body, _) = self.parse_statements(&["endblock"])?;
        // `{% endblock name %}` may repeat the block name
        if let TokenKind::Ident(trailing) = &self.peek().kind {
            if trailing != &name {
                let token = self.peek();
                return Err(TemplateError::syntax(
                    format!("mismatched block name: expected `{name}`, found `{trailing}`"),
                    token.span,
                ));
            }
            self.advance();
        }
        self.expect_block_end()?;
        Ok(Stmt::new(
            StmtKind::Block {
                name,
                body: Arc::new(body),
            },
            span,
        ))
    }

    fn parse_include(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let name = self.parse_expression()?;
        let mut ignore_missing = false;
        if self.eat_keyword(Keyword::Ignore) {
            self.expect_keyword(Keyword::Missing)?;
            ignore_missing = true;
        }
        let context = if self.eat_keyword(Keyword::With) {
            IncludeContext::Explicit(self.parse_expression()?)
        } else {
            IncludeContext::Inherit
        };
        self.expect_block_end()?;
        Ok(Stmt::new(
            StmtKind::Include {
                name,
                context,
                ignore_missing,
            },
            span,
        ))
    }

    fn parse_from(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let name = self.parse_expression()?;
        self.expect_keyword(Keyword::Import)?;
        let mut names = Vec::new();
        loop {
            let (imported, _) = self.expect_ident()?;
            let alias = if self.eat_keyword(Keyword::As) {
                Some(self.expect_ident()?.0)
            } else {
                None
            };
            names.push((imported, alias));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect_block_end()?;
        Ok(Stmt::new(StmtKind::FromImport { name, names }, span))
    }

    fn parse_macro(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let (name, _) = self.expect_ident()?;
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                let (param, _) = self.expect_ident()?;
                let default = if self.eat(&TokenKind::Assign) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                params.push((param, default));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen, "`)`")?;
        }
        self.expect_block_end()?;

        // macro bodies run in their own invocation, not in any
        // enclosing loop, so break/continue do not reach through
        let saved_depth = std::mem::take(&mut self.loop_depth);
        let (body, _) = self.parse_statements(&["endmacro"])?;
        self.loop_depth = saved_depth;

        if let TokenKind::Ident(trailing) = &self.peek().kind {
            if trailing == &name {
                self.advance();
            }
        }
        self.expect_block_end()?;
        Ok(Stmt::new(
            StmtKind::Macro(Arc::new(MacroDecl {
                name,
                params,
                body: Arc::new(body),
                span,
            })),
            span,
        ))
    }

    fn parse_set(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let mut targets = vec![self.parse_assign_target()?];
        while self.eat(&TokenKind::Comma) {
            targets.push(self.parse_assign_target()?);
        }

        if self.eat(&TokenKind::Assign) {
            let value = self.parse_expression()?;
            self.expect_block_end()?;
            return Ok(Stmt::new(StmtKind::Set { targets, value }, span));
        }

        // block form: {% set name %}body{% endset %}
        if targets.len() != 1 {
            return Err(TemplateError::syntax(
                "block-form `set` takes a single target",
                span,
            ));
        }
        let name = match targets.into_iter().next().expect("one target") {
            AssignTarget::Name(name) => name,
            _ => {
                return Err(TemplateError::syntax(
                    "block-form `set` target must be a plain name",
                    span,
                ));
            }
        };
        self.expect_block_end()?;
        let (body, _) = self.parse_statements(&["endset"])?;
        self.expect_block_end()?;
        Ok(Stmt::new(StmtKind::SetBlock { name, body }, span))
    }

    fn parse_assign_target(&mut self) -> Result<AssignTarget, TemplateError> {
        let (name, span) = self.expect_ident()?;
        let mut target = AssignTarget::Name(name);
        loop {
            if self.eat(&TokenKind::Dot) {
                let (attr, _) = self.expect_ident()?;
                target = AssignTarget::Attr {
                    obj: target_to_expr(target, span),
                    name: attr,
                };
            } else if self.eat(&TokenKind::LBracket) {
                let key = self.parse_expression()?;
                self.expect(TokenKind::RBracket, "`]`")?;
                target = AssignTarget::Index {
                    obj: target_to_expr(target, span),
                    key,
                };
            } else {
                return Ok(target);
            }
        }
    }

    fn parse_call_block(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let call = self.parse_expression()?;
        if !matches!(call.kind, ExprKind::Call { .. }) {
            return Err(TemplateError::syntax(
                "`call` expects a macro invocation",
                span,
            ));
        }
        self.expect_block_end()?;
        let (body, _) = self.parse_statements(&["endcall"])?;
        self.expect_block_end()?;
        Ok(Stmt::new(
            StmtKind::CallBlock {
                call,
                body: Arc::new(body),
            },
            span,
        ))
    }

    fn parse_with(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let mut bindings = Vec::new();
        while !matches!(self.peek().kind, TokenKind::BlockEnd(_)) {
            let (name, _) = self.expect_ident()?;
            self.expect(TokenKind::Assign, "`=`")?;
            let value = self.parse_expression()?;
            bindings.push((name, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect_block_end()?;
        let (body, _) = self.parse_statements(&["endwith"])?;
        self.expect_block_end()?;
        Ok(Stmt::new(StmtKind::With { bindings, body }, span))
    }

    fn parse_raw(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        self.expect_block_end()?;
        let content = match &self.peek().kind {
            TokenKind::Text(text) => {
                let text = text.clone();
                self.advance();
                text
            }
            _ => String::new(),
        };
        self.expect(TokenKind::BlockStart(false), "`{% endraw %}`")
            .or_else(|_| self.expect(TokenKind::BlockStart(true), "`{% endraw %}`"))?;
        self.expect_keyword(Keyword::Endraw)?;
        self.expect_block_end()?;
        Ok(Stmt::new(StmtKind::Raw(content), span))
    }

    fn parse_autoescape(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let enabled = if self.eat_keyword(Keyword::True) {
            true
        } else if self.eat_keyword(Keyword::False) {
            false
        } else {
            let token = self.peek();
            return Err(TemplateError::syntax(
                format!(
                    "`autoescape` expects `true` or `false`, found {}",
                    token.kind.describe()
                ),
                token.span,
            ));
        };
        self.expect_block_end()?;
        let (body, _) = self.parse_statements(&["endautoescape"])?;
        self.expect_block_end()?;
        Ok(Stmt::new(StmtKind::Autoescape { enabled, body }, span))
    }

    fn parse_filter_block(&mut self, span: Span) -> Result<Stmt, TemplateError> {
        let mut filters = Vec::new();
        loop {
            let (name, filter_span) = self.expect_ident()?;
            let (args, kwargs) = if self.eat(&TokenKind::LParen) {
                self.parse_call_args()?
            } else {
                (Vec::new(), Vec::new())
            };
            filters.push(FilterCall {
                name,
                args,
                kwargs,
                span: filter_span,
            });
            if !self.eat(&TokenKind::Pipe) {
                break;
            }
        }
        self.expect_block_end()?;
        let (body, _) = self.parse_statements(&["endfilter"])?;
        self.expect_block_end()?;
        Ok(Stmt::new(StmtKind::FilterBlock { filters, body }, span))
    }

    /// Delegate a registered custom tag to its extension's parser.
    fn parse_extension_tag(&mut self, tag: &str, span: Span) -> Result<Stmt, TemplateError> {
        let ext = self
            .extensions
            .and_then(|registry| registry.lookup_tag(tag));
        match ext {
            Some(ext) => {
                let node = {
                    let mut view = ParserView { parser: self };
                    ext.parse(tag, &mut view)
                        .map_err(|e| TemplateError::extension(ext.name(), tag, e))?
                };
                Ok(Stmt::new(StmtKind::Extension(node), span))
            }
            None => Err(TemplateError::syntax(format!("unknown tag `{tag}`"), span)),
        }
    }

    // ========================================================================
    // Expressions, precedence climbing (lowest binds first below)
    // ========================================================================

    pub(crate) fn parse_expression(&mut self) -> Result<Expr, TemplateError> {
        // conditional: `then if cond else otherwise`, right-associative
        let then = self.parse_or()?;
        if self.eat_keyword(Keyword::If) {
            let span = then.span;
            let cond = self.parse_or()?;
            let otherwise = if self.eat_keyword(Keyword::Else) {
                Some(Box::new(self.parse_expression()?))
            } else {
                None
            };
            Ok(Expr::new(
                ExprKind::Conditional {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    otherwise,
                },
                span,
            ))
        } else {
            Ok(then)
        }
    }

    fn parse_or(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword(Keyword::Or) {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword(Keyword::And) {
            let right = self.parse_not()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, TemplateError> {
        if let TokenKind::Keyword(Keyword::Not) = self.peek().kind {
            // `not x in y` means `not (x in y)`, so only treat `not` as
            // unary here; `not in` never reaches this position
            let span = self.peek().span;
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_is()
    }

    fn parse_is(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_comparison()?;
        while self.eat_keyword(Keyword::Is) {
            let negated = self.eat_keyword(Keyword::Not);
            let (name, span) = self.expect_test_name()?;
            let args = self.parse_test_args()?;
            left = Expr::new(
                ExprKind::Test {
                    value: Box::new(left),
                    name,
                    args,
                    negated,
                },
                span,
            );
        }
        Ok(left)
    }

    /// Test names are identifiers, plus the keyword collisions
    /// `none` and `in`.
    fn expect_test_name(&mut self) -> Result<(String, Span), TemplateError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, token.span))
            }
            TokenKind::Keyword(Keyword::None) => {
                self.advance();
                Ok(("none".to_string(), token.span))
            }
            TokenKind::Keyword(Keyword::In) => {
                self.advance();
                Ok(("in".to_string(), token.span))
            }
            other => Err(TemplateError::syntax(
                format!("expected a test name, found {}", other.describe()),
                token.span,
            )),
        }
    }

    fn parse_test_args(&mut self) -> Result<Vec<Expr>, TemplateError> {
        if self.eat(&TokenKind::LParen) {
            let (args, kwargs) = self.parse_call_args()?;
            if let Some((name, _)) = kwargs.first() {
                return Err(TemplateError::syntax_unlocated(format!(
                    "tests take positional arguments only, found `{name}=`"
                )));
            }
            return Ok(args);
        }
        // bare single argument: `x is divisibleby 3`, `a is sameas b`
        let bare = matches!(
            self.peek().kind,
            TokenKind::Int(_)
                | TokenKind::Float(_)
                | TokenKind::Str(_)
                | TokenKind::Ident(_)
                | TokenKind::Keyword(Keyword::True | Keyword::False | Keyword::None)
                | TokenKind::LBracket
                | TokenKind::LBrace
        );
        if bare {
            Ok(vec![self.parse_postfix()?])
        } else {
            Ok(Vec::new())
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Eq => BinaryOp::Eq,
                TokenKind::Ne => BinaryOp::Ne,
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                TokenKind::Keyword(Keyword::In) => BinaryOp::In,
                TokenKind::Keyword(Keyword::Not)
                    if matches!(self.peek2().kind, TokenKind::Keyword(Keyword::In)) =>
                {
                    self.advance();
                    BinaryOp::NotIn
                }
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_concat()?;
            left = binary(op, left, right);
        }
    }

    fn parse_concat(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_addsub()?;
        while self.eat(&TokenKind::Tilde) {
            let right = self.parse_addsub()?;
            left = binary(BinaryOp::Concat, left, right);
        }
        Ok(left)
    }

    fn parse_addsub(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_muldiv()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_muldiv()?;
            left = binary(op, left, right);
        }
    }

    fn parse_muldiv(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::FloorDiv => BinaryOp::FloorDiv,
                TokenKind::Mod => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, TemplateError> {
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Plus => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.peek().span;
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_pow()
    }

    fn parse_pow(&mut self) -> Result<Expr, TemplateError> {
        let base = self.parse_postfix()?;
        if self.eat(&TokenKind::Pow) {
            // right-associative; the exponent may carry a unary sign
            let exponent = self.parse_unary()?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    /// Postfix chain: attribute, index/slice, call, filter.
    fn parse_postfix(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let (name, span) = self.expect_ident()?;
                expr = Expr::new(
                    ExprKind::Attr {
                        obj: Box::new(expr),
                        name,
                    },
                    span,
                );
            } else if self.eat(&TokenKind::LBracket) {
                expr = self.parse_index_or_slice(expr)?;
            } else if self.eat(&TokenKind::LParen) {
                let span = expr.span;
                let (args, kwargs) = self.parse_call_args()?;
                expr = Expr::new(
                    ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                        kwargs,
                    },
                    span,
                );
            } else if self.eat(&TokenKind::Pipe) {
                let (name, span) = self.expect_ident()?;
                let (args, kwargs) = if self.eat(&TokenKind::LParen) {
                    self.parse_call_args()?
                } else {
                    (Vec::new(), Vec::new())
                };
                expr = Expr::new(
                    ExprKind::Filter {
                        value: Box::new(expr),
                        name,
                        args,
                        kwargs,
                    },
                    span,
                );
            } else {
                return Ok(expr);
            }
        }
    }

    /// Inside `[` ... `]` after an object expression: either an index
    /// or a slice with any of start/stop/step omitted.
    fn parse_index_or_slice(&mut self, obj: Expr) -> Result<Expr, TemplateError> {
        let span = obj.span;
        let start = if matches!(self.peek().kind, TokenKind::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };

        if self.eat(&TokenKind::Colon) {
            let stop = if matches!(self.peek().kind, TokenKind::Colon | TokenKind::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expression()?))
            };
            let step = if self.eat(&TokenKind::Colon) {
                if matches!(self.peek().kind, TokenKind::RBracket) {
                    None
                } else {
                    Some(Box::new(self.parse_expression()?))
                }
            } else {
                None
            };
            self.expect(TokenKind::RBracket, "`]`")?;
            return Ok(Expr::new(
                ExprKind::Slice {
                    obj: Box::new(obj),
                    start,
                    stop,
                    step,
                },
                span,
            ));
        }

        let key = start.expect("index without start is a slice");
        self.expect(TokenKind::RBracket, "`]`")?;
        Ok(Expr::new(
            ExprKind::Index {
                obj: Box::new(obj),
                key,
            },
            span,
        ))
    }

    /// Argument list after `(`: positionals, then keywords. Consumes
    /// the closing paren.
    fn parse_call_args(&mut self) -> Result<CallArgs, TemplateError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok((args, kwargs));
        }
        loop {
            let is_kwarg = matches!(self.peek().kind, TokenKind::Ident(_))
                && matches!(self.peek2().kind, TokenKind::Assign);
            if is_kwarg {
                let (name, _) = self.expect_ident()?;
                self.advance(); // `=`
                let value = self.parse_expression()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    let token = self.peek();
                    return Err(TemplateError::syntax(
                        "positional argument follows keyword argument",
                        token.span,
                    ));
                }
                args.push(self.parse_expression()?);
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            if matches!(self.peek().kind, TokenKind::RParen) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        Ok((args, kwargs))
    }

    fn parse_primary(&mut self) -> Result<Expr, TemplateError> {
        let token = self.peek().clone();
        let span = token.span;
        match token.kind {
            TokenKind::Int(n) => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Value::Int(n)), span))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Value::Float(f)), span))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Value::String(s)), span))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Value::Bool(true)), span))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Value::Bool(false)), span))
            }
            TokenKind::Keyword(Keyword::None) => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Value::None), span))
            }
            TokenKind::Keyword(Keyword::Super) => {
                self.advance();
                self.expect(TokenKind::LParen, "`(` after `super`")?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(Expr::new(ExprKind::Super, span))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::new(ExprKind::Ident(name), span))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                self.parse_list_or_comprehension(span)
            }
            TokenKind::LBrace => {
                self.advance();
                self.parse_dict_or_comprehension(span)
            }
            other => Err(TemplateError::syntax(
                format!("expected an expression, found {}", other.describe()),
                span,
            )),
        }
    }

    fn parse_list_or_comprehension(&mut self, span: Span) -> Result<Expr, TemplateError> {
        if self.eat(&TokenKind::RBracket) {
            return Ok(Expr::new(ExprKind::List(Vec::new()), span));
        }
        let first = self.parse_expression()?;
        if self.eat_keyword(Keyword::For) {
            let (targets, iter, cond) = self.parse_comprehension_tail()?;
            self.expect(TokenKind::RBracket, "`]`")?;
            return Ok(Expr::new(
                ExprKind::Comprehension {
                    key: None,
                    value: Box::new(first),
                    targets,
                    iter: Box::new(iter),
                    cond: cond.map(Box::new),
                    is_dict: false,
                },
                span,
            ));
        }
        let mut elements = vec![first];
        while self.eat(&TokenKind::Comma) {
            if matches!(self.peek().kind, TokenKind::RBracket) {
                break;
            }
            elements.push(self.parse_expression()?);
        }
        self.expect(TokenKind::RBracket, "`]`")?;
        Ok(Expr::new(ExprKind::List(elements), span))
    }

    fn parse_dict_or_comprehension(&mut self, span: Span) -> Result<Expr, TemplateError> {
        if self.eat(&TokenKind::RBrace) {
            return Ok(Expr::new(ExprKind::Dict(Vec::new()), span));
        }
        let key = self.parse_expression()?;
        self.expect(TokenKind::Colon, "`:`")?;
        let value = self.parse_expression()?;
        if self.eat_keyword(Keyword::For) {
            let (targets, iter, cond) = self.parse_comprehension_tail()?;
            self.expect(TokenKind::RBrace, "`}`")?;
            return Ok(Expr::new(
                ExprKind::Comprehension {
                    key: Some(Box::new(key)),
                    value: Box::new(value),
                    targets,
                    iter: Box::new(iter),
                    cond: cond.map(Box::new),
                    is_dict: true,
                },
                span,
            ));
        }
        let mut pairs = vec![(key, value)];
        while self.eat(&TokenKind::Comma) {
            if matches!(self.peek().kind, TokenKind::RBrace) {
                break;
            }
            let key = self.parse_expression()?;
            self.expect(TokenKind::Colon, "`:`")?;
            let value = self.parse_expression()?;
            pairs.push((key, value));
        }
        self.expect(TokenKind::RBrace, "`}`")?;
        Ok(Expr::new(ExprKind::Dict(pairs), span))
    }

    /// After the `for` keyword of a comprehension: targets, iterable,
    /// and an optional `if` guard.
    fn parse_comprehension_tail(
        &mut self,
    ) -> Result<(Vec<String>, Expr, Option<Expr>), TemplateError> {
        let mut targets = Vec::new();
        loop {
            let (name, _) = self.expect_ident()?;
            targets.push(name);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect_keyword(Keyword::In)?;
        let iter = self.parse_or()?;
        let cond = if self.eat_keyword(Keyword::If) {
            Some(self.parse_or()?)
        } else {
            None
        };
        Ok((targets, iter, cond))
    }
}

type CallArgs = (Vec<Expr>, Vec<(String, Expr)>);

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    let span = left.span;
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

fn target_to_expr(target: AssignTarget, span: Span) -> Expr {
    match target {
        AssignTarget::Name(name) => Expr::new(ExprKind::Ident(name), span),
        AssignTarget::Attr { obj, name } => Expr::new(
            ExprKind::Attr {
                obj: Box::new(obj),
                name,
            },
            span,
        ),
        AssignTarget::Index { obj, key } => Expr::new(
            ExprKind::Index {
                obj: Box::new(obj),
                key: Box::new(key),
            },
            span,
        ),
    }
}

// ============================================================================
// Extension parser facade
// ============================================================================

/// The narrow parser surface handed to extension parse callbacks.
pub struct ParserView<'p, 'env> {
    parser: &'p mut Parser<'env>,
}

impl ParserView<'_, '_> {
    pub fn peek(&self) -> &Token {
        self.parser.peek()
    }

    pub fn advance(&mut self) -> Token {
        self.parser.advance()
    }

    pub fn expect_ident(&mut self) -> Result<String, TemplateError> {
        Ok(self.parser.expect_ident()?.0)
    }

    pub fn parse_expression(&mut self) -> Result<Expr, TemplateError> {
        self.parser.parse_expression()
    }

    /// Argument list in call style; the caller must already have
    /// consumed the opening paren via `advance`, or use this directly
    /// after checking `peek`.
    pub fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), TemplateError> {
        self.parser.parse_call_args()
    }

    pub fn at_block_end(&self) -> bool {
        matches!(self.parser.peek().kind, TokenKind::BlockEnd(_))
    }

    pub fn expect_block_end(&mut self) -> Result<(), TemplateError> {
        self.parser.expect_block_end()
    }

    /// Parse body statements up to `{% end_tag %}`, consuming the
    /// whole end tag.
    pub fn parse_body_until(&mut self, end_tag: &str) -> Result<Vec<Stmt>, TemplateError> {
        let (body, end) = self.parser.parse_statements(&[end_tag])?;
        debug_assert_eq!(end.as_deref(), Some(end_tag));
        self.parser.expect_block_end()?;
        Ok(body)
    }

    pub fn span(&self) -> Span {
        self.parser.peek().span
    }
}
