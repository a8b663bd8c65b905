// ABOUTME: Mode-based lexer turning template source into a token stream,
// with whitespace-control and raw-block handling

use crate::ast::Span;
use crate::config::EngineConfig;
use crate::error::TemplateError;
use nom::{
    bytes::complete::{take_while, take_while1},
    character::complete::{char as nom_char, digit1, one_of},
    combinator::{opt, recognize},
    IResult, Parser,
};

// ============================================================================
// Tokens
// ============================================================================

/// Statement and expression keywords, recognized by identifier text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    If,
    Elif,
    Else,
    Endif,
    For,
    Endfor,
    In,
    Is,
    Not,
    And,
    Or,
    Block,
    Endblock,
    Extends,
    Include,
    Import,
    From,
    As,
    Macro,
    Endmacro,
    Set,
    Endset,
    Call,
    Endcall,
    With,
    Endwith,
    Do,
    Raw,
    Endraw,
    Autoescape,
    Endautoescape,
    Filter,
    Endfilter,
    Break,
    Continue,
    Recursive,
    Ignore,
    Missing,
    True,
    False,
    None,
    Super,
}

impl Keyword {
    pub fn from_ident(text: &str) -> Option<Keyword> {
        Some(match text {
            "if" => Keyword::If,
            "elif" => Keyword::Elif,
            "else" => Keyword::Else,
            "endif" => Keyword::Endif,
            "for" => Keyword::For,
            "endfor" => Keyword::Endfor,
            "in" => Keyword::In,
            "is" => Keyword::Is,
            "not" => Keyword::Not,
            "and" => Keyword::And,
            "or" => Keyword::Or,
            "block" => Keyword::Block,
            "endblock" => Keyword::Endblock,
            "extends" => Keyword::Extends,
            "include" => Keyword::Include,
            "import" => Keyword::Import,
            "from" => Keyword::From,
            "as" => Keyword::As,
            "macro" => Keyword::Macro,
            "endmacro" => Keyword::Endmacro,
            "set" => Keyword::Set,
            "endset" => Keyword::Endset,
            "call" => Keyword::Call,
            "endcall" => Keyword::Endcall,
            "with" => Keyword::With,
            "endwith" => Keyword::Endwith,
            "do" => Keyword::Do,
            "raw" => Keyword::Raw,
            "endraw" => Keyword::Endraw,
            "autoescape" => Keyword::Autoescape,
            "endautoescape" => Keyword::Endautoescape,
            "filter" => Keyword::Filter,
            "endfilter" => Keyword::Endfilter,
            "break" => Keyword::Break,
            "continue" => Keyword::Continue,
            "recursive" => Keyword::Recursive,
            "ignore" => Keyword::Ignore,
            "missing" => Keyword::Missing,
            "true" => Keyword::True,
            "false" => Keyword::False,
            "none" => Keyword::None,
            "super" => Keyword::Super,
            _ => return Option::None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::If => "if",
            Keyword::Elif => "elif",
            Keyword::Else => "else",
            Keyword::Endif => "endif",
            Keyword::For => "for",
            Keyword::Endfor => "endfor",
            Keyword::In => "in",
            Keyword::Is => "is",
            Keyword::Not => "not",
            Keyword::And => "and",
            Keyword::Or => "or",
            Keyword::Block => "block",
            Keyword::Endblock => "endblock",
            Keyword::Extends => "extends",
            Keyword::Include => "include",
            Keyword::Import => "import",
            Keyword::From => "from",
            Keyword::As => "as",
            Keyword::Macro => "macro",
            Keyword::Endmacro => "endmacro",
            Keyword::Set => "set",
            Keyword::Endset => "endset",
            Keyword::Call => "call",
            Keyword::Endcall => "endcall",
            Keyword::With => "with",
            Keyword::Endwith => "endwith",
            Keyword::Do => "do",
            Keyword::Raw => "raw",
            Keyword::Endraw => "endraw",
            Keyword::Autoescape => "autoescape",
            Keyword::Endautoescape => "endautoescape",
            Keyword::Filter => "filter",
            Keyword::Endfilter => "endfilter",
            Keyword::Break => "break",
            Keyword::Continue => "continue",
            Keyword::Recursive => "recursive",
            Keyword::Ignore => "ignore",
            Keyword::Missing => "missing",
            Keyword::True => "true",
            Keyword::False => "false",
            Keyword::None => "none",
            Keyword::Super => "super",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Raw template text, whitespace control already applied
    Text(String),
    /// `{{` / `{{-`; the flag records the trim marker
    VarStart(bool),
    /// `}}` / `-}}`
    VarEnd(bool),
    /// `{%` / `{%-`
    BlockStart(bool),
    /// `%}` / `-%}`
    BlockEnd(bool),
    Ident(String),
    Keyword(Keyword),
    Int(i64),
    Float(f64),
    Str(String),
    Dot,
    Comma,
    Colon,
    Semicolon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Pipe,
    Tilde,
    Assign,
    Pow,
    FloorDiv,
    Mod,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Eof,
}

impl TokenKind {
    /// Human-readable token description for parser error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Text(_) => "template text".to_string(),
            TokenKind::VarStart(_) => "`{{`".to_string(),
            TokenKind::VarEnd(_) => "`}}`".to_string(),
            TokenKind::BlockStart(_) => "`{%`".to_string(),
            TokenKind::BlockEnd(_) => "`%}`".to_string(),
            TokenKind::Ident(name) => format!("identifier `{name}`"),
            TokenKind::Keyword(kw) => format!("`{}`", kw.as_str()),
            TokenKind::Int(n) => format!("integer `{n}`"),
            TokenKind::Float(f) => format!("float `{f}`"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Dot => "`.`".to_string(),
            TokenKind::Comma => "`,`".to_string(),
            TokenKind::Colon => "`:`".to_string(),
            TokenKind::Semicolon => "`;`".to_string(),
            TokenKind::LParen => "`(`".to_string(),
            TokenKind::RParen => "`)`".to_string(),
            TokenKind::LBracket => "`[`".to_string(),
            TokenKind::RBracket => "`]`".to_string(),
            TokenKind::LBrace => "`{`".to_string(),
            TokenKind::RBrace => "`}`".to_string(),
            TokenKind::Pipe => "`|`".to_string(),
            TokenKind::Tilde => "`~`".to_string(),
            TokenKind::Assign => "`=`".to_string(),
            TokenKind::Pow => "`**`".to_string(),
            TokenKind::FloorDiv => "`//`".to_string(),
            TokenKind::Mod => "`%`".to_string(),
            TokenKind::Plus => "`+`".to_string(),
            TokenKind::Minus => "`-`".to_string(),
            TokenKind::Star => "`*`".to_string(),
            TokenKind::Slash => "`/`".to_string(),
            TokenKind::Lt => "`<`".to_string(),
            TokenKind::Le => "`<=`".to_string(),
            TokenKind::Gt => "`>`".to_string(),
            TokenKind::Ge => "`>=`".to_string(),
            TokenKind::Eq => "`==`".to_string(),
            TokenKind::Ne => "`!=`".to_string(),
            TokenKind::Eof => "end of template".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

// ============================================================================
// nom scanners for expression-mode tokens
// ============================================================================

/// Scan an identifier: `[A-Za-z_][A-Za-z0-9_]*`
fn scan_ident(input: &str) -> IResult<&str, &str> {
    recognize((
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

/// Scan a numeric literal: digits with optional fraction and exponent.
/// Classification into integer or float happens at the call site.
fn scan_number(input: &str) -> IResult<&str, &str> {
    recognize((
        digit1,
        opt((nom_char('.'), digit1)),
        opt((one_of("eE"), opt(one_of("+-")), digit1)),
    ))
    .parse(input)
}

// ============================================================================
// Whitespace-control helpers
// ============================================================================

/// What to strip from the front of the next text chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PendingStrip {
    Nothing,
    /// After a `-}}` / `-%}` / `-#}`: the whole leading whitespace run
    AllLeading,
    /// After `%}` / `#}` with `trim_blocks`: one leading newline
    OneNewline,
}

fn strip_trailing_all(text: &mut String) {
    let end = text.trim_end().len();
    text.truncate(end);
}

fn strip_leading_all(text: &mut String) {
    let trimmed = text.trim_start();
    *text = trimmed.to_string();
}

/// Remove trailing spaces/tabs on the final line, but only when that
/// line holds nothing else before the tag (lstrip_blocks semantics).
fn strip_trailing_line_ws(text: &mut String) {
    let line_start = text.rfind('\n').map(|i| i + 1).unwrap_or(0);
    if text[line_start..].chars().all(|c| c == ' ' || c == '\t') {
        text.truncate(line_start);
    }
}

fn strip_leading_newline(text: &mut String) {
    if let Some(rest) = text.strip_prefix("\r\n") {
        *text = rest.to_string();
    } else if let Some(rest) = text.strip_prefix('\n') {
        *text = rest.to_string();
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Delim {
    Var,
    Block,
    Comment,
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    col: u32,
    trim_blocks: bool,
    lstrip_blocks: bool,
    tokens: Vec<Token>,
    pending: PendingStrip,
}

/// Tokenize template source, applying the environment's whitespace
/// control. The returned stream always ends with an `Eof` token.
pub fn tokenize(source: &str, config: &EngineConfig) -> Result<Vec<Token>, TemplateError> {
    // keep_trailing_newline=false removes one final newline from the
    // source before any other processing
    let src = if config.keep_trailing_newline {
        source
    } else if let Some(stripped) = source.strip_suffix("\r\n") {
        stripped
    } else if let Some(stripped) = source.strip_suffix('\n') {
        stripped
    } else {
        source
    };

    let mut lexer = Lexer {
        src,
        pos: 0,
        line: 1,
        col: 1,
        trim_blocks: config.trim_blocks,
        lstrip_blocks: config.lstrip_blocks,
        tokens: Vec::new(),
        pending: PendingStrip::Nothing,
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl<'a> Lexer<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn span(&self) -> Span {
        Span::new(self.line, self.col)
    }

    /// Advance over the next `n` bytes, updating line/column.
    fn bump(&mut self, n: usize) {
        for c in self.src[self.pos..self.pos + n].chars() {
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        self.pos += n;
    }

    fn push(&mut self, kind: TokenKind, span: Span) {
        self.tokens.push(Token { kind, span });
    }

    fn run(&mut self) -> Result<(), TemplateError> {
        loop {
            let rest = self.rest();
            match find_delimiter(rest) {
                None => {
                    let span = self.span();
                    let mut text = rest.to_string();
                    self.apply_pending(&mut text);
                    self.bump(rest.len());
                    if !text.is_empty() {
                        self.push(TokenKind::Text(text), span);
                    }
                    break;
                }
                Some((idx, delim)) => {
                    let text_span = self.span();
                    let mut text = rest[..idx].to_string();
                    self.apply_pending(&mut text);

                    let trim = rest.as_bytes().get(idx + 2) == Some(&b'-');
                    if trim {
                        strip_trailing_all(&mut text);
                    } else if self.lstrip_blocks
                        && matches!(delim, Delim::Block | Delim::Comment)
                    {
                        strip_trailing_line_ws(&mut text);
                    }
                    self.bump(idx);
                    if !text.is_empty() {
                        self.push(TokenKind::Text(text), text_span);
                    }

                    let delim_span = self.span();
                    self.bump(2 + usize::from(trim));
                    match delim {
                        Delim::Comment => self.lex_comment(delim_span)?,
                        Delim::Var => {
                            self.push(TokenKind::VarStart(trim), delim_span);
                            self.lex_expression(Delim::Var, delim_span)?;
                        }
                        Delim::Block => {
                            self.push(TokenKind::BlockStart(trim), delim_span);
                            if self.peek_raw_tag() {
                                self.lex_raw(delim_span)?;
                            } else {
                                self.lex_expression(Delim::Block, delim_span)?;
                            }
                        }
                    }
                }
            }
        }
        let span = self.span();
        self.push(TokenKind::Eof, span);
        Ok(())
    }

    fn apply_pending(&mut self, text: &mut String) {
        match self.pending {
            PendingStrip::Nothing => {}
            PendingStrip::AllLeading => strip_leading_all(text),
            PendingStrip::OneNewline => strip_leading_newline(text),
        }
        self.pending = PendingStrip::Nothing;
    }

    /// After a closing delimiter, decide what the next text chunk loses.
    fn set_pending(&mut self, end_trim: bool, was_block: bool) {
        self.pending = if end_trim {
            PendingStrip::AllLeading
        } else if was_block && self.trim_blocks {
            PendingStrip::OneNewline
        } else {
            PendingStrip::Nothing
        };
    }

    fn lex_comment(&mut self, open_span: Span) -> Result<(), TemplateError> {
        let rest = self.rest();
        match rest.find("#}") {
            Option::None => Err(TemplateError::syntax("unterminated comment", open_span)),
            Some(j) => {
                let right_trim = j >= 1 && rest.as_bytes()[j - 1] == b'-';
                self.bump(j + 2);
                self.set_pending(right_trim, true);
                Ok(())
            }
        }
    }

    fn skip_inline_ws(&mut self) {
        let rest = self.rest();
        let n = rest.len() - rest.trim_start().len();
        if n > 0 {
            self.bump(n);
        }
    }

    /// Does the block we just opened start with the `raw` keyword?
    fn peek_raw_tag(&self) -> bool {
        let rest = self.rest().trim_start();
        match scan_ident(rest) {
            Ok((_, ident)) => ident == "raw",
            Err(_) => false,
        }
    }

    /// Tokenize expression-mode input until the matching end delimiter.
    fn lex_expression(&mut self, delim: Delim, open_span: Span) -> Result<(), TemplateError> {
        loop {
            self.skip_inline_ws();
            let rest = self.rest();
            if rest.is_empty() {
                let what = if delim == Delim::Var { "{{" } else { "{%" };
                return Err(TemplateError::syntax(
                    format!("unterminated `{what}` delimiter"),
                    open_span,
                ));
            }
            let span = self.span();
            match delim {
                Delim::Var => {
                    if let Some(trim) = match_end(rest, "}}") {
                        self.push(TokenKind::VarEnd(trim), span);
                        self.bump(2 + usize::from(trim));
                        self.set_pending(trim, false);
                        return Ok(());
                    }
                }
                Delim::Block => {
                    if let Some(trim) = match_end(rest, "%}") {
                        self.push(TokenKind::BlockEnd(trim), span);
                        self.bump(2 + usize::from(trim));
                        self.set_pending(trim, true);
                        return Ok(());
                    }
                }
                Delim::Comment => unreachable!("comments are not expression mode"),
            }
            self.lex_token()?;
        }
    }

    /// Scan a single expression-mode token at the current position.
    fn lex_token(&mut self) -> Result<(), TemplateError> {
        let rest = self.rest();
        let span = self.span();
        let first = rest.chars().next().expect("lex_token at end of input");

        if first.is_ascii_alphabetic() || first == '_' {
            let (_, ident) = scan_ident(rest)
                .map_err(|_| TemplateError::syntax("invalid identifier", span))?;
            let kind = match Keyword::from_ident(ident) {
                Some(kw) => TokenKind::Keyword(kw),
                Option::None => TokenKind::Ident(ident.to_string()),
            };
            self.bump(ident.len());
            self.push(kind, span);
            return Ok(());
        }

        if first.is_ascii_digit() {
            let (_, text) = scan_number(rest)
                .map_err(|_| TemplateError::syntax("invalid numeric literal", span))?;
            let kind = if text.contains('.') || text.contains('e') || text.contains('E') {
                let value: f64 = text.parse().map_err(|_| {
                    TemplateError::syntax(format!("invalid numeric literal `{text}`"), span)
                })?;
                TokenKind::Float(value)
            } else {
                let value: i64 = text.parse().map_err(|_| {
                    TemplateError::syntax(format!("integer literal `{text}` out of range"), span)
                })?;
                TokenKind::Int(value)
            };
            self.bump(text.len());
            self.push(kind, span);
            return Ok(());
        }

        if first == '"' || first == '\'' {
            return self.lex_string(first);
        }

        // Longest match: two-character operators before single ones
        let two = rest.get(..2).unwrap_or("");
        let kind2 = match two {
            "**" => Some(TokenKind::Pow),
            "//" => Some(TokenKind::FloorDiv),
            "==" => Some(TokenKind::Eq),
            "!=" => Some(TokenKind::Ne),
            "<=" => Some(TokenKind::Le),
            ">=" => Some(TokenKind::Ge),
            _ => Option::None,
        };
        if let Some(kind) = kind2 {
            self.bump(2);
            self.push(kind, span);
            return Ok(());
        }

        let kind1 = match first {
            '.' => TokenKind::Dot,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '|' => TokenKind::Pipe,
            '~' => TokenKind::Tilde,
            '=' => TokenKind::Assign,
            '%' => TokenKind::Mod,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '<' => TokenKind::Lt,
            '>' => TokenKind::Gt,
            c => {
                return Err(TemplateError::syntax(
                    format!("unexpected character `{c}`"),
                    span,
                ))
            }
        };
        self.bump(first.len_utf8());
        self.push(kind1, span);
        Ok(())
    }

    /// Scan a quoted string with standard escape sequences.
    fn lex_string(&mut self, quote: char) -> Result<(), TemplateError> {
        let span = self.span();
        let rest = self.rest();
        let mut out = String::new();
        let mut chars = rest.char_indices().skip(1).peekable();

        while let Some((i, c)) = chars.next() {
            match c {
                c if c == quote => {
                    self.bump(i + quote.len_utf8());
                    self.push(TokenKind::Str(out), span);
                    return Ok(());
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, '\'')) => out.push('\''),
                    Some((_, '"')) => out.push('"'),
                    Some((_, other)) => {
                        return Err(TemplateError::syntax(
                            format!("invalid escape sequence `\\{other}`"),
                            span,
                        ))
                    }
                    Option::None => break,
                },
                _ => out.push(c),
            }
        }
        Err(TemplateError::syntax("unterminated string", span))
    }

    /// Verbatim capture between `{% raw %}` and `{% endraw %}`. Emits
    /// the payload as a single text token bracketed by the raw/endraw
    /// block tokens, with trim markers applied to the payload edges.
    fn lex_raw(&mut self, open_span: Span) -> Result<(), TemplateError> {
        self.skip_inline_ws();
        let kw_span = self.span();
        self.bump(3); // the `raw` keyword just peeked
        self.push(TokenKind::Keyword(Keyword::Raw), kw_span);
        self.skip_inline_ws();

        let rest = self.rest();
        let end_span = self.span();
        let Some(inner_trim) = match_end(rest, "%}") else {
            return Err(TemplateError::syntax(
                "expected `%}` after `raw`",
                end_span,
            ));
        };
        self.push(TokenKind::BlockEnd(inner_trim), end_span);
        self.bump(2 + usize::from(inner_trim));

        let rest = self.rest();
        let Some(found) = find_endraw(rest) else {
            return Err(TemplateError::syntax("missing `{% endraw %}`", open_span));
        };

        let mut content = rest[..found.content_len].to_string();
        if inner_trim {
            strip_leading_all(&mut content);
        } else if self.trim_blocks {
            strip_leading_newline(&mut content);
        }
        if found.left_trim {
            strip_trailing_all(&mut content);
        } else if self.lstrip_blocks {
            strip_trailing_line_ws(&mut content);
        }

        let content_span = self.span();
        self.bump(found.content_len);
        if !content.is_empty() {
            self.push(TokenKind::Text(content), content_span);
        }

        let close_span = self.span();
        self.bump(found.match_len);
        self.push(TokenKind::BlockStart(found.left_trim), close_span);
        self.push(TokenKind::Keyword(Keyword::Endraw), close_span);
        self.push(TokenKind::BlockEnd(found.right_trim), close_span);
        self.set_pending(found.right_trim, true);
        Ok(())
    }
}

/// Check for a closing delimiter, trim-marked or not.
fn match_end(rest: &str, end: &str) -> Option<bool> {
    if rest.len() >= 3 && rest.starts_with('-') && rest[1..].starts_with(end) {
        Some(true)
    } else if rest.starts_with(end) {
        Some(false)
    } else {
        None
    }
}

fn find_delimiter(rest: &str) -> Option<(usize, Delim)> {
    let mut best: Option<(usize, Delim)> = None;
    for (pattern, delim) in [
        ("{{", Delim::Var),
        ("{%", Delim::Block),
        ("{#", Delim::Comment),
    ] {
        if let Some(i) = rest.find(pattern) {
            if best.map_or(true, |(bi, _)| i < bi) {
                best = Some((i, delim));
            }
        }
    }
    best
}

struct EndrawMatch {
    content_len: usize,
    match_len: usize,
    left_trim: bool,
    right_trim: bool,
}

/// Locate the first `{% endraw %}` (any spacing, optional trim
/// markers) in `rest`.
fn find_endraw(rest: &str) -> Option<EndrawMatch> {
    let bytes = rest.as_bytes();
    let mut search = 0;
    while let Some(off) = rest[search..].find("{%") {
        let start = search + off;
        let mut p = start + 2;
        let left_trim = bytes.get(p) == Some(&b'-');
        if left_trim {
            p += 1;
        }
        while matches!(bytes.get(p), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            p += 1;
        }
        if rest[p..].starts_with("endraw") {
            p += "endraw".len();
            while matches!(bytes.get(p), Some(b' ' | b'\t' | b'\r' | b'\n')) {
                p += 1;
            }
            let right_trim = bytes.get(p) == Some(&b'-');
            if right_trim {
                p += 1;
            }
            if rest[p..].starts_with("%}") {
                return Some(EndrawMatch {
                    content_len: start,
                    match_len: p + 2 - start,
                    left_trim,
                    right_trim,
                });
            }
        }
        search = start + 2;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<TokenKind> {
        tokenize(source, &EngineConfig::default())
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn lex_with(source: &str, config: &EngineConfig) -> Vec<TokenKind> {
        tokenize(source, config)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(
            lex("Hello!"),
            vec![TokenKind::Text("Hello!".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_variable_expression() {
        assert_eq!(
            lex("Hello {{ name }}!"),
            vec![
                TokenKind::Text("Hello ".to_string()),
                TokenKind::VarStart(false),
                TokenKind::Ident("name".to_string()),
                TokenKind::VarEnd(false),
                TokenKind::Text("!".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_punctuation() {
        assert_eq!(
            lex("{% if x >= 10 and not done %}"),
            vec![
                TokenKind::BlockStart(false),
                TokenKind::Keyword(Keyword::If),
                TokenKind::Ident("x".to_string()),
                TokenKind::Ge,
                TokenKind::Int(10),
                TokenKind::Keyword(Keyword::And),
                TokenKind::Keyword(Keyword::Not),
                TokenKind::Ident("done".to_string()),
                TokenKind::BlockEnd(false),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_longest_match_operators() {
        assert_eq!(
            lex("{{ 2 ** 3 // 4 == 5 }}"),
            vec![
                TokenKind::VarStart(false),
                TokenKind::Int(2),
                TokenKind::Pow,
                TokenKind::Int(3),
                TokenKind::FloorDiv,
                TokenKind::Int(4),
                TokenKind::Eq,
                TokenKind::Int(5),
                TokenKind::VarEnd(false),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numeric_literals() {
        assert_eq!(
            lex("{{ 42 3.25 1e3 }}"),
            vec![
                TokenKind::VarStart(false),
                TokenKind::Int(42),
                TokenKind::Float(3.25),
                TokenKind::Float(1000.0),
                TokenKind::VarEnd(false),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            lex(r#"{{ "a\nb" '\'' }}"#),
            vec![
                TokenKind::VarStart(false),
                TokenKind::Str("a\nb".to_string()),
                TokenKind::Str("'".to_string()),
                TokenKind::VarEnd(false),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_invalid_escape_rejected() {
        let err = tokenize(r#"{{ "a\qb" }}"#, &EngineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("invalid escape sequence"));
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("{{ 'oops }}", &EngineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("unterminated string"));
    }

    #[test]
    fn test_unterminated_delimiter() {
        let err = tokenize("{{ name", &EngineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_comment_emits_nothing() {
        assert_eq!(
            lex("a{# hidden #}b"),
            vec![
                TokenKind::Text("a".to_string()),
                TokenKind::Text("b".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_comment() {
        let err = tokenize("{# never ends", &EngineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("unterminated comment"));
    }

    #[test]
    fn test_trim_markers() {
        assert_eq!(
            lex("a   {{- x -}}   b"),
            vec![
                TokenKind::Text("a".to_string()),
                TokenKind::VarStart(true),
                TokenKind::Ident("x".to_string()),
                TokenKind::VarEnd(true),
                TokenKind::Text("b".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_trim_strips_through_newlines() {
        assert_eq!(
            lex("a\n  \n{%- if x %}"),
            vec![
                TokenKind::Text("a".to_string()),
                TokenKind::BlockStart(true),
                TokenKind::Keyword(Keyword::If),
                TokenKind::Ident("x".to_string()),
                TokenKind::BlockEnd(false),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_trim_blocks() {
        let config = EngineConfig {
            trim_blocks: true,
            ..EngineConfig::default()
        };
        assert_eq!(
            lex_with("{% if x %}\nbody", &config),
            vec![
                TokenKind::BlockStart(false),
                TokenKind::Keyword(Keyword::If),
                TokenKind::Ident("x".to_string()),
                TokenKind::BlockEnd(false),
                TokenKind::Text("body".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lstrip_blocks() {
        let config = EngineConfig {
            lstrip_blocks: true,
            ..EngineConfig::default()
        };
        assert_eq!(
            lex_with("x\n    {% if y %}", &config),
            vec![
                TokenKind::Text("x\n".to_string()),
                TokenKind::BlockStart(false),
                TokenKind::Keyword(Keyword::If),
                TokenKind::Ident("y".to_string()),
                TokenKind::BlockEnd(false),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lstrip_leaves_nonblank_lines() {
        let config = EngineConfig {
            lstrip_blocks: true,
            ..EngineConfig::default()
        };
        // the tag does not sit alone on its line, so nothing is stripped
        assert_eq!(
            lex_with("value: {% if y %}", &config),
            vec![
                TokenKind::Text("value: ".to_string()),
                TokenKind::BlockStart(false),
                TokenKind::Keyword(Keyword::If),
                TokenKind::Ident("y".to_string()),
                TokenKind::BlockEnd(false),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keep_trailing_newline() {
        assert_eq!(
            lex("hi\n"),
            vec![TokenKind::Text("hi".to_string()), TokenKind::Eof]
        );
        let config = EngineConfig {
            keep_trailing_newline: true,
            ..EngineConfig::default()
        };
        assert_eq!(
            lex_with("hi\n", &config),
            vec![TokenKind::Text("hi\n".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_raw_block_is_opaque() {
        assert_eq!(
            lex("{% raw %}{{ not lexed }}{% endraw %}"),
            vec![
                TokenKind::BlockStart(false),
                TokenKind::Keyword(Keyword::Raw),
                TokenKind::BlockEnd(false),
                TokenKind::Text("{{ not lexed }}".to_string()),
                TokenKind::BlockStart(false),
                TokenKind::Keyword(Keyword::Endraw),
                TokenKind::BlockEnd(false),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_raw_missing_endraw() {
        let err = tokenize("{% raw %}stuck", &EngineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("endraw"));
    }

    #[test]
    fn test_spans_track_lines() {
        let tokens = tokenize("line1\n{{ x }}", &EngineConfig::default()).unwrap();
        let var_start = tokens
            .iter()
            .find(|t| matches!(t.kind, TokenKind::VarStart(_)))
            .unwrap();
        assert_eq!(var_start.span.line, 2);
        assert_eq!(var_start.span.col, 1);
        let ident = tokens
            .iter()
            .find(|t| matches!(t.kind, TokenKind::Ident(_)))
            .unwrap();
        assert_eq!(ident.span.line, 2);
        assert_eq!(ident.span.col, 4);
    }

    #[test]
    fn test_raw_keyword_requires_tag_position() {
        // `raw` as a plain identifier inside an expression is untouched
        let kinds = lex("{{ raw }}");
        assert_eq!(
            kinds,
            vec![
                TokenKind::VarStart(false),
                TokenKind::Keyword(Keyword::Raw),
                TokenKind::VarEnd(false),
                TokenKind::Eof,
            ]
        );
    }
}
