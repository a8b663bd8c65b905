// ABOUTME: Error types for template compilation and rendering failures

use crate::ast::Span;
use thiserror::Error;

/// Render an optional source location as a display suffix.
fn at(span: &Option<Span>) -> String {
    match span {
        Some(s) => format!(" (line {}, column {})", s.line, s.col),
        None => String::new(),
    }
}

/// Render an optional suggestion as a display suffix.
fn hint(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!("; did you mean `{s}`?"),
        None => String::new(),
    }
}

#[derive(Error, Debug)]
pub enum TemplateError {
    /// Lexer or parser failure: unterminated delimiter, unexpected token,
    /// missing closer, positional argument after a keyword argument.
    #[error("syntax error: {message}{}", at(span))]
    Syntax { message: String, span: Option<Span> },

    /// Read of an undefined name or attribute under the strict policy.
    #[error("undefined value: `{name}` is not defined{}", at(span))]
    Undefined { name: String, span: Option<Span> },

    /// Operator applied to incompatible operands, iteration over a
    /// non-iterable, or bad argument binding.
    #[error("type error: {message}{}", at(span))]
    Type { message: String, span: Option<Span> },

    /// Division or modulo by zero, integer overflow.
    #[error("math error: {message}{}", at(span))]
    Math { message: String, span: Option<Span> },

    /// Reference to a macro, filter, test, or extension tag that is not
    /// registered at runtime.
    #[error("name error: {message}{}{}", hint(suggestion), at(span))]
    Name {
        message: String,
        suggestion: Option<String>,
        span: Option<Span>,
    },

    /// The loader could not locate a named template.
    #[error("template not found: `{name}`")]
    NotFound { name: String },

    /// `super()` outside a block, no parent definition to reach, or a
    /// cycle in the extends chain.
    #[error("inheritance error: {message}{}", at(span))]
    Inheritance { message: String, span: Option<Span> },

    /// Wraps a failure raised by an extension's parse or evaluate
    /// callback, or by one of its lifecycle hooks.
    #[error("extension `{extension}` failed in tag `{tag}`: {source}")]
    Extension {
        extension: String,
        tag: String,
        #[source]
        source: Box<TemplateError>,
    },
}

impl TemplateError {
    /// Create a syntax error at a known source location
    pub fn syntax(message: impl Into<String>, span: Span) -> Self {
        TemplateError::Syntax {
            message: message.into(),
            span: Some(span),
        }
    }

    /// Create a syntax error with no usable location
    pub fn syntax_unlocated(message: impl Into<String>) -> Self {
        TemplateError::Syntax {
            message: message.into(),
            span: None,
        }
    }

    pub fn undefined(name: impl Into<String>, span: Option<Span>) -> Self {
        TemplateError::Undefined {
            name: name.into(),
            span,
        }
    }

    pub fn type_error(message: impl Into<String>, span: Option<Span>) -> Self {
        TemplateError::Type {
            message: message.into(),
            span,
        }
    }

    pub fn math_error(message: impl Into<String>, span: Option<Span>) -> Self {
        TemplateError::Math {
            message: message.into(),
            span,
        }
    }

    pub fn name_error(message: impl Into<String>, span: Option<Span>) -> Self {
        TemplateError::Name {
            message: message.into(),
            suggestion: None,
            span,
        }
    }

    /// Name error carrying a nearest-registered-name suggestion
    pub fn name_error_with_suggestion(
        message: impl Into<String>,
        suggestion: Option<String>,
        span: Option<Span>,
    ) -> Self {
        TemplateError::Name {
            message: message.into(),
            suggestion,
            span,
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        TemplateError::NotFound { name: name.into() }
    }

    pub fn inheritance(message: impl Into<String>, span: Option<Span>) -> Self {
        TemplateError::Inheritance {
            message: message.into(),
            span,
        }
    }

    /// Wrap an inner failure in extension context
    pub fn extension(extension: impl Into<String>, tag: impl Into<String>, inner: Self) -> Self {
        TemplateError::Extension {
            extension: extension.into(),
            tag: tag.into(),
            source: Box::new(inner),
        }
    }

    /// The source location attached to this error, if any
    pub fn span(&self) -> Option<Span> {
        match self {
            TemplateError::Syntax { span, .. }
            | TemplateError::Undefined { span, .. }
            | TemplateError::Type { span, .. }
            | TemplateError::Math { span, .. }
            | TemplateError::Name { span, .. }
            | TemplateError::Inheritance { span, .. } => *span,
            TemplateError::NotFound { .. } => None,
            TemplateError::Extension { source, .. } => source.span(),
        }
    }
}

/// Pick the registered name closest to `wanted`, for "did you mean"
/// suggestions on unknown filter/test/tag references. Only names within
/// an edit distance of 2 qualify.
pub(crate) fn closest_name<'a, I>(wanted: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(usize, &str)> = None;
    for candidate in candidates {
        let dist = edit_distance(wanted, candidate);
        if dist <= 2 && best.map_or(true, |(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }
    best.map(|(_, name)| name.to_string())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
