// ABOUTME: Engine configuration: whitespace control, undefined policy, autoescape mode

use crate::autoescape::{context_for_name, EscapeContext};
use std::fmt;
use std::sync::Arc;

/// How reads of undefined names behave during rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndefinedPolicy {
    /// Undefined values render as empty output
    #[default]
    Silent,
    /// Any use of an undefined value raises `TemplateError::Undefined`
    Strict,
    /// Undefined values render as a visible diagnostic marker
    Debug,
}

/// How the default escape context for a render is chosen.
#[derive(Clone, Default)]
pub enum Autoescape {
    /// Never escape unless a template enables it with `{% autoescape %}`
    #[default]
    Disabled,
    /// Always escape for the given context
    Fixed(EscapeContext),
    /// Choose by the template name's file extension (`.html` → HTML, …)
    ByExtension,
    /// Caller-supplied selector; receives the template name when the
    /// template was loaded by name
    Callback(Arc<dyn Fn(Option<&str>) -> EscapeContext + Send + Sync>),
}

impl Autoescape {
    /// Resolve the escape context for a template. `name` is `None` for
    /// templates compiled from literal strings.
    pub fn context_for(&self, name: Option<&str>) -> EscapeContext {
        match self {
            Autoescape::Disabled => EscapeContext::None,
            Autoescape::Fixed(ctx) => *ctx,
            Autoescape::ByExtension => match name {
                Some(n) => context_for_name(n),
                None => EscapeContext::None,
            },
            Autoescape::Callback(f) => f(name),
        }
    }
}

impl fmt::Debug for Autoescape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Autoescape::Disabled => write!(f, "Disabled"),
            Autoescape::Fixed(ctx) => write!(f, "Fixed({ctx:?})"),
            Autoescape::ByExtension => write!(f, "ByExtension"),
            Autoescape::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

/// Engine-wide configuration, fixed at environment construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Strip the first newline after a `%}` block tag
    pub trim_blocks: bool,
    /// Strip leading whitespace on lines that hold only a block tag
    pub lstrip_blocks: bool,
    /// Retain a single trailing newline at the end of template source
    pub keep_trailing_newline: bool,
    pub undefined: UndefinedPolicy,
    pub autoescape: Autoescape,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: false,
            undefined: UndefinedPolicy::Silent,
            autoescape: Autoescape::Disabled,
        }
    }
}
