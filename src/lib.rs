// ABOUTME: Library root: a Jinja2-dialect template engine with
// inheritance, macros, filters, tests, and autoescaping

pub mod ast;
pub mod autoescape;
pub mod config;
pub mod environment;
pub mod error;
pub mod eval;
pub mod extensions;
pub mod filters;
pub mod forloop;
pub mod inheritance;
pub mod lexer;
pub mod loader;
pub mod macros;
pub mod parser;
pub mod scope;
pub mod template;
pub mod testers;
pub mod value;

pub use autoescape::EscapeContext;
pub use config::{Autoescape, EngineConfig, UndefinedPolicy};
pub use environment::Environment;
pub use error::TemplateError;
pub use extensions::{Extension, ExtensionNode, ExtensionRegistry};
pub use filters::{FilterFn, FilterState};
pub use loader::{ChainLoader, FileSystemLoader, Loader, StringLoader, TemplateSource, Version};
pub use template::CompiledTemplate;
pub use testers::TestFn;
pub use value::{Kwargs, NativeCallable, Value};
