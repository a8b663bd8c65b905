// ABOUTME: Template source loaders: name → source text with freshness
// tokens, over in-memory maps, the filesystem, or a chain of loaders

use crate::error::TemplateError;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::SystemTime;

/// Opaque freshness token for a template source. The compile cache
/// re-uses a compilation only while the loader reports the same
/// version: a monotonic counter for in-memory sources, the mtime for
/// files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version {
    Counter(u64),
    Mtime(SystemTime),
}

#[derive(Debug, Clone)]
pub struct TemplateSource {
    pub source: String,
    pub version: Version,
}

/// Source-text provider keyed by template name.
pub trait Loader: Send + Sync {
    fn get_source(&self, name: &str) -> Result<TemplateSource, TemplateError>;

    /// Cheap freshness probe; the default falls back to a full load.
    fn version(&self, name: &str) -> Option<Version> {
        self.get_source(name).ok().map(|s| s.version)
    }

    /// Advisory: whether the loader holds this source in memory
    fn is_cached(&self, _name: &str) -> bool {
        false
    }

    /// Known template names, sorted and de-duplicated
    fn list_templates(&self) -> Vec<String> {
        Vec::new()
    }
}

// ============================================================================
// String loader
// ============================================================================

/// In-memory loader. Re-adding a template under the same name bumps
/// its version so cached compilations are replaced.
#[derive(Debug, Default)]
pub struct StringLoader {
    templates: RwLock<HashMap<String, (String, u64)>>,
    counter: AtomicU64,
}

impl StringLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_template(&self, name: impl Into<String>, source: impl Into<String>) {
        let version = self.counter.fetch_add(1, Ordering::Relaxed);
        self.templates
            .write()
            .expect("loader lock poisoned")
            .insert(name.into(), (source.into(), version));
    }
}

impl Loader for StringLoader {
    fn get_source(&self, name: &str) -> Result<TemplateSource, TemplateError> {
        let templates = self.templates.read().expect("loader lock poisoned");
        match templates.get(name) {
            Some((source, version)) => Ok(TemplateSource {
                source: source.clone(),
                version: Version::Counter(*version),
            }),
            None => Err(TemplateError::not_found(name)),
        }
    }

    fn version(&self, name: &str) -> Option<Version> {
        let templates = self.templates.read().expect("loader lock poisoned");
        templates.get(name).map(|(_, v)| Version::Counter(*v))
    }

    fn is_cached(&self, name: &str) -> bool {
        self.templates
            .read()
            .expect("loader lock poisoned")
            .contains_key(name)
    }

    fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .templates
            .read()
            .expect("loader lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

// ============================================================================
// Filesystem loader
// ============================================================================

/// Loads templates from an ordered list of search roots, optionally
/// restricted to an extension whitelist.
#[derive(Debug)]
pub struct FileSystemLoader {
    roots: Vec<PathBuf>,
    /// Allowed extensions (without the dot); empty allows everything
    extensions: Vec<String>,
}

impl FileSystemLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            roots: vec![root.into()],
            extensions: Vec::new(),
        }
    }

    pub fn with_roots<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            extensions: Vec::new(),
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    fn allowed(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        self.extensions.iter().any(|allowed| allowed == ext)
    }

    /// Resolve a template name under a root, rejecting names that
    /// escape it.
    fn resolve(root: &Path, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return None,
            }
        }
        Some(root.join(relative))
    }

    fn walk(dir: &Path, prefix: &str, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let name = if prefix.is_empty() {
                file_name.to_string()
            } else {
                format!("{prefix}/{file_name}")
            };
            if path.is_dir() {
                Self::walk(&path, &name, out);
            } else {
                out.push(name);
            }
        }
    }
}

impl Loader for FileSystemLoader {
    fn get_source(&self, name: &str) -> Result<TemplateSource, TemplateError> {
        if !self.allowed(name) {
            return Err(TemplateError::not_found(name));
        }
        for root in &self.roots {
            let Some(path) = Self::resolve(root, name) else {
                return Err(TemplateError::not_found(name));
            };
            if let Ok(source) = std::fs::read_to_string(&path) {
                let version = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .map(Version::Mtime)
                    .unwrap_or(Version::Counter(0));
                return Ok(TemplateSource { source, version });
            }
        }
        Err(TemplateError::not_found(name))
    }

    fn version(&self, name: &str) -> Option<Version> {
        if !self.allowed(name) {
            return None;
        }
        for root in &self.roots {
            let path = Self::resolve(root, name)?;
            if let Ok(meta) = std::fs::metadata(&path) {
                return meta.modified().ok().map(Version::Mtime);
            }
        }
        None
    }

    fn list_templates(&self) -> Vec<String> {
        let mut names = Vec::new();
        for root in &self.roots {
            Self::walk(root, "", &mut names);
        }
        names.retain(|n| self.allowed(n));
        names.sort();
        names.dedup();
        names
    }
}

// ============================================================================
// Chain loader
// ============================================================================

/// Tries child loaders in order; the first hit wins.
#[derive(Default)]
pub struct ChainLoader {
    loaders: Vec<Box<dyn Loader>>,
}

impl ChainLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, loader: impl Loader + 'static) {
        self.loaders.push(Box::new(loader));
    }
}

impl Loader for ChainLoader {
    fn get_source(&self, name: &str) -> Result<TemplateSource, TemplateError> {
        for loader in &self.loaders {
            match loader.get_source(name) {
                Ok(source) => return Ok(source),
                Err(TemplateError::NotFound { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(TemplateError::not_found(name))
    }

    fn version(&self, name: &str) -> Option<Version> {
        self.loaders.iter().find_map(|l| l.version(name))
    }

    fn is_cached(&self, name: &str) -> bool {
        self.loaders.iter().any(|l| l.is_cached(name))
    }

    fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .loaders
            .iter()
            .flat_map(|l| l.list_templates())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_loader_roundtrip() {
        let loader = StringLoader::new();
        loader.add_template("a", "hello");
        let got = loader.get_source("a").unwrap();
        assert_eq!(got.source, "hello");
        assert!(loader.is_cached("a"));
        assert!(!loader.is_cached("b"));
        assert!(matches!(
            loader.get_source("b"),
            Err(TemplateError::NotFound { .. })
        ));
    }

    #[test]
    fn test_string_loader_version_bumps_on_readd() {
        let loader = StringLoader::new();
        loader.add_template("a", "v1");
        let first = loader.version("a").unwrap();
        loader.add_template("a", "v2");
        let second = loader.version("a").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_string_loader_list_sorted() {
        let loader = StringLoader::new();
        loader.add_template("z", "");
        loader.add_template("a", "");
        loader.add_template("m", "");
        assert_eq!(loader.list_templates(), vec!["a", "m", "z"]);
    }

    #[test]
    fn test_fs_loader_rejects_escaping_names() {
        let root = Path::new("/tmp/does-not-matter");
        assert!(FileSystemLoader::resolve(root, "../etc/passwd").is_none());
        assert!(FileSystemLoader::resolve(root, "/etc/passwd").is_none());
        assert!(FileSystemLoader::resolve(root, "sub/page.html").is_some());
    }

    #[test]
    fn test_fs_loader_extension_whitelist() {
        let loader = FileSystemLoader::new("/tmp").with_extensions(["html", "txt"]);
        assert!(loader.allowed("page.html"));
        assert!(loader.allowed("notes.txt"));
        assert!(!loader.allowed("script.py"));
        assert!(!loader.allowed("noext"));
    }

    #[test]
    fn test_chain_loader_first_hit_wins() {
        let first = StringLoader::new();
        first.add_template("shared", "from-first");
        first.add_template("only-first", "x");
        let second = StringLoader::new();
        second.add_template("shared", "from-second");
        second.add_template("only-second", "y");

        let mut chain = ChainLoader::new();
        chain.push(first);
        chain.push(second);

        assert_eq!(chain.get_source("shared").unwrap().source, "from-first");
        assert_eq!(chain.get_source("only-second").unwrap().source, "y");
        assert!(chain.get_source("absent").is_err());
        assert_eq!(
            chain.list_templates(),
            vec!["only-first", "only-second", "shared"]
        );
    }
}
