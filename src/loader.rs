use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Error raised while resolving an `include` statement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IncludeError {
    #[error("{target:?}: file does not exist or is not a regular file")]
    Missing { target: String },
    #[error("include cycle through {target:?}")]
    Cycle { target: String },
    #[error("{target:?}: {reason}")]
    Io { target: String, reason: String },
}

/// Capability to turn `include` targets into source buffers.
///
/// The parser only ever calls [`resolve`](Loader::resolve) to canonicalize
/// a target (also the key for cycle detection) and [`load`](Loader::load)
/// to fetch its text; where the text comes from is the caller's business.
pub trait Loader {
    /// Canonical name for `target` when included from `from` (`<string>`
    /// for in-memory sources).
    fn resolve(&self, target: &str, from: &str) -> String {
        let _ = from;
        target.to_string()
    }

    fn load(&self, name: &str) -> Result<String, IncludeError>;
}

/// Loads includes from the filesystem, resolving relative targets against
/// the including file's directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsLoader;

impl Loader for FsLoader {
    fn resolve(&self, target: &str, from: &str) -> String {
        let expanded = expand_user(target);
        let path = Path::new(&expanded);
        if path.is_absolute() || from == "<string>" || from.is_empty() {
            return expanded;
        }
        let dir = Path::new(from).parent().unwrap_or_else(|| Path::new(""));
        dir.join(path).to_string_lossy().into_owned()
    }

    fn load(&self, name: &str) -> Result<String, IncludeError> {
        if !Path::new(name).is_file() {
            return Err(IncludeError::Missing {
                target: name.to_string(),
            });
        }
        fs::read_to_string(name).map_err(|e| match e.kind() {
            ErrorKind::NotFound => IncludeError::Missing {
                target: name.to_string(),
            },
            _ => IncludeError::Io {
                target: name.to_string(),
                reason: e.to_string(),
            },
        })
    }
}

fn expand_user(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest).to_string_lossy().into_owned();
        }
    }
    target.to_string()
}

/// In-memory loader keyed by target name; handy for tests and embedded
/// configuration sets.
#[derive(Debug, Clone, Default)]
pub struct MemLoader {
    sources: HashMap<String, String>,
}

impl MemLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.sources.insert(name.into(), source.into());
        self
    }
}

impl Loader for MemLoader {
    fn load(&self, name: &str) -> Result<String, IncludeError> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| IncludeError::Missing {
                target: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_loader_resolves_relative_to_including_file() {
        let loader = FsLoader;
        assert_eq!(
            loader.resolve("sub/extra.cfg", "/etc/conf/main.cfg"),
            "/etc/conf/sub/extra.cfg"
        );
        assert_eq!(loader.resolve("/abs.cfg", "/etc/conf/main.cfg"), "/abs.cfg");
        assert_eq!(loader.resolve("rel.cfg", "<string>"), "rel.cfg");
    }

    #[test]
    fn mem_loader_round_trip() {
        let mut loader = MemLoader::new();
        loader.insert("base.cfg", "x = 1\n");
        assert_eq!(loader.load("base.cfg").unwrap(), "x = 1\n");
        assert_eq!(
            loader.load("other.cfg"),
            Err(IncludeError::Missing {
                target: "other.cfg".into()
            })
        );
    }
}
