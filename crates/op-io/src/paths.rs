//! Mapping package names to files under the content root

use op_core::config::PathConfig;
use std::path::{Path, PathBuf};

/// Header and optional body locations of one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagePaths {
    pub header: PathBuf,
    pub body: PathBuf,
}

/// Resolves `/Game/Foo` to `<root>/Game/Foo.<ext>`
#[derive(Debug, Clone)]
pub struct ContentPaths {
    root: PathBuf,
    header_extension: String,
    body_extension: String,
}

impl ContentPaths {
    pub fn new(config: &PathConfig) -> Self {
        Self {
            root: config.content_root.clone(),
            header_extension: config.header_extension.clone(),
            body_extension: config.body_extension.clone(),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// File locations for `package`, or `None` for names that can't map to a file
    pub fn resolve(&self, package: &str) -> Option<PackagePaths> {
        let relative = package.trim_start_matches('/');
        if relative.is_empty()
            || relative
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return None;
        }
        let base = self.root.join(relative);
        Some(PackagePaths {
            header: with_suffix(&base, &self.header_extension),
            body: with_suffix(&base, &self.body_extension),
        })
    }
}

// Package names may contain dots, so append instead of replacing an extension
fn with_suffix(base: &Path, extension: &str) -> PathBuf {
    let mut path = base.as_os_str().to_os_string();
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

impl Default for ContentPaths {
    fn default() -> Self {
        Self::new(&PathConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let paths = ContentPaths::default().with_root("/data");
        let resolved = paths.resolve("/Game/Maps/Level").unwrap();
        assert_eq!(resolved.header, Path::new("/data/Game/Maps/Level.pak"));
        assert_eq!(resolved.body, Path::new("/data/Game/Maps/Level.pakb"));

        let dotted = paths.resolve("/Game/Hero.v2").unwrap();
        assert_eq!(dotted.header, Path::new("/data/Game/Hero.v2.pak"));
    }

    #[test]
    fn test_rejects_escaping_names() {
        let paths = ContentPaths::default();
        assert!(paths.resolve("/Game/../etc").is_none());
        assert!(paths.resolve("").is_none());
        assert!(paths.resolve("/Game//A").is_none());
    }
}
