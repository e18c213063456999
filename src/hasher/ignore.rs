use crate::constants::{CACHE_DIR_NAME, GEN_DIR_NAME, OUT_DIR_NAME};
use glob::Pattern;
use std::path::Path;

/// Name patterns excluded when a source directory is expanded.
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Output roots and the cache directory, which must never feed back
    /// into a rule's inputs through a directory source.
    pub fn build_dirs() -> Self {
        Self::parse(&[OUT_DIR_NAME, GEN_DIR_NAME, CACHE_DIR_NAME].join("\n"))
    }

    /// One glob per line; blank lines and `#` comments are skipped.
    pub fn parse(content: &str) -> Self {
        let patterns = content
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| Pattern::new(l).ok())
            .collect();
        Self { patterns }
    }

    /// True if any component of `path` (relative to the walked directory)
    /// matches a pattern.
    pub fn is_ignored(&self, path: &Path) -> bool {
        path.components().any(|component| {
            let name = component.as_os_str().to_string_lossy();
            self.patterns.iter().any(|p| p.matches(&name))
        })
    }
}
