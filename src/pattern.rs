//! Glob patterns resolved against absolute paths.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};

use crate::{Error, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A glob made absolute once, at construction, against the working
/// directory.
///
/// Both expansion results and paths passed to [`matches`](Self::matches) are
/// compared in lexically normalized absolute form, so `./logs/a.log` and
/// `/cwd/logs/a.log` are the same file.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    pattern: Pattern,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let raw = if Path::new(pattern).is_absolute() {
            normalize(Path::new(pattern))
        } else {
            let cwd = std::env::current_dir()?;
            let cwd = cwd.to_str().ok_or_else(|| {
                Error::Config(format!(
                    "working directory {} is not valid UTF-8",
                    cwd.display()
                ))
            })?;
            normalize(Path::new(&format!("{}/{}", Pattern::escape(cwd), pattern)))
        };
        let raw = raw.to_string_lossy().into_owned();
        let pattern = Pattern::new(&raw)?;

        Ok(GlobPattern { raw, pattern })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern can match at arbitrary directory depth.
    pub fn is_recursive(&self) -> bool {
        self.raw.contains("**")
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.pattern
            .matches_path_with(&absolute(path), MATCH_OPTIONS)
    }

    /// Everything currently on disk matching the pattern, files and
    /// directories alike. Unreadable entries are logged and left out.
    pub fn expand(&self) -> HashSet<PathBuf> {
        let entries = match glob::glob_with(&self.raw, MATCH_OPTIONS) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(pattern = %self.raw, error = %e, "expanding glob");
                return HashSet::new();
            }
        };

        entries
            .filter_map(|entry| match entry {
                Ok(path) => Some(normalize(&path)),
                Err(e) => {
                    tracing::warn!(path = %e.path().display(), error = %e.error(), "reading glob match");
                    None
                }
            })
            .collect()
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Makes `path` absolute against the working directory, then normalizes it.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return normalize(path);
    }
    match std::env::current_dir() {
        Ok(cwd) => normalize(&cwd.join(path)),
        Err(_) => normalize(path),
    }
}

/// Drops `.` components and resolves `..` against the preceding component,
/// without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
