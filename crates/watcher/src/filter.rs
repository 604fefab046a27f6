//! Exclusion patterns for watched trees
//!
//! Patterns use gitignore syntax and are anchored at the watched root:
//! - `target/` excludes every directory named `target`
//! - `/build` excludes only the top-level `build`
//! - `*.swp` excludes editor swap files anywhere
//! - `!keep.log` re-includes a path an earlier pattern excluded
//!
//! Excluded directories are never registered with the backend, which is
//! how a recursive watch over a large tree stays under the watch budget.

use crate::error::WatchError;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PathFilter {
    /// Watched root the patterns are relative to
    root: PathBuf,

    /// Compiled patterns (None when there are none)
    matcher: Option<Gitignore>,
}

impl PathFilter {
    /// Filter that excludes nothing
    pub fn none(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            matcher: None,
        }
    }

    /// Compile `patterns` plus, optionally, a gitignore-format file
    pub fn new(root: &Path, patterns: &[String], exclude_file: Option<&Path>) -> Result<Self, WatchError> {
        if patterns.is_empty() && exclude_file.is_none() {
            return Ok(Self::none(root));
        }

        let mut builder = GitignoreBuilder::new(root);

        if let Some(file) = exclude_file {
            if let Some(err) = builder.add(file) {
                return Err(WatchError::BadConfiguration(format!(
                    "exclude file {}: {}",
                    file.display(),
                    err
                )));
            }
        }

        for pattern in patterns {
            builder.add_line(None, pattern).map_err(|e| {
                WatchError::BadConfiguration(format!("exclude pattern '{}': {}", pattern, e))
            })?;
        }

        let matcher = builder
            .build()
            .map_err(|e| WatchError::BadConfiguration(format!("exclude patterns: {}", e)))?;

        Ok(Self {
            root: root.to_path_buf(),
            matcher: Some(matcher),
        })
    }

    /// Whether `path` (absolute, under the root) is excluded.
    ///
    /// The root itself and paths outside it are never excluded.
    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        let Some(matcher) = &self.matcher else {
            return false;
        };

        match path.strip_prefix(&self.root) {
            Ok(relative) if !relative.as_os_str().is_empty() => matcher
                .matched_path_or_any_parents(relative, is_dir)
                .is_ignore(),
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.as_ref().map_or(true, |m| m.is_empty())
    }
}
