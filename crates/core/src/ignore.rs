//! Ignore policy: which paths are invisible to reconciliation.
//!
//! # Decision model
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | Path is the root | `Root` |
//! | Path is under the reserved metadata subtree | `Reserved` |
//! | Path is under the version-control subtree | `VersionControl` |
//! | A path segment is a dependency directory | `Dependency` |
//! | Path matches a configured glob pattern | `Pattern` |
//! | None of the above | `Include` |
//!
//! Ignored paths are neither local-only nor remote-only: the diff engine
//! never sees them.

use tracing::trace;

use crate::path::{self, ROOT};

/// Reserved subtree holding sync metadata and the storage id record.
pub const METADATA_DIR: &str = "/.treesync";

/// Reserved version-control subtree.
pub const VCS_DIR: &str = "/.git";

/// Dependency directory name excluded wherever it appears.
pub const DEPENDENCY_SEGMENT: &str = "node_modules";

/// The outcome of evaluating a path against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreDecision {
    Include,
    Root,
    Reserved,
    VersionControl,
    Dependency,
    Pattern { pattern: String },
}

impl IgnoreDecision {
    pub fn is_ignored(&self) -> bool {
        !matches!(self, Self::Include)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Include => "include",
            Self::Root => "root",
            Self::Reserved => "reserved",
            Self::VersionControl => "vcs",
            Self::Dependency => "dependency",
            Self::Pattern { .. } => "pattern",
        }
    }
}

/// Evaluates paths against the reserved subtrees and user glob patterns.
#[derive(Debug, Clone, Default)]
pub struct IgnorePolicy {
    /// Glob patterns matched against the path without its leading slash.
    patterns: Vec<String>,
}

impl IgnorePolicy {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn evaluate(&self, path: &str) -> IgnoreDecision {
        if path == ROOT {
            return IgnoreDecision::Root;
        }
        if path::is_inside(METADATA_DIR, path) {
            return IgnoreDecision::Reserved;
        }
        if path::is_inside(VCS_DIR, path) {
            return IgnoreDecision::VersionControl;
        }
        if path::segments(path).any(|s| s == DEPENDENCY_SEGMENT) {
            return IgnoreDecision::Dependency;
        }

        let relative = path.trim_start_matches('/');
        for pattern in &self.patterns {
            if glob_match::glob_match(pattern, relative) {
                trace!(path, pattern = pattern.as_str(), "path matches ignore pattern");
                return IgnoreDecision::Pattern {
                    pattern: pattern.clone(),
                };
            }
        }

        IgnoreDecision::Include
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.evaluate(path).is_ignored()
    }
}
