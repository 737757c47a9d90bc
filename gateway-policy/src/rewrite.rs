//! Canonicalises structured path arguments.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::engine::{Intercept, path_arguments};
use crate::paths::absolutize;

/// Rewrites every structured path argument to its absolute, lexically
/// normalised form so later interceptors and the tool itself agree on the
/// target.
#[derive(Debug, Clone, Default)]
pub struct WorkspacePathRewrite {
    workspace_root: Option<PathBuf>,
    home_dir: Option<PathBuf>,
}

impl WorkspacePathRewrite {
    /// Creates the interceptor. Relative paths stay relative when no
    /// workspace root is known.
    #[must_use]
    pub fn new(workspace_root: Option<PathBuf>, home_dir: Option<PathBuf>) -> Self {
        Self {
            workspace_root,
            home_dir,
        }
    }

    pub(crate) fn intercept(&self, _tool: &str, input: &Value) -> Intercept {
        let mut changes = Vec::new();
        for (key, raw) in path_arguments(input) {
            let canonical = absolutize(raw, self.workspace_root.as_deref(), self.home_dir.as_deref());
            let canonical = canonical.to_string_lossy();
            if canonical != raw && !(canonical == "." && raw.is_empty()) {
                changes.push((key, canonical.into_owned()));
            }
        }
        if changes.is_empty() {
            return Intercept::Pass;
        }

        let mut next = input.clone();
        if let Some(object) = next.as_object_mut() {
            for (key, canonical) in changes {
                object.insert(key.to_owned(), Value::String(canonical));
            }
        }
        Intercept::Rewrite(next)
    }

    /// Returns the workspace root.
    #[must_use]
    pub fn workspace_root(&self) -> Option<&Path> {
        self.workspace_root.as_deref()
    }
}
