//! Skill write guard.
//!
//! Agents may draft new skills but must never modify the live ones. Writes
//! into the live tree are denied; the same paths under the draft tree pass.

use std::path::PathBuf;

use serde_json::Value;
use tracing::warn;

use crate::WRITE_TOOLS;
use crate::engine::{Intercept, path_arguments};
use crate::paths::{PathClass, SkillRoots, absolutize, resolve_symlinks};

/// Denies write-style tools targeting the live skills tree.
#[derive(Debug, Clone)]
pub struct SkillWriteGuard {
    roots: SkillRoots,
    workspace_root: Option<PathBuf>,
    resolve_symlinks: bool,
    write_tools: Vec<String>,
}

impl SkillWriteGuard {
    /// Creates a guard for the built-in write tools.
    #[must_use]
    pub fn new(roots: SkillRoots, workspace_root: Option<PathBuf>) -> Self {
        Self {
            roots,
            workspace_root,
            resolve_symlinks: true,
            write_tools: WRITE_TOOLS.iter().map(|tool| (*tool).to_owned()).collect(),
        }
    }

    /// Also classifies the symlink-resolved form of each path.
    #[must_use]
    pub fn with_symlink_resolution(mut self, enabled: bool) -> Self {
        self.resolve_symlinks = enabled;
        self
    }

    /// Adds a tool name treated as write-style.
    #[must_use]
    pub fn with_write_tool(mut self, tool: impl Into<String>) -> Self {
        self.write_tools.push(tool.into());
        self
    }

    /// Classifies `raw`, taking the stricter of the lexical and resolved forms.
    #[must_use]
    pub fn classify(&self, raw: &str) -> PathClass {
        let lexical = absolutize(raw, self.workspace_root.as_deref(), None);
        let class = self.roots.classify(&lexical);
        if class == PathClass::Active || !self.resolve_symlinks {
            return class;
        }
        match resolve_symlinks(&lexical) {
            Ok(resolved) => match self.roots.classify(&resolved) {
                PathClass::Active => PathClass::Active,
                _ => class,
            },
            // An unresolvable link could point anywhere, including the live tree.
            Err(_) => PathClass::Active,
        }
    }

    pub(crate) fn intercept(&self, tool: &str, input: &Value) -> Intercept {
        if !self.write_tools.iter().any(|name| name == tool) {
            return Intercept::Pass;
        }
        for (key, raw) in path_arguments(input) {
            if self.classify(raw) == PathClass::Active {
                warn!(tool, key, path = raw, "write to active skill blocked");
                return Intercept::Deny(format!(
                    "writes to active skills are not allowed ({raw}); write the skill under the draft skills directory instead"
                ));
            }
        }
        Intercept::Pass
    }
}
