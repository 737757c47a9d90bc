//! Sensitive-path guard.
//!
//! Structured path arguments are checked component-wise against each root.
//! Shell commands get a second, text-level check, since a generic shell tool
//! can reach any path without naming it in a structured argument.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::SHELL_TOOL;
use crate::engine::{Intercept, path_arguments};
use crate::paths::{absolutize, resolve_symlinks, unify_separators};

const SHELL_SEPARATORS: &[char] = &[
    ';', '|', '&', '<', '>', '(', ')', '{', '}', '`', '\'', '"', '=', ',', '$',
];

enum PathCheck<'a> {
    Clear,
    Inside(&'a Path),
    Unresolvable(String),
}

/// Denies any tool invocation that touches a sensitive root.
#[derive(Debug, Clone)]
pub struct SensitivePathGuard {
    roots: Vec<PathBuf>,
    workspace_root: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    resolve_symlinks: bool,
    shell_tools: Vec<String>,
}

impl SensitivePathGuard {
    /// Creates a guard over absolute, normalised `roots`.
    #[must_use]
    pub fn new(
        roots: Vec<PathBuf>,
        workspace_root: Option<PathBuf>,
        home_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            roots,
            workspace_root,
            home_dir,
            resolve_symlinks: true,
            shell_tools: vec![SHELL_TOOL.to_owned()],
        }
    }

    /// Also checks the symlink-resolved form of structured paths.
    #[must_use]
    pub fn with_symlink_resolution(mut self, enabled: bool) -> Self {
        self.resolve_symlinks = enabled;
        self
    }

    /// Returns the guarded roots.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn root_containing(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .find(|root| path.starts_with(root))
            .map(PathBuf::as_path)
    }

    fn check_path(&self, raw: &str) -> PathCheck<'_> {
        let lexical = absolutize(raw, self.workspace_root.as_deref(), self.home_dir.as_deref());
        if let Some(root) = self.root_containing(&lexical) {
            return PathCheck::Inside(root);
        }
        if !self.resolve_symlinks {
            return PathCheck::Clear;
        }
        match resolve_symlinks(&lexical) {
            Ok(resolved) => self
                .root_containing(&resolved)
                .map_or(PathCheck::Clear, PathCheck::Inside),
            Err(err) => PathCheck::Unresolvable(err.to_string()),
        }
    }

    /// Spellings of `root` a command might contain verbatim.
    fn textual_forms(&self, root: &Path) -> Vec<String> {
        let mut forms = vec![root.to_string_lossy().into_owned()];
        if let Some(home) = &self.home_dir {
            if let Ok(relative) = root.strip_prefix(home) {
                let relative = relative.to_string_lossy();
                forms.push(format!("~/{relative}"));
                forms.push(format!("$HOME/{relative}"));
                forms.push(format!("${{HOME}}/{relative}"));
            }
        }
        forms
    }

    fn check_command(&self, command: &str) -> Option<&Path> {
        let unified = unify_separators(command);
        for root in &self.roots {
            if self
                .textual_forms(root)
                .iter()
                .any(|form| unified.contains(form.as_str()))
            {
                return Some(root);
            }
        }
        unified
            .split(|ch: char| ch.is_whitespace() || SHELL_SEPARATORS.contains(&ch))
            .filter(|token| token.contains('/') || token.starts_with('~'))
            .find_map(|token| {
                let lexical =
                    absolutize(token, self.workspace_root.as_deref(), self.home_dir.as_deref());
                self.root_containing(&lexical)
            })
    }

    pub(crate) fn intercept(&self, tool: &str, input: &Value) -> Intercept {
        for (key, raw) in path_arguments(input) {
            match self.check_path(raw) {
                PathCheck::Clear => {}
                PathCheck::Inside(root) => {
                    warn!(tool, key, path = raw, root = %root.display(), "sensitive path blocked");
                    return Intercept::Deny(format!(
                        "access to {} is not allowed",
                        root.display()
                    ));
                }
                PathCheck::Unresolvable(error) => {
                    warn!(tool, key, path = raw, %error, "unresolvable path blocked");
                    return Intercept::Deny(format!("path {raw} could not be resolved"));
                }
            }
        }

        if self.shell_tools.iter().any(|name| name == tool) {
            if let Some(command) = input.get("command").and_then(Value::as_str) {
                if let Some(root) = self.check_command(command) {
                    warn!(tool, root = %root.display(), "shell command referencing sensitive path blocked");
                    return Intercept::Deny(format!(
                        "shell commands may not reference {}",
                        root.display()
                    ));
                }
            }
        }
        Intercept::Pass
    }
}
