//! Ordered interceptor chain.

use std::path::PathBuf;

use gateway_config::PolicyConfig;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::PATH_KEYS;
use crate::decision::ToolCallDecision;
use crate::paths::{SkillRoots, expand_home, normalize};
use crate::rewrite::WorkspacePathRewrite;
use crate::sensitive::SensitivePathGuard;
use crate::skills::SkillWriteGuard;

/// Errors raised while assembling a policy chain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// Configuration cannot produce a sound chain.
    #[error("invalid policy configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// What one interceptor decided about a tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum Intercept {
    /// Leave the input untouched.
    Pass,
    /// Continue with a modified input.
    Rewrite(Value),
    /// Reject the call; the rest of the chain is skipped.
    Deny(String),
}

/// The interceptors the gateway ships with.
#[derive(Debug, Clone)]
pub enum Interceptor {
    /// Makes structured path arguments absolute.
    WorkspacePaths(WorkspacePathRewrite),
    /// Blocks writes into the live skills tree.
    SkillWrite(SkillWriteGuard),
    /// Blocks any access to sensitive roots.
    SensitivePath(SensitivePathGuard),
}

impl Interceptor {
    /// Stable name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WorkspacePaths(_) => "workspace_paths",
            Self::SkillWrite(_) => "skill_write_guard",
            Self::SensitivePath(_) => "sensitive_path_guard",
        }
    }

    /// Runs the interceptor against one call.
    #[must_use]
    pub fn intercept(&self, tool: &str, input: &Value) -> Intercept {
        match self {
            Self::WorkspacePaths(inner) => inner.intercept(tool, input),
            Self::SkillWrite(inner) => inner.intercept(tool, input),
            Self::SensitivePath(inner) => inner.intercept(tool, input),
        }
    }
}

/// Fixed, ordered list of interceptors.
#[derive(Debug, Clone, Default)]
pub struct PolicyChain {
    interceptors: Vec<Interceptor>,
}

impl PolicyChain {
    /// Creates a chain from explicit interceptors, evaluated in order.
    #[must_use]
    pub fn new(interceptors: Vec<Interceptor>) -> Self {
        Self { interceptors }
    }

    /// Builds the standard chain: path rewrite, skill guard, sensitive guard.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidConfig`] when the skill roots are empty or
    /// identical, or a sensitive root cannot be made absolute.
    pub fn from_config(config: &PolicyConfig) -> PolicyResult<Self> {
        let roots = SkillRoots::new(&config.active_skills_dir, &config.draft_skills_dir);
        if !roots.is_valid() {
            return Err(PolicyError::InvalidConfig(
                "active and draft skill directories must be non-empty and distinct".into(),
            ));
        }

        let home = config.home_dir.as_deref();
        let workspace = config.workspace_root.as_deref().map(normalize);
        let sensitive_roots = config
            .sensitive_roots
            .iter()
            .map(|root| {
                let expanded = expand_home(&root.to_string_lossy(), home);
                match (&workspace, expanded.is_absolute()) {
                    (_, true) => Ok(normalize(&expanded)),
                    (Some(base), false) => Ok(normalize(&base.join(expanded))),
                    (None, false) => Err(PolicyError::InvalidConfig(format!(
                        "sensitive root `{}` is relative and no workspace root is set",
                        root.display()
                    ))),
                }
            })
            .collect::<PolicyResult<Vec<PathBuf>>>()?;

        let mut interceptors = vec![Interceptor::WorkspacePaths(WorkspacePathRewrite::new(
            workspace.clone(),
            config.home_dir.clone(),
        ))];
        interceptors.push(Interceptor::SkillWrite(
            SkillWriteGuard::new(roots, workspace.clone()).with_symlink_resolution(config.resolve_symlinks),
        ));
        if !sensitive_roots.is_empty() {
            interceptors.push(Interceptor::SensitivePath(
                SensitivePathGuard::new(sensitive_roots, workspace, config.home_dir.clone())
                    .with_symlink_resolution(config.resolve_symlinks),
            ));
        }
        Ok(Self { interceptors })
    }

    /// Returns the interceptors in evaluation order.
    #[must_use]
    pub fn interceptors(&self) -> &[Interceptor] {
        &self.interceptors
    }

    /// Evaluates a tool call.
    ///
    /// Each interceptor sees the input as rewritten by earlier ones. The first
    /// denial wins; with no intervention the call is allowed unchanged.
    #[must_use]
    pub fn evaluate(&self, tool: &str, input: &Value) -> ToolCallDecision {
        let mut rewritten: Option<Value> = None;
        for interceptor in &self.interceptors {
            let current = rewritten.as_ref().unwrap_or(input);
            match interceptor.intercept(tool, current) {
                Intercept::Pass => {}
                Intercept::Rewrite(next) => {
                    debug!(tool, interceptor = interceptor.name(), "tool input rewritten");
                    rewritten = Some(next);
                }
                Intercept::Deny(reason) => {
                    debug!(tool, interceptor = interceptor.name(), %reason, "tool call denied");
                    return ToolCallDecision::deny(reason);
                }
            }
        }
        match rewritten {
            Some(next) if next != *input => ToolCallDecision::allow_rewritten(next),
            _ => ToolCallDecision::allow(),
        }
    }
}

/// Yields `(key, value)` for every string path argument in `input`.
pub(crate) fn path_arguments(input: &Value) -> impl Iterator<Item = (&'static str, &str)> {
    PATH_KEYS
        .iter()
        .filter_map(move |key| input.get(*key).and_then(Value::as_str).map(|value| (*key, value)))
}
