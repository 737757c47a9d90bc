//! Tool-call policy for the agent gateway.
//!
//! Every tool invocation the conversational backend wants to perform is
//! offered to a [`PolicyChain`] before it runs. Interceptors run in order;
//! each sees the input as rewritten by its predecessors and may pass, rewrite,
//! or deny. The resulting [`ToolCallDecision`] is binding.

#![warn(missing_docs, clippy::pedantic)]

pub mod decision;
pub mod engine;
pub mod paths;
pub mod rewrite;
pub mod sensitive;
pub mod skills;

pub use decision::{DecisionKind, ToolCallDecision};
pub use engine::{Intercept, Interceptor, PolicyChain, PolicyError, PolicyResult};
pub use paths::{PathClass, SkillRoots};
pub use rewrite::WorkspacePathRewrite;
pub use sensitive::SensitivePathGuard;
pub use skills::SkillWriteGuard;

/// Input keys that carry a filesystem path for the built-in tools.
pub const PATH_KEYS: [&str; 3] = ["file_path", "path", "notebook_path"];

/// Tools that create or modify files.
pub const WRITE_TOOLS: [&str; 4] = ["Write", "Edit", "MultiEdit", "NotebookEdit"];

/// Tool that runs arbitrary shell commands.
pub const SHELL_TOOL: &str = "Bash";
