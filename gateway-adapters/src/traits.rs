//! Contract between the gateway and the conversational backend.
//!
//! The backend is opaque: it takes a prompt plus options and yields a stream
//! of typed events. Before running any tool it must offer the call to the
//! [`ToolGate`] carried by the request and honour the decision.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use gateway_policy::ToolCallDecision;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result alias used by backends.
pub type BackendResult<T> = Result<T, BackendError>;

/// Event stream produced by [`ConversationBackend::open`].
///
/// Dropping the stream cancels the underlying conversation.
pub type BackendStream = Pin<Box<dyn Stream<Item = BackendResult<BackendEvent>> + Send>>;

/// Error type shared by backend implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The resume target is unknown or expired on the backend.
    #[error("backend session invalid: {reason}")]
    InvalidSession {
        /// Backend-supplied detail.
        reason: String,
    },

    /// Backend is misconfigured.
    #[error("backend not configured: {reason}")]
    Configuration {
        /// Additional context for the failure.
        reason: String,
    },

    /// Transport-level failure (process, network, protocol).
    #[error("backend transport error: {reason}")]
    Transport {
        /// Additional context about the error.
        reason: String,
    },

    /// The backend produced something the gateway cannot interpret.
    #[error("backend response error: {reason}")]
    Response {
        /// Additional context about the response failure.
        reason: String,
    },
}

impl BackendError {
    /// Convenience constructor for invalid sessions.
    #[must_use]
    pub fn invalid_session(reason: impl Into<String>) -> Self {
        Self::InvalidSession {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for transport failures.
    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for malformed responses.
    #[must_use]
    pub fn response(reason: impl Into<String>) -> Self {
        Self::Response {
            reason: reason.into(),
        }
    }

    /// Returns true when the backend no longer knows the resumed session.
    #[must_use]
    pub const fn is_invalid_session(&self) -> bool {
        matches!(self, Self::InvalidSession { .. })
    }
}

/// Typed event emitted by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    /// System-level event announcing the backend session id.
    System {
        /// Identifier to pass back as the resume directive.
        session_id: String,
    },
    /// Incremental assistant output.
    Delta {
        /// Text fragment.
        text: String,
    },
    /// Terminal outcome of the conversation turn.
    Result {
        /// Whether the turn completed successfully.
        success: bool,
        /// Backend-reported spend.
        #[serde(default)]
        cost_usd: f64,
        /// Model turns taken.
        #[serde(default)]
        num_turns: u32,
        /// Failure detail when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Caller-supplied knobs forwarded to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Model override.
    pub model: Option<String>,
    /// Extra system prompt text.
    pub system_prompt: Option<String>,
    /// Upper bound on model turns.
    pub max_turns: Option<u32>,
    /// Tools the backend may offer; empty means the backend default.
    pub allowed_tools: Vec<String>,
    /// Working directory for tools.
    pub cwd: Option<PathBuf>,
}

/// Pre-execution hook every tool invocation must pass through.
pub trait ToolGate: Send + Sync {
    /// Reviews one tool call. The decision is binding.
    fn review(&self, tool: &str, input: &Value) -> ToolCallDecision;
}

/// Gate that allows every call unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllGate;

impl ToolGate for AllowAllGate {
    fn review(&self, _tool: &str, _input: &Value) -> ToolCallDecision {
        ToolCallDecision::allow()
    }
}

/// One request to open a backend conversation stream.
#[derive(Clone)]
pub struct BackendRequest {
    prompt: String,
    resume: Option<String>,
    options: ExecutionOptions,
    tool_gate: Arc<dyn ToolGate>,
}

impl fmt::Debug for BackendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRequest")
            .field("prompt_len", &self.prompt.len())
            .field("resume", &self.resume)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BackendRequest {
    /// Creates a request for a fresh conversation.
    #[must_use]
    pub fn new(prompt: impl Into<String>, tool_gate: Arc<dyn ToolGate>) -> Self {
        Self {
            prompt: prompt.into(),
            resume: None,
            options: ExecutionOptions::default(),
            tool_gate,
        }
    }

    /// Resumes the given backend session.
    #[must_use]
    pub fn with_resume(mut self, session_id: Option<String>) -> Self {
        self.resume = session_id;
        self
    }

    /// Attaches caller options.
    #[must_use]
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the prompt text.
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Returns the resume directive, if any.
    #[must_use]
    pub fn resume(&self) -> Option<&str> {
        self.resume.as_deref()
    }

    /// Returns the caller options.
    #[must_use]
    pub const fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Returns the gate tool calls must pass through.
    #[must_use]
    pub fn tool_gate(&self) -> &Arc<dyn ToolGate> {
        &self.tool_gate
    }
}

/// A stateful conversational backend.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Opens a new event stream for `request`.
    ///
    /// Errors returned here (rather than inside the stream) mean the
    /// conversation never started.
    async fn open(&self, request: BackendRequest) -> BackendResult<BackendStream>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn events_use_tagged_wire_shape() {
        let event = BackendEvent::System {
            session_id: "sess-1".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "system", "session_id": "sess-1"})
        );

        let done: BackendEvent =
            serde_json::from_value(json!({"type": "result", "success": false, "error": "boom"}))
                .unwrap();
        assert_eq!(
            done,
            BackendEvent::Result {
                success: false,
                cost_usd: 0.0,
                num_turns: 0,
                error: Some("boom".into())
            }
        );
    }

    #[test]
    fn request_builder_keeps_resume() {
        let request = BackendRequest::new("hi", Arc::new(AllowAllGate))
            .with_resume(Some("sess-9".into()))
            .with_options(ExecutionOptions {
                max_turns: Some(3),
                ..ExecutionOptions::default()
            });
        assert_eq!(request.resume(), Some("sess-9"));
        assert_eq!(request.options().max_turns, Some(3));
        assert!(request.tool_gate().review("Write", &json!({})).is_allow());
    }

    #[test]
    fn invalid_session_is_detectable() {
        assert!(BackendError::invalid_session("unknown id").is_invalid_session());
        assert!(!BackendError::transport("reset").is_invalid_session());
    }
}
