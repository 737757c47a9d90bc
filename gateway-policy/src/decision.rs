//! Tool-call decisions returned by the policy chain.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Describes the outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Tool may run.
    Allow,
    /// Tool must not run.
    Deny,
}

/// Binding verdict for one tool invocation.
///
/// `reason` is present iff the call is denied; `rewritten_input` is present
/// iff the call is allowed and an interceptor changed the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDecision {
    decision: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rewritten_input: Option<Value>,
}

impl ToolCallDecision {
    /// Allows the call with its original input.
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            decision: DecisionKind::Allow,
            reason: None,
            rewritten_input: None,
        }
    }

    /// Allows the call with a modified input.
    #[must_use]
    pub const fn allow_rewritten(input: Value) -> Self {
        Self {
            decision: DecisionKind::Allow,
            reason: None,
            rewritten_input: Some(input),
        }
    }

    /// Denies the call.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: DecisionKind::Deny,
            reason: Some(reason.into()),
            rewritten_input: None,
        }
    }

    /// Returns the decision kind.
    #[must_use]
    pub const fn kind(&self) -> DecisionKind {
        self.decision
    }

    /// Returns true when the call may proceed.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        self.decision == DecisionKind::Allow
    }

    /// Returns true when the call is rejected.
    #[must_use]
    pub fn is_deny(&self) -> bool {
        self.decision == DecisionKind::Deny
    }

    /// Returns the denial reason.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Returns the rewritten input, if any interceptor changed it.
    #[must_use]
    pub const fn rewritten_input(&self) -> Option<&Value> {
        self.rewritten_input.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decision_helpers_work() {
        let allow = ToolCallDecision::allow();
        assert!(allow.is_allow());
        assert!(allow.reason().is_none());
        assert!(allow.rewritten_input().is_none());

        let deny = ToolCallDecision::deny("blocked");
        assert!(deny.is_deny());
        assert_eq!(deny.reason(), Some("blocked"));

        let rewritten = ToolCallDecision::allow_rewritten(json!({"file_path": "/w/a"}));
        assert_eq!(rewritten.kind(), DecisionKind::Allow);
        assert_eq!(rewritten.rewritten_input(), Some(&json!({"file_path": "/w/a"})));
    }

    #[test]
    fn wire_shape_omits_absent_fields() {
        let encoded = serde_json::to_value(ToolCallDecision::deny("no")).unwrap();
        assert_eq!(encoded, json!({"decision": "deny", "reason": "no"}));
    }
}
