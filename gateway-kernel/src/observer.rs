//! Policy decision observers and the tool gate handed to the backend.

use std::sync::Arc;

use gateway_adapters::ToolGate;
use gateway_policy::{DecisionKind, PolicyChain, ToolCallDecision};
use gateway_primitives::ExecutionKey;
use serde_json::Value;
use tracing::{debug, warn};

/// Observer invoked for every tool-call decision.
pub trait PolicyObserver: Send + Sync {
    /// Records the decision emitted for `tool` within `execution_key`.
    fn on_decision(&self, execution_key: &ExecutionKey, tool: &str, decision: &ToolCallDecision);
}

/// Observer that emits decisions to the tracing system.
#[derive(Debug, Default)]
pub struct TracingPolicyObserver;

impl PolicyObserver for TracingPolicyObserver {
    fn on_decision(&self, execution_key: &ExecutionKey, tool: &str, decision: &ToolCallDecision) {
        match decision.kind() {
            DecisionKind::Allow => {
                debug!(
                    execution_key = %execution_key,
                    tool,
                    rewritten = decision.rewritten_input().is_some(),
                    "policy allow"
                );
            }
            DecisionKind::Deny => {
                warn!(
                    execution_key = %execution_key,
                    tool,
                    reason = decision.reason().unwrap_or_default(),
                    "policy deny"
                );
            }
        }
    }
}

/// Composite observer that forwards decisions to a collection of observers.
#[derive(Default)]
pub struct CompositePolicyObserver {
    observers: Vec<Arc<dyn PolicyObserver>>,
}

impl CompositePolicyObserver {
    /// Creates a new composite observer from the supplied list.
    #[must_use]
    pub fn new<I>(observers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn PolicyObserver>>,
    {
        Self {
            observers: observers.into_iter().collect(),
        }
    }

    /// Adds an observer to the composite set.
    pub fn push(&mut self, observer: Arc<dyn PolicyObserver>) {
        self.observers.push(observer);
    }
}

impl PolicyObserver for CompositePolicyObserver {
    fn on_decision(&self, execution_key: &ExecutionKey, tool: &str, decision: &ToolCallDecision) {
        for observer in &self.observers {
            observer.on_decision(execution_key, tool, decision);
        }
    }
}

/// Tool gate for one execution: evaluates the chain and notifies the observer.
pub(crate) struct PolicyGate {
    chain: Arc<PolicyChain>,
    observer: Arc<dyn PolicyObserver>,
    execution_key: ExecutionKey,
}

impl PolicyGate {
    pub(crate) fn new(
        chain: Arc<PolicyChain>,
        observer: Arc<dyn PolicyObserver>,
        execution_key: ExecutionKey,
    ) -> Self {
        Self {
            chain,
            observer,
            execution_key,
        }
    }
}

impl ToolGate for PolicyGate {
    fn review(&self, tool: &str, input: &Value) -> ToolCallDecision {
        let decision = self.chain.evaluate(tool, input);
        self.observer.on_decision(&self.execution_key, tool, &decision);
        decision
    }
}
