//! Lifecycle state machine for the gateway service.

use thiserror::Error;
use tracing::debug;

/// States the gateway can occupy during its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    /// Constructed; dependencies not yet wired.
    Init,
    /// Accepting execution requests.
    Ready,
    /// Refusing new work while in-flight streams are cancelled.
    Draining,
    /// Fully torn down; nothing further may run.
    Destroyed,
}

impl GatewayState {
    /// Returns `true` when requests are accepted.
    #[must_use]
    pub const fn accepts_requests(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns `true` once the gateway has been destroyed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

/// Events that trigger lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Finish wiring dependencies.
    Boot,
    /// Stop admitting work and cancel what is running.
    Drain,
    /// Finalise teardown.
    Destroy,
}

/// Lifecycle state manager.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    state: GatewayState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Creates a lifecycle in [`GatewayState::Init`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: GatewayState::Init,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> GatewayState {
        self.state
    }

    /// Applies a lifecycle event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the supplied event is not
    /// allowed from the current state.
    pub fn transition(&mut self, event: LifecycleEvent) -> LifecycleResult<GatewayState> {
        let next = match (self.state, event) {
            (GatewayState::Init, LifecycleEvent::Boot) => Some(GatewayState::Ready),
            (GatewayState::Init | GatewayState::Ready | GatewayState::Draining, LifecycleEvent::Drain) => {
                Some(GatewayState::Draining)
            }
            (_, LifecycleEvent::Destroy) => Some(GatewayState::Destroyed),
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                event,
            });
        };

        if next_state != self.state {
            debug!(?self.state, ?next_state, ?event, "gateway lifecycle transition");
            self.state = next_state;
        }

        Ok(self.state)
    }
}

/// Errors emitted by the lifecycle controller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid gateway lifecycle transition from {from:?} via {event:?}")]
    InvalidTransition {
        /// State prior to the attempted transition.
        from: GatewayState,
        /// Event that triggered the failure.
        event: LifecycleEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_drain_destroy_flow() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), GatewayState::Init);
        lifecycle.transition(LifecycleEvent::Boot).unwrap();
        assert!(lifecycle.state().accepts_requests());
        lifecycle.transition(LifecycleEvent::Drain).unwrap();
        assert!(!lifecycle.state().accepts_requests());
        lifecycle.transition(LifecycleEvent::Destroy).unwrap();
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(LifecycleEvent::Destroy).unwrap();
        lifecycle.transition(LifecycleEvent::Destroy).unwrap();
        assert_eq!(lifecycle.state(), GatewayState::Destroyed);
    }

    #[test]
    fn destroyed_gateway_cannot_reboot() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(LifecycleEvent::Boot).unwrap();
        lifecycle.transition(LifecycleEvent::Destroy).unwrap();

        let err = lifecycle
            .transition(LifecycleEvent::Boot)
            .expect_err("boot after destroy should fail");
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                from: GatewayState::Destroyed,
                event: LifecycleEvent::Boot
            }
        );
        assert!(lifecycle.transition(LifecycleEvent::Drain).is_err());
    }
}
