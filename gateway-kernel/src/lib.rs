//! Execution kernel for the agent gateway.
//!
//! The [`Gateway`] owns every piece of per-process state: the internal auth
//! codec and its nonce cache, the approval verifier and its consumed-token
//! set, the [`SessionPoolManager`] with its pools and session records, and the
//! service health tracker. It can only be built from a
//! [`SandboxClearance`](gateway_sandbox::SandboxClearance).

#![warn(missing_docs, clippy::pedantic)]

mod gateway;
mod lifecycle;
mod manager;
mod observer;
mod pool;
mod session;

pub use gateway::{
    EXECUTE_METHOD, EXECUTE_PATH, ExecutionPayload, Gateway, GatewayBuilder, GatewayError,
    GatewayResult, SECRET_STORE_SERVICE,
};
pub use lifecycle::{GatewayState, Lifecycle, LifecycleError, LifecycleEvent, LifecycleResult};
pub use manager::{
    ExecutionEvent, ExecutionRequest, ExecutionStream, ExecutionSummary, ManagerError,
    ManagerResult, SessionPoolManager,
};
pub use observer::{CompositePolicyObserver, PolicyObserver, TracingPolicyObserver};
pub use pool::{PoolError, PoolId, PoolRegistry, PoolResult, PoolSlot, PoolStats};
pub use session::{ExecutionLock, SessionRecord, SessionStore};
