//! Adapters connecting the gateway to the outside world.
//!
//! [`traits`] defines the contract with the conversational backend (typed
//! event stream, tool gate). [`secret_store`] implements the credential
//! broker against the remote secret store.

#![warn(missing_docs, clippy::pedantic)]

pub mod secret_store;
pub mod traits;

pub use secret_store::SecretStoreBroker;
pub use traits::{
    AllowAllGate, BackendError, BackendEvent, BackendRequest, BackendResult, BackendStream,
    ConversationBackend, ExecutionOptions, ToolGate,
};
