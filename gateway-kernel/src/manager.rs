//! Session/pool manager: admits executions into pools, serialises calls per
//! execution key, resumes backend sessions and streams typed events back.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::{Stream, StreamExt};
use gateway_adapters::{
    BackendError, BackendEvent, BackendRequest, ConversationBackend, ExecutionOptions,
};
use gateway_policy::PolicyChain;
use gateway_primitives::{ExecutionKey, PoolKey, PoolTier};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::observer::{PolicyGate, PolicyObserver, TracingPolicyObserver};
use crate::pool::{PoolRegistry, PoolStats};
use crate::session::{SessionRecord, SessionStore};

const EVENT_BUFFER: usize = 64;

/// Errors surfaced before an execution stream exists.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    /// The manager has been destroyed.
    #[error("session manager is shutting down")]
    ShuttingDown,
}

/// Result alias for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// One prompt to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Trust tier selecting the pool limit.
    pub tier: PoolTier,
    /// Pool the execution is admitted into.
    pub pool_key: PoolKey,
    /// Conversation the prompt belongs to.
    pub execution_key: ExecutionKey,
    /// Prompt text.
    pub prompt: String,
    /// Options forwarded to the backend.
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    /// Creates a request with default options.
    #[must_use]
    pub fn new(
        tier: PoolTier,
        pool_key: PoolKey,
        execution_key: ExecutionKey,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            tier,
            pool_key,
            execution_key,
            prompt: prompt.into(),
            options: ExecutionOptions::default(),
        }
    }

    /// Replaces the backend options.
    #[must_use]
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }
}

/// Terminal outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    /// Whether the backend reported success.
    pub success: bool,
    /// Backend-reported spend.
    pub cost_usd: f64,
    /// Model turns taken.
    pub num_turns: u32,
    /// Wall time from admission request to completion.
    pub duration_ms: u64,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionSummary {
    fn failure(error: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            cost_usd: 0.0,
            num_turns: 0,
            duration_ms: elapsed_ms(started),
            error: Some(error.into()),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Event delivered to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Backend session id for this conversation.
    System {
        /// Identifier announced by the backend.
        session_id: String,
    },
    /// Incremental output.
    Delta {
        /// Text fragment.
        text: String,
    },
    /// Final event of every stream.
    Done(ExecutionSummary),
}

impl ExecutionEvent {
    /// Returns the summary when this is the terminal event.
    #[must_use]
    pub const fn summary(&self) -> Option<&ExecutionSummary> {
        match self {
            Self::Done(summary) => Some(summary),
            _ => None,
        }
    }
}

/// Event stream for one execution.
///
/// Dropping it cancels the backend conversation and releases the pool slot
/// and execution-key lock.
pub struct ExecutionStream {
    execution_key: ExecutionKey,
    events: mpsc::Receiver<ExecutionEvent>,
}

impl ExecutionStream {
    /// Returns the conversation this stream belongs to.
    #[must_use]
    pub const fn execution_key(&self) -> &ExecutionKey {
        &self.execution_key
    }
}

impl fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("execution_key", &self.execution_key)
            .finish_non_exhaustive()
    }
}

impl Stream for ExecutionStream {
    type Item = ExecutionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

struct Driver {
    backend: Arc<dyn ConversationBackend>,
    pools: Arc<PoolRegistry>,
    sessions: Arc<SessionStore>,
    policy: Arc<PolicyChain>,
    observer: Arc<dyn PolicyObserver>,
}

impl Driver {
    async fn run(
        &self,
        request: ExecutionRequest,
        events: &mpsc::Sender<ExecutionEvent>,
        started: Instant,
    ) {
        let key = request.execution_key;
        let _key_lock = self.sessions.lock(&key).await;
        let slot = match self.pools.acquire(request.tier, &request.pool_key).await {
            Ok(slot) => slot,
            Err(err) => {
                let _ = events
                    .send(ExecutionEvent::Done(ExecutionSummary::failure(
                        err.to_string(),
                        started,
                    )))
                    .await;
                return;
            }
        };

        let resume = self.sessions.resume_id(&key);
        self.sessions.touch(&key);
        debug!(
            execution_key = %key,
            pool = %slot.pool(),
            resume = resume.as_deref().unwrap_or_default(),
            backend = self.backend.name(),
            "execution admitted"
        );

        let gate = PolicyGate::new(
            Arc::clone(&self.policy),
            Arc::clone(&self.observer),
            key.clone(),
        );
        let backend_request = BackendRequest::new(request.prompt, Arc::new(gate))
            .with_resume(resume)
            .with_options(request.options);

        let mut stream = match self.backend.open(backend_request).await {
            Ok(stream) => stream,
            Err(err) => {
                self.on_backend_error(&key, &err);
                let _ = events
                    .send(ExecutionEvent::Done(ExecutionSummary::failure(
                        err.to_string(),
                        started,
                    )))
                    .await;
                return;
            }
        };

        let mut announced = false;
        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(BackendEvent::System { session_id }) => {
                    if announced {
                        continue;
                    }
                    announced = true;
                    self.sessions.record_session_id(&key, &session_id);
                    ExecutionEvent::System { session_id }
                }
                Ok(BackendEvent::Delta { text }) => ExecutionEvent::Delta { text },
                Ok(BackendEvent::Result {
                    success,
                    cost_usd,
                    num_turns,
                    error,
                }) => {
                    if success {
                        self.sessions.record_success(&key);
                    }
                    let summary = ExecutionSummary {
                        success,
                        cost_usd,
                        num_turns,
                        duration_ms: elapsed_ms(started),
                        error,
                    };
                    info!(
                        execution_key = %key,
                        success,
                        num_turns,
                        duration_ms = summary.duration_ms,
                        "execution finished"
                    );
                    let _ = events.send(ExecutionEvent::Done(summary)).await;
                    return;
                }
                Err(err) => {
                    self.on_backend_error(&key, &err);
                    let _ = events
                        .send(ExecutionEvent::Done(ExecutionSummary::failure(
                            err.to_string(),
                            started,
                        )))
                        .await;
                    return;
                }
            };
            if events.send(event).await.is_err() {
                return;
            }
        }

        warn!(execution_key = %key, "backend stream ended without a result");
        let _ = events
            .send(ExecutionEvent::Done(ExecutionSummary::failure(
                "backend stream ended without a result",
                started,
            )))
            .await;
    }

    fn on_backend_error(&self, key: &ExecutionKey, err: &BackendError) {
        if err.is_invalid_session() {
            self.sessions.remove(key);
            warn!(execution_key = %key, error = %err, "backend session invalid; record cleared");
        } else {
            warn!(execution_key = %key, error = %err, "backend execution failed");
        }
    }
}

/// Orchestrates executions against the conversational backend.
pub struct SessionPoolManager {
    driver: Arc<Driver>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl fmt::Debug for SessionPoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPoolManager")
            .field("backend", &self.driver.backend.name())
            .field("pools", &self.driver.pools.len())
            .field("sessions", &self.driver.sessions.len())
            .field("in_flight", &self.tasks.len())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SessionPoolManager {
    /// Creates a manager that logs policy decisions through tracing.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ConversationBackend>,
        pools: PoolRegistry,
        policy: PolicyChain,
    ) -> Self {
        Self::with_observer(backend, pools, policy, Arc::new(TracingPolicyObserver))
    }

    /// Creates a manager with a custom policy observer.
    #[must_use]
    pub fn with_observer(
        backend: Arc<dyn ConversationBackend>,
        pools: PoolRegistry,
        policy: PolicyChain,
        observer: Arc<dyn PolicyObserver>,
    ) -> Self {
        Self {
            driver: Arc::new(Driver {
                backend,
                pools: Arc::new(pools),
                sessions: Arc::new(SessionStore::new()),
                policy: Arc::new(policy),
                observer,
            }),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Starts an execution and returns its event stream.
    ///
    /// The stream always ends with [`ExecutionEvent::Done`] unless the caller
    /// drops it first. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::ShuttingDown`] after [`SessionPoolManager::destroy`].
    pub fn execute(&self, request: ExecutionRequest) -> ManagerResult<ExecutionStream> {
        if self.shutdown.is_cancelled() || self.tasks.is_closed() {
            return Err(ManagerError::ShuttingDown);
        }

        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
        let execution_key = request.execution_key.clone();
        let driver = Arc::clone(&self.driver);
        let shutdown = self.shutdown.clone();
        let started = Instant::now();

        self.tasks.spawn(async move {
            let key = request.execution_key.clone();
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    let _ = sender.try_send(ExecutionEvent::Done(ExecutionSummary::failure(
                        "gateway shutting down",
                        started,
                    )));
                    debug!(execution_key = %key, "execution cancelled by shutdown");
                }
                () = sender.closed() => {
                    debug!(execution_key = %key, "caller disconnected; execution cancelled");
                }
                () = driver.run(request, &sender, started) => {}
            }
        });

        Ok(ExecutionStream {
            execution_key,
            events: receiver,
        })
    }

    /// Forgets the backend session for `key`; the next call starts fresh.
    pub fn end_session(&self, key: &ExecutionKey) -> Option<SessionRecord> {
        let removed = self.driver.sessions.remove(key);
        if removed.is_some() {
            info!(execution_key = %key, "session ended");
        }
        removed
    }

    /// Returns the session record for `key`.
    #[must_use]
    pub fn session(&self, key: &ExecutionKey) -> Option<SessionRecord> {
        self.driver.sessions.get(key)
    }

    /// Returns the number of session records.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.driver.sessions.len()
    }

    /// Returns occupancy of the pool for `tier` and `key`, if it exists.
    #[must_use]
    pub fn pool_stats(&self, tier: PoolTier, key: &PoolKey) -> Option<PoolStats> {
        self.driver.pools.stats(tier, key)
    }

    /// Returns the number of executions still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` once [`SessionPoolManager::destroy`] has started.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancels every in-flight execution, closes the pools and clears all
    /// session records. Idempotent.
    pub async fn destroy(&self) {
        self.shutdown.cancel();
        self.driver.pools.close();
        self.tasks.close();
        self.tasks.wait().await;
        self.driver.sessions.clear();
        self.driver.pools.clear();
        info!("session manager destroyed");
    }
}
