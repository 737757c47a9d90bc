#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use gateway_adapters::{
    BackendError, BackendEvent, BackendRequest, BackendResult, BackendStream,
    ConversationBackend, ToolGate,
};
use gateway_policy::ToolCallDecision;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

/// One scripted backend action.
pub enum Step {
    Emit(BackendEvent),
    Fail(BackendError),
    /// Blocks until the notify fires.
    Wait(Arc<Notify>),
    /// Blocks forever.
    Hang,
    /// Offers a tool call to the gate and emits the decision as a delta.
    Tool(&'static str, Value),
}

#[derive(Default)]
pub struct Script {
    pub open_error: Option<BackendError>,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn steps(steps: Vec<Step>) -> Self {
        Self {
            open_error: None,
            steps,
        }
    }

    pub fn refuse(error: BackendError) -> Self {
        Self {
            open_error: Some(error),
            steps: Vec::new(),
        }
    }
}

pub fn system(session_id: &str) -> Step {
    Step::Emit(BackendEvent::System {
        session_id: session_id.to_owned(),
    })
}

pub fn delta(text: &str) -> Step {
    Step::Emit(BackendEvent::Delta {
        text: text.to_owned(),
    })
}

pub fn success() -> Step {
    Step::Emit(BackendEvent::Result {
        success: true,
        cost_usd: 0.02,
        num_turns: 1,
        error: None,
    })
}

/// Renders a decision the way the scripted backend reports it.
pub fn describe(decision: &ToolCallDecision) -> String {
    match (decision.is_deny(), decision.rewritten_input()) {
        (true, _) => format!("deny: {}", decision.reason().unwrap_or_default()),
        (false, Some(rewritten)) => format!("allow: {rewritten}"),
        (false, None) => "allow".to_owned(),
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(live: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Self {
        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Playback {
    steps: VecDeque<Step>,
    gate: Arc<dyn ToolGate>,
    _live: LiveGuard,
}

/// Backend that replays one script per `open` call, in order.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    resumes: Mutex<Vec<Option<String>>>,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    /// Resume directive passed on each `open`, in call order.
    pub fn resumes(&self) -> Vec<Option<String>> {
        self.resumes.lock().clone()
    }

    pub fn opened(&self) -> usize {
        self.resumes.lock().len()
    }

    /// Streams currently alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously alive streams.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, request: BackendRequest) -> BackendResult<BackendStream> {
        self.resumes
            .lock()
            .push(request.resume().map(str::to_owned));
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        if let Some(error) = script.open_error {
            return Err(error);
        }

        let playback = Playback {
            steps: script.steps.into(),
            gate: Arc::clone(request.tool_gate()),
            _live: LiveGuard::enter(&self.live, &self.peak),
        };
        Ok(Box::pin(stream::unfold(playback, |mut playback| async move {
            loop {
                match playback.steps.pop_front()? {
                    Step::Emit(event) => return Some((Ok(event), playback)),
                    Step::Fail(error) => return Some((Err(error), playback)),
                    Step::Wait(notify) => notify.notified().await,
                    Step::Hang => futures::future::pending::<()>().await,
                    Step::Tool(tool, input) => {
                        let decision = playback.gate.review(tool, &input);
                        let text = describe(&decision);
                        return Some((Ok(BackendEvent::Delta { text }), playback));
                    }
                }
            }
        })))
    }
}

/// Polls `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
