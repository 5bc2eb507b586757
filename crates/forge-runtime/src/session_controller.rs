//! Session controller — owns a conversation's queued messages and
//! supervises one agent runner at a time.
//!
//! Lifecycle: ensure the session record exists → pop the next queued user
//! message → persist it atomically with its parts → spawn a runner bound
//! to it → supervise until the runner is done → loop while the queue is
//! non-empty. Control events (`addMessage`, `stop`,
//! `updateInteractiveToolCall`) arrive on an mpsc channel at any time and
//! never interrupt an in-flight runner except `stop`.
//!
//! While a runner is alive the controller exposes a coarse status:
//! read-only versus non-read-only tool usage (the transition is
//! irreversible, observed by callers deciding whether a dev-server restart
//! is needed) crossed with running/paused.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::gauge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use forge_core::error::AgentError;
use forge_core::events::ForgeEvent;
use forge_core::message::Session;
use forge_llm::LanguageModel;
use forge_store::{MessageWithParts, Store};

use crate::agent_runner::{AgentRunner, RunnerDeps};
use crate::config::RunnerConfig;
use crate::errors::RuntimeError;
use crate::event_emitter::EventEmitter;
use crate::interactive::{InteractiveOutcome, InteractiveTracker};
use crate::spec::AgentSpec;

/// Control channel capacity.
const CONTROL_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse tool usage over the session's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolStatus {
    /// Every tool invoked so far has been read-only.
    ReadOnly,
    /// At least one non-read-only tool has run. Irreversible.
    NonReadOnly,
}

/// Whether the runner is making progress or blocked on interactive calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    /// The runner is streaming or executing tools.
    Running,
    /// The runner is blocked on interactive tool resolution.
    Paused,
}

/// Observable snapshot of a live session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Cumulative tool usage classification.
    pub tools: ToolStatus,
    /// Current run state.
    pub run: RunState,
}

/// Shared mutable status, written by the runner/executor and read by
/// observers through [`SessionHandle::status`].
#[derive(Clone, Default)]
pub struct StatusHandle {
    inner: Arc<StatusInner>,
}

#[derive(Default)]
struct StatusInner {
    non_read_only: AtomicBool,
    paused: AtomicBool,
}

impl StatusHandle {
    /// A fresh status: read-only, running.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a non-read-only tool ran. One-way.
    pub fn mark_non_read_only(&self) {
        self.inner.non_read_only.store(true, Ordering::Relaxed);
    }

    /// Whether any non-read-only tool has run.
    #[must_use]
    pub fn used_non_read_only(&self) -> bool {
        self.inner.non_read_only.load(Ordering::Relaxed)
    }

    /// Set the paused flag.
    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.store(paused, Ordering::Relaxed);
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            tools: if self.used_non_read_only() {
                ToolStatus::NonReadOnly
            } else {
                ToolStatus::ReadOnly
            },
            run: if self.inner.paused.load(Ordering::Relaxed) {
                RunState::Paused
            } else {
                RunState::Running
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control events and handle
// ─────────────────────────────────────────────────────────────────────────────

/// Inbound control events.
#[derive(Debug)]
pub enum SessionControl {
    /// Append a user message to the queue; never interrupts a running
    /// agent.
    AddMessage(MessageWithParts),
    /// Stop the session: cancel the active runner (if any) and finish.
    Stop,
    /// Resolve a pending interactive tool call. Unmatched ids are no-ops.
    UpdateInteractiveToolCall {
        /// Tool-call id to resolve.
        tool_call_id: String,
        /// Resolution payload.
        outcome: InteractiveOutcome,
    },
}

/// Caller-side handle to a spawned session.
pub struct SessionHandle {
    session_id: String,
    control: mpsc::Sender<SessionControl>,
    status: StatusHandle,
    emitter: Arc<EventEmitter>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// The session this handle controls.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue another user message.
    pub async fn add_message(&self, message: MessageWithParts) -> Result<(), RuntimeError> {
        self.control
            .send(SessionControl::AddMessage(message))
            .await
            .map_err(|_| RuntimeError::SessionClosed)
    }

    /// Request a stop. No-op if the controller already finished.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        self.control
            .send(SessionControl::Stop)
            .await
            .map_err(|_| RuntimeError::SessionClosed)
    }

    /// Resolve a pending interactive tool call.
    pub async fn update_interactive_tool_call(
        &self,
        tool_call_id: &str,
        outcome: InteractiveOutcome,
    ) -> Result<(), RuntimeError> {
        self.control
            .send(SessionControl::UpdateInteractiveToolCall {
                tool_call_id: tool_call_id.to_owned(),
                outcome,
            })
            .await
            .map_err(|_| RuntimeError::SessionClosed)
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.snapshot()
    }

    /// Subscribe to parent notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ForgeEvent> {
        self.emitter.subscribe()
    }

    /// Wait for the controller to finish.
    pub async fn done(self) {
        let _ = self.task.await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

/// Owns one conversation's message queue and runner supervision.
pub struct SessionController {
    session: Session,
    queue: VecDeque<MessageWithParts>,
    control_rx: mpsc::Receiver<SessionControl>,
    spec: Arc<dyn AgentSpec>,
    model: Arc<dyn LanguageModel>,
    store: Arc<dyn Store>,
    emitter: Arc<EventEmitter>,
    tracker: Arc<Mutex<InteractiveTracker>>,
    status: StatusHandle,
    config: RunnerConfig,
}

impl SessionController {
    /// Spawn a controller for `session`, seeded with the turn-triggering
    /// user message. The emitter is handed in at spawn — no global bus.
    #[must_use]
    pub fn spawn(
        session: Session,
        first_message: MessageWithParts,
        spec: Arc<dyn AgentSpec>,
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn Store>,
        config: RunnerConfig,
        emitter: Arc<EventEmitter>,
    ) -> SessionHandle {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let status = StatusHandle::new();
        let session_id = session.id.clone();
        let controller = Self {
            session,
            queue: VecDeque::from([first_message]),
            control_rx,
            spec,
            model,
            store,
            emitter: Arc::clone(&emitter),
            tracker: Arc::new(Mutex::new(InteractiveTracker::new())),
            status: status.clone(),
            config,
        };
        let task = tokio::spawn(controller.run());
        SessionHandle {
            session_id,
            control: control_tx,
            status,
            emitter,
            task,
        }
    }

    #[instrument(skip_all, fields(session_id = self.session.id))]
    async fn run(mut self) {
        gauge!("forge_active_sessions").increment(1.0);
        let persist = CancellationToken::new();

        // Ensure the session record exists, or refresh it. Fatal on failure.
        let session = match self.store.get_session(&self.session.id, &persist).await {
            Ok(Some(mut existing)) => {
                existing.touch();
                existing
            }
            Ok(None) => self.session.clone(),
            Err(err) => return self.finish(Some(AgentError::unknown(err.to_string()))),
        };
        if let Err(err) = self.store.save_session(&session, &persist).await {
            return self.finish(Some(AgentError::unknown(err.to_string())));
        }

        let mut last_error: Option<AgentError> = None;
        let mut stopping = false;

        while !stopping {
            // Pick up control events that arrived while no runner was
            // active.
            while let Ok(event) = self.control_rx.try_recv() {
                if self.handle_control(event) {
                    stopping = true;
                }
            }
            if stopping {
                break;
            }
            let Some(next) = self.queue.pop_front() else {
                break;
            };

            // All-or-nothing across the message and its parts.
            if let Err(err) = self
                .store
                .save_message_with_parts(&next.message, &next.parts, &persist)
                .await
            {
                last_error = Some(AgentError::unknown(err.to_string()));
                break;
            }
            debug!(parent_message_id = %next.message.id, "spawning agent runner");

            let stop = CancellationToken::new();
            let deps = RunnerDeps {
                spec: Arc::clone(&self.spec),
                model: Arc::clone(&self.model),
                store: Arc::clone(&self.store),
                emitter: Arc::clone(&self.emitter),
                tracker: Arc::clone(&self.tracker),
                status: self.status.clone(),
                config: self.config,
            };
            let runner = AgentRunner::new(&self.session.id, &next.message.id, deps, stop.clone());
            let mut task = tokio::spawn(runner.run());

            let error = loop {
                tokio::select! {
                    joined = &mut task => {
                        break joined.unwrap_or_else(|err| {
                            Some(AgentError::unknown(format!("runner task failed: {err}")))
                        });
                    }
                    event = self.control_rx.recv() => {
                        let stop_requested = match event {
                            Some(event) => self.handle_control(event),
                            // All handles dropped; nobody can control the
                            // session anymore. Treat as a stop.
                            None => true,
                        };
                        if stop_requested {
                            stopping = true;
                            stop.cancel();
                            break self.await_stopped(task).await;
                        }
                    }
                }
            };
            if error.is_some() {
                last_error = error;
            }
        }

        self.finish(last_error);
    }

    /// Apply one control event. Returns `true` for a stop request.
    fn handle_control(&mut self, event: SessionControl) -> bool {
        match event {
            SessionControl::AddMessage(message) => {
                self.queue.push_back(message);
                false
            }
            SessionControl::Stop => true,
            SessionControl::UpdateInteractiveToolCall {
                tool_call_id,
                outcome,
            } => {
                let _ = self.tracker.lock().resolve(&tool_call_id, outcome);
                false
            }
        }
    }

    /// Wait (with the failsafe grace) for a cancelled runner to reach its
    /// done state.
    async fn await_stopped(&self, task: JoinHandle<Option<AgentError>>) -> Option<AgentError> {
        match tokio::time::timeout(self.config.stop_grace, task).await {
            Ok(joined) => joined.unwrap_or(None),
            Err(_) => {
                warn!(
                    grace_ms = self.config.stop_grace.as_millis() as u64,
                    "runner did not reach done state within the stop grace"
                );
                None
            }
        }
    }

    fn finish(&self, error: Option<AgentError>) {
        gauge!("forge_active_sessions").decrement(1.0);
        info!(
            error = error.as_ref().map(AgentError::kind),
            used_non_read_only_tools = self.status.used_non_read_only(),
            "session finished"
        );
        let _ = self.emitter.emit(ForgeEvent::SessionDone {
            session_id: self.session.id.clone(),
            error,
            used_non_read_only_tools: self.status.used_non_read_only(),
        });
    }
}
