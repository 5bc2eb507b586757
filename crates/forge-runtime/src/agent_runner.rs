//! Agent runner — the repeated LLM-request → tool-execution cycle for one
//! turn.
//!
//! One instance handles exactly one parent message and loops until done:
//!
//! 1. If the step budget allows, increment the step and run one stream
//!    attempt; otherwise persist the synthetic step-limit message and
//!    finish.
//! 2. Classify the attempt's error: `aborted` stops the runner; a
//!    non-retryable error ends the turn with the error preserved;
//!    retryable errors back off exponentially and re-run the same step.
//! 3. On success, execute the response's tool calls strictly sequentially,
//!    then block on interactive calls until they are resolved externally.
//! 4. Ask the agent spec whether to continue; if not, finish.
//!
//! Retries re-use the step number — the visible step count advances only
//! when a new request starts, never on a retry of the same one.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use forge_core::error::AgentError;
use forge_core::events::ForgeEvent;
use forge_core::message::{FinishReason, Message};
use forge_core::part::{Part, PartContent, SpanState, ToolCallState, ToolErrorReason};
use forge_llm::LanguageModel;
use forge_llm::format::ContextMessage;
use forge_store::Store;
use forge_tools::ToolRegistry;

use futures::StreamExt;
use futures::stream::FuturesUnordered;

use crate::config::RunnerConfig;
use crate::event_emitter::EventEmitter;
use crate::executor::execute_tool_call;
use crate::interactive::{InteractiveOutcome, InteractiveTracker};
use crate::session_controller::StatusHandle;
use crate::spec::{AgentSpec, TurnContext};
use crate::stream_request::{StreamOutcome, StreamRequest};

/// Shared collaborators handed to a runner at spawn.
#[derive(Clone)]
pub struct RunnerDeps {
    /// Per-agent-type policy.
    pub spec: Arc<dyn AgentSpec>,
    /// The model driving the turn.
    pub model: Arc<dyn LanguageModel>,
    /// Durable storage.
    pub store: Arc<dyn Store>,
    /// Parent notification channel.
    pub emitter: Arc<EventEmitter>,
    /// Pending interactive calls, resolved by the controller.
    pub tracker: Arc<Mutex<InteractiveTracker>>,
    /// Coarse session status observed by the controller.
    pub status: StatusHandle,
    /// Step/retry/watchdog limits.
    pub config: RunnerConfig,
}

/// Drives one turn for one parent message.
pub struct AgentRunner {
    session_id: String,
    parent_message_id: String,
    deps: RunnerDeps,
    registry: ToolRegistry,
    stop: CancellationToken,
}

impl AgentRunner {
    /// Bind a runner to its parent message. `stop` cancels the turn from
    /// any state.
    #[must_use]
    pub fn new(
        session_id: &str,
        parent_message_id: &str,
        deps: RunnerDeps,
        stop: CancellationToken,
    ) -> Self {
        let registry = deps.spec.tools();
        Self {
            session_id: session_id.to_owned(),
            parent_message_id: parent_message_id.to_owned(),
            deps,
            registry,
            stop,
        }
    }

    /// Run the turn to completion, returning the terminal error (if any).
    ///
    /// Emits `agent.done` with the same error before returning.
    #[instrument(skip_all, fields(session_id = self.session_id, parent_message_id = self.parent_message_id))]
    pub async fn run(mut self) -> Option<AgentError> {
        let ctx = TurnContext {
            session_id: self.session_id.clone(),
            parent_message_id: self.parent_message_id.clone(),
        };
        self.deps.spec.on_start(&ctx).await;

        let error = self.drive().await;

        self.deps.spec.on_finish(&ctx).await;
        info!(error = error.as_ref().map(AgentError::kind), "turn finished");
        let _ = self.deps.emitter.emit(ForgeEvent::AgentDone {
            session_id: self.session_id.clone(),
            error: error.clone(),
        });
        error
    }

    async fn drive(&mut self) -> Option<AgentError> {
        let context = self.deps.spec.context_messages(&self.session_id).await;
        let mut step: u32 = 0;

        loop {
            if self.stop.is_cancelled() {
                return None;
            }
            if step >= self.deps.config.max_steps {
                debug!(max_steps = self.deps.config.max_steps, "step budget exhausted");
                return match self.save_max_steps_message().await {
                    Ok(()) => None,
                    Err(err) => Some(AgentError::unknown(err.to_string())),
                };
            }
            step += 1;

            let outcome = match self.run_step(step, &context).await {
                Ok(outcome) => outcome,
                Err(terminal) => return terminal,
            };

            // Classify the tool-call parts the stream left input-available.
            let mut queue = Vec::new();
            let mut pending = Vec::new();
            for part in &outcome.parts {
                if let PartContent::ToolCall {
                    tool_name,
                    call: ToolCallState::InputAvailable { .. },
                    ..
                } = &part.content
                {
                    let interactive = self
                        .registry
                        .get(tool_name)
                        .is_some_and(|tool| tool.interactive());
                    if interactive {
                        pending.push(part.clone());
                    } else {
                        queue.push(part.clone());
                    }
                }
            }

            // Strictly sequential: one executor runs to completion before
            // the next is popped.
            for part in queue {
                if self.stop.is_cancelled() {
                    return None;
                }
                let result = execute_tool_call(
                    &part,
                    &self.registry,
                    &self.deps.store,
                    &self.deps.emitter,
                    &self.deps.status,
                    &self.stop,
                )
                .await;
                if let Err(err) = result {
                    return Some(AgentError::unknown(err.to_string()));
                }
                if self.stop.is_cancelled() {
                    // The in-flight tool was cancelled as `manual`; halt
                    // the queue.
                    return None;
                }
            }

            if !pending.is_empty() && !self.wait_for_interactive(pending).await {
                return None;
            }

            let history = match self
                .deps
                .store
                .get_messages_with_parts(&self.session_id, &CancellationToken::new())
                .await
            {
                Ok(history) => history,
                Err(err) => return Some(AgentError::unknown(err.to_string())),
            };
            if !self.deps.spec.should_continue(&history) {
                return None;
            }
        }
    }

    /// One step: stream attempts with exponential backoff until success or
    /// a terminal outcome. `Err` carries the runner's terminal error.
    async fn run_step(
        &self,
        step: u32,
        context: &[ContextMessage],
    ) -> Result<StreamOutcome, Option<AgentError>> {
        let mut retry_count: u32 = 0;
        loop {
            let request = StreamRequest {
                model: &self.deps.model,
                store: &self.deps.store,
                registry: &self.registry,
                context,
                session_id: &self.session_id,
                step,
                chunk_timeout: self.deps.config.chunk_timeout,
            };
            let outcome = match request.run(&self.stop).await {
                Ok(outcome) => outcome,
                Err(err) => return Err(Some(AgentError::unknown(err.to_string()))),
            };

            let Some(err) = outcome.message.error.clone() else {
                return Ok(outcome);
            };
            if matches!(err, AgentError::Aborted) {
                return Err(Some(err));
            }
            if !err.retryable() {
                // Fatal: unknown, api-key, a non-retryable api-call, or an
                // insufficient-credits condition.
                return Err(Some(err));
            }
            if retry_count + 1 >= self.deps.config.retry.max_retries {
                warn!(
                    retry_count,
                    error = err.kind(),
                    "retries exhausted, finishing with last error"
                );
                return Err(Some(err));
            }
            retry_count += 1;
            let delay = self.deps.config.retry.delay_for(retry_count);
            debug!(retry_count, delay_ms = delay.as_millis() as u64, error = err.kind(), "retrying step");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.stop.cancelled() => return Err(None),
            }
        }
    }

    /// Block until every pending interactive call resolves, persisting each
    /// terminal part as its resolution arrives. Returns `false` when a stop
    /// interrupted the wait (unresolved calls are terminalized as `manual`).
    async fn wait_for_interactive(&self, pending: Vec<Part>) -> bool {
        let mut waits = FuturesUnordered::new();
        {
            let mut tracker = self.deps.tracker.lock();
            for part in pending {
                let id = part
                    .tool_call_id()
                    .unwrap_or_default()
                    .to_owned();
                let rx = tracker.register(&id);
                waits.push(async move { (part, rx.await) });
            }
        }

        // Registrations exist before the pause is observable, so a caller
        // reacting to `agent.paused` can resolve immediately.
        self.deps.status.set_paused(true);
        let _ = self.deps.emitter.emit(ForgeEvent::AgentPaused {
            session_id: self.session_id.clone(),
        });
        debug!(pending = waits.len(), "waiting for interactive tool calls");

        let persist = CancellationToken::new();
        let mut stopped = false;
        loop {
            let next = tokio::select! {
                next = waits.next() => next,
                () = self.stop.cancelled() => {
                    stopped = true;
                    // Drop the registrations so late resolutions no-op.
                    self.deps.tracker.lock().cancel_all();
                    break;
                }
            };
            let Some((part, resolution)) = next else { break };
            let terminal = match resolution {
                Ok(outcome) => resolve_interactive_part(&part, outcome),
                // Channel dropped (stop raced the resolution).
                Err(_) => terminalize_manual(&part),
            };
            if let Err(err) = self.deps.store.save_part(&terminal, &persist).await {
                warn!(error = %err, part_id = %terminal.id, "failed to persist interactive resolution");
            }
        }

        if stopped {
            // Terminalize whatever never resolved; the dropped senders make
            // the remaining waits complete immediately.
            while let Some((part, _)) = waits.next().await {
                let terminal = terminalize_manual(&part);
                if let Err(err) = self.deps.store.save_part(&terminal, &persist).await {
                    warn!(error = %err, part_id = %terminal.id, "failed to persist manual cancel");
                }
            }
        }

        self.deps.status.set_paused(false);
        if !stopped {
            let _ = self.deps.emitter.emit(ForgeEvent::AgentResumed {
                session_id: self.session_id.clone(),
            });
        }
        !stopped
    }

    /// The synthetic assistant message persisted when the step budget runs
    /// out.
    async fn save_max_steps_message(&self) -> forge_store::Result<()> {
        let mut message = Message::assistant(&self.session_id, self.deps.model.id());
        message.finish_reason = Some(FinishReason::Stop);
        let part = Part::new(
            &message,
            PartContent::Text {
                text: format!(
                    "Agent stopped due to maximum steps ({}).",
                    self.deps.config.max_steps
                ),
                state: SpanState::Done,
            },
        );
        self.deps
            .store
            .save_message_with_parts(&message, &[part], &CancellationToken::new())
            .await
    }
}

/// Terminal part for an externally resolved interactive call.
fn resolve_interactive_part(part: &Part, outcome: InteractiveOutcome) -> Part {
    let call = match outcome {
        InteractiveOutcome::Success { output } => ToolCallState::OutputAvailable {
            input: interactive_input(part),
            output,
        },
        InteractiveOutcome::Error { message } => ToolCallState::OutputError {
            input: interactive_input(part),
            message,
            reason: None,
        },
    };
    rebuild_tool_part(part, call)
}

fn terminalize_manual(part: &Part) -> Part {
    rebuild_tool_part(
        part,
        ToolCallState::OutputError {
            input: interactive_input(part),
            message: "session stopped before resolution".into(),
            reason: Some(ToolErrorReason::Manual),
        },
    )
}

fn interactive_input(part: &Part) -> serde_json::Value {
    match &part.content {
        PartContent::ToolCall {
            call:
                ToolCallState::InputAvailable { input }
                | ToolCallState::OutputAvailable { input, .. }
                | ToolCallState::OutputError { input, .. },
            ..
        } => input.clone(),
        _ => serde_json::Value::Null,
    }
}

fn rebuild_tool_part(part: &Part, call: ToolCallState) -> Part {
    let PartContent::ToolCall {
        tool_call_id,
        tool_name,
        unavailable,
        ..
    } = &part.content
    else {
        // Interactive classification only ever selects tool-call parts.
        return part.clone();
    };
    Part {
        id: part.id.clone(),
        message_id: part.message_id.clone(),
        session_id: part.session_id.clone(),
        content: PartContent::ToolCall {
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.clone(),
            unavailable: *unavailable,
            call,
        },
    }
}
