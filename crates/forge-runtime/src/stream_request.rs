//! One streaming LLM attempt with incremental persistence.
//!
//! Creates and persists an empty assistant message before streaming, then
//! maintains open accumulators keyed by provider-assigned span ids and
//! upserts a part on every delta — the same part id always overwrites, so
//! a crash mid-stream leaves a readable prefix, never a torn record.
//!
//! A single chunk watchdog (cancel-and-reschedule, reset on every chunk)
//! bounds the wait between chunks; firing aborts the attempt as retryable.
//! External cancellation is honored at every await point and persists an
//! `aborted` error rather than leaving the message without a terminal
//! state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use forge_core::error::AgentError;
use forge_core::events::StreamEvent;
use forge_core::message::{FinishReason, Message, TokenUsage};
use forge_core::part::{Part, PartContent, SpanState, ToolCallState};
use forge_llm::format::{ContextMessage, build_model_messages};
use forge_llm::{LanguageModel, ModelRequest};
use forge_store::Store;
use forge_tools::{ToolError, ToolRegistry, validate_input};

use futures::StreamExt;

/// Result of one attempt: the finalized assistant message and its parts in
/// emission order. Request-level failures live on `message.error`; store
/// failures are the only way `run` itself errors.
#[derive(Clone, Debug)]
pub struct StreamOutcome {
    /// The persisted assistant message with final metadata.
    pub message: Message,
    /// Parts in emission order, all in terminal or `done` states.
    pub parts: Vec<Part>,
}

/// One streaming LLM call, borrowed from the runner's state.
pub struct StreamRequest<'a> {
    /// The model to call.
    pub model: &'a Arc<dyn LanguageModel>,
    /// Where history is read and parts are written.
    pub store: &'a Arc<dyn Store>,
    /// Active tool set; names outside it mark parts `unavailable`.
    pub registry: &'a ToolRegistry,
    /// Agent context messages, injected before history.
    pub context: &'a [ContextMessage],
    /// Session whose history feeds the request.
    pub session_id: &'a str,
    /// Step number recorded on the `step-start` part (stable across
    /// retries of the same step).
    pub step: u32,
    /// Chunk watchdog deadline.
    pub chunk_timeout: Duration,
}

/// Open accumulators for in-flight spans, keyed by provider id.
struct Accumulators {
    message: Message,
    parts: Vec<Part>,
    text: HashMap<String, usize>,
    reasoning: HashMap<String, usize>,
    tools: HashMap<String, usize>,
    /// Deferred request-level error (unknown tool name), applied at
    /// finalization unless a stream-level error takes precedence.
    pending_error: Option<AgentError>,
}

impl Accumulators {
    fn new(message: &Message) -> Self {
        Self {
            message: message.clone(),
            parts: Vec::new(),
            text: HashMap::new(),
            reasoning: HashMap::new(),
            tools: HashMap::new(),
            pending_error: None,
        }
    }

    fn push(&mut self, content: PartContent) -> usize {
        self.parts.push(Part::new(&self.message, content));
        self.parts.len() - 1
    }
}

impl StreamRequest<'_> {
    /// Execute the attempt.
    #[instrument(skip_all, fields(session_id = self.session_id, step = self.step, model = self.model.id()))]
    pub async fn run(&self, cancel: &CancellationToken) -> forge_store::Result<StreamOutcome> {
        // Writes must land even while a cancel is in flight; cancellation
        // is honored at the stream read points instead.
        let persist = CancellationToken::new();

        let history = self
            .store
            .get_messages_with_parts(self.session_id, &persist)
            .await?;
        let mut message = Message::assistant(self.session_id, self.model.id());
        self.store.save_message(&message, &persist).await?;

        let mut acc = Accumulators::new(&message);
        let step_idx = acc.push(PartContent::StepStart { step: self.step });
        self.store.save_part(&acc.parts[step_idx], &persist).await?;

        let request = ModelRequest {
            messages: build_model_messages(&history, self.context),
            tools: self.registry.definitions(),
        };

        let started = Instant::now();
        let mut ttfc: Option<Duration> = None;
        let mut finish: Option<(FinishReason, TokenUsage)> = None;
        let mut stream_error: Option<AgentError> = None;
        let mut aborted = false;

        match self.model.stream(request, cancel).await {
            Err(err) => {
                aborted = matches!(err, AgentError::Aborted);
                stream_error = Some(err);
            }
            Ok(mut stream) => {
                let watchdog = tokio::time::sleep(self.chunk_timeout);
                tokio::pin!(watchdog);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            aborted = true;
                            stream_error = Some(AgentError::Aborted);
                            break;
                        }
                        () = &mut watchdog => {
                            warn!(timeout_ms = self.chunk_timeout.as_millis() as u64,
                                "chunk watchdog fired");
                            aborted = true;
                            stream_error = Some(AgentError::ApiCall {
                                status: 408,
                                message: format!(
                                    "no chunk received within {}ms",
                                    self.chunk_timeout.as_millis()
                                ),
                                body: None,
                                retryable: true,
                            });
                            break;
                        }
                        next = stream.next() => {
                            watchdog
                                .as_mut()
                                .reset(tokio::time::Instant::now() + self.chunk_timeout);
                            match next {
                                None => break,
                                Some(Err(err)) => {
                                    aborted = matches!(err, AgentError::Aborted);
                                    stream_error = Some(err);
                                    break;
                                }
                                Some(Ok(event)) => {
                                    if ttfc.is_none() {
                                        ttfc = Some(started.elapsed());
                                    }
                                    if let StreamEvent::Finish { finish_reason, usage } = event {
                                        finish = Some((finish_reason, usage));
                                    } else {
                                        self.apply_event(&mut acc, event, &persist).await?;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        self.finalize_parts(&mut acc, &persist).await?;

        let duration = started.elapsed();
        let error = stream_error.or_else(|| acc.pending_error.take()).or_else(|| {
            finish
                .is_none()
                .then(|| AgentError::unknown("stream ended without a finish event"))
        });

        message.finish_reason = Some(if aborted {
            FinishReason::Aborted
        } else if let Some((reason, _)) = finish {
            reason
        } else {
            FinishReason::Error
        });
        message.usage = finish.map(|(_, usage)| usage);
        message.error = error;
        message.time_to_first_chunk_ms = ttfc.map(|d| d.as_millis() as u64);
        message.duration_ms = Some(duration.as_millis() as u64);
        message.tokens_per_second = message.usage.and_then(|usage| {
            let secs = duration.as_secs_f64();
            (usage.output_tokens > 0 && secs > 0.0).then(|| usage.output_tokens as f64 / secs)
        });
        self.store.save_message(&message, &persist).await?;

        let outcome_label = message
            .error
            .as_ref()
            .map_or("ok", AgentError::kind);
        counter!("forge_llm_requests_total", "outcome" => outcome_label).increment(1);
        if let Some(d) = ttfc {
            histogram!("forge_llm_time_to_first_chunk_seconds").record(d.as_secs_f64());
        }
        histogram!("forge_llm_request_duration_seconds").record(duration.as_secs_f64());
        if let Some(tps) = message.tokens_per_second {
            histogram!("forge_llm_tokens_per_second").record(tps);
        }
        debug!(
            finish_reason = ?message.finish_reason,
            error = message.error.as_ref().map(AgentError::kind),
            parts = acc.parts.len(),
            "stream attempt finished"
        );

        Ok(StreamOutcome {
            message,
            parts: acc.parts,
        })
    }

    /// Apply one non-finish stream event, persisting the touched part.
    async fn apply_event(
        &self,
        acc: &mut Accumulators,
        event: StreamEvent,
        persist: &CancellationToken,
    ) -> forge_store::Result<()> {
        let idx = match event {
            StreamEvent::TextStart { id } => {
                let idx = acc.push(PartContent::Text {
                    text: String::new(),
                    state: SpanState::Streaming,
                });
                let _ = acc.text.insert(id, idx);
                idx
            }
            StreamEvent::TextDelta { id, delta } => {
                let idx = self.text_span(acc, &id);
                if let PartContent::Text { text, .. } = &mut acc.parts[idx].content {
                    text.push_str(&delta);
                }
                idx
            }
            StreamEvent::TextEnd { id } => {
                let idx = self.text_span(acc, &id);
                if let PartContent::Text { state, .. } = &mut acc.parts[idx].content {
                    *state = SpanState::Done;
                }
                idx
            }
            StreamEvent::ReasoningStart { id } => {
                let idx = acc.push(PartContent::Reasoning {
                    text: String::new(),
                    state: SpanState::Streaming,
                });
                let _ = acc.reasoning.insert(id, idx);
                idx
            }
            StreamEvent::ReasoningDelta { id, delta } => {
                let idx = self.reasoning_span(acc, &id);
                if let PartContent::Reasoning { text, .. } = &mut acc.parts[idx].content {
                    text.push_str(&delta);
                }
                idx
            }
            StreamEvent::ReasoningEnd { id } => {
                let idx = self.reasoning_span(acc, &id);
                if let PartContent::Reasoning { state, .. } = &mut acc.parts[idx].content {
                    *state = SpanState::Done;
                }
                idx
            }
            StreamEvent::ToolInputStart { id, tool_name } => {
                self.tool_span(acc, &id, &tool_name)
            }
            StreamEvent::ToolInputDelta { id, delta } => {
                // A delta without a prior start creates the span with an
                // unknown name; the terminal tool-call event corrects it.
                let idx = self.tool_span(acc, &id, "");
                if let PartContent::ToolCall {
                    call: ToolCallState::InputStreaming { input_text },
                    ..
                } = &mut acc.parts[idx].content
                {
                    input_text.push_str(&delta);
                }
                idx
            }
            StreamEvent::ToolCall {
                id,
                tool_name,
                input,
            } => {
                let idx = self.tool_span(acc, &id, &tool_name);
                let unavailable = !self.registry.contains(&tool_name);
                if unavailable && acc.pending_error.is_none() {
                    acc.pending_error = Some(AgentError::NoSuchTool {
                        tool_name: tool_name.clone(),
                    });
                }
                // Schema failures classify the whole attempt; the part is
                // still recorded as the model emitted it.
                if let Some(tool) = self.registry.get(&tool_name)
                    && let Err(ToolError::InvalidInput { message }) =
                        validate_input(&tool.definition(), &input)
                    && acc.pending_error.is_none()
                {
                    acc.pending_error = Some(AgentError::InvalidToolInput {
                        tool_name: tool_name.clone(),
                        message,
                    });
                }
                if let PartContent::ToolCall {
                    tool_name: name,
                    unavailable: flag,
                    call,
                    ..
                } = &mut acc.parts[idx].content
                {
                    *name = tool_name;
                    *flag = unavailable;
                    *call = ToolCallState::InputAvailable { input };
                }
                idx
            }
            StreamEvent::ToolError {
                id,
                tool_name,
                message,
            } => {
                // Caught upstream; terminal part, the stream continues.
                let idx = self.tool_span(acc, &id, &tool_name);
                if let PartContent::ToolCall { call, .. } = &mut acc.parts[idx].content {
                    let input = match call {
                        ToolCallState::InputAvailable { input }
                        | ToolCallState::OutputAvailable { input, .. }
                        | ToolCallState::OutputError { input, .. } => input.clone(),
                        ToolCallState::InputStreaming { .. } => Value::Null,
                    };
                    *call = ToolCallState::OutputError {
                        input,
                        message,
                        reason: None,
                    };
                }
                idx
            }
            StreamEvent::Source { url, title } => acc.push(PartContent::Source { url, title }),
            StreamEvent::Finish { .. } => unreachable!("finish is handled by the read loop"),
        };
        self.store.save_part(&acc.parts[idx], persist).await
    }

    fn text_span(&self, acc: &mut Accumulators, id: &str) -> usize {
        if let Some(&idx) = acc.text.get(id) {
            return idx;
        }
        let idx = acc.push(PartContent::Text {
            text: String::new(),
            state: SpanState::Streaming,
        });
        let _ = acc.text.insert(id.to_owned(), idx);
        idx
    }

    fn reasoning_span(&self, acc: &mut Accumulators, id: &str) -> usize {
        if let Some(&idx) = acc.reasoning.get(id) {
            return idx;
        }
        let idx = acc.push(PartContent::Reasoning {
            text: String::new(),
            state: SpanState::Streaming,
        });
        let _ = acc.reasoning.insert(id.to_owned(), idx);
        idx
    }

    /// Existing tool span for `id`, or a new `input-streaming` part. The
    /// provider tool-call id doubles as the part's `tool_call_id`.
    fn tool_span(&self, acc: &mut Accumulators, id: &str, tool_name: &str) -> usize {
        if let Some(&idx) = acc.tools.get(id) {
            return idx;
        }
        let unavailable = !tool_name.is_empty() && !self.registry.contains(tool_name);
        let idx = acc.push(PartContent::ToolCall {
            tool_call_id: id.to_owned(),
            tool_name: tool_name.to_owned(),
            unavailable,
            call: ToolCallState::InputStreaming {
                input_text: String::new(),
            },
        });
        let _ = acc.tools.insert(id.to_owned(), idx);
        idx
    }

    /// Close open spans and terminalize orphans so no part is left
    /// in-progress, whatever ended the stream.
    async fn finalize_parts(
        &self,
        acc: &mut Accumulators,
        persist: &CancellationToken,
    ) -> forge_store::Result<()> {
        for idx in 0..acc.parts.len() {
            let touched = match &mut acc.parts[idx].content {
                PartContent::Text { state, .. } | PartContent::Reasoning { state, .. }
                    if *state == SpanState::Streaming =>
                {
                    *state = SpanState::Done;
                    true
                }
                PartContent::ToolCall {
                    tool_call_id,
                    tool_name,
                    call: call @ ToolCallState::InputStreaming { .. },
                    ..
                } => {
                    // Data-integrity violation: the model opened a tool call
                    // and never finalized its input.
                    warn!(
                        tool_call_id = %tool_call_id,
                        tool_name = %tool_name,
                        "orphaned input-streaming tool call at end of stream"
                    );
                    *call = ToolCallState::OutputError {
                        input: Value::Null,
                        message: "tool input never finalized".into(),
                        reason: None,
                    };
                    true
                }
                _ => false,
            };
            if touched {
                self.store.save_part(&acc.parts[idx], persist).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use forge_llm::ModelStream;
    use forge_store::MemoryStore;
    use forge_tools::testutil::StaticTool;
    use parking_lot::Mutex;
    use serde_json::json;

    /// A model that replays a scripted event sequence, optionally stalling
    /// before each item.
    struct ScriptedModel {
        items: Mutex<Vec<Result<StreamEvent, AgentError>>>,
        gap: Duration,
    }

    impl ScriptedModel {
        fn new(events: Vec<StreamEvent>) -> Self {
            Self {
                items: Mutex::new(events.into_iter().map(Ok).collect()),
                gap: Duration::ZERO,
            }
        }

        fn with_gap(mut self, gap: Duration) -> Self {
            self.gap = gap;
            self
        }

        fn erroring(events: Vec<StreamEvent>, error: AgentError) -> Self {
            let mut items: Vec<Result<StreamEvent, AgentError>> =
                events.into_iter().map(Ok).collect();
            items.push(Err(error));
            Self {
                items: Mutex::new(items),
                gap: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn id(&self) -> &str {
            "scripted-model"
        }

        async fn stream(
            &self,
            _request: ModelRequest,
            _cancel: &CancellationToken,
        ) -> Result<ModelStream, AgentError> {
            let items = std::mem::take(&mut *self.items.lock());
            let gap = self.gap;
            Ok(Box::pin(async_stream::stream! {
                for item in items {
                    if !gap.is_zero() {
                        tokio::time::sleep(gap).await;
                    }
                    yield item;
                }
            }))
        }
    }

    fn finish_stop() -> StreamEvent {
        StreamEvent::Finish {
            finish_reason: FinishReason::Stop,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }
    }

    struct Fixture {
        store: Arc<dyn Store>,
        registry: ToolRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = ToolRegistry::new();
            registry.register(Arc::new(StaticTool::named("read_file")));
            Self {
                store: Arc::new(MemoryStore::new()),
                registry,
            }
        }

        async fn run(&self, model: &ScriptedModel) -> StreamOutcome {
            self.run_with(model, Duration::from_secs(60), &CancellationToken::new())
                .await
        }

        async fn run_with(
            &self,
            model: &ScriptedModel,
            chunk_timeout: Duration,
            cancel: &CancellationToken,
        ) -> StreamOutcome {
            let model: Arc<dyn LanguageModel> = Arc::new(ScriptedModel {
                items: Mutex::new(std::mem::take(&mut *model.items.lock())),
                gap: model.gap,
            });
            StreamRequest {
                model: &model,
                store: &self.store,
                registry: &self.registry,
                context: &[],
                session_id: "ses_1",
                step: 1,
                chunk_timeout,
            }
            .run(cancel)
            .await
            .unwrap()
        }
    }

    // ── Happy path ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn text_spans_accumulate_and_close() {
        let fx = Fixture::new();
        let model = ScriptedModel::new(vec![
            StreamEvent::TextStart { id: "t1".into() },
            StreamEvent::TextDelta {
                id: "t1".into(),
                delta: "Hello ".into(),
            },
            StreamEvent::TextDelta {
                id: "t1".into(),
                delta: "world".into(),
            },
            StreamEvent::TextEnd { id: "t1".into() },
            finish_stop(),
        ]);

        let outcome = fx.run(&model).await;
        assert_eq!(outcome.message.finish_reason, Some(FinishReason::Stop));
        assert!(outcome.message.error.is_none());
        assert!(outcome.message.time_to_first_chunk_ms.is_some());
        assert_eq!(outcome.parts.len(), 2); // step-start + text
        assert_matches!(
            &outcome.parts[1].content,
            PartContent::Text { text, state: SpanState::Done } if text == "Hello world"
        );

        // Upserts: the stored part holds only the latest value.
        let stored = fx
            .store
            .get_parts(&outcome.message.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stored, outcome.parts);
    }

    #[tokio::test]
    async fn step_start_part_is_first() {
        let fx = Fixture::new();
        let outcome = fx.run(&ScriptedModel::new(vec![finish_stop()])).await;
        assert_matches!(outcome.parts[0].content, PartContent::StepStart { step: 1 });
    }

    #[tokio::test]
    async fn tool_input_streams_then_finalizes() {
        let fx = Fixture::new();
        let model = ScriptedModel::new(vec![
            StreamEvent::ToolInputStart {
                id: "call_1".into(),
                tool_name: "read_file".into(),
            },
            StreamEvent::ToolInputDelta {
                id: "call_1".into(),
                delta: "{\"path\":".into(),
            },
            StreamEvent::ToolInputDelta {
                id: "call_1".into(),
                delta: "\"a.txt\"}".into(),
            },
            StreamEvent::ToolCall {
                id: "call_1".into(),
                tool_name: "read_file".into(),
                input: json!({"path": "a.txt"}),
            },
            StreamEvent::Finish {
                finish_reason: FinishReason::ToolCalls,
                usage: TokenUsage::default(),
            },
        ]);

        let outcome = fx.run(&model).await;
        assert!(outcome.message.error.is_none());
        assert_matches!(
            &outcome.parts[1].content,
            PartContent::ToolCall {
                tool_call_id,
                unavailable: false,
                call: ToolCallState::InputAvailable { input },
                ..
            } if tool_call_id == "call_1" && *input == json!({"path": "a.txt"})
        );
    }

    #[tokio::test]
    async fn ad_hoc_tool_call_without_prior_start() {
        let fx = Fixture::new();
        let model = ScriptedModel::new(vec![
            StreamEvent::ToolCall {
                id: "call_1".into(),
                tool_name: "read_file".into(),
                input: json!({}),
            },
            finish_stop(),
        ]);

        let outcome = fx.run(&model).await;
        assert_matches!(
            &outcome.parts[1].content,
            PartContent::ToolCall {
                call: ToolCallState::InputAvailable { .. },
                ..
            }
        );
    }

    // ── Unavailable tools ────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_recorded_and_classified() {
        let fx = Fixture::new();
        let model = ScriptedModel::new(vec![
            StreamEvent::ToolCall {
                id: "call_1".into(),
                tool_name: "ghost".into(),
                input: json!({}),
            },
            finish_stop(),
        ]);

        let outcome = fx.run(&model).await;
        // The part is recorded with the unavailable marker...
        assert_matches!(
            &outcome.parts[1].content,
            PartContent::ToolCall { unavailable: true, .. }
        );
        // ...and the request outcome is a retryable no-such-tool error.
        assert_matches!(
            &outcome.message.error,
            Some(AgentError::NoSuchTool { tool_name }) if tool_name == "ghost"
        );
        assert!(outcome.message.error.as_ref().unwrap().retryable());
    }

    #[tokio::test]
    async fn schema_violating_input_classified_retryable() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticTool::named("read_file").requiring(&["path"])));
        let fx = Fixture {
            store: Arc::new(MemoryStore::new()),
            registry,
        };
        let model = ScriptedModel::new(vec![
            StreamEvent::ToolCall {
                id: "call_1".into(),
                tool_name: "read_file".into(),
                input: json!({}),
            },
            finish_stop(),
        ]);

        let outcome = fx.run(&model).await;
        // The part keeps what the model emitted...
        assert_matches!(
            &outcome.parts[1].content,
            PartContent::ToolCall {
                unavailable: false,
                call: ToolCallState::InputAvailable { .. },
                ..
            }
        );
        // ...and the attempt is classified for retry.
        assert_matches!(
            &outcome.message.error,
            Some(AgentError::InvalidToolInput { tool_name, message })
                if tool_name == "read_file" && message.contains("path")
        );
        assert!(outcome.message.error.as_ref().unwrap().retryable());
    }

    // ── Provider tool errors ─────────────────────────────────────────────

    #[tokio::test]
    async fn tool_error_event_terminal_without_aborting() {
        let fx = Fixture::new();
        let model = ScriptedModel::new(vec![
            StreamEvent::ToolError {
                id: "call_1".into(),
                tool_name: "read_file".into(),
                message: "upstream validation failed".into(),
            },
            StreamEvent::TextStart { id: "t1".into() },
            StreamEvent::TextDelta {
                id: "t1".into(),
                delta: "still streaming".into(),
            },
            StreamEvent::TextEnd { id: "t1".into() },
            finish_stop(),
        ]);

        let outcome = fx.run(&model).await;
        assert!(outcome.message.error.is_none());
        assert_matches!(
            &outcome.parts[1].content,
            PartContent::ToolCall {
                call: ToolCallState::OutputError { message, reason: None, .. },
                ..
            } if message == "upstream validation failed"
        );
        assert_matches!(&outcome.parts[2].content, PartContent::Text { .. });
    }

    // ── Orphans ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn orphaned_input_streaming_terminalized() {
        let fx = Fixture::new();
        let model = ScriptedModel::new(vec![
            StreamEvent::ToolInputStart {
                id: "call_1".into(),
                tool_name: "read_file".into(),
            },
            StreamEvent::ToolInputDelta {
                id: "call_1".into(),
                delta: "{\"pa".into(),
            },
            finish_stop(),
        ]);

        let outcome = fx.run(&model).await;
        assert_matches!(
            &outcome.parts[1].content,
            PartContent::ToolCall {
                call: ToolCallState::OutputError { message, .. },
                ..
            } if message.contains("never finalized")
        );
    }

    // ── Abnormal ends ────────────────────────────────────────────────────

    #[tokio::test]
    async fn stream_error_recorded_on_message() {
        let fx = Fixture::new();
        let model = ScriptedModel::erroring(
            vec![StreamEvent::TextStart { id: "t1".into() }],
            AgentError::ApiCall {
                status: 529,
                message: "overloaded".into(),
                body: None,
                retryable: true,
            },
        );

        let outcome = fx.run(&model).await;
        assert_matches!(
            &outcome.message.error,
            Some(AgentError::ApiCall { status: 529, .. })
        );
        // Open span was still closed.
        assert_matches!(
            &outcome.parts[1].content,
            PartContent::Text { state: SpanState::Done, .. }
        );
    }

    #[tokio::test]
    async fn missing_finish_event_is_unknown_error() {
        let fx = Fixture::new();
        let model = ScriptedModel::new(vec![StreamEvent::TextStart { id: "t1".into() }]);
        let outcome = fx.run(&model).await;
        assert_matches!(&outcome.message.error, Some(AgentError::Unknown { .. }));
        assert_eq!(outcome.message.finish_reason, Some(FinishReason::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_aborts_stalled_stream_as_retryable() {
        let fx = Fixture::new();
        let model =
            ScriptedModel::new(vec![finish_stop()]).with_gap(Duration::from_millis(75));

        let outcome = fx
            .run_with(&model, Duration::from_millis(50), &CancellationToken::new())
            .await;
        assert_eq!(outcome.message.finish_reason, Some(FinishReason::Aborted));
        let error = outcome.message.error.as_ref().unwrap();
        assert_matches!(error, AgentError::ApiCall { status: 408, .. });
        assert!(error.retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_resets_on_every_chunk() {
        let fx = Fixture::new();
        // Each chunk arrives after 40ms; the 50ms watchdog must not fire.
        let model = ScriptedModel::new(vec![
            StreamEvent::TextStart { id: "t1".into() },
            StreamEvent::TextDelta {
                id: "t1".into(),
                delta: "a".into(),
            },
            StreamEvent::TextEnd { id: "t1".into() },
            finish_stop(),
        ])
        .with_gap(Duration::from_millis(40));

        let outcome = fx
            .run_with(&model, Duration::from_millis(50), &CancellationToken::new())
            .await;
        assert!(outcome.message.error.is_none());
        assert_eq!(outcome.message.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_persists_aborted() {
        let fx = Fixture::new();
        let model = ScriptedModel::new(vec![finish_stop()]).with_gap(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = fx
            .run_with(&model, Duration::from_secs(7200), &cancel)
            .await;
        assert_eq!(outcome.message.finish_reason, Some(FinishReason::Aborted));
        assert_matches!(&outcome.message.error, Some(AgentError::Aborted));

        // The terminal message state was persisted, not just returned.
        let stored = fx
            .store
            .get_messages_with_parts("ses_1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_matches!(&stored[0].message.error, Some(AgentError::Aborted));
    }
}
