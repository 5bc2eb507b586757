//! Tool call executor — one invocation under a deadline with cancellation.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use forge_core::events::ForgeEvent;
use forge_core::part::{Part, PartContent, ToolCallState, ToolErrorReason};
use forge_store::Store;
use forge_tools::{ToolContext, ToolError, ToolRegistry, validate_input};

use crate::event_emitter::EventEmitter;
use crate::session_controller::StatusHandle;

/// Execute exactly one tool-call part, persisting its terminal state.
///
/// The part must be in `input-available`. The tool's `execute` races its
/// own deadline and the external stop signal:
///
/// - stop wins → the tool is cancelled, `output-error` reason `manual`
/// - deadline wins → the tool is cancelled, `output-error` reason `timeout`
/// - typed error or caught failure → `output-error`, no reason
/// - success → `output-available` with the typed output
///
/// No retry policy of its own; failures never abort the surrounding turn.
/// The returned part is the persisted terminal record.
#[instrument(skip_all, fields(tool_call_id, session_id = part.session_id))]
pub async fn execute_tool_call(
    part: &Part,
    registry: &ToolRegistry,
    store: &Arc<dyn Store>,
    emitter: &Arc<EventEmitter>,
    status: &StatusHandle,
    stop: &CancellationToken,
) -> forge_store::Result<Part> {
    let PartContent::ToolCall {
        tool_call_id,
        tool_name,
        call: ToolCallState::InputAvailable { input },
        ..
    } = &part.content
    else {
        // Not executable; hand the part back untouched.
        warn!(part_id = %part.id, "executor invoked on a non-input-available part");
        return Ok(part.clone());
    };
    tracing::Span::current().record("tool_call_id", tool_call_id.as_str());

    let start = Instant::now();
    // Terminal persists must land even while a stop is in flight.
    let persist = CancellationToken::new();

    let Some(tool) = registry.get(tool_name) else {
        let terminal = terminal_error(
            part,
            input.clone(),
            format!("Tool not found: {tool_name}"),
            None,
        );
        store.save_part(&terminal, &persist).await?;
        return Ok(terminal);
    };

    let read_only = tool.read_only();
    if !read_only {
        status.mark_non_read_only();
    }
    let _ = emitter.emit(ForgeEvent::UsingTool {
        session_id: part.session_id.clone(),
        tool: tool_name.clone(),
        read_only,
    });

    let outcome = if stop.is_cancelled() {
        Err((ToolError::Cancelled, Some(ToolErrorReason::Manual)))
    } else if let Err(err) = validate_input(&tool.definition(), input) {
        Err((err, None))
    } else {
        let timeout = tool.timeout(input);
        let tool_cancel = stop.child_token();
        let ctx = ToolContext {
            tool_call_id: tool_call_id.clone(),
            session_id: part.session_id.clone(),
            cancellation: tool_cancel.clone(),
        };
        tokio::select! {
            // The tool observes stop through its child token and can return
            // `Cancelled` in the same poll; the stop branch must win so the
            // terminal part keeps its manual reason.
            biased;
            () = stop.cancelled() => {
                tool_cancel.cancel();
                Err((ToolError::Cancelled, Some(ToolErrorReason::Manual)))
            }
            () = tokio::time::sleep(timeout) => {
                tool_cancel.cancel();
                Err((
                    ToolError::execution(format!("tool timed out after {timeout:?}")),
                    Some(ToolErrorReason::Timeout),
                ))
            }
            result = tool.execute(input.clone(), &ctx) => {
                result.map_err(|e| (e, None))
            }
        }
    };

    let duration = start.elapsed();
    counter!("forge_tool_executions_total", "tool" => tool_name.clone()).increment(1);
    histogram!("forge_tool_execution_duration_seconds", "tool" => tool_name.clone())
        .record(duration.as_secs_f64());

    let terminal = match outcome {
        Ok(output) => {
            info!(tool = %tool_name, duration_ms = duration.as_millis() as u64, "tool executed");
            terminal_success(part, input.clone(), output)
        }
        Err((err, reason)) => {
            warn!(tool = %tool_name, error = %err, ?reason, "tool failed");
            terminal_error(part, input.clone(), err.to_string(), reason)
        }
    };
    store.save_part(&terminal, &persist).await?;
    Ok(terminal)
}

fn terminal_success(part: &Part, input: Value, output: Value) -> Part {
    rebuild(part, ToolCallState::OutputAvailable { input, output })
}

fn terminal_error(
    part: &Part,
    input: Value,
    message: String,
    reason: Option<ToolErrorReason>,
) -> Part {
    rebuild(
        part,
        ToolCallState::OutputError {
            input,
            message,
            reason,
        },
    )
}

/// Same part id, same ownership, new call state — a keyed overwrite.
fn rebuild(part: &Part, call: ToolCallState) -> Part {
    let PartContent::ToolCall {
        tool_call_id,
        tool_name,
        unavailable,
        ..
    } = &part.content
    else {
        unreachable!("rebuild is only called on tool-call parts");
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
