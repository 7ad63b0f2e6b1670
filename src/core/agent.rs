//! Bounded tool-calling loop.
//!
//! Free-form questions go through here: the model sees the server's tools
//! as function schemas and may request calls; we execute them one at a time
//! and feed the results back until the model answers in plain text or the
//! iteration cap cuts it off. A failed tool call never aborts the loop; the
//! failure text goes back to the model, which usually recovers or reroutes.

use tracing::debug;

use crate::core::error::Result;
use crate::core::llm::{ChatBackend, ChatMessage};
use crate::core::mcp::McpSession;
use crate::core::status::StatusSink;

pub const MAX_TOOL_ITERATIONS: usize = 5;

/// Returned when the cap hits and the conversation tail has no usable text.
const TRUNCATED_FALLBACK: &str =
    "Stopped after reaching the tool-call limit without a final answer.";

pub async fn run_tool_loop(
    backend: &dyn ChatBackend,
    session: &mut McpSession,
    system_prompt: &str,
    user_prompt: &str,
    status: &StatusSink,
) -> Result<String> {
    let tools = session.to_function_schemas().await?;
    let mut messages = vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(user_prompt),
    ];

    for iteration in 1..=MAX_TOOL_ITERATIONS {
        status
            .emit(format!(
                "[LLM] Thinking... (iteration {iteration}/{MAX_TOOL_ITERATIONS})"
            ))
            .await;

        let reply = backend.chat(&messages, &tools).await?;
        messages.push(reply.clone());

        if !reply.has_tool_calls() {
            return Ok(reply.content);
        }
        let calls = reply.tool_calls.unwrap_or_default();

        status
            .emit(format!("[LLM] Executing {} tool call(s)...", calls.len()))
            .await;
        for call in calls {
            let name = call.function.name;
            status.emit(format!("   [Tool] {name}")).await;
            debug!(tool = %name, args = %call.function.arguments, "executing tool call");

            let content = match session.call_tool(&name, call.function.arguments).await {
                Ok(text) => {
                    status
                        .emit(format!("   [Tool] {name} returned {} characters", text.len()))
                        .await;
                    text
                }
                Err(e) => {
                    status.emit(format!("   [Tool] {name} failed: {e}")).await;
                    format!("Error calling tool: {e}")
                }
            };
            messages.push(ChatMessage::tool_result(content));
        }
    }

    status
        .emit("[WARNING] Reached the tool-call limit; returning the last response.")
        .await;
    let last = messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();
    if last.trim().is_empty() {
        Ok(TRUNCATED_FALLBACK.to_string())
    } else {
        Ok(last)
    }
}
