//! Chat-completion backend.
//!
//! Wire types for the conversation plus the [`ChatBackend`] seam the agent
//! loop and the analysis flow talk through. The only shipping backend is
//! Ollama's non-streaming `/api/chat`; tests script their own.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::error::{Error, Result};

// ── Conversation wire types ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn in the conversation, in the shape Ollama sends and receives.
/// Assistant replies may carry `tool_calls`; everything else is plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// A tool result fed back into the conversation.
    pub fn tool_result(content: impl Into<String>) -> Self {
        Self::plain(Role::Tool, content)
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// A tool invocation requested by the model. Ollama nests the interesting
/// part under `function` and sends arguments as a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

// ── Function-calling schema ──

/// One entry in the `tools` array of a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ── Backend seam ──

/// One model turn: the full conversation so far plus the function schemas
/// the model may call. Implementations must not stream; the caller wants
/// the complete reply message.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[FunctionSchema]) -> Result<ChatMessage>;
}

/// Single-shot analysis call: system prompt plus one user turn, no tools.
pub async fn analyze(
    backend: &dyn ChatBackend,
    system_prompt: &str,
    user_prompt: &str,
) -> Result<String> {
    let messages = vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(user_prompt),
    ];
    let reply = backend.chat(&messages, &[]).await?;
    Ok(reply.content)
}

// ── Ollama backend ──

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "<[FunctionSchema]>::is_empty")]
    tools: &'a [FunctionSchema],
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

pub struct OllamaBackend {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    async fn chat(&self, messages: &[ChatMessage], tools: &[FunctionSchema]) -> Result<ChatMessage> {
        let req = OllamaChatRequest {
            model: &self.model,
            messages,
            tools,
            stream: false,
        };
        debug!(
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "sending chat request"
        );

        let res = self.client.post(self.chat_url()).json(&req).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::llm(format!("Ollama API error ({status}): {body}")));
        }

        let parsed: OllamaChatResponse = res.json().await?;
        Ok(parsed.message)
    }
}
