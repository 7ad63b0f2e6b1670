//! Unified error type for runebook operations.
//!
//! Uses thiserror for ergonomic error definitions. Tool-call failures inside
//! the agent loop are recovered into conversation content and never surface
//! through this type; what does surface here are the conditions the CLI and
//! the run store need to tell apart (missing prompt, bad configuration,
//! cancellation, transport failures).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A prompt id did not resolve to any stored template
    #[error("Prompt not found: {0}")]
    NotFound(String),

    /// Missing or invalid connection settings, reported before a run starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single remote tool invocation failed
    #[error("Tool '{name}' failed: {message}")]
    ToolInvocation { name: String, message: String },

    /// Tool-protocol (MCP) transport or protocol failures
    #[error("MCP error: {0}")]
    Mcp(String),

    /// Chat-backend failures
    #[error("LLM error: {0}")]
    Llm(String),

    /// Bad user input (malformed ids, unparseable flags)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operator interrupted an in-progress run
    #[error("Run interrupted")]
    Interrupted,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for runebook errors
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolInvocation {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn mcp(msg: impl Into<String>) -> Self {
        Self::Mcp(msg.into())
    }

    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<inquire::InquireError> for Error {
    fn from(err: inquire::InquireError) -> Self {
        match err {
            inquire::InquireError::OperationCanceled
            | inquire::InquireError::OperationInterrupted => Self::Interrupted,
            other => Self::Internal(other.to_string()),
        }
    }
}
