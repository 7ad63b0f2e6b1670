//! Environment-backed settings and on-disk layout.
//!
//! The tool only needs three connection parameters (MCP endpoint, MCP bearer
//! token, chat model name) plus a data directory. Everything lives under
//! `~/.runebook` unless `RUNEBOOK_DATA_DIR` says otherwise:
//!
//! ```text
//! <data_dir>/context/Role.md       system-prompt role document
//! <data_dir>/context/Rules.md      system-prompt rules document
//! <data_dir>/context/prompts/      one subdirectory per template id
//! <data_dir>/context/history/      one JSON file per run
//! ```

use std::env;
use std::path::PathBuf;

use crate::core::error::{Error, Result};

pub const DEFAULT_MODEL: &str = "mistral";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct Config {
    /// MCP server endpoint (`RUNEBOOK_MCP_URL`)
    pub mcp_url: Option<String>,
    /// Bearer token for the MCP server (`RUNEBOOK_MCP_API_KEY`)
    pub mcp_api_key: Option<String>,
    /// Chat model name passed to the backend (`RUNEBOOK_MODEL`)
    pub model: String,
    /// Ollama HTTP endpoint (`RUNEBOOK_OLLAMA_URL`)
    pub ollama_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            mcp_url: read_var("RUNEBOOK_MCP_URL"),
            mcp_api_key: read_var("RUNEBOOK_MCP_API_KEY"),
            model: read_var("RUNEBOOK_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            ollama_url: read_var("RUNEBOOK_OLLAMA_URL")
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
        }
    }

    /// Both MCP connection parameters, or a single error naming every
    /// missing variable. Checked before any tool-server run starts.
    pub fn require_mcp(&self) -> Result<(&str, &str)> {
        let mut missing = Vec::new();
        if self.mcp_url.is_none() {
            missing.push("RUNEBOOK_MCP_URL");
        }
        if self.mcp_api_key.is_none() {
            missing.push("RUNEBOOK_MCP_API_KEY");
        }
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }
        // Both checked right above
        Ok((
            self.mcp_url.as_deref().unwrap_or_default(),
            self.mcp_api_key.as_deref().unwrap_or_default(),
        ))
    }
}

/// Root data directory. `RUNEBOOK_DATA_DIR` overrides; defaults to
/// `~/.runebook`.
pub fn data_dir() -> PathBuf {
    match env::var("RUNEBOOK_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".runebook"),
    }
}

pub fn context_dir() -> PathBuf {
    data_dir().join("context")
}

/// Read an environment variable, treating empty/blank values as unset.
fn read_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_config() -> Config {
        Config {
            mcp_url: None,
            mcp_api_key: None,
            model: DEFAULT_MODEL.to_string(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
        }
    }

    #[test]
    fn require_mcp_reports_all_missing_variables_at_once() {
        let err = bare_config().require_mcp().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("RUNEBOOK_MCP_URL"));
        assert!(msg.contains("RUNEBOOK_MCP_API_KEY"));
    }

    #[test]
    fn require_mcp_returns_both_settings() {
        let mut config = bare_config();
        config.mcp_url = Some("https://mcp.example.com/v1".to_string());
        config.mcp_api_key = Some("secret".to_string());

        let (url, key) = config.require_mcp().unwrap();
        assert_eq!(url, "https://mcp.example.com/v1");
        assert_eq!(key, "secret");
    }

    #[test]
    fn require_mcp_reports_single_missing_variable() {
        let mut config = bare_config();
        config.mcp_url = Some("https://mcp.example.com/v1".to_string());
        let msg = config.require_mcp().unwrap_err().to_string();
        assert!(!msg.contains("RUNEBOOK_MCP_URL,"));
        assert!(msg.contains("RUNEBOOK_MCP_API_KEY"));
    }
}
