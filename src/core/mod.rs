pub mod agent;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod mcp;
pub mod present;
pub mod prompt;
pub mod runner;
pub mod status;
pub mod terminal;
