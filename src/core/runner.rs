//! Top-level run operations.
//!
//! Each public operation owns exactly one run record: the record opens in
//! `running` state before any work happens and is settled exactly once on
//! the way out, whether the run completed, failed, or the operator hit
//! Ctrl-C. Expected pre-flight conditions (unknown template, missing
//! connection settings) are reported before a record is opened; those
//! invocations never become runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::agent;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::history::{RunStatus, RunStore};
use crate::core::llm::{self, ChatBackend, OllamaBackend};
use crate::core::mcp::McpSession;
use crate::core::present::PresenterRegistry;
use crate::core::prompt::catalog::PromptCatalog;
use crate::core::prompt::{self, ParsedPrompt, PromptTemplate};
use crate::core::status::StatusSink;

/// Substituted into the analysis prompt when the tool server answers with
/// nothing, so the model knows the fetch came back empty.
const EMPTY_DATA_FALLBACK: &str = "No data returned from the tool server.";

pub struct Runner {
    config: Config,
    catalog: PromptCatalog,
    store: RunStore,
    presenters: Arc<PresenterRegistry>,
    backend: Box<dyn ChatBackend>,
    status: StatusSink,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(
        config: Config,
        context_dir: PathBuf,
        status: StatusSink,
        cancel: CancellationToken,
    ) -> Self {
        let presenters = Arc::new(PresenterRegistry::with_builtins());
        let backend = Box::new(OllamaBackend::new(&config.ollama_url, &config.model));
        Self {
            catalog: PromptCatalog::new(context_dir.clone(), presenters.clone()),
            store: RunStore::new(context_dir.join("history")),
            presenters,
            backend,
            status,
            cancel,
            config,
        }
    }

    #[cfg(test)]
    fn with_backend(mut self, backend: Box<dyn ChatBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Run a stored template: deterministic fetch plus analysis, or LLM-only
    /// when the template has no query section.
    pub async fn run_prompt_analysis(
        &self,
        prompt_id: &str,
        variables: HashMap<String, String>,
    ) -> Result<String> {
        let template = self
            .catalog
            .load(prompt_id)
            .await?
            .ok_or_else(|| Error::not_found(prompt_id))?;
        let parsed = prompt::parse_content(&template.body, &variables);
        if parsed.deterministic_query.is_some() {
            self.config.require_mcp()?;
        }

        let status = self.status.fresh();
        let run_id = self.store.create(&template.name, Some(prompt_id)).await?;
        debug!(%run_id, prompt_id, "starting template run");

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Interrupted),
            res = self.analysis_flow(&template, &parsed, &variables, &status) => res,
        };
        self.finish(&run_id, Some(prompt_id), outcome, &status).await
    }

    /// Run template content that never touches the catalog: an edited copy
    /// from the interactive flow, or a file piped in by the operator.
    pub async fn run_custom_analysis(&self, content: &str) -> Result<String> {
        let variables = HashMap::new();
        let parsed = prompt::parse_content(content, &variables);
        if parsed.deterministic_query.is_some() {
            self.config.require_mcp()?;
        }

        let status = self.status.fresh();
        let run_id = self.store.create("Custom prompt", None).await?;
        debug!(%run_id, "starting custom run");

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Interrupted),
            res = async {
                status.rule('=').await;
                status.emit("[ANALYSIS] Running a custom prompt").await;
                status.rule('=').await;
                self.warn_unresolved(&parsed, &status).await;
                self.run_parsed(&parsed, &status).await
            } => res,
        };
        self.finish(&run_id, None, outcome, &status).await
    }

    /// Free-form question answered through the tool-calling loop.
    pub async fn run_freeform_query(&self, question: &str) -> Result<String> {
        let (url, api_key) = self.config.require_mcp()?;

        let status = self.status.fresh();
        let run_id = self.store.create(&label_for_question(question), None).await?;
        debug!(%run_id, "starting free-form run");

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Interrupted),
            res = self.freeform_flow(url, api_key, question, &status) => res,
        };
        self.finish(&run_id, None, outcome, &status).await
    }

    // ── flows ──

    async fn analysis_flow(
        &self,
        template: &PromptTemplate,
        parsed: &ParsedPrompt,
        variables: &HashMap<String, String>,
        status: &StatusSink,
    ) -> Result<String> {
        status.rule('=').await;
        status
            .emit(format!(
                "[ANALYSIS] Starting analysis with prompt: {}",
                template.name
            ))
            .await;
        if !variables.is_empty() {
            let mut names: Vec<&String> = variables.keys().collect();
            names.sort();
            for name in names {
                status.emit(format!("   {} = {}", name, variables[name])).await;
            }
        }
        status.rule('=').await;

        self.warn_unresolved(parsed, status).await;
        self.run_parsed(parsed, status).await
    }

    async fn run_parsed(&self, parsed: &ParsedPrompt, status: &StatusSink) -> Result<String> {
        let system_prompt = prompt::build_system_prompt(self.catalog.context_dir());

        match &parsed.deterministic_query {
            None => {
                status
                    .emit("[PROMPT] No MCP query section; running LLM-only.")
                    .await;
                self.analyze_step(&system_prompt, &parsed.analysis_text, status)
                    .await
            }
            Some(query) => {
                let (url, api_key) = self.config.require_mcp()?;
                let mut session = McpSession::connect(url, api_key, status.clone()).await?;

                if !parsed.declared_tools.is_empty() {
                    let available: Vec<String> = session
                        .list_tools()
                        .await?
                        .iter()
                        .map(|t| t.name.clone())
                        .collect();
                    for declared in &parsed.declared_tools {
                        if !available.contains(declared) {
                            status
                                .emit(format!(
                                    "[WARNING] Declared tool '{declared}' is not available on the server"
                                ))
                                .await;
                        }
                    }
                }

                let data = session.query(query).await?;
                let data = data_or_fallback(data, status).await;
                let final_prompt = prompt::substitute_data(&parsed.analysis_text, &data);
                self.analyze_step(&system_prompt, &final_prompt, status).await
            }
        }
    }

    async fn freeform_flow(
        &self,
        url: &str,
        api_key: &str,
        question: &str,
        status: &StatusSink,
    ) -> Result<String> {
        status.rule('=').await;
        status.emit("[QUERY] Free-form question mode").await;
        status.emit(format!("[QUERY] {question}")).await;
        status.rule('=').await;

        let mut session = McpSession::connect(url, api_key, status.clone()).await?;
        let system_prompt = prompt::build_system_prompt(self.catalog.context_dir());

        let result = agent::run_tool_loop(
            self.backend.as_ref(),
            &mut session,
            &system_prompt,
            question,
            status,
        )
        .await?;

        status.rule('=').await;
        status.emit("[RESULT] Query complete").await;
        status.rule('=').await;
        status.emit(result.clone()).await;
        Ok(result)
    }

    async fn analyze_step(
        &self,
        system_prompt: &str,
        analysis_text: &str,
        status: &StatusSink,
    ) -> Result<String> {
        status.rule('=').await;
        status.emit("[LLM] Sending analysis request...").await;
        status
            .emit(format!("[LLM] Model: {}", self.config.model))
            .await;
        status
            .emit(format!(
                "[LLM] System prompt: {} characters",
                system_prompt.len()
            ))
            .await;
        status
            .emit(format!(
                "[LLM] Analysis prompt: {} characters",
                analysis_text.len()
            ))
            .await;
        status.rule('=').await;

        let result = llm::analyze(self.backend.as_ref(), system_prompt, analysis_text).await?;

        status.rule('=').await;
        status.emit("[RESULT] Analysis complete").await;
        status.rule('=').await;
        status.emit(result.clone()).await;
        Ok(result)
    }

    async fn warn_unresolved(&self, parsed: &ParsedPrompt, status: &StatusSink) {
        for name in prompt::unresolved_placeholders(&parsed.raw_full_text) {
            // Data tokens are filled after the fetch, not by the operator.
            if prompt::DATA_PLACEHOLDERS.contains(&name.as_str()) {
                continue;
            }
            status
                .emit(format!("[WARNING] Placeholder '{{{{{name}}}}}' has no value"))
                .await;
        }
    }

    /// Settle the record exactly once, then hand the outcome back. The
    /// transcript snapshot happens here, so everything the flow emitted is
    /// preserved with the record.
    async fn finish(
        &self,
        run_id: &str,
        presenter_id: Option<&str>,
        outcome: Result<String>,
        status: &StatusSink,
    ) -> Result<String> {
        let log = status.transcript().await;
        match outcome {
            Ok(text) => {
                let text = ensure_text(text);
                self.store
                    .update(run_id, RunStatus::Complete, Some(text.clone()), Some(log))
                    .await?;
                if let Some(id) = presenter_id {
                    self.presenters.present(id, &text);
                }
                Ok(text)
            }
            Err(Error::Interrupted) => {
                self.store
                    .update(
                        run_id,
                        RunStatus::Cancelled,
                        Some("Run cancelled by operator.".to_string()),
                        Some(log),
                    )
                    .await?;
                Err(Error::Interrupted)
            }
            Err(e) => {
                self.store
                    .update(run_id, RunStatus::Failed, Some(e.to_string()), Some(log))
                    .await?;
                Err(e)
            }
        }
    }
}

async fn data_or_fallback(data: String, status: &StatusSink) -> String {
    if data.trim().is_empty() {
        status
            .emit("[WARNING] Tool server returned no data; continuing with a fixed note.")
            .await;
        EMPTY_DATA_FALLBACK.to_string()
    } else {
        data
    }
}

fn ensure_text(text: String) -> String {
    if text.trim().is_empty() {
        "The model returned no text.".to_string()
    } else {
        text
    }
}

/// History label for a free-form question: the question itself, clipped.
fn label_for_question(question: &str) -> String {
    const MAX_CHARS: usize = 60;
    let trimmed = question.trim();
    if trimmed.chars().count() <= MAX_CHARS {
        trimmed.to_string()
    } else {
        let clipped: String = trimmed.chars().take(MAX_CHARS).collect();
        format!("{clipped}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    use crate::core::llm::{ChatMessage, FunctionSchema};

    fn test_config() -> Config {
        Config {
            mcp_url: None,
            mcp_api_key: None,
            model: "mistral".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
        }
    }

    struct EchoBackend {
        calls: Arc<StdMutex<Vec<(String, String)>>>,
        reply: String,
    }

    impl EchoBackend {
        fn new(reply: &str) -> (Self, Arc<StdMutex<Vec<(String, String)>>>) {
            let calls = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    calls: calls.clone(),
                    reply: reply.to_string(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl ChatBackend for EchoBackend {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _tools: &[FunctionSchema],
        ) -> Result<ChatMessage> {
            self.calls
                .lock()
                .unwrap()
                .push((messages[0].content.clone(), messages[1].content.clone()));
            Ok(ChatMessage::assistant(self.reply.clone()))
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl ChatBackend for FailingBackend {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[FunctionSchema],
        ) -> Result<ChatMessage> {
            Err(Error::llm("model offline"))
        }
    }

    fn write_template(context: &Path, id: &str, text: &str) {
        let dir = context.join("prompts").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{id}.md")), text).unwrap();
    }

    fn context_with_docs(dir: &TempDir) -> PathBuf {
        let context = dir.path().join("context");
        std::fs::create_dir_all(&context).unwrap();
        std::fs::write(context.join("Role.md"), "You are a network analyst.").unwrap();
        std::fs::write(context.join("Rules.md"), "Be terse.").unwrap();
        context
    }

    fn runner_with(
        context: &Path,
        backend: Box<dyn ChatBackend>,
        cancel: CancellationToken,
    ) -> Runner {
        Runner::new(
            test_config(),
            context.to_path_buf(),
            StatusSink::silent(),
            cancel,
        )
        .with_backend(backend)
    }

    async fn records_in(context: &Path) -> Vec<crate::core::history::RunRecord> {
        RunStore::new(context.join("history")).list().await.unwrap()
    }

    // --- template runs ---

    #[tokio::test]
    async fn llm_only_template_completes_and_records() {
        let dir = TempDir::new().unwrap();
        let context = context_with_docs(&dir);
        write_template(
            &context,
            "triage",
            "---\nname: Triage\n---\n\n## Analysis Prompt\nSummarize {{scope}}.\n",
        );

        let (backend, calls) = EchoBackend::new("All good.");
        let runner = runner_with(&context, Box::new(backend), CancellationToken::new());
        let variables = HashMap::from([("scope".to_string(), "printers".to_string())]);

        let out = runner.run_prompt_analysis("triage", variables).await.unwrap();
        assert_eq!(out, "All good.");

        let records = records_in(&context).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RunStatus::Complete);
        assert_eq!(records[0].label, "Triage");
        assert_eq!(records[0].prompt_id.as_deref(), Some("triage"));
        assert_eq!(records[0].result.as_deref(), Some("All good."));
        assert!(records[0].finished_at.is_some());
        assert!(!records[0].log.is_empty());

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].0, "You are a network analyst.\n\nBe terse.");
        assert!(calls[0].1.contains("Summarize printers."));
    }

    #[tokio::test]
    async fn unknown_template_leaves_no_record() {
        let dir = TempDir::new().unwrap();
        let context = context_with_docs(&dir);

        let (backend, _) = EchoBackend::new("unused");
        let runner = runner_with(&context, Box::new(backend), CancellationToken::new());

        let err = runner
            .run_prompt_analysis("nope", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(records_in(&context).await.is_empty());
    }

    #[tokio::test]
    async fn deterministic_template_without_connection_settings_never_starts() {
        let dir = TempDir::new().unwrap();
        let context = context_with_docs(&dir);
        write_template(
            &context,
            "fetch",
            "## MCP Query\nList everything.\n\n## Analysis Prompt\nAnalyze {{result}}\n",
        );

        let (backend, _) = EchoBackend::new("unused");
        let runner = runner_with(&context, Box::new(backend), CancellationToken::new());

        let err = runner
            .run_prompt_analysis("fetch", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(records_in(&context).await.is_empty());
    }

    #[tokio::test]
    async fn backend_failure_settles_the_record_as_failed() {
        let dir = TempDir::new().unwrap();
        let context = context_with_docs(&dir);
        write_template(&context, "triage", "## Analysis Prompt\nThink.\n");

        let runner = runner_with(&context, Box::new(FailingBackend), CancellationToken::new());

        let err = runner
            .run_prompt_analysis("triage", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Llm(_)));

        let records = records_in(&context).await;
        assert_eq!(records[0].status, RunStatus::Failed);
        assert!(records[0].result.as_deref().unwrap().contains("model offline"));
    }

    #[tokio::test]
    async fn cancellation_settles_the_record_as_cancelled() {
        let dir = TempDir::new().unwrap();
        let context = context_with_docs(&dir);
        write_template(&context, "triage", "## Analysis Prompt\nThink.\n");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (backend, _) = EchoBackend::new("unused");
        let runner = runner_with(&context, Box::new(backend), cancel);

        let err = runner
            .run_prompt_analysis("triage", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));

        let records = records_in(&context).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RunStatus::Cancelled);
        assert_eq!(records[0].result.as_deref(), Some("Run cancelled by operator."));
    }

    // --- custom and free-form runs ---

    #[tokio::test]
    async fn custom_content_runs_without_the_catalog() {
        let dir = TempDir::new().unwrap();
        let context = context_with_docs(&dir);

        let (backend, _) = EchoBackend::new("Thought about it.");
        let runner = runner_with(&context, Box::new(backend), CancellationToken::new());

        let out = runner
            .run_custom_analysis("## Analysis Prompt\nJust think.\n")
            .await
            .unwrap();
        assert_eq!(out, "Thought about it.");

        let records = records_in(&context).await;
        assert_eq!(records[0].label, "Custom prompt");
        assert!(records[0].prompt_id.is_none());
        assert_eq!(records[0].status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn freeform_requires_connection_settings_up_front() {
        let dir = TempDir::new().unwrap();
        let context = context_with_docs(&dir);

        let (backend, _) = EchoBackend::new("unused");
        let runner = runner_with(&context, Box::new(backend), CancellationToken::new());

        let err = runner.run_freeform_query("how many devices?").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(records_in(&context).await.is_empty());
    }

    // --- helpers ---

    #[tokio::test]
    async fn empty_fetch_falls_back_to_the_fixed_note() {
        let status = StatusSink::silent();
        let out = data_or_fallback("   \n".to_string(), &status).await;
        assert_eq!(out, EMPTY_DATA_FALLBACK);
        assert!(status.transcript().await[0].contains("[WARNING]"));

        let kept = data_or_fallback("real data".to_string(), &status).await;
        assert_eq!(kept, "real data");
    }

    #[test]
    fn empty_results_get_a_fixed_note() {
        assert_eq!(ensure_text("".to_string()), "The model returned no text.");
        assert_eq!(ensure_text("report".to_string()), "report");
    }

    #[test]
    fn question_labels_are_clipped() {
        assert_eq!(label_for_question("  short  "), "short");
        let long = "x".repeat(80);
        let label = label_for_question(&long);
        assert_eq!(label.chars().count(), 63);
        assert!(label.ends_with("..."));
    }
}
