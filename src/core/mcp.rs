//! MCP tool-server client.
//!
//! Speaks JSON-RPC 2.0 over streamable HTTP: every message is an HTTP POST
//! carrying a bearer token, and the server answers either with plain JSON or
//! with a one-shot `text/event-stream` body whose first `data:` line holds
//! the response. [`McpSession`] layers the tool workflow on top of the raw
//! transport: a cached tool list, schema conversion for function calling,
//! result-content flattening, and the single-tool query heuristic the
//! deterministic analysis flow uses.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::error::{Error, Result};
use crate::core::llm::{FunctionDef, FunctionSchema};
use crate::core::status::StatusSink;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const SESSION_HEADER: &str = "Mcp-Session-Id";
const INIT_TIMEOUT: Duration = Duration::from_secs(15);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Field names tried in order when guessing which schema property carries
/// the query text.
const QUERY_FIELD_CANDIDATES: [&str; 6] =
    ["query", "prompt", "question", "input", "text", "message"];

// ── JSON-RPC wire types ──

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct McpTool {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

impl McpTool {
    /// Function-calling schema for this tool. Tools that declare no input
    /// schema get an empty object so the model still sees a valid function.
    pub fn to_function_schema(&self) -> FunctionSchema {
        let parameters = match &self.input_schema {
            Value::Null => json!({ "type": "object", "properties": {} }),
            schema => schema.clone(),
        };
        FunctionSchema {
            kind: "function".to_string(),
            function: FunctionDef {
                name: self.name.clone(),
                description: self.description.clone().unwrap_or_default(),
                parameters,
            },
        }
    }
}

// ── Transport seam ──

/// Raw tool-server operations. The HTTP implementation below is the real
/// one; tests script their own. Calls are serialized, hence `&mut self`.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn list_tools(&mut self) -> Result<Vec<McpTool>>;
    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value>;
}

// ── Streamable-HTTP transport ──

pub struct HttpTransport {
    client: Client,
    url: String,
    api_key: String,
    session_id: Option<String>,
    next_id: u64,
}

impl HttpTransport {
    fn new(url: &str, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
            api_key: api_key.to_string(),
            session_id: None,
            next_id: 1,
        }
    }

    /// Open a transport and run the protocol handshake: `initialize`, then
    /// the `notifications/initialized` notification.
    pub async fn connect(url: &str, api_key: &str) -> Result<Self> {
        let mut transport = Self::new(url, api_key);
        match tokio::time::timeout(INIT_TIMEOUT, transport.initialize()).await {
            Err(_) => Err(Error::mcp(format!(
                "initialize timed out after {}s",
                INIT_TIMEOUT.as_secs()
            ))),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Ok(transport),
        }
    }

    async fn initialize(&mut self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let info = self.request("initialize", Some(params)).await?;
        debug!("tool server initialized: {:?}", info.get("serverInfo"));
        self.notify("notifications/initialized").await
    }

    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        };

        let resp = self
            .post(&serde_json::to_value(&req)?)
            .await?
            .ok_or_else(|| Error::mcp(format!("empty response to '{method}'")))?;
        if let Some(error) = resp.error {
            return Err(Error::mcp(format!("'{method}' failed: {error}")));
        }
        resp.result
            .ok_or_else(|| Error::mcp(format!("response to '{method}' carries no result")))
    }

    /// Fire-and-forget notification (no id, so no response expected beyond
    /// the HTTP acknowledgement).
    async fn notify(&mut self, method: &str) -> Result<()> {
        let body = json!({ "jsonrpc": "2.0", "method": method });
        self.post(&body).await?;
        Ok(())
    }

    async fn post(&mut self, body: &Value) -> Result<Option<JsonRpcResponse>> {
        debug!("MCP TX: {}", body);
        let mut req = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, "application/json, text/event-stream")
            .bearer_auth(&self.api_key)
            .json(body);
        if let Some(session_id) = &self.session_id {
            req = req.header(SESSION_HEADER, session_id);
        }

        let res = req.send().await?;

        // The server assigns a session on initialize; echo it from then on.
        if let Some(sid) = res
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(sid.to_string());
        }

        let http_status = res.status();
        let content_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = res.text().await?;
        if !http_status.is_success() {
            return Err(Error::mcp(format!("server returned {http_status}: {text}")));
        }
        debug!("MCP RX: {}", text);

        parse_rpc_body(&content_type, &text)
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn list_tools(&mut self) -> Result<Vec<McpTool>> {
        let result = self.request("tools/list", None).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value> {
        self.request(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }
}

/// Pull the JSON-RPC payload out of an HTTP response body. Streamable HTTP
/// servers answer either with plain JSON or with a short-lived SSE body;
/// in the latter case the first `data:` line is the response.
fn parse_rpc_body(content_type: &str, body: &str) -> Result<Option<JsonRpcResponse>> {
    let payload = if content_type.starts_with("text/event-stream") {
        match first_sse_data(body) {
            Some(data) => data,
            None => return Ok(None),
        }
    } else {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
    };
    Ok(Some(serde_json::from_str(payload)?))
}

fn first_sse_data(body: &str) -> Option<&str> {
    body.lines()
        .find_map(|line| line.trim_start().strip_prefix("data:"))
        .map(str::trim)
}

// ── Heartbeat ──

/// Emits a "still waiting" line every few seconds while a tool call is in
/// flight. `stop` aborts the task and joins it, so no line can land after
/// the call has settled. Dropping without `stop` (a cancelled run) aborts
/// without joining.
struct Heartbeat {
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn start(status: StatusSink, tool_name: String) -> Self {
        let handle = tokio::spawn(async move {
            let mut elapsed = 0;
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                elapsed += HEARTBEAT_INTERVAL.as_secs();
                status
                    .emit(format!(
                        "[MCP] Still waiting on '{tool_name}'... ({elapsed}s)"
                    ))
                    .await;
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

// ── Session ──

/// A connected tool-server session: transport plus the cached tool list.
/// Not safe for concurrent calls; the flows that own one run sequentially.
pub struct McpSession {
    transport: Box<dyn ToolTransport>,
    tools: Option<Vec<McpTool>>,
    status: StatusSink,
}

impl McpSession {
    pub fn new(transport: Box<dyn ToolTransport>, status: StatusSink) -> Self {
        Self {
            transport,
            tools: None,
            status,
        }
    }

    /// Connect over HTTP, run the handshake, and list tools once so the
    /// operator sees what the server offers before any work starts.
    pub async fn connect(url: &str, api_key: &str, status: StatusSink) -> Result<Self> {
        status.rule('=').await;
        status.emit("[MCP] Connecting to tool server...").await;
        status.emit(format!("[MCP] URL: {url}")).await;
        status.rule('=').await;

        let transport = HttpTransport::connect(url, api_key).await?;
        let mut session = Self::new(Box::new(transport), status);

        let tools = session.list_tools().await?;
        session
            .status
            .emit(format!("[MCP] Connected. {} tool(s) available:", tools.len()))
            .await;
        for tool in &tools {
            session
                .status
                .emit(format!(
                    "   - {}: {}",
                    tool.name,
                    tool.description.as_deref().unwrap_or("No description")
                ))
                .await;
        }
        session.status.rule('=').await;
        Ok(session)
    }

    /// The server's tool list, fetched once and cached for the session.
    pub async fn list_tools(&mut self) -> Result<Vec<McpTool>> {
        if self.tools.is_none() {
            self.tools = Some(self.transport.list_tools().await?);
        }
        Ok(self.tools.clone().unwrap_or_default())
    }

    /// Every cached tool as a function-calling schema.
    pub async fn to_function_schemas(&mut self) -> Result<Vec<FunctionSchema>> {
        Ok(self
            .list_tools()
            .await?
            .iter()
            .map(McpTool::to_function_schema)
            .collect())
    }

    /// Invoke one tool and flatten its result content to text. Failures
    /// come back as a tool-scoped error carrying the tool name, so callers
    /// can decide whether one bad call sinks the whole run.
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<String> {
        let heartbeat = Heartbeat::start(self.status.clone(), name.to_string());
        let outcome = self.transport.call_tool(name, arguments).await;
        heartbeat.stop().await;

        let result = outcome.map_err(|e| Error::tool(name, e.to_string()))?;
        let text = join_content(&result);
        if result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let message = if text.is_empty() {
                "tool reported an error".to_string()
            } else {
                text
            };
            return Err(Error::tool(name, message));
        }
        Ok(text)
    }

    /// Send one deterministic query to the first available tool, guessing
    /// which schema field carries the text. Works for single-tool servers
    /// with a free-text parameter; anything richer should go through the
    /// agent loop instead.
    pub async fn query(&mut self, text: &str) -> Result<String> {
        let tools = self.list_tools().await?;
        let Some(tool) = tools.first() else {
            return Err(Error::mcp("no tools available on the tool server"));
        };
        let tool_name = tool.name.clone();
        let field = query_field(tool);

        self.status.rule('-').await;
        self.status
            .emit(format!("[MCP] Sending query to tool '{tool_name}'..."))
            .await;
        self.status.emit("[MCP] Query:").await;
        for line in text.trim().lines() {
            self.status.emit(format!("   {line}")).await;
        }
        self.status.rule('-').await;

        let mut arguments = serde_json::Map::new();
        arguments.insert(field, Value::String(text.to_string()));
        let result = self.call_tool(&tool_name, Value::Object(arguments)).await?;

        self.status.rule('-').await;
        self.status
            .emit(format!(
                "[MCP] Response received ({} characters)",
                result.len()
            ))
            .await;
        for line in preview_lines(&result) {
            self.status.emit(format!("   {line}")).await;
        }
        self.status.rule('-').await;
        Ok(result)
    }
}

/// Which schema property should carry the query text: a well-known name if
/// the tool declares one, otherwise its first declared property, otherwise
/// the literal `query`.
fn query_field(tool: &McpTool) -> String {
    if let Some(props) = tool
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
    {
        for candidate in QUERY_FIELD_CANDIDATES {
            if props.contains_key(candidate) {
                return candidate.to_string();
            }
        }
        if let Some(first) = props.keys().next() {
            return first.clone();
        }
    }
    "query".to_string()
}

/// Flatten a tool result's `content` array to one string: text parts come
/// through verbatim, anything else is serialized, parts join with newlines.
fn join_content(result: &Value) -> String {
    let Some(parts) = result.get("content").and_then(Value::as_array) else {
        return String::new();
    };
    parts
        .iter()
        .map(|part| match part.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// First chunk of a tool response, clipped for the status log.
fn preview_lines(text: &str) -> Vec<String> {
    const MAX_CHARS: usize = 500;
    const MAX_LINES: usize = 15;

    let clipped: String = text.chars().take(MAX_CHARS).collect();
    let mut lines: Vec<String> = clipped.lines().take(MAX_LINES).map(String::from).collect();
    if text.chars().count() > MAX_CHARS || clipped.lines().count() > MAX_LINES {
        lines.push("... (truncated)".to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // --- scripted transport ---

    #[derive(Default)]
    struct ScriptedTransport {
        tools: Vec<McpTool>,
        list_calls: Arc<AtomicUsize>,
        calls: Arc<StdMutex<Vec<(String, Value)>>>,
        responses: VecDeque<Result<Value>>,
    }

    #[async_trait]
    impl ToolTransport for ScriptedTransport {
        async fn list_tools(&mut self) -> Result<Vec<McpTool>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.tools.clone())
        }

        async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            self.responses
                .pop_front()
                .unwrap_or_else(|| Ok(text_result("ok")))
        }
    }

    fn text_result(text: &str) -> Value {
        json!({ "content": [ { "type": "text", "text": text } ] })
    }

    fn tool(name: &str, schema: Value) -> McpTool {
        McpTool {
            name: name.to_string(),
            description: Some(format!("{name} tool")),
            input_schema: schema,
        }
    }

    // --- query field heuristic ---

    #[test]
    fn query_field_prefers_well_known_names() {
        let t = tool(
            "search",
            json!({ "properties": { "foo": {}, "question": {} } }),
        );
        assert_eq!(query_field(&t), "question");
    }

    #[test]
    fn query_field_falls_back_to_first_declared_property() {
        let t = tool(
            "search",
            json!({ "properties": { "device_filter": {}, "limit": {} } }),
        );
        assert_eq!(query_field(&t), "device_filter");
    }

    #[test]
    fn query_field_defaults_to_query_without_properties() {
        assert_eq!(query_field(&tool("bare", Value::Null)), "query");
        assert_eq!(
            query_field(&tool("empty", json!({ "properties": {} }))),
            "query"
        );
    }

    // --- schema conversion ---

    #[test]
    fn schemaless_tool_gets_an_empty_object_schema() {
        let schema = tool("bare", Value::Null).to_function_schema();
        assert_eq!(schema.kind, "function");
        assert_eq!(
            schema.function.parameters,
            json!({ "type": "object", "properties": {} })
        );
    }

    #[test]
    fn declared_schema_passes_through() {
        let declared = json!({ "type": "object", "properties": { "query": { "type": "string" } } });
        let schema = tool("search", declared.clone()).to_function_schema();
        assert_eq!(schema.function.name, "search");
        assert_eq!(schema.function.parameters, declared);
    }

    // --- result flattening ---

    #[test]
    fn join_content_joins_text_parts_with_newlines() {
        let result = json!({ "content": [
            { "type": "text", "text": "line one" },
            { "type": "text", "text": "line two" },
        ] });
        assert_eq!(join_content(&result), "line one\nline two");
    }

    #[test]
    fn join_content_serializes_non_text_parts() {
        let result = json!({ "content": [ { "type": "image", "data": "abc" } ] });
        assert_eq!(join_content(&result), r#"{"type":"image","data":"abc"}"#);
    }

    #[test]
    fn join_content_is_empty_without_content() {
        assert_eq!(join_content(&json!({})), "");
        assert_eq!(join_content(&json!({ "content": [] })), "");
    }

    // --- session behavior ---

    #[tokio::test]
    async fn tool_list_is_fetched_once_and_cached() {
        let list_calls = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport {
            tools: vec![tool("search", Value::Null)],
            list_calls: list_calls.clone(),
            ..Default::default()
        };
        let mut session = McpSession::new(Box::new(transport), StatusSink::silent());

        session.list_tools().await.unwrap();
        session.list_tools().await.unwrap();
        let schemas = session.to_function_schemas().await.unwrap();

        assert_eq!(schemas.len(), 1);
        assert_eq!(list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn query_targets_the_first_tool_and_chosen_field() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let transport = ScriptedTransport {
            tools: vec![
                tool(
                    "search",
                    json!({ "properties": { "foo": {}, "question": {} } }),
                ),
                tool("ignored", Value::Null),
            ],
            calls: calls.clone(),
            responses: VecDeque::from([Ok(text_result("42 devices"))]),
            ..Default::default()
        };
        let mut session = McpSession::new(Box::new(transport), StatusSink::silent());

        let out = session.query("how many devices?").await.unwrap();

        assert_eq!(out, "42 devices");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "search");
        assert_eq!(calls[0].1, json!({ "question": "how many devices?" }));
    }

    #[tokio::test]
    async fn query_without_tools_is_an_error() {
        let transport = ScriptedTransport::default();
        let mut session = McpSession::new(Box::new(transport), StatusSink::silent());
        let err = session.query("anything").await.unwrap_err();
        assert!(matches!(err, Error::Mcp(_)));
        assert!(err.to_string().contains("no tools available"));
    }

    #[tokio::test]
    async fn error_flagged_results_become_tool_errors() {
        let transport = ScriptedTransport {
            tools: vec![tool("search", Value::Null)],
            responses: VecDeque::from([Ok(json!({
                "isError": true,
                "content": [ { "type": "text", "text": "index offline" } ],
            }))]),
            ..Default::default()
        };
        let mut session = McpSession::new(Box::new(transport), StatusSink::silent());

        let err = session.call_tool("search", json!({})).await.unwrap_err();
        match err {
            Error::ToolInvocation { name, message } => {
                assert_eq!(name, "search");
                assert_eq!(message, "index offline");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn transport_failures_are_scoped_to_the_tool() {
        let transport = ScriptedTransport {
            tools: vec![tool("search", Value::Null)],
            responses: VecDeque::from([Err(Error::mcp("server returned 500"))]),
            ..Default::default()
        };
        let mut session = McpSession::new(Box::new(transport), StatusSink::silent());

        let err = session.call_tool("search", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ToolInvocation { .. }));
        assert!(err.to_string().contains("server returned 500"));
    }

    // --- heartbeat ---

    #[tokio::test(start_paused = true)]
    async fn heartbeat_emits_while_waiting_and_stops_on_join() {
        let sink = StatusSink::silent();
        let heartbeat = Heartbeat::start(sink.clone(), "slow_tool".to_string());

        tokio::time::sleep(Duration::from_secs(12)).await;
        heartbeat.stop().await;

        let lines = sink.transcript().await;
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("slow_tool"));
        assert!(lines[0].contains("5s"));
        assert!(lines[1].contains("10s"));

        // Nothing more after the join.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sink.transcript().await.len(), 2);
    }

    // --- body parsing ---

    #[test]
    fn sse_bodies_yield_their_first_data_line() {
        let body =
            "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n";
        let resp = parse_rpc_body("text/event-stream", body).unwrap().unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[test]
    fn plain_json_bodies_parse_directly() {
        let body = r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#;
        let resp = parse_rpc_body("application/json", body).unwrap().unwrap();
        assert_eq!(resp.id, json!(7));
    }

    #[test]
    fn empty_bodies_are_not_an_error() {
        assert!(parse_rpc_body("application/json", "").unwrap().is_none());
        assert!(
            parse_rpc_body("text/event-stream", "event: ping\n\n")
                .unwrap()
                .is_none()
        );
    }

    // --- preview ---

    #[test]
    fn preview_clips_long_responses() {
        let long = "x".repeat(600);
        let lines = preview_lines(&long);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 500);
        assert_eq!(lines[1], "... (truncated)");

        let short = "one\ntwo";
        assert_eq!(preview_lines(short), vec!["one", "two"]);
    }
}
