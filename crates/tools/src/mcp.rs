//! External tool servers (MCP).
//!
//! Servers are declared in a config file under an `mcpServers` map and can
//! speak stdio (local subprocess), SSE, or streamable HTTP. Each discovered
//! tool is registered as `{server}__{tool}` with a `[MCP:{server}]`
//! description prefix. Invocations get a timeout and one reconnect attempt;
//! shutdown unregisters everything and tears sessions down in reverse order.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use crate::{Tool, ToolContext, ToolError, ToolOutput, ToolRegistry, ToolSpec};

const PROTOCOL_VERSION: &str = "2024-11-05";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    /// Local subprocess command (stdio transport).
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Remote endpoint (SSE or streamable HTTP transport).
    pub url: Option<String>,
    /// "stdio" | "sse" | "http"; inferred from command/url when absent.
    pub transport: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl McpServerConfig {
    fn transport_kind(&self) -> &str {
        if let Some(kind) = self.transport.as_deref() {
            return kind;
        }
        if self.command.is_some() { "stdio" } else { "http" }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: HashMap<String, McpServerConfig>,
}

impl McpConfig {
    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

// ── JSON-RPC plumbing ────────────────────────────────────────────────────────

fn rpc_request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

fn rpc_notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

fn extract_result(message: Value) -> Result<Value, ToolError> {
    if let Some(error) = message.get("error") {
        return Err(ToolError::Failed(format!("server error: {error}")));
    }
    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

struct StdioSession {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

impl StdioSession {
    async fn spawn(config: &McpServerConfig) -> Result<Self, ToolError> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| ToolError::InvalidArgs("stdio server needs a command".into()))?;
        let mut child = Command::new(command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Failed(format!("failed to spawn '{command}': {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Failed("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Failed("child stdout unavailable".into()))?;
        Ok(Self { child, stdin, reader: BufReader::new(stdout) })
    }

    async fn send(&mut self, message: &Value) -> Result<(), ToolError> {
        let mut line = message.to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ToolError::Failed(format!("stdio write failed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ToolError::Failed(format!("stdio flush failed: {e}")))
    }

    /// Read messages until the one answering `id` arrives; notifications in
    /// between are skipped.
    async fn read_response(&mut self, id: u64) -> Result<Value, ToolError> {
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| ToolError::Failed(format!("stdio read failed: {e}")))?;
            if n == 0 {
                return Err(ToolError::Failed("server closed its stdout".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
                debug!(line = trimmed, "non-JSON line from MCP server, skipping");
                continue;
            };
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                return Ok(message);
            }
        }
    }
}

/// Legacy SSE session: responses arrive on a long-lived GET stream while
/// requests POST to an endpoint the server announces in its first event.
struct SseSession {
    http: reqwest::Client,
    post_url: String,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    reader: tokio::task::JoinHandle<()>,
}

impl SseSession {
    async fn connect(url: &str, timeout: Duration) -> Result<Self, ToolError> {
        let http = reqwest::Client::new();
        let response = http
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("SSE connect failed: {e}")))?;
        let mut stream = Box::pin(response.bytes_stream());
        let mut buffer = String::new();
        let mut current_event = String::new();

        // Wait for the endpoint announcement.
        let post_url = tokio::time::timeout(timeout, async {
            loop {
                let Some(chunk) = stream.next().await else {
                    return Err(ToolError::Failed("SSE stream ended before endpoint event".into()));
                };
                let chunk = chunk.map_err(|e| ToolError::Failed(format!("SSE read failed: {e}")))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer.drain(..=pos).collect::<String>();
                    let line = line.trim();
                    if let Some(event) = line.strip_prefix("event:") {
                        current_event = event.trim().to_string();
                    } else if let Some(data) = line.strip_prefix("data:") {
                        if current_event == "endpoint" {
                            return Ok(resolve_endpoint(url, data.trim()));
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| ToolError::Timeout(timeout))??;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_for_reader = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            let mut current_event = String::from("message");
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer.drain(..=pos).collect::<String>();
                    let line = line.trim();
                    if let Some(event) = line.strip_prefix("event:") {
                        current_event = event.trim().to_string();
                    } else if let Some(data) = line.strip_prefix("data:") {
                        if current_event != "message" {
                            continue;
                        }
                        let Ok(message) = serde_json::from_str::<Value>(data.trim()) else {
                            continue;
                        };
                        if let Some(id) = message.get("id").and_then(Value::as_u64) {
                            if let Some(tx) = pending_for_reader.lock().await.remove(&id) {
                                let _ = tx.send(message);
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { http, post_url, pending, reader })
    }

    async fn request(&self, id: u64, message: &Value, timeout: Duration) -> Result<Value, ToolError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let post = self
            .http
            .post(&self.post_url)
            .json(message)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("SSE post failed: {e}")))?;
        if !post.status().is_success() && post.status().as_u16() != 202 {
            self.pending.lock().await.remove(&id);
            return Err(ToolError::Failed(format!("SSE post rejected: {}", post.status())));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(ToolError::Failed("SSE session closed".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolError::Timeout(timeout))
            }
        }
    }
}

impl Drop for SseSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn resolve_endpoint(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    match reqwest::Url::parse(base).and_then(|b| b.join(endpoint)) {
        Ok(url) => url.to_string(),
        Err(_) => endpoint.to_string(),
    }
}

/// Streamable HTTP: each request is one POST; the response body is either a
/// JSON message or a short SSE frame carrying one.
struct HttpSession {
    http: reqwest::Client,
    url: String,
}

impl HttpSession {
    async fn request(&self, message: &Value) -> Result<Value, ToolError> {
        let response = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(message)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("HTTP post failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Failed(format!("HTTP read failed: {e}")))?;
        if !status.is_success() {
            return Err(ToolError::Failed(format!("HTTP request rejected ({status}): {body}")));
        }
        if let Ok(message) = serde_json::from_str::<Value>(&body) {
            return Ok(message);
        }
        for line in body.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                if let Ok(message) = serde_json::from_str::<Value>(data.trim()) {
                    return Ok(message);
                }
            }
        }
        Err(ToolError::Failed("unparseable HTTP response body".into()))
    }
}

enum Session {
    Stdio(StdioSession),
    Sse(SseSession),
    Http(HttpSession),
}

// ── Connection ───────────────────────────────────────────────────────────────

/// One configured MCP server.
pub struct McpConnection {
    pub name: String,
    config: McpServerConfig,
    session: Mutex<Option<Session>>,
    next_id: AtomicU64,
}

impl McpConnection {
    pub fn new(name: impl Into<String>, config: McpServerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Establish the transport and run the initialize handshake.
    pub async fn connect(&self) -> Result<(), ToolError> {
        let timeout = self.config.timeout();
        let mut session = match self.config.transport_kind() {
            "stdio" => Session::Stdio(StdioSession::spawn(&self.config).await?),
            "sse" => {
                let url = self
                    .config
                    .url
                    .as_deref()
                    .ok_or_else(|| ToolError::InvalidArgs("sse server needs a url".into()))?;
                Session::Sse(SseSession::connect(url, timeout).await?)
            }
            _ => {
                let url = self
                    .config
                    .url
                    .as_deref()
                    .ok_or_else(|| ToolError::InvalidArgs("http server needs a url".into()))?;
                Session::Http(HttpSession { http: reqwest::Client::new(), url: url.to_string() })
            }
        };

        let id = self.next_id();
        let init = rpc_request(
            id,
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "saiverse", "version": env!("CARGO_PKG_VERSION")},
            }),
        );
        let response = Self::round_trip(&mut session, id, &init, timeout).await?;
        extract_result(response)?;
        Self::notify(&mut session, &rpc_notification("notifications/initialized", json!({}))).await?;

        info!(server = %self.name, transport = self.config.transport_kind(), "MCP server connected");
        *self.session.lock().await = Some(session);
        Ok(())
    }

    async fn round_trip(
        session: &mut Session,
        id: u64,
        message: &Value,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        match session {
            Session::Stdio(stdio) => {
                stdio.send(message).await?;
                tokio::time::timeout(timeout, stdio.read_response(id))
                    .await
                    .map_err(|_| ToolError::Timeout(timeout))?
            }
            Session::Sse(sse) => sse.request(id, message, timeout).await,
            Session::Http(http) => {
                tokio::time::timeout(timeout, http.request(message))
                    .await
                    .map_err(|_| ToolError::Timeout(timeout))?
            }
        }
    }

    async fn notify(session: &mut Session, message: &Value) -> Result<(), ToolError> {
        match session {
            Session::Stdio(stdio) => stdio.send(message).await,
            Session::Sse(sse) => {
                let _ = sse
                    .http
                    .post(&sse.post_url)
                    .json(message)
                    .send()
                    .await
                    .map_err(|e| ToolError::Failed(format!("SSE notify failed: {e}")))?;
                Ok(())
            }
            Session::Http(http) => {
                let _ = http.request(message).await;
                Ok(())
            }
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let timeout = self.config.timeout();
        let id = self.next_id();
        let message = rpc_request(id, method, params);
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| ToolError::Failed(format!("server '{}' is not connected", self.name)))?;
        let response = Self::round_trip(session, id, &message, timeout).await?;
        extract_result(response)
    }

    /// Enumerate the server's tools as (name, description, input schema).
    pub async fn list_tools(&self) -> Result<Vec<(String, String, Value)>, ToolError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?.to_string();
                let description = tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let schema = tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"}));
                Some((name, description, schema))
            })
            .collect())
    }

    /// Invoke a remote tool; a failed call gets one reconnect-and-retry.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<String, ToolError> {
        let params = json!({"name": tool, "arguments": arguments});
        match self.request("tools/call", params.clone()).await {
            Ok(result) => Ok(render_call_result(result)),
            Err(first_err) => {
                warn!(server = %self.name, tool, error = %first_err, "MCP call failed, reconnecting once");
                self.disconnect().await;
                self.connect().await?;
                let result = self.request("tools/call", params).await?;
                Ok(render_call_result(result))
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            if let Session::Stdio(mut stdio) = session {
                let _ = stdio.child.kill().await;
            }
        }
    }
}

/// Flatten a tools/call result into the string-ish form tools return.
fn render_call_result(result: Value) -> String {
    if let Some(content) = result.get("content").and_then(Value::as_array) {
        let texts: Vec<&str> = content
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    result.to_string()
}

// ── Registration ─────────────────────────────────────────────────────────────

struct McpTool {
    server: String,
    tool: String,
    description: String,
    schema: Value,
    connection: Arc<McpConnection>,
}

#[async_trait]
impl Tool for McpTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: format!("{}__{}", self.server, self.tool),
            description: format!("[MCP:{}] {}", self.server, self.description),
            parameters: self.schema.clone(),
        }
    }

    async fn run(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let text = self.connection.call_tool(&self.tool, args).await?;
        Ok(ToolOutput::text(text))
    }
}

/// Lifecycle owner for every configured MCP server.
pub struct McpManager {
    connections: Vec<Arc<McpConnection>>,
    registered: Vec<String>,
    registry: ToolRegistry,
}

impl McpManager {
    /// Connect all configured servers and register their tools. A server
    /// that fails to connect is skipped with a warning.
    pub async fn start(config: McpConfig, registry: ToolRegistry) -> Self {
        let mut connections = Vec::new();
        let mut registered = Vec::new();

        let mut names: Vec<_> = config.servers.keys().cloned().collect();
        names.sort();
        for name in names {
            let server_config = config.servers[&name].clone();
            let connection = Arc::new(McpConnection::new(name.clone(), server_config));
            if let Err(err) = connection.connect().await {
                warn!(server = %name, error = %err, "skipping MCP server");
                continue;
            }
            match connection.list_tools().await {
                Ok(tools) => {
                    for (tool, description, schema) in tools {
                        let wrapped = McpTool {
                            server: name.clone(),
                            tool,
                            description,
                            schema,
                            connection: Arc::clone(&connection),
                        };
                        let registered_name = wrapped.spec().name;
                        registry.register(Arc::new(wrapped));
                        registered.push(registered_name);
                    }
                }
                Err(err) => {
                    warn!(server = %name, error = %err, "tool enumeration failed");
                }
            }
            connections.push(connection);
        }

        info!(servers = connections.len(), tools = registered.len(), "MCP startup complete");
        Self { connections, registered, registry }
    }

    /// Unregister every MCP tool and tear sessions down in reverse order.
    pub async fn shutdown(&mut self) {
        for name in self.registered.drain(..).rev() {
            self.registry.unregister(&name);
        }
        for connection in self.connections.drain(..).rev() {
            connection.disconnect().await;
        }
    }

    pub fn registered_tools(&self) -> &[String] {
        &self.registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_the_mcp_servers_map() {
        let raw = r#"{
            "mcpServers": {
                "files": {"command": "file-server", "args": ["--root", "/tmp"], "env": {"DEBUG": "1"}},
                "search": {"url": "https://example.com/mcp", "transport": "sse", "timeout_secs": 30}
            }
        }"#;
        let config: McpConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.servers.len(), 2);

        let files = &config.servers["files"];
        assert_eq!(files.transport_kind(), "stdio");
        assert_eq!(files.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        let search = &config.servers["search"];
        assert_eq!(search.transport_kind(), "sse");
        assert_eq!(search.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn transport_defaults_to_http_for_bare_urls() {
        let config = McpServerConfig {
            url: Some("https://example.com/mcp".to_string()),
            ..Default::default()
        };
        assert_eq!(config.transport_kind(), "http");
    }

    #[test]
    fn call_result_prefers_text_content() {
        let result = json!({"content": [{"type": "text", "text": "one"}, {"type": "text", "text": "two"}]});
        assert_eq!(render_call_result(result), "one\ntwo");

        let structured = json!({"structuredContent": {"answer": 42}});
        assert!(render_call_result(structured).contains("42"));
    }

    #[test]
    fn endpoint_resolution_handles_relative_paths() {
        assert_eq!(
            resolve_endpoint("https://example.com/sse", "/messages?id=1"),
            "https://example.com/messages?id=1"
        );
        assert_eq!(
            resolve_endpoint("https://example.com/sse", "https://other.example/m"),
            "https://other.example/m"
        );
    }

    #[test]
    fn rpc_envelopes_are_well_formed() {
        let req = rpc_request(7, "tools/list", json!({}));
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["id"], 7);

        let note = rpc_notification("notifications/initialized", json!({}));
        assert!(note.get("id").is_none());

        assert!(extract_result(json!({"error": {"code": -1}})).is_err());
        assert_eq!(extract_result(json!({"result": {"ok": true}})).unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn stdio_round_trip_against_a_scripted_server() {
        // A tiny shell MCP server: answers initialize, tools/list, tools/call.
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *initialize*) printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05"}}\n' "$id" ;;
    *tools/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","description":"Ping","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *tools/call*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
  esac
done
"#;
        let config = McpServerConfig {
            command: Some("sh".to_string()),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_secs: Some(5),
            ..Default::default()
        };

        let registry = ToolRegistry::new();
        let mut servers = HashMap::new();
        servers.insert("local".to_string(), config);
        let mut manager = McpManager::start(McpConfig { servers }, registry.clone()).await;

        assert_eq!(manager.registered_tools(), ["local__ping"]);
        let spec = registry.get("local__ping").unwrap().spec();
        assert!(spec.description.starts_with("[MCP:local]"));

        let output = registry
            .call("local__ping", json!({}), &ToolContext::default(), None)
            .await
            .unwrap();
        assert_eq!(output.primary_text(), "pong");

        manager.shutdown().await;
        assert!(!registry.contains("local__ping"));
    }
}
