use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub mod mcp;

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Scoped execution context for one tool call.
///
/// Built fresh per invocation and dropped when the call returns; nested
/// calls each get their own context, so a tool always sees the persona that
/// invoked it. Tools must tolerate missing fields.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub persona_id: Option<String>,
    pub persona_dir: Option<PathBuf>,
    pub playbook_name: Option<String>,
    pub auto_mode: bool,
    /// Sink for UI-facing events (confirmations, activity); JSON payloads so
    /// this crate stays independent of the runtime's event enum.
    pub event_sink: Option<Arc<dyn Fn(Value) + Send + Sync>>,
}

impl ToolContext {
    pub fn for_persona(persona_id: impl Into<String>) -> Self {
        Self {
            persona_id: Some(persona_id.into()),
            ..Self::default()
        }
    }

    pub fn with_playbook(mut self, playbook_name: impl Into<String>) -> Self {
        self.playbook_name = Some(playbook_name.into());
        self
    }

    pub fn with_auto_mode(mut self, auto_mode: bool) -> Self {
        self.auto_mode = auto_mode;
        self
    }

    pub fn active_persona_id(&self) -> Option<&str> {
        self.persona_id.as_deref()
    }

    pub fn active_persona_dir(&self) -> Option<&PathBuf> {
        self.persona_dir.as_ref()
    }

    pub fn emit(&self, event: Value) {
        if let Some(sink) = &self.event_sink {
            sink(event);
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("persona_id", &self.persona_id)
            .field("playbook_name", &self.playbook_name)
            .field("auto_mode", &self.auto_mode)
            .finish_non_exhaustive()
    }
}

/// Static metadata about a tool: name, description, JSON-Schema parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of one tool invocation.
///
/// Tools conceptually return a string; multi-value tools return additional
/// positional values that TOOL nodes can bind to separate state keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub values: Vec<Value>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self { values: vec![Value::String(text.into())] }
    }

    pub fn value(value: Value) -> Self {
        Self { values: vec![value] }
    }

    pub fn pair(first: Value, second: Value) -> Self {
        Self { values: vec![first, second] }
    }

    pub fn primary(&self) -> &Value {
        self.values.first().unwrap_or(&Value::Null)
    }

    /// Primary value as a display string (strings unquoted, rest JSON).
    pub fn primary_text(&self) -> String {
        match self.primary() {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("tool failed: {0}")]
    Failed(String),
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),
}

/// Trait implemented by every tool (builtin or externally injected).
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Central registry for all available tools. Read-mostly; registration of
/// external tools takes the brief exclusive lock.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name;
        debug!(name = %name, "registering tool");
        self.tools.write().expect("tool registry lock poisoned").insert(name, tool);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools.write().expect("tool registry lock poisoned").remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().expect("tool registry lock poisoned").get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().expect("tool registry lock poisoned").contains_key(name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .read()
            .expect("tool registry lock poisoned")
            .values()
            .map(|t| t.spec())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn names(&self) -> Vec<String> {
        self.specs().into_iter().map(|s| s.name).collect()
    }

    /// Invoke a tool by name with an optional timeout.
    pub async fn call(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        match timeout {
            Some(limit) => tokio::time::timeout(limit, tool.run(args, ctx))
                .await
                .map_err(|_| {
                    warn!(name, ?limit, "tool call timed out");
                    ToolError::Timeout(limit)
                })?,
            None => tool.run(args, ctx).await,
        }
    }
}

/// JSON Schema for a tool's argument struct.
pub fn params_schema<T: schemars::JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| {
        serde_json::json!({"type": "object"})
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "Echo the input".to_string(),
                parameters: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            }
        }

        async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            let text = args.get("text").and_then(Value::as_str).unwrap_or("");
            let persona = ctx.active_persona_id().unwrap_or("nobody");
            Ok(ToolOutput::text(format!("{persona}: {text}")))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "slow".to_string(),
                description: "Sleeps".to_string(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn run(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::text("done"))
        }
    }

    #[tokio::test]
    async fn register_call_and_unregister() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        assert!(registry.contains("echo"));

        let ctx = ToolContext::for_persona("p1");
        let output = registry
            .call("echo", json!({"text": "hi"}), &ctx, None)
            .await
            .unwrap();
        assert_eq!(output.primary_text(), "p1: hi");

        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        let err = registry.call("echo", json!({}), &ctx, None).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn call_times_out() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool));
        let err = registry
            .call("slow", json!({}), &ToolContext::default(), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[test]
    fn specs_are_sorted_by_name() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool));
        registry.register(Arc::new(EchoTool));
        let names = registry.names();
        assert_eq!(names, vec!["echo".to_string(), "slow".to_string()]);
    }

    #[test]
    fn tool_output_accessors() {
        let output = ToolOutput::pair(json!("primary"), json!({"k": 1}));
        assert_eq!(output.primary_text(), "primary");
        assert_eq!(output.values.len(), 2);

        let structured = ToolOutput::value(json!({"a": 1}));
        assert_eq!(structured.primary_text(), "{\"a\":1}");

        let empty = ToolOutput { values: vec![] };
        assert_eq!(empty.primary(), &Value::Null);
    }

    #[test]
    fn context_is_scoped_per_call() {
        let outer = ToolContext::for_persona("outer").with_playbook("daily_walk");
        let inner = ToolContext::for_persona("inner");
        assert_eq!(outer.active_persona_id(), Some("outer"));
        assert_eq!(inner.active_persona_id(), Some("inner"));
        assert_eq!(outer.playbook_name.as_deref(), Some("daily_walk"));
        assert!(inner.playbook_name.is_none());
    }
}
