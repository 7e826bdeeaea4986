use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod openai;
pub mod testing;
pub mod token;

pub use token::{estimate_image_tokens, estimate_messages_tokens, estimate_text_tokens};

// ── Chat message types ───────────────────────────────────────────────────────

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a model-ready conversation.
///
/// `metadata` carries context-assembly markers (`__visual_context__`,
/// `__realtime_context__`, `__memory_weave_context__`, media lists) that the
/// context builder and the budget trimmer use; providers ignore it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    /// Tool calls requested by the assistant (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// When role == Tool, identifies which tool call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on tool-result messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(ChatRole::Assistant, content)
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(tool_name.into()),
            ..Self::plain(ChatRole::Tool, content)
        }
    }

    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_flag(mut self, flag: &str) -> Self {
        self.metadata.insert(flag.to_string(), Value::Bool(true));
        self
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.metadata.get(flag).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(default = "default_tool_call_type", rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
    /// Echoed back on follow-up turns for thinking models that require it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments serialized as a JSON string (wire format).
    pub arguments: String,
}

/// Function schema passed to the model for tool calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the parameters object.
    pub parameters: Value,
}

impl ToolSchema {
    /// OpenAI-compatible `tools` array entry.
    pub fn to_openai(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

// ── Call results ─────────────────────────────────────────────────────────────

/// Final shape of one model response.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmOutcome {
    Text {
        content: String,
    },
    ToolCall {
        tool_name: String,
        tool_args: Value,
        thought_signature: Option<String>,
    },
    Both {
        content: String,
        tool_name: String,
        tool_args: Value,
        thought_signature: Option<String>,
    },
}

impl LlmOutcome {
    pub fn text(&self) -> &str {
        match self {
            LlmOutcome::Text { content } | LlmOutcome::Both { content, .. } => content,
            LlmOutcome::ToolCall { .. } => "",
        }
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self, LlmOutcome::ToolCall { .. } | LlmOutcome::Both { .. })
    }
}

/// Token usage reported by the provider for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_ttl: String,
}

/// One unit yielded by a response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    Thinking(String),
}

/// Knobs for one generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: f32,
    /// JSON Schema for structured output; forces non-streaming JSON mode.
    pub response_schema: Option<Value>,
    pub cache_enabled: bool,
    pub cache_ttl: String,
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Failure of an LLM call, carrying a user-facing message for the UI.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct LlmError {
    pub message: String,
    pub user_message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl LlmError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_message: "LLM呼び出し中にエラーが発生しました。".to_string(),
            source: None,
        }
    }

    pub fn with_user_message(mut self, user_message: impl Into<String>) -> Self {
        self.user_message = user_message.into();
        self
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ── Client contract ──────────────────────────────────────────────────────────

/// An open response stream. `close` disconnects the transport, which stops
/// provider-side token generation (and billing); dropping the stream has the
/// same effect.
#[async_trait]
pub trait LlmStream: Send {
    /// Next chunk, or None at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>, LlmError>;

    fn close(&mut self);
}

/// A model client bound to one model config.
///
/// Usage, reasoning, and tool-detection accessors are consume-once: they
/// return data from the most recent completed call, then yield nothing until
/// the next call. A stream must be fully read (or closed) before consuming.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Config key of the model this client talks to.
    fn model_key(&self) -> &str;

    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerateOptions,
    ) -> Result<LlmOutcome, LlmError>;

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerateOptions,
    ) -> Result<Box<dyn LlmStream>, LlmError>;

    fn consume_usage(&self) -> Option<LlmUsage>;

    fn consume_reasoning(&self) -> Option<String>;

    fn consume_reasoning_details(&self) -> Option<Value>;

    /// Tool call detected during the last (streamed) call, if any.
    fn consume_tool_detection(&self) -> Option<LlmOutcome>;

    /// Put a peeked tool detection back for a later consumer.
    fn store_tool_detection(&self, outcome: LlmOutcome);
}

/// Shared consume-once slots used by client implementations.
#[derive(Debug, Default)]
pub struct CallState {
    usage: Mutex<Option<LlmUsage>>,
    reasoning: Mutex<Option<String>>,
    reasoning_details: Mutex<Option<Value>>,
    tool_detection: Mutex<VecDeque<LlmOutcome>>,
}

impl CallState {
    pub fn set_usage(&self, usage: LlmUsage) {
        *self.usage.lock().unwrap() = Some(usage);
    }

    pub fn take_usage(&self) -> Option<LlmUsage> {
        self.usage.lock().unwrap().take()
    }

    pub fn set_reasoning(&self, text: Option<String>, details: Option<Value>) {
        *self.reasoning.lock().unwrap() = text;
        *self.reasoning_details.lock().unwrap() = details;
    }

    pub fn take_reasoning(&self) -> Option<String> {
        self.reasoning.lock().unwrap().take()
    }

    pub fn take_reasoning_details(&self) -> Option<Value> {
        self.reasoning_details.lock().unwrap().take()
    }

    pub fn set_tool_detection(&self, outcome: LlmOutcome) {
        self.tool_detection.lock().unwrap().push_back(outcome);
    }

    pub fn take_tool_detection(&self) -> Option<LlmOutcome> {
        self.tool_detection.lock().unwrap().pop_front()
    }
}

/// Mint a tool-call id in the wire format used across the conversation log.
pub fn new_tool_call_id() -> String {
    format!("tc_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, ChatRole::System);
        assert_eq!(ChatMessage::user("u").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("a").role, ChatRole::Assistant);

        let tool = ChatMessage::tool_result("tc_1", "web_search", "result");
        assert_eq!(tool.role, ChatRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("tc_1"));
        assert_eq!(tool.name.as_deref(), Some("web_search"));
    }

    #[test]
    fn flags_roundtrip() {
        let msg = ChatMessage::user("now").with_flag("__realtime_context__");
        assert!(msg.has_flag("__realtime_context__"));
        assert!(!msg.has_flag("__visual_context__"));
    }

    #[test]
    fn serialization_skips_empty_tool_fields() {
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn tool_schema_openai_shape() {
        let schema = ToolSchema {
            name: "memory_recall".to_string(),
            description: "Recall memories".to_string(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        };
        let entry = schema.to_openai();
        assert_eq!(entry["type"], "function");
        assert_eq!(entry["function"]["name"], "memory_recall");
    }

    #[test]
    fn call_state_is_consume_once() {
        let state = CallState::default();
        state.set_usage(LlmUsage { model: "m".into(), input_tokens: 10, ..Default::default() });
        assert!(state.take_usage().is_some());
        assert!(state.take_usage().is_none());

        state.set_tool_detection(LlmOutcome::Text { content: "x".into() });
        assert!(state.take_tool_detection().is_some());
        assert!(state.take_tool_detection().is_none());
    }

    #[test]
    fn outcome_text_accessor() {
        let both = LlmOutcome::Both {
            content: "hello".into(),
            tool_name: "t".into(),
            tool_args: Value::Null,
            thought_signature: None,
        };
        assert_eq!(both.text(), "hello");
        assert!(both.is_tool_call());

        let call = LlmOutcome::ToolCall {
            tool_name: "t".into(),
            tool_args: Value::Null,
            thought_signature: None,
        };
        assert_eq!(call.text(), "");
    }

    #[test]
    fn tool_call_ids_are_unique() {
        let a = new_tool_call_id();
        let b = new_tool_call_id();
        assert!(a.starts_with("tc_"));
        assert_ne!(a, b);
    }
}
