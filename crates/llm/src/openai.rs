//! OpenAI-compatible chat completions client.
//!
//! Works against any endpoint speaking the `/chat/completions` wire format
//! (OpenAI, OpenRouter, local gateways). Streaming uses SSE; `close` drops
//! the transport, which stops provider-side generation and billing.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use saiverse_config::ModelConfig;

use crate::{
    CallState, ChatMessage, ChatRole, GenerateOptions, LlmClient, LlmError, LlmOutcome, LlmStream,
    LlmUsage, StreamChunk, ToolSchema,
};

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    /// Config key (usage records are keyed by this).
    model_key: String,
    /// Provider-facing model name.
    model: String,
    state: Arc<CallState>,
}

impl OpenAiCompatClient {
    pub fn from_config(model_key: impl Into<String>, config: &ModelConfig) -> Result<Self, LlmError> {
        // API keys commonly live in a .env next to the data dir.
        let _ = dotenvy::dotenv();

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| match config.provider.as_str() {
                "openai" => "https://api.openai.com/v1".to_string(),
                "ollama" => "http://localhost:11434/v1".to_string(),
                other => format!("https://{other}.invalid/v1"),
            });

        let api_key = config
            .required_env_vars()
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()));
        if api_key.is_none() && !config.is_local() {
            return Err(LlmError::new(format!(
                "no API key configured for model '{}' (provider {})",
                config.model, config.provider
            ))
            .with_user_message("モデルのAPIキーが設定されていません。".to_string()));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            model_key: model_key.into(),
            model: config.model.clone(),
            state: Arc::new(CallState::default()),
        })
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerateOptions,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages(messages),
            "temperature": options.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(ToolSchema::to_openai).collect());
        }
        if let Some(schema) = &options.response_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {"name": "response", "schema": schema, "strict": true},
            });
        }
        if stream {
            body["stream"] = Value::Bool(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    fn record_usage(&self, usage: Option<ApiUsage>) {
        if let Some(usage) = usage {
            self.state.set_usage(usage.into_llm_usage(&self.model_key));
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn model_key(&self) -> &str {
        &self.model_key
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerateOptions,
    ) -> Result<LlmOutcome, LlmError> {
        let body = self.request_body(messages, tools, options, false);
        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.model, e))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| transport_error(&self.model, e))?;
        if !status.is_success() {
            return Err(LlmError::new(format!(
                "chat completion failed ({status}): {payload}"
            )));
        }

        let completion: ChatCompletion = serde_json::from_value(payload)
            .map_err(|e| LlmError::new(format!("malformed completion payload: {e}")))?;
        self.record_usage(completion.usage);

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::new("completion carried no choices"))?;

        if let Some(reasoning) = choice.message.reasoning.clone() {
            self.state.set_reasoning(Some(reasoning.clone()), Some(Value::String(reasoning)));
        }

        let content = choice.message.content.unwrap_or_default();
        let tool_call = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .next();

        let outcome = match tool_call {
            Some(call) => {
                let tool_args = parse_args(&call.function.arguments);
                if content.trim().is_empty() {
                    LlmOutcome::ToolCall {
                        tool_name: call.function.name,
                        tool_args,
                        thought_signature: None,
                    }
                } else {
                    LlmOutcome::Both {
                        content,
                        tool_name: call.function.name,
                        tool_args,
                        thought_signature: None,
                    }
                }
            }
            None => LlmOutcome::Text { content },
        };
        Ok(outcome)
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerateOptions,
    ) -> Result<Box<dyn LlmStream>, LlmError> {
        let body = self.request_body(messages, tools, options, true);
        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.model, e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::new(format!(
                "streaming chat completion failed ({status}): {detail}"
            )));
        }

        debug!(model = %self.model, "streaming response opened");
        Ok(Box::new(SseStream {
            inner: Some(Box::pin(response.bytes_stream())),
            buffer: String::new(),
            pending: std::collections::VecDeque::new(),
            accum: StreamAccum::default(),
            state: Arc::clone(&self.state),
            model_key: self.model_key.clone(),
            finalized: false,
        }))
    }

    fn consume_usage(&self) -> Option<LlmUsage> {
        self.state.take_usage()
    }

    fn consume_reasoning(&self) -> Option<String> {
        self.state.take_reasoning()
    }

    fn consume_reasoning_details(&self) -> Option<Value> {
        self.state.take_reasoning_details()
    }

    fn consume_tool_detection(&self) -> Option<LlmOutcome> {
        self.state.take_tool_detection()
    }

    fn store_tool_detection(&self, outcome: LlmOutcome) {
        self.state.set_tool_detection(outcome);
    }
}

fn transport_error(model: &str, err: reqwest::Error) -> LlmError {
    LlmError::new(format!("request to model '{model}' failed: {err}"))
        .with_user_message("LLMサーバーへの接続に失敗しました。".to_string())
        .with_source(err)
}

fn parse_args(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| {
        warn!("tool call arguments were not valid JSON, passing empty object");
        json!({})
    })
}

/// Provider wire form of the conversation: local metadata stripped.
fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            let mut wire = json!({"role": role, "content": msg.content_str()});
            if !msg.tool_calls.is_empty() {
                wire["tool_calls"] = Value::Array(
                    msg.tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": tc.kind,
                                "function": {
                                    "name": tc.function.name,
                                    "arguments": tc.function.arguments,
                                },
                            })
                        })
                        .collect(),
                );
            }
            if let Some(id) = &msg.tool_call_id {
                wire["tool_call_id"] = Value::String(id.clone());
            }
            if let Some(name) = &msg.name {
                wire["name"] = Value::String(name.clone());
            }
            wire
        })
        .collect()
}

// ── Wire payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl ApiUsage {
    fn into_llm_usage(self, model_key: &str) -> LlmUsage {
        LlmUsage {
            model: model_key.to_string(),
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
            cached_tokens: self.prompt_tokens_details.map(|d| d.cached_tokens).unwrap_or(0),
            cache_write_tokens: 0,
            cache_ttl: String::new(),
        }
    }
}

// ── SSE stream ───────────────────────────────────────────────────────────────

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

#[derive(Debug, Default)]
struct StreamAccum {
    text: String,
    reasoning: String,
    /// index -> (name, partial arguments string)
    tool_calls: BTreeMap<u64, (String, String)>,
    usage: Option<ApiUsage>,
}

struct SseStream {
    inner: Option<ByteStream>,
    buffer: String,
    pending: std::collections::VecDeque<StreamChunk>,
    accum: StreamAccum,
    state: Arc<CallState>,
    model_key: String,
    finalized: bool,
}

impl SseStream {
    /// Parse one `data:` payload; returns chunks to surface to the caller.
    fn handle_event(&mut self, data: &str) -> Vec<StreamChunk> {
        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            warn!("unparseable SSE payload, skipping");
            return Vec::new();
        };

        if let Some(usage) = payload.get("usage").filter(|u| !u.is_null()) {
            if let Ok(usage) = serde_json::from_value::<ApiUsage>(usage.clone()) {
                self.accum.usage = Some(usage);
            }
        }

        let mut chunks = Vec::new();
        let Some(delta) = payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
        else {
            return chunks;
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                self.accum.text.push_str(text);
                chunks.push(StreamChunk::Text(text.to_string()));
            }
        }
        if let Some(thinking) = delta.get("reasoning").and_then(Value::as_str) {
            if !thinking.is_empty() {
                self.accum.reasoning.push_str(thinking);
                chunks.push(StreamChunk::Thinking(thinking.to_string()));
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let entry = self.accum.tool_calls.entry(index).or_default();
                if let Some(name) = call
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                {
                    entry.0.push_str(name);
                }
                if let Some(args) = call
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                {
                    entry.1.push_str(args);
                }
            }
        }
        chunks
    }

    /// Publish usage / reasoning / tool detection into the consume-once slots.
    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        if let Some(usage) = self.accum.usage.take() {
            self.state.set_usage(usage.into_llm_usage(&self.model_key));
        }
        if !self.accum.reasoning.is_empty() {
            let reasoning = std::mem::take(&mut self.accum.reasoning);
            self.state
                .set_reasoning(Some(reasoning.clone()), Some(Value::String(reasoning)));
        }
        if let Some((_, (name, args))) = self.accum.tool_calls.pop_first() {
            let tool_args = parse_args(&args);
            let outcome = if self.accum.text.trim().is_empty() {
                LlmOutcome::ToolCall { tool_name: name, tool_args, thought_signature: None }
            } else {
                LlmOutcome::Both {
                    content: self.accum.text.clone(),
                    tool_name: name,
                    tool_args,
                    thought_signature: None,
                }
            };
            self.state.set_tool_detection(outcome);
        }
    }
}

#[async_trait]
impl LlmStream for SseStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>, LlmError> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Ok(Some(chunk));
            }

            // Drain complete SSE lines already buffered.
            while let Some(pos) = self.buffer.find('\n') {
                let line = self.buffer.drain(..=pos).collect::<String>();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    self.finalize();
                    self.inner = None;
                    return Ok(None);
                }
                let mut chunks = self.handle_event(data).into_iter();
                if let Some(first) = chunks.next() {
                    self.pending.extend(chunks);
                    return Ok(Some(first));
                }
            }

            let Some(inner) = self.inner.as_mut() else {
                self.finalize();
                return Ok(None);
            };
            match inner.next().await {
                Some(Ok(bytes)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Some(Err(err)) => {
                    self.finalize();
                    self.inner = None;
                    return Err(LlmError::new(format!("stream read failed: {err}"))
                        .with_source(err));
                }
                None => {
                    self.finalize();
                    self.inner = None;
                    return Ok(None);
                }
            }
        }
    }

    fn close(&mut self) {
        // Dropping the byte stream closes the HTTP connection.
        self.inner = None;
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_stream(state: Arc<CallState>) -> SseStream {
        SseStream {
            inner: None,
            buffer: String::new(),
            pending: std::collections::VecDeque::new(),
            accum: StreamAccum::default(),
            state,
            model_key: "test".to_string(),
            finalized: false,
        }
    }

    #[tokio::test]
    async fn buffered_lines_yield_text_chunks() {
        let state = Arc::new(CallState::default());
        let mut stream = test_stream(Arc::clone(&state));
        stream.buffer.push_str(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\
             data: [DONE]\n",
        );

        assert_eq!(
            stream.next_chunk().await.unwrap(),
            Some(StreamChunk::Text("hel".to_string()))
        );
        assert_eq!(
            stream.next_chunk().await.unwrap(),
            Some(StreamChunk::Text("lo".to_string()))
        );
        assert_eq!(stream.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn tool_call_deltas_accumulate_into_detection() {
        let state = Arc::new(CallState::default());
        let mut stream = test_stream(Arc::clone(&state));
        stream.buffer.push_str(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"name\":\"recall\",\"arguments\":\"{\\\"que\"}}]}}]}\n\
             data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"ry\\\":\\\"x\\\"}\"}}]}}]}\n\
             data: [DONE]\n",
        );

        assert_eq!(stream.next_chunk().await.unwrap(), None);
        let detection = state.take_tool_detection().unwrap();
        match detection {
            LlmOutcome::ToolCall { tool_name, tool_args, .. } => {
                assert_eq!(tool_name, "recall");
                assert_eq!(tool_args["query"], "x");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn usage_is_published_on_done() {
        let state = Arc::new(CallState::default());
        let mut stream = test_stream(Arc::clone(&state));
        stream.buffer.push_str(
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}],\"usage\":null}\n\
             data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":3,\"prompt_tokens_details\":{\"cached_tokens\":5}}}\n\
             data: [DONE]\n",
        );

        while stream.next_chunk().await.unwrap().is_some() {}
        let usage = state.take_usage().unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 3);
        assert_eq!(usage.cached_tokens, 5);
        assert_eq!(usage.model, "test");
    }

    #[tokio::test]
    async fn close_finalizes_without_reading_more() {
        let state = Arc::new(CallState::default());
        let mut stream = test_stream(Arc::clone(&state));
        stream.buffer.push_str("data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n");
        let _ = stream.next_chunk().await.unwrap();

        stream.close();
        assert!(stream.inner.is_none());
        // Text-only stream: no tool detection registered.
        assert!(state.take_tool_detection().is_none());
    }

    #[test]
    fn wire_messages_strip_local_metadata() {
        let msg = ChatMessage::user("hi").with_flag("__realtime_context__");
        let wire = wire_messages(&[msg]);
        assert!(wire[0].get("metadata").is_none());
        assert_eq!(wire[0]["role"], "user");
    }

    #[test]
    fn malformed_tool_arguments_fall_back_to_empty_object() {
        assert_eq!(parse_args("not json"), json!({}));
        assert_eq!(parse_args("{\"a\":1}"), json!({"a": 1}));
    }
}
