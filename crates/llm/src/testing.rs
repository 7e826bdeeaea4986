//! Scripted LLM client for tests.
//!
//! Responses are queued up front; each `generate`/`generate_stream` call pops
//! the next one and publishes its usage/reasoning/tool detection through the
//! same consume-once slots a real client uses. Every call's message array is
//! recorded for assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    CallState, ChatMessage, GenerateOptions, LlmClient, LlmError, LlmOutcome, LlmStream, LlmUsage,
    StreamChunk, ToolSchema,
};

/// One canned response.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub outcome: LlmOutcome,
    pub usage: Option<LlmUsage>,
    pub reasoning: Option<String>,
    /// Chunks yielded in streaming mode; defaults to the outcome text split
    /// in one piece.
    pub chunks: Option<Vec<StreamChunk>>,
}

impl ScriptedResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            outcome: LlmOutcome::Text { content: content.into() },
            usage: None,
            reasoning: None,
            chunks: None,
        }
    }

    pub fn tool_call(tool_name: impl Into<String>, tool_args: Value) -> Self {
        Self {
            outcome: LlmOutcome::ToolCall {
                tool_name: tool_name.into(),
                tool_args,
                thought_signature: None,
            },
            usage: None,
            reasoning: None,
            chunks: None,
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some(LlmUsage {
            model: String::new(),
            input_tokens,
            output_tokens,
            ..Default::default()
        });
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<StreamChunk>) -> Self {
        self.chunks = Some(chunks);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
    pub response_schema: Option<Value>,
    pub streamed: bool,
}

pub struct ScriptedClient {
    model_key: String,
    script: Mutex<VecDeque<ScriptedResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
    state: Arc<CallState>,
}

impl ScriptedClient {
    pub fn new(model_key: impl Into<String>) -> Self {
        Self {
            model_key: model_key.into(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            state: Arc::new(CallState::default()),
        }
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }

    fn next_response(&self) -> Result<ScriptedResponse, LlmError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::new("scripted client ran out of responses"))
    }

    fn record(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerateOptions,
        streamed: bool,
    ) {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            response_schema: options.response_schema.clone(),
            streamed,
        });
    }

    fn publish(&self, response: &ScriptedResponse) {
        if let Some(mut usage) = response.usage.clone() {
            if usage.model.is_empty() {
                usage.model = self.model_key.clone();
            }
            self.state.set_usage(usage);
        }
        if let Some(reasoning) = &response.reasoning {
            self.state
                .set_reasoning(Some(reasoning.clone()), Some(Value::String(reasoning.clone())));
        }
        if response.outcome.is_tool_call() {
            self.state.set_tool_detection(response.outcome.clone());
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn model_key(&self) -> &str {
        &self.model_key
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerateOptions,
    ) -> Result<LlmOutcome, LlmError> {
        self.record(messages, tools, options, false);
        let response = self.next_response()?;
        self.publish(&response);
        Ok(response.outcome)
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        options: &GenerateOptions,
    ) -> Result<Box<dyn LlmStream>, LlmError> {
        self.record(messages, tools, options, true);
        let response = self.next_response()?;

        let chunks = response.chunks.clone().unwrap_or_else(|| {
            let text = response.outcome.text();
            if text.is_empty() {
                Vec::new()
            } else {
                vec![StreamChunk::Text(text.to_string())]
            }
        });

        Ok(Box::new(ScriptedStream {
            chunks: chunks.into(),
            response: Some(response),
            client_state: Arc::clone(&self.state),
            model_key: self.model_key.clone(),
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

struct ScriptedStream {
    chunks: VecDeque<StreamChunk>,
    response: Option<ScriptedResponse>,
    client_state: Arc<CallState>,
    model_key: String,
}

impl ScriptedStream {
    /// Publish the scripted response once, at end of stream or on close.
    fn finalize(&mut self) {
        let Some(response) = self.response.take() else {
            return;
        };
        if let Some(mut usage) = response.usage.clone() {
            if usage.model.is_empty() {
                usage.model = self.model_key.clone();
            }
            self.client_state.set_usage(usage);
        }
        if let Some(reasoning) = &response.reasoning {
            self.client_state
                .set_reasoning(Some(reasoning.clone()), Some(Value::String(reasoning.clone())));
        }
        if response.outcome.is_tool_call() {
            self.client_state.set_tool_detection(response.outcome);
        }
    }
}

#[async_trait]
impl LlmStream for ScriptedStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>, LlmError> {
        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                self.finalize();
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.chunks.clear();
        self.finalize();
    }
}
