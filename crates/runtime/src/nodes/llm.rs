//! The LLM node: context selection, prompt expansion, the three response
//! paths (streaming, plain, tool-calling), usage accounting, reasoning
//! capture, and output binding into the state map.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use saiverse_llm::{
    ChatMessage, ChatRole, GenerateOptions, LlmClient, LlmOutcome, StreamChunk, ToolSchema,
    new_tool_call_id,
};
use saiverse_playbook::{NodeDef, context_profile};

use crate::RuntimeError;
use crate::events::{ActivityEntry, RuntimeEvent, emit};
use crate::runtime::{NodeEnv, Runtime};
use crate::state::{ExecState, PendingToolCall};

const MAX_STREAM_RETRIES: usize = 3;

pub async fn llm_node(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let mut messages = base_messages(rt, env, node, state).await;

    // Expand the action template; bare prompts get a <system> wrapper so the
    // model can tell them apart from real user input.
    let prompt = node.action.as_ref().map(|action| {
        let expanded = state.format(action);
        if expanded.trim_start().starts_with("<system>") {
            expanded
        } else {
            format!("<system>{expanded}</system>")
        }
    });
    if let Some(prompt) = &prompt {
        messages.push(ChatMessage::user(prompt.clone()));
    }

    // Routing support: inject the playbook-name enum into the schema.
    let mut response_schema = node.response_schema.clone();
    if let Some(schema) = response_schema.as_mut() {
        if let Some(available) = state.get("available_playbooks").cloned() {
            inject_playbook_enum(schema, &available);
        }
    }

    let model_type = node
        .model_type
        .clone()
        .or_else(|| {
            node.context_profile
                .as_deref()
                .and_then(context_profile)
                .map(|p| p.model_type.to_string())
        });
    let client = env.persona.client_for(model_type.as_deref());
    inject_model_system_prompt(rt, client.model_key(), &mut messages);

    let tools = tool_schemas(rt, node);
    let options = generate_options(rt, client.model_key(), response_schema.clone());

    let speak = node.speak == Some(true);
    let use_streaming = speak
        && response_schema.is_none()
        && rt.streaming_enabled()
        && env.event_callback.is_some();

    let outcome = if use_streaming {
        streamed_call(rt, env, node, state, client.as_ref(), &messages, &tools, &options).await?
    } else {
        plain_call(rt, env, node, state, client.as_ref(), &messages, &tools, &options, speak)
            .await?
    };

    // ── Output binding ──────────────────────────────────────────────────────
    let text_key = node.output_keys.as_ref().and_then(|k| k.mapping_for("text")).map(str::to_string);
    let function_call_key = node
        .output_keys
        .as_ref()
        .and_then(|k| k.mapping_for("function_call"))
        .map(str::to_string);
    let thought_key = node
        .output_keys
        .as_ref()
        .and_then(|k| k.mapping_for("thought"))
        .map(str::to_string);

    let mut text = outcome.text().to_string();
    match &outcome {
        LlmOutcome::ToolCall { tool_name, tool_args, thought_signature } => {
            bind_tool_call(
                state,
                function_call_key.as_deref(),
                tool_name,
                tool_args,
                thought_signature.clone(),
            );
            state.set("has_speak_content", json!(false));
            // Log form only; the conversation keeps the structured call.
            text = json!({"tool": tool_name, "args": tool_args}).to_string();
            info!(tool = %tool_name, "tool call detected");
        }
        LlmOutcome::Both { content, tool_name, tool_args, thought_signature } => {
            bind_tool_call(
                state,
                function_call_key.as_deref(),
                tool_name,
                tool_args,
                thought_signature.clone(),
            );
            if let Some(text_key) = &text_key {
                state.set(text_key.clone(), json!(content));
                state.set("has_speak_content", json!(true));
            } else {
                state.set("has_speak_content", json!(true));
                state.set("speak_content", json!(content));
            }
            text = content.clone();
            info!(tool = %tool_name, text_len = content.len(), "both text and tool call detected");
        }
        LlmOutcome::Text { content } => {
            state.set("tool_called", json!(false));
            state.set("has_speak_content", json!(true));
            if let Some(text_key) = &text_key {
                state.set(text_key.clone(), json!(content));
            }
        }
    }
    if let (Some(thought_key), Some(reasoning)) = (&thought_key, &state.reasoning_text) {
        state.set(thought_key.clone(), json!(reasoning));
    }

    // Structured output: parse per schema, store flattened.
    let mut schema_consumed = false;
    if response_schema.is_some() && !outcome.is_tool_call() {
        if let Ok(parsed) = serde_json::from_str::<Value>(text.trim()) {
            if parsed.is_object() {
                let key = node.output_key.clone().unwrap_or_else(|| node.id.clone());
                state.set_structured(&key, parsed);
                state.set("has_speak_content", json!(true));
                schema_consumed = true;
                debug!(key = %key, "structured output bound");
            }
        }
        if !schema_consumed {
            warn!(node = %node.id, "structured output did not parse as a JSON object");
        }
    }
    if !schema_consumed && !outcome.is_tool_call() {
        if let Some(output_key) = &node.output_key {
            state.set(output_key.clone(), json!(text));
        }
    }

    // ── Follow-up conversation entries ──────────────────────────────────────
    let tool_called = state.get("tool_called").and_then(Value::as_bool).unwrap_or(false);
    let assistant_message = if let Some(pending) = state.pending_tool_call.as_ref().filter(|_| tool_called) {
        let speak_content = if state.get("has_speak_content").and_then(Value::as_bool).unwrap_or(false)
        {
            text.clone()
        } else {
            String::new()
        };
        ChatMessage::assistant_tool_calls(
            speak_content,
            vec![saiverse_llm::ToolCall {
                id: pending.id.clone(),
                kind: "function".to_string(),
                function: saiverse_llm::ToolCallFunction {
                    name: pending.name.clone(),
                    arguments: pending.args_json.clone(),
                },
                thought_signature: pending.thought_signature.clone(),
            }],
        )
    } else {
        ChatMessage::assistant(text.clone())
    };
    state.messages = messages;
    state.messages.push(assistant_message.clone());

    if let Some(prompt) = &prompt {
        state.intermediate.push(ChatMessage::user(prompt.clone()));
    }
    state.intermediate.push(assistant_message);

    // ── memorize option ─────────────────────────────────────────────────────
    if let Some(memorize) = node.memorize.as_ref().filter(|m| m.is_enabled()) {
        let tags = memorize.tags();
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        let mut stored_ok = true;
        if let Some(prompt) = &prompt {
            stored_ok &=
                rt.store_memory(&env.persona, prompt, "user", &tag_refs, Some(&state.pulse_id), None);
        }
        if !text.is_empty() {
            let mut metadata = serde_json::Map::new();
            if let Some(reasoning) = &state.reasoning_text {
                metadata.insert("reasoning".to_string(), json!(reasoning));
            }
            if let Some(details) = &state.reasoning_details {
                metadata.insert("reasoning_details".to_string(), details.clone());
            }
            stored_ok &= rt.store_memory(
                &env.persona,
                &text,
                "assistant",
                &tag_refs,
                Some(&state.pulse_id),
                (!metadata.is_empty()).then(|| Value::Object(metadata)),
            );
        }
        if !stored_ok {
            emit(
                &env.event_callback,
                RuntimeEvent::Warning {
                    warning_code: "memorize_failed".to_string(),
                    content:
                        "記憶の保存に失敗しました。会話内容が記録されていない可能性があります。"
                            .to_string(),
                    display: Some("toast".to_string()),
                },
            );
        }
        if !env.playbook.is_infrastructure() {
            let name = node.label.clone().unwrap_or_else(|| node.id.clone());
            let playbook = env.playbook.display_name().to_string();
            state.push_activity(ActivityEntry {
                action: "memorize".to_string(),
                name: name.clone(),
                playbook: playbook.clone(),
            });
            emit(
                &env.event_callback,
                RuntimeEvent::Activity {
                    action: "memorize".to_string(),
                    name,
                    playbook,
                    status: "completed".to_string(),
                    persona_id: Some(env.persona.persona_id.clone()),
                    persona_name: Some(env.persona.persona_name.clone()),
                },
            );
        }
    }

    state.set_last(text);
    Ok(())
}

/// Base messages: the cached profile context plus intermediate outputs, or
/// the accumulating plain conversation.
async fn base_messages(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Vec<ChatMessage> {
    let Some(profile_name) = node.context_profile.clone() else {
        return state.messages.clone();
    };
    let Some(profile) = context_profile(&profile_name) else {
        warn!(profile = %profile_name, node = %node.id, "unknown context profile, falling back to state messages");
        return state.messages.clone();
    };

    if !state.profile_cache.contains_key(&profile_name) {
        let input = state.get_str("input");
        let mut warnings = Vec::new();
        let built = rt
            .build_context(
                &env.persona,
                &env.building_id,
                (!input.is_empty()).then_some(input.as_str()),
                &profile.requirements,
                Some(&state.pulse_id),
                false,
                &mut warnings,
            )
            .await;
        for warning in warnings {
            emit(&env.event_callback, warning);
        }
        info!(profile = %profile_name, node = %node.id, count = built.len(), "prepared profile context");
        state.profile_cache.insert(profile_name.clone(), built);
    }

    let mut base = state.profile_cache[&profile_name].clone();
    base.extend(state.intermediate.iter().cloned());
    base
}

/// Expose the routing enum: any `selected_playbook` property in the schema
/// gets the currently available playbook names.
fn inject_playbook_enum(schema: &mut Value, available: &Value) {
    let parsed: Value = match available {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
        other => other.clone(),
    };
    let names: Vec<Value> = match &parsed {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(json!(name)),
                Value::Object(obj) => obj.get("name").cloned(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    if names.is_empty() {
        return;
    }
    if let Some(property) = schema
        .get_mut("properties")
        .and_then(|p| p.get_mut("selected_playbook"))
    {
        property["enum"] = Value::Array(names);
        debug!("injected playbook enum into response schema");
    }
}

/// Model configs can carry an extra system prompt; merge it into the first
/// system message or prepend one.
fn inject_model_system_prompt(rt: &Arc<Runtime>, model_key: &str, messages: &mut Vec<ChatMessage>) {
    let Some(prompt) = rt
        .world
        .models
        .get(model_key)
        .and_then(|c| c.system_prompt.clone())
        .filter(|p| !p.is_empty())
    else {
        return;
    };
    if let Some(system) = messages.iter_mut().find(|m| m.role == ChatRole::System) {
        let merged = format!("{}\n\n---\n\n{prompt}", system.content_str());
        system.content = Some(merged);
    } else {
        messages.insert(0, ChatMessage::system(prompt));
    }
}

fn tool_schemas(rt: &Arc<Runtime>, node: &NodeDef) -> Vec<ToolSchema> {
    let Some(names) = &node.available_tools else { return Vec::new() };
    names
        .iter()
        .filter_map(|name| match rt.world.tools.get(name) {
            Some(tool) => {
                let spec = tool.spec();
                Some(ToolSchema {
                    name: spec.name,
                    description: spec.description,
                    parameters: spec.parameters,
                })
            }
            None => {
                warn!(tool = %name, "available_tools references an unregistered tool");
                None
            }
        })
        .collect()
}

fn generate_options(rt: &Arc<Runtime>, model_key: &str, response_schema: Option<Value>) -> GenerateOptions {
    let cache = rt.world.models.get(model_key).map(|c| c.cache_config());
    let (cache_enabled, cache_ttl) = cache
        .map(|c| (c.supported && c.default_enabled, c.default_ttl))
        .unwrap_or((false, "5m".to_string()));
    GenerateOptions {
        temperature: rt.world.config.runtime.temperature,
        response_schema,
        cache_enabled,
        cache_ttl,
    }
}

fn bind_tool_call(
    state: &mut ExecState,
    function_call_key: Option<&str>,
    tool_name: &str,
    tool_args: &Value,
    thought_signature: Option<String>,
) {
    state.set("tool_called", json!(true));
    if let Some(key) = function_call_key {
        state.set(format!("{key}.name"), json!(tool_name));
        state.set(
            format!("{key}.args"),
            if tool_args.is_object() { tool_args.clone() } else { json!({}) },
        );
        if let Some(args) = tool_args.as_object() {
            for (arg_name, arg_value) in args {
                state.set(format!("{key}.args.{arg_name}"), arg_value.clone());
            }
        }
    } else {
        // Legacy binding: predefined keys plus tool_arg_* expansion.
        state.set("tool_name", json!(tool_name));
        state.set("tool_args", tool_args.clone());
        if let Some(args) = tool_args.as_object() {
            for (arg_name, arg_value) in args {
                state.set(format!("tool_arg_{arg_name}"), arg_value.clone());
            }
        }
    }

    state.pending_tool_call = Some(PendingToolCall {
        id: new_tool_call_id(),
        name: tool_name.to_string(),
        args_json: serde_json::to_string(tool_args).unwrap_or_else(|_| "{}".to_string()),
        thought_signature,
    });
}

fn consume_reasoning_into_state(client: &dyn LlmClient, state: &mut ExecState) {
    if let Some(reasoning) = client.consume_reasoning() {
        state.reasoning_text = Some(reasoning);
    }
    if let Some(details) = client.consume_reasoning_details() {
        state.reasoning_details = Some(details);
    }
}

fn metadata_key_base(node: &NodeDef, state: &ExecState) -> Option<Value> {
    node.metadata_key
        .as_ref()
        .and_then(|key| state.get(key).cloned())
        .filter(Value::is_object)
}

/// Outgoing message metadata for a spoken LLM result.
fn spoken_metadata(
    node: &NodeDef,
    state: &ExecState,
    usage_meta: &Option<Value>,
    include_totals: bool,
) -> Option<Value> {
    let mut metadata = match metadata_key_base(node, state) {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    if let Some(usage) = usage_meta {
        metadata.insert("llm_usage".to_string(), usage.clone());
    }
    if let Some(reasoning) = &state.reasoning_text {
        metadata.insert("reasoning".to_string(), json!(reasoning));
    }
    if let Some(details) = &state.reasoning_details {
        metadata.insert("reasoning_details".to_string(), details.clone());
    }
    let activity = state.activity_snapshot();
    if !activity.is_empty() {
        metadata.insert("activity_trace".to_string(), json!(activity));
    }
    if include_totals {
        let totals = state.usage_snapshot();
        if totals.call_count > 0 {
            metadata.insert("llm_usage_total".to_string(), json!(totals));
        }
    }
    (!metadata.is_empty()).then(|| Value::Object(metadata))
}

/// Streaming path: forward chunks to the UI, retry empty responses while
/// discarding their usage, close the transport on cancellation.
#[allow(clippy::too_many_arguments)]
async fn streamed_call(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
    client: &dyn LlmClient,
    messages: &[ChatMessage],
    tools: &[ToolSchema],
    options: &GenerateOptions,
) -> Result<LlmOutcome, RuntimeError> {
    let persona_id = env.persona.persona_id.clone();
    let node_id = node.id.clone();
    let mut text = String::new();
    let mut chunk_count = 0usize;
    let mut cancelled = false;

    for attempt in 0..MAX_STREAM_RETRIES {
        state.token.check()?;
        let mut stream = client.generate_stream(messages, tools, options).await?;
        let mut chunks: Vec<String> = Vec::new();

        loop {
            if state.token.is_cancelled() {
                info!("streaming cancelled, closing transport");
                stream.close();
                cancelled = true;
                break;
            }
            match stream.next_chunk().await? {
                Some(StreamChunk::Thinking(thinking)) => {
                    emit(
                        &env.event_callback,
                        RuntimeEvent::StreamingThinking {
                            content: thinking,
                            persona_id: persona_id.clone(),
                            node_id: node_id.clone(),
                        },
                    );
                }
                Some(StreamChunk::Text(chunk)) => {
                    emit(
                        &env.event_callback,
                        RuntimeEvent::StreamingChunk {
                            content: chunk.clone(),
                            persona_id: persona_id.clone(),
                            node_id: node_id.clone(),
                        },
                    );
                    chunks.push(chunk);
                }
                None => break,
            }
        }

        chunk_count = chunks.len();
        text = chunks.concat();
        if cancelled || !text.trim().is_empty() {
            break;
        }
        // A tool call with no text is a valid response; peek before retrying.
        if let Some(detection) = client.consume_tool_detection() {
            if detection.is_tool_call() {
                client.store_tool_detection(detection);
                break;
            }
        }
        let discarded = client.consume_usage();
        warn!(
            attempt = attempt + 1,
            max = MAX_STREAM_RETRIES,
            discarded_in = discarded.as_ref().map(|u| u.input_tokens).unwrap_or(0),
            discarded_out = discarded.as_ref().map(|u| u.output_tokens).unwrap_or(0),
            "empty streaming response, retrying"
        );
    }
    if text.trim().is_empty() && !cancelled {
        debug!("streaming produced no text after retries");
    }

    consume_reasoning_into_state(client, state);
    let usage_meta = client.consume_usage().map(|usage| {
        let node_type = if tools.is_empty() { "llm_stream" } else { "llm_tool_stream" };
        rt.record_llm_usage(
            &usage,
            &env.persona,
            &env.building_id,
            node_type,
            &env.playbook.name,
            "persona_speak",
            Some(state),
        )
    });

    let detection = client.consume_tool_detection();
    let outcome = match detection {
        Some(LlmOutcome::ToolCall { tool_name, tool_args, thought_signature }) => {
            LlmOutcome::ToolCall { tool_name, tool_args, thought_signature }
        }
        Some(LlmOutcome::Both { content, tool_name, tool_args, thought_signature }) => {
            // Streamed text is authoritative when present.
            let content = if text.trim().is_empty() { content } else { text.clone() };
            LlmOutcome::Both { content, tool_name, tool_args, thought_signature }
        }
        _ => LlmOutcome::Text { content: text.clone() },
    };

    match &outcome {
        LlmOutcome::ToolCall { .. } => {
            if chunk_count > 0 {
                // Streamed text without speak content; tell the UI to drop it.
                emit(
                    &env.event_callback,
                    RuntimeEvent::StreamingDiscard {
                        persona_id: persona_id.clone(),
                        node_id: node_id.clone(),
                    },
                );
            }
        }
        LlmOutcome::Both { content, .. } | LlmOutcome::Text { content } => {
            let include_totals = matches!(outcome, LlmOutcome::Text { .. });
            let metadata = spoken_metadata(node, state, &usage_meta, include_totals);
            emit(
                &env.event_callback,
                RuntimeEvent::StreamingComplete {
                    persona_id: persona_id.clone(),
                    node_id: node_id.clone(),
                    reasoning: state.reasoning_text.clone(),
                    metadata: metadata_key_base(node, state),
                },
            );
            let building_id = rt.world.effective_building_id(&env.persona, &env.building_id);
            rt.emit_say(&env.persona, &building_id, content, &state.pulse_id, metadata);
        }
    }

    Ok(outcome)
}

/// Non-streaming path, with or without tools.
#[allow(clippy::too_many_arguments)]
async fn plain_call(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
    client: &dyn LlmClient,
    messages: &[ChatMessage],
    tools: &[ToolSchema],
    options: &GenerateOptions,
    speak: bool,
) -> Result<LlmOutcome, RuntimeError> {
    state.token.check()?;
    let outcome = client.generate(messages, tools, options).await?;

    consume_reasoning_into_state(client, state);
    let node_type = if tools.is_empty() { "llm" } else { "llm_tool" };
    let usage_meta = client.consume_usage().map(|usage| {
        rt.record_llm_usage(
            &usage,
            &env.persona,
            &env.building_id,
            node_type,
            &env.playbook.name,
            "persona_speak",
            Some(state),
        )
    });

    if speak && !outcome.is_tool_call() {
        let text = outcome.text().to_string();
        let metadata = spoken_metadata(node, state, &usage_meta, true);
        let building_id = rt.world.effective_building_id(&env.persona, &env.building_id);
        rt.emit_say(&env.persona, &building_id, &text, &state.pulse_id, metadata.clone());
        let activity = state.activity_snapshot();
        emit(
            &env.event_callback,
            RuntimeEvent::Say {
                content: text,
                persona_id: env.persona.persona_id.clone(),
                reasoning: state.reasoning_text.clone(),
                activity_trace: (!activity.is_empty()).then(|| json!(activity)),
                metadata,
            },
        );
    }
    Ok(outcome)
}
