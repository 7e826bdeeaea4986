//! TOOL and TOOL_CALL nodes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use saiverse_llm::ChatMessage;
use saiverse_playbook::NodeDef;
use saiverse_tools::ToolContext;

use crate::RuntimeError;
use crate::events::{ActivityEntry, RuntimeEvent, emit};
use crate::runtime::{NodeEnv, Runtime};
use crate::state::ExecState;

fn tool_context(env: &NodeEnv) -> ToolContext {
    let mut ctx = ToolContext::for_persona(&env.persona.persona_id)
        .with_playbook(&env.playbook.name)
        .with_auto_mode(env.auto_mode);
    if let Some(callback) = env.event_callback.clone() {
        ctx.event_sink = Some(Arc::new(move |value: Value| {
            if let Ok(event) = serde_json::from_value::<RuntimeEvent>(value) {
                callback(event);
            }
        }));
    }
    ctx
}

/// External (MCP) tools get the configured invocation timeout; builtins run
/// unbounded.
fn timeout_for(rt: &Runtime, tool_name: &str) -> Option<Duration> {
    tool_name
        .contains("__")
        .then(|| Duration::from_secs(rt.world.config.runtime.external_tool_timeout_secs))
}

fn record_tool_activity(env: &NodeEnv, state: &ExecState, action: &str, tool_name: &str) {
    if env.playbook.is_infrastructure() {
        return;
    }
    let playbook = env.playbook.display_name().to_string();
    state.push_activity(ActivityEntry {
        action: action.to_string(),
        name: tool_name.to_string(),
        playbook: playbook.clone(),
    });
    emit(
        &env.event_callback,
        RuntimeEvent::Activity {
            action: action.to_string(),
            name: tool_name.to_string(),
            playbook,
            status: "completed".to_string(),
            persona_id: Some(env.persona.persona_id.clone()),
            persona_name: Some(env.persona.persona_name.clone()),
        },
    );
}

/// Append a tool-result message closing the pending tool-call pair, to both
/// the plain conversation and the profile-cache overlay.
pub fn append_tool_result(state: &mut ExecState, tool_name: &str, content: &str) {
    let Some(pending) = state.pending_tool_call.take() else {
        return;
    };
    let message = ChatMessage::tool_result(&pending.id, tool_name, content);
    state.messages.push(message.clone());
    state.intermediate.push(message);
}

/// TOOL: statically named tool with `args_input` mappings.
pub async fn tool_node(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let tool_name = node
        .action
        .clone()
        .ok_or_else(|| RuntimeError::Playbook(format!("tool node '{}' has no tool name", node.id)))?;

    // Resolve each argument: string sources read from state (dot-notation
    // allowed), everything else is a literal.
    let mut args = Map::new();
    if let Some(args_input) = &node.args_input {
        for (arg_name, source) in args_input {
            let value = match source {
                Value::String(path) => state.get(path).cloned().unwrap_or(Value::Null),
                literal => literal.clone(),
            };
            args.insert(arg_name.clone(), value);
        }
    }

    info!(tool = %tool_name, persona = %env.persona.persona_id, "tool call");
    let ctx = tool_context(env);
    let result = rt
        .world
        .tools
        .call(&tool_name, Value::Object(args), &ctx, timeout_for(rt, &tool_name))
        .await;

    match result {
        Ok(output) => {
            let result_str = output.primary_text();
            info!(tool = %tool_name, preview = %result_str.chars().take(200).collect::<String>(), "tool result");
            record_tool_activity(env, state, "tool", &tool_name);

            if let Some(keys) = node.output_keys.as_ref().and_then(|k| k.positional()) {
                for (i, key) in keys.iter().enumerate() {
                    if let Some(value) = output.values.get(i) {
                        state.set_structured(key, value.clone());
                    }
                }
                state.set_last(output.primary_text());
            } else {
                state.set_last(result_str.clone());
                if let Some(output_key) = &node.output_key {
                    state.set_structured(output_key, output.primary().clone());
                }
            }
        }
        Err(err) => {
            let message = format!("Tool error: {err}");
            warn!(tool = %tool_name, error = %err, "tool failed");
            state.set_last(message.clone());
            if let Some(output_key) = &node.output_key {
                state.set(output_key.clone(), json!(message));
            }
        }
    }
    Ok(())
}

/// TOOL_CALL: execute the tool a prior LLM node selected. The result (or
/// the error) is appended as a `tool` message so the model observes it.
pub async fn tool_call_node(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let call_source = node.call_source.as_deref().unwrap_or("fc");
    let output_key = node.output_key.clone();

    let mut tool_name = state.get_str(&format!("{call_source}.name"));
    let mut tool_args = state.get(&format!("{call_source}.args")).cloned();
    if tool_name.is_empty() {
        tool_name = state.get_str("tool_name");
        tool_args = state.get("tool_args").cloned();
    }
    if tool_name.is_empty() {
        let message = format!("No tool name found in state (call_source={call_source})");
        warn!("{message}");
        state.set_last(message.clone());
        if let Some(key) = output_key {
            state.set(key, json!(message));
        }
        return Ok(());
    }
    let args = match tool_args {
        Some(Value::Object(map)) => Value::Object(map),
        _ => {
            warn!(tool = %tool_name, "tool args were not an object, using empty args");
            json!({})
        }
    };

    if !rt.world.tools.contains(&tool_name) {
        let message = format!("Tool '{tool_name}' not found in registry");
        warn!("{message}");
        state.set_last(message.clone());
        if let Some(key) = output_key {
            state.set(key, json!(message));
        }
        return Ok(());
    }

    info!(tool = %tool_name, persona = %env.persona.persona_id, "llm-selected tool call");
    let ctx = tool_context(env);
    let result = rt
        .world
        .tools
        .call(&tool_name, args, &ctx, timeout_for(rt, &tool_name))
        .await;

    match result {
        Ok(output) => {
            let result_str = output.primary_text();
            record_tool_activity(env, state, "tool_call", &tool_name);
            state.set_last(result_str.clone());
            if let Some(key) = output_key {
                state.set_structured(&key, output.primary().clone());
            }
            append_tool_result(state, &tool_name, &result_str);
        }
        Err(err) => {
            // Forward the failure to the model as the tool result.
            let message = format!("Tool error ({tool_name}): {err}");
            warn!(tool = %tool_name, error = %err, "llm-selected tool failed");
            state.set_last(message.clone());
            if let Some(key) = output_key {
                state.set(key, json!(message));
            }
            append_tool_result(state, &tool_name, &message);
        }
    }
    Ok(())
}
