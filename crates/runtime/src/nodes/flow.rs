//! SET, SPEAK, SAY, THINK, and MEMORIZE nodes.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};

use saiverse_playbook::NodeDef;

use crate::RuntimeError;
use crate::events::{ActivityEntry, RuntimeEvent, emit};
use crate::runtime::{NodeEnv, Runtime};
use crate::state::ExecState;

/// SET: evaluate each assignment against the state. String values go
/// through the template formatter (undefined references keep their braces);
/// everything else is assigned verbatim.
pub fn set_node(node: &NodeDef, state: &mut ExecState) -> Result<(), RuntimeError> {
    let Some(assignments) = node.assignments.clone() else {
        return Ok(());
    };
    for (key, value) in assignments {
        let resolved = match &value {
            Value::String(template) if template.contains('{') => {
                json!(state.format(template))
            }
            other => other.clone(),
        };
        debug!(key, "set node assignment");
        state.set_structured(&key, resolved);
    }
    Ok(())
}

/// Metadata block for an outgoing spoken message: reasoning, reasoning
/// details, activity trace, pulse usage totals.
fn speak_metadata(state: &mut ExecState, include_totals: bool) -> (Option<String>, Option<Value>) {
    let reasoning = state.reasoning_text.take();
    let reasoning_details = state.reasoning_details.take();
    let activity = state.activity_snapshot();

    let mut metadata = serde_json::Map::new();
    if let Some(reasoning) = &reasoning {
        metadata.insert("reasoning".to_string(), json!(reasoning));
    }
    if let Some(details) = &reasoning_details {
        metadata.insert("reasoning_details".to_string(), details.clone());
    }
    if !activity.is_empty() {
        metadata.insert("activity_trace".to_string(), json!(activity));
    }
    if include_totals {
        let totals = state.usage_snapshot();
        if totals.call_count > 0 {
            metadata.insert("llm_usage_total".to_string(), json!(totals));
        }
    }
    let metadata = (!metadata.is_empty()).then(|| Value::Object(metadata));
    (reasoning, metadata)
}

/// SPEAK: emit `last` to the building and the UI.
pub fn speak_node(rt: &Arc<Runtime>, env: &NodeEnv, state: &mut ExecState) -> Result<(), RuntimeError> {
    let text = state.last();
    let (reasoning, metadata) = speak_metadata(state, false);
    let activity = state.activity_snapshot();

    let building_id = rt.world.effective_building_id(&env.persona, &env.building_id);
    rt.emit_say(&env.persona, &building_id, &text, &state.pulse_id, metadata.clone());
    state.outputs.push(text.clone());

    emit(
        &env.event_callback,
        RuntimeEvent::Say {
            content: text,
            persona_id: env.persona.persona_id.clone(),
            reasoning,
            activity_trace: (!activity.is_empty()).then(|| json!(activity)),
            metadata,
        },
    );
    Ok(())
}

/// SAY: SPEAK with a template and optional metadata from a state key.
pub fn say_node(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let text = match &node.action {
        Some(template) => state.format(template),
        None => state.last(),
    };
    let (reasoning, mut metadata) = speak_metadata(state, false);
    if let Some(metadata_key) = &node.metadata_key {
        if let Some(extra) = state.get(metadata_key).cloned() {
            if let Value::Object(extra) = extra {
                let merged = metadata
                    .get_or_insert_with(|| Value::Object(serde_json::Map::new()))
                    .as_object_mut()
                    .expect("metadata is an object");
                for (key, value) in extra {
                    merged.insert(key, value);
                }
            }
        }
    }
    let activity = state.activity_snapshot();

    let building_id = rt.world.effective_building_id(&env.persona, &env.building_id);
    rt.emit_say(&env.persona, &building_id, &text, &state.pulse_id, metadata.clone());
    state.outputs.push(text.clone());
    state.set_last(text.clone());

    emit(
        &env.event_callback,
        RuntimeEvent::Say {
            content: text,
            persona_id: env.persona.persona_id.clone(),
            reasoning,
            activity_trace: (!activity.is_empty()).then(|| json!(activity)),
            metadata,
        },
    );
    Ok(())
}

/// THINK: store an internal note tagged with the pulse; nothing reaches the
/// building history.
pub fn think_node(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let note = match &node.action {
        Some(template) => state.format(template),
        None => state.last(),
    };
    let pulse_tag = format!("pulse:{}", state.pulse_id);
    if !rt.store_memory(&env.persona, &note, "assistant", &["internal", &pulse_tag], Some(&state.pulse_id), None)
    {
        warn!("failed to store think note");
    }
    state.set_last(note);
    Ok(())
}

/// MEMORIZE: expand the template and store one message into memory.
pub fn memorize_node(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let template = node.action.as_deref().unwrap_or("{last}");
    let memo = state.format(template);
    let role = node.role.as_deref().unwrap_or("assistant");
    let tags: Vec<&str> = node
        .tags
        .as_ref()
        .map(|tags| tags.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let metadata = node
        .metadata_key
        .as_ref()
        .and_then(|key| state.get(key).cloned());

    if !rt.store_memory(&env.persona, &memo, role, &tags, Some(&state.pulse_id), metadata) {
        warn!(node = %node.id, "memorize node failed to store");
        emit(
            &env.event_callback,
            RuntimeEvent::Warning {
                warning_code: "memorize_failed".to_string(),
                content: "記憶の保存に失敗しました。会話内容が記録されていない可能性があります。"
                    .to_string(),
                display: Some("toast".to_string()),
            },
        );
    }

    state.set_last(memo.clone());
    state.outputs.push(memo);

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
    Ok(())
}
