//! STELIS_START / STELIS_END: scoped nested memory threads.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::warn;

use saiverse_memory::{MessageMetadata, NewMessage, ThreadKind};
use saiverse_playbook::NodeDef;

use crate::RuntimeError;
use crate::events::{RuntimeEvent, emit};
use crate::runtime::{NodeEnv, Runtime};
use crate::state::ExecState;

/// Open a stelis sub-thread: anchor message in the parent thread, new
/// active thread, bookkeeping in state. Depth is limited per node config.
pub fn stelis_start_node(
    _rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let config = node.stelis_config.clone().unwrap_or_default();
    let label = state.format(node.label.as_deref().unwrap_or("Stelis Session"));
    let memory = &env.persona.memory;

    let depth_ok = memory.can_start_stelis(config.max_depth).unwrap_or(false);
    if !depth_ok {
        let message = format!("Stelis max depth exceeded (max={})", config.max_depth);
        warn!(persona_id = %env.persona.persona_id, "{message}");
        state.set("stelis_error", json!(message));
        state.set("stelis_available", json!(false));
        return Ok(());
    }

    let parent_thread_id = match memory.active_thread_id() {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "no active thread for stelis start");
            state.set("stelis_error", json!("No memory adapter available"));
            state.set("stelis_available", json!(false));
            return Ok(());
        }
    };

    let thread = match memory.create_thread(ThreadKind::Stelis, Some(&label), Some(&parent_thread_id)) {
        Ok(thread) => thread,
        Err(err) => {
            warn!(error = %err, "failed to create stelis thread");
            state.set("stelis_error", json!("Failed to create Stelis thread"));
            state.set("stelis_available", json!(false));
            return Ok(());
        }
    };

    // Anchor marker in the parent thread, so the parent's history shows
    // where the nested scope began.
    let mut metadata = MessageMetadata::default();
    metadata.extra.insert("type".to_string(), json!("stelis_anchor"));
    metadata.extra.insert("stelis_thread_id".to_string(), json!(thread.id));
    metadata.extra.insert("stelis_label".to_string(), json!(label));
    if let Err(err) = memory.append(
        NewMessage::new("system", "")
            .with_persona(&env.persona.persona_id)
            .with_metadata(metadata),
    ) {
        warn!(error = %err, "failed to write stelis anchor message");
    }

    if let Err(err) = memory.set_active_thread(&thread.id) {
        warn!(error = %err, "failed to activate stelis thread");
        state.set("stelis_error", json!("Failed to create Stelis thread"));
        state.set("stelis_available", json!(false));
        return Ok(());
    }

    state.set("stelis_thread_id", json!(thread.id));
    state.set("stelis_parent_thread_id", json!(parent_thread_id));
    state.set("stelis_depth", json!(thread.depth));
    state.set("stelis_window_ratio", json!(config.window_ratio));
    state.set("stelis_label", json!(label));
    state.set("stelis_available", json!(true));

    emit(
        &env.event_callback,
        RuntimeEvent::StelisStart {
            thread_id: thread.id,
            parent_thread_id,
            depth: thread.depth,
            label,
        },
    );
    Ok(())
}

/// Close the stelis thread: optional chronicle summary, reactivate the
/// parent, clear the stelis fields.
pub async fn stelis_end_node(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let generate_chronicle = node.generate_chronicle.unwrap_or(true);
    let thread_id = state.get_str("stelis_thread_id");
    let parent_thread_id = state.get_str("stelis_parent_thread_id");
    if thread_id.is_empty() || parent_thread_id.is_empty() {
        warn!("stelis end without an active stelis scope");
        return Ok(());
    }

    let chronicle = rt
        .end_subagent_thread(&env.persona, &thread_id, &parent_thread_id, generate_chronicle)
        .await;
    if let Some(chronicle) = &chronicle {
        state.set("stelis_chronicle", json!(chronicle));
    }

    state.set("stelis_thread_id", Value::Null);
    state.set("stelis_parent_thread_id", Value::Null);
    state.set("stelis_depth", Value::Null);

    emit(
        &env.event_callback,
        RuntimeEvent::StelisEnd {
            thread_id,
            parent_thread_id,
            chronicle_generated: generate_chronicle,
        },
    );
    Ok(())
}
