//! SUBPLAY and EXEC: nested playbook execution.
//!
//! SUBPLAY runs a statically named sub-playbook; EXEC runs whichever
//! playbook a router selected at runtime, behind the per-city permission
//! policy. Both support inline and subagent execution; subagent runs happen
//! in their own memory sub-thread and may leave a chronicle summary behind.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};

use saiverse_playbook::{NodeDef, PlaybookSchema};

use crate::RuntimeError;
use crate::events::{RuntimeEvent, emit};
use crate::nodes::tool::append_tool_result;
use crate::permissions::{PermissionDecision, PermissionLevel};
use crate::runtime::{NodeEnv, Runtime};
use crate::state::ExecState;

struct SubagentScope {
    thread_id: String,
    parent_thread_id: String,
}

async fn open_subagent(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    sub_name: &str,
) -> Option<SubagentScope> {
    match rt.start_subagent_thread(&env.persona, &format!("Subagent: {sub_name}")) {
        Some((thread_id, parent_thread_id)) => Some(SubagentScope { thread_id, parent_thread_id }),
        None => {
            warn!(sub_name = %sub_name, "failed to start subagent thread, falling back to inline");
            None
        }
    }
}

async fn run_nested(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    playbook: Arc<PlaybookSchema>,
    sub_input: Option<&str>,
    state: &mut ExecState,
) -> Result<Vec<String>, RuntimeError> {
    let token = state.token.clone();
    let pulse_type = state.pulse_type.clone();
    let building_id = rt.world.effective_building_id(&env.persona, &env.building_id);
    Box::pin(rt.run_playbook(
        playbook,
        Arc::clone(&env.persona),
        &building_id,
        sub_input,
        env.auto_mode,
        Some(state),
        env.event_callback.clone(),
        token,
        pulse_type.as_deref(),
        None,
    ))
    .await
}

/// SUBPLAY: statically named sub-playbook.
pub async fn subplay_node(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let Some(sub_name) = node.playbook.clone().or_else(|| node.action.clone()) else {
        state.set_last("(sub-playbook missing name)");
        return Ok(());
    };
    let Some(sub_pb) =
        rt.world
            .playbooks
            .load_for(&sub_name, &env.persona.persona_id, &env.building_id)
    else {
        state.set_last(format!("Sub-playbook {sub_name} not found"));
        return Ok(());
    };

    let template = node.input_template.as_deref().unwrap_or("{input}");
    let sub_input = state.format(template);

    let mut scope = None;
    if node.execution.as_deref() == Some("subagent") {
        scope = open_subagent(rt, env, &sub_name).await;
    }
    info!(sub_name = %sub_name, subagent = scope.is_some(), "sub-playbook starting");

    let result = run_nested(rt, env, sub_pb, Some(&sub_input), state).await;
    match result {
        Ok(sub_outputs) => {
            if let Some(scope) = scope {
                let generate = node.subagent_chronicle.unwrap_or(true);
                let chronicle = rt
                    .end_subagent_thread(&env.persona, &scope.thread_id, &scope.parent_thread_id, generate)
                    .await;
                state.subagent_chronicle = Some(chronicle.unwrap_or_default());
            }
            state.set_last(sub_outputs.last().cloned().unwrap_or_default());
            if node.propagate_output.unwrap_or(false) {
                state.outputs.extend(sub_outputs);
            }
            Ok(())
        }
        Err(err @ (RuntimeError::Llm(_) | RuntimeError::Cancelled(_))) => {
            if let Some(scope) = scope {
                rt.end_subagent_thread(&env.persona, &scope.thread_id, &scope.parent_thread_id, false)
                    .await;
            }
            Err(err)
        }
        Err(err) => {
            if let Some(scope) = scope {
                rt.end_subagent_thread(&env.persona, &scope.thread_id, &scope.parent_thread_id, false)
                    .await;
            }
            state.set_last(format!("Sub-playbook error: {err}"));
            Ok(())
        }
    }
}

/// EXEC: run the playbook a router selected, honoring city permissions.
pub async fn exec_node(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let playbook_source = node.playbook_source.as_deref().unwrap_or("selected_playbook");
    let args_source = node.args_source.as_deref().unwrap_or("selected_args");

    let mut sub_name = state.get_str(playbook_source);
    if sub_name.is_empty() {
        sub_name = state.last();
    }
    if sub_name.is_empty() {
        sub_name = "basic_chat".to_string();
    }
    let clean_name = sub_name.trim().to_string();

    let Some(sub_pb) =
        rt.world
            .playbooks
            .load_for(&clean_name, &env.persona.persona_id, &env.building_id)
    else {
        let message = format!("Sub-playbook not found: {clean_name}");
        state.set_last(message.clone());
        state.exec_error = true;
        state.exec_error_detail = Some(message.clone());
        state.outputs.push(message);
        return Ok(());
    };

    // Sub-input: router-provided args first, then the pulse input.
    let args = state.get(args_source).cloned().unwrap_or(Value::Null);
    let sub_input = args
        .get("input")
        .or_else(|| args.get("query"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| state.get_str("input"));

    // ── Playbook permission check ──
    if clean_name != "basic_chat" {
        let city_id = rt.world.config.city.city_id.clone();
        let level = rt
            .world
            .db
            .permission_level(&city_id, &clean_name)
            .and_then(|raw| PermissionLevel::parse(&raw));

        match level {
            Some(PermissionLevel::Blocked) | Some(PermissionLevel::UserOnly) => {
                let level_str = level.expect("matched above").as_str();
                let denial =
                    format!("Playbook '{clean_name}' is not available (permission: {level_str})");
                notify_permission_result(rt, env, state, &clean_name, denial);
                return Ok(());
            }
            Some(PermissionLevel::AskEveryTime) => {
                if env.auto_mode {
                    let denial = format!(
                        "Playbook '{clean_name}' requires user permission but running in auto mode. Skipped."
                    );
                    notify_permission_result(rt, env, state, &clean_name, denial);
                    return Ok(());
                }
                if state.pulse_type.as_deref() == Some("schedule") {
                    // Schedule-triggered: the user pre-approved by creating
                    // the schedule.
                    info!(playbook = %clean_name, "auto-allowed (schedule)");
                } else {
                    let timeout =
                        Duration::from_secs(rt.world.config.runtime.permission_timeout_secs);
                    let decision = rt
                        .world
                        .permission_broker
                        .ask(&clean_name, &env.persona.persona_id, &env.event_callback, timeout)
                        .await;
                    match decision {
                        PermissionDecision::Allow => {}
                        PermissionDecision::AlwaysAllow => {
                            let _ = rt.world.db.set_permission_level(
                                &city_id,
                                &clean_name,
                                PermissionLevel::AutoAllow.as_str(),
                            );
                        }
                        PermissionDecision::Deny => {
                            let denial = format!(
                                "User denied execution of playbook '{clean_name}'. Please respond without using this tool."
                            );
                            notify_permission_result(rt, env, state, &clean_name, denial);
                            return Ok(());
                        }
                        PermissionDecision::Timeout => {
                            let denial = format!(
                                "Permission request for playbook '{clean_name}' timed out. Please respond without using this tool."
                            );
                            notify_permission_result(rt, env, state, &clean_name, denial);
                            return Ok(());
                        }
                        PermissionDecision::NeverUse => {
                            let _ = rt.world.db.set_permission_level(
                                &city_id,
                                &clean_name,
                                PermissionLevel::UserOnly.as_str(),
                            );
                            let denial = format!(
                                "User disabled playbook '{clean_name}'. This playbook will not be available in future. Please respond without using this tool."
                            );
                            notify_permission_result(rt, env, state, &clean_name, denial);
                            return Ok(());
                        }
                    }
                }
            }
            Some(PermissionLevel::AutoAllow) | None => {}
        }
    }

    let mut scope = None;
    if node.execution.as_deref() == Some("subagent") {
        scope = open_subagent(rt, env, &clean_name).await;
    }
    info!(playbook = %clean_name, subagent = scope.is_some(), "exec starting");

    let result = run_nested(rt, env, sub_pb, Some(&sub_input), state).await;
    match result {
        Ok(sub_outputs) => {
            if let Some(scope) = scope {
                let generate = node.subagent_chronicle.unwrap_or(true);
                let chronicle = rt
                    .end_subagent_thread(&env.persona, &scope.thread_id, &scope.parent_thread_id, generate)
                    .await;
                state.subagent_chronicle = Some(chronicle.unwrap_or_default());
            }

            state.exec_error = false;
            state.exec_error_detail = None;

            // Track in executed_playbooks when the caller maintains one.
            if let Some(Value::Array(list)) = state.vars.get_mut("executed_playbooks") {
                list.push(json!(clean_name));
            }

            // Close the router's function-call pair.
            let joined: String = sub_outputs
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            let closing = if joined.is_empty() { "(completed)".to_string() } else { joined };
            append_tool_result(state, &clean_name, &closing);

            if let Some(last) = sub_outputs.last() {
                state.set_last(last.clone());
            }
            Ok(())
        }
        Err(RuntimeError::Cancelled(cancelled)) => {
            if let Some(scope) = scope {
                rt.end_subagent_thread(&env.persona, &scope.thread_id, &scope.parent_thread_id, false)
                    .await;
            }
            Err(RuntimeError::Cancelled(cancelled))
        }
        Err(err) => {
            if let Some(scope) = scope {
                rt.end_subagent_thread(&env.persona, &scope.thread_id, &scope.parent_thread_id, false)
                    .await;
            }
            let message = format!("Sub-playbook error: {err}");
            state.set_last(message.clone());
            state.exec_error = true;
            state.exec_error_detail = Some(message.clone());

            emit(
                &env.event_callback,
                RuntimeEvent::Error {
                    content: format!("[{clean_name}] {err}"),
                    playbook: env.playbook.name.clone(),
                    node: node.id.clone(),
                },
            );
            if !rt.store_memory(
                &env.persona,
                &message,
                "system",
                &["error", "exec", &clean_name],
                Some(&state.pulse_id),
                None,
            ) {
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
            state.outputs.push(message);
            Ok(())
        }
    }
}

/// Permission denial path: the denial text becomes the node result, lands in
/// memory so later calls can see it, and closes the router's tool-call pair.
/// The success edge is taken (`_exec_error` stays false).
fn notify_permission_result(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    state: &mut ExecState,
    playbook_name: &str,
    denial: String,
) {
    info!(playbook = playbook_name, denial = %denial, "exec denied by permission policy");
    state.set_last(denial.clone());
    state.exec_error = false;
    state.exec_error_detail = None;

    if !rt.store_memory(
        &env.persona,
        &denial,
        "system",
        &["error", "exec", playbook_name],
        Some(&state.pulse_id),
        None,
    ) {
        warn!("failed to store permission denial to memory");
    }
    append_tool_result(state, playbook_name, &denial);
    state.outputs.push(denial);
}
