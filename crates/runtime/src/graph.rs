//! Graph execution: walk a compiled playbook node by node.
//!
//! The runtime follows exactly one branch per instance; `conditional_next`
//! selects it by stringified state value. EXEC's `error_next` edge wins when
//! the node left `_exec_error` set. Per-node visit counts bound pathological
//! loops.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use saiverse_playbook::{END, NodeDef, NodeType};

use crate::RuntimeError;
use crate::events::{RuntimeEvent, emit};
use crate::nodes;
use crate::runtime::{NodeEnv, Runtime};
use crate::state::ExecState;
use crate::world::ExecutionState;

pub async fn run(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    let playbook = &env.playbook;
    let max_loop = rt.world.config.runtime.max_loop;
    let mut visits: HashMap<String, usize> = HashMap::new();
    let mut current = Some(playbook.start_node.clone());

    while let Some(node_id) = current {
        let Some(node) = playbook.node(&node_id) else {
            return Err(RuntimeError::Playbook(format!(
                "playbook '{}' reached unknown node '{node_id}'",
                playbook.name
            )));
        };

        let visit = visits.entry(node_id.clone()).or_insert(0);
        *visit += 1;
        if *visit > max_loop {
            warn!(
                playbook = %playbook.name,
                node = %node_id,
                max_loop,
                "node visit ceiling reached, terminating branch"
            );
            break;
        }

        state.token.check()?;
        env.persona
            .set_execution_state(ExecutionState::running(&playbook.name, &node_id));
        emit(
            &env.event_callback,
            RuntimeEvent::Status {
                playbook: playbook.name.clone(),
                node: node_id.clone(),
                content: format!("{} / {node_id}", playbook.name),
                playbook_chain: None,
            },
        );

        nodes::dispatch(rt, env, node, state).await?;
        current = next_node(node, state);
        debug!(node = %node_id, next = current.as_deref().unwrap_or("-"), "node complete");
    }

    Ok(())
}

/// Choose the edge out of a node against the current state.
pub fn next_node(node: &NodeDef, state: &ExecState) -> Option<String> {
    // EXEC failure takes the error edge when one is wired.
    if node.kind == NodeType::Exec && state.exec_error {
        if let Some(error_next) = &node.error_next {
            return edge_target(error_next);
        }
    }

    if let Some(cond) = &node.conditional_next {
        let value = state.get(&cond.field).map(case_key).unwrap_or_default();
        let chosen = cond
            .cases
            .get(&value)
            .or_else(|| cond.cases.get("default"));
        return match chosen {
            Some(Some(target)) => edge_target(target),
            Some(None) | None => None,
        };
    }

    node.next.as_deref().and_then(edge_target)
}

fn edge_target(target: &str) -> Option<String> {
    (target != END).then(|| target.to_string())
}

/// Stringification used for case matching: bare strings, lowercase bools,
/// plain numbers; null and missing values match the empty string.
fn case_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saiverse_playbook::ConditionalNext;
    use serde_json::json;

    fn node_with_cases(field: &str, cases: &[(&str, Option<&str>)]) -> NodeDef {
        let mut node = NodeDef::new("router", NodeType::Pass);
        node.conditional_next = Some(ConditionalNext {
            field: field.to_string(),
            cases: cases
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
                .collect(),
        });
        node
    }

    #[test]
    fn conditional_matches_stringified_values() {
        let node = node_with_cases("tool_called", &[("true", Some("run_tool")), ("default", Some("speak"))]);

        let mut state = ExecState::default();
        state.set("tool_called", json!(true));
        assert_eq!(next_node(&node, &state), Some("run_tool".to_string()));

        state.set("tool_called", json!(false));
        assert_eq!(next_node(&node, &state), Some("speak".to_string()));
    }

    #[test]
    fn conditional_resolves_dot_paths() {
        let node = node_with_cases("result.kind", &[("summary", Some("publish"))]);
        let mut state = ExecState::default();
        state.set("result", json!({"kind": "summary"}));
        assert_eq!(next_node(&node, &state), Some("publish".to_string()));
    }

    #[test]
    fn missing_case_without_default_ends_branch() {
        let node = node_with_cases("choice", &[("a", Some("alpha"))]);
        let mut state = ExecState::default();
        state.set("choice", json!("z"));
        assert_eq!(next_node(&node, &state), None);
    }

    #[test]
    fn null_case_target_ends_branch() {
        let node = node_with_cases("choice", &[("stop", None)]);
        let mut state = ExecState::default();
        state.set("choice", json!("stop"));
        assert_eq!(next_node(&node, &state), None);
    }

    #[test]
    fn exec_error_prefers_error_edge() {
        let mut node = NodeDef::new("exec", NodeType::Exec);
        node.next = Some("speak".to_string());
        node.error_next = Some("apologize".to_string());

        let mut state = ExecState::default();
        assert_eq!(next_node(&node, &state), Some("speak".to_string()));
        state.exec_error = true;
        assert_eq!(next_node(&node, &state), Some("apologize".to_string()));
    }

    #[test]
    fn end_sentinel_terminates() {
        let node = NodeDef::new("finish", NodeType::Pass).with_next(END);
        let state = ExecState::default();
        assert_eq!(next_node(&node, &state), None);
    }
}
