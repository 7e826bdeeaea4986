//! Load-time playbook validation.
//!
//! Hard errors reject the playbook (dangling edges, duplicate ids, bad
//! names); soft findings (unreachable nodes, suspicious fields) come back as
//! warnings. The reachability walk forks every conditional branch and bounds
//! node visits, so cyclic graphs terminate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use regex::Regex;

use crate::model::{END, NodeDef, NodeType, PlaybookSchema};
use crate::PlaybookError;

/// Visits allowed per node during the static walk.
pub const DRY_RUN_MAX_LOOP: usize = 2;

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_]+$").expect("static regex"))
}

fn invalid(playbook: &PlaybookSchema, reason: impl Into<String>) -> PlaybookError {
    PlaybookError::Invalid { name: playbook.name.clone(), reason: reason.into() }
}

pub fn validate(playbook: &PlaybookSchema) -> Result<ValidationReport, PlaybookError> {
    let mut report = ValidationReport::default();

    if !name_pattern().is_match(&playbook.name) {
        return Err(invalid(playbook, "name must match ^[a-z0-9_]+$"));
    }
    if playbook.nodes.is_empty() {
        return Err(invalid(playbook, "playbook has no nodes"));
    }

    let mut ids = HashSet::new();
    for node in &playbook.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(invalid(playbook, format!("duplicate node id '{}'", node.id)));
        }
    }
    let node_map: HashMap<&str, &NodeDef> = playbook.node_map();

    if !node_map.contains_key(playbook.start_node.as_str()) {
        return Err(invalid(
            playbook,
            format!("start_node '{}' does not exist", playbook.start_node),
        ));
    }

    let mut input_names = HashSet::new();
    for param in &playbook.input_schema {
        if param.name.is_empty() {
            return Err(invalid(playbook, "input parameter with empty name"));
        }
        if !input_names.insert(param.name.as_str()) {
            return Err(invalid(playbook, format!("duplicate input parameter '{}'", param.name)));
        }
    }
    let mut output_names = HashSet::new();
    for key in &playbook.output_schema {
        if !output_names.insert(key.as_str()) {
            return Err(invalid(playbook, format!("duplicate output key '{key}'")));
        }
    }

    // Every edge target must resolve to a node or END.
    let check_target = |target: &str| -> bool { target == END || node_map.contains_key(target) };
    for node in &playbook.nodes {
        if let Some(next) = &node.next {
            if !check_target(next) {
                return Err(invalid(
                    playbook,
                    format!("node '{}' points at unknown node '{next}'", node.id),
                ));
            }
        }
        if let Some(cond) = &node.conditional_next {
            if cond.field.is_empty() {
                return Err(invalid(playbook, format!("node '{}' has an empty conditional field", node.id)));
            }
            for (case, target) in &cond.cases {
                if let Some(target) = target {
                    if !check_target(target) {
                        return Err(invalid(
                            playbook,
                            format!("node '{}' case '{case}' points at unknown node '{target}'", node.id),
                        ));
                    }
                }
            }
        }
        if let Some(error_next) = &node.error_next {
            if node.kind != NodeType::Exec {
                return Err(invalid(
                    playbook,
                    format!("node '{}' declares error_next but is not an exec node", node.id),
                ));
            }
            if !check_target(error_next) {
                return Err(invalid(
                    playbook,
                    format!("node '{}' error_next points at unknown node '{error_next}'", node.id),
                ));
            }
        }
        if node.kind == NodeType::Tool && node.action.is_none() {
            return Err(invalid(playbook, format!("tool node '{}' is missing its tool name", node.id)));
        }
    }

    // Static reachability walk. Unlike the runtime (which follows exactly one
    // branch), this forks every conditional case.
    let mut visits: HashMap<&str, usize> = HashMap::new();
    let mut frontier = VecDeque::new();
    frontier.push_back(playbook.start_node.as_str());
    while let Some(current) = frontier.pop_front() {
        let count = visits.entry(current).or_insert(0);
        if *count >= DRY_RUN_MAX_LOOP {
            continue;
        }
        *count += 1;

        let Some(node) = node_map.get(current) else { continue };
        if let Some(cond) = &node.conditional_next {
            for target in cond.cases.values().flatten() {
                if target != END {
                    frontier.push_back(target.as_str());
                }
            }
        } else if let Some(next) = &node.next {
            if next != END {
                frontier.push_back(next.as_str());
            }
        }
        if let Some(error_next) = &node.error_next {
            if error_next != END {
                frontier.push_back(error_next.as_str());
            }
        }
    }
    for node in &playbook.nodes {
        if !visits.contains_key(node.id.as_str()) {
            report
                .warnings
                .push(format!("node '{}' is unreachable from '{}'", node.id, playbook.start_node));
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConditionalNext, PlaybookSchema};

    fn two_node_playbook() -> PlaybookSchema {
        let mut playbook = PlaybookSchema::default();
        playbook.name = "basic_chat".to_string();
        playbook.description = "Reply based on input".to_string();
        playbook.start_node = "llm".to_string();
        playbook.nodes = vec![
            NodeDef::new("llm", NodeType::Llm)
                .with_action("Respond briefly to: {input}")
                .with_next("speak"),
            NodeDef::new("speak", NodeType::Speak),
        ];
        playbook
    }

    #[test]
    fn valid_playbook_passes_without_warnings() {
        let report = validate(&two_node_playbook()).unwrap();
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn bad_name_is_rejected() {
        let mut playbook = two_node_playbook();
        playbook.name = "Basic-Chat".to_string();
        assert!(validate(&playbook).is_err());
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut playbook = two_node_playbook();
        playbook.nodes[1].next = Some("nowhere".to_string());
        assert!(validate(&playbook).is_err());
    }

    #[test]
    fn end_is_a_valid_target() {
        let mut playbook = two_node_playbook();
        playbook.nodes[1].next = Some(END.to_string());
        assert!(validate(&playbook).is_ok());
    }

    #[test]
    fn missing_start_node_is_rejected() {
        let mut playbook = two_node_playbook();
        playbook.start_node = "missing".to_string();
        assert!(validate(&playbook).is_err());
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let mut playbook = two_node_playbook();
        playbook.nodes.push(NodeDef::new("llm", NodeType::Pass));
        assert!(validate(&playbook).is_err());
    }

    #[test]
    fn error_next_requires_an_exec_node() {
        let mut playbook = two_node_playbook();
        playbook.nodes[0].error_next = Some("speak".to_string());
        assert!(validate(&playbook).is_err());

        let mut with_exec = two_node_playbook();
        with_exec.nodes[0] = {
            let mut node = NodeDef::new("llm", NodeType::Exec);
            node.next = Some("speak".to_string());
            node.error_next = Some("speak".to_string());
            node
        };
        assert!(validate(&with_exec).is_ok());
    }

    #[test]
    fn unreachable_nodes_are_warned_about() {
        let mut playbook = two_node_playbook();
        playbook.nodes.push(NodeDef::new("orphan", NodeType::Pass));
        let report = validate(&playbook).unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("orphan"));
    }

    #[test]
    fn conditional_branches_are_all_explored() {
        let mut playbook = two_node_playbook();
        playbook.nodes[0].next = None;
        playbook.nodes[0].conditional_next = Some(ConditionalNext {
            field: "tool_called".to_string(),
            cases: [
                ("true".to_string(), Some("speak".to_string())),
                ("default".to_string(), None),
            ]
            .into_iter()
            .collect(),
        });
        let report = validate(&playbook).unwrap();
        assert!(report.warnings.is_empty(), "speak should be reachable via the case branch");
    }

    #[test]
    fn cyclic_graphs_terminate() {
        let mut playbook = two_node_playbook();
        playbook.nodes[1].next = Some("llm".to_string());
        let report = validate(&playbook).unwrap();
        assert!(report.warnings.is_empty());
    }
}
