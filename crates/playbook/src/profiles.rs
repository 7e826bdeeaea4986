//! Named context requirement profiles.
//!
//! A profile bundles the context builder inputs so that every LLM node
//! naming the same profile inside one playbook run shares a single base
//! message build. The set mirrors the profiles the playbook corpus uses.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::model::{ContextRequirements, HistoryDepth};

#[derive(Debug, Clone)]
pub struct ContextProfile {
    pub name: &'static str,
    pub description: &'static str,
    /// Which model tier the profile prefers ("normal" / "lightweight").
    pub model_type: &'static str,
    pub requirements: ContextRequirements,
}

fn profiles() -> &'static HashMap<&'static str, ContextProfile> {
    static PROFILES: OnceLock<HashMap<&'static str, ContextProfile>> = OnceLock::new();
    PROFILES.get_or_init(|| {
        let mut map = HashMap::new();

        // Full conversational context: everything on, balanced full history.
        map.insert(
            "conversation",
            ContextProfile {
                name: "conversation",
                description: "Full persona context for user-facing replies",
                model_type: "normal",
                requirements: ContextRequirements::default(),
            },
        );

        // Focused work: system prompt and a short window, no weave/visual.
        map.insert(
            "focused",
            ContextProfile {
                name: "focused",
                description: "System prompt plus a short recent window",
                model_type: "normal",
                requirements: ContextRequirements {
                    memory_weave: false,
                    visual_context: false,
                    available_playbooks: false,
                    history_depth: HistoryDepth::Text("30messages".to_string()),
                    history_balanced: false,
                    ..ContextRequirements::default()
                },
            },
        );

        // Minimal: a bare 10-message window for routing and classification.
        map.insert(
            "minimal",
            ContextProfile {
                name: "minimal",
                description: "Bare recent window for routing decisions",
                model_type: "lightweight",
                requirements: ContextRequirements {
                    inventory: false,
                    building_items: false,
                    working_memory: false,
                    memory_weave: false,
                    visual_context: false,
                    realtime_context: false,
                    history_depth: HistoryDepth::Text("10messages".to_string()),
                    history_balanced: false,
                    ..ContextRequirements::default()
                },
            },
        );

        // Recall: memory weave without conversation history.
        map.insert(
            "recall",
            ContextProfile {
                name: "recall",
                description: "Chronicle and memopedia context, no history",
                model_type: "normal",
                requirements: ContextRequirements {
                    inventory: false,
                    building_items: false,
                    working_memory: false,
                    visual_context: false,
                    realtime_context: false,
                    history_depth: HistoryDepth::Text("none".to_string()),
                    history_balanced: false,
                    ..ContextRequirements::default()
                },
            },
        );

        map
    })
}

pub fn context_profile(name: &str) -> Option<&'static ContextProfile> {
    profiles().get(name)
}

pub fn context_profile_names() -> Vec<&'static str> {
    let mut names: Vec<_> = profiles().keys().copied().collect();
    names.sort();
    names
}
