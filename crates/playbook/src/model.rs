use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel edge target that terminates the branch.
pub const END: &str = "END";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Set,
    Llm,
    Tool,
    ToolCall,
    Memorize,
    Subplay,
    Exec,
    Speak,
    Say,
    Think,
    Pass,
    StelisStart,
    StelisEnd,
}

/// Conditional routing: resolve `field` from state (dot-notation allowed),
/// stringify, and look the value up in `cases`. A missing case falls back to
/// the "default" entry when present, otherwise the branch ends. A null case
/// target also ends the branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalNext {
    pub field: String,
    pub cases: HashMap<String, Option<String>>,
}

/// `memorize` option on LLM nodes: plain `true` or `{"tags": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemorizeOption {
    Enabled(bool),
    Tagged { tags: Vec<String> },
}

impl MemorizeOption {
    pub fn is_enabled(&self) -> bool {
        match self {
            MemorizeOption::Enabled(enabled) => *enabled,
            MemorizeOption::Tagged { .. } => true,
        }
    }

    pub fn tags(&self) -> Vec<String> {
        match self {
            MemorizeOption::Enabled(_) => Vec::new(),
            MemorizeOption::Tagged { tags } => tags.clone(),
        }
    }
}

/// `output_keys` takes two shapes: LLM nodes use a list of mappings
/// (`[{"text": "reply"}, {"function_call": "fc"}]`); TOOL nodes use a flat
/// list of state keys bound to positional tuple elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputKeys {
    Mappings(Vec<HashMap<String, String>>),
    Keys(Vec<String>),
}

impl OutputKeys {
    /// The mapped key for one LLM output channel ("text" / "function_call" /
    /// "thought").
    pub fn mapping_for(&self, channel: &str) -> Option<&str> {
        match self {
            OutputKeys::Mappings(mappings) => mappings
                .iter()
                .find_map(|m| m.get(channel).map(String::as_str)),
            OutputKeys::Keys(_) => None,
        }
    }

    pub fn positional(&self) -> Option<&[String]> {
        match self {
            OutputKeys::Keys(keys) => Some(keys),
            OutputKeys::Mappings(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StelisConfig {
    pub window_ratio: f64,
    pub max_depth: u32,
    pub chronicle_prompt: Option<String>,
}

impl Default for StelisConfig {
    fn default() -> Self {
        Self { window_ratio: 0.8, max_depth: 3, chronicle_prompt: None }
    }
}

/// One node of a playbook graph. Fields beyond the common set apply only to
/// particular node types; the validator flags misuse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeType,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub conditional_next: Option<ConditionalNext>,
    /// EXEC only: edge taken when the sub-playbook fails.
    #[serde(default)]
    pub error_next: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Prompt template (LLM/SAY/THINK/MEMORIZE), or the tool name (TOOL).
    #[serde(default)]
    pub action: Option<String>,

    // llm
    #[serde(default)]
    pub context_profile: Option<String>,
    #[serde(default)]
    pub response_schema: Option<Value>,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub output_keys: Option<OutputKeys>,
    #[serde(default)]
    pub available_tools: Option<Vec<String>>,
    #[serde(default)]
    pub memorize: Option<MemorizeOption>,
    #[serde(default)]
    pub speak: Option<bool>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub metadata_key: Option<String>,

    // set
    #[serde(default)]
    pub assignments: Option<serde_json::Map<String, Value>>,

    // tool
    #[serde(default)]
    pub args_input: Option<serde_json::Map<String, Value>>,

    // tool_call
    #[serde(default)]
    pub call_source: Option<String>,

    // memorize
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,

    // subplay / exec
    #[serde(default)]
    pub playbook: Option<String>,
    #[serde(default)]
    pub input_template: Option<String>,
    #[serde(default)]
    pub propagate_output: Option<bool>,
    #[serde(default)]
    pub execution: Option<String>,
    #[serde(default)]
    pub subagent_chronicle: Option<bool>,
    #[serde(default)]
    pub playbook_source: Option<String>,
    #[serde(default)]
    pub args_source: Option<String>,

    // stelis
    #[serde(default)]
    pub stelis_config: Option<StelisConfig>,
    #[serde(default)]
    pub generate_chronicle: Option<bool>,
}

impl NodeDef {
    pub fn new(id: impl Into<String>, kind: NodeType) -> Self {
        Self {
            id: id.into(),
            kind,
            next: None,
            conditional_next: None,
            error_next: None,
            label: None,
            action: None,
            context_profile: None,
            response_schema: None,
            output_key: None,
            output_keys: None,
            available_tools: None,
            memorize: None,
            speak: None,
            model_type: None,
            metadata_key: None,
            assignments: None,
            args_input: None,
            call_source: None,
            role: None,
            tags: None,
            playbook: None,
            input_template: None,
            propagate_output: None,
            execution: None,
            subagent_chronicle: None,
            playbook_source: None,
            args_source: None,
            stelis_config: None,
            generate_chronicle: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }
}

/// How many conversation messages (or characters) the context builder loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryDepth {
    Chars(i64),
    Text(String),
}

/// Parsed interpretation of a [`HistoryDepth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedDepth {
    Full,
    None,
    Messages(usize),
    Chars(usize),
}

impl HistoryDepth {
    pub fn full() -> Self {
        HistoryDepth::Text("full".to_string())
    }

    pub fn resolve(&self) -> ResolvedDepth {
        match self {
            HistoryDepth::Chars(n) if *n <= 0 => ResolvedDepth::None,
            HistoryDepth::Chars(n) => ResolvedDepth::Chars(*n as usize),
            HistoryDepth::Text(text) => match text.as_str() {
                "full" => ResolvedDepth::Full,
                "none" | "0" => ResolvedDepth::None,
                other => {
                    if let Some(count) = other.strip_suffix("messages") {
                        ResolvedDepth::Messages(count.parse().unwrap_or(10))
                    } else {
                        ResolvedDepth::Chars(other.parse().unwrap_or(2000))
                    }
                }
            },
        }
    }
}

impl Default for HistoryDepth {
    fn default() -> Self {
        HistoryDepth::full()
    }
}

/// What the context builder must assemble for a playbook or LLM node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextRequirements {
    pub system_prompt: bool,
    pub inventory: bool,
    pub building_items: bool,
    pub available_playbooks: bool,
    pub working_memory: bool,
    /// Chronicle + memopedia blocks.
    pub memory_weave: bool,
    /// Building / persona images.
    pub visual_context: bool,
    pub history_depth: HistoryDepth,
    pub history_balanced: bool,
    pub include_internal: bool,
    pub realtime_context: bool,
}

impl Default for ContextRequirements {
    fn default() -> Self {
        Self {
            system_prompt: true,
            inventory: true,
            building_items: true,
            available_playbooks: false,
            working_memory: true,
            memory_weave: true,
            visual_context: true,
            history_depth: HistoryDepth::full(),
            history_balanced: true,
            include_internal: false,
            realtime_context: true,
        }
    }
}

impl ContextRequirements {
    /// A bare profile: no prompt sections, no history.
    pub fn none() -> Self {
        Self {
            system_prompt: false,
            inventory: false,
            building_items: false,
            available_playbooks: false,
            working_memory: false,
            memory_weave: false,
            visual_context: false,
            history_depth: HistoryDepth::Text("none".to_string()),
            history_balanced: false,
            include_internal: false,
            realtime_context: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybookScope {
    #[default]
    Public,
    Personal,
    Building,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputParam {
    pub name: String,
    pub description: Option<String>,
    /// Where the value comes from: "input" (default), "parent.<path>", or a
    /// parent-state key.
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybookSchema {
    pub name: String,
    pub description: String,
    pub display_name: Option<String>,
    pub scope: PlaybookScope,
    pub owner_persona_id: Option<String>,
    pub building_id: Option<String>,
    pub router_callable: bool,
    pub user_selectable: bool,
    pub dev_only: bool,
    pub input_schema: Vec<InputParam>,
    /// State keys propagated back into the caller's state.
    pub output_schema: Vec<String>,
    pub context_requirements: Option<ContextRequirements>,
    /// Named profile used when `context_requirements` is absent.
    pub context_profile: Option<String>,
    pub start_node: String,
    pub nodes: Vec<NodeDef>,
}

impl Default for PlaybookSchema {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            display_name: None,
            scope: PlaybookScope::Public,
            owner_persona_id: None,
            building_id: None,
            router_callable: false,
            user_selectable: false,
            dev_only: false,
            input_schema: Vec::new(),
            output_schema: Vec::new(),
            context_requirements: None,
            context_profile: None,
            start_node: String::new(),
            nodes: Vec::new(),
        }
    }
}

impl PlaybookSchema {
    pub fn node_map(&self) -> HashMap<&str, &NodeDef> {
        self.nodes.iter().map(|n| (n.id.as_str(), n)).collect()
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Effective context requirements: explicit block, then named profile,
    /// then the full default.
    pub fn effective_requirements(&self) -> ContextRequirements {
        if let Some(reqs) = &self.context_requirements {
            return reqs.clone();
        }
        if let Some(profile) = &self.context_profile {
            if let Some(found) = crate::profiles::context_profile(profile) {
                return found.requirements.clone();
            }
        }
        ContextRequirements::default()
    }

    /// Whether this playbook counts as infrastructure (meta/sub) for
    /// activity-trace purposes.
    pub fn is_infrastructure(&self) -> bool {
        self.name.starts_with("meta_") || self.name.starts_with("sub_")
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_depth_parses_every_form() {
        assert_eq!(HistoryDepth::Text("full".into()).resolve(), ResolvedDepth::Full);
        assert_eq!(HistoryDepth::Text("none".into()).resolve(), ResolvedDepth::None);
        assert_eq!(HistoryDepth::Chars(0).resolve(), ResolvedDepth::None);
        assert_eq!(
            HistoryDepth::Text("10messages".into()).resolve(),
            ResolvedDepth::Messages(10)
        );
        assert_eq!(HistoryDepth::Chars(4000).resolve(), ResolvedDepth::Chars(4000));
        assert_eq!(HistoryDepth::Text("1500".into()).resolve(), ResolvedDepth::Chars(1500));
    }

    #[test]
    fn node_json_roundtrip() {
        let raw = serde_json::json!({
            "id": "draft",
            "type": "llm",
            "action": "Reply to: {input}",
            "speak": true,
            "next": "remember",
            "output_keys": [{"text": "reply"}, {"function_call": "fc"}],
        });
        let node: NodeDef = serde_json::from_value(raw).unwrap();
        assert_eq!(node.kind, NodeType::Llm);
        assert_eq!(node.output_keys.as_ref().unwrap().mapping_for("text"), Some("reply"));
        assert_eq!(node.output_keys.as_ref().unwrap().mapping_for("function_call"), Some("fc"));
        assert_eq!(node.output_keys.as_ref().unwrap().mapping_for("thought"), None);
    }

    #[test]
    fn tool_output_keys_parse_as_positional_list() {
        let raw = serde_json::json!({
            "id": "fetch",
            "type": "tool",
            "action": "building_messages",
            "output_keys": ["text", "details"],
        });
        let node: NodeDef = serde_json::from_value(raw).unwrap();
        assert_eq!(
            node.output_keys.as_ref().unwrap().positional(),
            Some(&["text".to_string(), "details".to_string()][..])
        );
    }

    #[test]
    fn memorize_option_both_shapes() {
        let plain: MemorizeOption = serde_json::from_value(serde_json::json!(true)).unwrap();
        assert!(plain.is_enabled());
        assert!(plain.tags().is_empty());

        let tagged: MemorizeOption =
            serde_json::from_value(serde_json::json!({"tags": ["conversation"]})).unwrap();
        assert!(tagged.is_enabled());
        assert_eq!(tagged.tags(), vec!["conversation".to_string()]);
    }

    #[test]
    fn playbook_defaults_fill_missing_fields() {
        let raw = serde_json::json!({
            "name": "daily_walk",
            "description": "Take a walk",
            "start_node": "go",
            "nodes": [{"id": "go", "type": "speak"}],
        });
        let playbook: PlaybookSchema = serde_json::from_value(raw).unwrap();
        assert_eq!(playbook.scope, PlaybookScope::Public);
        assert!(!playbook.router_callable);
        assert!(playbook.node("go").is_some());
        assert_eq!(playbook.display_name(), "daily_walk");
        assert!(!playbook.is_infrastructure());
    }

    #[test]
    fn infrastructure_prefixes_are_detected() {
        let mut playbook = PlaybookSchema::default();
        playbook.name = "meta_user".to_string();
        assert!(playbook.is_infrastructure());
        playbook.name = "sub_router_user".to_string();
        assert!(playbook.is_infrastructure());
    }
}
