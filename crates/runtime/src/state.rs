//! The mutable state map threaded through a playbook execution.
//!
//! User-visible variables live in `vars` as JSON values; the system-side
//! pieces (conversation arrays, usage accumulator, activity trace,
//! cancellation token, pending tool call) are typed fields so nodes cannot
//! clobber them by accident.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use serde_json::{Map, Value};

use saiverse_llm::ChatMessage;

use crate::cancellation::CancellationToken;
use crate::events::ActivityEntry;
use crate::usage::PulseUsage;

/// Tool call minted by an LLM node, awaiting its paired tool result.
#[derive(Debug, Clone, Default)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub args_json: String,
    pub thought_signature: Option<String>,
}

#[derive(Clone)]
pub struct ExecState {
    pub vars: Map<String, Value>,
    /// Accumulating conversation for profile-less LLM nodes.
    pub messages: Vec<ChatMessage>,
    /// Node outputs injected on top of profile-cached base contexts.
    pub intermediate: Vec<ChatMessage>,
    /// Base messages built once per named context profile.
    pub profile_cache: HashMap<String, Vec<ChatMessage>>,
    /// Texts spoken so far in this run.
    pub outputs: Vec<String>,
    pub pulse_id: String,
    pub pulse_type: Option<String>,
    pub playbook_chain: String,
    pub token: CancellationToken,
    /// Shared across the whole pulse, including sub-playbooks.
    pub usage: Arc<Mutex<PulseUsage>>,
    pub activity: Arc<Mutex<Vec<ActivityEntry>>>,
    pub reasoning_text: Option<String>,
    pub reasoning_details: Option<Value>,
    pub pending_tool_call: Option<PendingToolCall>,
    pub exec_error: bool,
    pub exec_error_detail: Option<String>,
    pub subagent_chronicle: Option<String>,
}

impl Default for ExecState {
    fn default() -> Self {
        Self {
            vars: Map::new(),
            messages: Vec::new(),
            intermediate: Vec::new(),
            profile_cache: HashMap::new(),
            outputs: Vec::new(),
            pulse_id: String::new(),
            pulse_type: None,
            playbook_chain: String::new(),
            token: CancellationToken::new(),
            usage: Arc::new(Mutex::new(PulseUsage::default())),
            activity: Arc::new(Mutex::new(Vec::new())),
            reasoning_text: None,
            reasoning_details: None,
            pending_tool_call: None,
            exec_error: false,
            exec_error_detail: None,
            subagent_chronicle: None,
        }
    }
}

impl ExecState {
    /// Resolve a state reference: literal key first (flattened dot keys are
    /// stored directly), then dot-notation traversal into nested objects.
    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.vars.get(path) {
            return Some(value);
        }
        let mut parts = path.split('.');
        let mut current = self.vars.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn get_str(&self, path: &str) -> String {
        self.get(path).map(value_to_display).unwrap_or_default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Store a structured value and synthesize flattened dot-notation keys
    /// (`key.subfield`, recursively) so downstream nodes can reference
    /// subfields directly.
    pub fn set_structured(&mut self, key: &str, value: Value) {
        if let Value::Object(object) = &value {
            for (path, leaf) in flatten(object) {
                self.vars.insert(format!("{key}.{path}"), leaf);
            }
        }
        self.vars.insert(key.to_string(), value);
    }

    pub fn last(&self) -> String {
        self.get_str("last")
    }

    pub fn set_last(&mut self, value: impl Into<String>) {
        self.vars.insert("last".to_string(), Value::String(value.into()));
    }

    pub fn push_activity(&self, entry: ActivityEntry) {
        self.activity.lock().expect("activity lock poisoned").push(entry);
    }

    pub fn activity_snapshot(&self) -> Vec<ActivityEntry> {
        self.activity.lock().expect("activity lock poisoned").clone()
    }

    pub fn usage_snapshot(&self) -> PulseUsage {
        self.usage.lock().expect("usage lock poisoned").clone()
    }

    /// Expand `{ref}` placeholders against the state. Dot-notation resolves
    /// into nested values; unknown references keep their braces so JSON
    /// literals in prompts survive untouched.
    pub fn format(&self, template: &str) -> String {
        format_with(template, |key| self.get(key).map(value_to_display))
    }
}

/// `{key}` replacement with a lookup function; unknown keys are left intact.
pub fn format_with(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"\{([\w.]+)\}").expect("static regex"));
    pattern
        .replace_all(template, |caps: &regex::Captures<'_>| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Render a JSON value the way templates and `last` expect: strings bare,
/// everything else compact JSON.
pub fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Flatten a JSON object into (dot.path, leaf) pairs.
pub fn flatten(object: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for (key, value) in object {
        match value {
            Value::Object(nested) => {
                out.push((key.clone(), value.clone()));
                for (path, leaf) in flatten(nested) {
                    out.push((format!("{key}.{path}"), leaf));
                }
            }
            other => out.push((key.clone(), other.clone())),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_prefers_literal_keys_over_traversal() {
        let mut state = ExecState::default();
        state.set("fc.name", json!("literal"));
        state.set("fc", json!({"name": "nested"}));
        assert_eq!(state.get_str("fc.name"), "literal");
        assert_eq!(state.get_str("fc"), "{\"name\":\"nested\"}");
    }

    #[test]
    fn dot_traversal_descends_objects() {
        let mut state = ExecState::default();
        state.set("result", json!({"inner": {"score": 7}}));
        assert_eq!(state.get_str("result.inner.score"), "7");
        assert!(state.get("result.inner.missing").is_none());
    }

    #[test]
    fn set_structured_synthesizes_flat_keys() {
        let mut state = ExecState::default();
        state.set_structured("report", json!({"summary": "ok", "detail": {"pages": 3}}));
        assert_eq!(state.get_str("report.summary"), "ok");
        assert_eq!(state.get_str("report.detail.pages"), "3");
        assert!(state.vars.contains_key("report.detail"));
    }

    #[test]
    fn format_expands_known_keys_and_keeps_unknown_braces() {
        let mut state = ExecState::default();
        state.set("input", json!("hello"));
        state.set("profile", json!({"name": "Aoi"}));
        let out = state.format("{profile.name} heard: {input} // {\"json\": {literal}}");
        assert_eq!(out, "Aoi heard: hello // {\"json\": {literal}}");
    }

    #[test]
    fn format_renders_null_as_empty() {
        let mut state = ExecState::default();
        state.set("gone", Value::Null);
        assert_eq!(state.format("[{gone}]"), "[]");
    }

    #[test]
    fn last_roundtrip() {
        let mut state = ExecState::default();
        assert_eq!(state.last(), "");
        state.set_last("done");
        assert_eq!(state.last(), "done");
    }

    #[test]
    fn usage_and_activity_are_shared_handles() {
        let state = ExecState::default();
        let child = ExecState {
            usage: Arc::clone(&state.usage),
            activity: Arc::clone(&state.activity),
            ..ExecState::default()
        };
        child.push_activity(ActivityEntry {
            action: "tool".to_string(),
            name: "recall".to_string(),
            playbook: "daily_walk".to_string(),
        });
        assert_eq!(state.activity_snapshot().len(), 1);
    }
}
