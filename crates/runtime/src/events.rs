//! Events the runtime emits through a request's event callback.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A notable side effect recorded during a pulse and attached to outgoing
/// messages as metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub action: String,
    pub name: String,
    pub playbook: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Status {
        playbook: String,
        node: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        playbook_chain: Option<String>,
    },
    StreamingChunk {
        content: String,
        persona_id: String,
        node_id: String,
    },
    StreamingThinking {
        content: String,
        persona_id: String,
        node_id: String,
    },
    StreamingComplete {
        persona_id: String,
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    StreamingDiscard {
        persona_id: String,
        node_id: String,
    },
    Say {
        content: String,
        persona_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        activity_trace: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Activity {
        action: String,
        name: String,
        playbook: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persona_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persona_name: Option<String>,
    },
    Warning {
        warning_code: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display: Option<String>,
    },
    Error {
        content: String,
        playbook: String,
        node: String,
    },
    Metabolism {
        status: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evicted: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kept: Option<usize>,
    },
    StelisStart {
        thread_id: String,
        parent_thread_id: String,
        depth: u32,
        label: String,
    },
    StelisEnd {
        thread_id: String,
        parent_thread_id: String,
        chronicle_generated: bool,
    },
    PermissionRequest {
        request_id: String,
        playbook: String,
        persona_id: String,
    },
    TweetConfirmation {
        request_id: String,
        content: String,
    },
}

impl RuntimeEvent {
    pub fn warning(code: &str, content: impl Into<String>) -> Self {
        RuntimeEvent::Warning {
            warning_code: code.to_string(),
            content: content.into(),
            display: None,
        }
    }
}

pub type EventCallback = Arc<dyn Fn(RuntimeEvent) + Send + Sync>;

/// Emit through an optional callback.
pub fn emit(callback: &Option<EventCallback>, event: RuntimeEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_type_tags() {
        let event = RuntimeEvent::Status {
            playbook: "basic_chat".to_string(),
            node: "llm".to_string(),
            content: "basic_chat / llm".to_string(),
            playbook_chain: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert!(json.get("playbook_chain").is_none());

        let chunk = RuntimeEvent::StreamingChunk {
            content: "hi".to_string(),
            persona_id: "p1".to_string(),
            node_id: "draft".to_string(),
        };
        assert_eq!(serde_json::to_value(&chunk).unwrap()["type"], "streaming_chunk");
    }

    #[test]
    fn emit_is_a_noop_without_callback() {
        emit(&None, RuntimeEvent::warning("x", "y"));
    }
}
