use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form per-message metadata.
///
/// Known fields are typed; anything else (stelis markers, summary linkage,
/// integration payloads) rides along in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulse_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub heard_by: BTreeSet<String>,
    /// Personas that have pulled this utterance into their own memory.
    /// Append-only.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub ingested_by: BTreeSet<String>,
    /// Co-present persona ids (possibly including "user").
    #[serde(rename = "with", skip_serializing_if = "BTreeSet::is_empty")]
    pub with_ids: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub will_resume: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_started: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_latest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_usage_total: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_trace: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl MessageMetadata {
    pub fn with_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A stored utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMessage {
    pub id: String,
    pub thread_id: String,
    /// Author persona id; "user" and "system" are reserved authors.
    pub persona_id: String,
    pub role: String,
    pub content: String,
    /// Epoch seconds; non-decreasing within a thread.
    pub created_at: f64,
    pub metadata: MessageMetadata,
}

/// Input for appending one message.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub persona_id: String,
    pub role: String,
    pub content: String,
    pub metadata: MessageMetadata,
    /// Target thread suffix; None appends to the active thread.
    pub thread_suffix: Option<String>,
}

impl NewMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_persona(mut self, persona_id: impl Into<String>) -> Self {
        self.persona_id = persona_id.into();
        self
    }
}
