//! Playbook definitions: graphs of LLM / tool / memory / sub-playbook nodes.

mod model;
mod profiles;
mod store;
mod validate;

pub use model::{
    ConditionalNext, ContextRequirements, HistoryDepth, InputParam, MemorizeOption, NodeDef,
    NodeType, OutputKeys, PlaybookScope, PlaybookSchema, StelisConfig,
};
pub use profiles::{ContextProfile, context_profile, context_profile_names};
pub use model::{END, ResolvedDepth};
pub use store::{PlaybookStore, basic_chat};
pub use validate::{DRY_RUN_MAX_LOOP, ValidationReport, validate};

/// Failure while loading or validating a playbook definition.
#[derive(Debug, thiserror::Error)]
pub enum PlaybookError {
    #[error("invalid playbook '{name}': {reason}")]
    Invalid { name: String, reason: String },
    #[error("failed to parse playbook: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
