//! Pulse execution and orchestration engine.
//!
//! The pieces, leaves first: cancellation tokens, runtime events, the
//! execution state map, the building history, the usage tracker, the world
//! (personas, buildings, occupancy), the context builder, the graph executor
//! with its node implementations, the playbook permission broker, and on top
//! of everything the pulse controller that serializes stimuli per persona.

pub mod builtin_tools;
pub mod cancellation;
pub mod context;
pub mod db;
pub mod events;
pub mod graph;
pub mod history;
pub mod nodes;
pub mod permissions;
pub mod pulse;
pub mod runtime;
pub mod state;
#[doc(hidden)]
pub mod test_support;
pub mod usage;
pub mod world;

pub use cancellation::{CancellationToken, CancelledError};
pub use events::{ActivityEntry, EventCallback, RuntimeEvent};
pub use pulse::{ExecutionRequest, PulseController, PulseType, SubmitOutcome};
pub use runtime::Runtime;
pub use state::ExecState;
pub use usage::{PulseUsage, UsageRecord, UsageTracker};
pub use world::{Building, Persona, World};

use saiverse_llm::LlmError;

/// Error surface of one playbook execution.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Cooperative cancellation; never a failure.
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    /// LLM failure wrapping the original cause with a user-facing message.
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("{0}")]
    Playbook(String),
    #[error("{0}")]
    Internal(String),
}

impl RuntimeError {
    /// The message a UI should show for this failure.
    pub fn user_message(&self) -> String {
        match self {
            RuntimeError::Cancelled(_) => String::new(),
            RuntimeError::Llm(err) => err.user_message.clone(),
            RuntimeError::Playbook(msg) | RuntimeError::Internal(msg) => {
                format!("プレイブックの実行中にエラーが発生しました: {msg}")
            }
        }
    }
}
