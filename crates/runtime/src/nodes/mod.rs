//! Node implementations for the graph executor.

mod flow;
mod llm;
mod stelis;
mod subplay;
mod tool;

use std::sync::Arc;

use saiverse_playbook::{NodeDef, NodeType};

use crate::RuntimeError;
use crate::runtime::{NodeEnv, Runtime};
use crate::state::ExecState;

pub async fn dispatch(
    rt: &Arc<Runtime>,
    env: &NodeEnv,
    node: &NodeDef,
    state: &mut ExecState,
) -> Result<(), RuntimeError> {
    match node.kind {
        NodeType::Set => flow::set_node(node, state),
        NodeType::Llm => llm::llm_node(rt, env, node, state).await,
        NodeType::Tool => tool::tool_node(rt, env, node, state).await,
        NodeType::ToolCall => tool::tool_call_node(rt, env, node, state).await,
        NodeType::Memorize => flow::memorize_node(rt, env, node, state),
        NodeType::Subplay => subplay::subplay_node(rt, env, node, state).await,
        NodeType::Exec => subplay::exec_node(rt, env, node, state).await,
        NodeType::Speak => flow::speak_node(rt, env, state),
        NodeType::Say => flow::say_node(rt, env, node, state),
        NodeType::Think => flow::think_node(rt, env, node, state),
        NodeType::Pass => Ok(()),
        NodeType::StelisStart => stelis::stelis_start_node(rt, env, node, state),
        NodeType::StelisEnd => stelis::stelis_end_node(rt, env, node, state).await,
    }
}
