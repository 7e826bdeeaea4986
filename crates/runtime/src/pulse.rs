//! The pulse controller: per-persona priority scheduling with preemption.
//!
//! Each persona is a serial lane. The lane lock is held only around state
//! transitions, never during execution, so a higher-priority stimulus can
//! cancel the running pulse immediately. Preempted schedule work re-queues
//! at the head of the lane and resumes with an annotated prompt.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::RuntimeError;
use crate::cancellation::CancellationToken;
use crate::events::EventCallback;
use crate::runtime::Runtime;

/// Queue capacity per persona; overflow drops the oldest entry.
pub const QUEUE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseType {
    User,
    Schedule,
    Auto,
}

impl PulseType {
    pub fn as_str(self) -> &'static str {
        match self {
            PulseType::User => "user",
            PulseType::Schedule => "schedule",
            PulseType::Auto => "auto",
        }
    }

    /// Lower wins.
    pub fn priority(self) -> u8 {
        match self {
            PulseType::User => 1,
            PulseType::Schedule => 2,
            PulseType::Auto => 3,
        }
    }

    /// Same-priority arbitration: does a newcomer of this type replace a
    /// running request of the same type?
    pub fn last_wins(self) -> bool {
        matches!(self, PulseType::User)
    }

    /// Blocked/preempted behavior: wait (re-queue) or skip.
    pub fn waits_when_blocked(self) -> bool {
        matches!(self, PulseType::Schedule)
    }
}

#[derive(Clone)]
pub struct ExecutionRequest {
    pub pulse_type: PulseType,
    pub persona_id: String,
    pub building_id: String,
    pub user_input: Option<String>,
    pub metadata: Option<Value>,
    pub meta_playbook: Option<String>,
    pub playbook_params: Option<Map<String, Value>>,
    pub event_callback: Option<EventCallback>,
    pub pulse_id: String,
    pub token: CancellationToken,
    pub is_resumption: bool,
    pub original_prompt: Option<String>,
}

impl ExecutionRequest {
    pub fn new(pulse_type: PulseType, persona_id: impl Into<String>, building_id: impl Into<String>) -> Self {
        Self {
            pulse_type,
            persona_id: persona_id.into(),
            building_id: building_id.into(),
            user_input: None,
            metadata: None,
            meta_playbook: None,
            playbook_params: None,
            event_callback: None,
            pulse_id: Uuid::new_v4().to_string(),
            token: CancellationToken::new(),
            is_resumption: false,
            original_prompt: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.user_input = Some(input.into());
        self
    }

    pub fn with_callback(mut self, callback: EventCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    /// The resumption copy queued when this request is preempted.
    fn resumption_copy(&self) -> Self {
        Self {
            pulse_type: self.pulse_type,
            persona_id: self.persona_id.clone(),
            building_id: self.building_id.clone(),
            user_input: self.user_input.clone(),
            metadata: self.metadata.clone(),
            meta_playbook: self.meta_playbook.clone(),
            playbook_params: self.playbook_params.clone(),
            event_callback: self.event_callback.clone(),
            pulse_id: Uuid::new_v4().to_string(),
            token: CancellationToken::new(),
            is_resumption: true,
            original_prompt: self.user_input.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Executed(Vec<String>),
    Queued,
    Skipped,
}

#[derive(Default)]
struct Lane {
    current: Option<ExecutionRequest>,
    queue: VecDeque<ExecutionRequest>,
}

pub struct PulseController {
    runtime: Arc<Runtime>,
    lanes: Mutex<HashMap<String, Lane>>,
}

enum Action {
    Execute,
    Queued,
    Skipped,
}

impl PulseController {
    pub fn new(runtime: Arc<Runtime>) -> Arc<Self> {
        Arc::new(Self { runtime, lanes: Mutex::new(HashMap::new()) })
    }

    // ── convenience constructors ────────────────────────────────────────────

    pub async fn submit_user(
        self: &Arc<Self>,
        persona_id: &str,
        building_id: &str,
        user_input: &str,
        event_callback: Option<EventCallback>,
    ) -> SubmitOutcome {
        let mut request =
            ExecutionRequest::new(PulseType::User, persona_id, building_id).with_input(user_input);
        request.event_callback = event_callback;
        self.submit(request).await
    }

    pub async fn submit_schedule(
        self: &Arc<Self>,
        persona_id: &str,
        building_id: &str,
        user_input: &str,
    ) -> SubmitOutcome {
        let request = ExecutionRequest::new(PulseType::Schedule, persona_id, building_id)
            .with_input(user_input);
        self.submit(request).await
    }

    pub async fn submit_auto(self: &Arc<Self>, persona_id: &str, building_id: &str) -> SubmitOutcome {
        self.submit(ExecutionRequest::new(PulseType::Auto, persona_id, building_id)).await
    }

    // ── scheduling core ─────────────────────────────────────────────────────

    /// Decide run/queue/skip/preempt under the lane lock, then execute
    /// outside it.
    pub async fn submit(self: &Arc<Self>, request: ExecutionRequest) -> SubmitOutcome {
        enum Decision {
            Run,
            Preempt { token: CancellationToken, interrupted: PulseType, resumed: Option<ExecutionRequest> },
            Queue,
            Skip { busy_with: PulseType },
        }

        let action = {
            let mut lanes = self.lanes.lock().expect("pulse lanes lock poisoned");
            let lane = lanes.entry(request.persona_id.clone()).or_default();

            let decision = match &lane.current {
                None => Decision::Run,
                Some(current) if should_interrupt(current.pulse_type, request.pulse_type) => {
                    Decision::Preempt {
                        token: current.token.clone(),
                        interrupted: current.pulse_type,
                        resumed: current
                            .pulse_type
                            .waits_when_blocked()
                            .then(|| current.resumption_copy()),
                    }
                }
                Some(_) if request.pulse_type.waits_when_blocked() => Decision::Queue,
                Some(current) => Decision::Skip { busy_with: current.pulse_type },
            };

            match decision {
                Decision::Run => {
                    lane.current = Some(request.clone());
                    Action::Execute
                }
                Decision::Preempt { token, interrupted, resumed } => {
                    info!(
                        persona_id = %request.persona_id,
                        interrupted = interrupted.as_str(),
                        by = request.pulse_type.as_str(),
                        "preempting running pulse"
                    );
                    token.cancel(Some(request.pulse_type.as_str()));
                    if let Some(resumed) = resumed {
                        info!(persona_id = %request.persona_id, "queued preempted request for resumption");
                        lane.queue.push_front(resumed);
                    }
                    lane.current = Some(request.clone());
                    Action::Execute
                }
                Decision::Queue => {
                    if lane.queue.len() >= QUEUE_LIMIT {
                        error!(
                            persona_id = %request.persona_id,
                            limit = QUEUE_LIMIT,
                            "pulse queue overflow, dropping oldest request"
                        );
                        lane.queue.pop_front();
                    }
                    lane.queue.push_back(request.clone());
                    info!(
                        persona_id = %request.persona_id,
                        queue_len = lane.queue.len(),
                        "queued request behind running pulse"
                    );
                    Action::Queued
                }
                Decision::Skip { busy_with } => {
                    debug!(
                        persona_id = %request.persona_id,
                        busy_with = busy_with.as_str(),
                        "skipping request, lane busy"
                    );
                    Action::Skipped
                }
            }
        };

        match action {
            Action::Execute => SubmitOutcome::Executed(self.clone().execute_unlocked(request).await),
            Action::Queued => SubmitOutcome::Queued,
            Action::Skipped => SubmitOutcome::Skipped,
        }
    }

    /// Run a request with no lock held; release the lane and drain the queue
    /// afterwards.
    async fn execute_unlocked(self: Arc<Self>, request: ExecutionRequest) -> Vec<String> {
        let outputs = match self.do_execute(&request).await {
            Ok(outputs) => outputs,
            Err(RuntimeError::Cancelled(cancelled)) => {
                info!(
                    persona_id = %request.persona_id,
                    interrupted_by = cancelled.interrupted_by.as_deref().unwrap_or("-"),
                    "pulse cancelled"
                );
                self.record_interruption(&request, cancelled.interrupted_by.as_deref());
                Vec::new()
            }
            Err(err) => {
                error!(
                    persona_id = %request.persona_id,
                    pulse_type = request.pulse_type.as_str(),
                    error = %err,
                    "pulse execution failed"
                );
                Vec::new()
            }
        };

        // Release the lane (only if it is still ours) and hand the next
        // queued request its own task.
        let next = {
            let mut lanes = self.lanes.lock().expect("pulse lanes lock poisoned");
            let lane = lanes.entry(request.persona_id.clone()).or_default();
            if lane.current.as_ref().is_some_and(|c| c.pulse_id == request.pulse_id) {
                lane.current = None;
            }
            if lane.current.is_none() {
                if let Some(next) = lane.queue.pop_front() {
                    lane.current = Some(next.clone());
                    Some(next)
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some(next) = next {
            info!(persona_id = %next.persona_id, pulse_type = next.pulse_type.as_str(), "processing queued request");
            self.spawn_drain(next);
        }

        outputs
    }

    /// Run a dequeued request in its own task. Boxed to a trait object so
    /// the drain chain does not make `execute_unlocked`'s future recursive.
    fn spawn_drain(self: &Arc<Self>, next: ExecutionRequest) {
        let controller = Arc::clone(self);
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(async move {
                controller.execute_unlocked(next).await;
            });
        tokio::spawn(fut);
    }

    async fn do_execute(&self, request: &ExecutionRequest) -> Result<Vec<String>, RuntimeError> {
        let Some(persona) = self.runtime.world.persona(&request.persona_id) else {
            warn!(persona_id = %request.persona_id, "persona not found");
            return Ok(Vec::new());
        };

        let user_input = if request.is_resumption {
            request.original_prompt.as_deref().map(resumption_prompt)
        } else {
            request.user_input.clone()
        };

        match request.pulse_type {
            PulseType::Auto => {
                self.runtime
                    .run_meta_auto(
                        persona,
                        &request.building_id,
                        request.event_callback.clone(),
                        request.token.clone(),
                        &request.pulse_id,
                    )
                    .await?;
                Ok(Vec::new())
            }
            PulseType::User | PulseType::Schedule => {
                self.runtime
                    .run_meta_user(
                        persona,
                        user_input.as_deref(),
                        &request.building_id,
                        request.meta_playbook.as_deref(),
                        request.playbook_params.clone(),
                        request.event_callback.clone(),
                        request.token.clone(),
                        Some(request.pulse_type.as_str()),
                        &request.pulse_id,
                    )
                    .await
            }
        }
    }

    /// Persist the interruption note before the lane moves on.
    fn record_interruption(&self, request: &ExecutionRequest, interrupted_by: Option<&str>) {
        let Some(persona) = self.runtime.world.persona(&request.persona_id) else { return };
        let will_resume = request.pulse_type.waits_when_blocked();
        let by = interrupted_by.unwrap_or("unknown");
        let content = format!("(中断: {by}からのリクエストを優先しました)");
        let metadata = json!({
            "interrupted_by": by,
            "will_resume": will_resume,
        });
        if !self.runtime.store_memory(
            &persona,
            &content,
            "assistant",
            &["internal", "interrupted"],
            Some(&request.pulse_id),
            Some(metadata),
        ) {
            warn!(persona_id = %request.persona_id, "failed to record interruption message");
        }
    }

    pub fn queue_len(&self, persona_id: &str) -> usize {
        self.lanes
            .lock()
            .expect("pulse lanes lock poisoned")
            .get(persona_id)
            .map(|lane| lane.queue.len())
            .unwrap_or(0)
    }

    pub fn is_busy(&self, persona_id: &str) -> bool {
        self.lanes
            .lock()
            .expect("pulse lanes lock poisoned")
            .get(persona_id)
            .is_some_and(|lane| lane.current.is_some())
    }
}

/// Higher priority always preempts; same priority follows the newcomer's
/// "last wins" policy; lower never does.
fn should_interrupt(current: PulseType, incoming: PulseType) -> bool {
    if incoming.priority() < current.priority() {
        return true;
    }
    incoming.priority() == current.priority() && incoming.last_wins()
}

/// The only textual difference between a first run and a resumption: the
/// original prompt arrives wrapped in a system annotation naming the
/// interruption.
fn resumption_prompt(original: &str) -> String {
    format!(
        "<system>\n[前回の処理が中断されました]\n中断理由: 優先度の高いリクエストを処理しました\n前回のプロンプト: {original}\n</system>\n\n{original}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_table_matches_the_policy() {
        assert!(PulseType::User.priority() < PulseType::Schedule.priority());
        assert!(PulseType::Schedule.priority() < PulseType::Auto.priority());

        // Higher priority interrupts.
        assert!(should_interrupt(PulseType::Schedule, PulseType::User));
        assert!(should_interrupt(PulseType::Auto, PulseType::Schedule));
        // Same priority: only user-vs-user (last wins).
        assert!(should_interrupt(PulseType::User, PulseType::User));
        assert!(!should_interrupt(PulseType::Schedule, PulseType::Schedule));
        assert!(!should_interrupt(PulseType::Auto, PulseType::Auto));
        // Lower never interrupts.
        assert!(!should_interrupt(PulseType::User, PulseType::Auto));
        assert!(!should_interrupt(PulseType::User, PulseType::Schedule));
    }

    #[test]
    fn blocked_policy_is_wait_only_for_schedule() {
        assert!(!PulseType::User.waits_when_blocked());
        assert!(PulseType::Schedule.waits_when_blocked());
        assert!(!PulseType::Auto.waits_when_blocked());
    }

    #[test]
    fn resumption_copy_carries_the_original_prompt() {
        let request = ExecutionRequest::new(PulseType::Schedule, "p1", "cafe")
            .with_input("water the plants");
        let resumed = request.resumption_copy();
        assert!(resumed.is_resumption);
        assert_eq!(resumed.original_prompt.as_deref(), Some("water the plants"));
        assert_ne!(resumed.pulse_id, request.pulse_id);
        assert!(!resumed.token.is_cancelled());
    }

    #[test]
    fn resumption_prompt_wraps_the_original_in_a_system_block() {
        let prompt = resumption_prompt("water the plants");
        assert!(prompt.starts_with("<system>"));
        assert!(prompt.contains("前回の処理が中断されました"));
        assert!(prompt.ends_with("water the plants"));
    }
}
