//! Per-city playbook permissions.
//!
//! EXEC consults the permission level before running a named playbook.
//! `ask_every_time` goes through the broker: an event is emitted to the UI
//! and the answer (or a timeout, treated as deny) comes back through
//! [`PermissionBroker::resolve`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{EventCallback, RuntimeEvent, emit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionLevel {
    Blocked,
    AskEveryTime,
    UserOnly,
    AutoAllow,
}

impl PermissionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::Blocked => "blocked",
            PermissionLevel::AskEveryTime => "ask_every_time",
            PermissionLevel::UserOnly => "user_only",
            PermissionLevel::AutoAllow => "auto_allow",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "blocked" => Some(PermissionLevel::Blocked),
            "ask_every_time" => Some(PermissionLevel::AskEveryTime),
            "user_only" => Some(PermissionLevel::UserOnly),
            "auto_allow" => Some(PermissionLevel::AutoAllow),
            _ => None,
        }
    }
}

/// Answer to one permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    /// Allow and promote the playbook to `auto_allow`.
    AlwaysAllow,
    Deny,
    /// Deny and demote the playbook to `user_only`.
    NeverUse,
    Timeout,
}

impl PermissionDecision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "allow" => Some(PermissionDecision::Allow),
            "always_allow" => Some(PermissionDecision::AlwaysAllow),
            "deny" => Some(PermissionDecision::Deny),
            "never_use" => Some(PermissionDecision::NeverUse),
            _ => None,
        }
    }
}

/// Routes permission prompts between an executing EXEC node and whatever
/// surface answers them.
#[derive(Default)]
pub struct PermissionBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>,
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the user whether `playbook` may run. No callback (headless run)
    /// and elapsed timeouts both come back as `Timeout`.
    pub async fn ask(
        &self,
        playbook: &str,
        persona_id: &str,
        callback: &Option<EventCallback>,
        timeout: Duration,
    ) -> PermissionDecision {
        if callback.is_none() {
            return PermissionDecision::Timeout;
        }
        let request_id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("permission broker lock poisoned")
            .insert(request_id.clone(), tx);

        emit(
            callback,
            RuntimeEvent::PermissionRequest {
                request_id: request_id.clone(),
                playbook: playbook.to_string(),
                persona_id: persona_id.to_string(),
            },
        );
        info!(playbook, persona_id, request_id = %request_id, "permission prompt issued");

        let decision = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => PermissionDecision::Timeout,
            Err(_) => {
                warn!(playbook, request_id = %request_id, "permission prompt timed out");
                PermissionDecision::Timeout
            }
        };
        self.pending
            .lock()
            .expect("permission broker lock poisoned")
            .remove(&request_id);
        decision
    }

    /// Deliver the user's answer. Returns false when the prompt is unknown
    /// or already resolved.
    pub fn resolve(&self, request_id: &str, decision: PermissionDecision) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("permission broker lock poisoned")
            .remove(request_id);
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("permission broker lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn levels_and_decisions_parse() {
        assert_eq!(PermissionLevel::parse("blocked"), Some(PermissionLevel::Blocked));
        assert_eq!(PermissionLevel::parse("auto_allow"), Some(PermissionLevel::AutoAllow));
        assert_eq!(PermissionLevel::parse("nope"), None);
        assert_eq!(PermissionDecision::parse("never_use"), Some(PermissionDecision::NeverUse));
        assert_eq!(PermissionLevel::AskEveryTime.as_str(), "ask_every_time");
    }

    #[tokio::test]
    async fn resolve_answers_a_pending_prompt() {
        let broker = Arc::new(PermissionBroker::new());
        let captured: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let captured_for_cb = Arc::clone(&captured);
        let broker_for_cb = Arc::clone(&broker);
        let callback: EventCallback = Arc::new(move |event| {
            if let RuntimeEvent::PermissionRequest { request_id, .. } = event {
                *captured_for_cb.lock().unwrap() = Some(request_id.clone());
                // Answer immediately, as the UI would.
                broker_for_cb.resolve(&request_id, PermissionDecision::Allow);
            }
        });

        let decision = broker
            .ask("weather_report", "p1", &Some(callback), Duration::from_secs(1))
            .await;
        assert_eq!(decision, PermissionDecision::Allow);
        assert!(captured.lock().unwrap().is_some());
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn missing_callback_is_a_timeout() {
        let broker = PermissionBroker::new();
        let decision = broker
            .ask("weather_report", "p1", &None, Duration::from_millis(10))
            .await;
        assert_eq!(decision, PermissionDecision::Timeout);
    }

    #[tokio::test]
    async fn unanswered_prompt_times_out_as_deny_equivalent() {
        let broker = PermissionBroker::new();
        let callback: EventCallback = Arc::new(|_| {});
        let decision = broker
            .ask("weather_report", "p1", &Some(callback), Duration::from_millis(20))
            .await;
        assert_eq!(decision, PermissionDecision::Timeout);
        assert_eq!(broker.pending_count(), 0);
    }

    #[test]
    fn resolving_an_unknown_prompt_is_false() {
        let broker = PermissionBroker::new();
        assert!(!broker.resolve("ghost", PermissionDecision::Allow));
    }
}
