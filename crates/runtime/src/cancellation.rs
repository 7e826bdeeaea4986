//! Cooperative cancellation for playbook execution.
//!
//! A token is set once (by the pulse controller, when a higher-priority
//! request preempts) and observed at node boundaries, between streamed
//! chunks, and before retries. Cancellation is never logged as a failure.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Raised when execution is interrupted by a higher-priority request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("execution interrupted by higher priority request")]
pub struct CancelledError {
    /// Request kind that caused the interruption ("user" / "schedule" / "auto").
    pub interrupted_by: Option<String>,
}

/// One-way cancellation flag with an "interrupted by" label.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    interrupted_by: Mutex<Option<String>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. The first caller's label wins; later calls are
    /// no-ops (the token is strictly one-way).
    pub fn cancel(&self, interrupted_by: Option<&str>) {
        let mut label = self.inner.interrupted_by.lock().expect("token lock poisoned");
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        *label = interrupted_by.map(str::to_string);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn interrupted_by(&self) -> Option<String> {
        self.inner.interrupted_by.lock().expect("token lock poisoned").clone()
    }

    /// Checkpoint: error out when the token is set.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError { interrupted_by: self.interrupted_by() })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_passes_checkpoints() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancel_sets_flag_and_label() {
        let token = CancellationToken::new();
        token.cancel(Some("user"));
        assert!(token.is_cancelled());
        let err = token.check().unwrap_err();
        assert_eq!(err.interrupted_by.as_deref(), Some("user"));
    }

    #[test]
    fn first_cancel_wins() {
        let token = CancellationToken::new();
        token.cancel(Some("user"));
        token.cancel(Some("schedule"));
        assert_eq!(token.interrupted_by().as_deref(), Some("user"));
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let observer = token.clone();
        token.cancel(None);
        assert!(observer.is_cancelled());
    }
}
