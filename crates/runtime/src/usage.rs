//! LLM usage accounting.
//!
//! [`UsageTracker`] buffers records and flushes batches to the world
//! database; recording only takes the short buffer lock, so a slow flush
//! never blocks an executing pulse. [`PulseUsage`] is the per-pulse
//! accumulator shared across sub-playbooks.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error};

use crate::db::WorldDb;

#[derive(Debug, Clone, Default)]
pub struct UsageRecord {
    pub ts: f64,
    pub persona_id: Option<String>,
    pub building_id: Option<String>,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
    pub node_type: Option<String>,
    pub playbook_name: Option<String>,
    pub category: Option<String>,
}

/// Running totals for one pulse.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PulseUsage {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cached_tokens: u64,
    pub total_cache_write_tokens: u64,
    pub total_cost_usd: f64,
    pub call_count: u64,
    pub models_used: Vec<String>,
}

impl PulseUsage {
    pub fn accumulate(
        &mut self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
        cache_write_tokens: u64,
        cost_usd: f64,
    ) {
        self.total_input_tokens += input_tokens;
        self.total_output_tokens += output_tokens;
        self.total_cached_tokens += cached_tokens;
        self.total_cache_write_tokens += cache_write_tokens;
        self.total_cost_usd += cost_usd;
        self.call_count += 1;
        if !self.models_used.iter().any(|m| m == model) {
            self.models_used.push(model.to_string());
        }
    }
}

pub struct UsageTracker {
    pending: Mutex<Vec<UsageRecord>>,
    db: Arc<WorldDb>,
    batch_size: usize,
}

impl UsageTracker {
    pub fn new(db: Arc<WorldDb>) -> Self {
        Self { pending: Mutex::new(Vec::new()), db, batch_size: 1 }
    }

    pub fn with_batch_size(db: Arc<WorldDb>, batch_size: usize) -> Self {
        Self { pending: Mutex::new(Vec::new()), db, batch_size: batch_size.max(1) }
    }

    /// Queue one record; flushes when the batch threshold is reached.
    pub fn record(&self, record: UsageRecord) {
        debug!(
            model = %record.model_id,
            input = record.input_tokens,
            output = record.output_tokens,
            cached = record.cached_tokens,
            cost = record.cost_usd,
            persona = record.persona_id.as_deref().unwrap_or("-"),
            "usage recorded"
        );
        let ready = {
            let mut pending = self.pending.lock().expect("usage buffer lock poisoned");
            pending.push(record);
            if pending.len() >= self.batch_size {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };
        if let Some(batch) = ready {
            self.write(batch);
        }
    }

    /// Force-flush everything buffered.
    pub fn flush(&self) {
        let batch = std::mem::take(&mut *self.pending.lock().expect("usage buffer lock poisoned"));
        if !batch.is_empty() {
            self.write(batch);
        }
    }

    fn write(&self, batch: Vec<UsageRecord>) {
        let count = batch.len();
        if let Err(err) = self.db.write_usage_batch(&batch) {
            error!(error = %err, count, "failed to write usage records");
        } else {
            debug!(count, "flushed usage records");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("usage buffer lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(batch: usize) -> (Arc<WorldDb>, UsageTracker) {
        let db = Arc::new(WorldDb::open_in_memory().unwrap());
        let tracker = UsageTracker::with_batch_size(Arc::clone(&db), batch);
        (db, tracker)
    }

    fn record(model: &str) -> UsageRecord {
        UsageRecord { model_id: model.to_string(), input_tokens: 10, output_tokens: 5, ..Default::default() }
    }

    #[test]
    fn batch_of_one_flushes_immediately() {
        let (db, tracker) = tracker(1);
        tracker.record(record("flash"));
        assert_eq!(db.usage_row_count().unwrap(), 1);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn larger_batches_buffer_until_threshold() {
        let (db, tracker) = tracker(3);
        tracker.record(record("flash"));
        tracker.record(record("flash"));
        assert_eq!(db.usage_row_count().unwrap(), 0);
        tracker.record(record("flash"));
        assert_eq!(db.usage_row_count().unwrap(), 3);
    }

    #[test]
    fn explicit_flush_drains_the_buffer() {
        let (db, tracker) = tracker(100);
        tracker.record(record("flash"));
        tracker.flush();
        assert_eq!(db.usage_row_count().unwrap(), 1);
        tracker.flush();
        assert_eq!(db.usage_row_count().unwrap(), 1);
    }

    #[test]
    fn pulse_usage_accumulates_and_dedups_models() {
        let mut usage = PulseUsage::default();
        usage.accumulate("flash", 100, 20, 10, 5, 0.001);
        usage.accumulate("flash", 50, 10, 0, 0, 0.0005);
        usage.accumulate("pro", 10, 2, 0, 0, 0.01);

        assert_eq!(usage.call_count, 3);
        assert_eq!(usage.total_input_tokens, 160);
        assert_eq!(usage.total_output_tokens, 32);
        assert_eq!(usage.total_cached_tokens, 10);
        assert_eq!(usage.models_used, vec!["flash".to_string(), "pro".to_string()]);
        assert!((usage.total_cost_usd - 0.0115).abs() < 1e-9);
    }
}
