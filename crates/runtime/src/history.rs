//! Building history: the in-memory ordered log of utterances per building.
//!
//! Each building has its own lock; appends and ingestion-marker updates go
//! through it. Sequence numbers are monotonic per building. Ingestion is
//! idempotent: a persona pulls each utterance at most once.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Utterance {
    pub seq: u64,
    pub building_id: String,
    pub persona_id: String,
    pub role: String,
    pub content: String,
    pub created_at: f64,
    pub pulse_id: Option<String>,
    pub heard_by: BTreeSet<String>,
    pub ingested_by: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct BuildingLog {
    next_seq: u64,
    utterances: Vec<Utterance>,
}

/// All building logs, one mutex per building.
#[derive(Default)]
pub struct BuildingHistories {
    logs: RwLock<HashMap<String, Arc<Mutex<BuildingLog>>>>,
}

impl BuildingHistories {
    pub fn new() -> Self {
        Self::default()
    }

    fn log_for(&self, building_id: &str) -> Arc<Mutex<BuildingLog>> {
        if let Some(log) = self.logs.read().expect("histories lock poisoned").get(building_id) {
            return Arc::clone(log);
        }
        let mut logs = self.logs.write().expect("histories lock poisoned");
        Arc::clone(logs.entry(building_id.to_string()).or_default())
    }

    /// Append one utterance; returns its sequence number.
    pub fn append(
        &self,
        building_id: &str,
        persona_id: &str,
        role: &str,
        content: &str,
        pulse_id: Option<&str>,
        heard_by: BTreeSet<String>,
    ) -> u64 {
        let log = self.log_for(building_id);
        let mut log = log.lock().expect("building log lock poisoned");
        let seq = log.next_seq;
        log.next_seq += 1;
        log.utterances.push(Utterance {
            seq,
            building_id: building_id.to_string(),
            persona_id: persona_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            pulse_id: pulse_id.map(str::to_string),
            heard_by,
            ingested_by: BTreeSet::new(),
        });
        seq
    }

    /// Most recent `count` utterances, oldest first.
    pub fn recent(&self, building_id: &str, count: usize) -> Vec<Utterance> {
        let log = self.log_for(building_id);
        let log = log.lock().expect("building log lock poisoned");
        let start = log.utterances.len().saturating_sub(count);
        log.utterances[start..].to_vec()
    }

    /// Utterances this persona has not ingested yet (excluding its own),
    /// marked as ingested in the same critical section. Calling twice
    /// returns nothing new and grows no `ingested_by` set twice.
    pub fn ingest_for(&self, building_id: &str, persona_id: &str) -> Vec<Utterance> {
        let log = self.log_for(building_id);
        let mut log = log.lock().expect("building log lock poisoned");
        let mut fresh = Vec::new();
        for utterance in log.utterances.iter_mut() {
            if utterance.persona_id == persona_id {
                continue;
            }
            if utterance.ingested_by.insert(persona_id.to_string()) {
                fresh.push(utterance.clone());
            }
        }
        fresh
    }

    pub fn len(&self, building_id: &str) -> usize {
        let log = self.log_for(building_id);
        let log = log.lock().expect("building log lock poisoned");
        log.utterances.len()
    }

    pub fn is_empty(&self, building_id: &str) -> bool {
        self.len(building_id) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic_per_building() {
        let histories = BuildingHistories::new();
        let a = histories.append("cafe", "p1", "assistant", "one", None, BTreeSet::new());
        let b = histories.append("cafe", "p2", "assistant", "two", None, BTreeSet::new());
        let other = histories.append("library", "p1", "assistant", "three", None, BTreeSet::new());
        assert_eq!((a, b), (0, 1));
        assert_eq!(other, 0);
    }

    #[test]
    fn recent_returns_oldest_first_window() {
        let histories = BuildingHistories::new();
        for i in 0..5 {
            histories.append("cafe", "p1", "assistant", &format!("m{i}"), None, BTreeSet::new());
        }
        let recent = histories.recent("cafe", 2);
        let contents: Vec<_> = recent.iter().map(|u| u.content.as_str()).collect();
        assert_eq!(contents, ["m3", "m4"]);
    }

    #[test]
    fn ingestion_is_idempotent_and_skips_own_utterances() {
        let histories = BuildingHistories::new();
        histories.append("cafe", "p1", "assistant", "mine", None, BTreeSet::new());
        histories.append("cafe", "p2", "assistant", "theirs", None, BTreeSet::new());
        histories.append("cafe", "user", "user", "hello", None, BTreeSet::new());

        let first = histories.ingest_for("cafe", "p1");
        let contents: Vec<_> = first.iter().map(|u| u.content.as_str()).collect();
        assert_eq!(contents, ["theirs", "hello"]);

        let second = histories.ingest_for("cafe", "p1");
        assert!(second.is_empty(), "second ingestion must be a no-op");

        // Another persona still sees everything it has not ingested.
        let other = histories.ingest_for("cafe", "p2");
        let contents: Vec<_> = other.iter().map(|u| u.content.as_str()).collect();
        assert_eq!(contents, ["mine", "hello"]);

        // Markers accumulated exactly once per persona.
        let recent = histories.recent("cafe", 10);
        let hello = recent.iter().find(|u| u.content == "hello").unwrap();
        assert_eq!(hello.ingested_by.len(), 2);
    }
}
