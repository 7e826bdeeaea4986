//! On-disk playbook store.
//!
//! One JSON file per playbook under the configured directory. Parsed and
//! validated definitions are held in an LRU cache; saving invalidates the
//! entry. Scope visibility (public / personal / building) is enforced at
//! load time, and `basic_chat` always resolves to the builtin fallback when
//! no file overrides it.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{debug, warn};

use crate::model::{InputParam, NodeDef, NodeType, PlaybookSchema, PlaybookScope};
use crate::validate::validate;
use crate::PlaybookError;

const CACHE_CAPACITY: usize = 64;

pub struct PlaybookStore {
    dir: PathBuf,
    cache: Mutex<LruCache<String, Arc<PlaybookSchema>>>,
}

impl PlaybookStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        }
    }

    /// Load a playbook by name, honoring scope visibility for the given
    /// persona and building. `basic_chat` falls back to the builtin when no
    /// file defines it.
    pub fn load_for(
        &self,
        name: &str,
        persona_id: &str,
        building_id: &str,
    ) -> Option<Arc<PlaybookSchema>> {
        let playbook = match self.load_raw(name) {
            Some(playbook) => playbook,
            None if name == "basic_chat" => Arc::new(basic_chat()),
            None => return None,
        };
        if !visible(&playbook, persona_id, building_id) {
            debug!(name, persona_id, building_id, "playbook exists but is out of scope");
            return None;
        }
        Some(playbook)
    }

    fn load_raw(&self, name: &str) -> Option<Arc<PlaybookSchema>> {
        if let Some(cached) = self.cache.lock().expect("playbook cache poisoned").get(name) {
            return Some(Arc::clone(cached));
        }
        let path = self.path_for(name);
        if !path.exists() {
            return None;
        }
        match Self::parse_file(&path) {
            Ok(playbook) => {
                let playbook = Arc::new(playbook);
                self.cache
                    .lock()
                    .expect("playbook cache poisoned")
                    .put(name.to_string(), Arc::clone(&playbook));
                Some(playbook)
            }
            Err(err) => {
                warn!(name, error = %err, "failed to load playbook");
                None
            }
        }
    }

    fn parse_file(path: &Path) -> Result<PlaybookSchema, PlaybookError> {
        let raw = std::fs::read_to_string(path)?;
        let playbook: PlaybookSchema = serde_json::from_str(&raw)?;
        let report = validate(&playbook)?;
        for warning in &report.warnings {
            warn!(playbook = %playbook.name, warning, "playbook validation warning");
        }
        Ok(playbook)
    }

    /// Validate and persist a playbook; the cache entry is replaced.
    pub fn save(&self, playbook: &PlaybookSchema) -> Result<(), PlaybookError> {
        validate(playbook)?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&playbook.name);
        let rendered = serde_json::to_string_pretty(playbook)?;
        std::fs::write(path, rendered)?;
        self.cache
            .lock()
            .expect("playbook cache poisoned")
            .put(playbook.name.clone(), Arc::new(playbook.clone()));
        Ok(())
    }

    pub fn list_names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Playbooks the router may select for this persona in this building:
    /// visible, router-callable, not dev-only. Returned as (name,
    /// description) pairs for the `available_playbooks` prompt block.
    pub fn router_callable_for(&self, persona_id: &str, building_id: &str) -> Vec<(String, String)> {
        self.list_names()
            .into_iter()
            .filter_map(|name| self.load_for(&name, persona_id, building_id))
            .filter(|pb| pb.router_callable && !pb.dev_only)
            .map(|pb| (pb.name.clone(), pb.description.clone()))
            .collect()
    }

    pub fn invalidate(&self, name: &str) {
        self.cache.lock().expect("playbook cache poisoned").pop(name);
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

fn visible(playbook: &PlaybookSchema, persona_id: &str, building_id: &str) -> bool {
    match playbook.scope {
        PlaybookScope::Public => true,
        PlaybookScope::Personal => playbook.owner_persona_id.as_deref() == Some(persona_id),
        PlaybookScope::Building => playbook.building_id.as_deref() == Some(building_id),
    }
}

/// Builtin fallback used when a named playbook cannot be resolved.
pub fn basic_chat() -> PlaybookSchema {
    let mut playbook = PlaybookSchema::default();
    playbook.name = "basic_chat".to_string();
    playbook.description = "Reply based on input".to_string();
    playbook.input_schema = vec![InputParam {
        name: "input".to_string(),
        description: Some("User or system input".to_string()),
        source: None,
    }];
    playbook.start_node = "llm".to_string();
    playbook.nodes = vec![
        NodeDef::new("llm", NodeType::Llm)
            .with_action("You are a helpful persona. Respond briefly to: {input}")
            .with_next("speak"),
        NodeDef::new("speak", NodeType::Speak),
    ];
    playbook
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(playbooks: &[PlaybookSchema]) -> (tempfile::TempDir, PlaybookStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaybookStore::new(dir.path());
        for playbook in playbooks {
            store.save(playbook).unwrap();
        }
        (dir, store)
    }

    fn named(name: &str) -> PlaybookSchema {
        let mut playbook = basic_chat();
        playbook.name = name.to_string();
        playbook
    }

    #[test]
    fn save_load_roundtrip_through_disk_and_cache() {
        let (_dir, store) = store_with(&[named("daily_walk")]);
        let loaded = store.load_for("daily_walk", "p1", "b1").unwrap();
        assert_eq!(loaded.name, "daily_walk");
        // Second load hits the cache and returns the same Arc.
        let again = store.load_for("daily_walk", "p1", "b1").unwrap();
        assert!(Arc::ptr_eq(&loaded, &again));
    }

    #[test]
    fn basic_chat_falls_back_to_the_builtin() {
        let (_dir, store) = store_with(&[]);
        let fallback = store.load_for("basic_chat", "p1", "b1").unwrap();
        assert_eq!(fallback.start_node, "llm");
        assert!(store.load_for("missing", "p1", "b1").is_none());
    }

    #[test]
    fn personal_scope_is_owner_only() {
        let mut personal = named("diary");
        personal.scope = PlaybookScope::Personal;
        personal.owner_persona_id = Some("p1".to_string());
        let (_dir, store) = store_with(&[personal]);

        assert!(store.load_for("diary", "p1", "anywhere").is_some());
        assert!(store.load_for("diary", "p2", "anywhere").is_none());
    }

    #[test]
    fn building_scope_is_location_bound() {
        let mut local = named("bar_menu");
        local.scope = PlaybookScope::Building;
        local.building_id = Some("bar".to_string());
        let (_dir, store) = store_with(&[local]);

        assert!(store.load_for("bar_menu", "p1", "bar").is_some());
        assert!(store.load_for("bar_menu", "p1", "library").is_none());
    }

    #[test]
    fn router_listing_filters_flags() {
        let mut callable = named("weather_report");
        callable.router_callable = true;
        let mut dev = named("debug_probe");
        dev.router_callable = true;
        dev.dev_only = true;
        let plain = named("quiet_one");
        let (_dir, store) = store_with(&[callable, dev, plain]);

        let listed = store.router_callable_for("p1", "b1");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "weather_report");
    }

    #[test]
    fn invalid_playbooks_do_not_save() {
        let (_dir, store) = store_with(&[]);
        let mut broken = named("broken");
        broken.start_node = "nope".to_string();
        assert!(store.save(&broken).is_err());
    }
}
