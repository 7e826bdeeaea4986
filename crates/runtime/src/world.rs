//! World state: personas, buildings, occupancy, items.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use saiverse_config::{AppConfig, ModelRegistry};
use saiverse_llm::LlmClient;
use saiverse_memory::MemoryStore;
use saiverse_playbook::PlaybookStore;
use saiverse_tools::ToolRegistry;

use crate::db::WorldDb;
use crate::history::BuildingHistories;
use crate::permissions::PermissionBroker;
use crate::usage::UsageTracker;

/// Where a persona currently is in its execution lifecycle; mutated by the
/// graph executor at playbook start/end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub playbook: Option<String>,
    pub node: Option<String>,
    pub status: String,
}

impl ExecutionState {
    pub fn running(playbook: &str, node: &str) -> Self {
        Self {
            playbook: Some(playbook.to_string()),
            node: Some(node.to_string()),
            status: "running".to_string(),
        }
    }

    pub fn idle() -> Self {
        Self { playbook: None, node: None, status: "idle".to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionMode {
    Auto,
    Manual,
    Sleep,
}

pub struct Persona {
    pub persona_id: String,
    pub persona_name: String,
    pub home_building_id: String,
    pub timezone: chrono_tz::Tz,
    /// Preferred model id (config key).
    pub model: String,
    pub lightweight_model: Option<String>,
    pub persona_system_instruction: String,
    /// World-setting prompt template with `{current_*}` placeholders.
    pub common_prompt: Option<String>,
    pub linked_user_name: Option<String>,
    pub chronicle_enabled: bool,
    pub memory: Arc<MemoryStore>,
    pub llm: Arc<dyn LlmClient>,
    pub llm_light: Option<Arc<dyn LlmClient>>,

    pub current_building_id: Mutex<String>,
    pub interaction_mode: Mutex<InteractionMode>,
    pub inventory: Mutex<Vec<String>>,
    pub execution_state: Mutex<ExecutionState>,
    /// Metabolism anchors: model id -> oldest retained message id.
    pub anchors: Mutex<HashMap<String, String>>,
}

impl Persona {
    pub fn set_execution_state(&self, state: ExecutionState) {
        *self.execution_state.lock().expect("execution state lock poisoned") = state;
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.execution_state.lock().expect("execution state lock poisoned").clone()
    }

    pub fn current_building(&self) -> String {
        self.current_building_id.lock().expect("building lock poisoned").clone()
    }

    pub fn anchor_for(&self, model: &str) -> Option<String> {
        self.anchors.lock().expect("anchors lock poisoned").get(model).cloned()
    }

    pub fn set_anchor(&self, model: &str, message_id: &str) {
        self.anchors
            .lock()
            .expect("anchors lock poisoned")
            .insert(model.to_string(), message_id.to_string());
    }

    /// Client for one of the two model tiers; unrecognized tiers fall back
    /// to normal.
    pub fn client_for(&self, model_type: Option<&str>) -> Arc<dyn LlmClient> {
        match model_type {
            Some("lightweight") => self
                .llm_light
                .as_ref()
                .map(Arc::clone)
                .unwrap_or_else(|| Arc::clone(&self.llm)),
            _ => Arc::clone(&self.llm),
        }
    }

    pub fn inventory_snapshot(&self) -> Vec<String> {
        self.inventory.lock().expect("inventory lock poisoned").clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Building {
    pub building_id: String,
    pub name: String,
    pub system_instruction: String,
    pub capacity: u32,
    pub items: Vec<String>,
    pub image_path: Option<String>,
    pub linked_tools: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ItemInfo {
    pub name: String,
    pub description: String,
}

/// The city: every shared service plus the mutable maps of who is where.
pub struct World {
    pub config: AppConfig,
    pub models: ModelRegistry,
    pub histories: BuildingHistories,
    pub playbooks: PlaybookStore,
    pub tools: ToolRegistry,
    pub db: Arc<WorldDb>,
    pub usage: UsageTracker,
    pub permission_broker: PermissionBroker,

    personas: RwLock<HashMap<String, Arc<Persona>>>,
    buildings: RwLock<HashMap<String, Building>>,
    occupants: RwLock<HashMap<String, Vec<String>>>,
    items: RwLock<HashMap<String, ItemInfo>>,
    /// Free-form location lines an external gateway reports per persona,
    /// surfaced in the realtime context block.
    spatial_notes: RwLock<HashMap<String, Vec<String>>>,
}

impl World {
    pub fn new(
        config: AppConfig,
        models: ModelRegistry,
        db: Arc<WorldDb>,
        playbooks: PlaybookStore,
    ) -> Self {
        let usage = UsageTracker::new(Arc::clone(&db));
        Self {
            config,
            models,
            histories: BuildingHistories::new(),
            playbooks,
            tools: ToolRegistry::new(),
            db,
            usage,
            permission_broker: PermissionBroker::new(),
            personas: RwLock::new(HashMap::new()),
            buildings: RwLock::new(HashMap::new()),
            occupants: RwLock::new(HashMap::new()),
            items: RwLock::new(HashMap::new()),
            spatial_notes: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_persona(&self, persona: Arc<Persona>) {
        let building = persona.current_building();
        self.occupants
            .write()
            .expect("occupants lock poisoned")
            .entry(building)
            .or_default()
            .push(persona.persona_id.clone());
        info!(persona_id = %persona.persona_id, "persona registered");
        self.personas
            .write()
            .expect("personas lock poisoned")
            .insert(persona.persona_id.clone(), persona);
    }

    pub fn persona(&self, persona_id: &str) -> Option<Arc<Persona>> {
        self.personas.read().expect("personas lock poisoned").get(persona_id).cloned()
    }

    pub fn persona_ids(&self) -> Vec<String> {
        self.personas.read().expect("personas lock poisoned").keys().cloned().collect()
    }

    pub fn add_building(&self, building: Building) {
        self.buildings
            .write()
            .expect("buildings lock poisoned")
            .insert(building.building_id.clone(), building);
    }

    pub fn building(&self, building_id: &str) -> Option<Building> {
        self.buildings.read().expect("buildings lock poisoned").get(building_id).cloned()
    }

    pub fn add_item(&self, item_id: &str, info: ItemInfo) {
        self.items.write().expect("items lock poisoned").insert(item_id.to_string(), info);
    }

    pub fn item(&self, item_id: &str) -> Option<ItemInfo> {
        self.items.read().expect("items lock poisoned").get(item_id).cloned()
    }

    pub fn occupants_of(&self, building_id: &str) -> Vec<String> {
        self.occupants
            .read()
            .expect("occupants lock poisoned")
            .get(building_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Relocate a persona, updating the occupancy maps and its own pointer.
    pub fn move_persona(&self, persona_id: &str, to_building: &str) {
        let Some(persona) = self.persona(persona_id) else { return };
        let mut occupants = self.occupants.write().expect("occupants lock poisoned");
        let from = persona.current_building();
        if let Some(list) = occupants.get_mut(&from) {
            list.retain(|id| id != persona_id);
        }
        occupants.entry(to_building.to_string()).or_default().push(persona_id.to_string());
        *persona.current_building_id.lock().expect("building lock poisoned") = to_building.to_string();
    }

    pub fn set_spatial_notes(&self, persona_id: &str, notes: Vec<String>) {
        self.spatial_notes
            .write()
            .expect("spatial notes lock poisoned")
            .insert(persona_id.to_string(), notes);
    }

    pub fn spatial_notes(&self, persona_id: &str) -> Vec<String> {
        self.spatial_notes
            .read()
            .expect("spatial notes lock poisoned")
            .get(persona_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Effective building for a persona action: the persona's current
    /// location wins over the caller-supplied hint when they disagree.
    pub fn effective_building_id(&self, persona: &Persona, hint: &str) -> String {
        let current = persona.current_building();
        if current.is_empty() { hint.to_string() } else { current }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn occupancy_follows_moves() {
        let world = test_support::world();
        let persona = test_support::persona(&world, "p1", "cafe");
        world.add_persona(persona);
        world.add_building(Building {
            building_id: "library".to_string(),
            name: "Library".to_string(),
            ..Building::default()
        });

        assert_eq!(world.occupants_of("cafe"), vec!["p1".to_string()]);
        world.move_persona("p1", "library");
        assert!(world.occupants_of("cafe").is_empty());
        assert_eq!(world.occupants_of("library"), vec!["p1".to_string()]);
        assert_eq!(world.persona("p1").unwrap().current_building(), "library");
    }

    #[test]
    fn client_for_falls_back_to_normal_tier() {
        let world = test_support::world();
        let persona = test_support::persona(&world, "p1", "cafe");
        // No lightweight client configured: both tiers resolve to normal.
        let normal = persona.client_for(None);
        let light = persona.client_for(Some("lightweight"));
        assert_eq!(normal.model_key(), light.model_key());
        let unknown = persona.client_for(Some("giant"));
        assert_eq!(unknown.model_key(), normal.model_key());
    }

    #[test]
    fn execution_state_transitions() {
        let world = test_support::world();
        let persona = test_support::persona(&world, "p1", "cafe");
        assert_eq!(persona.execution_state().status, "idle");
        persona.set_execution_state(ExecutionState::running("daily_walk", "start"));
        let running = persona.execution_state();
        assert_eq!(running.status, "running");
        assert_eq!(running.playbook.as_deref(), Some("daily_walk"));
        persona.set_execution_state(ExecutionState::idle());
        assert_eq!(persona.execution_state().status, "idle");
    }
}
