//! Shared fixtures for unit and integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use saiverse_config::{AppConfig, ModelConfig, ModelRegistry};
use saiverse_llm::testing::ScriptedClient;
use saiverse_memory::MemoryStore;
use saiverse_playbook::PlaybookStore;

use crate::builtin_tools::register_builtin_tools;
use crate::db::WorldDb;
use crate::world::{Building, ExecutionState, InteractionMode, Persona, World};

pub const TEST_MODEL: &str = "test-model";

pub fn test_model_config() -> ModelConfig {
    ModelConfig {
        model: "local/test-model".to_string(),
        provider: "ollama".to_string(),
        context_length: 32_000,
        ..ModelConfig::default()
    }
}

fn unique_temp_dir(prefix: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4().simple()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// A world with an in-memory database, one model config, and the builtin
/// tools registered. The "cafe" building exists.
pub fn world() -> Arc<World> {
    world_with_config(AppConfig::default())
}

pub fn world_with_config(config: AppConfig) -> Arc<World> {
    let mut models = ModelRegistry::new();
    models.insert(TEST_MODEL, test_model_config());

    let db = Arc::new(WorldDb::open_in_memory().expect("in-memory db"));
    let playbooks = PlaybookStore::new(unique_temp_dir("saiverse-playbooks"));
    let world = Arc::new(World::new(config, models, db, playbooks));
    world.add_building(Building {
        building_id: "cafe".to_string(),
        name: "喫茶ルミナ".to_string(),
        system_instruction: "静かな喫茶店。常連客と店主がいる。".to_string(),
        capacity: 8,
        ..Building::default()
    });
    register_builtin_tools(&world, &world.tools);
    world
}

/// A persona backed by a [`ScriptedClient`]; the client handle is returned
/// so tests can queue responses and inspect calls.
pub fn persona_with_client(
    _world: &Arc<World>,
    persona_id: &str,
    building_id: &str,
) -> (Arc<Persona>, Arc<ScriptedClient>) {
    let client = Arc::new(ScriptedClient::new(TEST_MODEL));
    let persona = Arc::new(Persona {
        persona_id: persona_id.to_string(),
        persona_name: format!("Persona {persona_id}"),
        home_building_id: building_id.to_string(),
        timezone: chrono_tz::Asia::Tokyo,
        model: TEST_MODEL.to_string(),
        lightweight_model: None,
        persona_system_instruction: "あなたは穏やかな住人です。".to_string(),
        common_prompt: None,
        linked_user_name: None,
        chronicle_enabled: false,
        memory: Arc::new(MemoryStore::open_in_memory().expect("in-memory store")),
        llm: client.clone(),
        llm_light: None,
        current_building_id: Mutex::new(building_id.to_string()),
        interaction_mode: Mutex::new(InteractionMode::Auto),
        inventory: Mutex::new(Vec::new()),
        execution_state: Mutex::new(ExecutionState::idle()),
        anchors: Mutex::new(HashMap::new()),
    });
    (persona, client)
}

/// Persona fixture without the client handle.
pub fn persona(world: &Arc<World>, persona_id: &str, building_id: &str) -> Arc<Persona> {
    persona_with_client(world, persona_id, building_id).0
}

