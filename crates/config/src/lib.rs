use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod models;

pub use models::{
    CacheConfig, CacheKind, ModelConfig, ModelPricing, ModelRegistry, calculate_cost,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CityConfig {
    pub city_id: String,
    pub city_name: String,
    /// Display name used for the `{linked_user_name}` prompt placeholder.
    pub linked_user_name: String,
}

impl Default for CityConfig {
    fn default() -> Self {
        Self {
            city_id: "default_city".to_string(),
            city_name: "SAIVerse".to_string(),
            linked_user_name: "the user".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Stream LLM responses chunk-by-chunk when a node speaks.
    /// Overridden at runtime by the `SAIVERSE_LLM_STREAMING` env var.
    pub llm_streaming: bool,
    /// Node-visit ceiling for a single playbook execution.
    pub max_loop: usize,
    /// Node-visit ceiling for dry-run validation walks.
    pub dry_run_max_loop: usize,
    /// Default temperature passed to LLM calls.
    pub temperature: f32,
    /// Seconds before a pending playbook-permission prompt is treated as denied.
    pub permission_timeout_secs: u64,
    /// Seconds before an external (MCP) tool invocation is abandoned.
    pub external_tool_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            llm_streaming: true,
            max_loop: 1000,
            dry_run_max_loop: 2,
            temperature: 0.7,
            permission_timeout_secs: 120,
            external_tool_timeout_secs: 120,
        }
    }
}

impl RuntimeConfig {
    /// Effective streaming flag: config value unless the env var disables it.
    pub fn streaming_enabled(&self) -> bool {
        match env::var("SAIVERSE_LLM_STREAMING") {
            Ok(val) => !matches!(val.to_lowercase().as_str(), "false" | "0" | "off" | "no"),
            Err(_) => self.llm_streaming,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Enable metabolism (anchor-advancing history compression).
    pub metabolism_enabled: bool,
    /// Enable Memory Weave context blocks (chronicle + memopedia).
    pub memory_weave_enabled: bool,
    /// Global override for count-based history loads; None defers to the
    /// model config's `default_max_history_messages`.
    pub max_history_messages_override: Option<usize>,
    /// Fallback character budget when neither model nor persona configures one.
    pub default_history_chars: usize,
    /// Maximum nesting depth for stelis sub-threads.
    pub stelis_max_depth: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            metabolism_enabled: false,
            memory_weave_enabled: false,
            max_history_messages_override: None,
            default_history_chars: 2000,
            stelis_max_depth: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of on-disk state: per-persona memory files, usage log, reply log.
    pub data_dir: String,
    /// Directory of playbook JSON definitions.
    pub playbooks_dir: String,
    /// Directory of model config JSON files (one per model id).
    pub models_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            playbooks_dir: "data/playbooks".to_string(),
            models_dir: "data/models".to_string(),
        }
    }
}

/// Top-level settings file (`saiverse.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub city: CityConfig,
    pub runtime: RuntimeConfig,
    pub memory: MemoryConfig,
    pub paths: PathsConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}
