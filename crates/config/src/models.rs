//! Model configuration registry.
//!
//! Each model is described by one JSON file in the models directory; the
//! filename (without `.json`) is the config key used everywhere else in the
//! system ("model id"). The file carries provider, context length, pricing,
//! cache behavior, and capability flags.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPricing {
    pub input_per_1m_tokens: f64,
    pub output_per_1m_tokens: f64,
    /// Rate for tokens served from cache. Defaults to the input rate.
    pub cached_input_per_1m_tokens: Option<f64>,
    /// Rate for tokens written to cache (5m TTL).
    pub cache_write_per_1m_tokens: Option<f64>,
    /// Rate for tokens written to cache with a 1h TTL.
    pub cache_write_1h_per_1m_tokens: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Cache breakpoints are set explicitly per request (Anthropic style).
    Explicit,
    /// The provider caches transparently (Gemini / OpenAI style).
    Implicit,
}

/// Raw cache section as it appears in a model config file. All fields are
/// optional; `CacheConfig` resolves the provider-dependent defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub supported: Option<bool>,
    pub default_enabled: Option<bool>,
    pub default_ttl: Option<String>,
    pub ttl_options: Option<Vec<String>>,
    pub kind: Option<CacheKind>,
    pub min_tokens: Option<u32>,
}

/// Resolved cache configuration for a model.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub supported: bool,
    pub default_enabled: bool,
    pub default_ttl: String,
    pub ttl_options: Vec<String>,
    pub kind: CacheKind,
    pub min_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Provider-facing model name used in API calls.
    pub model: String,
    pub provider: String,
    pub display_name: Option<String>,
    pub context_length: u32,
    pub pricing: Option<ModelPricing>,
    pub cache: CacheSettings,
    pub supports_images: bool,
    pub supports_structured_output: bool,
    /// Additional system prompt injected for this model.
    pub system_prompt: Option<String>,
    /// Count-based history window for full-depth context loads.
    pub default_max_history_messages: Option<usize>,
    /// Low watermark: messages kept in the window after metabolism.
    pub metabolism_keep_messages: Option<usize>,
    /// High watermark: window size that triggers metabolism.
    pub metabolism_trigger_messages: Option<usize>,
    /// Env var holding the API key; provider default when absent.
    pub api_key_env: Option<String>,
    /// Base URL override (local gateways, proxies).
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            provider: "ollama".to_string(),
            display_name: None,
            context_length: 120_000,
            pricing: None,
            cache: CacheSettings::default(),
            supports_images: false,
            supports_structured_output: true,
            system_prompt: None,
            default_max_history_messages: None,
            metabolism_keep_messages: None,
            metabolism_trigger_messages: None,
            api_key_env: None,
            base_url: None,
        }
    }
}

impl ModelConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.model)
    }

    /// Local models run without an API key and cost nothing.
    pub fn is_local(&self) -> bool {
        matches!(self.provider.as_str(), "ollama" | "llama_cpp")
    }

    /// Env vars that can hold this model's API key. Empty for local models;
    /// the model is available if any listed var is set.
    pub fn required_env_vars(&self) -> Vec<String> {
        if self.is_local() {
            return Vec::new();
        }
        if let Some(explicit) = &self.api_key_env {
            return vec![explicit.clone()];
        }
        match self.provider.as_str() {
            "anthropic" => vec!["CLAUDE_API_KEY".to_string()],
            "gemini" => vec!["GEMINI_API_KEY".to_string(), "GEMINI_FREE_API_KEY".to_string()],
            "openai" => vec!["OPENAI_API_KEY".to_string()],
            "xai" => vec!["XAI_API_KEY".to_string()],
            // Unknown provider: assume available rather than hiding by mistake.
            _ => Vec::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        let vars = self.required_env_vars();
        if vars.is_empty() {
            return true;
        }
        vars.iter().any(|var| env::var(var).map(|v| !v.is_empty()).unwrap_or(false))
    }

    pub fn cache_config(&self) -> CacheConfig {
        let default_supported =
            matches!(self.provider.as_str(), "anthropic" | "gemini" | "openai");
        let default_kind = if self.provider == "anthropic" {
            CacheKind::Explicit
        } else {
            CacheKind::Implicit
        };
        CacheConfig {
            supported: self.cache.supported.unwrap_or(default_supported),
            default_enabled: self.cache.default_enabled.unwrap_or(true),
            default_ttl: self.cache.default_ttl.clone().unwrap_or_else(|| "5m".to_string()),
            ttl_options: self
                .cache
                .ttl_options
                .clone()
                .unwrap_or_else(|| vec!["5m".to_string()]),
            kind: self.cache.kind.unwrap_or(default_kind),
            min_tokens: self.cache.min_tokens.unwrap_or(1024),
        }
    }
}

/// Cost in USD for one LLM call against a pricing table.
///
/// `input_tokens` is the provider-reported total and already includes the
/// cached and cache-write portions; the non-cached remainder is billed at
/// the plain input rate. Missing pricing means a free (local) model.
pub fn calculate_cost(
    pricing: Option<&ModelPricing>,
    input_tokens: u64,
    output_tokens: u64,
    cached_tokens: u64,
    cache_write_tokens: u64,
    cache_ttl: &str,
) -> f64 {
    let Some(pricing) = pricing else {
        return 0.0;
    };

    let input_rate = pricing.input_per_1m_tokens;
    let output_rate = pricing.output_per_1m_tokens;
    let cached_rate = pricing.cached_input_per_1m_tokens.unwrap_or(input_rate);
    let cache_write_rate = if cache_ttl == "1h" {
        pricing
            .cache_write_1h_per_1m_tokens
            .or(pricing.cache_write_per_1m_tokens)
            .unwrap_or(input_rate)
    } else {
        pricing.cache_write_per_1m_tokens.unwrap_or(input_rate)
    };

    let non_cached = input_tokens.saturating_sub(cached_tokens + cache_write_tokens);

    (non_cached as f64 / 1_000_000.0) * input_rate
        + (cached_tokens as f64 / 1_000_000.0) * cached_rate
        + (cache_write_tokens as f64 / 1_000_000.0) * cache_write_rate
        + (output_tokens as f64 / 1_000_000.0) * output_rate
}

/// In-memory registry of model configs, keyed by config key (file stem).
#[derive(Debug, Default, Clone)]
pub struct ModelRegistry {
    configs: HashMap<String, ModelConfig>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` file from `dir`. Files missing the `model` field
    /// are skipped with a warning; a missing directory is an empty registry.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut registry = Self::new();
        let dir = dir.as_ref();
        if !dir.is_dir() {
            info!(path = %dir.display(), "models directory missing; no model configs loaded");
            return Ok(registry);
        }

        let mut entries: Vec<_> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort();

        for path in entries {
            let key = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str::<ModelConfig>(&raw).map_err(Into::into))
            {
                Ok(config) if config.model.is_empty() => {
                    warn!(file = %path.display(), "model config missing 'model' field, skipping");
                }
                Ok(config) => {
                    debug!(key = %key, model = %config.model, "loaded model config");
                    registry.configs.insert(key, config);
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "failed to load model config");
                }
            }
        }

        info!(count = registry.configs.len(), "model configurations loaded");
        Ok(registry)
    }

    pub fn insert(&mut self, key: impl Into<String>, config: ModelConfig) {
        self.configs.insert(key.into(), config);
    }

    pub fn get(&self, key: &str) -> Option<&ModelConfig> {
        self.configs.get(key)
    }

    /// Lookup by config key, then by provider-facing model name, then by the
    /// suffix after a `/` (e.g. "flash" matching "google/flash").
    pub fn find(&self, query: &str) -> Option<(&str, &ModelConfig)> {
        if let Some((key, config)) = self.configs.get_key_value(query) {
            return Some((key.as_str(), config));
        }
        if let Some((key, config)) = self.configs.iter().find(|(_, c)| c.model == query) {
            return Some((key.as_str(), config));
        }
        self.configs.iter().find_map(|(key, config)| {
            let suffix = config.model.split_once('/').map(|(_, s)| s)?;
            (suffix == query || suffix.starts_with(query)).then_some((key.as_str(), config))
        })
    }

    pub fn context_length(&self, key: &str) -> Option<u32> {
        self.get(key).map(|c| c.context_length)
    }

    pub fn provider(&self, key: &str) -> Option<&str> {
        self.get(key).map(|c| c.provider.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Cost of one call against this registry's pricing for `key`.
    pub fn cost_for(
        &self,
        key: &str,
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
        cache_write_tokens: u64,
        cache_ttl: &str,
    ) -> f64 {
        let pricing = self
            .get(key)
            .or_else(|| self.find(key).map(|(_, c)| c))
            .and_then(|c| c.pricing.as_ref());
        calculate_cost(
            pricing,
            input_tokens,
            output_tokens,
            cached_tokens,
            cache_write_tokens,
            cache_ttl,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priced_config() -> ModelConfig {
        ModelConfig {
            model: "vendor/test-model".to_string(),
            provider: "anthropic".to_string(),
            pricing: Some(ModelPricing {
                input_per_1m_tokens: 3.0,
                output_per_1m_tokens: 15.0,
                cached_input_per_1m_tokens: Some(0.3),
                cache_write_per_1m_tokens: Some(3.75),
                cache_write_1h_per_1m_tokens: Some(6.0),
            }),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn cost_without_pricing_is_zero() {
        assert_eq!(calculate_cost(None, 1_000_000, 1_000_000, 0, 0, "5m"), 0.0);
    }

    #[test]
    fn cost_splits_cached_and_write_tokens() {
        let config = priced_config();
        let pricing = config.pricing.as_ref();
        // 1M input = 400k plain + 500k cached + 100k cache-write.
        let cost = calculate_cost(pricing, 1_000_000, 0, 500_000, 100_000, "5m");
        let expected = 0.4 * 3.0 + 0.5 * 0.3 + 0.1 * 3.75;
        assert!((cost - expected).abs() < 1e-9, "got {cost}, expected {expected}");
    }

    #[test]
    fn one_hour_ttl_uses_the_1h_write_rate() {
        let config = priced_config();
        let cost_5m = calculate_cost(config.pricing.as_ref(), 100_000, 0, 0, 100_000, "5m");
        let cost_1h = calculate_cost(config.pricing.as_ref(), 100_000, 0, 0, 100_000, "1h");
        assert!(cost_1h > cost_5m);
    }

    #[test]
    fn cached_exceeding_input_does_not_underflow() {
        let config = priced_config();
        let cost = calculate_cost(config.pricing.as_ref(), 100, 0, 500, 0, "5m");
        assert!(cost > 0.0);
    }

    #[test]
    fn cache_config_defaults_follow_provider() {
        let anthropic = priced_config();
        assert_eq!(anthropic.cache_config().kind, CacheKind::Explicit);

        let gemini = ModelConfig {
            provider: "gemini".to_string(),
            ..ModelConfig::default()
        };
        assert_eq!(gemini.cache_config().kind, CacheKind::Implicit);
        assert!(gemini.cache_config().supported);

        let local = ModelConfig::default();
        assert!(!local.cache_config().supported);
        assert!(local.is_local());
    }

    #[test]
    fn registry_loads_json_dir_and_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("flash.json"),
            serde_json::json!({"model": "google/flash", "provider": "gemini", "context_length": 32000})
                .to_string(),
        )
        .unwrap();
        fs::write(dir.path().join("nameless.json"), "{}").unwrap();
        fs::write(dir.path().join("broken.json"), "not json").unwrap();

        let registry = ModelRegistry::load_from_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.context_length("flash"), Some(32000));
        assert_eq!(registry.provider("flash"), Some("gemini"));
    }

    #[test]
    fn find_matches_key_model_name_and_suffix() {
        let mut registry = ModelRegistry::new();
        registry.insert("flash", ModelConfig {
            model: "google/flash-2.0".to_string(),
            provider: "gemini".to_string(),
            ..ModelConfig::default()
        });

        assert_eq!(registry.find("flash").unwrap().0, "flash");
        assert_eq!(registry.find("google/flash-2.0").unwrap().0, "flash");
        assert_eq!(registry.find("flash-2.0").unwrap().0, "flash");
        assert!(registry.find("unknown").is_none());
    }
}
