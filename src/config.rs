//! Configuration surface: the per-provider `ProviderConfig` shape plus the
//! runtime-level configuration a host process supplies
//! (`providers.<name>`, `default_providers`/`fallback_provider`,
//! `truncation_provider`, storage driver chains).
//!
//! `serde`-deserializable so a host can load it from TOML/YAML/JSON, or
//! build it programmatically, with proper merge semantics: merging two
//! configs takes non-null values from the override and the union of
//! extras.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub max_completion_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub n: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub parallel_tool_calls: Option<bool>,
    pub tool_choice: Option<Value>,
    pub modalities: Option<Vec<String>>,
    pub audio: Option<Value>,
    #[serde(default)]
    pub extras: Map<String, Value>,
    /// Context window budget used by the TruncationEngine; carried by every
    /// driver so the orchestrator knows when to truncate.
    pub default_context_window: Option<u32>,
}

impl ProviderConfig {
    /// Merge two configs: non-null values from `override_cfg` win, extras
    /// are unioned (override's value wins on key collision).
    pub fn merge(&self, override_cfg: &ProviderConfig) -> ProviderConfig {
        let mut merged = self.clone();
        macro_rules! take_if_some {
            ($field:ident) => {
                if override_cfg.$field.is_some() {
                    merged.$field = override_cfg.$field.clone();
                }
            };
        }
        take_if_some!(model);
        take_if_some!(api_key);
        take_if_some!(api_url);
        take_if_some!(max_completion_tokens);
        take_if_some!(temperature);
        take_if_some!(top_p);
        take_if_some!(n);
        take_if_some!(frequency_penalty);
        take_if_some!(presence_penalty);
        take_if_some!(parallel_tool_calls);
        take_if_some!(tool_choice);
        take_if_some!(modalities);
        take_if_some!(audio);
        take_if_some!(default_context_window);

        for (k, v) in &override_cfg.extras {
            merged.extras.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Chain of named storage-driver identifiers, resolved by the host into
/// concrete `HistoryDriver`/`HistoryDriver`-like instances. The runtime
/// config only records the intended chain; wiring concrete drivers is left
/// to the embedding application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageChainConfig {
    pub drivers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub default_providers: Vec<String>,
    pub truncation_provider: Option<String>,
    #[serde(default)]
    pub default_storage: StorageChainConfig,
    #[serde(default)]
    pub default_history_storage: StorageChainConfig,
    #[serde(default)]
    pub default_usage_storage: StorageChainConfig,
}

impl RuntimeConfig {
    pub fn provider_config(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_takes_non_null_override_fields() {
        let base = ProviderConfig {
            model: Some("gpt-4o".into()),
            temperature: Some(0.7),
            ..Default::default()
        };
        let override_cfg = ProviderConfig {
            temperature: Some(0.2),
            ..Default::default()
        };
        let merged = base.merge(&override_cfg);
        assert_eq!(merged.model.as_deref(), Some("gpt-4o"));
        assert_eq!(merged.temperature, Some(0.2));
    }

    #[test]
    fn merge_unions_extras_with_override_winning_on_collision() {
        let mut base = ProviderConfig::default();
        base.extras.insert("a".into(), Value::String("base".into()));
        base.extras.insert("b".into(), Value::String("base-only".into()));

        let mut override_cfg = ProviderConfig::default();
        override_cfg.extras.insert("a".into(), Value::String("override".into()));

        let merged = base.merge(&override_cfg);
        assert_eq!(merged.extras.get("a").unwrap(), "override");
        assert_eq!(merged.extras.get("b").unwrap(), "base-only");
    }
}
