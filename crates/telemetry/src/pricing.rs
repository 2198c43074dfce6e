//! Per-model token prices.
//!
//! Prices are per 1 million tokens, in the budget currency (USD for the
//! built-in table). Config entries under `[pricing]` override or extend the
//! defaults at startup; [`PricingTable::set`] does the same at runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use llmscope_config::PricingOverrideConfig;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Cost of a call with the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_m + output_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

impl From<&PricingOverrideConfig> for ModelPricing {
    fn from(cfg: &PricingOverrideConfig) -> Self {
        Self::new(cfg.input_per_m, cfg.output_per_m)
    }
}

/// (model, input $/M, output $/M)
const DEFAULT_PRICES: &[(&str, f64, f64)] = &[
    // Anthropic
    ("anthropic/claude-opus-4", 15.0, 75.0),
    ("anthropic/claude-sonnet-4", 3.0, 15.0),
    ("anthropic/claude-3.5-sonnet", 3.0, 15.0),
    ("anthropic/claude-3.5-haiku", 0.8, 4.0),
    ("anthropic/claude-3-haiku", 0.25, 1.25),
    // OpenAI
    ("openai/gpt-4o", 2.5, 10.0),
    ("openai/gpt-4o-mini", 0.15, 0.6),
    ("openai/gpt-4-turbo", 10.0, 30.0),
    ("openai/o1", 15.0, 60.0),
    ("openai/o1-mini", 3.0, 12.0),
    ("openai/o3-mini", 1.1, 4.4),
    // Google
    ("google/gemini-2.0-flash", 0.1, 0.4),
    ("google/gemini-2.0-pro", 1.25, 10.0),
    ("google/gemini-1.5-pro", 1.25, 5.0),
    ("google/gemini-1.5-flash", 0.075, 0.3),
    // Meta
    ("meta-llama/llama-3.1-405b", 2.7, 2.7),
    ("meta-llama/llama-3.1-70b", 0.52, 0.75),
    ("meta-llama/llama-3.1-8b", 0.055, 0.055),
    // Mistral
    ("mistral/mistral-large", 2.0, 6.0),
    ("mistral/mistral-small", 0.2, 0.6),
    ("mistral/codestral", 0.3, 0.9),
    // DeepSeek
    ("deepseek/deepseek-v3", 0.27, 1.1),
    ("deepseek/deepseek-r1", 0.55, 2.19),
];

const PROVIDER_PREFIXES: &[&str] = &[
    "openai",
    "anthropic",
    "google",
    "mistral",
    "deepseek",
    "meta-llama",
];

/// Thread-safe model price lookup.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl PricingTable {
    /// Table holding the built-in prices.
    pub fn with_defaults() -> Self {
        let prices = DEFAULT_PRICES
            .iter()
            .map(|(model, input, output)| (model.to_string(), ModelPricing::new(*input, *output)))
            .collect();
        Self {
            prices: RwLock::new(prices),
        }
    }

    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Built-in prices with `overrides` applied on top.
    pub fn from_overrides(overrides: &HashMap<String, PricingOverrideConfig>) -> Self {
        let table = Self::with_defaults();
        for (model, cfg) in overrides {
            table.set(model.clone(), ModelPricing::from(cfg));
        }
        table
    }

    /// Exact-key lookup.
    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        self.read().get(model).copied()
    }

    /// Add or replace the price of a model.
    pub fn set(&self, model: impl Into<String>, pricing: ModelPricing) {
        self.prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.into(), pricing);
    }

    /// Resolve a model id to its price.
    ///
    /// Tries the exact id, then the id under each known provider prefix
    /// (`gpt-4o` → `openai/gpt-4o`), then the longest table entry whose bare
    /// name prefixes the bare model id (`gpt-4o-mini-2024-07-18` →
    /// `openai/gpt-4o-mini`).
    pub fn resolve(&self, model: &str) -> Option<ModelPricing> {
        let prices = self.read();

        if let Some(p) = prices.get(model) {
            return Some(*p);
        }

        if let Some(p) = PROVIDER_PREFIXES
            .iter()
            .find_map(|provider| prices.get(&format!("{provider}/{model}")))
        {
            return Some(*p);
        }

        let model_lower = model.to_lowercase();
        let bare_model = model_lower.rsplit('/').next().unwrap_or(&model_lower);
        prices
            .iter()
            .filter_map(|(key, pricing)| {
                let bare_key = key.rsplit('/').next().unwrap_or(key).to_lowercase();
                bare_model
                    .starts_with(bare_key.as_str())
                    .then_some((bare_key.len(), *pricing))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, pricing)| pricing)
    }

    /// Cost of a call, or `None` if the model has no known price.
    pub fn compute_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        self.resolve(model)
            .map(|p| p.cost(input_tokens, output_tokens))
    }

    /// Known model ids, sorted, with their prices.
    pub fn entries(&self) -> Vec<(String, ModelPricing)> {
        let mut entries: Vec<(String, ModelPricing)> = self
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn models(&self) -> Vec<String> {
        self.entries().into_iter().map(|(model, _)| model).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ModelPricing>> {
        self.prices.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    #[test]
    fn defaults_cover_major_providers() {
        let table = PricingTable::with_defaults();
        assert_eq!(table.len(), DEFAULT_PRICES.len());
        let models = table.models();
        assert!(models.contains(&"openai/gpt-4o".to_string()));
        assert!(models.contains(&"anthropic/claude-sonnet-4".to_string()));
        assert!(models.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn known_model_cost() {
        let table = PricingTable::with_defaults();
        // (1000 * 3.0 + 500 * 15.0) / 1M
        let cost = table.compute_cost("anthropic/claude-sonnet-4", 1000, 500).unwrap();
        assert!(close(cost, 0.0105));
    }

    #[test]
    fn unknown_model_has_no_cost() {
        let table = PricingTable::with_defaults();
        assert_eq!(table.compute_cost("unknown/model-xyz", 1000, 500), None);
        assert_eq!(PricingTable::empty().compute_cost("gpt-4o", 1, 1), None);
    }

    #[test]
    fn bare_and_versioned_ids_resolve() {
        let table = PricingTable::with_defaults();
        let bare = table.compute_cost("gpt-4o", 1_000_000, 0).unwrap();
        assert!(close(bare, 2.5));

        // Longest prefix wins: gpt-4o-mini, not gpt-4o.
        let versioned = table
            .compute_cost("gpt-4o-mini-2024-07-18", 1_000_000, 0)
            .unwrap();
        assert!(close(versioned, 0.15));

        let routed = table
            .compute_cost("openrouter/deepseek-r1-distill", 0, 1_000_000)
            .unwrap();
        assert!(close(routed, 2.19));
    }

    #[test]
    fn overrides_replace_and_extend_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "openai/gpt-4o".to_string(),
            PricingOverrideConfig {
                input_per_m: 5.0,
                output_per_m: 20.0,
            },
        );
        overrides.insert(
            "local/llama-fine-tune".to_string(),
            PricingOverrideConfig {
                input_per_m: 0.0,
                output_per_m: 0.5,
            },
        );
        let table = PricingTable::from_overrides(&overrides);

        assert!(close(table.compute_cost("openai/gpt-4o", 1_000_000, 0).unwrap(), 5.0));
        assert!(close(
            table.compute_cost("local/llama-fine-tune", 0, 2_000_000).unwrap(),
            1.0
        ));
        assert_eq!(table.len(), DEFAULT_PRICES.len() + 1);
    }

    #[test]
    fn runtime_set_takes_effect() {
        let table = PricingTable::empty();
        assert!(table.is_empty());
        table.set("custom/model", ModelPricing::new(1.0, 2.0));
        assert_eq!(table.get("custom/model"), Some(ModelPricing::new(1.0, 2.0)));
        assert!(close(
            table.compute_cost("custom/model", 1_000_000, 1_000_000).unwrap(),
            3.0
        ));
    }
}
