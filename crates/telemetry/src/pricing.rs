//! Built-in pricing table for common models.
//!
//! Prices are in USD per 1 million tokens. Cache hits and reasoning tokens
//! can be priced separately from plain input and output. Custom pricing can
//! be added at runtime from the TOML config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use toolweave_core::Usage;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M uncached input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M cache-hit input tokens in USD.
    pub cached_input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
    /// Price per 1M reasoning tokens in USD.
    pub reasoning_per_m: f64,
}

impl ModelPricing {
    /// Create a pricing entry with no cache discount and reasoning billed as output.
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            cached_input_per_m: input_per_m,
            output_per_m,
            reasoning_per_m: output_per_m,
        }
    }

    pub fn with_cached(mut self, cached_input_per_m: f64) -> Self {
        self.cached_input_per_m = cached_input_per_m;
        self
    }

    pub fn with_reasoning(mut self, reasoning_per_m: f64) -> Self {
        self.reasoning_per_m = reasoning_per_m;
        self
    }

    /// Compute cost for a normalized usage report.
    ///
    /// `input_tokens` includes cache hits; `output_tokens` includes reasoning.
    pub fn cost(&self, usage: &Usage) -> f64 {
        let cached = usage.cache_hit_tokens.min(usage.input_tokens);
        let uncached = usage.input_tokens - cached;
        let reasoning = usage.reasoning_tokens.min(usage.output_tokens);
        let plain_output = usage.output_tokens - reasoning;

        (uncached as f64 * self.input_per_m
            + cached as f64 * self.cached_input_per_m
            + plain_output as f64 * self.output_per_m
            + reasoning as f64 * self.reasoning_per_m)
            / 1_000_000.0
    }
}

/// Thread-safe pricing table with built-in defaults and custom overrides.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl PricingTable {
    /// Create a pricing table with built-in model prices.
    pub fn with_defaults() -> Self {
        let mut prices = HashMap::new();

        // ── Anthropic (cache reads at 10%) ─────────────────────────
        prices.insert(
            "anthropic/claude-sonnet-4".into(),
            ModelPricing::new(3.0, 15.0).with_cached(0.3),
        );
        prices.insert(
            "anthropic/claude-opus-4".into(),
            ModelPricing::new(15.0, 75.0).with_cached(1.5),
        );
        prices.insert(
            "anthropic/claude-3.5-haiku".into(),
            ModelPricing::new(0.8, 4.0).with_cached(0.08),
        );

        // ── OpenAI (cache reads at 50%) ────────────────────────────
        prices.insert(
            "openai/gpt-4o".into(),
            ModelPricing::new(2.5, 10.0).with_cached(1.25),
        );
        prices.insert(
            "openai/gpt-4o-mini".into(),
            ModelPricing::new(0.15, 0.6).with_cached(0.075),
        );
        prices.insert(
            "openai/o3-mini".into(),
            ModelPricing::new(1.1, 4.4).with_cached(0.55),
        );

        // ── Google ─────────────────────────────────────────────────
        prices.insert(
            "google/gemini-2.0-flash".into(),
            ModelPricing::new(0.1, 0.4).with_cached(0.025),
        );
        prices.insert(
            "google/gemini-1.5-pro".into(),
            ModelPricing::new(1.25, 5.0),
        );

        // ── DeepSeek ───────────────────────────────────────────────
        prices.insert(
            "deepseek/deepseek-chat".into(),
            ModelPricing::new(0.27, 1.1).with_cached(0.07),
        );
        prices.insert(
            "deepseek/deepseek-reasoner".into(),
            ModelPricing::new(0.55, 2.19).with_cached(0.14),
        );

        // ── Mistral ────────────────────────────────────────────────
        prices.insert("mistral/mistral-large".into(), ModelPricing::new(2.0, 6.0));

        Self {
            prices: RwLock::new(prices),
        }
    }

    /// Create an empty pricing table.
    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Look up pricing for a model. Returns None if not found.
    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);
        prices.get(model).cloned()
    }

    /// Add or update pricing for a model.
    pub fn set(&self, model: impl Into<String>, pricing: ModelPricing) {
        let mut prices = self.prices.write().unwrap_or_else(PoisonError::into_inner);
        prices.insert(model.into(), pricing);
    }

    /// Compute cost for a model call, returning 0.0 if model is not in table.
    ///
    /// Tries exact match first, then common provider prefixes
    /// (`gpt-4o` → `openai/gpt-4o`), then the longest bare-name prefix
    /// (`gpt-4o-mini-2024-07-18` matches `gpt-4o-mini`). Local models tagged
    /// like `qwen2.5:7b` that match nothing are free.
    pub fn compute_cost(&self, model: &str, usage: &Usage) -> f64 {
        self.resolve(model).map(|p| p.cost(usage)).unwrap_or(0.0)
    }

    fn resolve(&self, model: &str) -> Option<ModelPricing> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);

        // 1. Exact match
        if let Some(p) = prices.get(model) {
            return Some(p.clone());
        }

        // 2. Try with common provider prefixes
        for prefix in ["openai", "anthropic", "google", "mistral", "deepseek"] {
            if let Some(p) = prices.get(&format!("{prefix}/{model}")) {
                return Some(p.clone());
            }
        }

        // 3. Prefix match on the bare model name
        let model_lower = model.to_lowercase();
        let bare_model = model_lower.rsplit('/').next().unwrap_or(&model_lower);

        let mut best: Option<(usize, &ModelPricing)> = None;
        for (key, pricing) in prices.iter() {
            let bare_key = key.rsplit('/').next().unwrap_or(key).to_lowercase();
            if bare_model.starts_with(&bare_key)
                && best.is_none_or(|(len, _)| bare_key.len() > len)
            {
                best = Some((bare_key.len(), pricing));
            }
        }

        best.map(|(_, p)| p.clone())
    }

    /// List all known model names.
    pub fn models(&self) -> Vec<String> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = prices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of models in the pricing table.
    pub fn len(&self) -> usize {
        self.prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
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

    fn usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }
    }

    #[test]
    fn default_table_has_models() {
        let table = PricingTable::with_defaults();
        assert!(table.len() >= 10);
        assert!(!table.is_empty());
    }

    #[test]
    fn known_model_cost() {
        let table = PricingTable::with_defaults();
        // (1000 * 3.0 + 500 * 15.0) / 1M = 0.0105
        let cost = table.compute_cost("anthropic/claude-sonnet-4", &usage(1000, 500));
        assert!((cost - 0.0105).abs() < 1e-10);
    }

    #[test]
    fn cache_hits_are_discounted() {
        let table = PricingTable::with_defaults();
        let mut u = usage(1_000_000, 0);
        u.cache_hit_tokens = 1_000_000;
        let cost = table.compute_cost("anthropic/claude-sonnet-4", &u);
        assert!((cost - 0.3).abs() < 1e-10);
    }

    #[test]
    fn reasoning_priced_separately() {
        let p = ModelPricing::new(1.0, 2.0).with_reasoning(10.0);
        let mut u = usage(0, 1_000_000);
        u.reasoning_tokens = 500_000;
        // 0.5M plain output at 2.0 + 0.5M reasoning at 10.0
        assert!((p.cost(&u) - 6.0).abs() < 1e-10);
    }

    #[test]
    fn unknown_and_local_models_are_free() {
        let table = PricingTable::with_defaults();
        assert_eq!(table.compute_cost("unknown/model-xyz", &usage(1000, 500)), 0.0);
        assert_eq!(table.compute_cost("qwen2.5:7b", &usage(1000, 500)), 0.0);
    }

    #[test]
    fn bare_and_versioned_names_resolve() {
        let table = PricingTable::with_defaults();
        let bare = table.compute_cost("gpt-4o", &usage(1_000_000, 0));
        assert!((bare - 2.5).abs() < 1e-10);
        let versioned = table.compute_cost("gpt-4o-mini-2024-07-18", &usage(1_000_000, 0));
        assert!((versioned - 0.15).abs() < 1e-10);
    }

    #[test]
    fn set_overrides_existing() {
        let table = PricingTable::with_defaults();
        table.set("openai/gpt-4o", ModelPricing::new(5.0, 20.0));
        let new_cost = table.compute_cost("openai/gpt-4o", &usage(1_000_000, 0));
        assert!((new_cost - 5.0).abs() < 1e-10);
        assert!(table.models().windows(2).all(|w| w[0] <= w[1]));
    }
}
