//! Cost tracking for toolweave sessions.
//!
//! Every provider call lands in a [`UsageLedger`] priced through a
//! cache-aware [`PricingTable`]: cache hits and reasoning tokens are billed
//! at their own rates.

pub mod ledger;
pub mod pricing;

pub use ledger::{CallRecord, UsageLedger, UsageTotals};
pub use pricing::{ModelPricing, PricingTable};

use toolweave_config::TelemetryConfig;

/// Built-in prices plus the overrides from `[telemetry.custom_pricing]`.
pub fn pricing_from_config(config: &TelemetryConfig) -> PricingTable {
    let table = PricingTable::with_defaults();
    for (model, p) in &config.custom_pricing {
        let mut pricing = ModelPricing::new(p.input_per_m, p.output_per_m);
        if let Some(cached) = p.cached_input_per_m {
            pricing = pricing.with_cached(cached);
        }
        if let Some(reasoning) = p.reasoning_per_m {
            pricing = pricing.with_reasoning(reasoning);
        }
        table.set(model.clone(), pricing);
    }
    table
}
