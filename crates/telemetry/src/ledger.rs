//! Per-session record of every provider call.

use crate::pricing::PricingTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use toolweave_core::Usage;

/// One provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    /// Loop iteration that issued the call (1-based).
    pub iteration: usize,
    pub usage: Usage,
    pub latency_ms: u64,
    pub has_tool_calls: bool,
    pub estimated_cost_usd: f64,
}

/// Aggregate over a ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub calls: usize,
    pub usage: Usage,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

impl UsageTotals {
    /// Share of input tokens served from the provider cache.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.usage.input_tokens == 0 {
            return 0.0;
        }
        self.usage.cache_hit_tokens as f64 / self.usage.input_tokens as f64
    }
}

/// Accumulates call records and prices them as they arrive.
pub struct UsageLedger {
    pricing: Arc<PricingTable>,
    records: Vec<CallRecord>,
}

impl UsageLedger {
    pub fn new(pricing: Arc<PricingTable>) -> Self {
        Self {
            pricing,
            records: Vec::new(),
        }
    }

    /// Price and store one call. Returns the estimated cost.
    pub fn record(
        &mut self,
        model: &str,
        iteration: usize,
        usage: Usage,
        latency_ms: u64,
        has_tool_calls: bool,
    ) -> f64 {
        let cost = self.pricing.compute_cost(model, &usage);
        tracing::debug!(
            model = %model,
            iteration,
            input = usage.input_tokens,
            output = usage.output_tokens,
            cache_hit = usage.cache_hit_tokens,
            cost_usd = cost,
            "Recorded provider call"
        );
        self.records.push(CallRecord {
            timestamp: Utc::now(),
            model: model.to_string(),
            iteration,
            usage,
            latency_ms,
            has_tool_calls,
            estimated_cost_usd: cost,
        });
        cost
    }

    pub fn records(&self) -> &[CallRecord] {
        &self.records
    }

    pub fn totals(&self) -> UsageTotals {
        self.totals_since(0)
    }

    /// Totals over records from index `start` on.
    pub fn totals_since(&self, start: usize) -> UsageTotals {
        let mut totals = UsageTotals::default();
        for r in self.records.iter().skip(start) {
            totals.calls += 1;
            totals.usage.add(&r.usage);
            totals.cost_usd += r.estimated_cost_usd;
            totals.latency_ms += r.latency_ms;
        }
        totals
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::ModelPricing;

    #[test]
    fn totals_accumulate_usage_and_cost() {
        let table = PricingTable::empty();
        table.set("m", ModelPricing::new(1.0, 2.0).with_cached(0.5));
        let mut ledger = UsageLedger::new(Arc::new(table));

        let u1 = Usage {
            input_tokens: 1_000_000,
            cache_hit_tokens: 500_000,
            ..Default::default()
        };
        let u2 = Usage {
            output_tokens: 1_000_000,
            ..Default::default()
        };
        let c1 = ledger.record("m", 1, u1, 120, true);
        ledger.record("m", 2, u2, 80, false);

        assert!((c1 - 0.75).abs() < 1e-10);
        let totals = ledger.totals();
        assert_eq!(totals.calls, 2);
        assert_eq!(totals.latency_ms, 200);
        assert!((totals.cost_usd - 2.75).abs() < 1e-10);
        assert!((totals.cache_hit_rate() - 0.5).abs() < 1e-10);

        let tail = ledger.totals_since(1);
        assert_eq!(tail.calls, 1);
        assert_eq!(tail.usage.output_tokens, 1_000_000);
    }

    #[test]
    fn empty_ledger() {
        let ledger = UsageLedger::new(Arc::new(PricingTable::empty()));
        assert!(ledger.is_empty());
        assert_eq!(ledger.totals().cache_hit_rate(), 0.0);
    }
}
