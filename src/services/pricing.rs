//! Per-provider token pricing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Price and output limit for one provider, in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub max_tokens: u32,
}

impl PriceEntry {
    pub fn price_per_1k_input(&self) -> f64 {
        self.input_per_million / 1000.0
    }

    pub fn price_per_1k_output(&self) -> f64 {
        self.output_per_million / 1000.0
    }

    /// `cost = tokens_in / 1e6 * price_in + tokens_out / 1e6 * price_out`
    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        tokens_in as f64 / 1_000_000.0 * self.input_per_million
            + tokens_out as f64 / 1_000_000.0 * self.output_per_million
    }
}

/// Lookup table keyed by provider name.
#[derive(Debug, Clone)]
pub struct PriceTable {
    entries: HashMap<String, PriceEntry>,
}

impl PriceTable {
    pub fn new(entries: HashMap<String, PriceEntry>) -> Self {
        Self { entries }
    }

    pub fn get(&self, provider: &str) -> Option<&PriceEntry> {
        self.entries.get(provider)
    }

    pub fn insert(&mut self, provider: impl Into<String>, entry: PriceEntry) {
        self.entries.insert(provider.into(), entry);
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        let defaults = [
            ("anthropic", 3.00, 15.00, 8192),
            ("openai", 2.50, 10.00, 16384),
            ("google", 1.25, 10.00, 8192),
            ("deepseek", 0.27, 1.10, 8192),
        ];

        let entries = defaults
            .into_iter()
            .map(|(provider, input, output, max_tokens)| {
                (
                    provider.to_string(),
                    PriceEntry {
                        input_per_million: input,
                        output_per_million: output,
                        max_tokens,
                    },
                )
            })
            .collect();

        Self { entries }
    }
}
