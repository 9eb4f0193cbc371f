use crate::services::collaborators::{Cost, CostModel};
use indexmap::IndexMap;

/// Model priced when a name is not in the table
pub const DEFAULT_PRICED_MODEL: &str = "gemini-1.5-pro";

pub const DEFAULT_EXCHANGE_RATE: f64 = 7.0;

/// USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Static price list with a USD to RMB conversion
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: IndexMap<String, ModelPrice>,
    exchange_rate: f64,
}

impl PricingTable {
    pub fn new(exchange_rate: f64) -> Self {
        let mut prices = IndexMap::new();
        let mut add = |name: &str, input: f64, output: f64| {
            prices.insert(name.to_string(), ModelPrice::new(input, output));
        };

        add("gemini-1.5-pro", 1.25, 18.75);
        add("gemini-1.5-flash", 0.075, 1.125);
        add("gemini-1.0-pro", 0.5, 1.5);
        add("gpt-4o", 5.0, 15.0);
        add("gpt-4o-mini", 0.15, 0.6);
        add("gpt-4", 30.0, 60.0);
        add("gpt-3.5-turbo", 0.5, 1.5);
        add("openai/gpt-4o", 5.0, 15.0);
        add("openai/gpt-4o-mini", 0.15, 0.6);
        // Local models
        add("llama3", 0.0, 0.0);
        add("llama3.1", 0.0, 0.0);
        add("qwen2", 0.0, 0.0);

        Self {
            prices,
            exchange_rate,
        }
    }

    pub fn exchange_rate(&self) -> f64 {
        self.exchange_rate
    }

    pub fn with_price(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert(model.into(), price);
        self
    }

    pub fn price(&self, model: &str) -> ModelPrice {
        match self.prices.get(model) {
            Some(price) => *price,
            None => {
                tracing::debug!(
                    "No price for model '{}', using {} pricing",
                    model,
                    DEFAULT_PRICED_MODEL
                );
                self.prices
                    .get(DEFAULT_PRICED_MODEL)
                    .copied()
                    .unwrap_or(ModelPrice::new(0.0, 0.0))
            }
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE_RATE)
    }
}

fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

impl CostModel for PricingTable {
    fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Cost {
        let price = self.price(model);
        let usd = input_tokens as f64 / 1_000_000.0 * price.input_per_million
            + output_tokens as f64 / 1_000_000.0 * price.output_per_million;

        Cost {
            usd: round5(usd),
            rmb: round5(usd * self.exchange_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_cost() {
        let table = PricingTable::default();
        let cost = table.cost("gpt-4o", 1_000_000, 500_000);
        assert!((cost.usd - 12.5).abs() < 1e-9);
        assert!((cost.rmb - 87.5).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_uses_default_price() {
        let table = PricingTable::default();
        assert_eq!(table.price("mystery-model"), table.price(DEFAULT_PRICED_MODEL));
    }

    #[test]
    fn test_local_models_are_free() {
        let table = PricingTable::default();
        assert_eq!(table.cost("llama3.1", 123_456, 654_321), Cost::default());
    }

    #[test]
    fn test_rounding_to_five_decimals() {
        let table = PricingTable::new(7.1);
        // 1234 input tokens at 0.15/M = 0.0001851 USD
        let cost = table.cost("gpt-4o-mini", 1234, 0);
        assert_eq!(cost.usd, 0.00019);
        assert_eq!(cost.rmb, 0.00131);
    }

    #[test]
    fn test_custom_price() {
        let table = PricingTable::default().with_price("house-model", ModelPrice::new(2.0, 4.0));
        let cost = table.cost("house-model", 500_000, 250_000);
        assert!((cost.usd - 2.0).abs() < 1e-9);
    }
}
