//! Quote provider contract and the static price table behind it.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::utils::sanitize_symbol;

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// `Ok(None)` when no price is available for the symbol.
    async fn get_price(&self, symbol: &str) -> anyhow::Result<Option<f64>>;
}

/// Prices from the `quotes:` section of the config.
#[derive(Debug, Clone, Default)]
pub struct StaticQuotes {
    prices: HashMap<String, f64>,
}

impl StaticQuotes {
    pub fn new(prices: HashMap<String, f64>) -> Self {
        let prices = prices
            .into_iter()
            .map(|(k, v)| (sanitize_symbol(&k), v))
            .collect();
        Self { prices }
    }

    pub fn set(&mut self, symbol: &str, price: f64) {
        self.prices.insert(sanitize_symbol(symbol), price);
    }
}

#[async_trait]
impl QuoteProvider for StaticQuotes {
    async fn get_price(&self, symbol: &str) -> anyhow::Result<Option<f64>> {
        Ok(self
            .prices
            .get(&sanitize_symbol(symbol))
            .copied()
            .filter(|p| p.is_finite() && *p > 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let q = StaticQuotes::new(HashMap::from([("aapl".to_string(), 100.0)]));
        assert_eq!(q.get_price(" AAPL ").await.unwrap(), Some(100.0));
        assert_eq!(q.get_price("MSFT").await.unwrap(), None);
    }

    #[tokio::test]
    async fn non_positive_prices_are_unavailable() {
        let mut q = StaticQuotes::default();
        q.set("ZERO", 0.0);
        assert_eq!(q.get_price("ZERO").await.unwrap(), None);
    }
}
