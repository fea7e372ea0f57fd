//! Buys a small clip at mid when a book's spread blows out.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;

use crate::core::{Instrument, Signal, Urgency};

use super::{Strategy, StrategyConfig, StrategyContext, StrategyError, StrategyResult, Subscription};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpreadWatcherParams {
    /// Absolute spread that triggers a buy
    pub min_spread: Decimal,
    pub size: Decimal,
    pub urgency: Urgency,
}

impl Default for SpreadWatcherParams {
    fn default() -> Self {
        Self {
            min_spread: dec!(0.50),
            size: dec!(1),
            urgency: Urgency::Low,
        }
    }
}

pub struct SpreadWatcher {
    name: String,
    subscription: Subscription,
    params: SpreadWatcherParams,
    /// Book sequence last acted on, so one wide book produces one order
    acted: HashMap<Instrument, u64>,
}

impl SpreadWatcher {
    pub fn new(
        name: impl Into<String>,
        subscription: Subscription,
        params: SpreadWatcherParams,
    ) -> Self {
        Self {
            name: name.into(),
            subscription,
            params,
            acted: HashMap::new(),
        }
    }

    pub fn from_config(config: &StrategyConfig) -> Result<Self, StrategyError> {
        let params: SpreadWatcherParams = toml::Value::Table(config.params.clone())
            .try_into()
            .map_err(|e: toml::de::Error| StrategyError::InvalidParams {
                strategy: config.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(&config.name, config.subscription(), params))
    }

    fn check(&mut self, ctx: &StrategyContext, instrument: &Instrument) -> Option<Signal> {
        if ctx.is_stale(instrument) {
            return None;
        }
        let book = ctx.book(instrument)?;
        if self.acted.get(instrument) == Some(&book.sequence()) {
            return None;
        }
        let spread = book.spread()?;
        if spread <= self.params.min_spread {
            return None;
        }
        let mid = book.mid()?;
        tracing::info!(strategy = %self.name, %instrument, %spread, %mid, "Wide spread");
        self.acted.insert(instrument.clone(), book.sequence());
        Some(Signal::buy(instrument.clone(), mid, self.params.size, self.params.urgency))
    }
}

impl Strategy for SpreadWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscription(&self) -> Subscription {
        self.subscription.clone()
    }

    fn on_tick(&mut self, ctx: &StrategyContext) -> StrategyResult {
        let instruments: Vec<Instrument> = if self.subscription.instruments.is_empty() {
            let mut all: Vec<Instrument> = ctx.books.keys().cloned().collect();
            all.sort();
            all
        } else {
            self.subscription.instruments.clone()
        };
        Ok(instruments.iter().filter_map(|i| self.check(ctx, i)).collect())
    }

    fn on_book_update(&mut self, ctx: &StrategyContext, instrument: &Instrument) -> StrategyResult {
        Ok(self.check(ctx, instrument).into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{BookSnapshot, OrderBook, PriceLevel};
    use crate::risk::RiskLimits;
    use std::sync::Arc;

    fn ctx(bid: Decimal, ask: Decimal, seq: u64) -> StrategyContext {
        let tok = Instrument::from("tok");
        let book = OrderBook::from_snapshot(&BookSnapshot {
            instrument: tok.clone(),
            bids: vec![PriceLevel::new(bid, dec!(10))],
            asks: vec![PriceLevel::new(ask, dec!(10))],
            sequence: seq,
            timestamp: chrono::Utc::now(),
        })
        .unwrap();
        let mut ctx = StrategyContext::new(RiskLimits::default());
        ctx.books.insert(tok, Arc::new(book));
        ctx
    }

    #[test]
    fn test_buys_mid_on_wide_spread_once_per_book() {
        let mut s = SpreadWatcher::new("sw", Subscription::all(), SpreadWatcherParams::default());
        let tok = Instrument::from("tok");
        let wide = ctx(dec!(0.20), dec!(0.80), 1);
        assert_eq!(
            s.on_book_update(&wide, &tok).unwrap(),
            vec![Signal::buy("tok", dec!(0.50), dec!(1), Urgency::Low)]
        );
        assert!(s.on_tick(&wide).unwrap().is_empty());
        assert_eq!(s.on_tick(&ctx(dec!(0.20), dec!(0.80), 2)).unwrap().len(), 1);
    }

    #[test]
    fn test_narrow_spread_holds() {
        let mut s = SpreadWatcher::new("sw", Subscription::all(), SpreadWatcherParams::default());
        assert!(s.on_tick(&ctx(dec!(0.45), dec!(0.55), 1)).unwrap().is_empty());
    }

    #[test]
    fn test_params_from_config() {
        let cfg: StrategyConfig = toml::from_str(
            r#"
name = "sw"
kind = "spread_watcher"
min_spread = 0.1
urgency = "high"
"#,
        )
        .unwrap();
        let s = SpreadWatcher::from_config(&cfg).unwrap();
        assert_eq!(s.params.min_spread, dec!(0.1));
        assert_eq!(s.params.urgency, Urgency::High);
        assert_eq!(s.params.size, dec!(1));
    }
}
