//! Inventory-skewed two-sided quoting.
//!
//! Quotes `mid ± half_spread`, shifted against the current position by
//! `skew_factor` per share, clamped to the binary-outcome price range and
//! rounded outward to the tick. Each requote cancels the previous quotes.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;

use crate::core::{ExecutionReport, Instrument, Signal, Urgency};

use super::{Strategy, StrategyConfig, StrategyContext, StrategyError, StrategyResult, Subscription};

/// Market maker parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MarketMakerParams {
    /// Full quoted spread in basis points of mid
    pub spread_bps: Decimal,
    /// Price shift per share of inventory
    pub skew_factor: Decimal,
    /// Quoting stops on the side that would push |position| past this
    pub max_position: Decimal,
    pub order_size: Decimal,
    /// Minimum half-edge; narrower quotes are not posted
    pub min_edge: Decimal,
    pub tick_size: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
}

impl Default for MarketMakerParams {
    fn default() -> Self {
        Self {
            spread_bps: dec!(200),
            skew_factor: dec!(0.001),
            max_position: dec!(100),
            order_size: dec!(10),
            min_edge: dec!(0.005),
            tick_size: dec!(0.01),
            min_price: dec!(0.01),
            max_price: dec!(0.99),
        }
    }
}

impl MarketMakerParams {
    pub fn from_config(config: &StrategyConfig) -> Result<Self, StrategyError> {
        let params: Self = toml::Value::Table(config.params.clone())
            .try_into()
            .map_err(|e: toml::de::Error| StrategyError::InvalidParams {
                strategy: config.name.clone(),
                reason: e.to_string(),
            })?;
        if params.tick_size <= Decimal::ZERO || params.order_size <= Decimal::ZERO {
            return Err(StrategyError::InvalidParams {
                strategy: config.name.clone(),
                reason: "tick_size and order_size must be > 0".into(),
            });
        }
        Ok(params)
    }
}

pub struct MarketMaker {
    name: String,
    subscription: Subscription,
    params: MarketMakerParams,
    last_quotes: HashMap<Instrument, (Decimal, Decimal)>,
}

impl MarketMaker {
    pub fn new(
        name: impl Into<String>,
        subscription: Subscription,
        params: MarketMakerParams,
    ) -> Self {
        Self {
            name: name.into(),
            subscription,
            params,
            last_quotes: HashMap::new(),
        }
    }

    pub fn from_config(config: &StrategyConfig) -> Result<Self, StrategyError> {
        Ok(Self::new(&config.name, config.subscription(), MarketMakerParams::from_config(config)?))
    }

    /// Bid and ask for `mid` at `position`, or None when the edge is too thin.
    pub fn quote(&self, mid: Decimal, position: Decimal) -> Option<(Decimal, Decimal)> {
        let p = &self.params;
        let half_spread = mid * p.spread_bps / dec!(20000);
        let skew = position * p.skew_factor;

        let bid = (mid - half_spread - skew).max(p.min_price);
        let ask = (mid + half_spread - skew).min(p.max_price);
        if ask - bid < p.min_edge * Decimal::TWO {
            return None;
        }

        let bid = (bid / p.tick_size).floor() * p.tick_size;
        let ask = (ask / p.tick_size).ceil() * p.tick_size;
        Some((bid, ask))
    }

    fn requote(&mut self, ctx: &StrategyContext, instrument: &Instrument) -> Vec<Signal> {
        if ctx.is_stale(instrument) {
            return Vec::new();
        }
        let Some(mid) = ctx.book(instrument).and_then(|b| b.mid()) else {
            return Vec::new();
        };
        let position = ctx.net_size(instrument);
        let Some((bid, ask)) = self.quote(mid, position) else {
            return Vec::new();
        };
        if self.last_quotes.get(instrument) == Some(&(bid, ask)) {
            return Vec::new();
        }

        let p = &self.params;
        let mut signals = vec![Signal::Cancel {
            instrument: instrument.clone(),
            price: None,
            urgency: Urgency::High,
        }];
        let buy_size = p.order_size.min(p.max_position - position);
        if buy_size > Decimal::ZERO {
            signals.push(Signal::buy(instrument.clone(), bid, buy_size, Urgency::Low));
        }
        let sell_size = p.order_size.min(p.max_position + position);
        if sell_size > Decimal::ZERO {
            signals.push(Signal::sell(instrument.clone(), ask, sell_size, Urgency::Low));
        }

        tracing::debug!(strategy = %self.name, %instrument, %mid, %position, %bid, %ask, "Requote");
        self.last_quotes.insert(instrument.clone(), (bid, ask));
        signals
    }

    fn watched(&self, ctx: &StrategyContext) -> Vec<Instrument> {
        if self.subscription.instruments.is_empty() {
            let mut all: Vec<Instrument> = ctx.books.keys().cloned().collect();
            all.sort();
            all
        } else {
            self.subscription.instruments.clone()
        }
    }
}

impl Strategy for MarketMaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscription(&self) -> Subscription {
        self.subscription.clone()
    }

    fn on_tick(&mut self, ctx: &StrategyContext) -> StrategyResult {
        let mut signals = Vec::new();
        for instrument in self.watched(ctx) {
            signals.extend(self.requote(ctx, &instrument));
        }
        Ok(signals)
    }

    fn on_book_update(&mut self, ctx: &StrategyContext, instrument: &Instrument) -> StrategyResult {
        Ok(self.requote(ctx, instrument))
    }

    fn on_fill(&mut self, _ctx: &StrategyContext, report: &ExecutionReport) -> StrategyResult {
        // inventory moved or a quote died: quote again on the next event
        self.last_quotes.remove(report.instrument());
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{BookSnapshot, OrderBook, PriceLevel};
    use crate::position::Position;
    use crate::risk::RiskLimits;
    use std::sync::Arc;

    fn ctx_with_book(bid: Decimal, ask: Decimal, position: Decimal) -> StrategyContext {
        let tok = Instrument::from("tok");
        let book = OrderBook::from_snapshot(&BookSnapshot {
            instrument: tok.clone(),
            bids: vec![PriceLevel::new(bid, dec!(100))],
            asks: vec![PriceLevel::new(ask, dec!(100))],
            sequence: 1,
            timestamp: chrono::Utc::now(),
        })
        .unwrap();
        let mut ctx = StrategyContext::new(RiskLimits::default());
        ctx.books.insert(tok.clone(), Arc::new(book));
        let mut pos = Position::new(tok.clone());
        pos.size = position;
        ctx.positions.insert(tok, pos);
        ctx
    }

    fn mm() -> MarketMaker {
        MarketMaker::new("mm", Subscription::all(), MarketMakerParams::default())
    }

    #[test]
    fn test_quote_flat_inventory() {
        // half spread = 0.5 * 200 / 20000 = 0.005
        assert_eq!(mm().quote(dec!(0.50), Decimal::ZERO), Some((dec!(0.49), dec!(0.51))));
    }

    #[test]
    fn test_quote_skews_against_inventory() {
        let (bid, ask) = mm().quote(dec!(0.50), dec!(50)).unwrap();
        assert!(bid < dec!(0.49));
        assert!(ask <= dec!(0.51));
    }

    #[test]
    fn test_quote_clamped() {
        let params = MarketMakerParams {
            spread_bps: dec!(10000),
            ..Default::default()
        };
        let s = MarketMaker::new("mm", Subscription::all(), params);
        // raw bid 0.0075 is below the price floor
        assert_eq!(s.quote(dec!(0.015), Decimal::ZERO), Some((dec!(0.01), dec!(0.03))));
    }

    #[test]
    fn test_requote_cancels_then_quotes() {
        let mut s = mm();
        let ctx = ctx_with_book(dec!(0.48), dec!(0.52), Decimal::ZERO);
        let signals = s.on_tick(&ctx).unwrap();
        assert_eq!(signals.len(), 3);
        assert!(matches!(signals[0], Signal::Cancel { price: None, .. }));
        assert_eq!(signals[1], Signal::buy("tok", dec!(0.49), dec!(10), Urgency::Low));
        assert_eq!(signals[2], Signal::sell("tok", dec!(0.51), dec!(10), Urgency::Low));

        // unchanged quote: nothing to do
        assert!(s.on_tick(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_position_cap_limits_side() {
        let mut s = mm();
        let ctx = ctx_with_book(dec!(0.48), dec!(0.52), dec!(95));
        let signals = s.on_tick(&ctx).unwrap();
        let buy = signals.iter().find_map(|s| match s {
            Signal::Buy(i) => Some(i.size),
            _ => None,
        });
        assert_eq!(buy, Some(dec!(5)));
    }

    #[test]
    fn test_stale_book_no_quotes() {
        let mut s = mm();
        let mut ctx = ctx_with_book(dec!(0.48), dec!(0.52), Decimal::ZERO);
        ctx.stale.insert(Instrument::from("tok"));
        assert!(s.on_tick(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_params_from_config() {
        let mut cfg = StrategyConfig::new("mm", "market_maker");
        cfg.params.insert("spread_bps".into(), toml::Value::Integer(400));
        cfg.params.insert("order_size".into(), toml::Value::Float(2.5));
        let params = MarketMakerParams::from_config(&cfg).unwrap();
        assert_eq!(params.spread_bps, dec!(400));
        assert_eq!(params.order_size, dec!(2.5));
        assert_eq!(params.tick_size, dec!(0.01));

        cfg.params.insert("tick_size".into(), toml::Value::Integer(0));
        assert!(MarketMakerParams::from_config(&cfg).is_err());
    }
}
