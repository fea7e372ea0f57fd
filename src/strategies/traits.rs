//! Strategy traits, configuration and the per-dispatch context

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::core::{ExecutionReport, Instrument, Signal};
use crate::orderbook::OrderBook;
use crate::position::Position;
use crate::risk::RiskLimits;

/// Strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Strategy name, unique per run
    pub name: String,

    /// Registry key of the implementation
    pub kind: String,

    /// Instruments to watch (empty = all)
    #[serde(default)]
    pub instruments: Vec<Instrument>,

    /// Callbacks to receive (empty = all)
    #[serde(default)]
    pub events: Vec<EventKind>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Kind-specific parameters
    #[serde(flatten)]
    pub params: toml::Table,
}

fn default_enabled() -> bool {
    true
}

impl StrategyConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            instruments: Vec::new(),
            events: Vec::new(),
            enabled: true,
            params: toml::Table::new(),
        }
    }

    pub fn subscription(&self) -> Subscription {
        Subscription {
            instruments: self.instruments.clone(),
            events: self.events.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Tick,
    Book,
    Fill,
}

/// Which callbacks a strategy receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    /// Empty means every instrument
    pub instruments: Vec<Instrument>,
    /// Empty means every event kind
    pub events: Vec<EventKind>,
}

impl Subscription {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn instruments(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        Self {
            instruments: instruments.into_iter().collect(),
            events: Vec::new(),
        }
    }

    /// Ticks carry no instrument and pass any instrument filter.
    pub fn matches(&self, kind: EventKind, instrument: Option<&Instrument>) -> bool {
        let kind_ok = self.events.is_empty() || self.events.contains(&kind);
        let instrument_ok = match instrument {
            Some(i) => self.instruments.is_empty() || self.instruments.contains(i),
            None => true,
        };
        kind_ok && instrument_ok
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    #[error("{0}")]
    Failed(String),

    #[error("missing data for {0}")]
    MissingData(Instrument),

    #[error("strategy '{strategy}': invalid params: {reason}")]
    InvalidParams { strategy: String, reason: String },

    /// Stop the engine: cancel working orders and drain. Not a fault.
    #[error("shutdown requested: {0}")]
    Shutdown(String),
}

pub type StrategyResult = std::result::Result<Vec<Signal>, StrategyError>;

/// Read-only view handed to strategies, rebuilt for every dispatch.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub timestamp: DateTime<Utc>,
    pub books: HashMap<Instrument, Arc<OrderBook>>,
    pub positions: HashMap<Instrument, Position>,
    pub limits: RiskLimits,
    /// Instruments whose data is stale or missing; orders on them are dropped
    pub stale: HashSet<Instrument>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

impl StrategyContext {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            timestamp: Utc::now(),
            books: HashMap::new(),
            positions: HashMap::new(),
            limits,
            stale: HashSet::new(),
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
        }
    }

    pub fn book(&self, instrument: &Instrument) -> Option<&OrderBook> {
        self.books.get(instrument).map(Arc::as_ref)
    }

    pub fn position(&self, instrument: &Instrument) -> Option<&Position> {
        self.positions.get(instrument)
    }

    pub fn net_size(&self, instrument: &Instrument) -> Decimal {
        self.positions.get(instrument).map_or(Decimal::ZERO, |p| p.size)
    }

    pub fn is_stale(&self, instrument: &Instrument) -> bool {
        self.stale.contains(instrument) || !self.books.contains_key(instrument)
    }
}

/// Trading strategy.
///
/// Callbacks return the cycle's signals; an empty vector is a Hold. An
/// `Err` or a panic is contained by the runtime and counted as a fault.
pub trait Strategy: Send {
    /// Strategy name
    fn name(&self) -> &str;

    /// Events this strategy wants
    fn subscription(&self) -> Subscription {
        Subscription::all()
    }

    /// Periodic tick
    fn on_tick(&mut self, _ctx: &StrategyContext) -> StrategyResult {
        Ok(Vec::new())
    }

    /// A book changed
    fn on_book_update(
        &mut self,
        _ctx: &StrategyContext,
        _instrument: &Instrument,
    ) -> StrategyResult {
        Ok(Vec::new())
    }

    /// A fill or an exchange rejection for an order
    fn on_fill(&mut self, _ctx: &StrategyContext, _report: &ExecutionReport) -> StrategyResult {
        Ok(Vec::new())
    }
}
