//! Risk Gate — hard limits checked before any order leaves the engine.
//!
//! Evaluation is pure: a signal is checked against an [`ExposureSnapshot`]
//! and the limits, nothing is mutated. Batches are evaluated highest urgency
//! first and every approval is applied to the snapshot before the next
//! signal is looked at, so signals racing on the same cycle cannot jointly
//! breach a limit.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::{Error, Instrument, OrderIntent, Result, Side, Signal};
use crate::position::PositionTracker;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskRejection {
    #[error("invalid order {size} @ {price}")]
    InvalidOrder { price: Decimal, size: Decimal },

    #[error("{instrument}: position {current} + order {delta} exceeds max position {limit}")]
    PositionLimit {
        instrument: Instrument,
        current: Decimal,
        delta: Decimal,
        limit: Decimal,
    },

    #[error("total exposure {current} -> {resulting} exceeds max {limit}")]
    ExposureLimit {
        current: Decimal,
        resulting: Decimal,
        limit: Decimal,
    },

    #[error("order notional {notional} exceeds max {limit}")]
    OrderTooLarge { notional: Decimal, limit: Decimal },

    #[error("{open} working orders, max {limit}")]
    TooManyOpenOrders { open: usize, limit: usize },
}

/// Risk limits. Immutable for the life of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Max |net size| per instrument, in shares
    pub max_position_size: Decimal,
    /// Max Σ |size| × price across instruments
    pub max_total_exposure: Decimal,
    /// Max price × size of a single order
    pub max_order_notional: Option<Decimal>,
    /// Max working orders across instruments
    pub max_open_orders: Option<usize>,
    /// Loss (realized + unrealized) that trips the circuit breaker
    pub max_loss: Option<Decimal>,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: Decimal::from(1000),
            max_total_exposure: Decimal::from(5000),
            max_order_notional: Some(Decimal::from(500)),
            max_open_orders: Some(50),
            max_loss: Some(Decimal::from(500)),
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: Decimal| {
            if v > Decimal::ZERO {
                Ok(())
            } else {
                Err(Error::Config(format!("risk.{} must be > 0, got {}", name, v)))
            }
        };
        positive("max_position_size", self.max_position_size)?;
        positive("max_total_exposure", self.max_total_exposure)?;
        if let Some(v) = self.max_order_notional {
            positive("max_order_notional", v)?;
        }
        if let Some(v) = self.max_loss {
            positive("max_loss", v)?;
        }
        if self.max_open_orders == Some(0) {
            return Err(Error::Config("risk.max_open_orders must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Exposure {
    /// Filled position
    size: Decimal,
    price: Decimal,
    /// Working buy quantity
    pending_buy: Decimal,
    /// Working sell quantity
    pending_sell: Decimal,
}

impl Exposure {
    fn new(size: Decimal, price: Decimal) -> Self {
        Self {
            size,
            price,
            pending_buy: Decimal::ZERO,
            pending_sell: Decimal::ZERO,
        }
    }

    /// Position if every working order on `side` filled and none on the other.
    fn worst_case(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.size + self.pending_buy,
            Side::Sell => self.size - self.pending_sell,
        }
    }

    fn worst_abs(&self) -> Decimal {
        self.worst_case(Side::Buy)
            .abs()
            .max(self.worst_case(Side::Sell).abs())
    }

    fn add(&mut self, side: Side, quantity: Decimal) {
        match side {
            Side::Buy => self.pending_buy += quantity,
            Side::Sell => self.pending_sell += quantity,
        }
    }
}

/// Projected book of risk: positions plus working orders.
///
/// Working buys and sells are kept apart and never net against each other.
/// Each side is judged as if all of its orders filled and none of the
/// other side's did, and an instrument's exposure is the larger of the two.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExposureSnapshot {
    entries: HashMap<Instrument, Exposure>,
    open_orders: usize,
}

impl ExposureSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_positions(positions: &PositionTracker) -> Self {
        let entries = positions
            .iter()
            .map(|p| (p.instrument.clone(), Exposure::new(p.size, p.reference_price())))
            .collect();
        Self {
            entries,
            open_orders: 0,
        }
    }

    /// Add a position directly.
    pub fn with_position(
        mut self,
        instrument: impl Into<Instrument>,
        size: Decimal,
        price: Decimal,
    ) -> Self {
        self.entries.insert(instrument.into(), Exposure::new(size, price));
        self
    }

    /// Reserve a working order's remaining quantity.
    pub fn reserve(
        &mut self,
        instrument: &Instrument,
        side: Side,
        remaining: Decimal,
        price: Decimal,
    ) {
        self.entries
            .entry(instrument.clone())
            .or_insert(Exposure::new(Decimal::ZERO, price))
            .add(side, remaining);
        self.open_orders += 1;
    }

    /// Record an approved order, repricing its instrument at the order price.
    pub fn apply(&mut self, signal: &Signal) {
        let (Some(intent), Some(side)) = (signal.intent(), signal.side()) else {
            return;
        };
        let entry = self
            .entries
            .entry(intent.instrument.clone())
            .or_insert(Exposure::new(Decimal::ZERO, intent.price));
        entry.add(side, intent.size);
        entry.price = intent.price;
        self.open_orders += 1;
    }

    /// Filled position, ignoring working orders.
    pub fn net_size(&self, instrument: &Instrument) -> Decimal {
        self.entries.get(instrument).map_or(Decimal::ZERO, |e| e.size)
    }

    /// Position if every working order on `side` filled.
    pub fn worst_case(&self, instrument: &Instrument, side: Side) -> Decimal {
        self.entries
            .get(instrument)
            .map_or(Decimal::ZERO, |e| e.worst_case(side))
    }

    pub fn total_exposure(&self) -> Decimal {
        self.entries.values().map(|e| e.worst_abs() * e.price).sum()
    }

    /// Exposure if `instrument` took `entry`'s place.
    fn exposure_with(&self, instrument: &Instrument, entry: &Exposure) -> Decimal {
        let others: Decimal = self
            .entries
            .iter()
            .filter(|(i, _)| *i != instrument)
            .map(|(_, e)| e.worst_abs() * e.price)
            .sum();
        others + entry.worst_abs() * entry.price
    }

    pub fn open_orders(&self) -> usize {
        self.open_orders
    }
}

/// Check one signal against the snapshot.
///
/// Checks run in order: position, total exposure, order notional, open
/// orders; the first failure is returned. Orders that shrink an already
/// breached position or exposure are let through. Cancel and Hold always pass.
pub fn evaluate(
    signal: &Signal,
    snapshot: &ExposureSnapshot,
    limits: &RiskLimits,
) -> std::result::Result<(), RiskRejection> {
    let (Some(intent), Some(side)) = (signal.intent(), signal.side()) else {
        return Ok(());
    };
    check_order(intent, side, snapshot, limits)
}

fn check_order(
    intent: &OrderIntent,
    side: Side,
    snapshot: &ExposureSnapshot,
    limits: &RiskLimits,
) -> std::result::Result<(), RiskRejection> {
    if intent.size <= Decimal::ZERO || intent.price <= Decimal::ZERO {
        return Err(RiskRejection::InvalidOrder {
            price: intent.price,
            size: intent.size,
        });
    }

    let existing = snapshot
        .entries
        .get(&intent.instrument)
        .copied()
        .unwrap_or(Exposure::new(Decimal::ZERO, intent.price));
    let mut projected = existing;
    projected.add(side, intent.size);
    projected.price = intent.price;

    // 1. Position, on the order's own side
    let current = existing.worst_case(side);
    let delta = side.signed(intent.size);
    let resulting = projected.worst_case(side);
    if resulting.abs() > limits.max_position_size && resulting.abs() > current.abs() {
        return Err(RiskRejection::PositionLimit {
            instrument: intent.instrument.clone(),
            current,
            delta,
            limit: limits.max_position_size,
        });
    }

    // 2. Total exposure
    let current_exposure = snapshot.total_exposure();
    let resulting_exposure = snapshot.exposure_with(&intent.instrument, &projected);
    if resulting_exposure > limits.max_total_exposure && resulting_exposure > current_exposure {
        return Err(RiskRejection::ExposureLimit {
            current: current_exposure,
            resulting: resulting_exposure,
            limit: limits.max_total_exposure,
        });
    }

    // 3. Order size
    if let Some(limit) = limits.max_order_notional {
        let notional = intent.notional();
        if notional > limit {
            return Err(RiskRejection::OrderTooLarge { notional, limit });
        }
    }

    // 4. Working orders
    if let Some(limit) = limits.max_open_orders {
        if snapshot.open_orders() >= limit {
            return Err(RiskRejection::TooManyOpenOrders {
                open: snapshot.open_orders(),
                limit,
            });
        }
    }

    Ok(())
}

/// Stateless gate around the run's limits.
#[derive(Debug, Clone)]
pub struct RiskManager {
    limits: RiskLimits,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn evaluate(
        &self,
        signal: &Signal,
        snapshot: &ExposureSnapshot,
    ) -> std::result::Result<(), RiskRejection> {
        evaluate(signal, snapshot, &self.limits)
    }

    /// Evaluate a cycle's signals, highest urgency first.
    ///
    /// `batch` must be in strategy registration order (then emission order);
    /// the sort is stable so that order breaks urgency ties. Approved orders
    /// are applied to `snapshot`. Decisions come back in evaluation order.
    pub fn evaluate_batch<T: AsRef<Signal>>(
        &self,
        mut batch: Vec<T>,
        snapshot: &mut ExposureSnapshot,
    ) -> Vec<(T, std::result::Result<(), RiskRejection>)> {
        batch.sort_by_key(|item| std::cmp::Reverse(item.as_ref().urgency()));
        batch
            .into_iter()
            .map(|item| {
                let decision = self.evaluate(item.as_ref(), snapshot);
                if decision.is_ok() {
                    snapshot.apply(item.as_ref());
                }
                (item, decision)
            })
            .collect()
    }
}

impl AsRef<Signal> for Signal {
    fn as_ref(&self) -> &Signal {
        self
    }
}

/// Halts new risk once total P&L falls below `-max_loss`. Stays tripped for
/// the rest of the run.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    max_loss: Option<Decimal>,
    tripped: Option<String>,
}

impl CircuitBreaker {
    pub fn new(max_loss: Option<Decimal>) -> Self {
        Self { max_loss, tripped: None }
    }

    /// Returns true only on the check that trips the breaker.
    pub fn check(&mut self, total_pnl: Decimal) -> bool {
        let Some(max_loss) = self.max_loss else {
            return false;
        };
        if self.tripped.is_some() || total_pnl >= -max_loss {
            return false;
        }
        let reason = format!("max loss exceeded: {} < -{}", total_pnl, max_loss);
        tracing::error!(%total_pnl, %max_loss, "CIRCUIT BREAKER TRIGGERED");
        self.tripped = Some(reason);
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.is_some()
    }

    pub fn reason(&self) -> Option<&str> {
        self.tripped.as_deref()
    }
}

/// Relative deviation of a fill from the book mid when it exceeds
/// `max_deviation`, else None. No reference price means nothing to compare.
pub fn fill_price_anomaly(
    fill_price: Decimal,
    reference_mid: Option<Decimal>,
    max_deviation: Decimal,
) -> Option<Decimal> {
    let mid = reference_mid.filter(|m| *m > Decimal::ZERO)?;
    let deviation = (fill_price - mid).abs() / mid;
    (deviation > max_deviation).then_some(deviation)
}
