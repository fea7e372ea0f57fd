//! Position and P&L tracking.
//!
//! Positions change only through fills. Net size is signed (long > 0,
//! short < 0); the average entry price is the VWAP of the currently open
//! quantity.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::{Error, Instrument, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: Instrument,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub last_price: Option<Decimal>,
}

impl Position {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            size: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            last_price: None,
        }
    }

    /// Apply a signed fill quantity at `price`.
    ///
    /// Extending recomputes the VWAP. Reducing realizes P&L on the closed
    /// quantity at the prior average and leaves the average alone; a flip
    /// starts the new side at the fill price. A zero quantity or a
    /// non-positive price is an invariant violation and changes nothing.
    pub fn apply_fill(&mut self, signed_size: Decimal, price: Decimal) -> Result<()> {
        if signed_size.is_zero() || price <= Decimal::ZERO {
            return Err(Error::InvariantViolation(format!(
                "{}: fill of {} @ {}",
                self.instrument, signed_size, price
            )));
        }
        let old = self.size;
        let extending = old.is_zero() || old.is_sign_positive() == signed_size.is_sign_positive();

        if extending {
            let old_qty = old.abs();
            let add_qty = signed_size.abs();
            self.avg_entry_price =
                (old_qty * self.avg_entry_price + add_qty * price) / (old_qty + add_qty);
            self.size = old + signed_size;
        } else {
            let closed = signed_size.abs().min(old.abs());
            let direction = if old.is_sign_positive() {
                Decimal::ONE
            } else {
                Decimal::NEGATIVE_ONE
            };
            self.realized_pnl += closed * (price - self.avg_entry_price) * direction;
            self.size = old + signed_size;

            if self.size.is_zero() {
                self.avg_entry_price = Decimal::ZERO;
            } else if self.size.is_sign_positive() != old.is_sign_positive() {
                self.avg_entry_price = price;
            }
        }

        self.refresh_unrealized();
        Ok(())
    }

    /// Mark to `price`.
    pub fn update_price(&mut self, price: Decimal) {
        self.last_price = Some(price);
        self.refresh_unrealized();
    }

    fn refresh_unrealized(&mut self) {
        self.unrealized_pnl = match self.last_price {
            Some(price) if !self.size.is_zero() => self.size * (price - self.avg_entry_price),
            _ => Decimal::ZERO,
        };
    }

    /// Price used to value the position: last mark, else entry.
    pub fn reference_price(&self) -> Decimal {
        self.last_price.unwrap_or(self.avg_entry_price)
    }

    pub fn notional(&self) -> Decimal {
        self.size.abs() * self.reference_price()
    }

    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }
}

/// Owns every position. Entries are created on first reference and never
/// removed, only brought back to zero.
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    positions: HashMap<Instrument, Position>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&mut self, instrument: &Instrument) -> &mut Position {
        self.positions
            .entry(instrument.clone())
            .or_insert_with(|| Position::new(instrument.clone()))
    }

    pub fn apply_fill(
        &mut self,
        instrument: &Instrument,
        signed_size: Decimal,
        price: Decimal,
    ) -> Result<&Position> {
        let position = self.get_or_create(instrument);
        position.apply_fill(signed_size, price)?;
        tracing::info!(
            %instrument,
            size = %position.size,
            avg_entry = %position.avg_entry_price,
            realized_pnl = %position.realized_pnl,
            "Position updated"
        );
        Ok(position)
    }

    pub fn mark(&mut self, instrument: &Instrument, price: Decimal) {
        self.get_or_create(instrument).update_price(price);
    }

    pub fn get(&self, instrument: &Instrument) -> Option<&Position> {
        self.positions.get(instrument)
    }

    /// Net size, zero for never-traded instruments.
    pub fn net_size(&self, instrument: &Instrument) -> Decimal {
        self.positions.get(instrument).map_or(Decimal::ZERO, |p| p.size)
    }

    /// Σ |size| × price, where `prices` overrides the reference price of the
    /// instruments it names.
    pub fn exposure(&self, prices: &HashMap<Instrument, Decimal>) -> Decimal {
        self.positions
            .values()
            .map(|p| {
                let price = prices
                    .get(&p.instrument)
                    .copied()
                    .unwrap_or_else(|| p.reference_price());
                p.size.abs() * price
            })
            .sum()
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    pub fn total_unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    pub fn total_pnl(&self) -> Decimal {
        self.total_realized_pnl() + self.total_unrealized_pnl()
    }

    pub fn active_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| !p.is_flat())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Owned copy for strategy contexts and risk snapshots.
    pub fn snapshot(&self) -> HashMap<Instrument, Position> {
        self.positions.clone()
    }
}
