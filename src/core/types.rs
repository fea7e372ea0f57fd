//! Core types - Strong typing for safety

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Tradable outcome token (CLOB asset id). Immutable once referenced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Instrument {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Instrument {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Signed quantity for an unsigned size on this side.
    pub fn signed(self, size: Decimal) -> Decimal {
        size * self.sign()
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Signal priority. Higher urgency is risk-evaluated first within a cycle.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

/// Payload of a Buy/Sell signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub instrument: Instrument,
    pub price: Decimal,
    pub size: Decimal,
    #[serde(default)]
    pub urgency: Urgency,
}

impl OrderIntent {
    pub fn new(
        instrument: impl Into<Instrument>,
        price: Decimal,
        size: Decimal,
        urgency: Urgency,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            price,
            size,
            urgency,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// A strategy's decision for one evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Signal {
    Buy(OrderIntent),
    Sell(OrderIntent),
    /// Cancel working orders on an instrument. With `price` set, only the
    /// orders resting at exactly that price are canceled.
    Cancel {
        instrument: Instrument,
        #[serde(default)]
        price: Option<Decimal>,
        #[serde(default)]
        urgency: Urgency,
    },
    Hold,
}

impl Signal {
    pub fn buy(
        instrument: impl Into<Instrument>,
        price: Decimal,
        size: Decimal,
        urgency: Urgency,
    ) -> Self {
        Signal::Buy(OrderIntent::new(instrument, price, size, urgency))
    }

    pub fn sell(
        instrument: impl Into<Instrument>,
        price: Decimal,
        size: Decimal,
        urgency: Urgency,
    ) -> Self {
        Signal::Sell(OrderIntent::new(instrument, price, size, urgency))
    }

    pub fn cancel_all(instrument: impl Into<Instrument>) -> Self {
        Signal::Cancel {
            instrument: instrument.into(),
            price: None,
            urgency: Urgency::Normal,
        }
    }

    pub fn instrument(&self) -> Option<&Instrument> {
        match self {
            Signal::Buy(intent) | Signal::Sell(intent) => Some(&intent.instrument),
            Signal::Cancel { instrument, .. } => Some(instrument),
            Signal::Hold => None,
        }
    }

    /// Hold has no urgency; it sorts last.
    pub fn urgency(&self) -> Urgency {
        match self {
            Signal::Buy(intent) | Signal::Sell(intent) => intent.urgency,
            Signal::Cancel { urgency, .. } => *urgency,
            Signal::Hold => Urgency::Low,
        }
    }

    pub fn side(&self) -> Option<Side> {
        match self {
            Signal::Buy(_) => Some(Side::Buy),
            Signal::Sell(_) => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn intent(&self) -> Option<&OrderIntent> {
        match self {
            Signal::Buy(intent) | Signal::Sell(intent) => Some(intent),
            _ => None,
        }
    }

    /// Buy or Sell: the signals that can open risk.
    pub fn is_order(&self) -> bool {
        matches!(self, Signal::Buy(_) | Signal::Sell(_))
    }

    pub fn is_hold(&self) -> bool {
        matches!(self, Signal::Hold)
    }
}

/// Engine-assigned order id. Unique and monotonically increasing per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution reported by the venue. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    /// Venue trade id; duplicate notifications carry the same value.
    pub fill_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Execution outcome delivered to strategies through `on_fill`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionReport {
    Filled {
        instrument: Instrument,
        side: Side,
        fill: Fill,
        /// True once the order has no remaining size.
        complete: bool,
    },
    Rejected {
        order_id: OrderId,
        instrument: Instrument,
        side: Side,
        reason: String,
    },
}

impl ExecutionReport {
    pub fn instrument(&self) -> &Instrument {
        match self {
            ExecutionReport::Filled { instrument, .. }
            | ExecutionReport::Rejected { instrument, .. } => instrument,
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            ExecutionReport::Filled { fill, .. } => fill.order_id,
            ExecutionReport::Rejected { order_id, .. } => *order_id,
        }
    }
}

/// Order submission handed to the execution client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: OrderId,
    pub instrument: Instrument,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// Asynchronous result from the venue, delivered on the execution channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Ack { order_id: OrderId },
    Fill(Fill),
    Rejected { order_id: OrderId, reason: String },
    CancelAck { order_id: OrderId },
    CancelRejected { order_id: OrderId, reason: String },
}

impl ExecutionEvent {
    pub fn order_id(&self) -> OrderId {
        match self {
            ExecutionEvent::Fill(fill) => fill.order_id,
            ExecutionEvent::Ack { order_id }
            | ExecutionEvent::Rejected { order_id, .. }
            | ExecutionEvent::CancelAck { order_id }
            | ExecutionEvent::CancelRejected { order_id, .. } => *order_id,
        }
    }
}
