//! Execution layer - Order lifecycle
//!
//! ```text
//! Pending --ack--> Open --fill--> PartiallyFilled --fill--> Filled
//! Pending --reject--> Rejected
//! Open | PartiallyFilled --cancel ack--> Canceled
//! ```
//!
//! Terminal states (Filled, Canceled, Rejected) are final. Every venue
//! notification may be duplicated, so each handler is idempotent.

pub mod paper;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::{
    Error, ExecutionReport, Fill, Instrument, OrderId, OrderIntent, OrderRequest, Result, Side,
};
use crate::position::PositionTracker;

pub use crate::core::{ExecutionClient, ExecutionEvent};
pub use paper::PaperExecutionClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OrderState {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Canceled | OrderState::Rejected)
    }

    /// Can still trade or be canceled.
    pub fn is_working(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, target: OrderState) -> bool {
        match self {
            OrderState::Pending => matches!(
                target,
                OrderState::Open
                    | OrderState::PartiallyFilled
                    | OrderState::Filled
                    | OrderState::Rejected
                    | OrderState::Canceled
            ),
            OrderState::Open => matches!(
                target,
                OrderState::PartiallyFilled | OrderState::Filled | OrderState::Canceled
            ),
            OrderState::PartiallyFilled => matches!(
                target,
                OrderState::PartiallyFilled | OrderState::Filled | OrderState::Canceled
            ),
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected => false,
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub instrument: Instrument,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub state: OrderState,
    /// Strategy that emitted the signal
    pub strategy: String,
    /// Cancel sent, confirmation outstanding
    pub cancel_requested: bool,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.size - self.filled_size
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_working(&self) -> bool {
        self.state.is_working()
    }

    /// Acknowledged by the venue and not yet terminal.
    pub fn is_cancelable(&self) -> bool {
        matches!(self.state, OrderState::Open | OrderState::PartiallyFilled)
    }

    fn transition(&mut self, to: OrderState) -> std::result::Result<(), OrderError> {
        if !self.state.can_transition_to(to) {
            return Err(OrderError::InvalidTransition {
                order_id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderError {
    #[error("order {order_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderState,
        to: OrderState,
    },

    #[error("order {order_id}: submission failed: {reason}")]
    SubmitFailed { order_id: OrderId, reason: String },
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Cancel sent; `on_cancel_ack` completes it
    Requested,
    /// A cancel is already outstanding
    AlreadyRequested,
    /// Filled, canceled or rejected already
    AlreadyTerminal,
    /// Still Pending; the venue has not acknowledged the order
    NotCancelable,
    Unknown,
    /// Transport error sending the cancel
    Failed(String),
}

/// Owns every order of the run.
pub struct OrderManager {
    client: Arc<dyn ExecutionClient>,
    orders: BTreeMap<OrderId, Order>,
    seen_fills: HashSet<String>,
    fills: Vec<Fill>,
    next_id: u64,
}

impl OrderManager {
    pub fn new(client: Arc<dyn ExecutionClient>) -> Self {
        Self {
            client,
            orders: BTreeMap::new(),
            seen_fills: HashSet::new(),
            fills: Vec::new(),
            next_id: 1,
        }
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    /// Create a Pending order and hand it to the venue.
    ///
    /// On a transport error the order is marked Rejected before returning
    /// [`OrderError::SubmitFailed`].
    pub async fn submit(
        &mut self,
        intent: &OrderIntent,
        side: Side,
        strategy: &str,
    ) -> std::result::Result<OrderId, OrderError> {
        let id = OrderId(self.next_id);
        self.next_id += 1;

        let now = Utc::now();
        let order = Order {
            id,
            instrument: intent.instrument.clone(),
            side,
            price: intent.price,
            size: intent.size,
            filled_size: Decimal::ZERO,
            state: OrderState::Pending,
            strategy: strategy.to_string(),
            cancel_requested: false,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        };
        let request = OrderRequest {
            order_id: id,
            instrument: order.instrument.clone(),
            side,
            price: order.price,
            size: order.size,
        };
        self.orders.insert(id, order);

        info!(
            order_id = %id,
            %side,
            instrument = %intent.instrument,
            price = %intent.price,
            size = %intent.size,
            strategy,
            "Submitting order"
        );

        if let Err(e) = self.client.submit(&request).await {
            let reason = e.to_string();
            warn!(order_id = %id, error = %reason, "Submission failed");
            if let Some(order) = self.orders.get_mut(&id) {
                order.transition(OrderState::Rejected)?;
                order.reject_reason = Some(reason.clone());
            }
            return Err(OrderError::SubmitFailed { order_id: id, reason });
        }
        Ok(id)
    }

    /// Pending -> Open. Returns true if this call opened the order.
    pub fn on_ack(&mut self, order_id: OrderId) -> bool {
        let Some(order) = self.orders.get_mut(&order_id) else {
            warn!(%order_id, "Ack for unknown order");
            return false;
        };
        if order.state != OrderState::Pending {
            debug!(%order_id, state = %order.state, "Duplicate or late ack ignored");
            return false;
        }
        order.state = OrderState::Open;
        order.updated_at = Utc::now();
        debug!(%order_id, "Order open");
        true
    }

    /// Apply a fill. Returns the report for strategies, or None when the
    /// fill was a duplicate or cannot affect positions.
    ///
    /// Non-positive sizes and fills larger than the remaining quantity are
    /// invariant violations.
    pub fn on_fill(
        &mut self,
        fill: &Fill,
        positions: &mut PositionTracker,
    ) -> Result<Option<ExecutionReport>> {
        if self.seen_fills.contains(&fill.fill_id) {
            debug!(fill_id = %fill.fill_id, order_id = %fill.order_id, "Duplicate fill ignored");
            return Ok(None);
        }
        let Some(order) = self.orders.get_mut(&fill.order_id) else {
            warn!(
                fill_id = %fill.fill_id,
                order_id = %fill.order_id,
                "Fill for unknown order ignored"
            );
            return Ok(None);
        };

        if fill.size <= Decimal::ZERO || fill.price <= Decimal::ZERO {
            return Err(Error::InvariantViolation(format!(
                "order {}: fill {} has size {} @ {}",
                order.id, fill.fill_id, fill.size, fill.price
            )));
        }
        if matches!(order.state, OrderState::Canceled | OrderState::Rejected) {
            warn!(
                order_id = %order.id,
                fill_id = %fill.fill_id,
                state = %order.state,
                "Fill after terminal state ignored"
            );
            self.seen_fills.insert(fill.fill_id.clone());
            return Ok(None);
        }
        if fill.size > order.remaining() {
            return Err(Error::InvariantViolation(format!(
                "order {}: fill {} of {} exceeds remaining {}",
                order.id,
                fill.fill_id,
                fill.size,
                order.remaining()
            )));
        }

        order.filled_size += fill.size;
        let next = if order.remaining().is_zero() {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        order
            .transition(next)
            .map_err(|e| Error::InvariantViolation(e.to_string()))?;

        positions.apply_fill(&order.instrument, order.side.signed(fill.size), fill.price)?;
        self.seen_fills.insert(fill.fill_id.clone());
        self.fills.push(fill.clone());

        info!(
            order_id = %order.id,
            fill_id = %fill.fill_id,
            price = %fill.price,
            size = %fill.size,
            filled = %order.filled_size,
            state = %order.state,
            "Fill applied"
        );

        Ok(Some(ExecutionReport::Filled {
            instrument: order.instrument.clone(),
            side: order.side,
            fill: fill.clone(),
            complete: order.state == OrderState::Filled,
        }))
    }

    /// Pending -> Rejected. No position effect.
    pub fn on_reject(&mut self, order_id: OrderId, reason: &str) -> Option<ExecutionReport> {
        let Some(order) = self.orders.get_mut(&order_id) else {
            warn!(%order_id, reason, "Reject for unknown order");
            return None;
        };
        if order.state != OrderState::Pending {
            debug!(%order_id, state = %order.state, reason, "Reject ignored");
            return None;
        }
        order.state = OrderState::Rejected;
        order.reject_reason = Some(reason.to_string());
        order.updated_at = Utc::now();
        warn!(%order_id, instrument = %order.instrument, reason, "Order rejected by venue");

        Some(ExecutionReport::Rejected {
            order_id,
            instrument: order.instrument.clone(),
            side: order.side,
            reason: reason.to_string(),
        })
    }

    /// Request cancellation. Only acknowledged, non-terminal orders can be
    /// canceled; the order stays working until [`on_cancel_ack`].
    ///
    /// [`on_cancel_ack`]: OrderManager::on_cancel_ack
    pub async fn cancel(&mut self, order_id: OrderId) -> CancelOutcome {
        let Some(order) = self.orders.get_mut(&order_id) else {
            return CancelOutcome::Unknown;
        };
        if order.is_terminal() {
            debug!(%order_id, state = %order.state, "Cancel on terminal order is a no-op");
            return CancelOutcome::AlreadyTerminal;
        }
        if !order.is_cancelable() {
            return CancelOutcome::NotCancelable;
        }
        if order.cancel_requested {
            return CancelOutcome::AlreadyRequested;
        }

        order.cancel_requested = true;
        info!(%order_id, instrument = %order.instrument, "Cancel requested");
        match self.client.cancel(order_id).await {
            Ok(()) => CancelOutcome::Requested,
            Err(e) => {
                warn!(%order_id, error = %e, "Cancel request failed");
                if let Some(order) = self.orders.get_mut(&order_id) {
                    order.cancel_requested = false;
                }
                CancelOutcome::Failed(e.to_string())
            }
        }
    }

    /// Venue confirmed the cancel. A fill that completed the order first wins.
    pub fn on_cancel_ack(&mut self, order_id: OrderId) -> bool {
        let Some(order) = self.orders.get_mut(&order_id) else {
            warn!(%order_id, "Cancel ack for unknown order");
            return false;
        };
        if order.is_terminal() {
            debug!(%order_id, state = %order.state, "Cancel ack after terminal state");
            return false;
        }
        order.state = OrderState::Canceled;
        order.cancel_requested = false;
        order.updated_at = Utc::now();
        info!(%order_id, filled = %order.filled_size, "Order canceled");
        true
    }

    pub fn on_cancel_rejected(&mut self, order_id: OrderId, reason: &str) {
        if let Some(order) = self.orders.get_mut(&order_id) {
            order.cancel_requested = false;
            warn!(%order_id, state = %order.state, reason, "Cancel rejected");
        }
    }

    /// Cancel working orders on an instrument, optionally only those at `price`.
    pub async fn cancel_instrument(
        &mut self,
        instrument: &Instrument,
        price: Option<Decimal>,
    ) -> Vec<(OrderId, CancelOutcome)> {
        let ids: Vec<OrderId> = self
            .working_for(instrument)
            .filter(|o| price.is_none_or(|p| o.price == p))
            .map(|o| o.id)
            .collect();
        self.cancel_ids(ids).await
    }

    /// Cancel every working order.
    pub async fn cancel_all(&mut self) -> Vec<(OrderId, CancelOutcome)> {
        let ids: Vec<OrderId> = self.working_orders().map(|o| o.id).collect();
        self.cancel_ids(ids).await
    }

    async fn cancel_ids(&mut self, ids: Vec<OrderId>) -> Vec<(OrderId, CancelOutcome)> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = self.cancel(id).await;
            outcomes.push((id, outcome));
        }
        outcomes
    }

    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    /// Non-terminal orders in id order.
    pub fn working_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| o.is_working())
    }

    pub fn working_for<'a>(
        &'a self,
        instrument: &'a Instrument,
    ) -> impl Iterator<Item = &'a Order> + 'a {
        self.working_orders().filter(move |o| &o.instrument == instrument)
    }

    pub fn all_terminal(&self) -> bool {
        self.orders.values().all(Order::is_terminal)
    }

    /// Ids of orders whose final state is not known.
    pub fn unresolved(&self) -> Vec<OrderId> {
        self.working_orders().map(|o| o.id).collect()
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    /// Every fill applied so far, in arrival order.
    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }
}
