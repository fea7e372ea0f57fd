//! Property-based tests for position, risk and order-lifecycle invariants.

use async_trait::async_trait;
use chrono::Utc;
use clob_engine::core::{
    ExecutionClient, Fill, Instrument, OrderId, OrderIntent, OrderRequest, Side, Signal, Urgency,
};
use clob_engine::execution::{OrderManager, OrderState};
use clob_engine::position::PositionTracker;
use clob_engine::risk::{ExposureSnapshot, RiskLimits, RiskManager};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct NullClient;

#[async_trait]
impl ExecutionClient for NullClient {
    async fn submit(&self, _request: &OrderRequest) -> clob_engine::Result<()> {
        Ok(())
    }

    async fn cancel(&self, _order_id: OrderId) -> clob_engine::Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..100i64).prop_map(|x| Decimal::new(x, 2)) // 0.01 to 0.99
}

fn size_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..100_000i64).prop_map(|x| Decimal::new(x, 2)) // 0.01 to 1000
}

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

fn urgency_strategy() -> impl Strategy<Value = Urgency> {
    prop_oneof![Just(Urgency::Low), Just(Urgency::Normal), Just(Urgency::High)]
}

fn instrument_strategy() -> impl Strategy<Value = Instrument> {
    prop_oneof![
        Just(Instrument::from("a")),
        Just(Instrument::from("b")),
        Just(Instrument::from("c"))
    ]
}

const PRICE: Decimal = dec!(0.50);

fn signal_strategy() -> impl Strategy<Value = Signal> {
    (instrument_strategy(), side_strategy(), 1i64..1500i64, urgency_strategy()).prop_map(
        |(instrument, side, size, urgency)| {
            let size = Decimal::from(size);
            match side {
                Side::Buy => Signal::buy(instrument, PRICE, size, urgency),
                Side::Sell => Signal::sell(instrument, PRICE, size, urgency),
            }
        },
    )
}

/// Positions and working quantity per side, priced at `PRICE`.
#[derive(Debug, Default)]
struct WorstCase {
    positions: HashMap<Instrument, Decimal>,
    buys: HashMap<Instrument, Decimal>,
    sells: HashMap<Instrument, Decimal>,
}

impl WorstCase {
    fn add(&mut self, instrument: &Instrument, side: Side, size: Decimal) {
        let book = match side {
            Side::Buy => &mut self.buys,
            Side::Sell => &mut self.sells,
        };
        *book.entry(instrument.clone()).or_default() += size;
    }

    /// Largest |position| reachable by filling every order on one side.
    fn extreme(&self, instrument: &Instrument) -> Decimal {
        let get = |m: &HashMap<Instrument, Decimal>| m.get(instrument).copied().unwrap_or_default();
        let position = get(&self.positions);
        (position + get(&self.buys)).abs().max((position - get(&self.sells)).abs())
    }

    fn instruments(&self) -> HashSet<&Instrument> {
        self.positions.keys().chain(self.buys.keys()).chain(self.sells.keys()).collect()
    }

    fn exposure(&self) -> Decimal {
        self.instruments().into_iter().map(|i| self.extreme(i) * PRICE).sum()
    }

    fn within(&self, limits: &RiskLimits) -> bool {
        self.instruments().into_iter().all(|i| self.extreme(i) <= limits.max_position_size)
            && self.exposure() <= limits.max_total_exposure
    }
}

#[derive(Debug, Clone)]
enum Venue {
    Ack,
    Fill(Decimal),
    Reject,
    Cancel,
    CancelAck,
    CancelRejected,
}

fn venue_strategy() -> impl Strategy<Value = Venue> {
    prop_oneof![
        Just(Venue::Ack),
        (1i64..=40i64).prop_map(|x| Venue::Fill(Decimal::from(x))),
        Just(Venue::Reject),
        Just(Venue::Cancel),
        Just(Venue::CancelAck),
        Just(Venue::CancelRejected),
    ]
}

proptest! {
    /// Net size is the signed sum of every fill since start
    #[test]
    fn net_size_is_sum_of_fills(
        fills in prop::collection::vec((side_strategy(), size_strategy(), price_strategy()), 1..60),
    ) {
        let tok = Instrument::from("tok");
        let mut tracker = PositionTracker::new();
        let mut expected = Decimal::ZERO;
        for (side, size, price) in &fills {
            tracker.apply_fill(&tok, side.signed(*size), *price).unwrap();
            expected += side.signed(*size);
        }

        let position = tracker.get(&tok).unwrap();
        prop_assert_eq!(position.size, expected);
        if position.size.is_zero() {
            prop_assert_eq!(position.avg_entry_price, Decimal::ZERO);
        } else {
            prop_assert!(position.avg_entry_price > Decimal::ZERO);
        }
    }

    /// However positions, working orders and a batch are composed, no
    /// approval lets any fill order push a position or the total exposure
    /// past its limit
    #[test]
    fn batch_never_breaches_limits(
        existing in prop::collection::vec((instrument_strategy(), -800i64..800i64), 0..3),
        working in prop::collection::vec(
            (instrument_strategy(), side_strategy(), 1i64..600i64),
            0..6,
        ),
        batch in prop::collection::vec(signal_strategy(), 1..20),
    ) {
        let limits = RiskLimits {
            max_position_size: dec!(1000),
            max_total_exposure: dec!(1200),
            max_order_notional: None,
            max_open_orders: None,
            max_loss: None,
        };
        let mut model = WorstCase::default();
        let mut snapshot = ExposureSnapshot::new();
        for (instrument, size) in existing {
            let size = Decimal::from(size);
            snapshot = snapshot.with_position(instrument.clone(), size, PRICE);
            model.positions.insert(instrument, size);
        }
        for (instrument, side, size) in working {
            let size = Decimal::from(size);
            snapshot.reserve(&instrument, side, size, PRICE);
            model.add(&instrument, side, size);
        }
        prop_assume!(model.within(&limits));

        let risk = RiskManager::new(limits.clone());
        let decisions = risk.evaluate_batch(batch, &mut snapshot);
        for (signal, decision) in &decisions {
            if let (Ok(()), Some(intent), Some(side)) = (decision, signal.intent(), signal.side()) {
                model.add(&intent.instrument, side, intent.size);
            }
        }

        prop_assert!(model.within(&limits), "{:?}", model);
        prop_assert_eq!(snapshot.total_exposure(), model.exposure());
        // evaluation order is by descending urgency
        let urgencies: Vec<Urgency> = decisions.iter().map(|(s, _)| s.urgency()).collect();
        prop_assert!(urgencies.windows(2).all(|w| w[0] >= w[1]));
    }

    /// Once an order reaches Filled, Canceled or Rejected nothing moves it
    #[test]
    fn terminal_states_are_final(events in prop::collection::vec(venue_strategy(), 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let mut om = OrderManager::new(Arc::new(NullClient));
            let mut positions = PositionTracker::new();
            let intent = OrderIntent::new("tok", dec!(0.50), dec!(100), Urgency::Normal);
            let id = om.submit(&intent, Side::Buy, "prop").await.unwrap();

            let mut terminal: Option<OrderState> = None;
            for (n, event) in events.iter().enumerate() {
                match event {
                    Venue::Ack => {
                        om.on_ack(id);
                    }
                    Venue::Fill(size) => {
                        let fill = Fill {
                            order_id: id,
                            fill_id: format!("f{}", n),
                            price: dec!(0.50),
                            size: *size,
                            timestamp: Utc::now(),
                        };
                        // an overfill is refused without touching the order
                        let _ = om.on_fill(&fill, &mut positions);
                    }
                    Venue::Reject => {
                        om.on_reject(id, "rejected");
                    }
                    Venue::Cancel => {
                        om.cancel(id).await;
                    }
                    Venue::CancelAck => {
                        om.on_cancel_ack(id);
                    }
                    Venue::CancelRejected => om.on_cancel_rejected(id, "too late"),
                }

                let order = om.get(id).unwrap();
                if let Some(state) = terminal {
                    prop_assert_eq!(order.state, state);
                } else if order.state.is_terminal() {
                    terminal = Some(order.state);
                }
                prop_assert!(order.filled_size <= order.size);
                prop_assert_eq!(positions.net_size(&Instrument::from("tok")), order.filled_size);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
