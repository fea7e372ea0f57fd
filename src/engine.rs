//! Engine - the single decision loop.
//!
//! Fans in periodic ticks, market data, execution reports and shutdown
//! requests. Every event is processed to completion before the next one is
//! selected; books, positions and orders are owned here and strategies only
//! ever see copies.
//!
//! ```text
//! feeds ──MarketEvent──┐
//! venue ──ExecutionEvent┤──> Engine ──> StrategyRuntime ──> RiskManager
//! tick / shutdown ─────┘                                         │
//!                              ExecutionClient <── OrderManager <┘
//! ```

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, error, info, warn};

use crate::core::config::EngineConfig;
use crate::core::{
    Config, Error, ExecutionClient, ExecutionEvent, ExecutionReport, Instrument, OrderId,
    OrderIntent, Result, Side, Signal,
};
use crate::execution::{OrderError, OrderManager};
use crate::orderbook::{BookStore, MarketEvent};
use crate::position::PositionTracker;
use crate::risk::{CircuitBreaker, ExposureSnapshot, RiskManager, fill_price_anomaly};
use crate::strategies::{StrategyContext, StrategyRuntime, StrategySignal};

/// One unit of work for the loop.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Tick,
    Market(MarketEvent),
    Execution(ExecutionEvent),
    /// A submission failed in transport; strategies see it as a rejection
    SubmitFailed(ExecutionReport),
    MarketClosed,
    ExecutionClosed,
    ShutdownRequested,
    /// Shutdown grace period is over
    DrainDeadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    MaxTicks,
    StrategyRequested,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Shutdown => write!(f, "shutdown requested"),
            StopReason::MaxTicks => write!(f, "max ticks reached"),
            StopReason::StrategyRequested => write!(f, "strategy requested shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(StopReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub ticks: u64,
    pub book_updates: u64,
    /// Snapshots and deltas discarded as malformed, crossed or out of sequence
    pub book_rejects: u64,
    pub signals: u64,
    pub approved: u64,
    pub risk_rejections: u64,
    pub suppressed_stale: u64,
    pub suppressed_warmup: u64,
    pub suppressed_halted: u64,
    pub submit_failures: u64,
    pub fills: u64,
    pub exchange_rejects: u64,
    pub strategy_faults: u64,
    pub fill_anomalies: u64,
}

/// What `run` returns on an orderly stop.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub reason: StopReason,
    /// Orders whose final state was still unknown at exit
    pub unresolved: Vec<OrderId>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub stats: EngineStats,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Requests a graceful shutdown. Cheap to clone; safe from any task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone, Copy)]
struct Drain {
    reason: StopReason,
    deadline: Instant,
}

pub struct Engine {
    config: EngineConfig,
    books: BookStore,
    positions: PositionTracker,
    risk: RiskManager,
    breaker: CircuitBreaker,
    orders: OrderManager,
    strategies: StrategyRuntime,
    market_rx: flume::Receiver<MarketEvent>,
    execution_rx: flume::Receiver<ExecutionEvent>,
    market_open: bool,
    execution_open: bool,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    ticker: Interval,
    deferred: VecDeque<ExecutionReport>,
    drain: Option<Drain>,
    stats: EngineStats,
}

impl Engine {
    /// Must be called inside a Tokio runtime: the tick timer starts here and
    /// first fires one interval from now.
    pub fn new(
        config: &Config,
        client: Arc<dyn ExecutionClient>,
        strategies: StrategyRuntime,
        market_rx: flume::Receiver<MarketEvent>,
        execution_rx: flume::Receiver<ExecutionEvent>,
    ) -> Self {
        let period = config.engine.tick_interval().max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config: config.engine.clone(),
            books: BookStore::new(config.engine.staleness_window()),
            positions: PositionTracker::new(),
            risk: RiskManager::new(config.risk.clone()),
            breaker: CircuitBreaker::new(config.risk.max_loss),
            orders: OrderManager::new(client),
            strategies,
            market_rx,
            execution_rx,
            market_open: true,
            execution_open: true,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            ticker,
            deferred: VecDeque::new(),
            drain: None,
            stats: EngineStats::default(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn books(&self) -> &BookStore {
        &self.books
    }

    pub fn positions(&self) -> &PositionTracker {
        &self.positions
    }

    pub fn orders(&self) -> &OrderManager {
        &self.orders
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_some()
    }

    pub fn is_halted(&self) -> bool {
        self.breaker.is_tripped()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            strategy_faults: self.strategies.fault_count(),
            ..self.stats.clone()
        }
    }

    /// Run until shutdown, `max_ticks` or a fatal error.
    ///
    /// A fatal error triggers a best-effort cancel of every working order
    /// before it is returned.
    pub async fn run(&mut self) -> Result<ShutdownReport> {
        info!(
            strategies = ?self.strategies.names().collect::<Vec<_>>(),
            client = self.orders.client_name(),
            tick_ms = self.config.tick_interval_ms,
            max_ticks = ?self.config.max_ticks,
            "Engine started"
        );

        loop {
            let event = self.next_event().await;
            match self.handle_event(event).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop(reason)) => return Ok(self.report(reason)),
                Err(e) => {
                    error!(error = %e, "Engine failed, canceling working orders");
                    let outcomes = self.orders.cancel_all().await;
                    warn!(count = outcomes.len(), "Best-effort cancel issued");
                    return Err(e);
                }
            }
        }
    }

    /// Wait for the next event from any source.
    ///
    /// Events from a single source come out in the order that source produced
    /// them. When several sources are ready at once which one is picked is
    /// unspecified: there is no ordering between a book update and an
    /// execution report that arrive together.
    pub async fn next_event(&mut self) -> EngineEvent {
        if let Some(report) = self.deferred.pop_front() {
            return EngineEvent::SubmitFailed(report);
        }

        let draining = self.drain.is_some();
        let deadline = self.drain.map_or_else(Instant::now, |d| d.deadline);

        tokio::select! {
            _ = self.ticker.tick(), if !draining => EngineEvent::Tick,
            event = self.market_rx.recv_async(), if self.market_open => match event {
                Ok(event) => EngineEvent::Market(event),
                Err(_) => EngineEvent::MarketClosed,
            },
            event = self.execution_rx.recv_async(), if self.execution_open => match event {
                Ok(event) => EngineEvent::Execution(event),
                Err(_) => EngineEvent::ExecutionClosed,
            },
            _ = self.shutdown_rx.changed(), if !draining => EngineEvent::ShutdownRequested,
            _ = sleep_until(deadline), if draining => EngineEvent::DrainDeadline,
        }
    }

    /// Process one event to completion.
    pub async fn handle_event(&mut self, event: EngineEvent) -> Result<Flow> {
        match event {
            EngineEvent::Tick => self.on_tick().await?,
            EngineEvent::Market(event) => self.on_market(event).await?,
            EngineEvent::Execution(event) => self.on_execution(event).await?,
            EngineEvent::SubmitFailed(report) => {
                if !self.is_draining() {
                    self.dispatch_report(&report).await?;
                }
            }
            EngineEvent::MarketClosed => {
                if !self.is_draining() {
                    return Err(Error::FeedClosed);
                }
                self.market_open = false;
            }
            EngineEvent::ExecutionClosed => {
                if !self.is_draining() {
                    return Err(Error::ExecutionClosed);
                }
                self.execution_open = false;
            }
            EngineEvent::ShutdownRequested => self.begin_drain(StopReason::Shutdown).await,
            EngineEvent::DrainDeadline => {
                if let Some(drain) = self.drain {
                    let unresolved = self.orders.unresolved();
                    warn!(count = unresolved.len(), ?unresolved, "Shutdown grace period expired");
                    return Ok(Flow::Stop(drain.reason));
                }
            }
        }
        Ok(self.drain_progress())
    }

    fn drain_progress(&self) -> Flow {
        match self.drain {
            Some(drain) if self.orders.all_terminal() => Flow::Stop(drain.reason),
            _ => Flow::Continue,
        }
    }

    /// Stop taking signals and cancel whatever can be canceled. Pending
    /// orders are canceled as their acks come in.
    async fn begin_drain(&mut self, reason: StopReason) {
        if self.drain.is_some() {
            return;
        }
        let grace = self.config.shutdown_grace();
        self.drain = Some(Drain {
            reason,
            deadline: Instant::now() + grace,
        });
        info!(%reason, grace_ms = self.config.shutdown_grace_ms, "Draining");

        for (order_id, outcome) in self.orders.cancel_all().await {
            debug!(%order_id, ?outcome, "Shutdown cancel");
        }
    }

    async fn on_tick(&mut self) -> Result<()> {
        if self.is_draining() {
            return Ok(());
        }
        self.stats.ticks += 1;
        self.sweep_stale();

        if self.config.max_ticks.is_some_and(|max| self.stats.ticks >= max) {
            info!(ticks = self.stats.ticks, "Max ticks reached");
            self.begin_drain(StopReason::MaxTicks).await;
            return Ok(());
        }

        self.check_breaker();
        let ctx = self.context();
        let signals = self.strategies.on_tick(&ctx);
        self.process_signals(signals).await
    }

    async fn on_market(&mut self, event: MarketEvent) -> Result<()> {
        let now = Instant::now();
        let (instrument, applied) = match &event {
            MarketEvent::Snapshot(snapshot) => (
                &snapshot.instrument,
                self.books.apply_snapshot(snapshot, now),
            ),
            MarketEvent::Delta(delta) => (&delta.instrument, self.books.apply_delta(delta, now)),
            MarketEvent::FeedFailed { reason } => return Err(Error::FeedFailed(reason.clone())),
        };

        if let Err(e) = applied {
            self.stats.book_rejects += 1;
            warn!(%instrument, error = %e, "Book update discarded");
            return Ok(());
        }
        self.stats.book_updates += 1;
        self.mark(instrument);
        self.check_breaker();

        if self.is_draining() {
            return Ok(());
        }
        self.sweep_stale();
        let ctx = self.context();
        let signals = self.strategies.on_book_update(&ctx, instrument);
        self.process_signals(signals).await
    }

    async fn on_execution(&mut self, event: ExecutionEvent) -> Result<()> {
        match event {
            ExecutionEvent::Ack { order_id } => {
                if self.orders.on_ack(order_id) && self.is_draining() {
                    let outcome = self.orders.cancel(order_id).await;
                    info!(%order_id, ?outcome, "Canceling order acked during shutdown");
                }
            }
            ExecutionEvent::Fill(fill) => {
                let reference = self
                    .orders
                    .get(fill.order_id)
                    .and_then(|o| self.books.mid(&o.instrument));
                let Some(report) = self.orders.on_fill(&fill, &mut self.positions)? else {
                    return Ok(());
                };
                self.stats.fills += 1;

                let anomaly = self
                    .config
                    .max_fill_deviation
                    .and_then(|max| fill_price_anomaly(fill.price, reference, max));
                if let Some(deviation) = anomaly {
                    self.stats.fill_anomalies += 1;
                    warn!(
                        order_id = %fill.order_id,
                        fill_id = %fill.fill_id,
                        price = %fill.price,
                        mid = ?reference,
                        %deviation,
                        "Fill price far from book mid"
                    );
                }

                self.mark(report.instrument());
                self.check_breaker();
                if !self.is_draining() {
                    self.dispatch_report(&report).await?;
                }
            }
            ExecutionEvent::Rejected { order_id, reason } => {
                if let Some(report) = self.orders.on_reject(order_id, &reason) {
                    self.stats.exchange_rejects += 1;
                    if !self.is_draining() {
                        self.dispatch_report(&report).await?;
                    }
                }
            }
            ExecutionEvent::CancelAck { order_id } => {
                self.orders.on_cancel_ack(order_id);
            }
            ExecutionEvent::CancelRejected { order_id, reason } => {
                self.orders.on_cancel_rejected(order_id, &reason);
            }
        }
        Ok(())
    }

    async fn dispatch_report(&mut self, report: &ExecutionReport) -> Result<()> {
        self.sweep_stale();
        let ctx = self.context();
        let signals = self.strategies.on_fill(&ctx, report);
        self.process_signals(signals).await
    }

    /// Re-evaluate book freshness. Runs before every strategy dispatch so a
    /// book that aged out between ticks is never traded on.
    fn sweep_stale(&mut self) {
        for instrument in self.books.sweep_stale(Instant::now()) {
            warn!(
                %instrument,
                window_ms = self.config.staleness_window_ms,
                "Book stale, orders suppressed"
            );
        }
    }

    /// Re-mark an existing position at the book mid.
    fn mark(&mut self, instrument: &Instrument) {
        if self.positions.get(instrument).is_none() {
            return;
        }
        if let Some(mid) = self.books.mid(instrument) {
            self.positions.mark(instrument, mid);
        }
    }

    fn check_breaker(&mut self) {
        if self.breaker.check(self.positions.total_pnl()) {
            warn!(
                reason = self.breaker.reason().unwrap_or_default(),
                "Trading halted, cancels only"
            );
        }
    }

    /// Gate, risk-check and execute one cycle's signals.
    async fn process_signals(&mut self, signals: Vec<StrategySignal>) -> Result<()> {
        if let Some(request) = self.strategies.take_shutdown_request() {
            info!(
                strategy = %request.strategy,
                reason = %request.reason,
                dropped = signals.len(),
                "Stopping on strategy request"
            );
            self.begin_drain(StopReason::StrategyRequested).await;
            return Ok(());
        }
        if signals.is_empty() {
            return Ok(());
        }
        self.stats.signals += signals.len() as u64;
        let warming_up = self.stats.book_updates < self.config.warmup_updates;

        let mut batch = Vec::with_capacity(signals.len());
        for tagged in signals {
            if let Some(intent) = tagged.signal.intent() {
                if self.breaker.is_tripped() {
                    self.stats.suppressed_halted += 1;
                    debug!(
                        strategy = %tagged.strategy_name,
                        signal = ?tagged.signal,
                        "Halted, order dropped"
                    );
                    continue;
                }
                if warming_up {
                    self.stats.suppressed_warmup += 1;
                    debug!(
                        strategy = %tagged.strategy_name,
                        signal = ?tagged.signal,
                        "Warming up, order dropped"
                    );
                    continue;
                }
                if self.books.is_stale(&intent.instrument) {
                    self.stats.suppressed_stale += 1;
                    warn!(
                        strategy = %tagged.strategy_name,
                        instrument = %intent.instrument,
                        "No fresh book, order dropped"
                    );
                    continue;
                }
            }
            batch.push(tagged);
        }

        let mut snapshot = self.risk_snapshot();
        for (tagged, decision) in self.risk.evaluate_batch(batch, &mut snapshot) {
            match decision {
                Ok(()) => {
                    self.stats.approved += 1;
                    self.execute(tagged).await?;
                }
                Err(rejection) => {
                    self.stats.risk_rejections += 1;
                    warn!(
                        strategy = %tagged.strategy_name,
                        signal = ?tagged.signal,
                        reason = %rejection,
                        "Signal rejected by risk"
                    );
                }
            }
        }
        Ok(())
    }

    /// Positions plus every working order's remaining size.
    fn risk_snapshot(&self) -> ExposureSnapshot {
        let mut snapshot = ExposureSnapshot::from_positions(&self.positions);
        for order in self.orders.working_orders() {
            snapshot.reserve(&order.instrument, order.side, order.remaining(), order.price);
        }
        snapshot
    }

    async fn execute(&mut self, tagged: StrategySignal) -> Result<()> {
        let StrategySignal {
            strategy_name, signal, ..
        } = tagged;
        match signal {
            Signal::Buy(intent) => self.submit(intent, Side::Buy, &strategy_name).await,
            Signal::Sell(intent) => self.submit(intent, Side::Sell, &strategy_name).await,
            Signal::Cancel { instrument, price, .. } => {
                for (order_id, outcome) in self.orders.cancel_instrument(&instrument, price).await {
                    debug!(strategy = %strategy_name, %order_id, ?outcome, "Cancel");
                }
                Ok(())
            }
            Signal::Hold => Ok(()),
        }
    }

    async fn submit(&mut self, intent: OrderIntent, side: Side, strategy: &str) -> Result<()> {
        match self.orders.submit(&intent, side, strategy).await {
            Ok(_) => Ok(()),
            Err(OrderError::SubmitFailed { order_id, reason }) => {
                self.stats.submit_failures += 1;
                self.deferred.push_back(ExecutionReport::Rejected {
                    order_id,
                    instrument: intent.instrument,
                    side,
                    reason,
                });
                Ok(())
            }
            Err(e) => Err(Error::InvariantViolation(e.to_string())),
        }
    }

    fn context(&self) -> StrategyContext {
        StrategyContext {
            timestamp: Utc::now(),
            books: self.books.snapshot(),
            positions: self.positions.snapshot(),
            limits: self.risk.limits().clone(),
            stale: self.books.stale().clone(),
            realized_pnl: self.positions.total_realized_pnl(),
            unrealized_pnl: self.positions.total_unrealized_pnl(),
        }
    }

    fn report(&self, reason: StopReason) -> ShutdownReport {
        let report = ShutdownReport {
            reason,
            unresolved: self.orders.unresolved(),
            realized_pnl: self.positions.total_realized_pnl(),
            unrealized_pnl: self.positions.total_unrealized_pnl(),
            stats: self.stats(),
        };
        if report.is_clean() {
            info!(%reason, stats = ?report.stats, "Engine stopped");
        } else {
            warn!(
                %reason,
                unresolved = ?report.unresolved,
                stats = ?report.stats,
                "Engine stopped with unresolved orders"
            );
        }
        report
    }
}
