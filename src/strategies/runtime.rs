//! Strategy runtime - registration, dispatch and fault containment

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::{Error, ExecutionReport, Instrument, Result, Signal};

use super::{
    EventKind, MarketMaker, SpreadWatcher, Strategy, StrategyConfig, StrategyContext,
    StrategyError, StrategyResult, Subscription,
};

/// Registered strategy. Built-ins dispatch statically; anything else goes
/// through `Dyn`.
pub enum StrategyImpl {
    MarketMaker(MarketMaker),
    SpreadWatcher(SpreadWatcher),
    Dyn(Box<dyn Strategy>),
}

impl StrategyImpl {
    /// Registry of built-in kinds.
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let invalid = |e: StrategyError| Error::Config(e.to_string());
        match config.kind.as_str() {
            "market_maker" => Ok(Self::MarketMaker(
                MarketMaker::from_config(config).map_err(invalid)?,
            )),
            "spread_watcher" => Ok(Self::SpreadWatcher(
                SpreadWatcher::from_config(config).map_err(invalid)?,
            )),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

impl Strategy for StrategyImpl {
    fn name(&self) -> &str {
        match self {
            Self::MarketMaker(s) => s.name(),
            Self::SpreadWatcher(s) => s.name(),
            Self::Dyn(s) => s.name(),
        }
    }

    fn subscription(&self) -> Subscription {
        match self {
            Self::MarketMaker(s) => s.subscription(),
            Self::SpreadWatcher(s) => s.subscription(),
            Self::Dyn(s) => s.subscription(),
        }
    }

    fn on_tick(&mut self, ctx: &StrategyContext) -> StrategyResult {
        match self {
            Self::MarketMaker(s) => s.on_tick(ctx),
            Self::SpreadWatcher(s) => s.on_tick(ctx),
            Self::Dyn(s) => s.on_tick(ctx),
        }
    }

    fn on_book_update(&mut self, ctx: &StrategyContext, instrument: &Instrument) -> StrategyResult {
        match self {
            Self::MarketMaker(s) => s.on_book_update(ctx, instrument),
            Self::SpreadWatcher(s) => s.on_book_update(ctx, instrument),
            Self::Dyn(s) => s.on_book_update(ctx, instrument),
        }
    }

    fn on_fill(&mut self, ctx: &StrategyContext, report: &ExecutionReport) -> StrategyResult {
        match self {
            Self::MarketMaker(s) => s.on_fill(ctx, report),
            Self::SpreadWatcher(s) => s.on_fill(ctx, report),
            Self::Dyn(s) => s.on_fill(ctx, report),
        }
    }
}

impl From<Box<dyn Strategy>> for StrategyImpl {
    fn from(strategy: Box<dyn Strategy>) -> Self {
        Self::Dyn(strategy)
    }
}

impl From<MarketMaker> for StrategyImpl {
    fn from(strategy: MarketMaker) -> Self {
        Self::MarketMaker(strategy)
    }
}

impl From<SpreadWatcher> for StrategyImpl {
    fn from(strategy: SpreadWatcher) -> Self {
        Self::SpreadWatcher(strategy)
    }
}

/// A signal tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySignal {
    /// Registration index
    pub strategy: usize,
    pub strategy_name: Arc<str>,
    pub signal: Signal,
}

impl AsRef<Signal> for StrategySignal {
    fn as_ref(&self) -> &Signal {
        &self.signal
    }
}

/// A strategy asking the engine to stop.
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownRequest {
    pub strategy: Arc<str>,
    pub reason: String,
}

struct Slot {
    strategy: StrategyImpl,
    name: Arc<str>,
    subscription: Subscription,
    faults: u64,
}

/// Strategy runner - invokes strategies in registration order
#[derive(Default)]
pub struct StrategyRuntime {
    slots: Vec<Slot>,
    shutdown: Option<ShutdownRequest>,
}

impl StrategyRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every enabled strategy from configuration.
    pub fn from_configs(configs: &[StrategyConfig]) -> Result<Self> {
        let mut runtime = Self::new();
        for config in configs.iter().filter(|c| c.enabled) {
            runtime.register(StrategyImpl::from_config(config)?);
            tracing::info!(name = %config.name, kind = %config.kind, "Strategy registered");
        }
        Ok(runtime)
    }

    pub fn register(&mut self, strategy: impl Into<StrategyImpl>) {
        let strategy = strategy.into();
        let name: Arc<str> = Arc::from(strategy.name());
        let subscription = strategy.subscription();
        self.slots.push(Slot {
            strategy,
            name,
            subscription,
            faults: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.name.as_ref())
    }

    /// Faults (errors and panics) across all strategies.
    pub fn fault_count(&self) -> u64 {
        self.slots.iter().map(|s| s.faults).sum()
    }

    /// First shutdown request since the last call, if any.
    pub fn take_shutdown_request(&mut self) -> Option<ShutdownRequest> {
        self.shutdown.take()
    }

    pub fn on_tick(&mut self, ctx: &StrategyContext) -> Vec<StrategySignal> {
        self.dispatch(EventKind::Tick, None, |s| s.on_tick(ctx))
    }

    pub fn on_book_update(
        &mut self,
        ctx: &StrategyContext,
        instrument: &Instrument,
    ) -> Vec<StrategySignal> {
        self.dispatch(EventKind::Book, Some(instrument), |s| {
            s.on_book_update(ctx, instrument)
        })
    }

    pub fn on_fill(
        &mut self,
        ctx: &StrategyContext,
        report: &ExecutionReport,
    ) -> Vec<StrategySignal> {
        self.dispatch(EventKind::Fill, Some(report.instrument()), |s| {
            s.on_fill(ctx, report)
        })
    }

    /// Invoke every subscribed strategy. A fault yields no signals for that
    /// strategy this cycle; the others still run. Hold signals are dropped.
    fn dispatch<F>(
        &mut self,
        kind: EventKind,
        instrument: Option<&Instrument>,
        mut call: F,
    ) -> Vec<StrategySignal>
    where
        F: FnMut(&mut StrategyImpl) -> StrategyResult,
    {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.subscription.matches(kind, instrument) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| call(&mut slot.strategy))) {
                Ok(Ok(signals)) => {
                    out.extend(signals.into_iter().filter(|s| !s.is_hold()).map(|signal| {
                        StrategySignal {
                            strategy: index,
                            strategy_name: slot.name.clone(),
                            signal,
                        }
                    }));
                }
                Ok(Err(StrategyError::Shutdown(reason))) => {
                    info!(strategy = %slot.name, %reason, "Strategy requested shutdown");
                    self.shutdown.get_or_insert(ShutdownRequest {
                        strategy: slot.name.clone(),
                        reason,
                    });
                }
                Ok(Err(e)) => {
                    slot.faults += 1;
                    warn!(
                        strategy = %slot.name,
                        event = ?kind,
                        error = %e,
                        "Strategy error, holding"
                    );
                }
                Err(panic) => {
                    slot.faults += 1;
                    error!(
                        strategy = %slot.name,
                        event = ?kind,
                        panic = panic_message(panic.as_ref()),
                        "Strategy panicked, holding"
                    );
                }
            }
        }
        out
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Urgency;
    use crate::risk::RiskLimits;
    use rust_decimal_macros::dec;

    struct Fixed {
        name: &'static str,
        signals: Vec<Signal>,
    }

    impl Strategy for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn on_tick(&mut self, _ctx: &StrategyContext) -> StrategyResult {
            Ok(self.signals.clone())
        }
    }

    struct Failing;

    impl Strategy for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_tick(&mut self, _ctx: &StrategyContext) -> StrategyResult {
            Err(StrategyError::Failed("no model".into()))
        }
    }

    struct Panicking;

    impl Strategy for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn on_tick(&mut self, _ctx: &StrategyContext) -> StrategyResult {
            panic!("index out of bounds");
        }
    }

    fn fixed(name: &'static str, signals: Vec<Signal>) -> Box<dyn Strategy> {
        Box::new(Fixed { name, signals })
    }

    #[test]
    fn test_registration_order_and_tagging() {
        let mut rt = StrategyRuntime::new();
        let buy = Signal::buy("x", dec!(0.1), dec!(1), Urgency::Low);
        rt.register(fixed("a", vec![buy, Signal::Hold]));
        rt.register(fixed("b", vec![Signal::cancel_all("x")]));

        let out = rt.on_tick(&StrategyContext::new(RiskLimits::default()));
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].strategy, out[0].strategy_name.as_ref()), (0, "a"));
        assert_eq!((out[1].strategy, out[1].strategy_name.as_ref()), (1, "b"));
    }

    #[test]
    fn test_faults_are_contained() {
        let mut rt = StrategyRuntime::new();
        rt.register(Box::new(Failing) as Box<dyn Strategy>);
        rt.register(Box::new(Panicking) as Box<dyn Strategy>);
        rt.register(fixed("ok", vec![Signal::cancel_all("x")]));

        let out = rt.on_tick(&StrategyContext::new(RiskLimits::default()));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].strategy, 2);
        assert_eq!(rt.fault_count(), 2);
    }

    /// Emits a signal on every callback it receives.
    struct Eager {
        subscription: Subscription,
    }

    impl Strategy for Eager {
        fn name(&self) -> &str {
            "eager"
        }

        fn subscription(&self) -> Subscription {
            self.subscription.clone()
        }

        fn on_tick(&mut self, _ctx: &StrategyContext) -> StrategyResult {
            Ok(vec![Signal::cancel_all("tick")])
        }

        fn on_book_update(
            &mut self,
            _ctx: &StrategyContext,
            instrument: &Instrument,
        ) -> StrategyResult {
            Ok(vec![Signal::cancel_all(instrument.clone())])
        }
    }

    struct Quitter;

    impl Strategy for Quitter {
        fn name(&self) -> &str {
            "quitter"
        }

        fn on_tick(&mut self, _ctx: &StrategyContext) -> StrategyResult {
            Err(StrategyError::Shutdown("market resolved".into()))
        }
    }

    #[test]
    fn test_subscription_filters_instruments_and_events() {
        let mut rt = StrategyRuntime::new();
        rt.register(Box::new(Eager {
            subscription: Subscription {
                instruments: vec![Instrument::from("watched")],
                events: vec![EventKind::Book],
            },
        }) as Box<dyn Strategy>);
        let ctx = StrategyContext::new(RiskLimits::default());

        assert_eq!(rt.on_book_update(&ctx, &Instrument::from("watched")).len(), 1);
        assert!(rt.on_book_update(&ctx, &Instrument::from("other")).is_empty());
        assert!(rt.on_tick(&ctx).is_empty());
        assert_eq!(rt.fault_count(), 0);

        let mut all = StrategyRuntime::new();
        all.register(Box::new(Eager {
            subscription: Subscription::all(),
        }) as Box<dyn Strategy>);
        assert_eq!(all.on_tick(&ctx).len(), 1);
        assert_eq!(all.on_book_update(&ctx, &Instrument::from("other")).len(), 1);
    }

    #[test]
    fn test_shutdown_request_is_not_a_fault() {
        let mut rt = StrategyRuntime::new();
        rt.register(Box::new(Quitter) as Box<dyn Strategy>);
        rt.register(fixed("ok", vec![Signal::cancel_all("x")]));

        let out = rt.on_tick(&StrategyContext::new(RiskLimits::default()));
        assert_eq!(out.len(), 1);
        assert_eq!(rt.fault_count(), 0);
        let request = rt.take_shutdown_request().unwrap();
        assert_eq!(request.strategy.as_ref(), "quitter");
        assert_eq!(request.reason, "market resolved");
        assert!(rt.take_shutdown_request().is_none());
    }

    #[test]
    fn test_registry() {
        let configs = vec![
            StrategyConfig::new("mm", "market_maker"),
            StrategyConfig {
                enabled: false,
                ..StrategyConfig::new("off", "spread_watcher")
            },
        ];
        let rt = StrategyRuntime::from_configs(&configs).unwrap();
        assert_eq!(rt.names().collect::<Vec<_>>(), vec!["mm"]);

        let unknown = StrategyRuntime::from_configs(&[StrategyConfig::new("x", "martingale")]);
        assert!(matches!(unknown, Err(Error::UnknownStrategy(k)) if k == "martingale"));
    }
}
