//! Trading strategies - Strategy framework

pub mod traits;
pub mod runtime;
pub mod market_maker;
pub mod spread_watcher;

pub use traits::{
    EventKind, Strategy, StrategyConfig, StrategyContext, StrategyError, StrategyResult,
    Subscription,
};
pub use runtime::{ShutdownRequest, StrategyImpl, StrategyRuntime, StrategySignal};
pub use market_maker::{MarketMaker, MarketMakerParams};
pub use spread_watcher::{SpreadWatcher, SpreadWatcherParams};
