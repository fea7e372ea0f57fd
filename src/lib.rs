//! CLOB engine - Core Library
//! Strategy signals, risk gate and order lifecycle over a central limit order book

// Public modules
pub mod core;
pub mod orderbook;
pub mod position;
pub mod risk;
pub mod execution;
pub mod strategies;
pub mod feeds;
pub mod engine;

// Re-exports
pub use core::{Config, Error, Result};
pub use engine::{Engine, EngineEvent, ShutdownHandle, ShutdownReport};
