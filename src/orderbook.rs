//! Per-instrument L2 order books and the store that tracks their freshness.
//!
//! Books are built from a full snapshot and then advanced by sequenced
//! deltas. An invalid update (stale sequence, crossed result, malformed
//! level) is rejected as a whole and the last good book is kept.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::core::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Full book state. Bids descending, asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub instrument: Instrument,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Incremental update. A level with size 0 removes that price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    pub instrument: Instrument,
    pub sequence: u64,
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Market-data message as produced by a feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    Snapshot(BookSnapshot),
    Delta(BookDelta),
    /// The source gave up after its own reconnect policy.
    FeedFailed { reason: String },
}

impl MarketEvent {
    pub fn instrument(&self) -> Option<&Instrument> {
        match self {
            MarketEvent::Snapshot(s) => Some(&s.instrument),
            MarketEvent::Delta(d) => Some(&d.instrument),
            MarketEvent::FeedFailed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BookError {
    #[error("{instrument}: delta sequence {received} is not newer than {current}")]
    OutOfSequence {
        instrument: Instrument,
        current: u64,
        received: u64,
    },

    #[error("{instrument}: crossed book (bid {bid} >= ask {ask})")]
    Crossed {
        instrument: Instrument,
        bid: Decimal,
        ask: Decimal,
    },

    #[error("{instrument}: malformed update: {reason}")]
    Malformed { instrument: Instrument, reason: String },

    #[error("{0}: delta received before any snapshot")]
    NoSnapshot(Instrument),
}

#[derive(Debug, Clone, Copy)]
enum BookSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBook {
    instrument: Instrument,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    sequence: u64,
    timestamp: DateTime<Utc>,
}

impl OrderBook {
    /// Build a book from a snapshot, validating ordering, sizes and crossing.
    pub fn from_snapshot(snapshot: &BookSnapshot) -> Result<Self, BookError> {
        let instrument = &snapshot.instrument;
        check_ladder(instrument, &snapshot.bids, BookSide::Bid)?;
        check_ladder(instrument, &snapshot.asks, BookSide::Ask)?;

        let book = Self {
            instrument: instrument.clone(),
            bids: snapshot.bids.iter().map(|l| (l.price, l.size)).collect(),
            asks: snapshot.asks.iter().map(|l| (l.price, l.size)).collect(),
            sequence: snapshot.sequence,
            timestamp: snapshot.timestamp,
        };
        book.check_crossed()?;
        Ok(book)
    }

    /// Apply a delta atomically: either every level change lands or none does.
    pub fn apply_delta(&mut self, delta: &BookDelta) -> Result<(), BookError> {
        if delta.instrument != self.instrument {
            return Err(BookError::Malformed {
                instrument: self.instrument.clone(),
                reason: format!("delta for {}", delta.instrument),
            });
        }
        if delta.sequence <= self.sequence {
            return Err(BookError::OutOfSequence {
                instrument: self.instrument.clone(),
                current: self.sequence,
                received: delta.sequence,
            });
        }
        for level in delta.bids.iter().chain(&delta.asks) {
            if level.price <= Decimal::ZERO || level.size < Decimal::ZERO {
                return Err(BookError::Malformed {
                    instrument: self.instrument.clone(),
                    reason: format!("level {} x {}", level.price, level.size),
                });
            }
        }

        let mut undo: Vec<(BookSide, Decimal, Option<Decimal>)> =
            Vec::with_capacity(delta.bids.len() + delta.asks.len());
        for (side, levels) in [(BookSide::Bid, &delta.bids), (BookSide::Ask, &delta.asks)] {
            let ladder = match side {
                BookSide::Bid => &mut self.bids,
                BookSide::Ask => &mut self.asks,
            };
            for level in levels {
                let previous = if level.size.is_zero() {
                    ladder.remove(&level.price)
                } else {
                    ladder.insert(level.price, level.size)
                };
                undo.push((side, level.price, previous));
            }
        }

        if let Err(e) = self.check_crossed() {
            for (side, price, previous) in undo.into_iter().rev() {
                let ladder = match side {
                    BookSide::Bid => &mut self.bids,
                    BookSide::Ask => &mut self.asks,
                };
                match previous {
                    Some(size) => ladder.insert(price, size),
                    None => ladder.remove(&price),
                };
            }
            return Err(e);
        }

        self.sequence = delta.sequence;
        self.timestamp = delta.timestamp;
        Ok(())
    }

    fn check_crossed(&self) -> Result<(), BookError> {
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid.price >= ask.price {
                return Err(BookError::Crossed {
                    instrument: self.instrument.clone(),
                    bid: bid.price,
                    ask: ask.price,
                });
            }
        }
        Ok(())
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Bid levels, best first.
    pub fn bids(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.bids.iter().rev().map(|(p, s)| PriceLevel::new(*p, *s))
    }

    /// Ask levels, best first.
    pub fn asks(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.asks.iter().map(|(p, s)| PriceLevel::new(*p, *s))
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.iter().next_back().map(|(p, s)| PriceLevel::new(*p, *s))
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.iter().next().map(|(p, s)| PriceLevel::new(*p, *s))
    }

    pub fn mid(&self) -> Option<Decimal> {
        Some((self.best_bid()?.price + self.best_ask()?.price) / Decimal::TWO)
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    pub fn spread_bps(&self) -> Option<Decimal> {
        let mid = self.mid()?;
        if mid.is_zero() {
            return None;
        }
        Some(self.spread()? / mid * Decimal::from(10_000))
    }

    pub fn bid_depth(&self) -> Decimal {
        self.bids.values().sum()
    }

    pub fn ask_depth(&self) -> Decimal {
        self.asks.values().sum()
    }

    /// Average price paid to lift `size` from the asks; None if too thin.
    pub fn vwap_buy(&self, size: Decimal) -> Option<Decimal> {
        vwap(self.asks(), size)
    }

    /// Average price received hitting `size` into the bids; None if too thin.
    pub fn vwap_sell(&self, size: Decimal) -> Option<Decimal> {
        vwap(self.bids(), size)
    }

    /// (bid depth - ask depth) / total depth, in [-1, 1].
    pub fn imbalance(&self) -> Option<Decimal> {
        let bid = self.bid_depth();
        let ask = self.ask_depth();
        let total = bid + ask;
        if total.is_zero() {
            return None;
        }
        Some((bid - ask) / total)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

fn check_ladder(
    instrument: &Instrument,
    levels: &[PriceLevel],
    side: BookSide,
) -> Result<(), BookError> {
    let malformed = |reason: String| BookError::Malformed {
        instrument: instrument.clone(),
        reason,
    };
    for level in levels {
        if level.price <= Decimal::ZERO {
            return Err(malformed(format!("non-positive price {}", level.price)));
        }
        if level.size <= Decimal::ZERO {
            return Err(malformed(format!("non-positive size at {}", level.price)));
        }
    }
    for pair in levels.windows(2) {
        let ordered = match side {
            BookSide::Bid => pair[0].price > pair[1].price,
            BookSide::Ask => pair[0].price < pair[1].price,
        };
        if !ordered {
            return Err(malformed(format!(
                "{:?} levels not strictly monotonic at {}",
                side, pair[1].price
            )));
        }
    }
    Ok(())
}

fn vwap(levels: impl Iterator<Item = PriceLevel>, size: Decimal) -> Option<Decimal> {
    if size <= Decimal::ZERO {
        return None;
    }
    let mut remaining = size;
    let mut cost = Decimal::ZERO;
    for level in levels {
        if remaining.is_zero() {
            break;
        }
        let take = remaining.min(level.size);
        cost += take * level.price;
        remaining -= take;
    }
    if remaining > Decimal::ZERO {
        None
    } else {
        Some(cost / size)
    }
}

/// All books known to the engine plus per-instrument freshness.
///
/// An instrument is tradable once it has a book and has been updated within
/// the staleness window. Staleness is only re-evaluated by [`sweep_stale`],
/// which the engine calls on every tick and before every strategy dispatch;
/// any accepted update clears it.
///
/// [`sweep_stale`]: BookStore::sweep_stale
#[derive(Debug)]
pub struct BookStore {
    books: HashMap<Instrument, Arc<OrderBook>>,
    last_update: HashMap<Instrument, Instant>,
    stale: HashSet<Instrument>,
    window: Duration,
}

impl BookStore {
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            books: HashMap::new(),
            last_update: HashMap::new(),
            stale: HashSet::new(),
            window: staleness_window,
        }
    }

    /// Apply a snapshot. It replaces any existing book regardless of sequence,
    /// so a venue that restarts its numbering can resync. Going backwards is
    /// logged.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &BookSnapshot,
        now: Instant,
    ) -> Result<(), BookError> {
        let book = OrderBook::from_snapshot(snapshot)?;
        if let Some(current) = self
            .books
            .get(&snapshot.instrument)
            .filter(|b| snapshot.sequence < b.sequence())
        {
            tracing::warn!(
                instrument = %snapshot.instrument,
                current = current.sequence(),
                snapshot = snapshot.sequence,
                "Snapshot sequence went backwards, resyncing"
            );
        }
        self.books.insert(snapshot.instrument.clone(), Arc::new(book));
        self.touch(&snapshot.instrument, now);
        Ok(())
    }

    pub fn apply_delta(&mut self, delta: &BookDelta, now: Instant) -> Result<(), BookError> {
        let book = self
            .books
            .get_mut(&delta.instrument)
            .ok_or_else(|| BookError::NoSnapshot(delta.instrument.clone()))?;
        Arc::make_mut(book).apply_delta(delta)?;
        self.touch(&delta.instrument, now);
        Ok(())
    }

    fn touch(&mut self, instrument: &Instrument, now: Instant) {
        self.last_update.insert(instrument.clone(), now);
        if self.stale.remove(instrument) {
            tracing::info!(%instrument, "Book fresh again");
        }
    }

    /// Mark books without an update inside the window as stale.
    /// Returns the instruments that just became stale.
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<Instrument> {
        let mut newly = Vec::new();
        for (instrument, last) in &self.last_update {
            if now.saturating_duration_since(*last) > self.window
                && self.stale.insert(instrument.clone())
            {
                newly.push(instrument.clone());
            }
        }
        newly.sort();
        newly
    }

    pub fn is_tradable(&self, instrument: &Instrument) -> bool {
        self.books.contains_key(instrument) && !self.stale.contains(instrument)
    }

    pub fn is_stale(&self, instrument: &Instrument) -> bool {
        !self.is_tradable(instrument)
    }

    pub fn stale(&self) -> &HashSet<Instrument> {
        &self.stale
    }

    pub fn get(&self, instrument: &Instrument) -> Option<&Arc<OrderBook>> {
        self.books.get(instrument)
    }

    pub fn mid(&self, instrument: &Instrument) -> Option<Decimal> {
        self.books.get(instrument)?.mid()
    }

    /// Cheap copy of every book handle, for strategy contexts.
    pub fn snapshot(&self) -> HashMap<Instrument, Arc<OrderBook>> {
        self.books.clone()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn lvl(p: Decimal, s: Decimal) -> PriceLevel {
        PriceLevel::new(p, s)
    }

    fn snapshot(seq: u64) -> BookSnapshot {
        BookSnapshot {
            instrument: Instrument::from("tok"),
            bids: vec![lvl(dec!(0.48), dec!(100)), lvl(dec!(0.47), dec!(200))],
            asks: vec![lvl(dec!(0.52), dec!(150)), lvl(dec!(0.53), dec!(50))],
            sequence: seq,
            timestamp: Utc::now(),
        }
    }

    fn delta(seq: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> BookDelta {
        BookDelta {
            instrument: Instrument::from("tok"),
            sequence: seq,
            bids,
            asks,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_best_prices_and_mid() {
        let book = OrderBook::from_snapshot(&snapshot(1)).unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(0.48));
        assert_eq!(book.best_ask().unwrap().price, dec!(0.52));
        assert_eq!(book.mid(), Some(dec!(0.50)));
        assert_eq!(book.spread(), Some(dec!(0.04)));
        assert_eq!(book.spread_bps(), Some(dec!(800)));
        assert_eq!(book.bids().count(), 2);
    }

    #[test]
    fn test_depth_and_imbalance() {
        let book = OrderBook::from_snapshot(&snapshot(1)).unwrap();
        assert_eq!(book.bid_depth(), dec!(300));
        assert_eq!(book.ask_depth(), dec!(200));
        assert_eq!(book.imbalance(), Some(dec!(0.2)));
    }

    #[test]
    fn test_vwap() {
        let book = OrderBook::from_snapshot(&snapshot(1)).unwrap();
        assert_eq!(book.vwap_buy(dec!(100)), Some(dec!(0.52)));
        // 150 @ 0.52 + 50 @ 0.53
        assert_eq!(book.vwap_buy(dec!(200)), Some(dec!(0.5225)));
        assert_eq!(book.vwap_buy(dec!(201)), None);
        assert_eq!(book.vwap_sell(dec!(100)), Some(dec!(0.48)));
    }

    #[test]
    fn test_snapshot_validation() {
        let mut crossed = snapshot(1);
        crossed.bids[0].price = dec!(0.52);
        assert!(matches!(OrderBook::from_snapshot(&crossed), Err(BookError::Crossed { .. })));

        let mut unordered = snapshot(1);
        unordered.bids.swap(0, 1);
        assert!(matches!(OrderBook::from_snapshot(&unordered), Err(BookError::Malformed { .. })));

        let mut empty_level = snapshot(1);
        empty_level.asks[1].size = Decimal::ZERO;
        assert!(matches!(OrderBook::from_snapshot(&empty_level), Err(BookError::Malformed { .. })));
    }

    #[test]
    fn test_delta_applies_and_removes_levels() {
        let mut book = OrderBook::from_snapshot(&snapshot(1)).unwrap();
        let bids = vec![lvl(dec!(0.48), dec!(0)), lvl(dec!(0.49), dec!(10))];
        book.apply_delta(&delta(2, bids, vec![])).unwrap();
        assert_eq!(book.best_bid(), Some(lvl(dec!(0.49), dec!(10))));
        assert_eq!(book.bids().count(), 2);
        assert_eq!(book.sequence(), 2);
    }

    #[test]
    fn test_stale_delta_rejected() {
        let mut book = OrderBook::from_snapshot(&snapshot(5)).unwrap();
        let before = book.clone();
        let err = book.apply_delta(&delta(5, vec![lvl(dec!(0.49), dec!(1))], vec![])).unwrap_err();
        assert!(matches!(err, BookError::OutOfSequence { current: 5, received: 5, .. }));
        assert_eq!(book, before);
    }

    #[test]
    fn test_crossing_delta_rolled_back() {
        let mut book = OrderBook::from_snapshot(&snapshot(1)).unwrap();
        let before = book.clone();
        let err = book
            .apply_delta(&delta(
                2,
                vec![lvl(dec!(0.48), dec!(0)), lvl(dec!(0.55), dec!(5))],
                vec![lvl(dec!(0.52), dec!(999))],
            ))
            .unwrap_err();
        assert!(matches!(err, BookError::Crossed { .. }));
        assert_eq!(book, before);
    }

    #[test]
    fn test_market_event_json() {
        let json = r#"{"type":"delta","instrument":"tok","sequence":9,
            "bids":[{"price":0.4,"size":3}]}"#;
        let event: MarketEvent = serde_json::from_str(json).unwrap();
        match event {
            MarketEvent::Delta(d) => {
                assert_eq!(d.sequence, 9);
                assert_eq!(d.bids, vec![lvl(dec!(0.4), dec!(3))]);
                assert!(d.asks.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_staleness() {
        let mut store = BookStore::new(Duration::from_millis(100));
        let tok = Instrument::from("tok");
        assert!(store.is_stale(&tok));

        store.apply_snapshot(&snapshot(1), Instant::now()).unwrap();
        assert!(store.is_tradable(&tok));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(store.sweep_stale(Instant::now()), vec![tok.clone()]);
        assert!(!store.is_tradable(&tok));
        assert!(store.sweep_stale(Instant::now()).is_empty());

        store
            .apply_delta(&delta(2, vec![lvl(dec!(0.49), dec!(1))], vec![]), Instant::now())
            .unwrap();
        assert!(store.is_tradable(&tok));
    }

    #[test]
    fn test_store_delta_without_snapshot() {
        let mut store = BookStore::new(Duration::from_secs(1));
        let err = store
            .apply_delta(&delta(1, vec![lvl(dec!(0.4), dec!(1))], vec![]), Instant::now())
            .unwrap_err();
        assert!(matches!(err, BookError::NoSnapshot(_)));
    }

    #[test]
    fn test_store_snapshot_resyncs() {
        let mut store = BookStore::new(Duration::from_secs(1));
        store.apply_snapshot(&snapshot(10), Instant::now()).unwrap();
        // backwards: logged, then taken as the new baseline
        store.apply_snapshot(&snapshot(3), Instant::now()).unwrap();
        assert_eq!(store.get(&Instrument::from("tok")).unwrap().sequence(), 3);
        store
            .apply_delta(&delta(4, vec![lvl(dec!(0.49), dec!(1))], vec![]), Instant::now())
            .unwrap();
        assert_eq!(store.get(&Instrument::from("tok")).unwrap().sequence(), 4);
    }
}
