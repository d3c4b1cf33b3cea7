//! Market pricing monitor
//!
//! Keeps the last price per block, derives the change from the previous
//! block, broadcasts a [`PriceUpdate`] and raises threshold alerts on the
//! size of the move. Each event is also checked against the persisted tick
//! for its block in a background task; a mismatch is logged, never failed.
//!
//! Pricing has no idempotency store: replaying an event recomputes the same
//! change and re-broadcasts it.

use crate::broadcast::{publish_json, BroadcastSink, EVENT_MARKET_UPDATE};
use crate::config::MarketPricingConfig;
use crate::consumer::{EventProcessor, Outcome};
use crate::metrics::PRICE_ALERTS_TOTAL;
use crate::Result;
use async_trait::async_trait;
use ledger_core::{Address, MarketPricingEvent, MarketTickStore, PriceUpdate};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Price comparison tolerance
pub const PRICE_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 8);

/// Moves above this percentage are logged as significant
pub const SIGNIFICANT_MOVE_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Severity of a price move
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    /// 3% or more
    Minor,
    /// 5% or more
    Major,
    /// 10% or more
    Critical,
}

impl AlertLevel {
    /// Level for a signed percentage change, `None` below 3%
    pub fn classify(percent: Decimal) -> Option<Self> {
        let magnitude = percent.abs();
        if magnitude >= Decimal::TEN {
            Some(AlertLevel::Critical)
        } else if magnitude >= Decimal::from(5) {
            Some(AlertLevel::Major)
        } else if magnitude >= Decimal::from(3) {
            Some(AlertLevel::Minor)
        } else {
            None
        }
    }

    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Minor => "minor",
            AlertLevel::Major => "major",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Change from the previous block's price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceChange {
    /// Previous price, zero when unknown
    pub previous: Decimal,
    /// `price - previous`
    pub change: Decimal,
    /// `change / previous * 100`, zero when there is no previous price
    pub percent: Decimal,
}

impl PriceChange {
    /// Change from `previous` to `price`
    pub fn between(previous: Decimal, price: Decimal) -> Self {
        let change = price - previous;
        let percent = if previous > Decimal::ZERO {
            change / previous * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        Self {
            previous,
            change,
            percent,
        }
    }
}

/// Whether two prices agree within [`PRICE_EPSILON`], relative above 1.0
pub fn prices_match(a: Decimal, b: Decimal) -> bool {
    let diff = (a - b).abs();
    let magnitude = a.abs().max(b.abs());
    if magnitude > Decimal::ONE {
        diff / magnitude <= PRICE_EPSILON
    } else {
        diff <= PRICE_EPSILON
    }
}

/// Bounded block → price cache; the lowest blocks go first
#[derive(Debug)]
struct PriceCache {
    capacity: usize,
    prices: BTreeMap<i64, Decimal>,
}

impl PriceCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            prices: BTreeMap::new(),
        }
    }

    fn get(&self, block: i64) -> Option<Decimal> {
        self.prices.get(&block).copied()
    }

    fn insert(&mut self, block: i64, price: Decimal) {
        self.prices.insert(block, price);
        while self.prices.len() > self.capacity {
            self.prices.pop_first();
        }
    }
}

/// Pricing processor
pub struct PricingMonitor {
    ticks: Arc<dyn MarketTickStore>,
    sink: Arc<dyn BroadcastSink>,
    config: MarketPricingConfig,
    cache: RwLock<PriceCache>,
}

impl PricingMonitor {
    /// Create monitor
    pub fn new(
        ticks: Arc<dyn MarketTickStore>,
        sink: Arc<dyn BroadcastSink>,
        config: MarketPricingConfig,
    ) -> Self {
        Self {
            ticks,
            sink,
            cache: RwLock::new(PriceCache::new(config.price_cache_capacity)),
            config,
        }
    }

    /// Warm the cache from the newest `limit` ticks
    pub async fn load_initial_price_cache(&self, limit: usize) -> Result<usize> {
        let ticks = self.ticks.volume_history(limit, 0).await?;
        let mut cache = self.cache.write();
        for tick in &ticks {
            cache.insert(tick.block_id, tick.price);
        }
        info!("Loaded initial price cache for {} blocks", ticks.len());
        Ok(ticks.len())
    }

    /// Warm the cache with the configured depth, warning on failure
    pub async fn warm_up(&self) {
        if let Err(e) = self
            .load_initial_price_cache(self.config.initial_cache_load)
            .await
        {
            warn!("⚠️ Failed to load initial price cache: {}", e);
        }
    }

    /// Cached price for a block
    pub fn cached_price(&self, block_number: i64) -> Option<Decimal> {
        self.cache.read().get(block_number)
    }

    /// Cached blocks
    pub fn cache_len(&self) -> usize {
        self.cache.read().prices.len()
    }

    /// Record the price for a block and return the change from the block before
    pub fn apply_price(&self, block_number: i64, price: Decimal) -> PriceChange {
        let mut cache = self.cache.write();
        let previous = cache.get(block_number - 1).unwrap_or(Decimal::ZERO);
        cache.insert(block_number, price);
        PriceChange::between(previous, price)
    }

    /// Price one event: update the cache, broadcast, alert and verify
    pub fn price(&self, event: &MarketPricingEvent) -> PriceUpdate {
        let change = self.apply_price(event.block_number, event.price);

        let update = PriceUpdate {
            block_id: event.block_id,
            block_number: event.block_number,
            price: event.price,
            price_change: change.change,
            price_change_percent: change.percent,
            liquidity: event.liquidity,
            buy_volume: event.buy_volume,
            sell_volume: event.sell_volume,
            tx_count: event.tx_count,
            timestamp: event.timestamp,
            miner_address: event.miner_address.clone(),
        };
        publish_json(self.sink.as_ref(), EVENT_MARKET_UPDATE, &update);

        if change.percent.abs() > SIGNIFICANT_MOVE_PERCENT {
            warn!(
                "🚨 Significant price movement at block #{}: {}% ({} -> {})",
                event.block_number,
                change.percent.round_dp(2),
                change.previous,
                event.price
            );
        }
        raise_alert(event.block_number, event.price, &change);

        tokio::spawn(verify_tick(self.ticks.clone(), event.clone()));

        update
    }

    /// Price updates rebuilt from stored ticks, newest first
    pub async fn price_history(&self, limit: usize, offset: usize) -> Result<Vec<PriceUpdate>> {
        let ticks = self.ticks.volume_history(limit, offset).await?;
        let updates = ticks
            .iter()
            .enumerate()
            .map(|(i, tick)| {
                let change = match ticks.get(i + 1) {
                    Some(older) if older.price > Decimal::ZERO => {
                        PriceChange::between(older.price, tick.price)
                    }
                    _ => PriceChange::between(Decimal::ZERO, Decimal::ZERO),
                };
                PriceUpdate {
                    block_id: tick.block_id,
                    block_number: tick.block_id,
                    price: tick.price,
                    price_change: change.change,
                    price_change_percent: change.percent,
                    liquidity: Decimal::ZERO,
                    buy_volume: tick.buy_volume,
                    sell_volume: tick.sell_volume,
                    tx_count: tick.tx_count,
                    timestamp: tick.created_at.timestamp(),
                    miner_address: Address::default(),
                }
            })
            .collect();
        Ok(updates)
    }
}

/// Log and count an alert for the move, if it reaches one
pub fn raise_alert(block_number: i64, price: Decimal, change: &PriceChange) -> Option<AlertLevel> {
    let level = AlertLevel::classify(change.percent)?;
    PRICE_ALERTS_TOTAL
        .with_label_values(&[level.as_str()])
        .inc();

    let percent = change.percent.round_dp(2);
    match level {
        AlertLevel::Critical => error!(
            "🚨 CRITICAL ALERT: price changed by {}% at block #{} ({} -> {})",
            percent, block_number, change.previous, price
        ),
        AlertLevel::Major => warn!(
            "⚠️ MAJOR ALERT: price changed by {}% at block #{} ({} -> {})",
            percent, block_number, change.previous, price
        ),
        AlertLevel::Minor => info!(
            "Minor alert: price changed by {}% at block #{} ({} -> {})",
            percent, block_number, change.previous, price
        ),
    }
    Some(level)
}

/// Compare an event with the stored tick for its block; logs only
pub async fn verify_tick(ticks: Arc<dyn MarketTickStore>, event: MarketPricingEvent) -> bool {
    match ticks.tick_by_block_id(event.block_id).await {
        Ok(Some(tick)) if prices_match(tick.price, event.price) => {
            debug!(
                "Tick verified for block #{}: price {}, tx count {}",
                event.block_number, event.price, event.tx_count
            );
            true
        }
        Ok(Some(tick)) => {
            warn!(
                "Data inconsistency for block {}: tick price {} != event price {}",
                event.block_id, tick.price, event.price
            );
            false
        }
        Ok(None) => {
            warn!("No market tick stored for block {}", event.block_id);
            false
        }
        Err(e) => {
            warn!("Failed to load market tick for block {}: {}", event.block_id, e);
            false
        }
    }
}

#[async_trait]
impl EventProcessor for PricingMonitor {
    type Event = MarketPricingEvent;
    type Key = i64;

    fn name(&self) -> &'static str {
        "market_pricing"
    }

    fn key(&self, event: &MarketPricingEvent) -> i64 {
        event.block_id
    }

    async fn is_processed(&self, _key: &i64) -> bool {
        false
    }

    async fn process(&self, event: &MarketPricingEvent) -> Result<Outcome> {
        self.price(event);
        Ok(Outcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::RecordingSink;
    use chrono::Utc;
    use ledger_core::{FaultPoint, MarketTick, MemoryMarketTickStore};
    use rust_decimal_macros::dec;

    fn event(block: i64, price: Decimal) -> MarketPricingEvent {
        MarketPricingEvent {
            block_id: block,
            block_number: block,
            price,
            liquidity: dec!(1000),
            buy_volume: dec!(3),
            sell_volume: dec!(2),
            tx_count: 4,
            timestamp: 1_700_000_000,
            miner_address: "M".into(),
        }
    }

    fn tick(block: i64, price: Decimal) -> MarketTick {
        MarketTick {
            id: block,
            block_id: block,
            price,
            buy_volume: dec!(3),
            sell_volume: dec!(2),
            tx_count: 4,
            created_at: Utc::now(),
        }
    }

    fn monitor(ticks: &MemoryMarketTickStore, sink: Arc<RecordingSink>) -> PricingMonitor {
        PricingMonitor::new(
            Arc::new(ticks.clone()),
            sink,
            MarketPricingConfig::default(),
        )
    }

    #[test]
    fn test_alert_levels() {
        assert_eq!(AlertLevel::classify(dec!(6.0)), Some(AlertLevel::Major));
        assert_eq!(AlertLevel::classify(dec!(-10)), Some(AlertLevel::Critical));
        assert_eq!(AlertLevel::classify(dec!(3)), Some(AlertLevel::Minor));
        assert_eq!(AlertLevel::classify(dec!(2.99)), None);
    }

    #[test]
    fn test_price_match_tolerance() {
        assert!(prices_match(dec!(0.5), dec!(0.500000005)));
        assert!(!prices_match(dec!(0.5), dec!(0.50000002)));
        // Relative above 1.0
        assert!(prices_match(dec!(1000), dec!(1000.000005)));
        assert!(!prices_match(dec!(1000), dec!(1000.1)));
    }

    #[tokio::test]
    async fn test_six_percent_move_is_major() {
        let ticks = MemoryMarketTickStore::new();
        let sink = Arc::new(RecordingSink::new());
        let monitor = monitor(&ticks, sink.clone());

        monitor.price(&event(1, dec!(100)));
        let update = monitor.price(&event(2, dec!(106)));

        assert_eq!(update.price_change, dec!(6));
        assert_eq!(update.price_change_percent, dec!(6));
        assert_eq!(
            AlertLevel::classify(update.price_change_percent),
            Some(AlertLevel::Major)
        );

        let sent = sink.of_type(EVENT_MARKET_UPDATE);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].data["block_number"], 2);
    }

    #[tokio::test]
    async fn test_unknown_previous_price_is_zero_percent() {
        let ticks = MemoryMarketTickStore::new();
        let monitor = monitor(&ticks, Arc::new(RecordingSink::new()));

        let update = monitor.price(&event(10, dec!(42)));
        assert_eq!(update.price_change, dec!(42));
        assert_eq!(update.price_change_percent, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_initial_cache_load() {
        let ticks = MemoryMarketTickStore::new();
        for block in 1..=5 {
            ticks.insert(tick(block, Decimal::from(block * 10)));
        }
        let monitor = monitor(&ticks, Arc::new(RecordingSink::new()));

        assert_eq!(monitor.load_initial_price_cache(3).await.unwrap(), 3);
        assert_eq!(monitor.cached_price(5), Some(dec!(50)));
        assert_eq!(monitor.cached_price(2), None);

        let update = monitor.price(&event(6, dec!(55)));
        assert_eq!(update.price_change_percent, dec!(10));
    }

    #[tokio::test]
    async fn test_warm_up_failure_is_not_fatal() {
        let ticks = MemoryMarketTickStore::new();
        ticks.faults().arm(FaultPoint::VolumeQuery, 1);
        let monitor = monitor(&ticks, Arc::new(RecordingSink::new()));

        monitor.warm_up().await;
        assert_eq!(monitor.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let ticks = MemoryMarketTickStore::new();
        let monitor = PricingMonitor::new(
            Arc::new(ticks),
            Arc::new(RecordingSink::new()),
            MarketPricingConfig {
                price_cache_capacity: 3,
                ..Default::default()
            },
        );
        for block in 1..=5 {
            monitor.apply_price(block, dec!(1));
        }
        assert_eq!(monitor.cache_len(), 3);
        assert_eq!(monitor.cached_price(2), None);
        assert_eq!(monitor.cached_price(5), Some(dec!(1)));
    }

    #[tokio::test]
    async fn test_price_history_against_older_tick() {
        let ticks = MemoryMarketTickStore::new();
        ticks.insert(tick(1, dec!(100)));
        ticks.insert(tick(2, dec!(110)));
        let monitor = monitor(&ticks, Arc::new(RecordingSink::new()));

        let history = monitor.price_history(10, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].block_number, 2);
        assert_eq!(history[0].price_change_percent, dec!(10));
        assert_eq!(history[1].price_change, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_verify_tick() {
        let ticks = MemoryMarketTickStore::new();
        ticks.insert(tick(7, dec!(12.5)));
        let store: Arc<dyn MarketTickStore> = Arc::new(ticks.clone());

        assert!(verify_tick(store.clone(), event(7, dec!(12.5))).await);
        assert!(!verify_tick(store.clone(), event(7, dec!(13))).await);
        assert!(!verify_tick(store.clone(), event(8, dec!(1))).await);

        ticks.faults().arm(FaultPoint::TickByBlock, 1);
        assert!(!verify_tick(store, event(7, dec!(12.5))).await);
    }
}
