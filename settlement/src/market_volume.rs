//! Market volume tracker
//!
//! Consumes per-block volume updates once per block ID, keeps running
//! statistics, checks each update against the stored tick and every
//! `aggregation_window` blocks summarises the preceding window.

use crate::broadcast::{publish_json, BroadcastSink, EVENT_VOLUME_UPDATE};
use crate::config::MarketVolumeConfig;
use crate::consumer::{EventProcessor, Outcome};
use crate::idempotency::ProcessedSet;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_core::{MarketTick, MarketTickStore, MarketVolumeUpdate};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Running volume statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VolumeStats {
    /// Blocks seen
    pub total_blocks: i64,
    /// Sum of buy volume
    pub total_buy_volume: Decimal,
    /// Sum of sell volume
    pub total_sell_volume: Decimal,
    /// Mean buy volume
    pub avg_buy_volume: Decimal,
    /// Mean sell volume
    pub avg_sell_volume: Decimal,
    /// Largest buy volume
    pub highest_buy_volume: Decimal,
    /// Smallest buy volume
    pub lowest_buy_volume: Decimal,
    /// Last update
    pub last_updated: Option<DateTime<Utc>>,
}

impl VolumeStats {
    fn observe(&mut self, update: &MarketVolumeUpdate) {
        self.total_blocks += 1;
        self.total_buy_volume += update.buy_volume;
        self.total_sell_volume += update.sell_volume;

        let blocks = Decimal::from(self.total_blocks);
        self.avg_buy_volume = self.total_buy_volume / blocks;
        self.avg_sell_volume = self.total_sell_volume / blocks;

        if update.buy_volume > self.highest_buy_volume {
            self.highest_buy_volume = update.buy_volume;
        }
        if self.total_blocks == 1 || update.buy_volume < self.lowest_buy_volume {
            self.lowest_buy_volume = update.buy_volume;
        }
        self.last_updated = Some(Utc::now());
    }
}

/// Summary of one aggregation window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeAggregate {
    /// First block of the window
    pub start_block: i64,
    /// Last block of the window
    pub end_block: i64,
    /// Ticks found
    pub tick_count: usize,
    /// Sum of buy volume
    pub total_buy_volume: Decimal,
    /// Sum of sell volume
    pub total_sell_volume: Decimal,
    /// Mean price
    pub avg_price: Decimal,
    /// Lowest price
    pub min_price: Decimal,
    /// Highest price
    pub max_price: Decimal,
}

/// Aggregate a window of ticks, `None` when empty
pub fn aggregate(start_block: i64, end_block: i64, ticks: &[MarketTick]) -> Option<VolumeAggregate> {
    let first = ticks.first()?;
    let mut summary = VolumeAggregate {
        start_block,
        end_block,
        tick_count: ticks.len(),
        total_buy_volume: Decimal::ZERO,
        total_sell_volume: Decimal::ZERO,
        avg_price: Decimal::ZERO,
        min_price: first.price,
        max_price: first.price,
    };
    let mut price_sum = Decimal::ZERO;
    for tick in ticks {
        summary.total_buy_volume += tick.buy_volume;
        summary.total_sell_volume += tick.sell_volume;
        price_sum += tick.price;
        summary.min_price = summary.min_price.min(tick.price);
        summary.max_price = summary.max_price.max(tick.price);
    }
    summary.avg_price = price_sum / Decimal::from(ticks.len() as u64);
    Some(summary)
}

/// Volume update derived from a stored tick
pub fn volume_update_from_tick(tick: &MarketTick) -> MarketVolumeUpdate {
    let total = tick.buy_volume + tick.sell_volume;
    let volume_ratio = if total > Decimal::ZERO {
        tick.buy_volume / total
    } else {
        Decimal::ZERO
    };
    MarketVolumeUpdate {
        block_id: tick.block_id,
        buy_volume: tick.buy_volume,
        sell_volume: tick.sell_volume,
        net_volume: tick.buy_volume - tick.sell_volume,
        volume_ratio,
        tx_count: tick.tx_count,
        timestamp: tick.created_at.timestamp(),
    }
}

/// Volume processor
pub struct VolumeTracker {
    ticks: Arc<dyn MarketTickStore>,
    sink: Arc<dyn BroadcastSink>,
    config: MarketVolumeConfig,
    processed: ProcessedSet<i64>,
    stats: RwLock<VolumeStats>,
    last_aggregate: RwLock<Option<VolumeAggregate>>,
}

impl VolumeTracker {
    /// Create tracker
    pub fn new(
        ticks: Arc<dyn MarketTickStore>,
        sink: Arc<dyn BroadcastSink>,
        config: MarketVolumeConfig,
    ) -> Self {
        Self {
            ticks,
            sink,
            processed: ProcessedSet::new(config.processed_capacity),
            config,
            stats: RwLock::new(VolumeStats::default()),
            last_aggregate: RwLock::new(None),
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> VolumeStats {
        self.stats.read().clone()
    }

    /// Most recent window summary
    pub fn last_aggregate(&self) -> Option<VolumeAggregate> {
        self.last_aggregate.read().clone()
    }

    /// Stored volume history, newest first
    pub async fn historical_data(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MarketVolumeUpdate>> {
        let ticks = self.ticks.volume_history(limit, offset).await?;
        Ok(ticks.iter().map(volume_update_from_tick).collect())
    }

    /// Summarise `[block_id - window, block_id]`
    pub async fn aggregate_window(&self, block_id: i64) -> Option<VolumeAggregate> {
        let start = block_id - self.config.aggregation_window;
        let ticks = match self.ticks.volume_block_range(start, block_id).await {
            Ok(ticks) => ticks,
            Err(e) => {
                warn!("Failed to load volume range {} - {}: {}", start, block_id, e);
                return None;
            }
        };

        let Some(summary) = aggregate(start, block_id, &ticks) else {
            info!("No ticks found for aggregation in range {} - {}", start, block_id);
            return None;
        };
        info!(
            "Aggregated volume for blocks {} to {}: buy {}, sell {}, avg price {}, min {}, max {}",
            start,
            block_id,
            summary.total_buy_volume,
            summary.total_sell_volume,
            summary.avg_price.round_dp(8),
            summary.min_price,
            summary.max_price
        );
        *self.last_aggregate.write() = Some(summary.clone());
        Some(summary)
    }

    async fn verify_tick(&self, update: &MarketVolumeUpdate) {
        match self.ticks.tick_by_block_id(update.block_id).await {
            Ok(Some(tick)) => {
                if tick.buy_volume != update.buy_volume || tick.sell_volume != update.sell_volume {
                    warn!(
                        "Volume mismatch for block #{}: stored ({}, {}), event ({}, {})",
                        update.block_id,
                        tick.buy_volume,
                        tick.sell_volume,
                        update.buy_volume,
                        update.sell_volume
                    );
                } else {
                    debug!("Volume verified for block #{}", update.block_id);
                }
            }
            Ok(None) => warn!("No market tick stored for block #{}", update.block_id),
            Err(e) => warn!("Failed to load market tick for block #{}: {}", update.block_id, e),
        }
    }
}

#[async_trait]
impl EventProcessor for VolumeTracker {
    type Event = MarketVolumeUpdate;
    type Key = i64;

    fn name(&self) -> &'static str {
        "market_volume"
    }

    fn key(&self, update: &MarketVolumeUpdate) -> i64 {
        update.block_id
    }

    async fn is_processed(&self, key: &i64) -> bool {
        self.processed.contains(key)
    }

    async fn process(&self, update: &MarketVolumeUpdate) -> Result<Outcome> {
        if !self.processed.insert(update.block_id) {
            debug!("Duplicate volume update for block {}, skipping", update.block_id);
            return Ok(Outcome::Skipped);
        }

        self.stats.write().observe(update);
        publish_json(self.sink.as_ref(), EVENT_VOLUME_UPDATE, update);
        info!(
            "Processed volume update for block #{}: buy {}, sell {}, ratio {}%",
            update.block_id,
            update.buy_volume,
            update.sell_volume,
            (update.volume_ratio * Decimal::ONE_HUNDRED).round_dp(2)
        );

        self.verify_tick(update).await;
        if self.config.aggregation_window > 0 && update.block_id % self.config.aggregation_window == 0
        {
            self.aggregate_window(update.block_id).await;
        }
        Ok(Outcome::Applied)
    }
}
