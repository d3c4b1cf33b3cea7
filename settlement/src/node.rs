//! Settlement node
//!
//! Connects to the broker, declares the topology and starts one
//! [`IdempotentConsumer`] per queue:
//!
//! | Queue                   | Processor            | Overflow |
//! |-------------------------|----------------------|----------|
//! | `reward.calculation`    | [`RewardCalculator`] | retry    |
//! | `reward.distribution`   | [`RewardDistributor`]| retry    |
//! | `market.pricing`        | [`PricingMonitor`]   | retry    |
//! | `market.volume.updates` | [`VolumeTracker`]    | retry    |
//! | `ledger.persistence`    | [`LedgerPersister`]  | retry    |
//! | `ledger.audit`          | [`LedgerAuditor`]    | retry    |
//! | `ledger.reconcile`      | [`Reconciler`]       | skip     |

use crate::broadcast::BroadcastSink;
use crate::config::Config;
use crate::consumer::{EventProcessor, IdempotentConsumer, OverflowPolicy};
use crate::idempotency::TtlIdempotencyStore;
use crate::ledger_audit::LedgerAuditor;
use crate::ledger_persistence::LedgerPersister;
use crate::market_pricing::PricingMonitor;
use crate::market_volume::VolumeTracker;
use crate::reconciliation::Reconciler;
use crate::reward_calculation::RewardCalculator;
use crate::reward_distribution::RewardDistributor;
use crate::shutdown::{shutdown_all, Stoppable};
use crate::topology::{self, declare_topology};
use crate::Result;
use ledger_core::{
    DiscrepancyStore, LedgerStore, MarketTickStore, MemoryDiscrepancyStore, MemoryLedgerStore,
    MemoryMarketTickStore, MemoryWalletStore, WalletStore,
};
use message_bus::{BrokerClient, MemoryBroker, NatsTransport, Publisher, PublisherConfig, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Repository ports used by the pipeline
#[derive(Clone)]
pub struct Stores {
    /// Wallets and their history
    pub wallets: Arc<dyn WalletStore>,
    /// Ledger entries
    pub ledger: Arc<dyn LedgerStore>,
    /// Balance discrepancies
    pub discrepancies: Arc<dyn DiscrepancyStore>,
    /// Market ticks
    pub ticks: Arc<dyn MarketTickStore>,
}

impl Stores {
    /// Fresh in-memory stores
    pub fn in_memory() -> Self {
        Self {
            wallets: Arc::new(MemoryWalletStore::new()),
            ledger: Arc::new(MemoryLedgerStore::new()),
            discrepancies: Arc::new(MemoryDiscrepancyStore::new()),
            ticks: Arc::new(MemoryMarketTickStore::new()),
        }
    }
}

/// Transport selected by the broker configuration
pub fn transport_for(config: &Config) -> Arc<dyn Transport> {
    if config.broker.in_memory {
        info!("Using in-process broker");
        Arc::new(MemoryBroker::new())
    } else {
        info!("Using NATS broker at {}", config.broker.nats.url);
        Arc::new(NatsTransport::new(config.broker.nats.clone()))
    }
}

/// Running settlement pipeline
pub struct SettlementNode {
    config: Config,
    client: BrokerClient,
    reward_calculation: Arc<IdempotentConsumer<RewardCalculator>>,
    reward_distribution: Arc<IdempotentConsumer<RewardDistributor>>,
    market_pricing: Arc<IdempotentConsumer<PricingMonitor>>,
    market_volume: Arc<IdempotentConsumer<VolumeTracker>>,
    ledger_persistence: Arc<IdempotentConsumer<LedgerPersister>>,
    ledger_audit: Arc<IdempotentConsumer<LedgerAuditor>>,
    reconciliation: Arc<IdempotentConsumer<Reconciler>>,
}

async fn start_consumer<P: EventProcessor>(
    client: &BrokerClient,
    queue: &str,
    processor: P,
    pool: &crate::config::PoolConfig,
    overflow: OverflowPolicy,
) -> Result<Arc<IdempotentConsumer<P>>> {
    let consumer = Arc::new(IdempotentConsumer::start(
        Arc::new(processor),
        pool.clone(),
        overflow,
    ));
    consumer.consume_from(client, queue).await?;
    Ok(consumer)
}

impl SettlementNode {
    /// Connect, declare topology and start every consumer
    pub async fn start(
        config: Config,
        transport: Arc<dyn Transport>,
        stores: Stores,
        sink: Arc<dyn BroadcastSink>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Starting settlement node {}", config.service_name);

        let client = BrokerClient::connect(transport, config.broker.client.clone()).await?;
        declare_topology(&client).await?;

        let calc = &config.reward_calculation;
        let reward_calculation = start_consumer(
            &client,
            topology::QUEUE_REWARD_CALCULATION,
            RewardCalculator::new(
                Publisher::new(
                    client.clone(),
                    topology::EXCHANGE_REWARDS,
                    PublisherConfig::default(),
                ),
                Arc::new(TtlIdempotencyStore::new(Duration::from_secs(
                    calc.processed_ttl_seconds,
                ))),
                Duration::from_secs(calc.cleanup_interval_seconds),
            ),
            &calc.pool,
            OverflowPolicy::Retry,
        )
        .await?;

        let dist = &config.reward_distribution;
        let reward_distribution = start_consumer(
            &client,
            topology::QUEUE_REWARD_DISTRIBUTION,
            RewardDistributor::new(
                stores.wallets.clone(),
                Arc::new(TtlIdempotencyStore::new(Duration::from_secs(
                    dist.processed_ttl_seconds,
                ))),
                Duration::from_secs(dist.cleanup_interval_seconds),
            ),
            &dist.pool,
            OverflowPolicy::Retry,
        )
        .await?;

        let pricing = PricingMonitor::new(
            stores.ticks.clone(),
            sink.clone(),
            config.market_pricing.clone(),
        );
        pricing.warm_up().await;
        let market_pricing = start_consumer(
            &client,
            topology::QUEUE_MARKET_PRICING,
            pricing,
            &config.market_pricing.pool,
            OverflowPolicy::Retry,
        )
        .await?;

        let market_volume = start_consumer(
            &client,
            topology::QUEUE_MARKET_VOLUME,
            VolumeTracker::new(stores.ticks.clone(), sink, config.market_volume.clone()),
            &config.market_volume.pool,
            OverflowPolicy::Retry,
        )
        .await?;

        let ledger_persistence = start_consumer(
            &client,
            topology::QUEUE_LEDGER_PERSISTENCE,
            LedgerPersister::new(stores.ledger.clone()),
            &config.ledger_persistence,
            OverflowPolicy::Retry,
        )
        .await?;

        let ledger_audit = start_consumer(
            &client,
            topology::QUEUE_LEDGER_AUDIT,
            LedgerAuditor::new(config.ledger_audit.clone()),
            &config.ledger_audit.pool,
            OverflowPolicy::Retry,
        )
        .await?;

        // A missed checkpoint is covered by the next one
        let reconciliation = start_consumer(
            &client,
            topology::QUEUE_LEDGER_RECONCILE,
            Reconciler::new(
                stores.wallets,
                stores.ledger,
                stores.discrepancies,
                config.reconciliation.clone(),
            ),
            &config.reconciliation.pool,
            OverflowPolicy::Skip,
        )
        .await?;

        info!("✅ Settlement node started with 7 consumers");

        Ok(Self {
            config,
            client,
            reward_calculation,
            reward_distribution,
            market_pricing,
            market_volume,
            ledger_persistence,
            ledger_audit,
            reconciliation,
        })
    }

    /// Broker client
    pub fn client(&self) -> &BrokerClient {
        &self.client
    }

    /// Reward calculation consumer
    pub fn reward_calculation(&self) -> &IdempotentConsumer<RewardCalculator> {
        &self.reward_calculation
    }

    /// Reward distribution consumer
    pub fn reward_distribution(&self) -> &IdempotentConsumer<RewardDistributor> {
        &self.reward_distribution
    }

    /// Market pricing consumer
    pub fn market_pricing(&self) -> &IdempotentConsumer<PricingMonitor> {
        &self.market_pricing
    }

    /// Market volume consumer
    pub fn market_volume(&self) -> &IdempotentConsumer<VolumeTracker> {
        &self.market_volume
    }

    /// Ledger persistence consumer
    pub fn ledger_persistence(&self) -> &IdempotentConsumer<LedgerPersister> {
        &self.ledger_persistence
    }

    /// Ledger audit consumer
    pub fn ledger_audit(&self) -> &IdempotentConsumer<LedgerAuditor> {
        &self.ledger_audit
    }

    /// Reconciliation consumer
    pub fn reconciliation(&self) -> &IdempotentConsumer<Reconciler> {
        &self.reconciliation
    }

    /// Stop every consumer and close the broker client within the shutdown
    /// timeout; false if the deadline passed
    pub async fn shutdown(&self) -> bool {
        let components: Vec<Arc<dyn Stoppable>> = vec![
            self.reward_calculation.clone(),
            self.reward_distribution.clone(),
            self.market_pricing.clone(),
            self.market_volume.clone(),
            self.ledger_persistence.clone(),
            self.ledger_audit.clone(),
            self.reconciliation.clone(),
        ];
        shutdown_all(
            &components,
            Some(&self.client),
            self.config.shutdown_timeout(),
        )
        .await
    }
}
