//! Exchanges, queues and bindings used by the pipeline

use crate::Result;
use message_bus::{BindDef, BrokerClient, ExchangeDef, QueueDef};
use tracing::info;

/// Transaction events
pub const EXCHANGE_TRANSACTIONS: &str = "transactions";
/// Block events
pub const EXCHANGE_BLOCKS: &str = "blocks";
/// Market events
pub const EXCHANGE_MARKET: &str = "market";
/// Ledger events
pub const EXCHANGE_LEDGER: &str = "ledger";
/// Reward events
pub const EXCHANGE_REWARDS: &str = "rewards";

/// Reward calculation queue
pub const QUEUE_REWARD_CALCULATION: &str = "reward.calculation";
/// Reward distribution queue
pub const QUEUE_REWARD_DISTRIBUTION: &str = "reward.distribution";
/// Market pricing queue
pub const QUEUE_MARKET_PRICING: &str = "market.pricing";
/// Market volume queue
pub const QUEUE_MARKET_VOLUME: &str = "market.volume.updates";
/// Ledger persistence queue
pub const QUEUE_LEDGER_PERSISTENCE: &str = "ledger.persistence";
/// Ledger audit queue
pub const QUEUE_LEDGER_AUDIT: &str = "ledger.audit";
/// Ledger reconciliation queue
pub const QUEUE_LEDGER_RECONCILE: &str = "ledger.reconcile";

/// Routing key for reward basis events
pub const KEY_REWARD_CALCULATION: &str = "reward.calculation";
/// Routing key for distribution events
pub const KEY_REWARD_DISTRIBUTION: &str = "reward.distribution";
/// Routing key for pricing events
pub const KEY_MARKET_PRICING: &str = "market.pricing";
/// Routing key for volume events
pub const KEY_MARKET_VOLUME: &str = "market.volume.update";
/// Routing key for ledger batches
pub const KEY_LEDGER_BATCH: &str = "ledger.batch";

/// Exchanges declared at start
pub const EXCHANGES: [&str; 5] = [
    EXCHANGE_TRANSACTIONS,
    EXCHANGE_BLOCKS,
    EXCHANGE_MARKET,
    EXCHANGE_LEDGER,
    EXCHANGE_REWARDS,
];

/// `(queue, exchange, routing key)`
pub const BINDINGS: [(&str, &str, &str); 7] = [
    (QUEUE_REWARD_CALCULATION, EXCHANGE_REWARDS, KEY_REWARD_CALCULATION),
    (QUEUE_REWARD_DISTRIBUTION, EXCHANGE_REWARDS, KEY_REWARD_DISTRIBUTION),
    (QUEUE_MARKET_PRICING, EXCHANGE_MARKET, KEY_MARKET_PRICING),
    (QUEUE_MARKET_VOLUME, EXCHANGE_MARKET, KEY_MARKET_VOLUME),
    (QUEUE_LEDGER_PERSISTENCE, EXCHANGE_LEDGER, KEY_LEDGER_BATCH),
    (QUEUE_LEDGER_AUDIT, EXCHANGE_LEDGER, KEY_LEDGER_BATCH),
    (QUEUE_LEDGER_RECONCILE, EXCHANGE_LEDGER, KEY_LEDGER_BATCH),
];

/// Declare every exchange, queue and binding; the client records them for
/// replay after a reconnect
pub async fn declare_topology(client: &BrokerClient) -> Result<()> {
    for exchange in EXCHANGES {
        client.declare_exchange(ExchangeDef::topic(exchange)).await?;
    }
    for (queue, exchange, key) in BINDINGS {
        client.declare_queue(QueueDef::durable(queue)).await?;
        client.bind(BindDef::new(queue, exchange, key)).await?;
    }
    info!(
        "Declared {} exchanges and {} queues",
        EXCHANGES.len(),
        BINDINGS.len()
    );
    Ok(())
}
