//! Typed publisher with retry logic

use crate::client::BrokerClient;
use crate::Result;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Max attempts per publish (1 disables retry)
    pub max_retry_attempts: u32,

    /// Initial retry delay
    pub initial_retry_delay: Duration,

    /// Max retry delay
    pub max_retry_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

/// JSON publisher bound to one exchange
#[derive(Clone)]
pub struct Publisher {
    client: BrokerClient,
    exchange: String,
    config: PublisherConfig,
}

impl Publisher {
    /// Create new publisher
    pub fn new(client: BrokerClient, exchange: impl Into<String>, config: PublisherConfig) -> Self {
        Self {
            client,
            exchange: exchange.into(),
            config,
        }
    }

    /// Target exchange
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Serialize and publish, retrying transient failures with exponential backoff
    pub async fn publish<T: Serialize + ?Sized>(&self, routing_key: &str, value: &T) -> Result<()> {
        let payload = bytes::Bytes::from(serde_json::to_vec(value)?);
        let mut attempts = 0;
        let mut delay = self.config.initial_retry_delay;

        loop {
            attempts += 1;

            match self
                .client
                .publish(&self.exchange, routing_key, payload.clone())
                .await
            {
                Ok(()) => {
                    if attempts > 1 {
                        info!(
                            "✅ Published to {}/{} after {} attempts",
                            self.exchange, routing_key, attempts
                        );
                    }
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempts < self.config.max_retry_attempts => {
                    warn!(
                        "⚠️  Publish to {}/{} failed (attempt {}), retrying in {:?}: {}",
                        self.exchange, routing_key, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_retry_delay);
                }
                Err(e) => {
                    error!(
                        "❌ Failed to publish to {}/{} after {} attempts: {}",
                        self.exchange, routing_key, attempts, e
                    );
                    return Err(e);
                }
            }
        }
    }
}
