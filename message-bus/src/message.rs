//! Delivered message with explicit acknowledgment

use crate::metrics::ACK_TOTAL;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acker: Send + Sync {
    /// Positive acknowledgment
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgment; `requeue` asks the broker to redeliver
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer.
///
/// Exactly one of [`Delivery::ack`] or [`Delivery::nack`] should be called.
/// A delivery that is never settled is redelivered once its session or
/// connection goes away.
pub struct Delivery {
    /// Broker-assigned tag
    pub delivery_tag: u64,

    /// Exchange the message was published to
    pub exchange: String,

    /// Routing key used on publish
    pub routing_key: String,

    /// Set when the broker has delivered this message before
    pub redelivered: bool,

    /// Raw payload
    pub body: Bytes,

    acker: Box<dyn Acker>,
}

impl Delivery {
    /// Create delivery
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        body: Bytes,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            body,
            acker,
        }
    }

    /// Decode the JSON payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Acknowledge
    pub async fn ack(&self) -> Result<()> {
        ACK_TOTAL.with_label_values(&["ack"]).inc();
        self.acker.ack().await
    }

    /// Negative-acknowledge, optionally requeueing
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        let label = if requeue { "nack_requeue" } else { "nack_drop" };
        ACK_TOTAL.with_label_values(&[label]).inc();
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Acker for Recorder {
        async fn ack(&self) -> Result<()> {
            self.0.lock().push("ack".into());
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<()> {
            self.0.lock().push(format!("nack:{}", requeue));
            Ok(())
        }
    }

    #[derive(Deserialize)]
    struct Payload {
        block_id: i64,
    }

    #[tokio::test]
    async fn test_decode_and_settle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let delivery = Delivery::new(
            7,
            "rewards",
            "reward.calculation",
            false,
            Bytes::from_static(br#"{"block_id": 42}"#),
            Box::new(Recorder(log.clone())),
        );

        let payload: Payload = delivery.decode().unwrap();
        assert_eq!(payload.block_id, 42);

        delivery.nack(true).await.unwrap();
        delivery.ack().await.unwrap();
        assert_eq!(*log.lock(), vec!["nack:true".to_string(), "ack".to_string()]);
    }

    #[tokio::test]
    async fn test_decode_malformed() {
        let delivery = Delivery::new(
            1,
            "rewards",
            "reward.calculation",
            false,
            Bytes::from_static(b"not json"),
            Box::new(Recorder::default()),
        );
        assert!(delivery.decode::<Payload>().is_err());
    }
}
