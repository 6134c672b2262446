//! # Mediator Redpanda
//!
//! Redpanda/Kafka implementation of the [`Publisher`] boundary.
//!
//! A request configured with `kafkaProducerTopic` publishes its resolved body
//! here instead of making an HTTP call. The broker's acknowledgement (topic,
//! partition, offset) becomes the request's outcome.
//!
//! # Delivery
//!
//! - **At-least-once**: the producer may redeliver on broker failover
//! - **No retries from the mediator**: a failed publish is classified like
//!   any other call that produced no response
//!
//! # Example
//!
//! ```no_run
//! use mediator_redpanda::RedpandaPublisher;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let publisher = RedpandaPublisher::builder()
//!     .brokers("localhost:9092")
//!     .producer_acks("all")
//!     .compression("lz4")
//!     .timeout(Duration::from_secs(5))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use mediator_core::publisher::{PublishAck, PublishError, Publisher};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default producer acknowledgement mode.
pub const DEFAULT_ACKS: &str = "1";

/// Default compression codec.
pub const DEFAULT_COMPRESSION: &str = "none";

/// Default delivery timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Publish-only Redpanda producer.
///
/// Payloads are published as JSON text with no key, so the broker's
/// partitioner spreads them across partitions.
pub struct RedpandaPublisher {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
}

impl std::fmt::Debug for RedpandaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaPublisher")
            .field("brokers", &self.brokers)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedpandaPublisher {
    /// Create a publisher with default producer settings.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, PublishError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaPublisherBuilder {
        RedpandaPublisherBuilder::default()
    }

    /// The configured broker list.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for [`RedpandaPublisher`].
#[derive(Debug, Default)]
pub struct RedpandaPublisherBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl RedpandaPublisherBuilder {
    /// Comma-separated broker addresses (e.g. `localhost:9092`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// `"0"`, `"1"` or `"all"`. Default: `"1"`.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`. Default: `"none"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Delivery timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the publisher.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::ConnectionFailed`] if brokers are not set or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaPublisher, PublishError> {
        let brokers = self
            .brokers
            .filter(|brokers| !brokers.trim().is_empty())
            .ok_or_else(|| PublishError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or(DEFAULT_ACKS);
        let compression = self.compression.as_deref().unwrap_or(DEFAULT_COMPRESSION);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| PublishError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            "RedpandaPublisher created"
        );

        Ok(RedpandaPublisher {
            producer,
            brokers,
            timeout,
        })
    }
}

impl Publisher for RedpandaPublisher {
    fn publish(
        &self,
        topic: &str,
        payload: &Value,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, PublishError>> + Send + '_>> {
        let topic = topic.to_string();
        let payload = serde_json::to_vec(payload);

        Box::pin(async move {
            let bytes = payload.map_err(|e| PublishError::Serialization(e.to_string()))?;
            let record = FutureRecord::<(), _>::to(&topic).payload(&bytes);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(topic = %topic, partition, offset, "Message published");
                    Ok(PublishAck {
                        topic,
                        partition,
                        offset,
                    })
                }
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish message");
                    Err(PublishError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }
}
