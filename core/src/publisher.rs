//! Queue publish boundary.
//!
//! A request configured with `kafkaProducerTopic` skips HTTP entirely: its
//! resolved body is published to that topic and the acknowledgement becomes
//! its outcome.
//!
//! # Implementations
//!
//! - `MockPublisher` in `mediator-testing` - records published messages
//! - `RedpandaPublisher` in `mediator-redpanda` - Kafka-compatible producer

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while publishing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// No connection to the broker could be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker rejected the message or the delivery timed out
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// The payload could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Broker acknowledgement of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    /// Topic the message landed on
    pub topic: String,
    /// Partition the message landed on
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

/// Publish-only message queue producer.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the engine can hold an
/// `Arc<dyn Publisher>`.
pub trait Publisher: Send + Sync {
    /// Publish `payload` to `topic`.
    ///
    /// Delivery is at-least-once; the engine never retries.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the message was not acknowledged.
    fn publish(
        &self,
        topic: &str,
        payload: &Value,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, PublishError>> + Send + '_>>;
}
