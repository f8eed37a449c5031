//! Message broker abstraction.
//!
//! Workers consume requests from a shared, durable queue and publish replies
//! to the destination named in each request's `reply_to` property. A
//! delivery stays unacknowledged until the worker calls [`Broker::ack`] or
//! [`Broker::reject`]; each delivery goes to at most one consumer.
//!
//! Two implementations are provided:
//!
//! - [`InMemoryBroker`]: process-local queues for tests and single-process
//!   deployments.
//! - [`RedisBroker`]: Redis lists with reliable dequeue (`BRPOPLPUSH`).
//!
//! Rejected deliveries are either requeued with an incremented redelivery
//! count or moved to the `<queue>:dead_letter` list.

mod memory;
mod redis_queue;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::memory::InMemoryBroker;
pub use self::redis_queue::RedisBroker;

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Failed to connect to the broker.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to (de)serialize a stored message.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The delivery was already settled or never existed.
    #[error("Unknown delivery: {0}")]
    UnknownDelivery(DeliveryTag),

    /// The broker has been shut down.
    #[error("Broker closed")]
    Closed,
}

/// Suffix appended to a queue name to form its dead-letter list.
pub const DEAD_LETTER_SUFFIX: &str = ":dead_letter";

/// Returns the name of the dead-letter list for a queue.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// Opaque handle used to settle a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message metadata carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            properties: MessageProperties::default(),
            body,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }
}

/// A received, not yet settled message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    /// Number of times this message was requeued before this delivery.
    pub redelivery_count: u32,
}

/// A message rejected without requeue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub properties: MessageProperties,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    pub redelivery_count: u32,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Returns the body as text, replacing invalid UTF-8.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A message queue service.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Makes sure the queue exists.
    async fn declare(&self, queue: &str) -> Result<(), BrokerError>;

    /// Starts consuming from a queue. Each consumer receives one message at
    /// a time.
    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError>;

    /// Publishes a message to a destination queue.
    async fn publish(&self, destination: &str, message: OutboundMessage)
        -> Result<(), BrokerError>;

    /// Settles a delivery as processed.
    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Settles a delivery as rejected, either requeueing it or moving it to
    /// the dead-letter list.
    async fn reject(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Requeues messages left in flight by a previous process. Returns how
    /// many were recovered.
    async fn recover(&self, _queue: &str) -> Result<usize, BrokerError> {
        Ok(0)
    }

    /// Returns up to `limit` dead letters for a queue, newest first.
    async fn dead_letters(&self, queue: &str, limit: usize)
        -> Result<Vec<DeadLetter>, BrokerError>;
}

/// A subscription to one queue.
#[async_trait]
pub trait Consumer: Send {
    /// Waits for the next delivery.
    async fn receive(&mut self) -> Result<Delivery, BrokerError>;
}

/// Serializes message bodies as base64 strings.
mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
