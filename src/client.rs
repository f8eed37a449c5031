//! Request/reply client.
//!
//! [`AnalysisClient`] publishes requests to the work queue with a private
//! reply queue and the request id as correlation token, then waits for the
//! matching reply.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, Consumer, OutboundMessage};
use crate::codec::{CodecError, MessageCodec, CONTENT_TYPE_JSON};
use crate::request::{AnalysisReply, AnalysisRequest};

/// Default time to wait for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors that can occur while submitting a request.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("No reply within {0:?}")]
    Timeout(Duration),
}

/// A reply together with the correlation token it was published with.
#[derive(Debug, Clone)]
pub struct ReceivedReply {
    pub correlation_id: Option<String>,
    pub reply: AnalysisReply,
}

/// Client for one work queue.
pub struct AnalysisClient {
    broker: Arc<dyn Broker>,
    queue: String,
    reply_queue: String,
    consumer: Box<dyn Consumer>,
    codec: MessageCodec,
    timeout: Duration,
}

impl AnalysisClient {
    /// Declares the work queue and opens a private reply queue.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let queue = queue.into();
        let reply_queue = format!("{}:reply:{}", queue, Uuid::new_v4().simple());

        broker.declare(&queue).await?;
        broker.declare(&reply_queue).await?;
        let consumer = broker.consume(&reply_queue).await?;

        debug!(queue = %queue, reply_queue = %reply_queue, "Client connected");

        Ok(Self {
            broker,
            queue,
            reply_queue,
            consumer,
            codec: MessageCodec::new(),
            timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    /// Sets how long to wait for a reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the private reply queue name.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Publishes a request without waiting for its reply.
    pub async fn publish(&self, request: &AnalysisRequest) -> Result<(), ClientError> {
        let body = self.codec.encode_request(CONTENT_TYPE_JSON, request)?;
        let message = OutboundMessage::new(body)
            .with_content_type(CONTENT_TYPE_JSON)
            .with_correlation_id(request.id().to_string())
            .with_reply_to(self.reply_queue.clone());

        self.broker.publish(&self.queue, message).await?;
        debug!(request_id = %request.id(), kind = %request.kind(), "Request published");
        Ok(())
    }

    /// Waits for the next reply on the reply queue and acks it.
    pub async fn next_reply(&mut self) -> Result<ReceivedReply, ClientError> {
        let delivery = tokio::time::timeout(self.timeout, self.consumer.receive())
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;

        let content_type = delivery
            .properties
            .content_type
            .as_deref()
            .unwrap_or(CONTENT_TYPE_JSON);
        let decoded = self.codec.decode_reply(content_type, &delivery.body);
        self.broker.ack(&delivery.tag).await?;

        Ok(ReceivedReply {
            correlation_id: delivery.properties.correlation_id,
            reply: decoded?,
        })
    }

    /// Publishes a request and waits for its correlated reply.
    ///
    /// Replies carrying another correlation token are discarded.
    pub async fn submit(&mut self, request: &AnalysisRequest) -> Result<AnalysisReply, ClientError> {
        self.publish(request).await?;
        let expected = request.id().to_string();

        loop {
            let received = self.next_reply().await?;
            if received.correlation_id.as_deref() == Some(expected.as_str()) {
                return Ok(received.reply);
            }
            warn!(
                expected = %expected,
                correlation_id = ?received.correlation_id,
                "Discarding uncorrelated reply"
            );
        }
    }
}

impl std::fmt::Debug for AnalysisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisClient")
            .field("broker", &self.broker.name())
            .field("queue", &self.queue)
            .field("reply_queue", &self.reply_queue)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::request::ReplyStatus;

    async fn answer_next(broker: &InMemoryBroker, queue: &str, correlation_override: Option<&str>) {
        let codec = MessageCodec::new();
        let mut consumer = broker.consume(queue).await.expect("consume");
        let delivery = consumer.receive().await.expect("request");
        let request = codec
            .decode_request(CONTENT_TYPE_JSON, &delivery.body)
            .expect("decode request");

        let reply = AnalysisReply::error(request.id(), request.kind(), "boom");
        let correlation = correlation_override
            .map(str::to_string)
            .or(delivery.properties.correlation_id.clone())
            .expect("correlation id");
        let body = codec.encode_reply(CONTENT_TYPE_JSON, &reply).expect("encode");
        broker
            .publish(
                delivery.properties.reply_to.as_deref().expect("reply_to"),
                OutboundMessage::new(body)
                    .with_content_type(CONTENT_TYPE_JSON)
                    .with_correlation_id(correlation),
            )
            .await
            .expect("publish reply");
        broker.ack(&delivery.tag).await.expect("ack");
    }

    #[tokio::test]
    async fn test_publish_sets_reply_properties() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = AnalysisClient::connect(broker.clone(), "jobs")
            .await
            .expect("connect");
        assert!(client.reply_queue().starts_with("jobs:reply:"));

        let request = AnalysisRequest::new("QCPLOT");
        client.publish(&request).await.expect("publish");

        let mut consumer = broker.consume("jobs").await.expect("consume");
        let delivery = consumer.receive().await.expect("receive");
        let expected_id = request.id().to_string();
        assert_eq!(
            delivery.properties.correlation_id.as_deref(),
            Some(expected_id.as_str())
        );
        assert_eq!(
            delivery.properties.reply_to.as_deref(),
            Some(client.reply_queue())
        );
    }

    #[tokio::test]
    async fn test_submit_returns_correlated_reply() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut client = AnalysisClient::connect(broker.clone(), "jobs")
            .await
            .expect("connect");

        let responder = broker.clone();
        tokio::spawn(async move { answer_next(&responder, "jobs", None).await });

        let request = AnalysisRequest::new("EMPBENCH");
        let reply = client.submit(&request).await.expect("reply");
        assert_eq!(reply.request_id(), request.id());
        assert_eq!(reply.status(), ReplyStatus::Error);
    }

    #[tokio::test]
    async fn test_uncorrelated_reply_is_skipped_until_timeout() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut client = AnalysisClient::connect(broker.clone(), "jobs")
            .await
            .expect("connect")
            .with_timeout(Duration::from_millis(200));

        let responder = broker.clone();
        tokio::spawn(async move { answer_next(&responder, "jobs", Some("someone-else")).await });

        let err = client
            .submit(&AnalysisRequest::new("EMPBENCH"))
            .await
            .expect_err("no matching reply");
        assert!(matches!(err, ClientError::Timeout(_)));
        assert_eq!(broker.queue_len(client.reply_queue()).await, 0);
    }
}
