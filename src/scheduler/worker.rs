//! A single queue consumer.
//!
//! A worker owns one consumer and one [`Analyser`]. It processes one message
//! at a time: decode, analyse, reply, ack. Messages that cannot be decoded,
//! and requests whose reply cannot be delivered, are rejected and
//! eventually dead-lettered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyser::Analyser;
use crate::broker::{Broker, BrokerError, Consumer, Delivery, OutboundMessage};
use crate::codec::{CodecError, MessageCodec, CONTENT_TYPE_JSON};
use crate::request::{AnalysisReply, AnalysisRequest};

use super::worker_pool::{SharedPoolStats, WorkerPoolConfig};

/// Why a computed reply did not reach its destination.
#[derive(Debug, Error)]
enum ReplyError {
    #[error("Failed to encode reply: {0}")]
    Encode(#[from] CodecError),

    #[error("Failed to publish reply: {0}")]
    Publish(#[from] BrokerError),
}

/// Loop timing and redelivery settings copied from the pool configuration.
#[derive(Debug, Clone)]
struct WorkerSettings {
    queue_name: String,
    poll_interval: Duration,
    idle_pause: Duration,
    max_redeliveries: u32,
}

pub(crate) struct Worker {
    id: String,
    broker: Arc<dyn Broker>,
    analyser: Analyser,
    codec: MessageCodec,
    cancel: CancellationToken,
    settings: WorkerSettings,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    pub(crate) fn new(
        id: String,
        broker: Arc<dyn Broker>,
        analyser: Analyser,
        cancel: CancellationToken,
        config: &WorkerPoolConfig,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            broker,
            analyser,
            codec: MessageCodec::new(),
            cancel,
            settings: WorkerSettings {
                queue_name: config.queue_name.clone(),
                poll_interval: config.poll_interval,
                idle_pause: config.idle_pause,
                max_redeliveries: config.max_redeliveries,
            },
            stats,
        }
    }

    /// Runs until the cancellation token fires.
    pub(crate) async fn run(mut self) {
        info!(worker_id = %self.id, queue = %self.settings.queue_name, "Worker started");

        if let Some(mut consumer) = self.subscribe().await {
            self.consume(consumer.as_mut()).await;
        }

        self.analyser.shutdown().await;
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Opens the consumer, retrying after `poll_interval` on failure.
    async fn subscribe(&mut self) -> Option<Box<dyn Consumer>> {
        loop {
            match self.broker.consume(&self.settings.queue_name).await {
                Ok(consumer) => return Some(consumer),
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to open consumer");
                    if !self.pause(self.settings.poll_interval).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn consume(&mut self, consumer: &mut dyn Consumer) {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                received = consumer.receive() => received,
            };

            match received {
                Ok(delivery) => {
                    if let Err(e) = self.process(delivery).await {
                        error!(worker_id = %self.id, error = %e, "Failed to settle message");
                    }
                    if !self.pause(self.settings.idle_pause).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to receive message");
                    if !self.pause(self.settings.poll_interval).await {
                        break;
                    }
                }
            }
        }
    }

    /// Sleeps unless cancelled first. Returns false when cancelled.
    ///
    /// `&mut self`: `Worker` is `Send` but not `Sync`.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn process(&mut self, delivery: Delivery) -> Result<(), BrokerError> {
        let content_type = delivery
            .properties
            .content_type
            .clone()
            .unwrap_or_else(|| CONTENT_TYPE_JSON.to_string());

        let request = match self.codec.decode_request(&content_type, &delivery.body) {
            Ok(request) => request,
            Err(e) => {
                let requeue = delivery.redelivery_count < self.settings.max_redeliveries;
                warn!(
                    worker_id = %self.id,
                    error = %e,
                    redelivery_count = delivery.redelivery_count,
                    requeue,
                    "Rejecting undecodable message"
                );
                self.stats.record_rejected();
                return self.broker.reject(&delivery.tag, requeue).await;
            }
        };

        debug!(
            worker_id = %self.id,
            request_id = %request.id(),
            kind = %request.kind(),
            "Processing request"
        );

        self.stats.increment_active();
        let started = Instant::now();
        let reply = self.analyser.respond(&request).await;
        let duration = started.elapsed();
        self.stats.decrement_active();
        self.stats.record_reply(reply.is_normal(), duration);

        info!(
            worker_id = %self.id,
            request_id = %request.id(),
            status = %reply.status(),
            duration_ms = duration.as_millis() as u64,
            "Request processed"
        );

        match self.send_reply(&delivery, &request, &content_type, &reply).await {
            Ok(()) => self.broker.ack(&delivery.tag).await,
            Err(e) => {
                let requeue = delivery.redelivery_count < self.settings.max_redeliveries;
                error!(
                    worker_id = %self.id,
                    request_id = %request.id(),
                    error = %e,
                    redelivery_count = delivery.redelivery_count,
                    requeue,
                    "Reply not delivered; rejecting request"
                );
                self.broker.reject(&delivery.tag, requeue).await
            }
        }
    }

    /// Publishes the reply. A request without a reply destination has its
    /// reply dropped and counts as delivered.
    async fn send_reply(
        &mut self,
        delivery: &Delivery,
        request: &AnalysisRequest,
        content_type: &str,
        reply: &AnalysisReply,
    ) -> Result<(), ReplyError> {
        let Some(reply_to) = delivery.properties.reply_to.as_deref() else {
            warn!(
                worker_id = %self.id,
                request_id = %request.id(),
                "Request has no reply destination; dropping reply"
            );
            return Ok(());
        };

        let body = self.codec.encode_reply(content_type, reply)?;
        let correlation_id = delivery
            .properties
            .correlation_id
            .clone()
            .unwrap_or_else(|| request.id().to_string());
        let message = OutboundMessage::new(body)
            .with_content_type(content_type)
            .with_correlation_id(correlation_id);

        self.broker.publish(reply_to, message).await?;
        Ok(())
    }
}
