//! Process-local broker.
//!
//! Queues live in a single `tokio::sync::Mutex`-guarded table. Each queue
//! has a `Notify` that wakes one waiting consumer per published message;
//! a consumer that takes a message from a queue that still has more wakes
//! the next one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use super::{
    Broker, BrokerError, Consumer, DeadLetter, Delivery, DeliveryTag,
    MessageProperties, OutboundMessage, DEAD_LETTER_SUFFIX,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    properties: MessageProperties,
    body: Vec<u8>,
    redelivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    dead: Vec<DeadLetter>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    in_flight: HashMap<DeliveryTag, (String, StoredMessage)>,
}

impl State {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn pop(&mut self, name: &str) -> Option<Delivery> {
        let queue = self.queue(name);
        let message = queue.ready.pop_front()?;
        if !queue.ready.is_empty() {
            queue.notify.notify_one();
        }

        let tag = DeliveryTag::new(Uuid::new_v4().to_string());
        let delivery = Delivery {
            tag: tag.clone(),
            properties: message.properties.clone(),
            body: message.body.clone(),
            redelivery_count: message.redelivery_count,
        };
        self.in_flight.insert(tag, (name.to_string(), message));
        Some(delivery)
    }

    fn requeue(&mut self, name: &str, mut message: StoredMessage) {
        message.redelivery_count += 1;
        let queue = self.queue(name);
        queue.ready.push_front(message);
        queue.notify.notify_one();
    }
}

/// In-memory [`Broker`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting in a queue.
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Number of delivered but unsettled messages across all queues.
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Number of dead letters for a queue.
    pub async fn dead_letter_len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map(|q| q.dead.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
        self.state.lock().await.queue(queue);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError> {
        let notify = self.state.lock().await.queue(queue).notify.clone();
        Ok(Box::new(InMemoryConsumer {
            state: self.state.clone(),
            queue: queue.to_string(),
            notify,
        }))
    }

    async fn publish(
        &self,
        destination: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let queue = state.queue(destination);
        queue.ready.push_back(StoredMessage {
            properties: message.properties,
            body: message.body,
            redelivery_count: 0,
        });
        queue.notify.notify_one();
        Ok(())
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(tag)
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery(tag.clone()))
    }

    async fn reject(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let (queue, message) = state
            .in_flight
            .remove(tag)
            .ok_or_else(|| BrokerError::UnknownDelivery(tag.clone()))?;

        if requeue {
            debug!(queue = %queue, tag = %tag, "Requeueing delivery");
            state.requeue(&queue, message);
        } else {
            debug!(queue = %queue, tag = %tag, "Dead-lettering delivery");
            state.queue(&queue).dead.push(DeadLetter {
                properties: message.properties,
                body: message.body,
                redelivery_count: message.redelivery_count,
                moved_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut state = self.state.lock().await;
        let tags: Vec<DeliveryTag> = state
            .in_flight
            .iter()
            .filter(|(_, (name, _))| name == queue)
            .map(|(tag, _)| tag.clone())
            .collect();

        for tag in &tags {
            if let Some((name, message)) = state.in_flight.remove(tag) {
                state.requeue(&name, message);
            }
        }
        Ok(tags.len())
    }

    async fn dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, BrokerError> {
        // Accept either the work queue or its dead-letter list name.
        let queue = queue.strip_suffix(DEAD_LETTER_SUFFIX).unwrap_or(queue);
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(queue)
            .map(|q| q.dead.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

struct InMemoryConsumer {
    state: Arc<Mutex<State>>,
    queue: String,
    notify: Arc<Notify>,
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn receive(&mut self) -> Result<Delivery, BrokerError> {
        loop {
            if let Some(delivery) = self.state.lock().await.pop(&self.queue) {
                return Ok(delivery);
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn message(body: &str) -> OutboundMessage {
        OutboundMessage::new(body.as_bytes().to_vec())
            .with_content_type("application/json")
            .with_correlation_id(body)
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = InMemoryBroker::new();
        broker.declare("q").await.expect("declare");
        broker.publish("q", message("a")).await.expect("publish");

        let mut consumer = broker.consume("q").await.expect("consume");
        let delivery = consumer.receive().await.expect("receive");
        assert_eq!(delivery.body, b"a");
        assert_eq!(delivery.properties.correlation_id.as_deref(), Some("a"));
        assert_eq!(delivery.redelivery_count, 0);
        assert_eq!(broker.in_flight_len().await, 1);

        broker.ack(&delivery.tag).await.expect("ack");
        assert_eq!(broker.in_flight_len().await, 0);
        assert!(matches!(
            broker.ack(&delivery.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let broker = InMemoryBroker::new();
        for body in ["1", "2", "3"] {
            broker.publish("q", message(body)).await.expect("publish");
        }

        let mut consumer = broker.consume("q").await.expect("consume");
        for expected in ["1", "2", "3"] {
            let delivery = consumer.receive().await.expect("receive");
            assert_eq!(delivery.body, expected.as_bytes());
            broker.ack(&delivery.tag).await.expect("ack");
        }
    }

    #[tokio::test]
    async fn test_receive_waits_for_publish() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.consume("q").await.expect("consume");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("q", message("late")).await.expect("publish");
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.receive())
            .await
            .expect("delivery before timeout")
            .expect("receive");
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test]
    async fn test_competing_consumers_each_get_distinct_messages() {
        let broker = InMemoryBroker::new();
        let mut a = broker.consume("q").await.expect("consume");
        let mut b = broker.consume("q").await.expect("consume");

        broker.publish("q", message("x")).await.expect("publish");
        broker.publish("q", message("y")).await.expect("publish");

        let first = a.receive().await.expect("receive");
        let second = b.receive().await.expect("receive");
        assert_ne!(first.body, second.body);
        assert_eq!(broker.queue_len("q").await, 0);
    }

    #[tokio::test]
    async fn test_reject_with_requeue_increments_count() {
        let broker = InMemoryBroker::new();
        broker.publish("q", message("a")).await.expect("publish");
        let mut consumer = broker.consume("q").await.expect("consume");

        let delivery = consumer.receive().await.expect("receive");
        broker.reject(&delivery.tag, true).await.expect("reject");

        let delivery = consumer.receive().await.expect("redelivery");
        assert_eq!(delivery.redelivery_count, 1);
        assert_eq!(delivery.body, b"a");
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        broker.publish("q", message("bad")).await.expect("publish");
        let mut consumer = broker.consume("q").await.expect("consume");

        let delivery = consumer.receive().await.expect("receive");
        broker.reject(&delivery.tag, false).await.expect("reject");

        assert_eq!(broker.queue_len("q").await, 0);
        assert_eq!(broker.dead_letter_len("q").await, 1);

        let letters = broker.dead_letters("q", 10).await.expect("dead letters");
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].body_text(), "bad");

        let letters = broker
            .dead_letters("q:dead_letter", 10)
            .await
            .expect("dead letters by list name");
        assert_eq!(letters.len(), 1);
    }

    #[tokio::test]
    async fn test_recover_requeues_in_flight() {
        let broker = InMemoryBroker::new();
        broker.publish("q", message("a")).await.expect("publish");
        let mut consumer = broker.consume("q").await.expect("consume");
        let _abandoned = consumer.receive().await.expect("receive");
        drop(consumer);

        assert_eq!(broker.recover("q").await.expect("recover"), 1);
        assert_eq!(broker.in_flight_len().await, 0);
        assert_eq!(broker.queue_len("q").await, 1);
        assert_eq!(broker.recover("other").await.expect("recover"), 0);
    }
}
