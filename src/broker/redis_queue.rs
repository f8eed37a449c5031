//! Redis-backed broker with reliable dequeue.
//!
//! # Queue Structure
//!
//! Each queue uses these Redis keys:
//!
//! - `{queue}`: messages waiting to be consumed
//! - `{queue}:processing:{owner}`: messages delivered to one broker
//!   instance and not yet settled
//! - `{queue}:dead_letter`: messages rejected without requeue
//! - `{queue}:owners`: set of broker instances that have consumed the queue
//! - `{queue}:owner:{owner}`: heartbeat key, expiring when its owner stops
//!   refreshing it
//!
//! Messages are stored as JSON envelopes carrying the properties, the
//! base64-encoded body and the redelivery count. Publishing pushes on the
//! left; consumers pop from the right with `BRPOPLPUSH`, which atomically
//! moves the envelope into the owner's processing list. [`Broker::recover`]
//! only requeues the processing lists of owners whose heartbeat has
//! expired, so live processes sharing the queue keep their messages.
//!
//! Each consumer runs its blocking fetches on a background task with its
//! own connection. [`Consumer::receive`] only waits on a channel, so
//! dropping it mid-wait never loses a message: the fetched delivery is
//! handed to the next call, or pushed back to the queue once the consumer
//! is gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    dead_letter_queue, Broker, BrokerError, Consumer, DeadLetter, Delivery, DeliveryTag,
    MessageProperties, OutboundMessage, DEAD_LETTER_SUFFIX,
};

/// How long a single `BRPOPLPUSH` blocks before the fetch loop polls again.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// How often a consuming broker refreshes its heartbeat.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Lifetime of a heartbeat key. An owner silent for longer is presumed dead.
const HEARTBEAT_TTL: Duration = Duration::from_secs(30);

fn processing_queue(queue: &str, owner: &str) -> String {
    format!("{}:processing:{}", queue, owner)
}

fn owners_key(queue: &str) -> String {
    format!("{}:owners", queue)
}

fn heartbeat_key(queue: &str, owner: &str) -> String {
    format!("{}:owner:{}", queue, owner)
}

/// Inclusive `LRANGE` stop index selecting at most `limit` entries, or
/// `None` when nothing should be read.
fn lrange_stop(limit: usize) -> Option<isize> {
    let limit = isize::try_from(limit).unwrap_or(isize::MAX);
    limit.checked_sub(1).filter(|stop| *stop >= 0)
}

/// Stored form of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    id: Uuid,
    #[serde(default)]
    properties: MessageProperties,
    #[serde(with = "super::base64_body")]
    body: Vec<u8>,
    #[serde(default)]
    redelivery_count: u32,
}

impl Envelope {
    fn new(message: OutboundMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            properties: message.properties,
            body: message.body,
            redelivery_count: 0,
        }
    }

    /// Returns the envelope for the next delivery attempt.
    fn redelivered(&self) -> Self {
        Self {
            redelivery_count: self.redelivery_count + 1,
            ..self.clone()
        }
    }

    fn into_dead_letter(self) -> DeadLetter {
        DeadLetter {
            properties: self.properties,
            body: self.body,
            redelivery_count: self.redelivery_count,
            moved_at: Utc::now(),
        }
    }
}

/// An envelope sitting in a processing list.
#[derive(Debug, Clone)]
struct InFlight {
    queue: String,
    processing: String,
    raw: String,
    envelope: Envelope,
}

type InFlightTable = Arc<Mutex<HashMap<DeliveryTag, InFlight>>>;

/// Redis-backed [`Broker`].
pub struct RedisBroker {
    client: redis::Client,
    /// Shared connection for non-blocking commands.
    redis: ConnectionManager,
    /// Identifies this instance's processing lists and heartbeat.
    owner: String,
    in_flight: InFlightTable,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            owner: Uuid::new_v4().simple().to_string(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Returns the number of messages waiting in a queue.
    pub async fn len(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(queue).await?;
        Ok(len)
    }

    /// Returns the number of messages this instance holds in flight for a
    /// queue.
    pub async fn processing_len(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(processing_queue(queue, &self.owner)).await?;
        Ok(len)
    }

    /// Returns the number of dead letters for a queue.
    pub async fn dead_letter_len(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(dead_letter_queue(queue)).await?;
        Ok(len)
    }

    /// Deletes a queue together with this instance's processing list, the
    /// dead-letter list and the owner registry.
    pub async fn clear(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.del(queue)
            .del(processing_queue(queue, &self.owner))
            .del(dead_letter_queue(queue))
            .del(owners_key(queue))
            .del(heartbeat_key(queue, &self.owner));
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn take_in_flight(&self, tag: &DeliveryTag) -> Result<InFlight, BrokerError> {
        self.in_flight
            .lock()
            .await
            .remove(tag)
            .ok_or_else(|| BrokerError::UnknownDelivery(tag.clone()))
    }

    /// Moves every entry of a processing list back to its queue.
    async fn requeue_list(&self, queue: &str, processing: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let raw_entries: Vec<String> = conn.lrange(processing, 0, -1).await?;

        let mut recovered = 0;
        for raw in raw_entries {
            let mut pipe = redis::pipe();
            match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => {
                    let serialized = serde_json::to_string(&envelope.redelivered())?;
                    pipe.atomic()
                        .lrem(processing, 1, &raw)
                        .rpush(queue, serialized);
                    recovered += 1;
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Dropping unreadable in-flight entry");
                    pipe.lrem(processing, 1, &raw);
                }
            }
            pipe.query_async::<_, ()>(&mut conn).await?;
        }
        Ok(recovered)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    /// Lists need no declaration; this verifies the server is reachable.
    async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        debug!(queue = %queue, "Redis queue ready");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError> {
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let mut fetcher = Fetcher {
            conn,
            queue: queue.to_string(),
            owner: self.owner.clone(),
            processing_queue: processing_queue(queue, &self.owner),
            dead_letter_queue: dead_letter_queue(queue),
            in_flight: self.in_flight.clone(),
            last_beat: None,
        };
        // Registered before the first fetch so no other process can mistake
        // this owner's list for an orphan.
        fetcher.beat().await?;

        let (request_tx, request_rx) = mpsc::channel(1);
        let (delivery_tx, delivery_rx) = mpsc::channel(1);
        tokio::spawn(fetcher.run(request_rx, delivery_tx));

        Ok(Box::new(RedisConsumer {
            requests: request_tx,
            deliveries: delivery_rx,
            pending: false,
        }))
    }

    async fn publish(
        &self,
        destination: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let serialized = serde_json::to_string(&Envelope::new(message))?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(destination, serialized).await?;
        Ok(())
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let entry = self.take_in_flight(tag).await?;
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(&entry.processing, 1, &entry.raw)
            .await?;
        Ok(())
    }

    async fn reject(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let entry = self.take_in_flight(tag).await?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        if requeue {
            // Back on the right end so it is consumed next.
            let serialized = serde_json::to_string(&entry.envelope.redelivered())?;
            pipe.atomic()
                .lrem(&entry.processing, 1, &entry.raw)
                .rpush(&entry.queue, serialized);
        } else {
            let serialized = serde_json::to_string(&entry.envelope.into_dead_letter())?;
            pipe.atomic()
                .lrem(&entry.processing, 1, &entry.raw)
                .lpush(dead_letter_queue(&entry.queue), serialized);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(queue = %entry.queue, tag = %tag, requeue, "Rejected delivery");
        Ok(())
    }

    /// Requeues the in-flight messages of owners whose heartbeat expired.
    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let owners: Vec<String> = conn.smembers(owners_key(queue)).await?;

        let mut recovered = 0;
        for owner in owners {
            if owner == self.owner {
                continue;
            }
            let alive: bool = conn.exists(heartbeat_key(queue, &owner)).await?;
            if alive {
                debug!(queue = %queue, owner = %owner, "Leaving live owner's messages");
                continue;
            }

            recovered += self
                .requeue_list(queue, &processing_queue(queue, &owner))
                .await?;
            conn.srem::<_, _, ()>(owners_key(queue), &owner).await?;
        }

        if recovered > 0 {
            info!(queue = %queue, recovered, "Recovered in-flight messages");
        }
        Ok(recovered)
    }

    async fn dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, BrokerError> {
        let Some(stop) = lrange_stop(limit) else {
            return Ok(Vec::new());
        };
        // Accept either the work queue or its dead-letter list name.
        let queue = queue.strip_suffix(DEAD_LETTER_SUFFIX).unwrap_or(queue);
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn.lrange(dead_letter_queue(queue), 0, stop).await?;

        let entries: Result<Vec<DeadLetter>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();
        Ok(entries?)
    }
}

/// Background half of a consumer: runs the blocking fetches and keeps the
/// owner's heartbeat fresh.
struct Fetcher {
    conn: ConnectionManager,
    queue: String,
    owner: String,
    processing_queue: String,
    dead_letter_queue: String,
    in_flight: InFlightTable,
    last_beat: Option<Instant>,
}

impl Fetcher {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<()>,
        deliveries: mpsc::Sender<Result<Delivery, BrokerError>>,
    ) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                request = requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                    let Some(result) = self.fetch(&deliveries).await else {
                        break;
                    };
                    if let Err(unsent) = deliveries.send(result).await {
                        if let Ok(delivery) = unsent.0 {
                            self.release(&delivery.tag).await;
                        }
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!(queue = %self.queue, error = %e, "Failed to refresh heartbeat");
                    }
                }
            }
        }
        debug!(queue = %self.queue, "Redis fetch loop stopped");
    }

    /// Refreshes the heartbeat key and the owner registration.
    async fn beat(&mut self) -> Result<(), BrokerError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set_ex(
                heartbeat_key(&self.queue, &self.owner),
                1,
                HEARTBEAT_TTL.as_secs(),
            )
            .sadd(owners_key(&self.queue), &self.owner);
        pipe.query_async::<_, ()>(&mut self.conn).await?;
        self.last_beat = Some(Instant::now());
        Ok(())
    }

    async fn beat_if_due(&mut self) {
        let due = self
            .last_beat
            .map_or(true, |last| last.elapsed() >= HEARTBEAT_INTERVAL);
        if due {
            if let Err(e) = self.beat().await {
                warn!(queue = %self.queue, error = %e, "Failed to refresh heartbeat");
            }
        }
    }

    /// Polls until a delivery or an error arrives. Returns `None` once the
    /// consumer is gone. A started `BRPOPLPUSH` always runs to completion.
    async fn fetch(
        &mut self,
        deliveries: &mpsc::Sender<Result<Delivery, BrokerError>>,
    ) -> Option<Result<Delivery, BrokerError>> {
        while !deliveries.is_closed() {
            self.beat_if_due().await;
            match self.poll().await {
                Ok(Some(delivery)) => return Some(Ok(delivery)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    /// One `BRPOPLPUSH` round. Unreadable envelopes are dead-lettered.
    async fn poll(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue)
            .arg(&self.processing_queue)
            .arg(BLOCK_TIMEOUT.as_secs())
            .query_async(&mut self.conn)
            .await?;

        let Some(raw) = result else {
            return Ok(None);
        };

        let envelope = match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Dead-lettering unreadable envelope");
                self.discard(&raw).await?;
                return Ok(None);
            }
        };

        let tag = DeliveryTag::new(envelope.id.to_string());
        let delivery = Delivery {
            tag: tag.clone(),
            properties: envelope.properties.clone(),
            body: envelope.body.clone(),
            redelivery_count: envelope.redelivery_count,
        };
        self.in_flight.lock().await.insert(
            tag,
            InFlight {
                queue: self.queue.clone(),
                processing: self.processing_queue.clone(),
                raw,
                envelope,
            },
        );
        Ok(Some(delivery))
    }

    /// Returns a fetched but never handed-over delivery to the front of the
    /// queue, unchanged.
    async fn release(&mut self, tag: &DeliveryTag) {
        let Some(entry) = self.in_flight.lock().await.remove(tag) else {
            return;
        };
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&entry.processing, 1, &entry.raw)
            .rpush(&entry.queue, &entry.raw);
        match pipe.query_async::<_, ()>(&mut self.conn).await {
            Ok(()) => debug!(queue = %entry.queue, tag = %tag, "Released unclaimed delivery"),
            Err(e) => error!(
                queue = %entry.queue,
                tag = %tag,
                error = %e,
                "Failed to release unclaimed delivery"
            ),
        }
    }

    /// Moves an entry that cannot be parsed straight to the dead-letter list.
    async fn discard(&mut self, raw: &str) -> Result<(), BrokerError> {
        let entry = DeadLetter {
            properties: MessageProperties::default(),
            body: raw.as_bytes().to_vec(),
            redelivery_count: 0,
            moved_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&entry)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.processing_queue, 1, raw)
            .lpush(&self.dead_letter_queue, serialized);
        pipe.query_async::<_, ()>(&mut self.conn).await?;
        Ok(())
    }
}

/// Foreground half of a consumer.
struct RedisConsumer {
    requests: mpsc::Sender<()>,
    deliveries: mpsc::Receiver<Result<Delivery, BrokerError>>,
    /// A fetch was requested and its result not yet taken.
    pending: bool,
}

#[async_trait]
impl Consumer for RedisConsumer {
    /// Cancel-safe: a fetch requested by a cancelled call is delivered to
    /// the next one.
    async fn receive(&mut self) -> Result<Delivery, BrokerError> {
        if !self.pending {
            self.requests.send(()).await.map_err(|_| BrokerError::Closed)?;
            self.pending = true;
        }
        let result = self.deliveries.recv().await.ok_or(BrokerError::Closed)?;
        self.pending = false;
        result
    }
}
