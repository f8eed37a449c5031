//! Integration tests for the worker pool over the in-memory broker.
//!
//! The R engine is replaced by a double that writes every staged output
//! file the statements name, so the full fetch, evaluate, store and reply
//! path runs without R installed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use url::Url;

use analysis_rpc::broker::{
    Broker, BrokerError, Consumer, DeadLetter, DeliveryTag, InMemoryBroker, OutboundMessage,
};
use analysis_rpc::engine::{Engine, EngineFactory, EngineValue};
use analysis_rpc::{
    AnalysisClient, AnalysisRequest, EngineError, ReplyStatus, WorkerPool, WorkerPoolConfig,
};

const QUEUE: &str = "pals_analysis_test";

/// Writes each string-assigned path under `output_dir` when the result
/// call is evaluated.
struct FileWritingEngine {
    output_dir: PathBuf,
    pending: Vec<PathBuf>,
}

#[async_trait]
impl Engine for FileWritingEngine {
    async fn evaluate(&mut self, statement: &str) -> Result<EngineValue, EngineError> {
        if statement.starts_with("result<-") {
            for path in self.pending.drain(..) {
                tokio::fs::write(&path, b"output")
                    .await
                    .map_err(|e| EngineError::EvaluationFailed {
                        statement: statement.to_string(),
                        message: e.to_string(),
                    })?;
            }
            return Ok(EngineValue::new("NULL"));
        }

        if let Some((_, value)) = statement.split_once('=') {
            let path = PathBuf::from(value.trim_matches('"'));
            if path.starts_with(&self.output_dir) {
                self.pending.push(path);
            }
        }
        Ok(EngineValue::default())
    }
}

struct FileWritingFactory {
    output_dir: PathBuf,
    created: AtomicUsize,
}

#[async_trait]
impl EngineFactory for FileWritingFactory {
    async fn create(&self) -> Result<Box<dyn Engine>, EngineError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FileWritingEngine {
            output_dir: self.output_dir.clone(),
            pending: Vec::new(),
        }))
    }
}

struct Setup {
    temp: TempDir,
    broker: Arc<InMemoryBroker>,
    factory: Arc<FileWritingFactory>,
    pool: WorkerPool,
}

impl Setup {
    fn new(max_redeliveries: u32) -> Self {
        let temp = TempDir::new().expect("temp dir");
        let output_dir = temp.path().join("output");
        let broker = Arc::new(InMemoryBroker::new());
        let factory = Arc::new(FileWritingFactory {
            output_dir: output_dir.clone(),
            created: AtomicUsize::new(0),
        });

        let config = WorkerPoolConfig::new(4)
            .with_queue_name(QUEUE)
            .with_staging_dirs(temp.path().join("input"), output_dir)
            .with_idle_pause(Duration::from_millis(1))
            .with_poll_interval(Duration::from_millis(50))
            .with_shutdown_timeout(Duration::from_secs(10))
            .with_max_redeliveries(max_redeliveries);
        let pool = WorkerPool::new(config, broker.clone(), factory.clone());

        Self {
            temp,
            broker,
            factory,
            pool,
        }
    }

    fn remote_dir(&self) -> PathBuf {
        self.temp.path().join("remote")
    }

    fn remote_csv(&self, name: &str) -> Url {
        let dir = self.remote_dir();
        std::fs::create_dir_all(&dir).expect("remote dir");
        let path = dir.join(name);
        std::fs::write(&path, "time,flux\n0,1.5\n").expect("write csv");
        Url::from_file_path(&path).expect("file url")
    }

    fn staged_files(&self) -> Vec<PathBuf> {
        ["input", "output"]
            .iter()
            .map(|dir| self.temp.path().join(dir))
            .filter(|dir| dir.exists())
            .flat_map(|dir| {
                std::fs::read_dir(dir)
                    .expect("read staging dir")
                    .map(|entry| entry.expect("dir entry").path())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

fn conversion_request(obs_csv: &Url) -> AnalysisRequest {
    AnalysisRequest::new("CVS2NETCDF")
        .with_argument("obsCSV", obs_csv.as_str())
        .with_argument("userName", "alice")
        .with_argument("dataSetName", "TumbaFluxnet")
        .with_argument("dataSetVersionName", "1.4")
        .with_argument("longitude", 148.15)
        .with_argument("latitude", -35.66)
        .with_argument("elevation", 1200.0)
        .with_argument("towerHeight", 70.0)
}

fn file_name(url: &str) -> String {
    let url = Url::parse(url).expect("result url");
    let path = url.to_file_path().expect("file path");
    path.file_name()
        .and_then(|name| name.to_str())
        .expect("file name")
        .to_string()
}

#[tokio::test]
async fn test_four_workers_answer_ten_requests() {
    let mut setup = Setup::new(3);
    setup.pool.start(4).await.expect("start pool");

    let mut client = AnalysisClient::connect(setup.broker.clone(), QUEUE)
        .await
        .expect("connect client")
        .with_timeout(Duration::from_secs(10));

    let mut expected = HashSet::new();
    for i in 0..10 {
        let request = conversion_request(&setup.remote_csv(&format!("site{}.csv", i)));
        expected.insert(request.id().to_string());
        client.publish(&request).await.expect("publish");
    }

    let mut seen = HashSet::new();
    for _ in 0..10 {
        let received = client.next_reply().await.expect("reply");
        let correlation_id = received.correlation_id.expect("correlation id");
        assert_eq!(correlation_id, received.reply.request_id().to_string());
        assert_eq!(received.reply.status(), ReplyStatus::Normal);

        let id = received.reply.request_id();
        let results = received.reply.results();
        assert_eq!(results.len(), 2);
        let flux = received.reply.result_str("obsFlux").expect("flux url");
        let met = received.reply.result_str("obsMet").expect("met url");
        assert_eq!(file_name(flux), format!("{}.flux.nc", id));
        assert_eq!(file_name(met), format!("{}.met.nc", id));
        assert!(Url::parse(flux)
            .expect("url")
            .to_file_path()
            .expect("path")
            .starts_with(setup.remote_dir()));

        assert!(seen.insert(correlation_id));
    }
    assert_eq!(seen, expected);

    let stats = setup.pool.stats();
    assert_eq!(stats.replies_normal, 10);
    assert_eq!(stats.replies_error, 0);
    assert!(setup.factory.created.load(Ordering::SeqCst) <= 4);

    setup.pool.stop().await.expect("stop pool");
    setup.pool.stop().await.expect("second stop");

    assert!(setup.staged_files().is_empty());
    assert_eq!(setup.broker.in_flight_len().await, 0);
}

#[tokio::test]
async fn test_unknown_kind_gets_error_reply() {
    let mut setup = Setup::new(3);
    setup.pool.start(2).await.expect("start pool");

    let mut client = AnalysisClient::connect(setup.broker.clone(), QUEUE)
        .await
        .expect("connect client")
        .with_timeout(Duration::from_secs(10));

    let request = AnalysisRequest::new("FOO").with_argument("obsCSV", "file:///tmp/a.csv");
    let reply = client.submit(&request).await.expect("reply");

    assert_eq!(reply.status(), ReplyStatus::Error);
    assert_eq!(reply.request_id(), request.id());
    assert_eq!(reply.result_str("analysisName"), Some("FOO"));
    assert!(reply.error_message().expect("diagnostic").contains("FOO"));
    assert_eq!(setup.factory.created.load(Ordering::SeqCst), 0);

    setup.pool.stop().await.expect("stop pool");
    assert!(setup.staged_files().is_empty());
}

#[tokio::test]
async fn test_malformed_message_is_dead_lettered() {
    let mut setup = Setup::new(1);
    setup.pool.start(2).await.expect("start pool");

    setup
        .broker
        .publish(
            QUEUE,
            OutboundMessage::new(b"definitely not json".to_vec())
                .with_content_type("application/json")
                .with_reply_to("nobody"),
        )
        .await
        .expect("publish");

    let mut attempts = 0;
    while setup.broker.dead_letter_len(QUEUE).await == 0 {
        attempts += 1;
        assert!(attempts < 200, "message was never dead-lettered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let letters = setup
        .broker
        .dead_letters(QUEUE, 10)
        .await
        .expect("dead letters");
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].redelivery_count, 1);
    assert_eq!(letters[0].body_text(), "definitely not json");
    assert_eq!(setup.pool.stats().messages_rejected, 2);
    assert_eq!(setup.broker.queue_len("nobody").await, 0);

    setup.pool.stop().await.expect("stop pool");
}

#[tokio::test]
async fn test_restart_recovers_in_flight_message() {
    let setup = Setup::new(3);
    let request = conversion_request(&setup.remote_csv("site.csv"));

    // A consumer that dies without settling leaves the message in flight.
    let body = serde_json::to_vec(&request).expect("encode");
    setup
        .broker
        .publish(
            QUEUE,
            OutboundMessage::new(body)
                .with_content_type("application/json")
                .with_correlation_id(request.id().to_string())
                .with_reply_to("replies"),
        )
        .await
        .expect("publish");
    let mut abandoned = setup.broker.consume(QUEUE).await.expect("consume");
    let _ = abandoned.receive().await.expect("receive");
    drop(abandoned);

    let mut setup = setup;
    setup.pool.start(1).await.expect("start pool");

    let mut replies = setup.broker.consume("replies").await.expect("consume replies");
    let delivery = tokio::time::timeout(Duration::from_secs(10), replies.receive())
        .await
        .expect("reply in time")
        .expect("reply");
    let expected_id = request.id().to_string();
    assert_eq!(
        delivery.properties.correlation_id.as_deref(),
        Some(expected_id.as_str())
    );

    setup.pool.stop().await.expect("stop pool");
}

/// Delegates to an in-memory broker but refuses every publish to one
/// destination.
struct UnreachableReplies {
    inner: Arc<InMemoryBroker>,
    destination: &'static str,
    refused: AtomicUsize,
}

#[async_trait]
impl Broker for UnreachableReplies {
    fn name(&self) -> &'static str {
        "unreachable-replies"
    }

    async fn declare(&self, queue: &str) -> Result<(), BrokerError> {
        self.inner.declare(queue).await
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError> {
        self.inner.consume(queue).await
    }

    async fn publish(
        &self,
        destination: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        if destination == self.destination {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(BrokerError::ConnectionFailed("reply queue unreachable".to_string()));
        }
        self.inner.publish(destination, message).await
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        self.inner.ack(tag).await
    }

    async fn reject(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.inner.reject(tag, requeue).await
    }

    async fn dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, BrokerError> {
        self.inner.dead_letters(queue, limit).await
    }
}

#[tokio::test]
async fn test_undeliverable_reply_is_not_acked() {
    let setup = Setup::new(1);
    let broker = Arc::new(UnreachableReplies {
        inner: setup.broker.clone(),
        destination: "replies",
        refused: AtomicUsize::new(0),
    });
    let config = setup.pool.config().clone();
    let mut pool = WorkerPool::new(config, broker.clone(), setup.factory.clone());
    pool.start(1).await.expect("start pool");

    let request = conversion_request(&setup.remote_csv("site.csv"));
    let body = serde_json::to_vec(&request).expect("encode");
    setup
        .broker
        .publish(
            QUEUE,
            OutboundMessage::new(body)
                .with_content_type("application/json")
                .with_correlation_id(request.id().to_string())
                .with_reply_to("replies"),
        )
        .await
        .expect("publish");

    let mut attempts = 0;
    while setup.broker.dead_letter_len(QUEUE).await == 0 {
        attempts += 1;
        assert!(attempts < 500, "request was never dead-lettered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Answered once, then once more on redelivery, then dead-lettered.
    assert_eq!(broker.refused.load(Ordering::SeqCst), 2);
    let letters = setup
        .broker
        .dead_letters(QUEUE, 10)
        .await
        .expect("dead letters");
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].redelivery_count, 1);
    assert_eq!(
        letters[0].properties.correlation_id.as_deref(),
        Some(request.id().to_string().as_str())
    );
    assert_eq!(setup.broker.queue_len(QUEUE).await, 0);
    assert_eq!(setup.broker.in_flight_len().await, 0);

    pool.stop().await.expect("stop pool");
}

#[tokio::test]
async fn test_stop_without_start() {
    let mut setup = Setup::new(3);
    setup.pool.stop().await.expect("stop on a pool that never started");
    assert!(!setup.pool.is_running());
}
