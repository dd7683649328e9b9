//! Integration tests for the job processor against real HTTP workers.
//!
//! Each test spins up an Axum stub worker on a random port and drives the
//! processor one tick at a time over a libSQL in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use agent_queue::agents::{AgentHandler, AgentMessage, LocalTransport, Messenger};
use agent_queue::config::{MessengerConfig, ProcessorConfig};
use agent_queue::error::MessengerError;
use agent_queue::jobs::{HandlerRegistry, JobProcessor, JobQueue, JobStatus};
use agent_queue::store::{AgentRegistry, JobStore, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Stub AI worker: the first `slow_calls` requests hang past the client timeout.
async fn start_worker(slow_calls: usize) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));

    async fn process(
        State((calls, slow_calls)): State<(Arc<AtomicUsize>, usize)>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < slow_calls {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Json(json!({"score": 87, "job_id": body["job_id"]}))
    }

    let app = Router::new()
        .route("/process", post(process))
        .with_state((Arc::clone(&calls), slow_calls));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}/process"), calls)
}

/// Stub AI worker that always answers with a server error.
async fn start_failing_worker() -> String {
    async fn process(Json(_body): Json<Value>) -> (StatusCode, &'static str) {
        (StatusCode::INTERNAL_SERVER_ERROR, "model overloaded")
    }

    let app = Router::new().route("/process", post(process));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}/process")
}

/// Replies with the message body it received.
struct Echo;

#[async_trait]
impl AgentHandler for Echo {
    async fn handle(&self, message: &AgentMessage) -> Result<Value, MessengerError> {
        Ok(json!({"echo": message.message, "from": message.from_agent}))
    }
}

/// Forwards every message it receives to a channel.
struct Recorder(mpsc::UnboundedSender<AgentMessage>);

#[async_trait]
impl AgentHandler for Recorder {
    async fn handle(&self, message: &AgentMessage) -> Result<Value, MessengerError> {
        let _ = self.0.send(message.clone());
        Ok(Value::Null)
    }
}

async fn build(worker_endpoint: &str) -> (Arc<LibSqlBackend>, JobQueue, JobProcessor) {
    build_with_transport(worker_endpoint, Arc::new(LocalTransport::new())).await
}

async fn build_with_transport(
    worker_endpoint: &str,
    transport: Arc<LocalTransport>,
) -> (Arc<LibSqlBackend>, JobQueue, JobProcessor) {
    let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let registry: Arc<dyn AgentRegistry> = backend.clone();
    let messenger = Arc::new(Messenger::new(
        Arc::clone(&registry),
        transport,
        MessengerConfig::default(),
    ));
    let handlers = Arc::new(HandlerRegistry::with_defaults(registry, messenger));

    let config = ProcessorConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_max_retries(3)
        .with_worker_endpoint(worker_endpoint)
        .with_ai_timeout(Duration::from_millis(200));

    let processor = JobProcessor::new(backend.clone(), handlers).with_config(config);
    (backend.clone(), JobQueue::new(backend), processor)
}

#[tokio::test]
async fn ai_job_times_out_once_then_completes() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, calls) = start_worker(1).await;
        let (store, queue, processor) = build(&endpoint).await;

        let job = queue
            .enqueue(json!({"type": "ai", "prompt": "score lead 42"}), "scorer")
            .await
            .unwrap();

        let first = processor.run_once().await.unwrap();
        assert_eq!(first.retried, 1);
        let after_timeout = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(after_timeout.status, JobStatus::Pending);
        assert_eq!(after_timeout.attempts, 1);
        assert!(after_timeout.last_error.unwrap().contains("timed out"));

        let second = processor.run_once().await.unwrap();
        assert_eq!(second.completed, 1);

        let done = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempts, 2);
        assert!(done.processed_at.is_some());
        assert_eq!(done.result.unwrap()["score"], 87);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreachable_worker_exhausts_retries() {
    timeout(TEST_TIMEOUT, async {
        // Nothing listens on port 9 locally.
        let (store, queue, processor) = build("http://127.0.0.1:9/process").await;
        let job = queue
            .enqueue(json!({"type": "inference"}), "scorer")
            .await
            .unwrap();

        for _ in 0..3 {
            processor.run_once().await.unwrap();
        }

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.processed_at.is_some());

        let report = processor.run_once().await.unwrap();
        assert_eq!(report.fetched, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn poll_loop_drains_mixed_batch() {
    timeout(TEST_TIMEOUT, async {
        let (endpoint, _calls) = start_worker(0).await;
        let (store, queue, processor) = build(&endpoint).await;

        store
            .upsert_agent_state("pipeline", json!({"leads": [{"v": 1}, {"v": 2}, {"v": 4}]}))
            .await
            .unwrap();

        let ai = queue.enqueue(json!({"type": "ai"}), "scorer").await.unwrap();
        let data = queue
            .enqueue(
                json!({"type": "aggregate", "operation": "sum", "field": "v",
                       "source": {"agent": "pipeline", "path": "leads"}}),
                "analytics",
            )
            .await
            .unwrap();
        let generic = queue
            .enqueue(json!({"type": "lead_digest", "week": 12}), "digest")
            .await
            .unwrap();

        let config = processor.status().await.config;
        processor.start(config).await;

        loop {
            let done = store.get_jobs_by_status(JobStatus::Completed).await.unwrap();
            if done.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        processor.stop().await;
        assert!(!processor.status().await.is_running);

        let data = store.get_job(data.id).await.unwrap().unwrap();
        assert_eq!(data.result.unwrap()["value"], json!(7.0));
        let generic = store.get_job(generic.id).await.unwrap().unwrap();
        assert_eq!(generic.result.unwrap()["handled_by"], "generic");
        let ai = store.get_job(ai.id).await.unwrap().unwrap();
        assert_eq!(ai.attempts, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ai_worker_error_status_is_retried() {
    timeout(TEST_TIMEOUT, async {
        let endpoint = start_failing_worker().await;
        let (store, queue, processor) = build(&endpoint).await;
        let job = queue
            .enqueue(json!({"type": "ai", "prompt": "score lead 7"}), "scorer")
            .await
            .unwrap();

        let report = processor.run_once().await.unwrap();
        assert_eq!(report.retried, 1);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        let error = job.last_error.unwrap();
        assert!(error.contains("Worker returned HTTP 500"), "{error}");
        assert!(error.contains("model overloaded"), "{error}");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn queued_message_job_completes_with_reply() {
    timeout(TEST_TIMEOUT, async {
        let transport = Arc::new(LocalTransport::new());
        transport.register("b", Arc::new(Echo)).await;
        let (store, queue, processor) =
            build_with_transport("http://127.0.0.1:9/process", transport).await;
        store.upsert_agent_state("b", json!({})).await.unwrap();

        let job = queue
            .enqueue(
                json!({"type": "message", "toAgent": "b", "message": "hello"}),
                "a",
            )
            .await
            .unwrap();

        let report = processor.run_once().await.unwrap();
        assert_eq!(report.completed, 1);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
        let result = job.result.unwrap();
        assert_eq!(result["to_agent"], "b");
        assert_eq!(result["response"]["echo"], "hello");
        assert_eq!(result["response"]["from"], "a");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn queued_notification_is_accepted_and_delivered() {
    timeout(TEST_TIMEOUT, async {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Arc::new(LocalTransport::new());
        transport.register("b", Arc::new(Recorder(tx))).await;
        let (store, queue, processor) =
            build_with_transport("http://127.0.0.1:9/process", transport).await;
        store.upsert_agent_state("b", json!({})).await.unwrap();

        let job = queue
            .enqueue(
                json!({"type": "message", "toAgent": "b", "message": {"lead": 42},
                       "requiresResponse": false}),
                "a",
            )
            .await
            .unwrap();

        processor.run_once().await.unwrap();

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.unwrap();
        assert_eq!(result["status"], "accepted");
        assert!(result.get("response").is_none());

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.to_agent, "b");
        assert_eq!(delivered.message, json!({"lead": 42}));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn message_to_unknown_agent_fails_without_retry() {
    timeout(TEST_TIMEOUT, async {
        let (store, queue, processor) = build("http://127.0.0.1:9/process").await;
        let job = queue
            .enqueue(
                json!({"type": "message", "toAgent": "ghost", "message": "hello"}),
                "a",
            )
            .await
            .unwrap();

        let report = processor.run_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("ghost"));
    })
    .await
    .expect("test timed out");
}
