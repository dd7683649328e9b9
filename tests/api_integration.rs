//! Integration tests for the REST adapter.
//!
//! Each test spins up the Axum router on a random port and talks to it with
//! reqwest, so routing, extractors, and status codes are all exercised.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use agent_queue::agents::{AgentHandler, AgentMessage, LocalTransport, Messenger};
use agent_queue::api::{AppState, api_routes};
use agent_queue::config::{MessengerConfig, ProcessorConfig};
use agent_queue::error::MessengerError;
use agent_queue::jobs::{HandlerRegistry, JobProcessor, JobQueue};
use agent_queue::store::{AgentRegistry, InMemoryStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Echo;

#[async_trait]
impl AgentHandler for Echo {
    async fn handle(&self, message: &AgentMessage) -> Result<Value, MessengerError> {
        Ok(json!({"echo": message.message}))
    }
}

/// Start the API on a random port, return its base URL.
async fn start_server() -> String {
    let store = InMemoryStore::arc();
    let registry: Arc<dyn AgentRegistry> = store.clone();

    let transport = Arc::new(LocalTransport::new());
    transport.register("b", Arc::new(Echo)).await;
    let messenger = Arc::new(Messenger::new(
        Arc::clone(&registry),
        transport,
        MessengerConfig::default(),
    ));

    let handlers = Arc::new(HandlerRegistry::with_defaults(
        Arc::clone(&registry),
        Arc::clone(&messenger),
    ));
    let config = ProcessorConfig::default().with_poll_interval(Duration::from_millis(20));
    let processor = Arc::new(JobProcessor::new(store.clone(), handlers).with_config(config));

    let app = api_routes(AppState {
        queue: Arc::new(JobQueue::new(store)),
        processor,
        registry,
        messenger,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

#[tokio::test]
async fn health_check() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let body: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn job_lifecycle_over_http() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/jobs"))
            .json(&json!({"payload": {"type": "generic", "note": "x"}, "target_agent": "worker-a"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let job: Value = resp.json().await.unwrap();
        assert_eq!(job["status"], "pending");
        let id = job["id"].as_str().unwrap().to_string();

        let report: Value = client
            .post(format!("{base}/api/processor/tick"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(report["completed"], 1);

        let job: Value = client
            .get(format!("{base}/api/jobs/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(job["status"], "completed");
        assert_eq!(job["attempts"], 1);

        let listed: Vec<Value> = client
            .get(format!("{base}/api/jobs?status=completed&agent=worker-a"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        let pending: Vec<Value> = client
            .get(format!("{base}/api/jobs?status=pending"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(pending.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn job_errors_map_to_status_codes() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/jobs"))
            .json(&json!({"payload": {"type": "message"}, "target_agent": "worker-a"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .get(format!("{base}/api/jobs/{}", uuid::Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = client
            .get(format!("{base}/api/jobs/not-a-uuid"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn processor_start_stop_is_idempotent() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();

        for _ in 0..2 {
            let status: Value = client
                .post(format!("{base}/api/processor/start"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(status["is_running"], true);
            assert_eq!(status["config"]["poll_interval"], 20);
        }

        for _ in 0..2 {
            let status: Value = client
                .post(format!("{base}/api/processor/stop"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(status["is_running"], false);
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn agents_and_messages() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .put(format!("{base}/api/agents/b"))
            .json(&json!({"inbox": 0}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let agent: Value = client
            .get(format!("{base}/api/agents/b"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(agent["state"], json!({"inbox": 0}));

        let resp = client
            .post(format!("{base}/api/messages"))
            .json(&json!({"from_agent": "a", "to_agent": "b", "message": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "replied");
        assert_eq!(body["response"]["echo"], "hello");

        let resp = client
            .post(format!("{base}/api/messages"))
            .json(&json!({"from_agent": "a", "to_agent": "b", "message": "fyi", "requires_response": false}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = client
            .post(format!("{base}/api/messages"))
            .json(&json!({"from_agent": "a", "to_agent": "ghost", "message": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = client
            .get(format!("{base}/api/agents/ghost"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}
