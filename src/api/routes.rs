//! REST routes over the queue, processor, agent registry, and messenger.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{AgentMessage, MessageOutcome, Messenger, validate_agent_name};
use crate::error::{DatabaseError, JobError, MessengerError};
use crate::jobs::{JobFilter, JobProcessor, JobQueue};
use crate::store::AgentRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub processor: Arc<JobProcessor>,
    pub registry: Arc<dyn AgentRegistry>,
    pub messenger: Arc<Messenger>,
}

/// Build the Axum router.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/processor", get(processor_status))
        .route("/api/processor/start", post(start_processor))
        .route("/api/processor/stop", post(stop_processor))
        .route("/api/processor/tick", post(run_tick))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{name}", get(get_agent).put(put_agent))
        .route("/api/messages", post(send_message))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({"error": message.to_string()}))).into_response()
}

fn store_error(e: DatabaseError) -> Response {
    warn!(error = %e, "Store error while serving request");
    error(StatusCode::SERVICE_UNAVAILABLE, e)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "agent-queue"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateJobRequest {
    payload: serde_json::Value,
    target_agent: String,
}

async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<CreateJobRequest>,
) -> Response {
    match state.queue.enqueue(body.payload, &body.target_agent).await {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e @ JobError::Validation { .. }) => error(StatusCode::BAD_REQUEST, e),
        Err(JobError::Database(e)) => store_error(e),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error(StatusCode::BAD_REQUEST, "Invalid job ID");
    };
    match state.queue.get(id).await {
        Ok(job) => Json(job).into_response(),
        Err(e @ JobError::NotFound { .. }) => error(StatusCode::NOT_FOUND, e),
        Err(JobError::Database(e)) => store_error(e),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn list_jobs(State(state): State<AppState>, Query(filter): Query<JobFilter>) -> Response {
    match state.queue.list(&filter).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(JobError::Database(e)) => store_error(e),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ── Processor ───────────────────────────────────────────────────────────

async fn processor_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.processor.status().await)
}

async fn start_processor(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.processor.status().await.config;
    state.processor.start(config).await;
    Json(state.processor.status().await)
}

async fn stop_processor(State(state): State<AppState>) -> impl IntoResponse {
    state.processor.stop().await;
    Json(state.processor.status().await)
}

async fn run_tick(State(state): State<AppState>) -> Response {
    match state.processor.run_once().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Agents ──────────────────────────────────────────────────────────────

async fn list_agents(State(state): State<AppState>) -> Response {
    match state.registry.list_agents().await {
        Ok(agents) => Json(agents).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_agent(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.registry.get_agent(&name).await {
        Ok(Some(agent)) => Json(agent).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, format!("Agent {name} not found")),
        Err(e) => store_error(e),
    }
}

async fn put_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if let Err(e) = validate_agent_name(&name) {
        return error(StatusCode::BAD_REQUEST, e);
    }
    match state.registry.upsert_agent_state(&name, body).await {
        Ok(agent) => {
            info!(agent = %agent.name, "Agent state replaced");
            Json(agent).into_response()
        }
        Err(e) => store_error(e),
    }
}

// ── Messages ────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct SendMessageRequest {
    from_agent: String,
    to_agent: String,
    message: serde_json::Value,
    message_type: Option<String>,
    #[serde(default = "default_true")]
    requires_response: bool,
}

async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageRequest>,
) -> Response {
    let mut message = AgentMessage::new(body.from_agent, body.to_agent, body.message);
    if let Some(message_type) = body.message_type {
        message = message.with_type(message_type);
    }

    match state.messenger.send(message, body.requires_response).await {
        Ok(outcome @ MessageOutcome::Replied { .. }) => Json(outcome).into_response(),
        Ok(outcome @ MessageOutcome::Accepted) => {
            (StatusCode::ACCEPTED, Json(outcome)).into_response()
        }
        Err(e @ MessengerError::AgentNotFound { .. }) => error(StatusCode::NOT_FOUND, e),
        Err(e @ MessengerError::MessageTimeout { .. }) => error(StatusCode::GATEWAY_TIMEOUT, e),
        Err(e @ MessengerError::DeliveryFailed { .. }) => error(StatusCode::BAD_GATEWAY, e),
        Err(MessengerError::Database(e)) => store_error(e),
    }
}
