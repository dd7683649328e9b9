//! Task handlers and the dispatch table that routes jobs to them.
//!
//! Each job's payload `type` resolves to a `TaskKind`; the registry maps
//! kinds to handlers. Kinds without an entry fall back to the generic
//! handler, so adding a task type is a `register` call, not a code edit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::agents::{AgentMessage, MessageOutcome, Messenger};
use crate::config::ProcessorConfig;
use crate::error::HandlerError;
use crate::jobs::model::{Job, TaskKind};
use crate::store::AgentRegistry;

/// Per-tick execution settings handed to every handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub worker_endpoint: String,
    pub ai_timeout: Duration,
}

impl From<&ProcessorConfig> for TaskContext {
    fn from(config: &ProcessorConfig) -> Self {
        Self {
            worker_endpoint: config.worker_endpoint.clone(),
            ai_timeout: config.ai_timeout,
        }
    }
}

/// Execution strategy for one task kind.
///
/// Handlers must not retry internally; the processor owns `attempts`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &TaskContext) -> Result<Value, HandlerError>;
}

/// Dispatch table from task kind to handler.
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Registry containing only the generic fallback.
    pub fn new() -> Self {
        let mut handlers: HashMap<TaskKind, Arc<dyn TaskHandler>> = HashMap::new();
        handlers.insert(TaskKind::Generic, Arc::new(GenericTaskHandler));
        Self { handlers }
    }

    /// Registry with all built-in handlers.
    pub fn with_defaults(registry: Arc<dyn AgentRegistry>, messenger: Arc<Messenger>) -> Self {
        let mut handlers = Self::new();
        handlers
            .register(TaskKind::Ai, Arc::new(AiTaskHandler::new()))
            .register(
                TaskKind::DataProcessing,
                Arc::new(DataProcessingHandler::new(registry)),
            )
            .register(TaskKind::Message, Arc::new(MessageTaskHandler::new(messenger)));
        handlers
    }

    /// Register (or replace) the handler for a kind.
    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> &mut Self {
        debug!(kind = %kind, "Registered task handler");
        self.handlers.insert(kind, handler);
        self
    }

    /// Handler for a kind, falling back to the generic entry.
    pub fn resolve(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(&kind)
            .or_else(|| self.handlers.get(&TaskKind::Generic))
            .cloned()
    }

    /// Route a job to its handler and run it.
    pub async fn dispatch(&self, job: &Job, ctx: &TaskContext) -> Result<Value, HandlerError> {
        let kind = job.task_kind();
        let handler = self.resolve(kind).ok_or_else(|| HandlerError::Execution {
            kind: kind.to_string(),
            reason: "no handler registered".to_string(),
        })?;
        handler.handle(job, ctx).await
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── AI task ─────────────────────────────────────────────────────────────

/// Forwards the payload to the external AI worker over HTTP.
pub struct AiTaskHandler {
    client: reqwest::Client,
}

impl AiTaskHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for AiTaskHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for AiTaskHandler {
    async fn handle(&self, job: &Job, ctx: &TaskContext) -> Result<Value, HandlerError> {
        let kind = TaskKind::Ai.to_string();
        let body = json!({
            "job_id": job.id,
            "target_agent": job.target_agent,
            "payload": job.payload,
        });

        let call = async {
            let resp = self
                .client
                .post(&ctx.worker_endpoint)
                .json(&body)
                .send()
                .await
                .map_err(|e| HandlerError::Execution {
                    kind: kind.clone(),
                    reason: e.to_string(),
                })?;
            let status = resp.status();
            let text = resp.text().await.map_err(|e| HandlerError::Execution {
                kind: kind.clone(),
                reason: e.to_string(),
            })?;
            if !status.is_success() {
                return Err(HandlerError::Http {
                    status: status.as_u16(),
                    body: text,
                });
            }
            serde_json::from_str::<Value>(&text).map_err(|e| HandlerError::Execution {
                kind: kind.clone(),
                reason: format!("worker returned invalid JSON: {e}"),
            })
        };

        let outcome = tokio::time::timeout(ctx.ai_timeout, call).await;
        outcome.unwrap_or_else(|_| {
            Err(HandlerError::Timeout {
                kind: TaskKind::Ai.to_string(),
                timeout: ctx.ai_timeout,
            })
        })
    }
}

// ── Data processing ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DataTask {
    operation: String,
    field: Option<String>,
    records: Option<Vec<Value>>,
    source: Option<DataSource>,
    #[serde(default)]
    filter: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct DataSource {
    agent: String,
    path: Option<String>,
}

/// Deterministic aggregation over inline records or an agent's stored state.
pub struct DataProcessingHandler {
    registry: Arc<dyn AgentRegistry>,
}

impl DataProcessingHandler {
    pub fn new(registry: Arc<dyn AgentRegistry>) -> Self {
        Self { registry }
    }

    async fn load_records(&self, task: &DataTask) -> Result<Vec<Value>, HandlerError> {
        if let Some(records) = &task.records {
            return Ok(records.clone());
        }
        let source = task.source.as_ref().ok_or_else(|| invalid_data("either records or source is required"))?;

        let agent = self
            .registry
            .get_agent(&source.agent)
            .await?
            .ok_or_else(|| invalid_data(format!("source agent {} not found", source.agent)))?;

        let value = match source.path.as_deref() {
            Some(path) => lookup_path(&agent.state, path)
                .ok_or_else(|| invalid_data(format!("path {path:?} not found in agent state")))?,
            None => &agent.state,
        };
        value
            .as_array()
            .cloned()
            .ok_or_else(|| invalid_data("source data is not an array"))
    }
}

fn invalid_data(reason: impl Into<String>) -> HandlerError {
    HandlerError::InvalidPayload {
        kind: TaskKind::DataProcessing.to_string(),
        reason: reason.into(),
    }
}

/// Follow a dot path through objects and array indices.
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(value, |current, seg| match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Group key for `group_count`; strings are used verbatim.
fn group_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Run an aggregation. Pure function of the records.
fn aggregate(operation: &str, field: Option<&str>, records: &[Value]) -> Result<Value, HandlerError> {
    if operation == "count" {
        return Ok(json!(records.len()));
    }

    let field = field.ok_or_else(|| invalid_data(format!("operation {operation} requires field")))?;
    let values: Vec<&Value> = records.iter().filter_map(|r| lookup_path(r, field)).collect();
    let numbers = || values.iter().filter_map(|v| v.as_f64());

    let result = match operation {
        "sum" => json!(numbers().sum::<f64>()),
        "avg" => {
            let (total, n) = numbers().fold((0.0, 0usize), |(t, n), x| (t + x, n + 1));
            if n == 0 { Value::Null } else { json!(total / n as f64) }
        }
        "min" => numbers().reduce(f64::min).map_or(Value::Null, |x| json!(x)),
        "max" => numbers().reduce(f64::max).map_or(Value::Null, |x| json!(x)),
        "distinct" => {
            let mut seen: Vec<Value> = Vec::new();
            for v in &values {
                if !seen.contains(v) {
                    seen.push((*v).clone());
                }
            }
            Value::Array(seen)
        }
        "group_count" => {
            let mut groups: BTreeMap<String, u64> = BTreeMap::new();
            for v in &values {
                *groups.entry(group_key(v)).or_default() += 1;
            }
            json!(groups)
        }
        other => return Err(invalid_data(format!("unknown operation {other:?}"))),
    };
    Ok(result)
}

#[async_trait]
impl TaskHandler for DataProcessingHandler {
    async fn handle(&self, job: &Job, _ctx: &TaskContext) -> Result<Value, HandlerError> {
        let task: DataTask =
            serde_json::from_value(job.payload.clone()).map_err(|e| invalid_data(e.to_string()))?;

        let records: Vec<Value> = self
            .load_records(&task)
            .await?
            .into_iter()
            .filter(|r| {
                task.filter
                    .iter()
                    .all(|(k, expected)| lookup_path(r, k) == Some(expected))
            })
            .collect();

        let value = aggregate(&task.operation, task.field.as_deref(), &records)?;
        Ok(json!({
            "operation": task.operation,
            "field": task.field,
            "input_count": records.len(),
            "value": value,
        }))
    }
}

// ── Inter-agent message ─────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct MessageTask {
    #[serde(alias = "fromAgent")]
    from_agent: Option<String>,
    #[serde(alias = "toAgent")]
    to_agent: String,
    message: Value,
    #[serde(alias = "messageType")]
    message_type: Option<String>,
    #[serde(alias = "requiresResponse", default = "default_true")]
    requires_response: bool,
}

/// Unwraps a message envelope from the payload and sends it via the messenger.
pub struct MessageTaskHandler {
    messenger: Arc<Messenger>,
}

impl MessageTaskHandler {
    pub fn new(messenger: Arc<Messenger>) -> Self {
        Self { messenger }
    }
}

#[async_trait]
impl TaskHandler for MessageTaskHandler {
    async fn handle(&self, job: &Job, _ctx: &TaskContext) -> Result<Value, HandlerError> {
        let task: MessageTask =
            serde_json::from_value(job.payload.clone()).map_err(|e| HandlerError::InvalidPayload {
                kind: TaskKind::Message.to_string(),
                reason: e.to_string(),
            })?;

        let from = task.from_agent.unwrap_or_else(|| job.target_agent.clone());
        let mut message = AgentMessage::new(from, task.to_agent.clone(), task.message);
        if let Some(message_type) = task.message_type {
            message = message.with_type(message_type);
        }

        match self.messenger.send(message, task.requires_response).await? {
            MessageOutcome::Replied { response } => Ok(json!({
                "to_agent": task.to_agent,
                "response": response,
            })),
            MessageOutcome::Accepted => Ok(json!({
                "to_agent": task.to_agent,
                "status": "accepted",
            })),
        }
    }
}

// ── Generic ─────────────────────────────────────────────────────────────

/// Fallback for unrecognized payloads. Never fails.
pub struct GenericTaskHandler;

#[async_trait]
impl TaskHandler for GenericTaskHandler {
    async fn handle(&self, job: &Job, _ctx: &TaskContext) -> Result<Value, HandlerError> {
        let fields: Vec<&str> = job
            .payload
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        let declared = job.payload.get("type").and_then(|v| v.as_str());

        info!(
            job_id = %job.id,
            agent = %job.target_agent,
            declared_type = declared.unwrap_or("<none>"),
            fields = ?fields,
            "Generic handler accepted job"
        );

        Ok(json!({
            "status": "partial",
            "handled_by": "generic",
            "declared_type": declared,
            "fields": fields,
        }))
    }
}
