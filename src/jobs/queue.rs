//! Producer side of the queue: validated enqueue and read access.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::agents::validate_agent_name;
use crate::error::JobError;
use crate::jobs::model::{Job, JobFilter, TaskKind};
use crate::store::JobStore;

pub struct JobQueue {
    store: Arc<dyn JobStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Validate and store a new pending job. Invalid jobs are never stored.
    pub async fn enqueue(&self, payload: Value, target_agent: &str) -> Result<Job, JobError> {
        validate_agent_name(target_agent).map_err(JobError::validation)?;
        let kind = validate_payload(&payload)?;

        let job = self.store.insert_job(payload, target_agent).await?;
        info!(job_id = %job.id, agent = %job.target_agent, kind = %kind, "Job enqueued");
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, JobError> {
        self.store
            .get_job(id)
            .await?
            .ok_or(JobError::NotFound { id })
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        Ok(self.store.list_jobs(filter).await?)
    }
}

/// Structural checks per task kind. Returns the resolved kind.
fn validate_payload(payload: &Value) -> Result<TaskKind, JobError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| JobError::validation("payload must be a JSON object"))?;

    if let Some(ty) = obj.get("type")
        && !ty.is_string()
    {
        return Err(JobError::validation("payload type must be a string"));
    }

    let kind = TaskKind::of_payload(payload);
    match kind {
        TaskKind::Message => {
            let to = obj
                .get("toAgent")
                .or_else(|| obj.get("to_agent"))
                .and_then(Value::as_str)
                .ok_or_else(|| JobError::validation("message task requires toAgent"))?;
            validate_agent_name(to).map_err(JobError::validation)?;
            if !obj.contains_key("message") {
                return Err(JobError::validation("message task requires message"));
            }
        }
        TaskKind::DataProcessing => {
            if !obj.get("operation").is_some_and(Value::is_string) {
                return Err(JobError::validation("data task requires operation"));
            }
            let has_records = obj.get("records").is_some_and(Value::is_array);
            let has_source = obj.get("source").is_some_and(Value::is_object);
            if !has_records && !has_source {
                return Err(JobError::validation(
                    "data task requires records or source",
                ));
            }
        }
        TaskKind::Ai | TaskKind::Generic => {}
    }
    Ok(kind)
}
