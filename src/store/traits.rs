//! Storage traits: the persistence seams the engine depends on.
//!
//! `JobStore` owns job records and is the single source of truth for job
//! state. `AgentRegistry` tracks known agents and their state blobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobFilter, JobStatus, JobStatusUpdate};

/// A known agent and its opaque state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    /// Replaced wholesale on every upsert.
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable job storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Returns the stored record (status `pending`).
    async fn insert_job(
        &self,
        payload: serde_json::Value,
        target_agent: &str,
    ) -> Result<Job, DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Pending jobs in creation order, optionally for a single agent.
    async fn get_pending_jobs(&self, agent: Option<&str>) -> Result<Vec<Job>, DatabaseError>;

    /// Atomically move a job `pending → processing` and bump `attempts`.
    ///
    /// Returns `None` if the job was no longer pending (another claimer won).
    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Persist a status transition. Fails with `NotFound` for unknown IDs
    /// and `Query` when the transition is not allowed.
    async fn update_job_status(
        &self,
        id: Uuid,
        update: JobStatusUpdate,
    ) -> Result<Job, DatabaseError>;

    /// All jobs currently in a status, in creation order.
    async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError>;

    /// Filtered listing, most recent first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError>;
}

/// Known agents and their state blobs.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn get_agent(&self, name: &str) -> Result<Option<Agent>, DatabaseError>;

    /// Create the agent on first call, replace its state afterwards.
    async fn upsert_agent_state(
        &self,
        name: &str,
        state: serde_json::Value,
    ) -> Result<Agent, DatabaseError>;

    async fn list_agents(&self) -> Result<Vec<Agent>, DatabaseError>;
}

/// Map a rejected transition onto the store error used by both backends.
pub(crate) fn transition_error(job: &Job, update: &JobStatusUpdate, reason: String) -> DatabaseError {
    DatabaseError::Query(format!(
        "update_job_status {} ({} -> {}): {reason}",
        job.id, job.status, update.status
    ))
}
