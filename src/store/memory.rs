//! In-memory store for tests and embedded use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobFilter, JobStatus, JobStatusUpdate};
use crate::store::traits::{Agent, AgentRegistry, JobStore, transition_error};

/// `JobStore` + `AgentRegistry` backed by `RwLock`ed maps.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    agents: RwLock<HashMap<String, Agent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs (all statuses).
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

fn sorted_by_creation(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by_key(|j| j.created_at);
    jobs
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(
        &self,
        payload: serde_json::Value,
        target_agent: &str,
    ) -> Result<Job, DatabaseError> {
        let job = Job::new(payload, target_agent);
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn get_pending_jobs(&self, agent: Option<&str>) -> Result<Vec<Job>, DatabaseError> {
        let jobs = self.jobs.read().await;
        let pending = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .filter(|j| agent.is_none_or(|a| j.target_agent == a))
            .cloned()
            .collect();
        Ok(sorted_by_creation(pending))
    }

    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        update: JobStatusUpdate,
    ) -> Result<Job, DatabaseError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| DatabaseError::NotFound {
            entity: "job".to_string(),
            id: id.to_string(),
        })?;
        if let Err(reason) = job.apply(&update) {
            return Err(transition_error(job, &update, reason));
        }
        Ok(job.clone())
    }

    async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError> {
        let jobs = self.jobs.read().await;
        let matching = jobs.values().filter(|j| j.status == status).cloned().collect();
        Ok(sorted_by_creation(matching))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| {
                filter
                    .agent
                    .as_deref()
                    .is_none_or(|a| j.target_agent == a)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[async_trait]
impl AgentRegistry for InMemoryStore {
    async fn get_agent(&self, name: &str) -> Result<Option<Agent>, DatabaseError> {
        Ok(self.agents.read().await.get(name).cloned())
    }

    async fn upsert_agent_state(
        &self,
        name: &str,
        state: serde_json::Value,
    ) -> Result<Agent, DatabaseError> {
        let now = Utc::now();
        let mut agents = self.agents.write().await;
        let agent = agents
            .entry(name.to_string())
            .and_modify(|a| {
                a.state = state.clone();
                a.updated_at = now;
            })
            .or_insert_with(|| Agent {
                name: name.to_string(),
                state: state.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(agent.clone())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, DatabaseError> {
        let mut agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }
}
