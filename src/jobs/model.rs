//! Job records and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for the next poll tick.
    Pending,
    /// Claimed by the processor; an attempt is in flight.
    Processing,
    /// Handler succeeded.
    Completed,
    /// Attempts exhausted.
    Failed,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    ///
    /// `Processing → Pending` is only taken as a retry decision.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Task kinds known to the handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Ai,
    DataProcessing,
    Message,
    /// Fallback for anything unrecognized.
    Generic,
}

/// Declared `type` values and the kind each resolves to.
const TASK_ALIASES: &[(&str, TaskKind)] = &[
    ("ai", TaskKind::Ai),
    ("ai_task", TaskKind::Ai),
    ("ai_inference", TaskKind::Ai),
    ("inference", TaskKind::Ai),
    ("data", TaskKind::DataProcessing),
    ("data_processing", TaskKind::DataProcessing),
    ("aggregate", TaskKind::DataProcessing),
    ("message", TaskKind::Message),
    ("agent_message", TaskKind::Message),
    ("inter_agent_message", TaskKind::Message),
    ("generic", TaskKind::Generic),
];

impl TaskKind {
    /// Resolve a declared task type. Unknown names map to `Generic`.
    pub fn from_type_name(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        TASK_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(_, kind)| *kind)
            .unwrap_or(TaskKind::Generic)
    }

    /// Resolve from a payload's `type` field.
    pub fn of_payload(payload: &serde_json::Value) -> Self {
        payload
            .get("type")
            .and_then(|v| v.as_str())
            .map(Self::from_type_name)
            .unwrap_or(TaskKind::Generic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::DataProcessing => "data_processing",
            Self::Message => "message",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work addressed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Task-specific fields. Never mutated after creation.
    pub payload: serde_json::Value,
    pub target_agent: String,
    pub status: JobStatus,
    /// Processing attempts so far; bumped when the job is claimed.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when a terminal status is reached.
    pub processed_at: Option<DateTime<Utc>>,
    /// Handler output of the successful attempt.
    pub result: Option<serde_json::Value>,
    /// Error text of the most recent failed attempt.
    pub last_error: Option<String>,
}

impl Job {
    /// Build a fresh pending job.
    pub fn new(payload: serde_json::Value, target_agent: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            target_agent: target_agent.into(),
            status: JobStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
            processed_at: None,
            result: None,
            last_error: None,
        }
    }

    pub fn task_kind(&self) -> TaskKind {
        TaskKind::of_payload(&self.payload)
    }

    /// Apply a status update, enforcing the state machine and attempt monotonicity.
    pub fn apply(&mut self, update: &JobStatusUpdate) -> Result<(), String> {
        if !self.status.can_transition_to(update.status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, update.status
            ));
        }
        if update.attempts < self.attempts {
            return Err(format!(
                "Attempts cannot decrease ({} -> {})",
                self.attempts, update.attempts
            ));
        }

        self.status = update.status;
        self.attempts = update.attempts;
        self.updated_at = Utc::now();
        if update.status.is_terminal() {
            self.processed_at = Some(update.processed_at.unwrap_or(self.updated_at));
        }
        if update.result.is_some() {
            self.result = update.result.clone();
        }
        if update.error.is_some() {
            self.last_error = update.error.clone();
        }
        Ok(())
    }
}

/// Status write issued by the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusUpdate {
    pub status: JobStatus,
    pub attempts: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl JobStatusUpdate {
    pub fn completed(attempts: u32, result: serde_json::Value) -> Self {
        Self {
            status: JobStatus::Completed,
            attempts,
            processed_at: Some(Utc::now()),
            result: Some(result),
            error: None,
        }
    }

    pub fn retry(attempts: u32, error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Pending,
            attempts,
            processed_at: None,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn failed(attempts: u32, error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            attempts,
            processed_at: Some(Utc::now()),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Listing filter for jobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub agent: Option<String>,
    pub limit: Option<usize>,
}
