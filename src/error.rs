//! Error types for the agent queue.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Messenger error: {0}")]
    Messenger(#[from] MessengerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors.
///
/// Every variant is treated as "store unavailable" by the poll loop: the tick
/// is abandoned and no job attempt is consumed.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job: {reason}")]
    Validation { reason: String },

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl JobError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

/// Failure of a single task handler execution. Always feeds the retry path.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Task {kind} failed: {reason}")]
    Execution { kind: String, reason: String },

    #[error("Task {kind} timed out after {timeout:?}")]
    Timeout { kind: String, timeout: Duration },

    #[error("Worker returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Messenger error: {0}")]
    Messenger(#[from] MessengerError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl HandlerError {
    /// Whether another attempt could succeed. Bad payloads and unknown
    /// target agents fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidPayload { .. } | Self::Messenger(MessengerError::AgentNotFound { .. })
        )
    }
}

/// Inter-agent messaging errors. Surfaced to the caller, never retried here.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("Agent {name} not found")]
    AgentNotFound { name: String },

    #[error("Message to {to} timed out after {timeout:?}")]
    MessageTimeout { to: String, timeout: Duration },

    #[error("Delivery to {to} failed: {reason}")]
    DeliveryFailed { to: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
