//! libSQL backend: async `JobStore` + `AgentRegistry` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 text so lexical order matches chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobFilter, JobStatus, JobStatusUpdate};
use crate::store::migrations;
use crate::store::traits::{Agent, AgentRegistry, JobStore, transition_error};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: Vec<libsql::Value>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let rows = self
            .conn()
            .query(sql, libsql::params::Params::Positional(params))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        collect_rows(rows, op, row_to_job).await
    }
}

/// Drain a result set. Rows that fail to decode are skipped with a warning;
/// a failure to step the cursor aborts with `Query`.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    op: &str,
    decode: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match decode(&row) {
                Ok(item) => out.push(item),
                Err(e) => tracing::warn!(op, "Skipping row: {e}"),
            },
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
    Ok(out)
}

// ── Helper functions ────────────────────────────────────────────────

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_json(s: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

const JOB_COLUMNS: &str =
    "id, payload, target_agent, status, attempts, created_at, updated_at, processed_at, result, last_error";

const AGENT_COLUMNS: &str = "name, state, created_at, updated_at";

/// Map a libsql Row to a Job.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("job row: {e}"));

    let id_str: String = row.get(0).map_err(col)?;
    let payload_str: String = row.get(1).map_err(col)?;
    let status_str: String = row.get(3).map_err(col)?;
    let attempts: i64 = row.get(4).map_err(col)?;
    let created_str: String = row.get(5).map_err(col)?;
    let updated_str: String = row.get(6).map_err(col)?;
    let processed_str: Option<String> = row.get(7).ok();
    let result_str: Option<String> = row.get(8).ok();

    Ok(Job {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("bad job id {id_str:?}: {e}")))?,
        payload: parse_json(&payload_str)?,
        target_agent: row.get(2).map_err(col)?,
        status: status_str
            .parse::<JobStatus>()
            .map_err(DatabaseError::Serialization)?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
        processed_at: processed_str.as_deref().map(parse_datetime).transpose()?,
        result: result_str.as_deref().map(parse_json).transpose()?,
        last_error: row.get(9).ok(),
    })
}

fn row_to_agent(row: &libsql::Row) -> Result<Agent, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("agent row: {e}"));

    let state_str: String = row.get(1).map_err(col)?;
    let created_str: String = row.get(2).map_err(col)?;
    let updated_str: String = row.get(3).map_err(col)?;

    Ok(Agent {
        name: row.get(0).map_err(col)?,
        state: parse_json(&state_str)?,
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn insert_job(
        &self,
        payload: serde_json::Value,
        target_agent: &str,
    ) -> Result<Job, DatabaseError> {
        let job = Job::new(payload, target_agent);
        let payload_json = serde_json::to_string(&job.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO jobs (id, payload, target_agent, status, attempts, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    job.id.to_string(),
                    payload_json,
                    job.target_agent.clone(),
                    job.status.as_str(),
                    job.attempts as i64,
                    format_datetime(&job.created_at),
                    format_datetime(&job.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, agent = %job.target_agent, "Job inserted into DB");
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let jobs = self
            .query_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                vec![libsql::Value::Text(id.to_string())],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn get_pending_jobs(&self, agent: Option<&str>) -> Result<Vec<Job>, DatabaseError> {
        match agent {
            Some(agent) => {
                self.query_jobs(
                    "get_pending_jobs",
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' AND target_agent = ?1 ORDER BY created_at ASC, rowid ASC"
                    ),
                    vec![libsql::Value::Text(agent.to_string())],
                )
                .await
            }
            None => {
                self.query_jobs(
                    "get_pending_jobs",
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' ORDER BY created_at ASC, rowid ASC"
                    ),
                    Vec::new(),
                )
                .await
            }
        }
    }

    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let now = format_datetime(&Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'processing', attempts = attempts + 1, updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_job: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        self.get_job(id).await
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        update: JobStatusUpdate,
    ) -> Result<Job, DatabaseError> {
        let mut job = self.get_job(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "job".to_string(),
            id: id.to_string(),
        })?;
        let previous = job.status;
        if let Err(reason) = job.apply(&update) {
            return Err(transition_error(&job, &update, reason));
        }

        let result_json = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        // Guarded on the status we read so a concurrent writer cannot be overwritten.
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, attempts = ?2, updated_at = ?3, processed_at = ?4, result = ?5, last_error = ?6 WHERE id = ?7 AND status = ?8",
                params![
                    job.status.as_str(),
                    job.attempts as i64,
                    format_datetime(&job.updated_at),
                    opt_text_owned(job.processed_at.as_ref().map(format_datetime)),
                    opt_text_owned(result_json),
                    opt_text_owned(job.last_error.clone()),
                    id.to_string(),
                    previous.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job_status: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::Query(format!(
                "update_job_status: job {id} changed concurrently"
            )));
        }

        debug!(job_id = %id, status = %job.status, attempts = job.attempts, "Job status updated in DB");
        Ok(job)
    }

    async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            "get_jobs_by_status",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC"
            ),
            vec![libsql::Value::Text(status.as_str().to_string())],
        )
        .await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(status) = filter.status {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(agent) = &filter.agent {
            values.push(libsql::Value::Text(agent.clone()));
            clauses.push(format!("target_agent = ?{}", values.len()));
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        self.query_jobs("list_jobs", &sql, values).await
    }
}

#[async_trait]
impl AgentRegistry for LibSqlBackend {
    async fn get_agent(&self, name: &str) -> Result<Option<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_agent: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_agent(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_agent: {e}"))),
        }
    }

    async fn upsert_agent_state(
        &self,
        name: &str,
        state: serde_json::Value,
    ) -> Result<Agent, DatabaseError> {
        let now = format_datetime(&Utc::now());
        let state_str =
            serde_json::to_string(&state).map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO agents (name, state, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT (name) DO UPDATE SET state = ?2, updated_at = ?3",
                params![name, state_str, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_agent_state: {e}")))?;

        self.get_agent(name).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "agent".to_string(),
            id: name.to_string(),
        })
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY name ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_agents: {e}")))?;

        collect_rows(rows, "list_agents", row_to_agent).await
    }
}
