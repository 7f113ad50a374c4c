//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{CredentialResult, CredentialSource, Job, JobStatus, ResultStatus};
use crate::schedule::Schedule;
use crate::store::migrations;
use crate::store::traits::JobStore;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(store.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(store.conn()).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const JOB_COLUMNS: &str = "id, credential_source, login_url, target_url, status, status_message, schedule, created_at, updated_at, last_scheduled_run";

const RESULT_COLUMNS: &str = "job_id, credential_identifier, status, artifact_reference, error_message, retry_attempts, final_error, created_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("job row parse: {e}")))
    };

    let id_str = get_text(0)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?;
    let credential_source: CredentialSource = serde_json::from_str(&get_text(1)?)
        .map_err(|e| DatabaseError::Serialization(format!("credential_source: {e}")))?;
    let status: JobStatus = get_text(4)?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let schedule: Option<Schedule> = match row.get::<String>(6).ok() {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| DatabaseError::Serialization(format!("schedule: {e}")))?,
        ),
        None => None,
    };

    Ok(Job {
        id,
        credential_source,
        login_url: get_text(2)?,
        target_url: get_text(3)?,
        status,
        status_message: row.get::<String>(5).ok(),
        schedule,
        created_at: parse_datetime(&get_text(7)?),
        updated_at: parse_datetime(&get_text(8)?),
        last_scheduled_run: row.get::<String>(9).ok().map(|s| parse_datetime(&s)),
    })
}

fn row_to_result(row: &libsql::Row) -> Result<CredentialResult, libsql::Error> {
    let job_id_str: String = row.get(0)?;
    let status_str: String = row.get(2)?;
    let attempts: i64 = row.get(5)?;
    let created_str: String = row.get(7)?;

    Ok(CredentialResult {
        job_id: Uuid::parse_str(&job_id_str).unwrap_or_default(),
        credential_identifier: row.get(1)?,
        status: ResultStatus::parse(&status_str),
        artifact_reference: row.get::<String>(3).ok(),
        error_message: row.get::<String>(4).ok(),
        retry_attempts: u32::try_from(attempts).unwrap_or(0),
        final_error: row.get::<String>(6).ok(),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlStore {
    async fn save_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let schedule = match &job.schedule {
            Some(schedule) => Some(to_json(schedule)?),
            None => None,
        };

        self.conn()
            .execute(
                "INSERT INTO jobs (id, credential_source, login_url, target_url, status, status_message, schedule, created_at, updated_at, last_scheduled_run)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (id) DO UPDATE SET
                    credential_source = ?2, login_url = ?3, target_url = ?4, status = ?5,
                    status_message = ?6, schedule = ?7, updated_at = ?9, last_scheduled_run = ?10",
                params![
                    job.id.to_string(),
                    to_json(&job.credential_source)?,
                    job.login_url.as_str(),
                    job.target_url.as_str(),
                    job.status.as_str(),
                    opt_text(job.status_message.as_deref()),
                    opt_text(schedule.as_deref()),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                    opt_text(job.last_scheduled_run.map(|t| t.to_rfc3339()).as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_job: {e}")))?;

        debug!(job_id = %job.id, status = %job.status, "Job saved");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn set_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, status_message = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), opt_text(message), now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_job_status: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job".to_string(),
                id: id.to_string(),
            });
        }

        debug!(job_id = %id, status = %status, "Job status updated in DB");
        Ok(())
    }

    async fn list_scheduled_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE schedule IS NOT NULL ORDER BY created_at"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_scheduled_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_scheduled_jobs: {e}")))?
        {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping unreadable scheduled job: {}", e),
            }
        }
        Ok(jobs)
    }

    async fn mark_scheduled_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET last_scheduled_run = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_scheduled_run: {e}")))?;
        Ok(())
    }

    async fn reset_interrupted_jobs(&self) -> Result<u64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'error', status_message = 'supervisor restarted', updated_at = ?1
                 WHERE status IN ('running', 'stopping')",
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_interrupted_jobs: {e}")))?;

        if count > 0 {
            info!(count, "Reset jobs interrupted by a previous run");
        }
        Ok(count)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        // PRAGMA foreign_keys is not enabled, so the cascade never fires.
        self.delete_results(id).await?;
        let deleted = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))?;

        if deleted > 0 {
            debug!(job_id = %id, "Job deleted");
        }
        Ok(deleted > 0)
    }

    async fn upsert_result(&self, result: &CredentialResult) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO results (job_id, credential_identifier, status, artifact_reference, error_message, retry_attempts, final_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (job_id, credential_identifier) DO UPDATE SET
                    status = ?3, artifact_reference = ?4, error_message = ?5,
                    retry_attempts = ?6, final_error = ?7",
                params![
                    result.job_id.to_string(),
                    result.credential_identifier.as_str(),
                    result.status.as_str(),
                    opt_text(result.artifact_reference.as_deref()),
                    opt_text(result.error_message.as_deref()),
                    i64::from(result.retry_attempts),
                    opt_text(result.final_error.as_deref()),
                    result.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_result: {e}")))?;

        debug!(
            job_id = %result.job_id,
            credential = %result.credential_identifier,
            status = result.status.as_str(),
            "Result upserted"
        );
        Ok(())
    }

    async fn list_results(&self, job_id: Uuid) -> Result<Vec<CredentialResult>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RESULT_COLUMNS} FROM results WHERE job_id = ?1 ORDER BY rowid"),
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_results: {e}")))?;

        let mut results = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_results: {e}")))?
        {
            let result = row_to_result(&row)
                .map_err(|e| DatabaseError::Query(format!("list_results row parse: {e}")))?;
            results.push(result);
        }
        Ok(results)
    }

    async fn delete_results(&self, job_id: Uuid) -> Result<u64, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM results WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_results: {e}")))?;

        debug!(job_id = %job_id, count = deleted, "Results deleted");
        Ok(deleted)
    }

    async fn delete_result(
        &self,
        job_id: Uuid,
        credential_identifier: &str,
    ) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM results WHERE job_id = ?1 AND credential_identifier = ?2",
                params![job_id.to_string(), credential_identifier],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_result: {e}")))?;
        Ok(deleted > 0)
    }
}
