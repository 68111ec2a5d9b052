//! Job executions: the attack run against a hashlist (§3).

use chrono::{DateTime, Utc};
use kh_ids::{HashlistId, JobId};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{DbError, Result};
use crate::pool::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => return Err(DbError::invalid_input(format!("unknown job status: {other}"))),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct JobRow {
    id: i64,
    hashlist_id: i64,
    attack_spec: String,
    keyspace_total: i64,
    priority: i64,
    required_device_kinds: String,
    status: String,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobExecution {
    pub id: JobId,
    pub hashlist_id: HashlistId,
    /// Raw JSON, per `kh-protocol`'s `AttackSpec` shape.
    pub attack_spec: serde_json::Value,
    /// Total keyspace `K` the planner must cover with task ranges (§4.3).
    /// Reported by the submitting client, which already knows it from
    /// having sized the attack locally.
    pub keyspace_total: u64,
    pub priority: i64,
    pub required_device_kinds: Vec<String>,
    pub status: JobStatus,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobExecution {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: JobId::new(row.id as u64),
            hashlist_id: HashlistId::new(row.hashlist_id as u64),
            attack_spec: serde_json::from_str(&row.attack_spec)?,
            keyspace_total: row.keyspace_total as u64,
            priority: row.priority,
            required_device_kinds: serde_json::from_str(&row.required_device_kinds)?,
            status: JobStatus::parse(&row.status)?,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

pub async fn create(
    pool: &DbPool,
    hashlist_id: HashlistId,
    attack_spec: &serde_json::Value,
    keyspace_total: u64,
    priority: i64,
    required_device_kinds: &[String],
    created_by: Option<&str>,
    now: DateTime<Utc>,
) -> Result<JobId> {
    let result = sqlx::query(
        r#"INSERT INTO job_executions
           (hashlist_id, attack_spec, keyspace_total, priority, required_device_kinds, status, created_by, created_at)
           VALUES (?, ?, ?, ?, ?, 'queued', ?, ?)"#,
    )
    .bind(hashlist_id.as_u64() as i64)
    .bind(serde_json::to_string(attack_spec)?)
    .bind(keyspace_total as i64)
    .bind(priority)
    .bind(serde_json::to_string(required_device_kinds)?)
    .bind(created_by)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(JobId::new(result.last_insert_rowid() as u64))
}

pub async fn get(pool: &DbPool, id: JobId) -> Result<JobExecution> {
    let row: JobRow = sqlx::query_as("SELECT * FROM job_executions WHERE id = ?")
        .bind(id.as_u64() as i64)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found(format!("job {id}")))?;
    row.try_into()
}

pub async fn set_status(pool: &DbPool, id: JobId, status: JobStatus) -> Result<()> {
    sqlx::query("UPDATE job_executions SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id.as_u64() as i64)
        .execute(pool)
        .await?;
    Ok(())
}

/// Jobs in `queued`/`running`, highest priority and earliest creation
/// first (scheduler pending-task ordering, §4.4, tier 1/2).
pub async fn list_admitted(pool: &DbPool) -> Result<Vec<JobExecution>> {
    let rows: Vec<JobRow> = sqlx::query_as(
        r#"SELECT * FROM job_executions
           WHERE status IN ('queued', 'running')
           ORDER BY priority DESC, created_at ASC, id ASC"#,
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(JobExecution::try_from).collect()
}

/// True iff every task belonging to `job_id` is `done` (job completion
/// check after a `task_completed` transition, §4.4).
pub async fn all_tasks_done(pool: &DbPool, job_id: JobId) -> Result<bool> {
    let row: (i64, i64) = sqlx::query_as(
        r#"SELECT COUNT(*), COALESCE(SUM(state = 'done'), 0)
           FROM tasks WHERE job_execution_id = ?"#,
    )
    .bind(job_id.as_u64() as i64)
    .fetch_one(pool)
    .await?;
    Ok(row.0 > 0 && row.0 == row.1)
}
