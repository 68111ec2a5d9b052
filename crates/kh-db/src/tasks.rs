//! Tasks: keyspace sub-ranges assigned atomically to one agent (§3, §4.4).

use chrono::{DateTime, Utc};
use kh_ids::{AgentId, JobId, TaskId};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{DbError, Result};
use crate::pool::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Done,
    Failed,
    Abandoned,
}

impl TaskState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "pending" => Self::Pending,
            "assigned" => Self::Assigned,
            "running" => Self::Running,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "abandoned" => Self::Abandoned,
            other => return Err(DbError::invalid_input(format!("unknown task state: {other}"))),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct TaskRow {
    id: i64,
    job_execution_id: i64,
    keyspace_start: i64,
    keyspace_end: i64,
    assigned_agent_id: Option<i64>,
    state: String,
    attempts: i64,
    last_progress_at: Option<DateTime<Utc>>,
    keyspace_processed: i64,
    cracked_count_local: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub job_execution_id: JobId,
    pub keyspace_start: i64,
    pub keyspace_end: i64,
    pub assigned_agent_id: Option<AgentId>,
    pub state: TaskState,
    pub attempts: i64,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub keyspace_processed: i64,
    pub cracked_count_local: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Self {
            id: TaskId::new(row.id as u64),
            job_execution_id: JobId::new(row.job_execution_id as u64),
            keyspace_start: row.keyspace_start,
            keyspace_end: row.keyspace_end,
            assigned_agent_id: row.assigned_agent_id.map(|id| AgentId::new(id as u64)),
            state: TaskState::parse(&row.state)?,
            attempts: row.attempts,
            last_progress_at: row.last_progress_at,
            keyspace_processed: row.keyspace_processed,
            cracked_count_local: row.cracked_count_local,
            created_at: row.created_at,
        })
    }
}

/// Default attempt ceiling before a repeatedly-abandoned task fails for
/// good (§4.4: "After `max_attempts` (default 5)").
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

pub async fn create_batch(
    pool: &DbPool,
    job_execution_id: JobId,
    ranges: &[(i64, i64)],
    now: DateTime<Utc>,
) -> Result<Vec<TaskId>> {
    let mut tx = pool.begin().await?;
    let mut ids = Vec::with_capacity(ranges.len());

    for (start, end) in ranges {
        if start >= end {
            return Err(DbError::invalid_input(format!(
                "task range [{start}, {end}) is not half-open positive"
            )));
        }
        let result = sqlx::query(
            r#"INSERT INTO tasks (job_execution_id, keyspace_start, keyspace_end, state, created_at)
               VALUES (?, ?, ?, 'pending', ?)"#,
        )
        .bind(job_execution_id.as_u64() as i64)
        .bind(start)
        .bind(end)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        ids.push(TaskId::new(result.last_insert_rowid() as u64));
    }

    tx.commit().await?;
    Ok(ids)
}

pub async fn get(pool: &DbPool, id: TaskId) -> Result<Task> {
    let row: TaskRow = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
        .bind(id.as_u64() as i64)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found(format!("task {id}")))?;
    row.try_into()
}

/// Pending tasks of a job, in dispatch preference order: partially
/// progressed abandoned-and-reset tasks first (`keyspace_processed > 0`),
/// then by ascending id (§4.4: "Partially-progressed abandoned tasks ...
/// preferred over fresh ones").
pub async fn list_pending(pool: &DbPool) -> Result<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        r#"SELECT t.* FROM tasks t
           JOIN job_executions j ON j.id = t.job_execution_id
           WHERE t.state = 'pending' AND j.status IN ('queued', 'running')
           ORDER BY j.priority DESC, j.created_at ASC,
                    (t.keyspace_processed > 0) DESC, t.id ASC"#,
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Task::try_from).collect()
}

/// Atomically claim a pending task for `agent_id`. Returns
/// `DbError::Conflict` if another scheduler tick (or, in a future
/// multi-instance deployment, another scheduler) already claimed it —
/// the `WHERE state = 'pending'` guard is what makes this safe to call
/// without an external lock.
pub async fn assign(pool: &DbPool, task_id: TaskId, agent_id: AgentId) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'assigned', assigned_agent_id = ? WHERE id = ? AND state = 'pending'",
    )
    .bind(agent_id.as_u64() as i64)
    .bind(task_id.as_u64() as i64)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::conflict(format!("task {task_id} is no longer pending")));
    }
    Ok(())
}

/// `task_accepted`: assigned -> running.
pub async fn mark_running(pool: &DbPool, task_id: TaskId, agent_id: AgentId, now: DateTime<Utc>) -> Result<()> {
    let result = sqlx::query(
        r#"UPDATE tasks SET state = 'running', last_progress_at = ?
           WHERE id = ? AND assigned_agent_id = ? AND state = 'assigned'"#,
    )
    .bind(now)
    .bind(task_id.as_u64() as i64)
    .bind(agent_id.as_u64() as i64)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::conflict(format!(
            "task {task_id} not in assigned state for agent {agent_id}"
        )));
    }
    Ok(())
}

/// `task_progress{processed, ...}`. Idempotent: replays with a
/// non-increasing `processed` value are accepted without error (the
/// `GREATEST`-style clamp keeps the monotonic invariant).
pub async fn record_progress(
    pool: &DbPool,
    task_id: TaskId,
    agent_id: AgentId,
    processed: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        r#"UPDATE tasks SET
               keyspace_processed = MAX(keyspace_processed, ?),
               last_progress_at = ?
           WHERE id = ? AND assigned_agent_id = ? AND state IN ('assigned', 'running')"#,
    )
    .bind(processed)
    .bind(now)
    .bind(task_id.as_u64() as i64)
    .bind(agent_id.as_u64() as i64)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::conflict(format!(
            "task {task_id} not active for agent {agent_id}"
        )));
    }
    Ok(())
}

/// `task_completed`.
pub async fn mark_done(pool: &DbPool, task_id: TaskId, agent_id: AgentId) -> Result<()> {
    let result = sqlx::query(
        r#"UPDATE tasks SET state = 'done', keyspace_processed = keyspace_end - keyspace_start
           WHERE id = ? AND assigned_agent_id = ? AND state IN ('assigned', 'running')"#,
    )
    .bind(task_id.as_u64() as i64)
    .bind(agent_id.as_u64() as i64)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::conflict(format!(
            "task {task_id} not active for agent {agent_id}"
        )));
    }
    Ok(())
}

/// Returns the task to `pending`, increments `attempts`, and clears its
/// assignment; used for both abandon-on-timeout (§4.5) and retryable
/// `task_failed`. Caller decides, after incrementing, whether
/// `DEFAULT_MAX_ATTEMPTS` has been exceeded and the task should instead be
/// failed via `mark_failed`.
pub async fn abandon_and_requeue(pool: &DbPool, task_id: TaskId) -> Result<Task> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"UPDATE tasks SET state = 'abandoned', assigned_agent_id = NULL, attempts = attempts + 1
           WHERE id = ? AND state IN ('assigned', 'running')"#,
    )
    .bind(task_id.as_u64() as i64)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE tasks SET state = 'pending' WHERE id = ? AND state = 'abandoned'")
        .bind(task_id.as_u64() as i64)
        .execute(&mut *tx)
        .await?;

    let row: TaskRow = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
        .bind(task_id.as_u64() as i64)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    row.try_into()
}

/// `task_failed{fatal}` or attempts exhausted: terminal failure.
pub async fn mark_failed(pool: &DbPool, task_id: TaskId) -> Result<()> {
    sqlx::query("UPDATE tasks SET state = 'failed', assigned_agent_id = NULL WHERE id = ?")
        .bind(task_id.as_u64() as i64)
        .execute(pool)
        .await?;
    Ok(())
}

/// Tasks in `assigned`/`running` whose `last_progress_at` (or, absent
/// that, `created_at`) is older than `cutoff` — the abandon sweep of
/// §4.5, shared by the progress-timeout check and the startup-recovery
/// pass (the latter simply uses a cutoff of "now", since any such task
/// predates the just-started process by definition).
pub async fn list_overdue(pool: &DbPool, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        r#"SELECT * FROM tasks
           WHERE state IN ('assigned', 'running')
             AND COALESCE(last_progress_at, created_at) < ?"#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Task::try_from).collect()
}

/// Sibling tasks of `job_execution_id` still in flight, for cancellation
/// fan-out.
pub async fn list_in_flight_for_job(pool: &DbPool, job_execution_id: JobId) -> Result<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        "SELECT * FROM tasks WHERE job_execution_id = ? AND state IN ('assigned', 'running')",
    )
    .bind(job_execution_id.as_u64() as i64)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Task::try_from).collect()
}

/// In-flight tasks currently assigned to `agent_id` (disconnect/stale
/// sweep fan-out, §4.5).
pub async fn list_in_flight_for_agent(pool: &DbPool, agent_id: AgentId) -> Result<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        "SELECT * FROM tasks WHERE assigned_agent_id = ? AND state IN ('assigned', 'running')",
    )
    .bind(agent_id.as_u64() as i64)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Task::try_from).collect()
}

/// Whether a job has at least one task row planned yet (scheduler's
/// plan-on-first-tick admission, §4.4).
pub async fn job_has_tasks(pool: &DbPool, job_execution_id: JobId) -> Result<bool> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE job_execution_id = ?")
        .bind(job_execution_id.as_u64() as i64)
        .fetch_one(pool)
        .await?;
    Ok(row.0 > 0)
}

/// Every task of a job, for the `GET /api/jobs/{id}` task rollup (§6).
pub async fn list_for_job(pool: &DbPool, job_execution_id: JobId) -> Result<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        "SELECT * FROM tasks WHERE job_execution_id = ? ORDER BY id",
    )
    .bind(job_execution_id.as_u64() as i64)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Task::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents;
    use crate::jobs;
    use crate::pool::{create_pool, DbConfig};

    async fn seed(pool: &DbPool) -> (JobId, AgentId) {
        sqlx::query(
            "INSERT INTO claim_codes (code, continuous, created_at) VALUES ('c', 1, datetime('now'))",
        )
        .execute(pool)
        .await
        .unwrap();
        let agent_id = agents::insert(pool, "hash", "agent", 1, Utc::now()).await.unwrap();

        sqlx::query(
            "INSERT INTO hashlists (client_id, hash_type_id, raw_hash_count, status, created_at) VALUES (1, 0, 10, 'ready', datetime('now'))",
        )
        .execute(pool)
        .await
        .unwrap();

        let job_id = jobs::create(
            pool,
            kh_ids::HashlistId::new(1),
            &serde_json::json!({"mode": "straight"}),
            1_000_000,
            0,
            &["cpu".to_string()],
            None,
            Utc::now(),
        )
        .await
        .unwrap();

        (job_id, agent_id)
    }

    #[tokio::test]
    async fn only_one_concurrent_assign_succeeds() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let (job_id, agent_id) = seed(&pool).await;
        let ids = create_batch(&pool, job_id, &[(0, 1000)], Utc::now()).await.unwrap();
        let task_id = ids[0];

        assign(&pool, task_id, agent_id).await.unwrap();
        let second = assign(&pool, task_id, agent_id).await;
        assert!(matches!(second, Err(DbError::Conflict(_))));
    }

    #[tokio::test]
    async fn abandon_returns_task_to_pending_with_incremented_attempts() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let (job_id, agent_id) = seed(&pool).await;
        let ids = create_batch(&pool, job_id, &[(0, 1000)], Utc::now()).await.unwrap();
        let task_id = ids[0];

        assign(&pool, task_id, agent_id).await.unwrap();
        mark_running(&pool, task_id, agent_id, Utc::now()).await.unwrap();
        record_progress(&pool, task_id, agent_id, 400, Utc::now()).await.unwrap();

        let task = abandon_and_requeue(&pool, task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.keyspace_processed, 400);
        assert!(task.assigned_agent_id.is_none());
    }

    #[tokio::test]
    async fn job_completes_when_all_tasks_done() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let (job_id, agent_id) = seed(&pool).await;
        let ids = create_batch(&pool, job_id, &[(0, 500), (500, 1000)], Utc::now()).await.unwrap();

        for task_id in &ids {
            assign(&pool, *task_id, agent_id).await.unwrap();
            mark_running(&pool, *task_id, agent_id, Utc::now()).await.unwrap();
        }
        assert!(!jobs::all_tasks_done(&pool, job_id).await.unwrap());

        for task_id in &ids {
            mark_done(&pool, *task_id, agent_id).await.unwrap();
        }
        assert!(jobs::all_tasks_done(&pool, job_id).await.unwrap());
    }
}
