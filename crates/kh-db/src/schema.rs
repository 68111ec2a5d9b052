//! Schema migration for all KrakenHashes tables.
//!
//! Single source of truth for `CREATE TABLE` statements, applied
//! idempotently (`IF NOT EXISTS`) on every pool open.

use tracing::info;

use crate::error::Result;
use crate::pool::DbPool;

pub(crate) async fn ensure_schema(pool: &DbPool) -> Result<()> {
    create_agent_tables(pool).await?;
    create_hashlist_tables(pool).await?;
    create_job_tables(pool).await?;
    create_artifact_table(pool).await?;

    info!("database schema verified");
    Ok(())
}

async fn create_agent_tables(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS claim_codes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            creator TEXT,
            continuous INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            first_used_at TEXT,
            revoked_at TEXT
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS agents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            api_key_hash TEXT NOT NULL,
            display_name TEXT NOT NULL,
            owner TEXT,
            agent_version TEXT,
            state TEXT NOT NULL DEFAULT 'pending',
            last_heartbeat TEXT,
            claim_code_id INTEGER REFERENCES claim_codes(id),
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS devices (
            agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
            device_index INTEGER NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (agent_id, device_index)
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_agents_state ON agents(state)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_hashlist_tables(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS hashlists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            client_id INTEGER NOT NULL,
            hash_type_id INTEGER NOT NULL,
            raw_hash_count INTEGER NOT NULL,
            cracked_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'uploading',
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS hashes (
            hashlist_id INTEGER NOT NULL REFERENCES hashlists(id) ON DELETE CASCADE,
            idx INTEGER NOT NULL,
            raw TEXT NOT NULL,
            username TEXT,
            cracked_plaintext TEXT,
            cracked_at TEXT,
            PRIMARY KEY (hashlist_id, idx)
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_hashes_uncracked ON hashes(hashlist_id) WHERE cracked_plaintext IS NULL")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_job_tables(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS job_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hashlist_id INTEGER NOT NULL REFERENCES hashlists(id),
            attack_spec TEXT NOT NULL,
            keyspace_total INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            required_device_kinds TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            created_by TEXT,
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_execution_id INTEGER NOT NULL REFERENCES job_executions(id),
            keyspace_start INTEGER NOT NULL,
            keyspace_end INTEGER NOT NULL,
            assigned_agent_id INTEGER REFERENCES agents(id),
            state TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_progress_at TEXT,
            keyspace_processed INTEGER NOT NULL DEFAULT 0,
            cracked_count_local INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            CHECK (keyspace_start < keyspace_end)
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_execution_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_assigned_agent ON tasks(assigned_agent_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_artifact_table(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS artifacts (
            digest TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            size INTEGER NOT NULL,
            kind TEXT NOT NULL,
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
