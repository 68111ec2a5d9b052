//! Agent registry: state, heartbeat, credential hash.

use chrono::{DateTime, Utc};
use kh_ids::AgentId;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{DbError, Result};
use crate::pool::DbPool;

/// Agent lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Pending,
    Active,
    Busy,
    Error,
    Disconnected,
}

impl AgentState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "pending" => Self::Pending,
            "active" => Self::Active,
            "busy" => Self::Busy,
            "error" => Self::Error,
            "disconnected" => Self::Disconnected,
            other => {
                return Err(DbError::invalid_input(format!("unknown agent state: {other}")))
            }
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct AgentRow {
    id: i64,
    api_key_hash: String,
    display_name: String,
    owner: Option<String>,
    agent_version: Option<String>,
    state: String,
    last_heartbeat: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

/// An agent as stored in the registry.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: AgentId,
    pub api_key_hash: String,
    pub display_name: String,
    pub owner: Option<String>,
    pub agent_version: Option<String>,
    pub state: AgentState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = DbError;

    fn try_from(row: AgentRow) -> Result<Self> {
        Ok(Self {
            id: AgentId::new(row.id as u64),
            api_key_hash: row.api_key_hash,
            display_name: row.display_name,
            owner: row.owner,
            agent_version: row.agent_version,
            state: AgentState::parse(&row.state)?,
            last_heartbeat: row.last_heartbeat,
            created_at: row.created_at,
        })
    }
}

/// Insert a newly-enrolled agent. Called inside the claim-code redemption
/// transaction (see `crate::claim_codes::redeem`).
pub async fn insert(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    api_key_hash: &str,
    display_name: &str,
    claim_code_id: i64,
    now: DateTime<Utc>,
) -> Result<AgentId> {
    let result = sqlx::query(
        r#"INSERT INTO agents (api_key_hash, display_name, state, claim_code_id, created_at)
           VALUES (?, ?, 'pending', ?, ?)"#,
    )
    .bind(api_key_hash)
    .bind(display_name)
    .bind(claim_code_id)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(AgentId::new(result.last_insert_rowid() as u64))
}

pub async fn get(pool: &DbPool, agent_id: AgentId) -> Result<Agent> {
    let row: AgentRow = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
        .bind(agent_id.as_u64() as i64)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found(format!("agent {agent_id}")))?;
    row.try_into()
}

pub async fn list_active(pool: &DbPool) -> Result<Vec<Agent>> {
    let rows: Vec<AgentRow> =
        sqlx::query_as("SELECT * FROM agents WHERE state != 'pending' ORDER BY id")
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(Agent::try_from).collect()
}

/// Advance `last_heartbeat` and flip the agent into `active` unless it is
/// currently `busy` (busy agents stay busy across a heartbeat).
pub async fn record_heartbeat(pool: &DbPool, agent_id: AgentId, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"UPDATE agents
           SET last_heartbeat = ?,
               state = CASE WHEN state = 'busy' THEN 'busy' ELSE 'active' END
           WHERE id = ?"#,
    )
    .bind(now)
    .bind(agent_id.as_u64() as i64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_state(pool: &DbPool, agent_id: AgentId, state: AgentState) -> Result<()> {
    sqlx::query("UPDATE agents SET state = ? WHERE id = ?")
        .bind(state.as_str())
        .bind(agent_id.as_u64() as i64)
        .execute(pool)
        .await?;
    Ok(())
}

/// Agents whose `last_heartbeat` is older than `cutoff` and are not already
/// `disconnected` (heartbeat sweep, §4.1).
pub async fn list_stale(pool: &DbPool, cutoff: DateTime<Utc>) -> Result<Vec<Agent>> {
    let rows: Vec<AgentRow> = sqlx::query_as(
        r#"SELECT * FROM agents
           WHERE state != 'disconnected'
             AND (last_heartbeat IS NULL OR last_heartbeat < ?)"#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Agent::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    #[tokio::test]
    async fn heartbeat_does_not_clear_busy_state() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        sqlx::query(
            "INSERT INTO claim_codes (code, continuous, created_at) VALUES ('c1', 1, datetime('now'))",
        )
        .execute(&pool)
        .await
        .unwrap();

        let id = insert(&pool, "hash", "agent-1", 1, Utc::now()).await.unwrap();
        set_state(&pool, id, AgentState::Busy).await.unwrap();
        record_heartbeat(&pool, id, Utc::now()).await.unwrap();

        let agent = get(&pool, id).await.unwrap();
        assert_eq!(agent.state, AgentState::Busy);
    }

    #[tokio::test]
    async fn stale_sweep_finds_agents_past_cutoff() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        sqlx::query(
            "INSERT INTO claim_codes (code, continuous, created_at) VALUES ('c1', 1, datetime('now'))",
        )
        .execute(&pool)
        .await
        .unwrap();
        let id = insert(&pool, "hash", "agent-1", 1, Utc::now()).await.unwrap();
        set_state(&pool, id, AgentState::Active).await.unwrap();
        record_heartbeat(&pool, id, Utc::now() - chrono::Duration::seconds(30)).await.unwrap();

        let stale = list_stale(&pool, Utc::now() - chrono::Duration::seconds(15))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, id);
    }
}
