//! Claim-code enrollment vouchers (§3, §4.1).

use chrono::{DateTime, Utc};
use kh_ids::{AgentId, ClaimCodeId};
use sqlx::FromRow;

use crate::agents;
use crate::error::{DbError, Result};
use crate::pool::DbPool;

#[derive(Debug, Clone, FromRow)]
struct ClaimCodeRow {
    id: i64,
    code: String,
    creator: Option<String>,
    continuous: bool,
    active: bool,
    created_at: DateTime<Utc>,
    first_used_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ClaimCode {
    pub id: ClaimCodeId,
    pub code: String,
    pub creator: Option<String>,
    pub continuous: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub first_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl From<ClaimCodeRow> for ClaimCode {
    fn from(row: ClaimCodeRow) -> Self {
        Self {
            id: ClaimCodeId::new(row.id as u64),
            code: row.code,
            creator: row.creator,
            continuous: row.continuous,
            active: row.active,
            created_at: row.created_at,
            first_used_at: row.first_used_at,
            revoked_at: row.revoked_at,
        }
    }
}

pub async fn create(
    pool: &DbPool,
    code: &str,
    creator: Option<&str>,
    continuous: bool,
    now: DateTime<Utc>,
) -> Result<ClaimCodeId> {
    let result = sqlx::query(
        "INSERT INTO claim_codes (code, creator, continuous, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(code)
    .bind(creator)
    .bind(continuous)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(ClaimCodeId::new(result.last_insert_rowid() as u64))
}

/// Explicitly revoke a claim code (Open Question (a): continuous codes must
/// have an explicit revoke path rather than relying on a single-use flag).
pub async fn revoke(pool: &DbPool, id: ClaimCodeId, now: DateTime<Utc>) -> Result<()> {
    let result = sqlx::query(
        "UPDATE claim_codes SET active = 0, revoked_at = ? WHERE id = ? AND active = 1",
    )
    .bind(now)
    .bind(id.as_u64() as i64)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found(format!(
            "claim code {id} not found or already inactive"
        )));
    }
    Ok(())
}

/// The result of a successful redemption.
pub struct Redemption {
    pub agent_id: AgentId,
}

/// Atomically redeem a claim code and mint a new agent row.
///
/// Locks the code row via `BEGIN IMMEDIATE`, so concurrent redemptions of
/// the same non-continuous code serialize: the first `UPDATE` to flip
/// `first_used_at` wins, every other caller's conditional update affects
/// zero rows and the whole transaction returns `code_already_used`
/// (mapped to `DbError::Conflict`).
pub async fn redeem(
    pool: &DbPool,
    code: &str,
    api_key_hash: &str,
    display_name: &str,
    now: DateTime<Utc>,
) -> Result<Redemption> {
    let mut tx = pool.begin().await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *tx).await?;

    let row: Option<ClaimCodeRow> = sqlx::query_as(
        "SELECT * FROM claim_codes WHERE code = ? AND active = 1",
    )
    .bind(code)
    .fetch_optional(&mut *tx)
    .await?;

    let claim = row.ok_or_else(|| DbError::conflict("code_invalid_or_revoked"))?;

    if !claim.continuous {
        let updated = sqlx::query(
            "UPDATE claim_codes SET first_used_at = ?, active = 0 WHERE id = ? AND first_used_at IS NULL",
        )
        .bind(now)
        .bind(claim.id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DbError::conflict("code_already_used"));
        }
    } else if claim.first_used_at.is_none() {
        sqlx::query("UPDATE claim_codes SET first_used_at = ? WHERE id = ?")
            .bind(now)
            .bind(claim.id)
            .execute(&mut *tx)
            .await?;
    }

    let agent_id = agents::insert(&mut *tx, api_key_hash, display_name, claim.id, now).await?;

    tx.commit().await?;
    Ok(Redemption { agent_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    #[tokio::test]
    async fn single_use_code_redeems_once() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        create(&pool, "C2", None, false, Utc::now()).await.unwrap();

        let first = redeem(&pool, "C2", "h1", "agent-a", Utc::now()).await;
        assert!(first.is_ok());

        let second = redeem(&pool, "C2", "h2", "agent-b", Utc::now()).await;
        assert!(matches!(second, Err(DbError::Conflict(_))));
    }

    #[tokio::test]
    async fn continuous_code_redeems_many_times() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        create(&pool, "C1", None, true, Utc::now()).await.unwrap();

        let a = redeem(&pool, "C1", "h1", "agent-a", Utc::now()).await.unwrap();
        let b = redeem(&pool, "C1", "h2", "agent-b", Utc::now()).await.unwrap();
        assert_ne!(a.agent_id, b.agent_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_redemption_of_non_continuous_code_succeeds_exactly_once() {
        // A real on-disk database: `sqlite::memory:` hands each pooled
        // connection an independent database, which would make this test
        // meaningless with more than one connection.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        let pool = create_pool(
            DbConfig::sqlite(path.to_str().unwrap()).with_max_connections(8),
        )
        .await
        .unwrap();
        create(&pool, "C-race", None, false, Utc::now()).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    redeem(&pool, "C-race", &format!("h{i}"), &format!("agent-{i}"), Utc::now())
                        .await
                })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }
}
