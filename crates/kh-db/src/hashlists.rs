//! Hashlists and their constituent hashes (§3).

use chrono::{DateTime, Utc};
use kh_ids::HashlistId;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{DbError, Result};
use crate::pool::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashlistStatus {
    Uploading,
    Ready,
    Running,
    Paused,
    Completed,
    Error,
}

impl HashlistStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "uploading" => Self::Uploading,
            "ready" => Self::Ready,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "error" => Self::Error,
            other => {
                return Err(DbError::invalid_input(format!("unknown hashlist status: {other}")))
            }
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct HashlistRow {
    id: i64,
    client_id: i64,
    hash_type_id: i64,
    raw_hash_count: i64,
    cracked_count: i64,
    status: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Hashlist {
    pub id: HashlistId,
    pub client_id: i64,
    pub hash_type_id: i64,
    pub raw_hash_count: i64,
    pub cracked_count: i64,
    pub status: HashlistStatus,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<HashlistRow> for Hashlist {
    type Error = DbError;

    fn try_from(row: HashlistRow) -> Result<Self> {
        Ok(Self {
            id: HashlistId::new(row.id as u64),
            client_id: row.client_id,
            hash_type_id: row.hash_type_id,
            raw_hash_count: row.raw_hash_count,
            cracked_count: row.cracked_count,
            status: HashlistStatus::parse(&row.status)?,
            created_at: row.created_at,
        })
    }
}

pub async fn create(
    pool: &DbPool,
    client_id: i64,
    hash_type_id: i64,
    raw_hashes: &[(i64, String, Option<String>)],
    now: DateTime<Utc>,
) -> Result<HashlistId> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"INSERT INTO hashlists (client_id, hash_type_id, raw_hash_count, status, created_at)
           VALUES (?, ?, ?, 'uploading', ?)"#,
    )
    .bind(client_id)
    .bind(hash_type_id)
    .bind(raw_hashes.len() as i64)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    let hashlist_id = result.last_insert_rowid();

    for (idx, raw, username) in raw_hashes {
        sqlx::query("INSERT INTO hashes (hashlist_id, idx, raw, username) VALUES (?, ?, ?, ?)")
            .bind(hashlist_id)
            .bind(idx)
            .bind(raw)
            .bind(username)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("UPDATE hashlists SET status = 'ready' WHERE id = ?")
        .bind(hashlist_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(HashlistId::new(hashlist_id as u64))
}

/// Raw hash text + plaintext for every already-cracked entry among
/// `indices` (potfile append, §4.4/§9: "cracks are also appended to the
/// server potfile").
pub async fn cracked_pairs(
    pool: &DbPool,
    hashlist_id: HashlistId,
    indices: &[i64],
) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::with_capacity(indices.len());
    for index in indices {
        let row: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT raw, cracked_plaintext FROM hashes WHERE hashlist_id = ? AND idx = ?",
        )
        .bind(hashlist_id.as_u64() as i64)
        .bind(index)
        .fetch_optional(pool)
        .await?;

        if let Some((raw, Some(plaintext))) = row {
            pairs.push((raw, plaintext));
        }
    }
    Ok(pairs)
}

/// Every raw hash text cracked under a hashlist owned by `client_id`
/// (potfile scrub, §9 Open Question (b)).
pub async fn cracked_raw_hashes_for_client(pool: &DbPool, client_id: i64) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"SELECT h.raw FROM hashes h
           JOIN hashlists l ON l.id = h.hashlist_id
           WHERE l.client_id = ? AND h.cracked_plaintext IS NOT NULL"#,
    )
    .bind(client_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(raw,)| raw).collect())
}

pub async fn get(pool: &DbPool, id: HashlistId) -> Result<Hashlist> {
    let row: HashlistRow = sqlx::query_as("SELECT * FROM hashlists WHERE id = ?")
        .bind(id.as_u64() as i64)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found(format!("hashlist {id}")))?;
    row.try_into()
}

pub async fn set_status(pool: &DbPool, id: HashlistId, status: HashlistStatus) -> Result<()> {
    sqlx::query("UPDATE hashlists SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id.as_u64() as i64)
        .execute(pool)
        .await?;
    Ok(())
}

/// Apply a batch of cracked hashes transactionally (`task_cracked`, §4.4).
/// Duplicate cracks (hash already has a plaintext) are silently ignored, so
/// replaying the same message twice is idempotent and `cracked_count` is
/// never double-counted.
pub async fn apply_cracks(
    pool: &DbPool,
    hashlist_id: HashlistId,
    cracks: &[(i64, String)],
    now: DateTime<Utc>,
) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut newly_cracked = 0u64;

    for (index, plaintext) in cracks {
        let result = sqlx::query(
            r#"UPDATE hashes SET cracked_plaintext = ?, cracked_at = ?
               WHERE hashlist_id = ? AND idx = ? AND cracked_plaintext IS NULL"#,
        )
        .bind(plaintext)
        .bind(now)
        .bind(hashlist_id.as_u64() as i64)
        .bind(index)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            newly_cracked += 1;
        }
    }

    if newly_cracked > 0 {
        sqlx::query("UPDATE hashlists SET cracked_count = cracked_count + ? WHERE id = ?")
            .bind(newly_cracked as i64)
            .bind(hashlist_id.as_u64() as i64)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(newly_cracked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    #[tokio::test]
    async fn duplicate_cracks_are_idempotent() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let hashlist_id = create(
            &pool,
            1,
            0,
            &[(0, "abcd".into(), None), (1, "ef01".into(), None)],
            Utc::now(),
        )
        .await
        .unwrap();

        let first = apply_cracks(&pool, hashlist_id, &[(0, "p@ss".into())], Utc::now())
            .await
            .unwrap();
        assert_eq!(first, 1);

        let second = apply_cracks(&pool, hashlist_id, &[(0, "p@ss".into())], Utc::now())
            .await
            .unwrap();
        assert_eq!(second, 0);

        let hashlist = get(&pool, hashlist_id).await.unwrap();
        assert_eq!(hashlist.cracked_count, 1);
    }

    #[tokio::test]
    async fn cracked_raw_hashes_for_client_only_sees_their_own_hashlists() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let mine = create(&pool, 1, 0, &[(0, "abcd".into(), None)], Utc::now()).await.unwrap();
        let theirs = create(&pool, 2, 0, &[(0, "ef01".into(), None)], Utc::now()).await.unwrap();

        apply_cracks(&pool, mine, &[(0, "p@ss".into())], Utc::now()).await.unwrap();
        apply_cracks(&pool, theirs, &[(0, "hunter2".into())], Utc::now()).await.unwrap();

        let pairs = cracked_pairs(&pool, mine, &[0]).await.unwrap();
        assert_eq!(pairs, vec![("abcd".to_string(), "p@ss".to_string())]);

        let mine_raw = cracked_raw_hashes_for_client(&pool, 1).await.unwrap();
        assert_eq!(mine_raw, vec!["abcd".to_string()]);
    }
}
