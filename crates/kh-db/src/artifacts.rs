//! Artifact metadata index (§3, §4.6).
//!
//! The bytes themselves live in `kh-store`'s content-addressed file store;
//! this table is the queryable index of what digests are known, under
//! what logical name, and of what kind — used to resolve a job's
//! wordlist/rule references to digests the scheduler can check agents
//! against.

use chrono::{DateTime, Utc};
use kh_ids::ArtifactDigest;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{DbError, Result};
use crate::pool::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Binary,
    Wordlist,
    Rule,
    Hashlist,
}

impl ArtifactKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Wordlist => "wordlist",
            Self::Rule => "rule",
            Self::Hashlist => "hashlist",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "binary" => Self::Binary,
            "wordlist" => Self::Wordlist,
            "rule" => Self::Rule,
            "hashlist" => Self::Hashlist,
            other => return Err(DbError::invalid_input(format!("unknown artifact kind: {other}"))),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct ArtifactRow {
    digest: String,
    name: String,
    size: i64,
    kind: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub digest: ArtifactDigest,
    pub name: String,
    pub size: i64,
    pub kind: ArtifactKind,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ArtifactRow> for Artifact {
    type Error = DbError;

    fn try_from(row: ArtifactRow) -> Result<Self> {
        Ok(Self {
            digest: ArtifactDigest::from_hex(row.digest)
                .map_err(|e| DbError::invalid_input(e.to_string()))?,
            name: row.name,
            size: row.size,
            kind: ArtifactKind::parse(&row.kind)?,
            created_at: row.created_at,
        })
    }
}

/// Record an ingested artifact. Artifacts are immutable once ingested
/// (§3), so this is `INSERT OR IGNORE`: re-ingesting identical bytes
/// (same digest) is a no-op rather than an error.
pub async fn record(
    pool: &DbPool,
    digest: &ArtifactDigest,
    name: &str,
    size: i64,
    kind: ArtifactKind,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO artifacts (digest, name, size, kind, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(digest.as_str())
    .bind(name)
    .bind(size)
    .bind(kind.as_str())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &DbPool, digest: &ArtifactDigest) -> Result<Artifact> {
    let row: ArtifactRow = sqlx::query_as("SELECT * FROM artifacts WHERE digest = ?")
        .bind(digest.as_str())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found(format!("artifact {digest}")))?;
    row.try_into()
}

pub async fn exists(pool: &DbPool, digest: &ArtifactDigest) -> Result<bool> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM artifacts WHERE digest = ?")
        .bind(digest.as_str())
        .fetch_one(pool)
        .await?;
    Ok(row.0 > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    #[tokio::test]
    async fn re_ingesting_same_digest_is_a_no_op() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let digest = ArtifactDigest::from_hex("a".repeat(64)).unwrap();

        record(&pool, &digest, "rockyou.txt", 139_921_507, ArtifactKind::Wordlist, Utc::now())
            .await
            .unwrap();
        record(&pool, &digest, "rockyou.txt", 139_921_507, ArtifactKind::Wordlist, Utc::now())
            .await
            .unwrap();

        let artifact = get(&pool, &digest).await.unwrap();
        assert_eq!(artifact.name, "rockyou.txt");
        assert!(exists(&pool, &digest).await.unwrap());
    }
}
