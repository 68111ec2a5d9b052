//! Status aggregator: task rollups for the job view (§6), and the
//! server-local potfile (§4.6, §9 Open Question (b)).
//!
//! The potfile is append-only and server-local; it is never synced to
//! agents (§4.6) and excluded from normal retention sweeps, so the only
//! way lines leave it is the explicit `scrub_potfile_for_client` scrub
//! (§9): a real deletion request for one client's data, not a cleanup job.

use std::path::{Path, PathBuf};

use kh_db::tasks::TaskState;
use kh_db::DbPool;
use kh_ids::JobId;
use kh_protocol::TaskRollup;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::error::Result;

/// Roll every task belonging to `job_id` up into the counts the `GET
/// /api/jobs/{id}` response carries (§6).
pub async fn task_rollup(pool: &DbPool, job_id: JobId) -> Result<TaskRollup> {
    let tasks = kh_db::tasks::list_for_job(pool, job_id).await?;
    let mut rollup = TaskRollup::default();
    rollup.total = tasks.len() as u64;

    for task in &tasks {
        match task.state {
            TaskState::Pending => rollup.pending += 1,
            TaskState::Assigned => rollup.assigned += 1,
            TaskState::Running => rollup.running += 1,
            TaskState::Done => rollup.done += 1,
            TaskState::Failed => rollup.failed += 1,
            TaskState::Abandoned => rollup.abandoned += 1,
        }
        rollup.keyspace_total += (task.keyspace_end - task.keyspace_start) as u64;
        rollup.keyspace_processed += task.keyspace_processed as u64;
    }

    Ok(rollup)
}

/// Append-only server potfile: `<data_dir>/potfile`, one `hash:plaintext`
/// line per cracked entry, restricted permissions (§6). Guarded by an
/// exclusive writer lock (§5: "the potfile is append-only with an
/// exclusive writer lock").
pub struct Potfile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Potfile {
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let path = data_dir.as_ref().join("potfile");
        if !fs::try_exists(&path).await.unwrap_or(false) {
            fs::File::create(&path).await.map_err(kh_db::DbError::Io)?;
            #[cfg(unix)]
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(kh_db::DbError::Io)?;
        }
        Ok(Self { path, lock: Mutex::new(()) })
    }

    /// Append `(raw_hash, plaintext)` pairs, one `hash:plaintext` line
    /// each.
    pub async fn append(&self, pairs: &[(String, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(kh_db::DbError::Io)?;
        for (raw, plaintext) in pairs {
            file.write_all(format!("{raw}:{plaintext}\n").as_bytes())
                .await
                .map_err(kh_db::DbError::Io)?;
        }
        file.sync_all().await.map_err(kh_db::DbError::Io)?;
        Ok(())
    }

    /// Rewrite the potfile excluding every line whose hash belongs to a
    /// hashlist owned by `client_id` (§9 Open Question (b)). Not run
    /// automatically; invoked on an explicit data-deletion request.
    pub async fn scrub_for_client(&self, pool: &DbPool, client_id: i64) -> Result<u64> {
        let to_remove: std::collections::HashSet<String> =
            kh_db::hashlists::cracked_raw_hashes_for_client(pool, client_id)
                .await?
                .into_iter()
                .collect();

        let _guard = self.lock.lock().await;
        let contents = fs::read_to_string(&self.path).await.map_err(kh_db::DbError::Io)?;

        let mut removed = 0u64;
        let mut kept = String::with_capacity(contents.len());
        for line in contents.lines() {
            let hash = line.split(':').next().unwrap_or(line);
            if to_remove.contains(hash) {
                removed += 1;
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path).await.map_err(kh_db::DbError::Io)?;
            tmp.write_all(kept.as_bytes()).await.map_err(kh_db::DbError::Io)?;
            tmp.sync_all().await.map_err(kh_db::DbError::Io)?;
        }
        fs::rename(&tmp_path, &self.path).await.map_err(kh_db::DbError::Io)?;

        info!(client_id, removed, "scrubbed potfile for client");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_scrub_removes_only_that_clients_lines() {
        let dir = tempfile::tempdir().unwrap();
        let potfile = Potfile::open(dir.path()).await.unwrap();
        potfile
            .append(&[
                ("abcd".to_string(), "p@ss".to_string()),
                ("ef01".to_string(), "hunter2".to_string()),
            ])
            .await
            .unwrap();

        let pool = kh_db::create_pool(kh_db::DbConfig::sqlite_memory()).await.unwrap();
        kh_db::hashlists::create(&pool, 1, 0, &[(0, "abcd".into(), None)], chrono::Utc::now())
            .await
            .unwrap();
        let mine = kh_db::hashlists::create(&pool, 1, 0, &[(0, "abcd".into(), None)], chrono::Utc::now())
            .await
            .unwrap();
        kh_db::hashlists::apply_cracks(&pool, mine, &[(0, "p@ss".into())], chrono::Utc::now())
            .await
            .unwrap();

        let removed = potfile.scrub_for_client(&pool, 1).await.unwrap();
        assert_eq!(removed, 1);

        let contents = tokio::fs::read_to_string(dir.path().join("potfile")).await.unwrap();
        assert!(!contents.contains("abcd:p@ss"));
        assert!(contents.contains("ef01:hunter2"));
    }
}
