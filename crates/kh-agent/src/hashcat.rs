//! hashcat subprocess supervision (§4.2, §4.4): the compute binary itself
//! is an external collaborator (Non-goal — "the hashcat binary itself...
//! invoked as a subprocess producing a documented status-JSON stream");
//! this module only spawns it, feeds it the assigned keyspace range, and
//! translates its status stream into the events the agent forwards as
//! `task_progress`/`task_cracked`/`task_completed`/`task_failed` frames.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use kh_ids::TaskId;
use kh_protocol::{CrackedHash, TaskFailureReason};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::cancel::CancellationToken;

#[derive(Debug, Error)]
pub enum HashcatError {
    #[error("failed to spawn hashcat: {0}")]
    Spawn(std::io::Error),
    #[error("hashcat exited with status {0}")]
    NonZeroExit(std::process::ExitStatus),
}

/// One line of hashcat's `--status-json` stream, restricted to the fields
/// this agent consumes (the full schema carries many more).
#[derive(Debug, Deserialize)]
struct StatusLine {
    progress: Option<[u64; 2]>,
    recovered: Option<Vec<RecoveredHash>>,
    #[serde(default)]
    completed: bool,
}

#[derive(Debug, Deserialize)]
struct RecoveredHash {
    index: i64,
    plaintext: String,
}

#[derive(Debug)]
pub enum TaskEvent {
    Progress { processed: u64, rate_hashes_per_sec: u64 },
    Cracked(Vec<CrackedHash>),
    Completed { keyspace_processed: u64 },
    Failed { reason: TaskFailureReason, detail: Option<String> },
}

pub struct HashcatJob {
    task_id: TaskId,
    child: Child,
    cancel: CancellationToken,
}

/// Build the argument list for one assigned task: session id, mode,
/// restore offset, and the `--status-json` flags needed to drive the
/// progress stream the rest of this module parses.
pub fn build_args(
    hash_type_id: i64,
    keyspace_start: u64,
    keyspace_end: u64,
    hashlist_path: &PathBuf,
    wordlist_or_mask_args: &[String],
) -> Vec<String> {
    let mut args = vec![
        "--status".to_string(),
        "--status-json".to_string(),
        "--status-timer=1".to_string(),
        "-m".to_string(),
        hash_type_id.to_string(),
        "--skip".to_string(),
        keyspace_start.to_string(),
        "--limit".to_string(),
        keyspace_end.to_string(),
        hashlist_path.display().to_string(),
    ];
    args.extend(wordlist_or_mask_args.iter().cloned());
    args
}

impl HashcatJob {
    pub fn spawn(
        hashcat_path: &PathBuf,
        task_id: TaskId,
        args: &[String],
    ) -> Result<(Self, mpsc::UnboundedReceiver<TaskEvent>), HashcatError> {
        let mut child = Command::new(hashcat_path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(HashcatError::Spawn)?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let (tx, rx) = mpsc::unbounded_channel();
        let task_id_for_reader = task_id;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut processed_total = 0u64;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_status_line(&line, &mut processed_total) {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(task_id = %task_id_for_reader, error = %e, "hashcat stdout read error");
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                task_id,
                child,
                cancel: CancellationToken::new(),
            },
            rx,
        ))
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the subprocess within `grace`: request a cooperative stop via
    /// the cancellation token, wait, then kill if it hasn't exited.
    pub async fn cancel(&mut self, grace: Duration) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(grace, self.child.wait()).await;
        let _ = self.child.start_kill();
    }

    pub async fn wait(&mut self) -> Result<(), HashcatError> {
        let status = self.child.wait().await.map_err(HashcatError::Spawn)?;
        if !status.success() && !self.cancel.is_cancelled() {
            return Err(HashcatError::NonZeroExit(status));
        }
        Ok(())
    }
}

fn parse_status_line(line: &str, processed_total: &mut u64) -> Option<TaskEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let status: StatusLine = match serde_json::from_str(trimmed) {
        Ok(s) => s,
        Err(_) => return None,
    };

    if let Some(hashes) = status.recovered.filter(|h| !h.is_empty()) {
        return Some(TaskEvent::Cracked(
            hashes
                .into_iter()
                .map(|h| CrackedHash { index: h.index, plaintext: h.plaintext })
                .collect(),
        ));
    }

    if status.completed {
        return Some(TaskEvent::Completed { keyspace_processed: *processed_total });
    }

    if let Some([done, _total]) = status.progress {
        *processed_total = done;
        return Some(TaskEvent::Progress {
            processed: done,
            rate_hashes_per_sec: 0,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_line_updates_running_total() {
        let mut total = 0u64;
        let event = parse_status_line(r#"{"progress":[500,1000]}"#, &mut total);
        assert_eq!(total, 500);
        assert!(matches!(
            event,
            Some(TaskEvent::Progress { processed: 500, .. })
        ));
    }

    #[test]
    fn recovered_line_yields_cracked_event() {
        let mut total = 0u64;
        let line = r#"{"recovered":[{"index":3,"plaintext":"p@ss"}]}"#;
        match parse_status_line(line, &mut total) {
            Some(TaskEvent::Cracked(hashes)) => {
                assert_eq!(hashes.len(), 1);
                assert_eq!(hashes[0].index, 3);
                assert_eq!(hashes[0].plaintext, "p@ss");
            }
            other => panic!("expected Cracked event, got {other:?}"),
        }
    }

    #[test]
    fn completed_line_reports_last_known_total() {
        let mut total = 42_000u64;
        let event = parse_status_line(r#"{"completed":true}"#, &mut total);
        assert!(matches!(
            event,
            Some(TaskEvent::Completed { keyspace_processed: 42_000 })
        ));
    }

    #[test]
    fn blank_and_unparseable_lines_are_ignored() {
        let mut total = 0u64;
        assert!(parse_status_line("", &mut total).is_none());
        assert!(parse_status_line("not json", &mut total).is_none());
    }

    #[test]
    fn build_args_skips_from_the_given_offset_not_always_zero() {
        let path = PathBuf::from("/tmp/hashlist.txt");
        let args = build_args(0, 40_000, 100_000, &path, &[]);
        let skip_pos = args.iter().position(|a| a == "--skip").unwrap();
        let limit_pos = args.iter().position(|a| a == "--limit").unwrap();
        assert_eq!(args[skip_pos + 1], "40000");
        assert_eq!(args[limit_pos + 1], "100000");
    }
}
