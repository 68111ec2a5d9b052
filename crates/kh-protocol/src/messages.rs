//! Payload schemas for every control-channel frame type (§4.2).
//!
//! Each struct is the `payload` object carried by the `Frame` whose
//! `message_type` names it. Kept schema-checked (not an ad-hoc map, per
//! §9's design notes) by deserializing through `Frame::parse_payload`.

use chrono::{DateTime, Utc};
use kh_ids::{AgentId, ArtifactDigest, JobId, MessageId, TaskId};
use serde::{Deserialize, Serialize};

use crate::http::DeviceReport;

// ---------------------------------------------------------------------
// Server -> agent
// ---------------------------------------------------------------------

/// `assign_task`: dispatch a keyspace range to an agent (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignTaskPayload {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub keyspace_start: u64,
    pub keyspace_end: u64,
    /// Set when resuming a previously-abandoned task's remaining range
    /// rather than a replan (§8 scenario 3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<u64>,
    pub attack_spec: serde_json::Value,
    pub hash_type_id: i64,
    pub required_artifacts: Vec<ArtifactRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: ArtifactRefKind,
    pub name: String,
    pub digest: ArtifactDigest,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactRefKind {
    Binary,
    Wordlist,
    Rule,
    Hashlist,
}

/// `cancel_task`: stop the agent's subprocess within `cancel_grace` (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskPayload {
    pub task_id: TaskId,
    pub cancel_grace_secs: u64,
}

/// `file_sync_required`: artifacts the agent must fetch before running
/// its assigned task (§4.2, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSyncRequiredPayload {
    pub task_id: TaskId,
    pub artifacts: Vec<ArtifactRef>,
}

/// `force_disconnect`: tear down the channel and re-enroll (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForceDisconnectPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `config_push`: server-pushed runtime configuration (heartbeat interval,
/// timeouts) an agent should adopt without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPushPayload {
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeats: u32,
}

/// `ack`: acknowledges receipt of the frame named by `in_reply_to`, so the
/// message buffer can drop it (§4.2, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AckPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffered_message_id: Option<MessageId>,
}

/// An error surfaced to the peer without tearing down the channel
/// (`InvalidInput`, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub reason: String,
    pub detail: String,
}

// ---------------------------------------------------------------------
// Agent -> server
// ---------------------------------------------------------------------

/// `heartbeat`: best-effort liveness + load signal (§4.1, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub agent_version: String,
    pub idle: bool,
}

/// `device_report`: a full snapshot of the agent's hardware (§3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReportPayload {
    pub devices: Vec<DeviceReport>,
}

/// `task_accepted`: agent confirms it received `assign_task` within
/// `accept_timeout` (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAcceptedPayload {
    pub task_id: TaskId,
}

/// `task_progress{processed, rate, eta}` (§4.4). Critical: buffered across
/// disconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgressPayload {
    pub task_id: TaskId,
    pub processed: u64,
    pub rate_hashes_per_sec: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
}

/// `task_cracked{hashes:[{index, plaintext}]}` (§4.4). Critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCrackedPayload {
    pub task_id: TaskId,
    pub hashes: Vec<CrackedHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrackedHash {
    pub index: i64,
    pub plaintext: String,
}

/// `task_completed` (§4.4). Critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletedPayload {
    pub task_id: TaskId,
    pub keyspace_processed: u64,
}

/// `task_failed{reason}` (§4.2, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailedPayload {
    pub task_id: TaskId,
    pub reason: TaskFailureReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailureReason {
    /// Agent acted on `cancel_task`.
    Cancelled,
    /// Transient failure; eligible for requeue up to `max_attempts` (§4.5).
    Retryable,
    /// Unrecoverable; fails the whole job and cancels siblings (§4.5).
    Fatal,
}

/// `benchmark_result`: the rate the planner uses once a task on this
/// agent/hash-type has actually run (§4.3). Critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResultPayload {
    pub hash_type_id: i64,
    pub device_index: i64,
    pub rate_hashes_per_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSyncErrorPayload {
    pub task_id: TaskId,
    pub digest: ArtifactDigest,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, MessageType};

    #[test]
    fn assign_task_round_trips_through_a_frame() {
        let payload = AssignTaskPayload {
            task_id: TaskId::new(1),
            job_id: JobId::new(1),
            keyspace_start: 0,
            keyspace_end: 1_000_000,
            resume_from: None,
            attack_spec: serde_json::json!({"mode": "straight"}),
            hash_type_id: 0,
            required_artifacts: vec![],
        };
        let frame = Frame::new(MessageType::AssignTask, &payload, Utc::now()).unwrap();
        let parsed: AssignTaskPayload = frame.parse_payload().unwrap();
        assert_eq!(parsed.task_id, payload.task_id);
        assert_eq!(parsed.keyspace_end, 1_000_000);
    }

    #[test]
    fn task_cracked_carries_multiple_hashes() {
        let payload = TaskCrackedPayload {
            task_id: TaskId::new(1),
            hashes: vec![
                CrackedHash { index: 0, plaintext: "hunter2".into() },
                CrackedHash { index: 3, plaintext: "p@ss".into() },
            ],
        };
        let frame = Frame::new(MessageType::TaskCracked, &payload, Utc::now()).unwrap();
        let parsed: TaskCrackedPayload = frame.parse_payload().unwrap();
        assert_eq!(parsed.hashes.len(), 2);
    }
}
