//! The control-channel frame envelope (§4.2, §6).
//!
//! Every message crossing the agent↔server WebSocket is exactly one JSON
//! object matching this shape. `payload` is deliberately `serde_json::Value`
//! rather than a generically-typed field — the envelope and the payload
//! schema are validated in two separate steps (header/body split), so an
//! unknown `type` can be rejected before anyone attempts to deserialize a
//! payload shape for it.

use chrono::{DateTime, Utc};
use kh_ids::FrameId;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Every frame type exchanged over the control channel (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Server -> agent
    AssignTask,
    CancelTask,
    FileSyncRequired,
    ForceDisconnect,
    ConfigPush,
    Ack,
    // Agent -> server
    Heartbeat,
    DeviceReport,
    TaskAccepted,
    TaskProgress,
    TaskCracked,
    TaskCompleted,
    TaskFailed,
    BenchmarkResult,
    FileSyncError,
}

impl MessageType {
    /// All message types named by §4.2.
    pub const ALL: &'static [MessageType] = &[
        MessageType::AssignTask,
        MessageType::CancelTask,
        MessageType::FileSyncRequired,
        MessageType::ForceDisconnect,
        MessageType::ConfigPush,
        MessageType::Ack,
        MessageType::Heartbeat,
        MessageType::DeviceReport,
        MessageType::TaskAccepted,
        MessageType::TaskProgress,
        MessageType::TaskCracked,
        MessageType::TaskCompleted,
        MessageType::TaskFailed,
        MessageType::BenchmarkResult,
        MessageType::FileSyncError,
    ];

    /// Critical message types require at-least-once delivery and are
    /// buffered across disconnects (§4.2, §4.7): `job_progress` and
    /// `hashcat_output` correspond to `task_progress`/`benchmark_result`
    /// here, plus `task_cracked`/`task_completed`.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            MessageType::TaskProgress
                | MessageType::TaskCracked
                | MessageType::TaskCompleted
                | MessageType::BenchmarkResult
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssignTask => "assign_task",
            Self::CancelTask => "cancel_task",
            Self::FileSyncRequired => "file_sync_required",
            Self::ForceDisconnect => "force_disconnect",
            Self::ConfigPush => "config_push",
            Self::Ack => "ack",
            Self::Heartbeat => "heartbeat",
            Self::DeviceReport => "device_report",
            Self::TaskAccepted => "task_accepted",
            Self::TaskProgress => "task_progress",
            Self::TaskCracked => "task_cracked",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::BenchmarkResult => "benchmark_result",
            Self::FileSyncError => "file_sync_error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `{id, type, ts, payload, in_reply_to?}` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<FrameId>,
}

impl Frame {
    /// Build a new outbound frame with a fresh id and the current
    /// timestamp. `ts` is supplied by the caller so the function stays
    /// pure and testable (no ambient clock read inside this crate).
    pub fn new(message_type: MessageType, payload: impl Serialize, ts: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            id: FrameId::new(),
            message_type,
            ts,
            payload: serde_json::to_value(payload)?,
            in_reply_to: None,
        })
    }

    pub fn reply_to(mut self, in_reply_to: FrameId) -> Self {
        self.in_reply_to = Some(in_reply_to);
        self
    }

    /// Deserialize the payload as `T`, wrapping any mismatch in a
    /// `ProtocolError::SchemaMismatch` tagged with this frame's message
    /// type (so the caller's log line names what failed to parse).
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|source| ProtocolError::SchemaMismatch {
            message_type: self.message_type.to_string(),
            source,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_json() {
        let frame = Frame::new(
            MessageType::Heartbeat,
            serde_json::json!({"ok": true}),
            Utc::now(),
        )
        .unwrap();
        let raw = frame.to_json().unwrap();
        let parsed = Frame::from_json(&raw).unwrap();
        assert_eq!(parsed.id, frame.id);
        assert_eq!(parsed.message_type, MessageType::Heartbeat);
    }

    #[test]
    fn reply_to_is_omitted_when_absent() {
        let frame = Frame::new(MessageType::Ack, serde_json::json!({}), Utc::now()).unwrap();
        let raw = frame.to_json().unwrap();
        assert!(!raw.contains("in_reply_to"));
    }

    #[test]
    fn only_progress_crack_complete_benchmark_are_critical() {
        for mt in MessageType::ALL {
            let expected = matches!(
                mt,
                MessageType::TaskProgress
                    | MessageType::TaskCracked
                    | MessageType::TaskCompleted
                    | MessageType::BenchmarkResult
            );
            assert_eq!(mt.is_critical(), expected, "{mt}");
        }
    }

    #[test]
    fn unrecognized_message_type_fails_to_deserialize() {
        let raw = r#"{"id":"5f4f4b8e-2a9b-4b1d-9f3e-1b7a2c3d4e5f","type":"not_a_real_type","ts":"2024-01-01T00:00:00Z","payload":{}}"#;
        assert!(Frame::from_json(raw).is_err());
    }

    #[test]
    fn missing_required_field_fails_to_deserialize() {
        let raw = r#"{"type":"heartbeat","ts":"2024-01-01T00:00:00Z","payload":{}}"#;
        assert!(Frame::from_json(raw).is_err());
    }
}
